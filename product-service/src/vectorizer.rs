use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::warn;

use crate::backoff;
use crate::error::{Error, Result};
use crate::fanout;
use crate::models::ProductImage;

// Wire types for the vectorizer RPC, kept in sync with the service's proto
// definition by hand since the schema is a single unary call.
pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VectorizeRequest {
        #[prost(bytes = "vec", tag = "1")]
        pub image_data: ::prost::alloc::vec::Vec<u8>,
        #[prost(enumeration = "ImageType", tag = "2")]
        pub image_type: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VectorizeResponse {
        #[prost(float, repeated, tag = "1")]
        pub vector: ::prost::alloc::vec::Vec<f32>,
        #[prost(string, tag = "2")]
        pub model_version: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ImageType {
        Unknown = 0,
        Jpeg = 1,
        Png = 2,
        Webp = 3,
    }
}

pub fn image_type_from_mime(mime: &str) -> pb::ImageType {
    match mime {
        "image/jpeg" | "image/jpg" => pb::ImageType::Jpeg,
        "image/png" => pb::ImageType::Png,
        "image/webp" => pb::ImageType::Webp,
        _ => pb::ImageType::Unknown,
    }
}

#[async_trait]
pub trait VectorizeApi: Send + Sync {
    async fn vectorize_image(&self, request: pb::VectorizeRequest) -> Result<pb::VectorizeResponse>;
}

#[derive(Clone)]
pub struct GrpcVectorizer {
    channel: Channel,
}

impl GrpcVectorizer {
    pub fn connect(addr: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|err| Error::Upstream(format!("vectorizer endpoint: {err}")))?;
        Ok(Self {
            channel: endpoint.connect_lazy(),
        })
    }
}

#[async_trait]
impl VectorizeApi for GrpcVectorizer {
    async fn vectorize_image(&self, request: pb::VectorizeRequest) -> Result<pb::VectorizeResponse> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|err| Error::Upstream(format!("vectorizer unavailable: {err}")))?;

        let codec: tonic::codec::ProstCodec<pb::VectorizeRequest, pb::VectorizeResponse> =
            tonic::codec::ProstCodec::default();
        let path =
            tonic::codegen::http::uri::PathAndQuery::from_static("/vectorizer.Vectorizer/Vectorize");

        let response = grpc.unary(tonic::Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct Vectorized {
    pub vector: Vec<f32>,
    pub model_version: String,
}

// One RPC per image through the bounded executor; a partial failure fails the
// whole attempt, and the whole batch retries with backoff between attempts.
pub struct VectorizerService<A> {
    api: Arc<A>,
    max_concurrent: usize,
    max_retries: u32,
}

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

impl<A: VectorizeApi + 'static> VectorizerService<A> {
    pub fn new(api: Arc<A>, max_concurrent: usize, max_retries: u32) -> Self {
        Self {
            api,
            max_concurrent,
            max_retries: max_retries.max(1),
        }
    }

    pub async fn vectorize(
        &self,
        cancel: &CancellationToken,
        images: &[ProductImage],
    ) -> Result<Vec<Vectorized>> {
        for attempt in 0..self.max_retries {
            match self.vectorize_batch(cancel, images).await {
                Ok(vectors) => {
                    if vectors.is_empty() {
                        return Err(Error::contract("vectorizer returned no vectors"));
                    }
                    return Ok(vectors);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    if attempt + 1 == self.max_retries {
                        return Err(Error::Upstream(format!(
                            "vectorization failed after {} attempts: {err}",
                            self.max_retries
                        )));
                    }
                    let delay = backoff::delay(
                        attempt,
                        RETRY_BASE_DELAY,
                        RETRY_MAX_DELAY,
                        backoff::DEFAULT_JITTER,
                    );
                    warn!(
                        "vectorization attempt {} failed: {err}, retrying in {delay:?}",
                        attempt + 1
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        }

        Err(Error::Upstream("vectorization retries exhausted".to_string()))
    }

    async fn vectorize_batch(
        &self,
        cancel: &CancellationToken,
        images: &[ProductImage],
    ) -> Result<Vec<Vectorized>> {
        let api = self.api.clone();
        fanout::map_bounded(
            images.to_vec(),
            self.max_concurrent,
            cancel,
            move |image, _token| {
                let api = api.clone();
                async move {
                    let request = pb::VectorizeRequest {
                        image_type: image_type_from_mime(&image.mime) as i32,
                        image_data: image.bytes,
                    };
                    let response = api.vectorize_image(request).await?;
                    Ok(Vectorized {
                        vector: response.vector,
                        model_version: response.model_version,
                    })
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    struct FlakyApi {
        calls: AtomicU32,
        failures: u32,
        dimensions: usize,
    }

    impl FlakyApi {
        fn new(failures: u32, dimensions: usize) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                dimensions,
            }
        }
    }

    #[async_trait]
    impl VectorizeApi for FlakyApi {
        async fn vectorize_image(
            &self,
            _request: pb::VectorizeRequest,
        ) -> Result<pb::VectorizeResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::Upstream("connection reset by peer".to_string()));
            }
            Ok(pb::VectorizeResponse {
                vector: vec![0.5; self.dimensions],
                model_version: "clip-v2".to_string(),
            })
        }
    }

    struct OrderedApi {
        vectors: Mutex<Vec<Vec<f32>>>,
    }

    #[async_trait]
    impl VectorizeApi for OrderedApi {
        async fn vectorize_image(
            &self,
            request: pb::VectorizeRequest,
        ) -> Result<pb::VectorizeResponse> {
            // first byte of the image selects the canned vector
            let index = request.image_data[0] as usize;
            let vector = self.vectors.lock().unwrap()[index].clone();
            Ok(pb::VectorizeResponse {
                vector,
                model_version: "clip-v2".to_string(),
            })
        }
    }

    fn image_with_marker(marker: u8) -> ProductImage {
        ProductImage {
            bytes: vec![marker],
            mime: "image/png".to_string(),
            size: 1,
            filename: format!("img-{marker}"),
        }
    }

    #[test]
    fn image_type_mapping_covers_supported_mimes() {
        assert_eq!(image_type_from_mime("image/jpeg"), pb::ImageType::Jpeg);
        assert_eq!(image_type_from_mime("image/jpg"), pb::ImageType::Jpeg);
        assert_eq!(image_type_from_mime("image/png"), pb::ImageType::Png);
        assert_eq!(image_type_from_mime("image/webp"), pb::ImageType::Webp);
        assert_eq!(image_type_from_mime("text/plain"), pb::ImageType::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let api = Arc::new(FlakyApi::new(2, 768));
        let service = VectorizerService::new(api.clone(), 4, 3);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let vectors = service
            .vectorize(&cancel, &[image_with_marker(0)])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].vector.len(), 768);
        // two failed attempts plus the one that landed
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        // backed off at least base + base*2 across the two retries
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_exhausted_after_max_attempts() {
        let api = Arc::new(FlakyApi::new(u32::MAX, 768));
        let service = VectorizerService::new(api.clone(), 4, 3);
        let cancel = CancellationToken::new();

        let result = service.vectorize(&cancel, &[image_with_marker(0)]).await;

        match result {
            Err(Error::Upstream(msg)) => assert!(msg.contains("after 3 attempts")),
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn vectors_match_image_order() {
        let api = Arc::new(OrderedApi {
            vectors: Mutex::new(vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]]),
        });
        let service = VectorizerService::new(api, 2, 1);
        let cancel = CancellationToken::new();

        let images: Vec<ProductImage> = (0..4).map(image_with_marker).collect();
        let vectors = service.vectorize(&cancel, &images).await.unwrap();

        let flattened: Vec<f32> = vectors.iter().map(|v| v.vector[0]).collect();
        assert_eq!(flattened, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let api = Arc::new(FlakyApi::new(u32::MAX, 768));
        let service = VectorizerService::new(api, 1, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = service.vectorize(&cancel, &[image_with_marker(0)]).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
