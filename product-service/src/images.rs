use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backoff;
use crate::error::{Error, Result};
use crate::fanout;
use crate::models::ProductImage;

const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_BASE_DELAY: Duration = Duration::from_secs(1);
const CLEANUP_SCOPE_TIMEOUT: Duration = Duration::from_secs(30);

pub fn extension_from_mime(mime: &str) -> Result<&'static str> {
    match mime {
        "image/jpeg" | "image/jpg" => Ok("jpg"),
        "image/png" => Ok("png"),
        "image/webp" => Ok("webp"),
        other => Err(Error::validation(format!("unsupported media type: {other}"))),
    }
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct S3ImageStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ImageStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub async fn ensure_bucket(&self) -> Result<()> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            return Ok(());
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("created bucket '{}'", self.bucket);
                Ok(())
            }
            Err(SdkError::ServiceError(err))
                if err.err().is_bucket_already_owned_by_you()
                    || err.err().is_bucket_already_exists() =>
            {
                Ok(())
            }
            Err(err) => Err(Error::Upstream(format!(
                "create bucket '{}': {}",
                self.bucket,
                DisplayErrorContext(err)
            ))),
        }
    }
}

#[async_trait]
impl ImageStore for S3ImageStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| {
                Error::Upstream(format!("put object {key}: {}", DisplayErrorContext(err)))
            })?;
        Ok(())
    }

    // deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                Error::Upstream(format!("delete object {key}: {}", DisplayErrorContext(err)))
            })?;
        Ok(())
    }
}

pub struct BlobStaging<S> {
    store: Arc<S>,
    upload_limit: usize,
    // cancelled only when shutdown gives up waiting; request cancellation
    // never reaches in-flight compensation
    terminate: CancellationToken,
    cleanups: TaskTracker,
}

impl<S: ImageStore + 'static> BlobStaging<S> {
    pub fn new(store: Arc<S>, upload_limit: usize) -> Self {
        Self {
            store,
            upload_limit,
            terminate: CancellationToken::new(),
            cleanups: TaskTracker::new(),
        }
    }

    // Uploads every image in parallel and returns the object keys in input
    // order. The first failure cancels the sibling uploads and schedules
    // deletion of whatever already landed, including uploads that completed
    // while cancellation was in flight.
    pub async fn upload_batch(
        &self,
        cancel: &CancellationToken,
        product_name: &str,
        images: &[ProductImage],
    ) -> Result<Vec<String>> {
        let uploaded: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let store = self.store.clone();
        let name = product_name.to_string();
        let sink = uploaded.clone();
        let result = fanout::map_bounded(
            images.to_vec(),
            self.upload_limit,
            cancel,
            move |image, token| {
                let store = store.clone();
                let name = name.clone();
                let sink = sink.clone();
                async move {
                    let ext = extension_from_mime(&image.mime)?;
                    let key = format!("{}/{}-{}.{}", name, image.filename, Uuid::new_v4(), ext);

                    tokio::select! {
                        _ = token.cancelled() => Err(Error::Cancelled),
                        put = store.put(&key, image.bytes.clone(), &image.mime) => match put {
                            Ok(()) => {
                                sink.lock().unwrap().push(key.clone());
                                Ok(key)
                            }
                            Err(Error::Cancelled) => Err(Error::Cancelled),
                            Err(err) => Err(Error::Upstream(format!(
                                "upload {}: {err}",
                                image.filename
                            ))),
                        },
                    }
                }
            },
        )
        .await;

        match result {
            Ok(keys) => Ok(keys),
            Err(err) => {
                let keys = std::mem::take(&mut *uploaded.lock().unwrap());
                if !keys.is_empty() {
                    self.cleanup(keys);
                }
                Err(err)
            }
        }
    }

    // Background deletion of staged keys; non-blocking for the caller.
    pub fn cleanup(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }

        let store = self.store.clone();
        let scope = self.terminate.child_token();
        self.cleanups.spawn(async move {
            info!("cleaning up {} staged object(s)", keys.len());
            tokio::select! {
                _ = scope.cancelled() => warn!("cleanup interrupted by shutdown"),
                _ = tokio::time::sleep(CLEANUP_SCOPE_TIMEOUT) => {
                    warn!("cleanup did not finish within {CLEANUP_SCOPE_TIMEOUT:?}")
                }
                _ = delete_with_retry(store, keys) => {}
            }
        });
    }

    // Drains outstanding deletions; on deadline the stragglers are cancelled
    // so shutdown can proceed.
    pub async fn wait_cleanup(&self, deadline: Duration) -> Result<()> {
        self.cleanups.close();
        if tokio::time::timeout(deadline, self.cleanups.wait()).await.is_err() {
            self.terminate.cancel();
            return Err(Error::Upstream(
                "blob cleanup timed out during shutdown".to_string(),
            ));
        }
        Ok(())
    }
}

async fn delete_with_retry<S: ImageStore>(store: Arc<S>, keys: Vec<String>) {
    for key in keys {
        let mut delay = CLEANUP_BASE_DELAY;
        for attempt in 0..CLEANUP_ATTEMPTS {
            match store.delete(&key).await {
                Ok(()) => break,
                Err(err) => {
                    if attempt + 1 == CLEANUP_ATTEMPTS {
                        warn!("giving up on deleting {key}: {err}");
                        break;
                    }
                    tokio::time::sleep(backoff::jittered(delay, backoff::DEFAULT_JITTER)).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct MockStore {
        fail_on: Option<String>,
        fail_deletes: Mutex<u32>,
        puts: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
    }

    impl MockStore {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                fail_on: fail_on.map(str::to_string),
                fail_deletes: Mutex::new(0),
                puts: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn failing_deletes(failures: u32) -> Self {
            let store = Self::new(None);
            *store.fail_deletes.lock().unwrap() = failures;
            store
        }
    }

    #[async_trait]
    impl ImageStore for MockStore {
        async fn put(&self, key: &str, _bytes: Vec<u8>, _content_type: &str) -> Result<()> {
            if let Some(needle) = &self.fail_on {
                if key.contains(needle.as_str()) {
                    // let sibling uploads land first so the compensation path
                    // has something to clean up
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return Err(Error::Upstream("object store unavailable".to_string()));
                }
            }
            self.puts.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let mut remaining = self.fail_deletes.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Upstream("delete failed".to_string()));
            }
            self.deletes.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn image(filename: &str, mime: &str) -> ProductImage {
        ProductImage {
            bytes: vec![1, 2, 3],
            mime: mime.to_string(),
            size: 3,
            filename: filename.to_string(),
        }
    }

    #[test]
    fn mime_mapping_matches_supported_types() {
        assert_eq!(extension_from_mime("image/jpeg").unwrap(), "jpg");
        assert_eq!(extension_from_mime("image/jpg").unwrap(), "jpg");
        assert_eq!(extension_from_mime("image/png").unwrap(), "png");
        assert_eq!(extension_from_mime("image/webp").unwrap(), "webp");
        assert!(matches!(
            extension_from_mime("application/pdf"),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn upload_batch_returns_keys_in_input_order() {
        let store = Arc::new(MockStore::new(None));
        let staging = BlobStaging::new(store.clone(), 4);
        let cancel = CancellationToken::new();

        let keys = staging
            .upload_batch(
                &cancel,
                "widget-a",
                &[image("front", "image/png"), image("back", "image/jpeg")],
            )
            .await
            .unwrap();

        assert_eq!(keys.len(), 2);
        assert!(keys[0].starts_with("widget-a/front-"));
        assert!(keys[0].ends_with(".png"));
        assert!(keys[1].starts_with("widget-a/back-"));
        assert!(keys[1].ends_with(".jpg"));

        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_compensates_uploaded_keys() {
        let store = Arc::new(MockStore::new(Some("broken")));
        let staging = BlobStaging::new(store.clone(), 2);
        let cancel = CancellationToken::new();

        let result = staging
            .upload_batch(
                &cancel,
                "widget-a",
                &[image("good", "image/png"), image("broken", "image/png")],
            )
            .await;
        assert!(matches!(result, Err(Error::Upstream(_))));

        staging.wait_cleanup(Duration::from_secs(5)).await.unwrap();

        let puts = store.puts.lock().unwrap().clone();
        let deletes = store.deletes.lock().unwrap().clone();
        assert_eq!(puts.len(), 1);
        assert_eq!(deletes, puts);
    }

    #[tokio::test]
    async fn unsupported_mime_fails_validation_and_compensates() {
        let store = Arc::new(MockStore::new(None));
        let staging = BlobStaging::new(store.clone(), 1);
        let cancel = CancellationToken::new();

        let result = staging
            .upload_batch(
                &cancel,
                "widget-a",
                &[image("good", "image/png"), image("weird", "image/gif")],
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        // whatever landed before the failure must be scheduled for deletion
        staging.wait_cleanup(Duration::from_secs(5)).await.unwrap();
        let deletes = store.deletes.lock().unwrap().clone();
        let puts = store.puts.lock().unwrap().clone();
        assert_eq!(deletes, puts);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_retries_with_backoff() {
        let store = Arc::new(MockStore::failing_deletes(2));
        let staging = BlobStaging::new(store.clone(), 1);

        staging.cleanup(vec!["widget-a/x.png".to_string()]);
        staging.wait_cleanup(Duration::from_secs(60)).await.unwrap();

        // two failed attempts, then the third lands
        assert_eq!(
            store.deletes.lock().unwrap().clone(),
            vec!["widget-a/x.png".to_string()]
        );
    }

    #[tokio::test]
    async fn cleanup_with_no_keys_is_a_no_op() {
        let store = Arc::new(MockStore::new(None));
        let staging = BlobStaging::new(store.clone(), 1);

        staging.cleanup(Vec::new());
        staging.wait_cleanup(Duration::from_millis(100)).await.unwrap();
        assert!(store.deletes.lock().unwrap().is_empty());
    }
}
