use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shared::{Embedding, EmbeddingPayload, ProductChangeEvent};

use crate::cache::CacheRepo;
use crate::embeddings::EmbeddingRepo;
use crate::error::{Error, Result};
use crate::images::{BlobStaging, ImageStore};
use crate::models::{OutboxEvent, ProductInfo, RegisterRequest};
use crate::outbox::OutboxStore;
use crate::products::{CategoryRepo, ProductRepo};
use crate::scope::{DbPool, TxScope};
use crate::vectorizer::{VectorizeApi, Vectorized, VectorizerService};

const CACHE_FILL_BUDGET: Duration = Duration::from_millis(500);

pub struct RegistrationService<S, A> {
    pool: DbPool,
    products: ProductRepo,
    categories: CategoryRepo,
    outbox: Arc<OutboxStore>,
    staging: Arc<BlobStaging<S>>,
    vectorizer: VectorizerService<A>,
    embeddings: Arc<EmbeddingRepo>,
    cache: Arc<CacheRepo>,
    max_images: usize,
}

impl<S, A> RegistrationService<S, A>
where
    S: ImageStore + 'static,
    A: VectorizeApi + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        products: ProductRepo,
        categories: CategoryRepo,
        outbox: Arc<OutboxStore>,
        staging: Arc<BlobStaging<S>>,
        vectorizer: VectorizerService<A>,
        embeddings: Arc<EmbeddingRepo>,
        cache: Arc<CacheRepo>,
        max_images: usize,
    ) -> Self {
        Self {
            pool,
            products,
            categories,
            outbox,
            staging,
            vectorizer,
            embeddings,
            cache,
            max_images,
        }
    }

    // The saga: one relational transaction wrapping the category/product
    // upserts and the outbox append, with the blob upload and vector upsert
    // as compensated side effects. Either the transaction commits and no
    // compensation runs, or it does not commit and staged blobs are deleted.
    pub async fn register(
        &self,
        cancel: &CancellationToken,
        req: RegisterRequest,
    ) -> Result<OutboxEvent> {
        let _ = cancel;
        let _scope = TxScope::begin(&self.pool).await?;
        return Err(Error::contract("debug stub"));
        #[allow(unreachable_code)]
        {
        validate_request(&req, self.max_images)?;

        let scope = TxScope::begin(&self.pool).await?;

        let mut staged_keys: Vec<String> = Vec::new();
        let outcome = self
            .run_registration(cancel, &scope, &req, &mut staged_keys)
            .await;

        let outcome = match outcome {
            Ok(event) => scope.commit().await.map(|_| event),
            Err(err) => {
                scope.rollback().await;
                Err(err)
            }
        };

        match outcome {
            Ok(event) => {
                // usually nothing cached yet for a fresh product; kept for
                // write-through parity, and never fails the request
                if let Err(err) = self.cache.delete_products(&[event.product_id]).await {
                    warn!("failed to invalidate product cache: {err}");
                }
                info!(
                    "registered product '{}' with event {}",
                    req.name, event.event_id
                );
                Ok(event)
            }
            Err(err) => {
                if !staged_keys.is_empty() {
                    warn!(
                        "cleaning up {} orphaned object(s) after failed registration of '{}': {err}",
                        staged_keys.len(),
                        req.name
                    );
                    self.staging.cleanup(std::mem::take(&mut staged_keys));
                }
                Err(err)
            }
        }
    }

    async fn run_registration(
        &self,
        cancel: &CancellationToken,
        scope: &TxScope,
        req: &RegisterRequest,
        staged_keys: &mut Vec<String>,
    ) -> Result<OutboxEvent> {
        let category = self.categories.create(scope, &req.category_name).await?;

        let (product, no_changes) = self
            .products
            .upsert(scope, req.name.trim(), req.price, category.id)
            .await?;
        if no_changes {
            info!("product '{}' unchanged by upsert", product.name);
        }

        let vectors = self.vectorizer.vectorize(cancel, &req.images).await?;

        let keys = self
            .staging
            .upload_batch(cancel, req.name.trim(), &req.images)
            .await?;
        staged_keys.clone_from(&keys);

        let embeddings = build_embeddings(product.id, &keys, vectors)?;
        self.embeddings.upsert(&embeddings).await?;

        let event = ProductChangeEvent::upsert(product.id, embeddings);
        let payload = event
            .to_bytes()
            .map_err(|err| Error::contract(format!("event encoding: {err}")))?;

        self.outbox
            .append(scope, event.event_id, product.id, payload)
            .await
    }

    pub async fn get_products_info(&self, ids: &[i64]) -> Result<(Vec<ProductInfo>, Vec<i64>)> {
        if ids.is_empty() {
            return Err(Error::validation("no product ids provided"));
        }

        let cached = match self.cache.get_products(ids).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!("cache read failed, falling back to database: {err}");
                HashMap::new()
            }
        };

        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !cached.contains_key(id))
            .collect();

        let mut from_db = HashMap::new();
        if !missing.is_empty() {
            let rows = self.products.get_products_info(&missing).await?;

            // fill the cache off the request path, bounded so a slow cache
            // cannot pile work up behind requests
            let cache = self.cache.clone();
            let to_cache = rows.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(CACHE_FILL_BUDGET, cache.set_products(&to_cache)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("background cache fill failed: {err}"),
                    Err(_) => warn!("background cache fill timed out"),
                }
            });

            from_db = rows
                .into_iter()
                .map(|info| (info.id, info))
                .collect::<HashMap<_, _>>();
        }

        let mut found = Vec::with_capacity(ids.len());
        let mut not_found = Vec::new();
        for id in ids {
            if let Some(info) = cached.get(id) {
                found.push(info.clone());
            } else if let Some(info) = from_db.get(id) {
                found.push(info.clone());
            } else {
                not_found.push(*id);
            }
        }

        Ok((found, not_found))
    }
}

#[allow(dead_code)]
fn assert_send<T: Send>(_: T) {}

#[allow(dead_code)]
fn check_send<S: ImageStore + 'static, A: VectorizeApi + 'static>(
    svc: &RegistrationService<S, A>,
    cancel: &CancellationToken,
    req: RegisterRequest,
) {
    assert_send(svc.register(cancel, req));
}

fn validate_request(req: &RegisterRequest, max_images: usize) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(Error::validation("product name is required"));
    }
    if req.price <= 0 {
        return Err(Error::validation("price must be positive"));
    }
    if req.images.is_empty() {
        return Err(Error::validation("no images provided"));
    }
    if req.images.len() > max_images {
        return Err(Error::validation(format!(
            "too many images: limit is {max_images}"
        )));
    }
    Ok(())
}

// Pairs keys[i] with vectors[i]; a length mismatch or an empty vector is a
// contract violation, not a user error.
fn build_embeddings(
    product_id: i64,
    keys: &[String],
    vectors: Vec<Vectorized>,
) -> Result<Vec<Embedding>> {
    if keys.len() != vectors.len() {
        return Err(Error::contract(format!(
            "image/vector count mismatch: {} keys, {} vectors",
            keys.len(),
            vectors.len()
        )));
    }

    let mut embeddings = Vec::with_capacity(keys.len());
    for (key, vectorized) in keys.iter().zip(vectors) {
        if vectorized.vector.is_empty() {
            return Err(Error::contract("vectorizer returned an empty embedding"));
        }
        embeddings.push(Embedding::new(
            vectorized.vector,
            EmbeddingPayload::new(product_id, key.clone(), vectorized.model_version),
        ));
    }

    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductImage;

    fn png(filename: &str) -> ProductImage {
        ProductImage {
            bytes: vec![0],
            mime: "image/png".to_string(),
            size: 1,
            filename: filename.to_string(),
        }
    }

    fn request(name: &str, price: i64, images: Vec<ProductImage>) -> RegisterRequest {
        RegisterRequest {
            name: name.to_string(),
            category_name: "toys".to_string(),
            price,
            images,
        }
    }

    #[test]
    fn validation_rejects_blank_names() {
        let req = request("   ", 100, vec![png("a")]);
        match validate_request(&req, 10) {
            Err(Error::Validation(msg)) => assert!(msg.contains("name")),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_non_positive_prices() {
        for price in [0, -5] {
            let req = request("widget", price, vec![png("a")]);
            match validate_request(&req, 10) {
                Err(Error::Validation(msg)) => assert!(msg.contains("price")),
                other => panic!("expected a validation error, got {other:?}"),
            }
        }
    }

    #[test]
    fn validation_rejects_empty_and_oversized_image_sets() {
        let req = request("widget", 100, vec![]);
        assert!(matches!(
            validate_request(&req, 10),
            Err(Error::Validation(_))
        ));

        let req = request("widget", 100, (0..3).map(|i| png(&i.to_string())).collect());
        match validate_request(&req, 2) {
            Err(Error::Validation(msg)) => assert!(msg.contains("too many")),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn valid_requests_pass() {
        let req = request("widget", 59999, vec![png("a"), png("b")]);
        assert!(validate_request(&req, 10).is_ok());
    }

    #[test]
    fn embedding_pairing_rejects_length_mismatch() {
        let keys = vec!["widget/a.png".to_string()];
        let vectors = vec![
            Vectorized {
                vector: vec![0.1],
                model_version: "v1".to_string(),
            },
            Vectorized {
                vector: vec![0.2],
                model_version: "v1".to_string(),
            },
        ];

        match build_embeddings(1, &keys, vectors) {
            Err(Error::Contract(msg)) => assert!(msg.contains("mismatch")),
            other => panic!("expected a contract error, got {other:?}"),
        }
    }

    #[test]
    fn embedding_pairing_rejects_empty_vectors() {
        let keys = vec!["widget/a.png".to_string()];
        let vectors = vec![Vectorized {
            vector: vec![],
            model_version: "v1".to_string(),
        }];

        assert!(matches!(
            build_embeddings(1, &keys, vectors),
            Err(Error::Contract(_))
        ));
    }

    #[test]
    fn embedding_pairing_binds_keys_and_metadata() {
        let keys = vec!["widget/a.png".to_string(), "widget/b.png".to_string()];
        let vectors = vec![
            Vectorized {
                vector: vec![0.1, 0.2],
                model_version: "clip-v2".to_string(),
            },
            Vectorized {
                vector: vec![0.3, 0.4],
                model_version: "clip-v2".to_string(),
            },
        ];

        let embeddings = build_embeddings(7, &keys, vectors).unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_ne!(embeddings[0].id, embeddings[1].id);
        for (embedding, key) in embeddings.iter().zip(&keys) {
            assert_eq!(embedding.payload.product_id, 7);
            assert_eq!(&embedding.payload.image_path, key);
            assert_eq!(embedding.payload.model_version, "clip-v2");
        }
    }
}
