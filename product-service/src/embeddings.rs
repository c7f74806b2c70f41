use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointStruct, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use tracing::info;

use shared::Embedding;

use crate::error::{Error, Result};

pub struct EmbeddingRepo {
    client: Qdrant,
    collection: String,
}

impl EmbeddingRepo {
    pub fn new(client: Qdrant, collection: String) -> Self {
        Self { client, collection }
    }

    pub async fn ensure_collection(&self, vector_size: u64) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|err| Error::Upstream(format!("qdrant: {err}")))?;
        if exists {
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine)),
            )
            .await
            .map_err(|err| {
                Error::Upstream(format!("create collection '{}': {err}", self.collection))
            })?;
        info!(
            "created qdrant collection '{}' ({vector_size}-dimensional, cosine)",
            self.collection
        );

        Ok(())
    }

    pub async fn upsert(&self, embeddings: &[Embedding]) -> Result<()> {
        let points = embeddings
            .iter()
            .map(|embedding| {
                let payload: Payload = json!({
                    "product_id": embedding.payload.product_id,
                    "image_path": embedding.payload.image_path,
                    "created_at": embedding.payload.created_at,
                    "model_version": embedding.payload.model_version,
                })
                .try_into()
                .map_err(|err| Error::contract(format!("embedding payload: {err}")))?;

                Ok(PointStruct::new(
                    embedding.id.to_string(),
                    embedding.vector.clone(),
                    payload,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points))
            .await
            .map_err(|err| Error::Upstream(format!("upsert points: {err}")))?;

        Ok(())
    }
}
