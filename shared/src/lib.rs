use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductChangeEvent {
    pub event_id: Uuid,
    pub event_timestamp: i64,
    pub operation: ProductOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProductOperation {
    Upsert {
        product_id: i64,
        embeddings: Vec<Embedding>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: EmbeddingPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingPayload {
    pub product_id: i64,
    pub image_path: String,
    pub created_at: i64,
    pub model_version: String,
}

impl ProductChangeEvent {
    pub fn upsert(product_id: i64, embeddings: Vec<Embedding>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            operation: ProductOperation::Upsert {
                product_id,
                embeddings,
            },
        }
    }

    pub fn product_id(&self) -> i64 {
        match &self.operation {
            ProductOperation::Upsert { product_id, .. } => *product_id,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl Embedding {
    pub fn new(vector: Vec<f32>, payload: EmbeddingPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            vector,
            payload,
        }
    }
}

impl EmbeddingPayload {
    pub fn new(product_id: i64, image_path: String, model_version: String) -> Self {
        Self {
            product_id,
            image_path,
            created_at: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            model_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_bytes() {
        let embeddings = vec![
            Embedding::new(
                vec![0.1, 0.2, 0.3],
                EmbeddingPayload::new(7, "widget-a/front.png".to_string(), "v1".to_string()),
            ),
            Embedding::new(
                vec![0.4, 0.5],
                EmbeddingPayload::new(7, "widget-a/back.png".to_string(), "v1".to_string()),
            ),
        ];
        let event = ProductChangeEvent::upsert(7, embeddings.clone());

        let bytes = event.to_bytes().unwrap();
        let decoded = ProductChangeEvent::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.event_id, event.event_id);
        assert_eq!(decoded.event_timestamp, event.event_timestamp);
        assert_eq!(decoded.product_id(), 7);

        let ProductOperation::Upsert {
            embeddings: decoded_embeddings,
            ..
        } = decoded.operation;
        assert_eq!(decoded_embeddings.len(), embeddings.len());
        for (got, want) in decoded_embeddings.iter().zip(&embeddings) {
            assert_eq!(got.id, want.id);
            assert_eq!(got.vector, want.vector);
            assert_eq!(got.payload.image_path, want.payload.image_path);
        }
    }

    #[test]
    fn fresh_events_get_distinct_ids() {
        let a = ProductChangeEvent::upsert(1, vec![]);
        let b = ProductChangeEvent::upsert(1, vec![]);
        assert_ne!(a.event_id, b.event_id);
    }
}
