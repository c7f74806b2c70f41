use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::ProductInfo;

pub struct CacheRepo {
    conn: ConnectionManager,
    product_ttl: Duration,
}

impl CacheRepo {
    pub fn new(conn: ConnectionManager, product_ttl: Duration) -> Self {
        Self { conn, product_ttl }
    }

    // Returns whatever is cached; misses and undecodable entries are skipped.
    pub async fn get_products(&self, ids: &[i64]) -> Result<HashMap<i64, ProductInfo>> {
        let keys = product_keys(ids);
        let mut conn = self.conn.clone();

        let values: Vec<Option<String>> = conn
            .mget(&keys)
            .await
            .map_err(|err| Error::Upstream(format!("redis mget: {err}")))?;

        let mut result = HashMap::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values) {
            let Some(raw) = value else { continue };
            match serde_json::from_str::<ProductInfo>(&raw) {
                Ok(info) if info.id == *id => {
                    result.insert(*id, info);
                }
                Ok(info) => warn!("cache id mismatch: key {id}, cached {}", info.id),
                Err(err) => warn!("cache decode failed for product {id}: {err}"),
            }
        }

        Ok(result)
    }

    pub async fn set_products(&self, products: &[ProductInfo]) -> Result<()> {
        let mut pipe = redis::pipe();
        for product in products {
            match serde_json::to_string(product) {
                Ok(data) => {
                    pipe.set_ex(product_key(product.id), data, self.product_ttl.as_secs());
                }
                Err(err) => warn!("cache encode failed for product {}: {err}", product.id),
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| Error::Upstream(format!("redis pipeline: {err}")))?;

        Ok(())
    }

    pub async fn delete_products(&self, ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(product_keys(ids))
            .await
            .map_err(|err| Error::Upstream(format!("redis del: {err}")))?;
        Ok(())
    }
}

fn product_key(id: i64) -> String {
    format!("product:{id}")
}

fn product_keys(ids: &[i64]) -> Vec<String> {
    ids.iter().map(|id| product_key(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_are_stable() {
        assert_eq!(product_key(42), "product:42");
        assert_eq!(
            product_keys(&[1, 2]),
            vec!["product:1".to_string(), "product:2".to_string()]
        );
    }
}
