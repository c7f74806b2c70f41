use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use diesel_async::RunQueryDsl;

use crate::error::{Error, Result};
use crate::models::{Category, NewCategory, Product, ProductInfo, ProductUpsertRow};
use crate::schema::{categories, products};
use crate::scope::{DbPool, TxScope};

// Insert wins the race or loses to an existing row; either way the caller
// gets the surviving row back, and `no_changes` reports whether the conflict
// arm had anything to update.
const PRODUCT_UPSERT_SQL: &str = r#"
WITH upsert AS (
    INSERT INTO products (name, price, category_id)
    VALUES ($1, $2, $3)
    ON CONFLICT (name)
    DO UPDATE SET
        price = EXCLUDED.price,
        category_id = EXCLUDED.category_id,
        updated_at = NOW()
    WHERE
        products.price IS DISTINCT FROM EXCLUDED.price OR
        products.category_id IS DISTINCT FROM EXCLUDED.category_id
    RETURNING id, name, price, category_id, created_at, updated_at, is_archived
)
SELECT id, name, price, category_id, created_at, updated_at, is_archived,
       false AS no_changes
FROM upsert

UNION ALL

SELECT id, name, price, category_id, created_at, updated_at, is_archived,
       true AS no_changes
FROM products
WHERE name = $1
  AND NOT EXISTS (SELECT 1 FROM upsert)
"#;

pub struct CategoryRepo;

impl CategoryRepo {
    pub async fn create(&self, scope: &TxScope, name: &str) -> Result<Category> {
        let mut conn = scope.conn().await?;

        let inserted = diesel::insert_into(categories::table)
            .values(NewCategory {
                name: name.to_string(),
            })
            .on_conflict(categories::name)
            .do_nothing()
            .get_result::<Category>(&mut *conn)
            .await
            .optional()?;

        match inserted {
            Some(category) => Ok(category),
            // conflict: hand back the existing row unchanged
            None => Ok(categories::table
                .filter(categories::name.eq(name))
                .first::<Category>(&mut *conn)
                .await?),
        }
    }
}

pub struct ProductRepo {
    pool: DbPool,
}

impl ProductRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        scope: &TxScope,
        name: &str,
        price: i64,
        category_id: i64,
    ) -> Result<(Product, bool)> {
        let mut conn = scope.conn().await?;

        let row = diesel::sql_query(PRODUCT_UPSERT_SQL)
            .bind::<Text, _>(name)
            .bind::<BigInt, _>(price)
            .bind::<BigInt, _>(category_id)
            .get_result::<ProductUpsertRow>(&mut *conn)
            .await?;

        let no_changes = row.no_changes;
        Ok((row.into(), no_changes))
    }

    pub async fn get_products_info(&self, ids: &[i64]) -> Result<Vec<ProductInfo>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| Error::Upstream(format!("connection pool: {err}")))?;

        let rows = products::table
            .inner_join(categories::table)
            .filter(products::id.eq_any(ids.to_vec()))
            .select((
                products::id,
                products::name,
                products::price,
                categories::name,
            ))
            .load::<(i64, String, i64, String)>(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, price, category_name)| ProductInfo {
                id,
                name,
                category_name,
                price,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::TRANSACTION_MISSING;

    #[tokio::test]
    async fn category_create_requires_a_transaction() {
        let scope = TxScope::detached();
        match CategoryRepo.create(&scope, "toys").await {
            Err(Error::Contract(msg)) => assert_eq!(msg, TRANSACTION_MISSING),
            other => panic!("expected a missing-transaction error, got {:?}", other.map(|_| ())),
        }
    }
}
