use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Nullable, Text, Timestamptz};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::categories)]
pub struct NewCategory {
    pub name: String,
}

#[derive(Debug, Clone, Queryable)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: i64,
    pub category_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
}

// Row shape for the raw upsert query; carries the flag telling whether the
// conflict arm left the row untouched.
#[derive(Debug, QueryableByName)]
pub struct ProductUpsertRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = BigInt)]
    pub price: i64,
    #[diesel(sql_type = BigInt)]
    pub category_id: i64,
    #[diesel(sql_type = Timestamptz)]
    pub created_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub updated_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = Bool)]
    pub is_archived: bool,
    #[diesel(sql_type = Bool)]
    pub no_changes: bool,
}

impl From<ProductUpsertRow> for Product {
    fn from(row: ProductUpsertRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            price: row.price,
            category_id: row.category_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            is_archived: row.is_archived,
        }
    }
}

#[derive(Debug, Clone, Queryable, QueryableByName)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_id: Uuid,
    pub product_id: i64,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub product_id: i64,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

pub const PRODUCT_EVENT_TYPE: &str = "product_event";

#[derive(Debug, Clone)]
pub struct ProductImage {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub size: i64,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub name: String,
    pub category_name: String,
    pub price: i64,
    pub images: Vec<ProductImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: i64,
    pub name: String,
    pub category_name: String,
    pub price: i64,
}
