//! Persistence ports and their backends
//!
//! Services talk to storage only through the traits below. [`memory::MemoryStore`]
//! backs tests and database-less runs; [`postgres::PgStore`] is the production backend.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{CartLine, Order, Product};
use crate::domain::value_objects::{ActorIdentity, Stock};
use crate::domain::variant::CanonicalKey;
use crate::settings::SettingsStore;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Why an order commit was rolled back.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Insufficient stock for product {product_id}: {available} available")]
    InsufficientStock { product_id: Uuid, available: u32 },

    #[error("Product {0} not found")]
    ProductNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for CommitError {
    fn from(e: sqlx::Error) -> Self { Self::Store(e.into()) }
}

/// Units to take out of one product's stock as part of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StockReservation {
    pub product_id: Uuid,
    pub units: u32,
}

/// Stock of a product right after a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StockLevel {
    pub product_id: Uuid,
    pub remaining: Stock,
}

/// Everything one order placement writes. Applied all-or-nothing.
#[derive(Clone, Copy, Debug)]
pub struct OrderCommit<'a> {
    pub order: &'a Order,
    /// At most one entry per product, in ascending product id order.
    pub reservations: &'a [StockReservation],
    pub cart_line_ids: &'a [Uuid],
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn product(&self, id: Uuid) -> Result<Option<Product>, StoreError>;

    async fn save_product(&self, product: &Product) -> Result<(), StoreError>;

    /// Atomic conditional decrement; `false` when the product lacks `units` in stock.
    /// `commit_order` applies the same rule inside its own unit of work; this is the
    /// standalone form for catalog callers outside checkout.
    async fn decrement_stock(&self, id: Uuid, units: u32) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn cart_lines(&self, actor: &ActorIdentity) -> Result<Vec<CartLine>, StoreError>;

    async fn cart_line(&self, id: Uuid) -> Result<Option<CartLine>, StoreError>;

    async fn find_cart_line(&self, actor: &ActorIdentity, product_id: Uuid, key: &CanonicalKey) -> Result<Option<CartLine>, StoreError>;

    /// Inserts or replaces a line and returns it as stored.
    async fn save_cart_line(&self, line: &CartLine) -> Result<CartLine, StoreError>;

    /// Deletes a line the actor owns. `false` when nothing was deleted.
    async fn delete_cart_line(&self, actor: &ActorIdentity, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Writes the order and its lines, decrements stock and deletes the given cart lines
    /// in one unit. Nothing is written when any reservation cannot be met.
    async fn commit_order(&self, commit: OrderCommit<'_>) -> Result<Vec<StockLevel>, CommitError>;

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Persists the status fields of an existing order. Nothing else on an order changes.
    async fn save_order_status(&self, order: &Order) -> Result<(), StoreError>;
}

/// Everything the checkout services need from storage.
pub trait CommerceStore: ProductCatalog + CartRepository + OrderRepository + SettingsStore {}

impl<T> CommerceStore for T where T: ProductCatalog + CartRepository + OrderRepository + SettingsStore {}
