//! Storage primitives used by the rental coordinator.
//!
//! A [`StoreTransaction`] owns the row locks it takes: every
//! `lock_and_get_*` call holds an exclusive lock on that row until
//! [`StoreTransaction::commit`] or [`StoreTransaction::rollback`] runs.
//! Writes are only accepted for rows the transaction has locked (or created).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{DbPool, PgStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{Item, ItemId, NewItem, Page, PageRequest, Rental, RentalId, RentalWithItem, UserId};
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("timed out waiting for lock on {table} row {id}")]
    LockTimeout { table: &'static str, id: i64 },

    #[error("{table} row {id} is not locked by this transaction")]
    NotLocked { table: &'static str, id: i64 },

    #[error("{table} row {id} was deleted while this transaction held writes for it")]
    RowVanished { table: &'static str, id: i64 },

    #[error("transaction already finished")]
    TransactionClosed,
}

#[async_trait]
pub trait InventoryStore: Send {
    /// Locks the item row for the rest of the transaction and returns it.
    async fn lock_and_get_item(&mut self, item_id: ItemId) -> StoreResult<Option<Item>>;

    /// Writes the stock of an item locked by this transaction.
    async fn persist_item(&mut self, item: &Item) -> StoreResult<()>;
}

#[async_trait]
pub trait RentalLedger: Send {
    async fn lock_and_get_rental(&mut self, rental_id: RentalId) -> StoreResult<Option<Rental>>;

    async fn create_rental(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        rented_at: DateTime<Utc>,
    ) -> StoreResult<Rental>;

    /// Persists `returned_at` for a rental locked by this transaction.
    async fn mark_returned(&mut self, rental: &Rental, returned_at: DateTime<Utc>) -> StoreResult<()>;
}

#[async_trait]
pub trait StoreTransaction: InventoryStore + RentalLedger {
    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}

#[async_trait]
pub trait RentalStore: Send + Sync {
    /// Opens a transaction whose lock waits give up after `lock_timeout`.
    async fn begin(&self, lock_timeout: Duration) -> StoreResult<Box<dyn StoreTransaction>>;

    async fn create_item(&self, item: NewItem) -> StoreResult<Item>;

    async fn find_item(&self, item_id: ItemId) -> StoreResult<Option<Item>>;

    async fn list_items(&self, page: PageRequest) -> StoreResult<Page<Item>>;

    /// Unlocked read of a user's rentals, newest first, each joined with its
    /// item when the item still exists.
    async fn list_rentals(&self, user_id: UserId, page: PageRequest) -> StoreResult<Page<RentalWithItem>>;
}
