use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use shared::{Item, ItemId, NewItem, Page, PageRequest, Rental, RentalId, RentalWithItem, UserId};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

use super::{InventoryStore, RentalLedger, RentalStore, StoreError, StoreResult, StoreTransaction};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

type OwnedConnection = PooledConnection<'static, AsyncPgConnection>;

/// Postgres-backed store. Row locks are real `FOR UPDATE` locks, so the
/// guarantees hold across every service instance sharing the database.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

/// One open database transaction pinned to a pooled connection.
pub struct PgTransaction {
    conn: OwnedConnection,
    locked_items: HashSet<ItemId>,
    locked_rentals: HashSet<RentalId>,
    open: bool,
}

fn pool_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Pool(e.to_string())
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RentalStore for PgStore {
    async fn begin(&self, lock_timeout: Duration) -> StoreResult<Box<dyn StoreTransaction>> {
        let mut conn = self.pool.get_owned().await.map_err(pool_error)?;

        AnsiTransactionManager::begin_transaction(&mut *conn).await?;

        // lock_timeout = 0 disables the timeout in Postgres.
        let millis = lock_timeout.as_millis().max(1);
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", millis);
        if let Err(e) = diesel::sql_query(statement).execute(&mut *conn).await {
            if let Err(rollback) = AnsiTransactionManager::rollback_transaction(&mut *conn).await {
                warn!("Rollback after failed BEGIN also failed: {}", rollback);
            }
            return Err(e.into());
        }

        Ok(Box::new(PgTransaction {
            conn,
            locked_items: HashSet::new(),
            locked_rentals: HashSet::new(),
            open: true,
        }))
    }

    async fn create_item(&self, item: NewItem) -> StoreResult<Item> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let row = diesel::insert_into(items::table)
            .values(&NewItemRow::from(item))
            .get_result::<ItemRow>(&mut conn)
            .await?;

        Ok(row.into())
    }

    async fn find_item(&self, item_id: ItemId) -> StoreResult<Option<Item>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let row = items::table
            .find(item_id)
            .first::<ItemRow>(&mut conn)
            .await
            .optional()?;

        Ok(row.map(Item::from))
    }

    async fn list_items(&self, page: PageRequest) -> StoreResult<Page<Item>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let total = items::table.count().get_result::<i64>(&mut conn).await?;
        let rows = items::table
            .order(items::id.desc())
            .limit(page.limit())
            .offset(page.offset())
            .load::<ItemRow>(&mut conn)
            .await?;

        Ok(Page::new(rows.into_iter().map(Item::from).collect(), page, total))
    }

    async fn list_rentals(&self, user_id: UserId, page: PageRequest) -> StoreResult<Page<RentalWithItem>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let total = rentals::table
            .filter(rentals::user_id.eq(user_id))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        let rows = rentals::table
            .left_join(items::table)
            .filter(rentals::user_id.eq(user_id))
            .order(rentals::id.desc())
            .limit(page.limit())
            .offset(page.offset())
            .load::<(RentalRow, Option<ItemRow>)>(&mut conn)
            .await?;

        let data = rows
            .into_iter()
            .map(|(rental, item)| RentalWithItem::new(rental.into(), item.map(Item::from)))
            .collect();
        Ok(Page::new(data, page, total))
    }
}

impl PgTransaction {
    fn conn(&mut self) -> StoreResult<&mut AsyncPgConnection> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }
        Ok(&mut *self.conn)
    }
}

#[async_trait]
impl InventoryStore for PgTransaction {
    async fn lock_and_get_item(&mut self, item_id: ItemId) -> StoreResult<Option<Item>> {
        let row = items::table
            .find(item_id)
            .for_update()
            .first::<ItemRow>(self.conn()?)
            .await
            .optional()?;

        if row.is_some() {
            self.locked_items.insert(item_id);
        }
        Ok(row.map(Item::from))
    }

    async fn persist_item(&mut self, item: &Item) -> StoreResult<()> {
        if !self.locked_items.contains(&item.id) {
            return Err(StoreError::NotLocked { table: "items", id: item.id });
        }

        diesel::update(items::table.find(item.id))
            .set(items::stock.eq(item.stock))
            .execute(self.conn()?)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl RentalLedger for PgTransaction {
    async fn lock_and_get_rental(&mut self, rental_id: RentalId) -> StoreResult<Option<Rental>> {
        let row = rentals::table
            .find(rental_id)
            .for_update()
            .first::<RentalRow>(self.conn()?)
            .await
            .optional()?;

        if row.is_some() {
            self.locked_rentals.insert(rental_id);
        }
        Ok(row.map(Rental::from))
    }

    async fn create_rental(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        rented_at: DateTime<Utc>,
    ) -> StoreResult<Rental> {
        let row = diesel::insert_into(rentals::table)
            .values(&NewRentalRow::new(user_id, item_id, rented_at))
            .get_result::<RentalRow>(self.conn()?)
            .await?;

        // Uncommitted inserts are invisible to other transactions.
        self.locked_rentals.insert(row.id);
        Ok(row.into())
    }

    async fn mark_returned(&mut self, rental: &Rental, returned_at: DateTime<Utc>) -> StoreResult<()> {
        if !self.locked_rentals.contains(&rental.id) {
            return Err(StoreError::NotLocked { table: "rentals", id: rental.id });
        }

        diesel::update(rentals::table.find(rental.id))
            .set(rentals::returned_at.eq(Some(returned_at)))
            .execute(self.conn()?)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(&mut self) -> StoreResult<()> {
        let conn = self.conn()?;
        let result = AnsiTransactionManager::commit_transaction(conn).await;
        self.open = false;
        result?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let conn = self.conn()?;
        let result = AnsiTransactionManager::rollback_transaction(conn).await;
        self.open = false;
        result?;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.open {
            // The pool discards connections still inside a transaction.
            warn!("Postgres transaction dropped without commit or rollback");
        }
    }
}
