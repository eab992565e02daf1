use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{Item, ItemId, NewItem, Page, PageRequest, Rental, RentalId, RentalWithItem, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::{InventoryStore, RentalLedger, RentalStore, StoreError, StoreResult, StoreTransaction};

/// Single-process store used by tests and local runs.
///
/// Every row has its own async lock that a transaction holds from the
/// first `lock_and_get_*` until it commits or rolls back. Writes are staged
/// inside the transaction and applied in one step on commit, so dropping a
/// transaction discards them. None of this is visible to other processes;
/// deployments sharing a database use [`super::PgStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    items: BTreeMap<ItemId, Row<Item>>,
    rentals: BTreeMap<RentalId, Row<Rental>>,
    next_item_id: i64,
    next_rental_id: i64,
}

struct Row<T> {
    lock: Arc<RowLock<()>>,
    value: T,
}

pub struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    lock_timeout: Duration,
    item_locks: HashMap<ItemId, OwnedMutexGuard<()>>,
    rental_locks: HashMap<RentalId, OwnedMutexGuard<()>>,
    staged_items: HashMap<ItemId, Item>,
    staged_rentals: BTreeMap<RentalId, Rental>,
    open: bool,
}

fn lock_tables(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn acquire(
    lock: Arc<RowLock<()>>,
    timeout: Duration,
    table: &'static str,
    id: i64,
) -> StoreResult<OwnedMutexGuard<()>> {
    tokio::time::timeout(timeout, lock.lock_owned())
        .await
        .map_err(|_| StoreError::LockTimeout { table, id })
}

fn paginate<T>(rows: Vec<T>, page: PageRequest) -> Page<T> {
    let total = rows.len() as i64;
    let data = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect();
    Page::new(data, page, total)
}

impl<T> Row<T> {
    fn new(value: T) -> Self {
        Self {
            lock: Arc::new(RowLock::new(())),
            value,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes an item row outside any transaction, leaving its rentals
    /// behind. Mirrors an administrative delete racing with open loans; a
    /// transaction that already staged a write for the row fails to commit
    /// with [`StoreError::RowVanished`].
    pub fn remove_item(&self, item_id: ItemId) -> Option<Item> {
        lock_tables(&self.tables)
            .items
            .remove(&item_id)
            .map(|row| row.value)
    }

    /// Committed count of open rentals referencing `item_id`.
    pub fn open_rental_count(&self, item_id: ItemId) -> usize {
        lock_tables(&self.tables)
            .rentals
            .values()
            .filter(|row| row.value.item_id == item_id && row.value.is_open())
            .count()
    }
}

#[async_trait]
impl RentalStore for MemoryStore {
    async fn begin(&self, lock_timeout: Duration) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            lock_timeout,
            item_locks: HashMap::new(),
            rental_locks: HashMap::new(),
            staged_items: HashMap::new(),
            staged_rentals: BTreeMap::new(),
            open: true,
        }))
    }

    async fn create_item(&self, item: NewItem) -> StoreResult<Item> {
        let mut tables = lock_tables(&self.tables);
        tables.next_item_id += 1;

        let item = Item {
            id: tables.next_item_id,
            title: item.title.trim().to_string(),
            author: item.author,
            stock: item.stock,
            created_at: Utc::now(),
        };
        tables.items.insert(item.id, Row::new(item.clone()));
        Ok(item)
    }

    async fn find_item(&self, item_id: ItemId) -> StoreResult<Option<Item>> {
        Ok(lock_tables(&self.tables)
            .items
            .get(&item_id)
            .map(|row| row.value.clone()))
    }

    async fn list_items(&self, page: PageRequest) -> StoreResult<Page<Item>> {
        let rows: Vec<Item> = lock_tables(&self.tables)
            .items
            .values()
            .rev()
            .map(|row| row.value.clone())
            .collect();
        Ok(paginate(rows, page))
    }

    async fn list_rentals(&self, user_id: UserId, page: PageRequest) -> StoreResult<Page<RentalWithItem>> {
        let tables = lock_tables(&self.tables);
        let rows: Vec<RentalWithItem> = tables
            .rentals
            .values()
            .rev()
            .filter(|row| row.value.user_id == user_id)
            .map(|row| {
                let item = tables.items.get(&row.value.item_id).map(|item| item.value.clone());
                RentalWithItem::new(row.value.clone(), item)
            })
            .collect();
        Ok(paginate(rows, page))
    }
}

impl MemoryTransaction {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    fn release(&mut self) {
        self.open = false;
        self.staged_items.clear();
        self.staged_rentals.clear();
        self.item_locks.clear();
        self.rental_locks.clear();
    }
}

#[async_trait]
impl InventoryStore for MemoryTransaction {
    async fn lock_and_get_item(&mut self, item_id: ItemId) -> StoreResult<Option<Item>> {
        self.ensure_open()?;
        if let Some(item) = self.staged_items.get(&item_id) {
            return Ok(Some(item.clone()));
        }

        if !self.item_locks.contains_key(&item_id) {
            let lock = {
                let tables = lock_tables(&self.tables);
                match tables.items.get(&item_id) {
                    Some(row) => Arc::clone(&row.lock),
                    None => return Ok(None),
                }
            };
            let guard = acquire(lock, self.lock_timeout, "items", item_id).await?;
            self.item_locks.insert(item_id, guard);
        }

        // Re-read under the lock; the row may have been removed while waiting.
        let tables = lock_tables(&self.tables);
        Ok(tables.items.get(&item_id).map(|row| row.value.clone()))
    }

    async fn persist_item(&mut self, item: &Item) -> StoreResult<()> {
        self.ensure_open()?;
        if !self.item_locks.contains_key(&item.id) {
            return Err(StoreError::NotLocked { table: "items", id: item.id });
        }

        self.staged_items.insert(item.id, item.clone());
        Ok(())
    }
}

#[async_trait]
impl RentalLedger for MemoryTransaction {
    async fn lock_and_get_rental(&mut self, rental_id: RentalId) -> StoreResult<Option<Rental>> {
        self.ensure_open()?;
        if let Some(rental) = self.staged_rentals.get(&rental_id) {
            return Ok(Some(rental.clone()));
        }

        if !self.rental_locks.contains_key(&rental_id) {
            let lock = {
                let tables = lock_tables(&self.tables);
                match tables.rentals.get(&rental_id) {
                    Some(row) => Arc::clone(&row.lock),
                    None => return Ok(None),
                }
            };
            let guard = acquire(lock, self.lock_timeout, "rentals", rental_id).await?;
            self.rental_locks.insert(rental_id, guard);
        }

        let tables = lock_tables(&self.tables);
        Ok(tables.rentals.get(&rental_id).map(|row| row.value.clone()))
    }

    async fn create_rental(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        rented_at: DateTime<Utc>,
    ) -> StoreResult<Rental> {
        self.ensure_open()?;

        // Ids are never reused, even when the transaction rolls back.
        let id = {
            let mut tables = lock_tables(&self.tables);
            tables.next_rental_id += 1;
            tables.next_rental_id
        };

        let rental = Rental {
            id,
            user_id,
            item_id,
            rented_at,
            returned_at: None,
        };
        self.staged_rentals.insert(id, rental.clone());
        Ok(rental)
    }

    async fn mark_returned(&mut self, rental: &Rental, returned_at: DateTime<Utc>) -> StoreResult<()> {
        self.ensure_open()?;
        // Staged rentals were either locked or created by this transaction.
        if !self.rental_locks.contains_key(&rental.id) && !self.staged_rentals.contains_key(&rental.id) {
            return Err(StoreError::NotLocked { table: "rentals", id: rental.id });
        }

        let mut updated = rental.clone();
        updated.returned_at = Some(returned_at);
        self.staged_rentals.insert(rental.id, updated);
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;

        {
            let mut tables = lock_tables(&self.tables);
            // Nothing is applied if a row this transaction wrote to was
            // removed by `remove_item` in the meantime.
            let vanished = self
                .staged_items
                .keys()
                .copied()
                .find(|id| !tables.items.contains_key(id));
            if let Some(id) = vanished {
                drop(tables);
                self.release();
                return Err(StoreError::RowVanished { table: "items", id });
            }

            for (id, item) in self.staged_items.drain() {
                if let Some(row) = tables.items.get_mut(&id) {
                    row.value = item;
                }
            }
            for (id, rental) in std::mem::take(&mut self.staged_rentals) {
                match tables.rentals.get_mut(&id) {
                    Some(row) => row.value = rental,
                    None => {
                        tables.rentals.insert(id, Row::new(rental));
                    }
                }
            }
        }

        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.release();
        Ok(())
    }
}
