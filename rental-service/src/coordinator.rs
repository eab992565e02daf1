//! Atomic rent/return transitions.
//!
//! Each operation runs in exactly one store transaction. Domain rejections
//! and store failures both roll the transaction back, so a decremented stock
//! without its rental row (or a returned rental without its stock) is never
//! committed. Lock order is rental row, then item row.

use shared::{ItemId, Page, PageRequest, RentalId, RentalWithItem, RentOutcome, ReturnOutcome, UserId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::store::{RentalStore, StoreError, StoreTransaction};

#[derive(Debug, thiserror::Error)]
pub enum RentalError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error("item {0} is out of stock")]
    OutOfStock(ItemId),

    #[error("rental {0} not found")]
    RentalNotFound(RentalId),

    #[error("user {user_id} does not own rental {rental_id}")]
    Forbidden { rental_id: RentalId, user_id: UserId },

    #[error("rental {0} already returned")]
    AlreadyReturned(RentalId),

    #[error("rental {rental_id} references missing item {item_id}")]
    ItemMissing { rental_id: RentalId, item_id: ItemId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RentalCoordinator {
    store: Arc<dyn RentalStore>,
    config: CoordinatorConfig,
}

impl RentalError {
    fn is_internal(&self) -> bool {
        matches!(self, RentalError::Store(_))
    }
}

impl From<RentalError> for RentOutcome {
    fn from(e: RentalError) -> Self {
        match e {
            RentalError::ItemNotFound(_) => RentOutcome::ItemNotFound,
            RentalError::OutOfStock(_) => RentOutcome::OutOfStock,
            _ => RentOutcome::Internal,
        }
    }
}

impl From<RentalError> for ReturnOutcome {
    fn from(e: RentalError) -> Self {
        match e {
            RentalError::RentalNotFound(_) => ReturnOutcome::RentalNotFound,
            RentalError::Forbidden { .. } => ReturnOutcome::Forbidden,
            RentalError::AlreadyReturned(_) => ReturnOutcome::AlreadyReturned,
            RentalError::ItemMissing { .. } => ReturnOutcome::ItemMissing,
            _ => ReturnOutcome::Internal,
        }
    }
}

impl RentalCoordinator {
    pub fn new(store: Arc<dyn RentalStore>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub async fn rent(&self, user_id: UserId, item_id: ItemId) -> RentOutcome {
        match self.try_rent(user_id, item_id).await {
            Ok(view) => {
                info!("Rental {} created: user {} took item {}", view.rental.id, user_id, item_id);
                RentOutcome::Created(view)
            }
            Err(e) => {
                log_rejection("rent", &e);
                e.into()
            }
        }
    }

    pub async fn return_item(&self, user_id: UserId, rental_id: RentalId) -> ReturnOutcome {
        match self.try_return(user_id, rental_id).await {
            Ok(view) => {
                info!("Rental {} returned by user {}", view.rental.id, user_id);
                ReturnOutcome::Returned(view)
            }
            Err(e) => {
                log_rejection("return", &e);
                e.into()
            }
        }
    }

    /// Unlocked read; reflects the latest commit at best.
    pub async fn list_rentals(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<RentalWithItem>, RentalError> {
        Ok(self.store.list_rentals(user_id, page).await?)
    }

    async fn try_rent(&self, user_id: UserId, item_id: ItemId) -> Result<RentalWithItem, RentalError> {
        let mut tx = self.store.begin(self.config.lock_timeout).await?;
        let result = self.rent_in(tx.as_mut(), user_id, item_id).await;
        finish(tx, result).await
    }

    async fn try_return(&self, user_id: UserId, rental_id: RentalId) -> Result<RentalWithItem, RentalError> {
        let mut tx = self.store.begin(self.config.lock_timeout).await?;
        let result = self.return_in(tx.as_mut(), user_id, rental_id).await;
        finish(tx, result).await
    }

    async fn rent_in(
        &self,
        tx: &mut dyn StoreTransaction,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<RentalWithItem, RentalError> {
        let mut item = tx
            .lock_and_get_item(item_id)
            .await?
            .ok_or(RentalError::ItemNotFound(item_id))?;

        if !item.take_copy() {
            return Err(RentalError::OutOfStock(item_id));
        }
        tx.persist_item(&item).await?;

        let rental = tx.create_rental(user_id, item_id, self.config.clock.now()).await?;
        Ok(RentalWithItem::new(rental, Some(item)))
    }

    async fn return_in(
        &self,
        tx: &mut dyn StoreTransaction,
        user_id: UserId,
        rental_id: RentalId,
    ) -> Result<RentalWithItem, RentalError> {
        let mut rental = tx
            .lock_and_get_rental(rental_id)
            .await?
            .ok_or(RentalError::RentalNotFound(rental_id))?;

        if rental.user_id != user_id {
            return Err(RentalError::Forbidden { rental_id, user_id });
        }
        if !rental.is_open() {
            return Err(RentalError::AlreadyReturned(rental_id));
        }

        let mut item = tx
            .lock_and_get_item(rental.item_id)
            .await?
            .ok_or(RentalError::ItemMissing {
                rental_id,
                item_id: rental.item_id,
            })?;

        let returned_at = rental
            .mark_returned(self.config.clock.now())
            .map_err(|_| RentalError::AlreadyReturned(rental_id))?;
        tx.mark_returned(&rental, returned_at).await?;

        item.put_back();
        tx.persist_item(&item).await?;

        Ok(RentalWithItem::new(rental, Some(item)))
    }
}

async fn finish<T: Send>(
    mut tx: Box<dyn StoreTransaction>,
    result: Result<T, RentalError>,
) -> Result<T, RentalError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("Rollback failed after {}: {}", e, rollback);
            }
            Err(e)
        }
    }
}

fn log_rejection(operation: &str, e: &RentalError) {
    if e.is_internal() {
        error!("{} failed: {}", operation, e);
    } else {
        debug!("{} rejected: {}", operation, e);
    }
}
