use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ItemId = i64;
pub type RentalId = i64;

pub const DEFAULT_PER_PAGE: u32 = 15;
pub const MAX_PER_PAGE: u32 = 100;
pub const MAX_TITLE_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub author: Option<String>,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub stock: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub id: RentalId,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub rented_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
}

/// A rental as handed back to callers, with its item attached. `item` is
/// `None` only when the item row has been deleted under the rental.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalWithItem {
    #[serde(flatten)]
    pub rental: Rental,
    pub item: Option<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentalState {
    Open,
    Returned,
}

/// Result of a rent attempt. Every outcome the coordinator can produce is
/// listed here; callers are expected to match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentOutcome {
    Created(RentalWithItem),
    ItemNotFound,
    OutOfStock,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnOutcome {
    Returned(RentalWithItem),
    RentalNotFound,
    Forbidden,
    AlreadyReturned,
    ItemMissing,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub current_page: u32,
    pub per_page: u32,
    pub total: i64,
    pub last_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

impl Item {
    /// Hands out one copy if any is left.
    pub fn take_copy(&mut self) -> bool {
        if self.stock <= 0 {
            return false;
        }
        self.stock -= 1;
        true
    }

    pub fn put_back(&mut self) {
        self.stock += 1;
    }
}

impl NewItem {
    pub fn validate(&self) -> Result<(), String> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err("title is required".to_string());
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(format!("title must be at most {} characters", MAX_TITLE_LEN));
        }
        if let Some(author) = &self.author {
            if author.chars().count() > MAX_TITLE_LEN {
                return Err(format!("author must be at most {} characters", MAX_TITLE_LEN));
            }
        }
        if self.stock < 0 {
            return Err("stock must be zero or greater".to_string());
        }
        Ok(())
    }
}

impl Rental {
    pub fn state(&self) -> RentalState {
        match self.returned_at {
            Some(_) => RentalState::Returned,
            None => RentalState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == RentalState::Open
    }

    /// Moves the rental from `Open` to `Returned`. A clock that runs behind
    /// `rented_at` is clamped so `returned_at >= rented_at` always holds.
    pub fn mark_returned(&mut self, at: DateTime<Utc>) -> Result<DateTime<Utc>, RentalState> {
        if !self.is_open() {
            return Err(RentalState::Returned);
        }
        let returned_at = at.max(self.rented_at);
        self.returned_at = Some(returned_at);
        Ok(returned_at)
    }
}

impl RentalWithItem {
    pub fn new(rental: Rental, item: Option<Item>) -> Self {
        Self { rental, item }
    }
}

impl RentOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            RentOutcome::Created(_) => 201,
            RentOutcome::ItemNotFound => 404,
            RentOutcome::OutOfStock => 409,
            RentOutcome::Internal => 500,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RentOutcome::Created(_) => "Rental created",
            RentOutcome::ItemNotFound => "Item not found",
            RentOutcome::OutOfStock => "Item out of stock",
            RentOutcome::Internal => "Failed to rent item",
        }
    }
}

impl ReturnOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            ReturnOutcome::Returned(_) => 200,
            ReturnOutcome::RentalNotFound => 404,
            ReturnOutcome::Forbidden => 403,
            ReturnOutcome::AlreadyReturned => 409,
            ReturnOutcome::ItemMissing => 404,
            ReturnOutcome::Internal => 500,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ReturnOutcome::Returned(_) => "Rental returned",
            ReturnOutcome::RentalNotFound => "Rental not found",
            ReturnOutcome::Forbidden => "Forbidden",
            ReturnOutcome::AlreadyReturned => "Rental already returned",
            ReturnOutcome::ItemMissing => "Item not found",
            ReturnOutcome::Internal => "Failed to return item",
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    pub fn current_page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.per_page.clamp(1, MAX_PER_PAGE))
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.current_page() - 1) * self.limit()
    }
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, request: PageRequest, total: i64) -> Self {
        let per_page = request.limit();
        let last_page = ((total.max(0) + per_page - 1) / per_page).max(1);

        Self {
            data,
            current_page: request.current_page(),
            per_page: per_page as u32,
            total,
            last_page: u32::try_from(last_page).unwrap_or(u32::MAX),
        }
    }
}
