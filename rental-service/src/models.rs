use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{Item, ItemId, NewItem, Rental, UserId};

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::items)]
pub struct ItemRow {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::items)]
pub struct NewItemRow {
    pub title: String,
    pub author: Option<String>,
    pub stock: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::rentals)]
pub struct RentalRow {
    pub id: i64,
    pub user_id: i64,
    pub item_id: i64,
    pub rented_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::rentals)]
pub struct NewRentalRow {
    pub user_id: i64,
    pub item_id: i64,
    pub rented_at: DateTime<Utc>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            author: row.author,
            stock: row.stock,
            created_at: row.created_at,
        }
    }
}

impl From<NewItem> for NewItemRow {
    fn from(item: NewItem) -> Self {
        Self {
            title: item.title.trim().to_string(),
            author: item.author,
            stock: item.stock,
        }
    }
}

impl From<RentalRow> for Rental {
    fn from(row: RentalRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            item_id: row.item_id,
            rented_at: row.rented_at,
            returned_at: row.returned_at,
        }
    }
}

impl NewRentalRow {
    pub fn new(user_id: UserId, item_id: ItemId, rented_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            item_id,
            rented_at,
        }
    }
}
