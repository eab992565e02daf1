pub mod api;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod models;
pub mod schema;
pub mod store;

pub use config::{Clock, CoordinatorConfig, ManualClock, SystemClock};
pub use coordinator::{RentalCoordinator, RentalError};
pub use store::{MemoryStore, PgStore, RentalStore, StoreError};
