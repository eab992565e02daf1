//! Runs against a real database. Ignored by default; run with
//! `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.

use futures::future::join_all;
use rental_service::store::{InventoryStore, StoreTransaction};
use rental_service::{db, CoordinatorConfig, PgStore, RentalCoordinator, RentalStore};
use shared::{NewItem, PageRequest, RentOutcome, ReturnOutcome};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static MIGRATED: OnceLock<()> = OnceLock::new();

async fn store() -> PgStore {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");

    let migrate_url = url.clone();
    tokio::task::spawn_blocking(move || {
        MIGRATED.get_or_init(|| db::run_migrations(&migrate_url).expect("migrations failed"));
    })
    .await
    .unwrap();
    let pool = db::build_pool(&url, 16).await.unwrap();
    PgStore::new(pool)
}

async fn seed(store: &PgStore, stock: i32) -> i64 {
    store
        .create_item(NewItem {
            title: "Foundation".to_string(),
            author: Some("Isaac Asimov".to_string()),
            stock,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires TEST_DATABASE_URL"]
async fn row_locks_prevent_overselling() {
    let store = Arc::new(store().await);
    let item_id = seed(&store, 2).await;
    let coordinator = Arc::new(RentalCoordinator::new(store.clone(), CoordinatorConfig::default()));

    let handles = (0..8).map(|user| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.rent(1_000 + user, item_id).await })
    });
    let outcomes: Vec<RentOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, RentOutcome::Created(_)))
        .count();
    assert_eq!(created, 2);
    assert_eq!(store.find_item(item_id).await.unwrap().unwrap().stock, 0);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn rent_then_return_round_trips_stock() {
    let store = Arc::new(store().await);
    let item_id = seed(&store, 1).await;
    let coordinator = RentalCoordinator::new(store.clone(), CoordinatorConfig::default());

    let rental = match coordinator.rent(42, item_id).await {
        RentOutcome::Created(view) => view.rental,
        other => panic!("expected Created, got {:?}", other),
    };
    assert_eq!(coordinator.return_item(43, rental.id).await, ReturnOutcome::Forbidden);
    assert!(matches!(
        coordinator.return_item(42, rental.id).await,
        ReturnOutcome::Returned(_)
    ));
    assert_eq!(
        coordinator.return_item(42, rental.id).await,
        ReturnOutcome::AlreadyReturned
    );
    assert_eq!(store.find_item(item_id).await.unwrap().unwrap().stock, 1);

    let page = coordinator.list_rentals(42, PageRequest::default()).await.unwrap();
    let listed = page.data.iter().find(|r| r.rental.id == rental.id).unwrap();
    assert!(!listed.rental.is_open());
    assert_eq!(listed.item.as_ref().map(|i| i.title.as_str()), Some("Foundation"));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn lock_timeout_surfaces_internal_and_rolls_back() {
    let store = Arc::new(store().await);
    let item_id = seed(&store, 3).await;
    let config = CoordinatorConfig::default().with_lock_timeout(Duration::from_millis(100));
    let coordinator = RentalCoordinator::new(store.clone(), config);

    let mut holder = store.begin(Duration::from_secs(5)).await.unwrap();
    holder.lock_and_get_item(item_id).await.unwrap().unwrap();

    assert_eq!(coordinator.rent(7, item_id).await, RentOutcome::Internal);

    holder.rollback().await.unwrap();
    assert_eq!(store.find_item(item_id).await.unwrap().unwrap().stock, 3);
}
