use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use rental_service::api::{create_router, AppState, TrustedHeaderIdentity, PRINCIPAL_HEADER};
use rental_service::{CoordinatorConfig, MemoryStore, RentalCoordinator, RentalStore};
use serde_json::{json, Value};
use shared::NewItem;
use std::sync::Arc;
use tower::ServiceExt;

fn app(store: Arc<MemoryStore>) -> Router {
    let coordinator = Arc::new(RentalCoordinator::new(store.clone(), CoordinatorConfig::default()));
    create_router(AppState {
        coordinator,
        store,
        identity: Arc::new(TrustedHeaderIdentity),
    })
}

async fn send(app: &Router, method: &str, uri: &str, user: Option<i64>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(PRINCIPAL_HEADER, user.to_string());
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn seed(store: &MemoryStore, stock: i32) -> i64 {
    store
        .create_item(NewItem {
            title: "Snow Crash".to_string(),
            author: None,
            stock,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn health_is_open() {
    let app = app(Arc::new(MemoryStore::new()));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_or_bad_principal_is_unauthorized() {
    let store = Arc::new(MemoryStore::new());
    let item_id = seed(&store, 1).await;
    let app = app(store);

    let (status, body) = send(&app, "POST", "/rentals", None, Some(json!({ "item_id": item_id }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");

    let request = Request::builder()
        .method("GET")
        .uri("/rentals")
        .header(PRINCIPAL_HEADER, "not-a-number")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rent_and_return_map_to_reference_statuses() {
    let store = Arc::new(MemoryStore::new());
    let item_id = seed(&store, 1).await;
    let app = app(store.clone());

    let (status, body) = send(&app, "POST", "/rentals", Some(1), Some(json!({ "item_id": item_id }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["item_id"], item_id);
    assert!(body["data"]["returned_at"].is_null());
    assert_eq!(body["data"]["item"]["title"], "Snow Crash");
    assert_eq!(body["data"]["item"]["stock"], 0);
    let rental_id = body["data"]["id"].as_i64().unwrap();

    let (status, body) = send(&app, "POST", "/rentals", Some(2), Some(json!({ "item_id": item_id }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Item out of stock");

    let (status, _) = send(&app, "POST", "/rentals", Some(1), Some(json!({ "item_id": 999 }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/rentals/{}/return", rental_id);
    let (status, _) = send(&app, "POST", &uri, Some(2), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, "POST", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["data"]["returned_at"].is_null());
    assert_eq!(body["data"]["item"]["stock"], 1);

    let (status, body) = send(&app, "POST", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Rental already returned");

    let (status, _) = send(&app, "POST", "/rentals/424242/return", Some(1), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(store.find_item(item_id).await.unwrap().unwrap().stock, 1);
}

#[tokio::test]
async fn return_after_item_deleted_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let item_id = seed(&store, 1).await;
    let app = app(store.clone());

    let (_, body) = send(&app, "POST", "/rentals", Some(1), Some(json!({ "item_id": item_id }))).await;
    let rental_id = body["data"]["id"].as_i64().unwrap();

    store.remove_item(item_id).unwrap();

    let uri = format!("/rentals/{}/return", rental_id);
    let (status, body) = send(&app, "POST", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Item not found");

    let (status, body) = send(&app, "GET", "/rentals", Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"][0]["returned_at"].is_null());
    assert!(body["data"][0]["item"].is_null());
}

#[tokio::test]
async fn rent_without_item_id_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store);

    let (status, _) = send(&app, "POST", "/rentals", Some(1), Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn rentals_listing_is_paginated_per_user() {
    let store = Arc::new(MemoryStore::new());
    let item_id = seed(&store, 5).await;
    let app = app(store);

    for _ in 0..3 {
        let (status, _) = send(&app, "POST", "/rentals", Some(7), Some(json!({ "item_id": item_id }))).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    send(&app, "POST", "/rentals", Some(8), Some(json!({ "item_id": item_id }))).await;

    let (status, body) = send(&app, "GET", "/rentals?per_page=2", Some(7), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["data"][0]["item"]["title"], "Snow Crash");
    assert_eq!(body["data"][0]["item_id"], item_id);
    assert_eq!(body["per_page"], 2);
    assert_eq!(body["last_page"], 2);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = send(&app, "GET", "/rentals?page=2&per_page=2", Some(7), None).await;
    assert_eq!(body["current_page"], 2);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn items_can_be_created_and_listed() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store);

    let (status, body) = send(
        &app,
        "POST",
        "/items",
        Some(1),
        Some(json!({ "title": "Solaris", "author": "Stanisław Lem", "stock": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let item_id = body["data"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["stock"], 2);

    let (status, _) = send(&app, "POST", "/items", Some(1), Some(json!({ "title": "", "stock": 1 }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&app, "POST", "/items", Some(1), Some(json!({ "title": "Ubik", "stock": -3 }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(&app, "GET", &format!("/items/{}", item_id), Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["title"], "Solaris");

    let (status, _) = send(&app, "GET", "/items/999", Some(1), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "GET", "/items", Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["per_page"], 15);
}
