//! `GET /listings` over an in-memory read model, fed through the real
//! subscription pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap

use axum::http::StatusCode;
use axum_test::TestServer;
use listing_view_service::http::{AppState, router};
use listing_view_service::{CONSUMER_PREFIX, SUBJECTS, build_registry};
use listings_core::event_bus::{DeliveryPolicy, DurableLog, StreamConfig};
use listings_projections::{ListingViewService, ListingsResponse};
use listings_runtime::{Publisher, SubscriptionOptions, shutdown_channel, start_all};
use listings_testing::{InMemoryLog, InMemoryProjectionStore, fixtures};
use std::sync::Arc;
use std::time::Duration;

fn server(store: &Arc<InMemoryProjectionStore>) -> TestServer {
    TestServer::new(router(AppState {
        listings: ListingViewService::new(Arc::clone(store)),
        metrics: None,
    }))
    .unwrap()
}

async fn wait_for_listings(store: &InMemoryProjectionStore, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.listing_count() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listings were not projected in time");
}

#[tokio::test]
async fn published_events_become_queryable_listings() {
    listings_testing::init_test_tracing();
    let log = InMemoryLog::new();
    let stream = StreamConfig::new("listing_view_event", SUBJECTS).with_dead_letter();
    log.ensure_stream(&stream).await.unwrap();
    let store = Arc::new(InMemoryProjectionStore::new());
    let registry = build_registry(Arc::clone(&store)).unwrap();
    let (trigger, shutdown) = shutdown_channel();
    let policy = DeliveryPolicy::default().max_deliver(3).dead_letter(stream.dead_letter_subject());

    let subscriptions = start_all(
        Arc::new(log.clone()),
        &registry,
        &stream.name,
        CONSUMER_PREFIX,
        &policy,
        &SubscriptionOptions::default(),
        &shutdown,
    )
    .await
    .unwrap();

    let publisher = Publisher::new(Arc::new(log.clone()));
    publisher.publish_event(&fixtures::user_created(1, "John Doe")).await.unwrap();
    wait_for_user(&store).await;
    publisher
        .publish_event(&fixtures::listing_created(5, 1, "rent", 1000))
        .await
        .unwrap();
    wait_for_listings(&store, 1).await;

    let response = server(&store).get("/listings").await;

    response.assert_status_ok();
    let body: ListingsResponse = response.json();
    assert!(body.result);
    assert_eq!(body.listings.len(), 1);
    assert_eq!(body.listings[0].id, 5);
    assert_eq!(body.listings[0].user.name, "John Doe");

    trigger.trigger();
    for subscription in subscriptions {
        subscription.join().await.unwrap();
    }
}

async fn wait_for_user(store: &InMemoryProjectionStore) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.user_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("user was not projected in time");
}

#[tokio::test]
async fn paging_and_owner_filter_come_from_the_query_string() {
    use listings_core::projection::ProjectionStore;

    let store = Arc::new(InMemoryProjectionStore::new());
    let john = fixtures::user_projection(1, "John Doe");
    let jane = fixtures::user_projection(2, "Jane Roe");
    store.upsert_user(&john).await.unwrap();
    store.upsert_user(&jane).await.unwrap();
    for id in 1..=6 {
        let owner = if id % 2 == 0 { &jane } else { &john };
        store
            .insert_listing(&fixtures::listing_projection(id, owner, id))
            .await
            .unwrap();
    }
    let server = server(&store);

    let page: ListingsResponse = server
        .get("/listings")
        .add_query_param("page_num", "2")
        .add_query_param("page_size", "2")
        .await
        .json();
    let ids: Vec<i64> = page.listings.iter().map(|l| l.id).collect();
    assert_eq!(ids, vec![4, 3]);
    assert_eq!(page.total, 6);

    let owned: ListingsResponse = server
        .get("/listings")
        .add_query_param("user_id", "2")
        .await
        .json();
    assert!(owned.listings.iter().all(|l| l.user.id == 2));
    assert_eq!(owned.total, 3);
}

#[tokio::test]
async fn bad_paging_is_a_json_bad_request() {
    let store = Arc::new(InMemoryProjectionStore::new());
    let server = server(&store);

    let response = server.get("/listings").add_query_param("page_size", "1000").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("page_size"));

    server
        .get("/listings")
        .add_query_param("page_num", "abc")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn storage_outage_is_an_opaque_internal_error() {
    let store = Arc::new(InMemoryProjectionStore::new());
    store.set_unavailable(true);

    let response = server(&store).get("/listings").await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "internal server error");
}

#[tokio::test]
async fn health_is_no_content() {
    let store = Arc::new(InMemoryProjectionStore::new());

    server(&store).get("/health").await.assert_status(StatusCode::NO_CONTENT);
}
