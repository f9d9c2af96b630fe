//! End-to-end projection flow over the in-memory log and store.

#![allow(clippy::unwrap_used)] // Test code can use unwrap

use listings_core::event::{Event, LISTING_CREATED, ListingCreated, USER_CREATED, UserCreated};
use listings_core::event_bus::{DeliveryPolicy, DurableLog, StreamConfig};
use listings_core::middleware::Handler;
use listings_core::projection::ListingQuery;
use listings_projections::{ListingViewProjector, ListingViewService};
use listings_runtime::{HandlerRegistry, Publisher, Shutdown, SubscriptionOptions, start_all};
use listings_testing::{InMemoryLog, InMemoryProjectionStore, fixtures};
use std::sync::Arc;
use std::time::Duration;

const STREAM: &str = "listing_view_event";

fn registry(projector: &ListingViewProjector<InMemoryProjectionStore>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let users: Arc<dyn Handler<UserCreated>> = Arc::new(projector.clone());
    let listings: Arc<dyn Handler<ListingCreated>> = Arc::new(projector.clone());
    registry.register(users).unwrap();
    registry.register(listings).unwrap();
    registry.verify(&[USER_CREATED, LISTING_CREATED]).unwrap();
    registry
}

async fn log() -> InMemoryLog {
    listings_testing::init_test_tracing();
    let log = InMemoryLog::new();
    log.ensure_stream(&StreamConfig::new(STREAM, [USER_CREATED, LISTING_CREATED]).with_dead_letter())
        .await
        .unwrap();
    log
}

fn options() -> SubscriptionOptions {
    SubscriptionOptions {
        reconnect_delay: Duration::from_millis(10),
        ..SubscriptionOptions::default()
    }
}

#[tokio::test]
async fn user_then_listing_produces_listing_with_embedded_owner() {
    let log = log().await;
    let store = Arc::new(InMemoryProjectionStore::new());
    let projector = ListingViewProjector::new(Arc::clone(&store));
    let publisher = Publisher::new(Arc::new(log.clone()));

    let subscriptions = start_all(
        Arc::new(log.clone()),
        &registry(&projector),
        STREAM,
        "listing-view",
        &DeliveryPolicy::default(),
        &options(),
        &Shutdown::never(),
    )
    .await
    .unwrap();

    publisher.publish_event(&fixtures::user_created(1, "John Doe")).await.unwrap();
    log.wait_for_settlements("listing-view-user_created", 1).await;
    publisher
        .publish_event(&fixtures::listing_created(5, 1, "rent", 1000))
        .await
        .unwrap();
    log.wait_for_settlements("listing-view-listing_created", 1).await;

    for subscription in subscriptions {
        subscription.stop_and_join().await.unwrap();
    }

    let listing = store.listing(5).unwrap();
    assert_eq!(listing.user_id, 1);
    assert_eq!(listing.listing_type, "rent");
    assert_eq!(listing.price, 1000);
    assert_eq!(listing.user, fixtures::user_projection(1, "John Doe").snapshot());

    let page = ListingViewService::new(store)
        .get_all_listings(&ListingQuery::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.listings[0].user.name, "John Doe");
}

#[tokio::test]
async fn listing_before_user_is_dead_lettered_with_single_attempt() {
    let log = log().await;
    let store = Arc::new(InMemoryProjectionStore::new());
    let projector = ListingViewProjector::new(Arc::clone(&store));
    let policy = DeliveryPolicy::default().dead_letter(format!("{STREAM}.dead_letter"));

    let subscriptions = start_all(
        Arc::new(log.clone()),
        &registry(&projector),
        STREAM,
        "listing-view",
        &policy,
        &options(),
        &Shutdown::never(),
    )
    .await
    .unwrap();

    let payload = serde_json::to_vec(&fixtures::listing_created(5, 1, "rent", 1000)).unwrap();
    log.publish(LISTING_CREATED, &payload).await.unwrap();
    log.wait_for_settlements("listing-view-listing_created", 1).await;

    for subscription in subscriptions {
        subscription.stop_and_join().await.unwrap();
    }

    assert_eq!(store.listing_count(), 0);
    let dead = log.messages(&format!("{STREAM}.dead_letter"));
    assert_eq!(dead.len(), 1);
    assert_eq!(ListingCreated::decode(&dead[0].payload).unwrap().id, 5);
}
