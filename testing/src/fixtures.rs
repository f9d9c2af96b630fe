//! Event and read-model fixtures with deterministic timestamps.

use listings_core::event::{ListingCreated, UserCreated};
use listings_core::projection::{ListingProjection, UserProjection};

/// Fixed base timestamp (unix micros) used by every fixture.
pub const BASE_TIME: i64 = 1_700_000_000_000_000;

/// A `UserCreated` event.
#[must_use]
pub fn user_created(id: i64, name: &str) -> UserCreated {
    UserCreated {
        id,
        name: name.to_string(),
        email: format!("user{id}@example.com"),
        created_at: BASE_TIME,
        updated_at: BASE_TIME,
    }
}

/// A `ListingCreated` event; later ids get later timestamps.
#[must_use]
pub fn listing_created(id: i64, user_id: i64, listing_type: &str, price: i64) -> ListingCreated {
    ListingCreated {
        id,
        user_id,
        listing_type: listing_type.to_string(),
        price,
        created_at: BASE_TIME + id,
        updated_at: BASE_TIME + id,
    }
}

/// The projection a `user_created(id, name)` event produces.
#[must_use]
pub fn user_projection(id: i64, name: &str) -> UserProjection {
    UserProjection {
        id,
        name: name.to_string(),
        created_at: BASE_TIME,
        updated_at: BASE_TIME,
    }
}

/// A listing owned by `owner`, created `offset_micros` after [`BASE_TIME`].
#[must_use]
pub fn listing_projection(id: i64, owner: &UserProjection, offset_micros: i64) -> ListingProjection {
    ListingProjection {
        id,
        user_id: owner.id,
        listing_type: "rent".to_string(),
        price: 1_000,
        created_at: BASE_TIME + offset_micros,
        updated_at: BASE_TIME + offset_micros,
        user: owner.snapshot(),
    }
}
