//! Wire types exchanged with the user, listing and listing view services.

use serde::{Deserialize, Serialize};

/// A user as returned by the user service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    /// User id
    pub id: i64,
    /// Display name
    pub name: String,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
}

/// Body of `POST /users`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserRequest {
    /// Display name
    pub name: String,
}

/// `{"user": {...}}` envelope used by the user service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEnvelope {
    /// The user
    pub user: UserResponse,
}

/// A listing as returned by the listing and listing view services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingResponse {
    /// Listing id
    pub id: i64,
    /// Owner id; omitted by the listing view, which embeds the owner instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// `rent` or `sale`
    pub listing_type: String,
    /// Price
    pub price: i64,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
    /// Owner snapshot, present on listing view results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserResponse>,
}

/// Body of `POST /public/listings`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateListingRequest {
    /// Owner id
    pub user_id: i64,
    /// `rent` or `sale`
    pub listing_type: String,
    /// Price, at least 1
    pub price: i64,
}

impl CreateListingRequest {
    /// Field-level checks done before any call is made.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id <= 0 {
            return Err("user_id is required".to_string());
        }
        if !matches!(self.listing_type.as_str(), "rent" | "sale") {
            return Err("listing_type must be one of: rent, sale".to_string());
        }
        if self.price < 1 {
            return Err("price must be at least 1".to_string());
        }
        Ok(())
    }
}

/// `{"listing": {...}}` envelope used by the listing service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEnvelope {
    /// The listing
    pub listing: ListingResponse,
}

/// Paging for `GET /listings`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllListingsRequest {
    /// 1-based page number
    pub page_number: u32,
    /// Rows per page
    pub page_size: u32,
    /// Only listings owned by this user
    pub user_id: Option<i64>,
}

impl Default for GetAllListingsRequest {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: 10,
            user_id: None,
        }
    }
}

/// Body of `GET /listings`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllListingsResponse {
    /// `true` on success
    pub result: bool,
    /// Listings, newest first
    pub listings: Vec<ListingResponse>,
    /// Listings matching the filter across all pages
    #[serde(default)]
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user_id: i64, listing_type: &str, price: i64) -> CreateListingRequest {
        CreateListingRequest {
            user_id,
            listing_type: listing_type.to_string(),
            price,
        }
    }

    #[test]
    fn listing_request_validation() {
        assert!(request(1, "rent", 1000).validate().is_ok());
        assert!(request(1, "sale", 1).validate().is_ok());
        assert!(request(0, "rent", 1000).validate().is_err());
        assert!(request(1, "lease", 1000).validate().is_err());
        assert!(request(1, "rent", 0).validate().is_err());
    }
}
