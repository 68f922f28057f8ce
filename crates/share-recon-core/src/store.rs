use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{
    Item, ItemId, ItemUpdate, ListingType, Request, RequestId, RequestStatus, RequestUpdate,
    Transaction,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemFilter {
    #[serde(default)]
    pub available_only: bool,
    #[serde(default)]
    pub listing_type: Option<ListingType>,
}

impl ItemFilter {
    #[must_use]
    pub fn matches(&self, item: &Item) -> bool {
        (!self.available_only || item.is_available)
            && (self.listing_type.is_none() || self.listing_type == Some(item.listing_type))
    }
}

/// Status scoping for request listings. An empty `include_statuses` means every status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestFilter {
    #[serde(default)]
    pub include_statuses: Vec<RequestStatus>,
    #[serde(default)]
    pub exclude_statuses: Vec<RequestStatus>,
}

impl RequestFilter {
    #[must_use]
    pub fn only(status: RequestStatus) -> Self {
        Self { include_statuses: vec![status], exclude_statuses: Vec::new() }
    }

    #[must_use]
    pub fn excluding(statuses: &[RequestStatus]) -> Self {
        Self { include_statuses: Vec::new(), exclude_statuses: statuses.to_vec() }
    }

    #[must_use]
    pub fn matches(&self, status: RequestStatus) -> bool {
        (self.include_statuses.is_empty() || self.include_statuses.contains(&status))
            && !self.exclude_statuses.contains(&status)
    }
}

/// Read/write access to the marketplace store.
///
/// Calls block until the store answers. Implementations provide at most
/// single-row atomicity per update; the engine relies on nothing stronger.
/// There is deliberately no Transaction write operation.
pub trait StoreAdapter {
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot be read.
    fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, StoreError>;

    /// Requests come back with `match_count` and `active_transaction_count` populated.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot be read.
    fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot be read.
    fn list_transactions(&self) -> Result<Vec<Transaction>, StoreError>;

    /// Current number of Matches for a request, read fresh from the store.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the request is gone.
    fn match_count(&self, request_id: RequestId) -> Result<u32, StoreError>;

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no item has `id`.
    fn update_item(&mut self, id: ItemId, fields: &ItemUpdate) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no request has `id`.
    fn update_request(&mut self, id: RequestId, fields: &RequestUpdate) -> Result<(), StoreError>;
}
