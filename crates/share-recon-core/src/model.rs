use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Date;
use ulid::Ulid;

use crate::title::TitleFields;

/// Format a date as `YYYY-MM-DD`, the form dates take in JSON, YAML and SQLite.
#[must_use]
pub fn format_date(value: Date) -> String {
    format!("{:04}-{:02}-{:02}", value.year(), u8::from(value.month()), value.day())
}

/// Parse a `YYYY-MM-DD` date.
///
/// # Errors
/// Returns the underlying parse error when `value` is not a calendar date.
pub fn parse_date(value: &str) -> Result<Date, time::error::Parse> {
    Date::parse(value, time::macros::format_description!("[year]-[month]-[day]"))
}

pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*value))
    }

    /// # Errors
    /// Fails when the input is not a `YYYY-MM-DD` string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw)
            .map_err(|err| serde::de::Error::custom(format!("invalid date {raw:?}: {err}")))
    }
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(ItemId);
ulid_id!(RequestId);
ulid_id!(MatchId);
ulid_id!(TransactionId);
ulid_id!(UserId);

/// The record collections the engine reads; only `Items` and `Requests` are ever written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Items,
    Requests,
    Matches,
    Transactions,
}

impl Collection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Items => "items",
            Self::Requests => "requests",
            Self::Matches => "matches",
            Self::Transactions => "transactions",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingType {
    Item,
    Service,
}

impl ListingType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Service => "service",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "item" => Some(Self::Item),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Matched,
    Accepted,
    Expired,
    Cancelled,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Matched => "matched",
            Self::Accepted => "accepted",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "matched" => Some(Self::Matched),
            "accepted" => Some(Self::Accepted),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LenderResponse {
    Pending,
    Accepted,
    Declined,
}

impl LenderResponse {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Active,
    Returned,
    Cancelled,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Returned => "returned",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "returned" => Some(Self::Returned),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub listing_type: ListingType,
    pub category_tier1: Option<String>,
    pub category_tier2: Option<String>,
    pub category_tier3: Option<String>,
    #[serde(default)]
    pub is_other: bool,
    pub custom_item_name: Option<String>,
    pub is_available: bool,
    pub owner_id: UserId,
}

impl Item {
    #[must_use]
    pub fn title_fields(&self) -> TitleFields<'_> {
        TitleFields {
            title: &self.title,
            is_other: self.is_other,
            category_tier1: self.category_tier1.as_deref(),
            category_tier2: self.category_tier2.as_deref(),
            category_tier3: self.category_tier3.as_deref(),
            custom_name: self.custom_item_name.as_deref(),
        }
    }

    #[must_use]
    pub fn state(&self) -> RecordState {
        RecordState {
            title: self.title.clone(),
            listing_type: Some(self.listing_type),
            category_tier1: self.category_tier1.clone(),
            category_tier2: self.category_tier2.clone(),
            category_tier3: self.category_tier3.clone(),
            is_other: self.is_other,
            is_available: Some(self.is_available),
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub title: String,
    pub category_tier1: Option<String>,
    pub category_tier2: Option<String>,
    pub category_tier3: Option<String>,
    #[serde(default)]
    pub is_other: bool,
    pub custom_need: Option<String>,
    pub status: RequestStatus,
    #[serde(with = "iso_date")]
    pub needed_from: Date,
    pub requester_id: UserId,
    /// Number of Matches referencing this request at read time.
    #[serde(default)]
    pub match_count: u32,
    /// Number of pending or active Transactions referencing this request at read time.
    #[serde(default)]
    pub active_transaction_count: u32,
}

impl Request {
    #[must_use]
    pub fn title_fields(&self) -> TitleFields<'_> {
        TitleFields {
            title: &self.title,
            is_other: self.is_other,
            category_tier1: self.category_tier1.as_deref(),
            category_tier2: self.category_tier2.as_deref(),
            category_tier3: self.category_tier3.as_deref(),
            custom_name: self.custom_need.as_deref(),
        }
    }

    #[must_use]
    pub fn state(&self) -> RecordState {
        RecordState {
            title: self.title.clone(),
            listing_type: None,
            category_tier1: self.category_tier1.clone(),
            category_tier2: self.category_tier2.clone(),
            category_tier3: self.category_tier3.clone(),
            is_other: self.is_other,
            is_available: None,
            status: Some(self.status),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Match {
    pub id: MatchId,
    pub request_id: RequestId,
    pub lender_response: LenderResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub item_id: ItemId,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    pub status: TransactionStatus,
    pub borrower_id: UserId,
}

/// Snapshot of the mutable fields of an Item or Request, used for before/after repair logs.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordState {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_type: Option<ListingType>,
    pub category_tier1: Option<String>,
    pub category_tier2: Option<String>,
    pub category_tier3: Option<String>,
    pub is_other: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
}

/// Partial Item update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemUpdate {
    pub title: Option<String>,
    pub listing_type: Option<ListingType>,
    pub category_tier1: Option<String>,
    pub category_tier2: Option<String>,
    pub category_tier3: Option<String>,
    pub is_other: Option<bool>,
    pub is_available: Option<bool>,
}

impl ItemUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, item: &mut Item) {
        if let Some(title) = &self.title {
            item.title.clone_from(title);
        }
        if let Some(listing_type) = self.listing_type {
            item.listing_type = listing_type;
        }
        if let Some(tier1) = &self.category_tier1 {
            item.category_tier1 = Some(tier1.clone());
        }
        if let Some(tier2) = &self.category_tier2 {
            item.category_tier2 = Some(tier2.clone());
        }
        if let Some(tier3) = &self.category_tier3 {
            item.category_tier3 = Some(tier3.clone());
        }
        if let Some(is_other) = self.is_other {
            item.is_other = is_other;
        }
        if let Some(is_available) = self.is_available {
            item.is_available = is_available;
        }
    }
}

/// Partial Request update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestUpdate {
    pub title: Option<String>,
    pub category_tier1: Option<String>,
    pub category_tier2: Option<String>,
    pub category_tier3: Option<String>,
    pub is_other: Option<bool>,
    pub status: Option<RequestStatus>,
}

impl RequestUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, request: &mut Request) {
        if let Some(title) = &self.title {
            request.title.clone_from(title);
        }
        if let Some(tier1) = &self.category_tier1 {
            request.category_tier1 = Some(tier1.clone());
        }
        if let Some(tier2) = &self.category_tier2 {
            request.category_tier2 = Some(tier2.clone());
        }
        if let Some(tier3) = &self.category_tier3 {
            request.category_tier3 = Some(tier3.clone());
        }
        if let Some(is_other) = self.is_other {
            request.is_other = is_other;
        }
        if let Some(status) = self.status {
            request.status = status;
        }
    }
}
