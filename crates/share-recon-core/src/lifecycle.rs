use serde::{Deserialize, Serialize};
use time::Date;

use crate::model::RequestStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum LifecycleVerdict {
    Consistent,
    Violation { expected_status: RequestStatus },
}

impl LifecycleVerdict {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }
}

/// Status a live (not yet past) request should carry given its match count.
#[must_use]
pub fn live_status(match_count: u32) -> RequestStatus {
    if match_count > 0 {
        RequestStatus::Matched
    } else {
        RequestStatus::Open
    }
}

/// Check a request's status against its date and match facts.
///
/// Only premature `expired` is detected. Every other status is produced by the
/// application's own transitions and is reported as consistent.
#[must_use]
pub fn check_lifecycle(
    status: RequestStatus,
    needed_from: Date,
    match_count: u32,
    today: Date,
) -> LifecycleVerdict {
    if status != RequestStatus::Expired || needed_from < today {
        return LifecycleVerdict::Consistent;
    }
    LifecycleVerdict::Violation { expected_status: live_status(match_count) }
}
