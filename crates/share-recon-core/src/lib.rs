//! Consistency reconciliation for the sharing marketplace store.
//!
//! Pure checkers live in [`title`] and [`lifecycle`]; [`audit`] and [`engine`]
//! drive them over any [`StoreAdapter`].

pub mod audit;
pub mod corrections;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod store;
pub mod taxonomy;
pub mod title;

pub use audit::{
    audit, AuditEntry, AuditOptions, AuditReport, AuditScope, AuditSummary, CheckKind, Verdict,
    VerdictCounts,
};
pub use corrections::{Correction, CorrectionSet};
pub use engine::{
    repair_lifecycle, repair_titles, RepairAction, RepairKind, RepairLogEntry, RepairOptions,
    RepairRun, RepairSummary, TitleScope,
};
pub use error::{ReconError, StoreError};
pub use lifecycle::{check_lifecycle, live_status, LifecycleVerdict};
pub use model::{
    format_date, parse_date, Collection, Item, ItemId, ItemUpdate, LenderResponse, ListingType,
    Match, MatchId, RecordState, Request, RequestId, RequestStatus, RequestUpdate, Transaction,
    TransactionId, TransactionStatus, UserId,
};
pub use store::{ItemFilter, RequestFilter, StoreAdapter};
pub use taxonomy::{CategoryPath, Taxonomy};
pub use title::{
    check_title, plan_title_repair, TitleFields, TitlePolicy, TitleRepair, TitleVerdict,
};
