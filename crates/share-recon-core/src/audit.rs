use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use time::Date;

use crate::corrections::CorrectionSet;
use crate::error::ReconError;
use crate::lifecycle::{check_lifecycle, LifecycleVerdict};
use crate::model::{format_date, iso_date, Collection, ItemId, Request};
use crate::store::{ItemFilter, RequestFilter, StoreAdapter};
use crate::taxonomy::Taxonomy;
use crate::title::{check_title, TitleFields, TitleVerdict};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditScope {
    Titles,
    Lifecycle,
    All,
}

impl AuditScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Titles => "titles",
            Self::Lifecycle => "lifecycle",
            Self::All => "all",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "titles" => Some(Self::Titles),
            "lifecycle" => Some(Self::Lifecycle),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn titles(self) -> bool {
        matches!(self, Self::Titles | Self::All)
    }

    fn lifecycle(self) -> bool {
        matches!(self, Self::Lifecycle | Self::All)
    }
}

#[derive(Debug, Clone)]
pub struct AuditOptions<'a> {
    pub scope: AuditScope,
    pub item_filter: ItemFilter,
    pub request_filter: RequestFilter,
    pub today: Date,
    /// Curated corrections; their post-images count as canonical.
    pub curated: &'a CorrectionSet,
    /// Used for repair hints in entry details.
    pub taxonomy: &'a Taxonomy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Consistent,
    Mismatch,
    Violation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Title,
    Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEntry {
    pub collection: Collection,
    pub id: String,
    pub display_title: String,
    pub check: CheckKind,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerdictCounts {
    pub consistent: usize,
    pub mismatch: usize,
    pub violation: usize,
}

impl VerdictCounts {
    fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Consistent => self.consistent += 1,
            Verdict::Mismatch => self.mismatch += 1,
            Verdict::Violation => self.violation += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditSummary {
    pub total: usize,
    #[serde(flatten)]
    pub verdicts: VerdictCounts,
    pub by_collection: BTreeMap<String, VerdictCounts>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditReport {
    #[serde(with = "iso_date")]
    pub today: Date,
    pub scope: AuditScope,
    pub entries: Vec<AuditEntry>,
    pub summary: AuditSummary,
}

impl AuditReport {
    /// True when at least one entry is a mismatch or a violation.
    #[must_use]
    pub fn needs_repair(&self) -> bool {
        self.summary.verdicts.mismatch + self.summary.verdicts.violation > 0
    }

    pub fn findings(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(|entry| entry.verdict != Verdict::Consistent)
    }

    fn push(&mut self, entry: AuditEntry) {
        if entry.verdict != Verdict::Consistent {
            tracing::debug!(
                collection = %entry.collection,
                id = %entry.id,
                check = ?entry.check,
                verdict = ?entry.verdict,
                "audit finding"
            );
        }
        self.summary.total += 1;
        self.summary.verdicts.record(entry.verdict);
        self.summary
            .by_collection
            .entry(entry.collection.as_str().to_string())
            .or_default()
            .record(entry.verdict);
        self.entries.push(entry);
    }
}

fn title_hint(
    fields: &TitleFields<'_>,
    expected: Option<&str>,
    taxonomy: &Taxonomy,
) -> Option<String> {
    match expected {
        None if fields.is_other => Some("marked as other but the custom name is empty".to_string()),
        None => Some(match taxonomy.tier3_path(fields.title) {
            Some(path) => format!(
                "no category set; title matches {} > {} > {}",
                path.tier1, path.tier2, path.tier3
            ),
            None => "no category set and the title is not a taxonomy label".to_string(),
        }),
        Some(label) if !fields.is_other && taxonomy.tier3_path(label).is_none() => {
            Some(format!("category_tier3 {label:?} is not a taxonomy label"))
        }
        Some(_) => None,
    }
}

fn title_entry(
    collection: Collection,
    id: String,
    fields: &TitleFields<'_>,
    options: &AuditOptions<'_>,
) -> AuditEntry {
    let (verdict, expected, detail) = match check_title(fields, options.curated) {
        TitleVerdict::Consistent => (Verdict::Consistent, None, None),
        TitleVerdict::Mismatch { expected, .. } => {
            let detail = title_hint(fields, expected.as_deref(), options.taxonomy);
            (Verdict::Mismatch, expected, detail)
        }
    };
    AuditEntry {
        collection,
        id,
        display_title: fields.title.to_string(),
        check: CheckKind::Title,
        verdict,
        expected,
        detail,
    }
}

fn lifecycle_entry(request: &Request, today: Date) -> AuditEntry {
    let (verdict, expected, detail) =
        match check_lifecycle(request.status, request.needed_from, request.match_count, today) {
            LifecycleVerdict::Consistent => (Verdict::Consistent, None, None),
            LifecycleVerdict::Violation { expected_status } => (
                Verdict::Violation,
                Some(expected_status.as_str().to_string()),
                Some(format!(
                    "expired although needed_from {} is not before {}; {} match(es)",
                    format_date(request.needed_from),
                    format_date(today),
                    request.match_count
                )),
            ),
        };
    AuditEntry {
        collection: Collection::Requests,
        id: request.id.to_string(),
        display_title: request.title.clone(),
        check: CheckKind::Lifecycle,
        verdict,
        expected,
        detail,
    }
}

/// Read-only scan of the store against the title and lifecycle invariants.
///
/// Transactions carry no title of their own: each is reported with its owning
/// Item's title verdict, and a Transaction whose Item no longer exists is a
/// violation.
///
/// # Errors
/// Returns [`ReconError::StoreUnavailable`] when the store cannot be read.
pub fn audit<S: StoreAdapter + ?Sized>(
    store: &S,
    options: &AuditOptions<'_>,
) -> Result<AuditReport, ReconError> {
    let read = |err| ReconError::from_store(err, 0);
    let mut report = AuditReport {
        today: options.today,
        scope: options.scope,
        entries: Vec::new(),
        summary: AuditSummary::default(),
    };

    if options.scope.titles() {
        let items = store.list_items(&ItemFilter::default()).map_err(read)?;
        let mut item_verdicts: HashMap<ItemId, AuditEntry> = HashMap::with_capacity(items.len());
        for item in &items {
            let entry =
                title_entry(Collection::Items, item.id.to_string(), &item.title_fields(), options);
            item_verdicts.insert(item.id, entry.clone());
            if options.item_filter.matches(item) {
                report.push(entry);
            }
        }

        let requests = store.list_requests(&options.request_filter).map_err(read)?;
        for request in &requests {
            report.push(title_entry(
                Collection::Requests,
                request.id.to_string(),
                &request.title_fields(),
                options,
            ));
        }

        for txn in store.list_transactions().map_err(read)? {
            let entry = match item_verdicts.get(&txn.item_id) {
                Some(owner) => AuditEntry {
                    collection: Collection::Transactions,
                    id: txn.id.to_string(),
                    display_title: owner.display_title.clone(),
                    check: CheckKind::Title,
                    verdict: owner.verdict,
                    expected: owner.expected.clone(),
                    detail: (owner.verdict != Verdict::Consistent)
                        .then(|| format!("owning item {} has a non-canonical title", txn.item_id)),
                },
                None => AuditEntry {
                    collection: Collection::Transactions,
                    id: txn.id.to_string(),
                    display_title: String::new(),
                    check: CheckKind::Title,
                    verdict: Verdict::Violation,
                    expected: None,
                    detail: Some(format!("owning item {} does not exist", txn.item_id)),
                },
            };
            report.push(entry);
        }
    }

    if options.scope.lifecycle() {
        let requests = store.list_requests(&options.request_filter).map_err(read)?;
        for request in &requests {
            report.push(lifecycle_entry(request, options.today));
        }
    }

    tracing::info!(
        scope = options.scope.as_str(),
        total = report.summary.total,
        mismatch = report.summary.verdicts.mismatch,
        violation = report.summary.verdicts.violation,
        "audit finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use time::macros::date;
    use time::Duration;

    use super::*;
    use crate::model::{
        Item, ListingType, RequestId, RequestStatus, Transaction, TransactionId, TransactionStatus,
        UserId,
    };
    use crate::store::memory::MemoryStore;

    const TODAY: Date = date!(2026 - 03 - 14);

    fn item(title: &str, tier3: Option<&str>, is_available: bool) -> Item {
        Item {
            id: ItemId::new(),
            title: title.to_string(),
            listing_type: ListingType::Item,
            category_tier1: None,
            category_tier2: None,
            category_tier3: tier3.map(str::to_string),
            is_other: false,
            custom_item_name: None,
            is_available,
            owner_id: UserId::new(),
        }
    }

    fn request(title: &str, status: RequestStatus, needed_from: Date) -> Request {
        Request {
            id: RequestId::new(),
            title: title.to_string(),
            category_tier1: None,
            category_tier2: None,
            category_tier3: Some(title.to_string()),
            is_other: false,
            custom_need: None,
            status,
            needed_from,
            requester_id: UserId::new(),
            match_count: 0,
            active_transaction_count: 0,
        }
    }

    fn txn(item_id: ItemId) -> Transaction {
        Transaction {
            id: TransactionId::new(),
            item_id,
            request_id: None,
            status: TransactionStatus::Returned,
            borrower_id: UserId::new(),
        }
    }

    fn run(store: &MemoryStore, scope: AuditScope, request_filter: RequestFilter) -> AuditReport {
        let curated = CorrectionSet::empty();
        let taxonomy = Taxonomy::standard();
        let options = AuditOptions {
            scope,
            item_filter: ItemFilter::default(),
            request_filter,
            today: TODAY,
            curated: &curated,
            taxonomy: &taxonomy,
        };
        match audit(store, &options) {
            Ok(report) => report,
            Err(err) => panic!("audit should succeed: {err}"),
        }
    }

    #[test]
    fn reports_every_record_in_scope() {
        let mut store = MemoryStore::default();
        store.add_item(item("Snowboard", Some("Snowboard"), true));
        store.add_item(item("JBL PartyBox 310 Speaker test", None, true));
        store.add_request(request("Tent", RequestStatus::Expired, TODAY + Duration::days(1)));

        let report = run(&store, AuditScope::All, RequestFilter::default());
        assert_eq!(report.summary.total, 4);
        assert_eq!(report.summary.verdicts.consistent, 2);
        assert_eq!(report.summary.verdicts.mismatch, 1);
        assert_eq!(report.summary.verdicts.violation, 1);
        assert!(report.needs_repair());
        assert_eq!(store.writes, 0);

        let lifecycle = report
            .entries
            .iter()
            .find(|entry| entry.check == CheckKind::Lifecycle)
            .map(|entry| entry.expected.as_deref());
        assert_eq!(lifecycle, Some(Some("open")));
    }

    #[test]
    fn uncategorized_titles_get_a_taxonomy_hint() {
        let mut store = MemoryStore::default();
        store.add_item(item("Snowboard", None, true));

        let report = run(&store, AuditScope::Titles, RequestFilter::default());
        let Some(entry) = report.findings().next() else {
            panic!("uncategorized item should be a finding");
        };
        assert_eq!(entry.expected, None);
        assert_eq!(
            entry.detail.as_deref(),
            Some("no category set; title matches Sports & Outdoors > Winter Sports > Snowboard")
        );
    }

    #[test]
    fn transactions_inherit_their_items_verdict() {
        let mut store = MemoryStore::default();
        let bad = item("mystery box", Some("Drill"), false);
        let good = item("Drill", Some("Drill"), true);
        store.transactions.push(txn(bad.id));
        store.transactions.push(txn(good.id));
        store.transactions.push(txn(ItemId::new()));
        store.add_item(bad);
        store.add_item(good);

        let report = run(&store, AuditScope::Titles, RequestFilter::default());
        let counts = report.summary.by_collection.get("transactions").copied().unwrap_or_default();
        assert_eq!(counts, VerdictCounts { consistent: 1, mismatch: 1, violation: 1 });
        let missing = report
            .entries
            .iter()
            .find(|entry| entry.verdict == Verdict::Violation)
            .and_then(|entry| entry.detail.clone())
            .unwrap_or_default();
        assert!(missing.contains("does not exist"), "detail was {missing}");
    }

    #[test]
    fn item_filter_does_not_orphan_transactions() {
        let mut store = MemoryStore::default();
        let hidden = item("Drill", Some("Drill"), false);
        store.transactions.push(txn(hidden.id));
        store.add_item(hidden);

        let curated = CorrectionSet::empty();
        let taxonomy = Taxonomy::standard();
        let options = AuditOptions {
            scope: AuditScope::Titles,
            item_filter: ItemFilter { available_only: true, listing_type: None },
            request_filter: RequestFilter::default(),
            today: TODAY,
            curated: &curated,
            taxonomy: &taxonomy,
        };
        let report = match audit(&store, &options) {
            Ok(report) => report,
            Err(err) => panic!("audit should succeed: {err}"),
        };
        assert_eq!(report.summary.total, 1);
        assert_eq!(report.entries[0].collection, Collection::Transactions);
        assert_eq!(report.entries[0].verdict, Verdict::Consistent);
    }

    #[test]
    fn excluded_statuses_are_not_reported() {
        let mut store = MemoryStore::default();
        store.add_request(request("Tent", RequestStatus::Cancelled, TODAY + Duration::days(1)));
        store.add_request(request("Kayak", RequestStatus::Open, TODAY));

        let report = run(
            &store,
            AuditScope::Lifecycle,
            RequestFilter::excluding(&[RequestStatus::Cancelled]),
        );
        assert_eq!(report.summary.total, 1);
        assert_eq!(report.entries[0].display_title, "Kayak");
        assert!(!report.needs_repair());
    }
}
