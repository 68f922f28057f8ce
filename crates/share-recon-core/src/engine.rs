use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::{ReconError, StoreError};
use crate::lifecycle::{check_lifecycle, LifecycleVerdict};
use crate::model::{
    format_date, Collection, Item, ItemUpdate, RecordState, Request, RequestStatus, RequestUpdate,
};
use crate::store::{ItemFilter, RequestFilter, StoreAdapter};
use crate::title::{check_title, plan_title_repair, TitlePolicy, TitleRepair, TitleVerdict};

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions<'a> {
    /// Plan every action but issue no writes.
    pub dry_run: bool,
    /// Checked between records; a run never stops halfway through one record.
    pub cancel: Option<&'a AtomicBool>,
}

impl RepairOptions<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Which collections a title repair run walks, and how each is scoped.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TitleScope {
    pub items: bool,
    pub requests: bool,
    #[serde(default)]
    pub item_filter: ItemFilter,
    #[serde(default)]
    pub request_filter: RequestFilter,
}

impl Default for TitleScope {
    fn default() -> Self {
        Self {
            items: true,
            requests: true,
            item_filter: ItemFilter::default(),
            request_filter: RequestFilter::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    Recategorized,
    Quarantined,
    StatusRepaired,
    Kept,
    Unresolved,
    Skipped,
}

impl RepairAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recategorized => "recategorized",
            Self::Quarantined => "quarantined",
            Self::StatusRepaired => "status_repaired",
            Self::Kept => "kept",
            Self::Unresolved => "unresolved",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    Titles,
    Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepairLogEntry {
    pub action: RepairAction,
    pub collection: Collection,
    pub id: String,
    pub before: RecordState,
    /// Planned or committed state; absent when the record was left alone.
    pub after: Option<RecordState>,
    /// True only when a write reached the store.
    pub written: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepairSummary {
    pub recategorized: usize,
    pub quarantined: usize,
    pub status_repaired: usize,
    pub kept: usize,
    pub unresolved: usize,
    pub skipped: usize,
    pub writes: usize,
}

impl RepairSummary {
    fn record(&mut self, entry: &RepairLogEntry) {
        match entry.action {
            RepairAction::Recategorized => self.recategorized += 1,
            RepairAction::Quarantined => self.quarantined += 1,
            RepairAction::StatusRepaired => self.status_repaired += 1,
            RepairAction::Kept => self.kept += 1,
            RepairAction::Unresolved => self.unresolved += 1,
            RepairAction::Skipped => self.skipped += 1,
        }
        if entry.written {
            self.writes += 1;
        }
    }

    #[must_use]
    pub fn repaired(&self) -> usize {
        self.recategorized + self.quarantined + self.status_repaired
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepairRun {
    pub kind: RepairKind,
    pub dry_run: bool,
    pub aborted: bool,
    pub entries: Vec<RepairLogEntry>,
    pub summary: RepairSummary,
}

impl RepairRun {
    fn new(kind: RepairKind, dry_run: bool) -> Self {
        Self {
            kind,
            dry_run,
            aborted: false,
            entries: Vec::new(),
            summary: RepairSummary::default(),
        }
    }

    fn push(&mut self, entry: RepairLogEntry) {
        if entry.action == RepairAction::Kept {
            tracing::debug!(
                action = entry.action.as_str(),
                collection = %entry.collection,
                id = %entry.id,
                "record kept"
            );
        } else {
            tracing::info!(
                action = entry.action.as_str(),
                collection = %entry.collection,
                id = %entry.id,
                dry_run = self.dry_run,
                written = entry.written,
                before = ?entry.before,
                after = ?entry.after,
                "reconciliation action"
            );
        }
        self.summary.record(&entry);
        self.entries.push(entry);
    }

    fn abort(&mut self) {
        tracing::warn!(
            kind = ?self.kind,
            processed = self.entries.len(),
            writes = self.summary.writes,
            "reconciliation run cancelled between records"
        );
        self.aborted = true;
    }

    fn finish(self) -> Self {
        tracing::info!(
            kind = ?self.kind,
            dry_run = self.dry_run,
            aborted = self.aborted,
            recategorized = self.summary.recategorized,
            quarantined = self.summary.quarantined,
            status_repaired = self.summary.status_repaired,
            kept = self.summary.kept,
            unresolved = self.summary.unresolved,
            skipped = self.summary.skipped,
            "reconciliation run finished"
        );
        self
    }
}

fn kept(
    collection: Collection,
    id: String,
    before: RecordState,
    detail: Option<String>,
) -> RepairLogEntry {
    RepairLogEntry {
        action: RepairAction::Kept,
        collection,
        id,
        before,
        after: None,
        written: false,
        detail,
    }
}

fn skipped(
    collection: Collection,
    id: String,
    before: RecordState,
    reason: String,
) -> RepairLogEntry {
    RepairLogEntry {
        action: RepairAction::Skipped,
        collection,
        id,
        before,
        after: None,
        written: false,
        detail: Some(reason),
    }
}

/// Classify a write outcome: `Ok(None)` on success, `Ok(Some(reason))` when the
/// record vanished and is skipped, `Err` when the run must stop.
fn settle_write(
    result: Result<(), StoreError>,
    repaired: usize,
) -> Result<Option<String>, ReconError> {
    let Err(err) = result else {
        return Ok(None);
    };
    let err = ReconError::from_store(err, repaired);
    if err.is_per_record() {
        tracing::warn!(error = %err, "record skipped");
        return Ok(Some(err.to_string()));
    }
    tracing::error!(error = %err, "store failure, aborting run");
    Err(err)
}

fn unresolved_entry(
    collection: Collection,
    id: String,
    before: RecordState,
    actual: String,
    expected: Option<String>,
) -> RepairLogEntry {
    let err = ReconError::UnresolvedMismatch { collection, id: id.clone(), actual };
    tracing::warn!(error = %err, expected = ?expected, "title mismatch left for manual follow-up");
    RepairLogEntry {
        action: RepairAction::Unresolved,
        collection,
        id,
        before,
        after: None,
        written: false,
        detail: Some(err.to_string()),
    }
}

fn repair_item_title<S: StoreAdapter + ?Sized>(
    store: &mut S,
    item: &Item,
    policy: &TitlePolicy,
    dry_run: bool,
    repaired: usize,
) -> Result<RepairLogEntry, ReconError> {
    let id = item.id.to_string();
    let before = item.state();
    let TitleVerdict::Mismatch { actual, expected } =
        check_title(&item.title_fields(), &policy.corrections)
    else {
        return Ok(kept(Collection::Items, id, before, None));
    };

    let (action, update) = match plan_title_repair(&actual, policy) {
        TitleRepair::Recategorize(correction) => {
            (RepairAction::Recategorized, correction.item_update())
        }
        TitleRepair::Quarantine if !item.is_available => {
            let detail = Some("already quarantined".to_string());
            return Ok(kept(Collection::Items, id, before, detail));
        }
        TitleRepair::Quarantine => (
            RepairAction::Quarantined,
            ItemUpdate { is_available: Some(false), ..ItemUpdate::default() },
        ),
        TitleRepair::Unresolved => {
            return Ok(unresolved_entry(Collection::Items, id, before, actual, expected));
        }
    };

    let mut planned = item.clone();
    update.apply_to(&mut planned);
    let after = Some(planned.state());

    if dry_run {
        return Ok(RepairLogEntry {
            action,
            collection: Collection::Items,
            id,
            before,
            after,
            written: false,
            detail: None,
        });
    }

    match settle_write(store.update_item(item.id, &update), repaired)? {
        None => Ok(RepairLogEntry {
            action,
            collection: Collection::Items,
            id,
            before,
            after,
            written: true,
            detail: None,
        }),
        Some(reason) => Ok(skipped(Collection::Items, id, before, reason)),
    }
}

fn repair_request_title<S: StoreAdapter + ?Sized>(
    store: &mut S,
    request: &Request,
    policy: &TitlePolicy,
    dry_run: bool,
    repaired: usize,
) -> Result<RepairLogEntry, ReconError> {
    let id = request.id.to_string();
    let before = request.state();
    let TitleVerdict::Mismatch { actual, expected } =
        check_title(&request.title_fields(), &policy.corrections)
    else {
        return Ok(kept(Collection::Requests, id, before, None));
    };

    let (action, update) = match plan_title_repair(&actual, policy) {
        TitleRepair::Recategorize(correction) => {
            (RepairAction::Recategorized, correction.request_update())
        }
        TitleRepair::Quarantine if request.status == RequestStatus::Cancelled => {
            let detail = Some("already quarantined".to_string());
            return Ok(kept(Collection::Requests, id, before, detail));
        }
        TitleRepair::Quarantine => (
            RepairAction::Quarantined,
            RequestUpdate { status: Some(RequestStatus::Cancelled), ..RequestUpdate::default() },
        ),
        TitleRepair::Unresolved => {
            return Ok(unresolved_entry(Collection::Requests, id, before, actual, expected));
        }
    };

    let mut planned = request.clone();
    update.apply_to(&mut planned);
    let after = Some(planned.state());

    if dry_run {
        return Ok(RepairLogEntry {
            action,
            collection: Collection::Requests,
            id,
            before,
            after,
            written: false,
            detail: None,
        });
    }

    match settle_write(store.update_request(request.id, &update), repaired)? {
        None => Ok(RepairLogEntry {
            action,
            collection: Collection::Requests,
            id,
            before,
            after,
            written: true,
            detail: None,
        }),
        Some(reason) => Ok(skipped(Collection::Requests, id, before, reason)),
    }
}

/// Walk Items then Requests, recategorizing or quarantining every title mismatch.
///
/// Records are processed one at a time and each write is committed before the
/// next record is looked at, so an interrupted run leaves a repaired prefix and
/// can simply be rerun.
///
/// # Errors
/// Returns [`ReconError::StoreUnavailable`] (with the number of records already
/// written) when the store cannot be reached. Vanished records are skipped, not fatal.
pub fn repair_titles<S: StoreAdapter + ?Sized>(
    store: &mut S,
    policy: &TitlePolicy,
    scope: &TitleScope,
    options: RepairOptions<'_>,
) -> Result<RepairRun, ReconError> {
    let mut run = RepairRun::new(RepairKind::Titles, options.dry_run);

    if scope.items {
        let items = store
            .list_items(&scope.item_filter)
            .map_err(|err| ReconError::from_store(err, run.summary.writes))?;
        for item in &items {
            if options.cancelled() {
                run.abort();
                return Ok(run.finish());
            }
            let entry =
                repair_item_title(store, item, policy, options.dry_run, run.summary.writes)?;
            run.push(entry);
        }
    }

    if scope.requests {
        let requests = store
            .list_requests(&scope.request_filter)
            .map_err(|err| ReconError::from_store(err, run.summary.writes))?;
        for request in &requests {
            if options.cancelled() {
                run.abort();
                return Ok(run.finish());
            }
            let entry =
                repair_request_title(store, request, policy, options.dry_run, run.summary.writes)?;
            run.push(entry);
        }
    }

    Ok(run.finish())
}

/// Restore prematurely expired requests to `open` or `matched`.
///
/// Only `expired` requests admitted by `filter` are visited, so a run never
/// touches requests that the matching audit left out.
/// The match count is re-read from the store right before each write rather than
/// trusted from the listing, which narrows the race with live match creation.
///
/// # Errors
/// Returns [`ReconError::StoreUnavailable`] when the store cannot be reached.
pub fn repair_lifecycle<S: StoreAdapter + ?Sized>(
    store: &mut S,
    filter: &RequestFilter,
    today: Date,
    options: RepairOptions<'_>,
) -> Result<RepairRun, ReconError> {
    let mut run = RepairRun::new(RepairKind::Lifecycle, options.dry_run);
    if !filter.matches(RequestStatus::Expired) {
        tracing::info!("request filter excludes expired requests; nothing to repair");
        return Ok(run.finish());
    }
    let requests = store
        .list_requests(&RequestFilter::only(RequestStatus::Expired))
        .map_err(|err| ReconError::from_store(err, 0))?;

    for request in &requests {
        if options.cancelled() {
            run.abort();
            return Ok(run.finish());
        }

        let id = request.id.to_string();
        let before = request.state();
        if check_lifecycle(request.status, request.needed_from, request.match_count, today)
            .is_consistent()
        {
            run.push(kept(Collection::Requests, id, before, None));
            continue;
        }

        let fresh_count = match store.match_count(request.id) {
            Ok(count) => count,
            Err(err) => {
                let err = ReconError::from_store(err, run.summary.writes);
                if !err.is_per_record() {
                    tracing::error!(error = %err, "store failure, aborting run");
                    return Err(err);
                }
                tracing::warn!(error = %err, "record skipped");
                run.push(skipped(Collection::Requests, id, before, err.to_string()));
                continue;
            }
        };

        let LifecycleVerdict::Violation { expected_status } =
            check_lifecycle(request.status, request.needed_from, fresh_count, today)
        else {
            run.push(kept(Collection::Requests, id, before, None));
            continue;
        };

        let update = RequestUpdate { status: Some(expected_status), ..RequestUpdate::default() };
        let mut planned = request.clone();
        planned.match_count = fresh_count;
        update.apply_to(&mut planned);
        let detail = Some(format!(
            "needed_from {} is not before {}; {fresh_count} match(es) at repair time",
            format_date(request.needed_from),
            format_date(today)
        ));

        if options.dry_run {
            run.push(RepairLogEntry {
                action: RepairAction::StatusRepaired,
                collection: Collection::Requests,
                id,
                before,
                after: Some(planned.state()),
                written: false,
                detail,
            });
            continue;
        }

        let outcome = store.update_request(request.id, &update);
        let entry = match settle_write(outcome, run.summary.writes)? {
            None => RepairLogEntry {
                action: RepairAction::StatusRepaired,
                collection: Collection::Requests,
                id,
                before,
                after: Some(planned.state()),
                written: true,
                detail,
            },
            Some(reason) => skipped(Collection::Requests, id, before, reason),
        };
        run.push(entry);
    }

    Ok(run.finish())
}
