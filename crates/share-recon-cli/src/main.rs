use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use sha2::{Digest, Sha256};
use share_recon_core::{
    audit, parse_date, repair_lifecycle, repair_titles, AuditOptions, AuditReport, AuditScope,
    CorrectionSet, ItemFilter, ListingType, RepairOptions, RepairRun, RequestFilter,
    RequestStatus, Taxonomy, TitlePolicy, TitleScope,
};
use share_recon_store_sqlite::{Dataset, SqliteStore};
use time::{Date, OffsetDateTime};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sr")]
#[command(about = "Share marketplace consistency reconciliation CLI")]
struct Cli {
    #[arg(long, default_value = "./share_market.sqlite3")]
    db: PathBuf,

    /// Log filter used when `RUST_LOG` is unset. Logs go to stderr.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    /// Report title and lifecycle findings without writing anything.
    Audit(AuditArgs),
    Repair {
        #[command(subcommand)]
        command: Box<RepairCommand>,
    },
    /// List the category taxonomy.
    Taxonomy,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Load(DbLoadArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
    /// Clear a reconciliation lock left behind by a crashed run.
    ReleaseLock,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbLoadArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct StatusFilterArgs {
    /// Skip requests in this status (repeatable).
    #[arg(long = "exclude-status", value_enum)]
    exclude_statuses: Vec<StatusArg>,
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[command(flatten)]
    statuses: StatusFilterArgs,
    #[arg(long, default_value_t = false)]
    available_only: bool,
    #[arg(long, value_enum)]
    listing_type: Option<ListingTypeArg>,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long, value_enum, default_value_t = ScopeArg::All)]
    scope: ScopeArg,
    /// Calendar date (YYYY-MM-DD) used as "today"; defaults to the current UTC date.
    #[arg(long)]
    today: Option<String>,
    /// Curated corrections (YAML or JSON) whose outputs count as canonical titles.
    #[arg(long)]
    corrections: Option<PathBuf>,
    #[command(flatten)]
    filters: FilterArgs,
}

#[derive(Debug, Subcommand)]
enum RepairCommand {
    Titles(RepairTitlesArgs),
    Lifecycle(RepairLifecycleArgs),
}

#[derive(Debug, Args)]
struct RepairTitlesArgs {
    #[arg(long)]
    corrections: Option<PathBuf>,
    /// Quarantine mismatches that have no correction.
    #[arg(long, default_value_t = false)]
    quarantine: bool,
    #[arg(long, default_value_t = false)]
    skip_items: bool,
    #[arg(long, default_value_t = false)]
    skip_requests: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Refuse to run unless a titles audit with the same flags still has this digest.
    #[arg(long)]
    expect_digest: Option<String>,
    #[command(flatten)]
    filters: FilterArgs,
}

#[derive(Debug, Args)]
struct RepairLifecycleArgs {
    #[arg(long)]
    today: Option<String>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Refuse to run unless a lifecycle audit with the same flags still has this digest.
    #[arg(long)]
    expect_digest: Option<String>,
    // No item flags: lifecycle checks only read requests.
    #[command(flatten)]
    statuses: StatusFilterArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Titles,
    Lifecycle,
    All,
}

impl ScopeArg {
    fn into_scope(self) -> AuditScope {
        match self {
            Self::Titles => AuditScope::Titles,
            Self::Lifecycle => AuditScope::Lifecycle,
            Self::All => AuditScope::All,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Open,
    Matched,
    Accepted,
    Expired,
    Cancelled,
}

impl StatusArg {
    fn into_status(self) -> RequestStatus {
        match self {
            Self::Open => RequestStatus::Open,
            Self::Matched => RequestStatus::Matched,
            Self::Accepted => RequestStatus::Accepted,
            Self::Expired => RequestStatus::Expired,
            Self::Cancelled => RequestStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListingTypeArg {
    Item,
    Service,
}

impl FilterArgs {
    fn item_filter(&self) -> ItemFilter {
        ItemFilter {
            available_only: self.available_only,
            listing_type: self.listing_type.map(|arg| match arg {
                ListingTypeArg::Item => ListingType::Item,
                ListingTypeArg::Service => ListingType::Service,
            }),
        }
    }

    fn request_filter(&self) -> RequestFilter {
        self.statuses.request_filter()
    }
}

impl StatusFilterArgs {
    fn request_filter(&self) -> RequestFilter {
        let statuses =
            self.exclude_statuses.iter().map(|arg| arg.into_status()).collect::<Vec<_>>();
        RequestFilter::excluding(&statuses)
    }

    fn without_item_filters(&self) -> FilterArgs {
        FilterArgs { statuses: self.clone(), available_only: false, listing_type: None }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to initialise logging: {err}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Audit(args) => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_audit(&args, &mut store)
        }
        Command::Repair { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_repair(*command, &mut store)
        }
        Command::Taxonomy => run_taxonomy(),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Load(args) => run_db_load(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::ReleaseLock => run_db_release_lock(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_load(args: &DbLoadArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let dataset = Dataset::read(&args.input)?;
    let loaded = store.load_dataset(&dataset)?;
    let totals = store.record_counts()?;
    emit_json(serde_json::json!({
        "in_file": args.input,
        "loaded": loaded,
        "totals": totals
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_release_lock(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let previous = store.force_release_run_lock()?;
    emit_json(serde_json::json!({
        "released": previous.is_some(),
        "previous_lock": previous
    }))
}

fn run_taxonomy() -> Result<()> {
    let taxonomy = Taxonomy::standard();
    emit_json(serde_json::json!({
        "paths": taxonomy.paths()
    }))
}

fn run_audit(args: &AuditArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let today = resolve_today(args.today.as_deref())?;
    let taxonomy = Taxonomy::standard();
    let curated = load_corrections(args.corrections.as_deref(), &taxonomy)?;
    let scope = args.scope.into_scope();
    let report = audit_store(store, scope, &args.filters, today, &curated, &taxonomy)?;
    let digest = report_digest(&report)?;

    let mut value = serde_json::to_value(&report).context("failed to serialize audit report")?;
    if let Value::Object(object) = &mut value {
        object.insert("needs_repair".to_string(), Value::Bool(report.needs_repair()));
        object.insert("report_digest".to_string(), Value::String(digest));
    }
    emit_json(value)
}

fn run_repair(command: RepairCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        RepairCommand::Titles(args) => run_repair_titles(&args, store),
        RepairCommand::Lifecycle(args) => run_repair_lifecycle(&args, store),
    }
}

fn run_repair_titles(args: &RepairTitlesArgs, store: &mut SqliteStore) -> Result<()> {
    let taxonomy = Taxonomy::standard();
    let corrections = load_corrections(args.corrections.as_deref(), &taxonomy)?;
    let today = OffsetDateTime::now_utc().date();
    let before =
        audit_store(store, AuditScope::Titles, &args.filters, today, &corrections, &taxonomy)?;
    let digest = report_digest(&before)?;
    check_expected_digest(args.expect_digest.as_deref(), &digest)?;

    let policy = TitlePolicy { corrections, quarantine: args.quarantine };
    let scope = TitleScope {
        items: !args.skip_items,
        requests: !args.skip_requests,
        item_filter: args.filters.item_filter(),
        request_filter: args.filters.request_filter(),
    };
    let options = RepairOptions { dry_run: args.dry_run, cancel: None };

    let run = with_run_lock(store, "titles", args.dry_run, |store| {
        repair_titles(store, &policy, &scope, options).map_err(anyhow::Error::from)
    })?;
    if run.summary.unresolved > 0 {
        tracing::warn!(
            unresolved = run.summary.unresolved,
            "title mismatches without a correction were left for manual follow-up"
        );
    }
    let after = if args.dry_run {
        None
    } else {
        let corrections = &policy.corrections;
        Some(audit_store(store, AuditScope::Titles, &args.filters, today, corrections, &taxonomy)?)
    };
    emit_repair(&run, &digest, after.as_ref())
}

fn run_repair_lifecycle(args: &RepairLifecycleArgs, store: &mut SqliteStore) -> Result<()> {
    let taxonomy = Taxonomy::standard();
    let curated = CorrectionSet::empty();
    let today = resolve_today(args.today.as_deref())?;
    let filters = args.statuses.without_item_filters();
    let before =
        audit_store(store, AuditScope::Lifecycle, &filters, today, &curated, &taxonomy)?;
    let digest = report_digest(&before)?;
    check_expected_digest(args.expect_digest.as_deref(), &digest)?;

    let request_filter = filters.request_filter();
    let options = RepairOptions { dry_run: args.dry_run, cancel: None };
    let run = with_run_lock(store, "lifecycle", args.dry_run, |store| {
        repair_lifecycle(store, &request_filter, today, options).map_err(anyhow::Error::from)
    })?;
    let after = if args.dry_run {
        None
    } else {
        Some(audit_store(store, AuditScope::Lifecycle, &filters, today, &curated, &taxonomy)?)
    };
    emit_repair(&run, &digest, after.as_ref())
}

fn emit_repair(run: &RepairRun, audit_digest: &str, after: Option<&AuditReport>) -> Result<()> {
    let mut value = serde_json::to_value(run).context("failed to serialize repair run")?;
    if let Value::Object(object) = &mut value {
        object.insert("audit_digest".to_string(), Value::String(audit_digest.to_string()));
        let remaining = after
            .map(|report| serde_json::to_value(&report.summary))
            .transpose()
            .context("failed to serialize post-repair summary")?;
        object.insert("post_repair_summary".to_string(), remaining.unwrap_or(Value::Null));
    }
    emit_json(value)
}

/// Hold the store's reconciliation lock for the duration of `run`.
/// Dry runs never write and do not take the lock.
fn with_run_lock<T>(
    store: &mut SqliteStore,
    run_kind: &str,
    dry_run: bool,
    run: impl FnOnce(&mut SqliteStore) -> Result<T>,
) -> Result<T> {
    if dry_run {
        return run(store);
    }

    let holder = format!(
        "sr-{}-{}",
        std::process::id(),
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    );
    store.acquire_run_lock(&holder, run_kind)?;
    let result = run(store);
    let released = store.release_run_lock(&holder);
    let value = result?;
    released?;
    Ok(value)
}

fn audit_store(
    store: &SqliteStore,
    scope: AuditScope,
    filters: &FilterArgs,
    today: Date,
    curated: &CorrectionSet,
    taxonomy: &Taxonomy,
) -> Result<AuditReport> {
    let options = AuditOptions {
        scope,
        item_filter: filters.item_filter(),
        request_filter: filters.request_filter(),
        today,
        curated,
        taxonomy,
    };
    audit(store, &options).context("audit failed")
}

/// Digest over the sorted audit entries, so the same findings always hash the same.
fn report_digest(report: &AuditReport) -> Result<String> {
    let mut lines = report
        .entries
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to serialize audit entries")?;
    lines.sort();

    let mut hasher = Sha256::new();
    hasher.update(report.scope.as_str().as_bytes());
    for line in lines {
        hasher.update(b"\n");
        hasher.update(line.as_bytes());
    }
    let digest = hasher.finalize();
    Ok(format!("sha256:{digest:x}"))
}

fn check_expected_digest(expected: Option<&str>, actual: &str) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(anyhow!(
            "store changed since it was audited: expected digest {expected}, found {actual}"
        )),
        _ => Ok(()),
    }
}

fn load_corrections(path: Option<&Path>, taxonomy: &Taxonomy) -> Result<CorrectionSet> {
    let Some(path) = path else {
        return Ok(CorrectionSet::empty());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read corrections file {}", path.display()))?;
    let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
    let set = if is_json {
        CorrectionSet::from_json_str(&body, taxonomy)
    } else {
        CorrectionSet::from_yaml_str(&body, taxonomy)
    };
    set.with_context(|| format!("invalid corrections file {}", path.display()))
}

fn resolve_today(value: Option<&str>) -> Result<Date> {
    match value {
        Some(raw) => parse_date(raw)
            .with_context(|| format!("invalid --today date (expected YYYY-MM-DD): {raw}")),
        None => Ok(OffsetDateTime::now_utc().date()),
    }
}
