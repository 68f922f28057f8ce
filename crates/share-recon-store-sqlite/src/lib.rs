use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use share_recon_core::{
    format_date, parse_date, Collection, Item, ItemFilter, ItemId, ItemUpdate, LenderResponse,
    ListingType, Match, MatchId, Request, RequestFilter, RequestId, RequestStatus, RequestUpdate,
    StoreAdapter, StoreError, Transaction, TransactionId, TransactionStatus, UserId,
};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS items (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  listing_type TEXT NOT NULL CHECK (listing_type IN ('item','service')),
  category_tier1 TEXT,
  category_tier2 TEXT,
  category_tier3 TEXT,
  is_other INTEGER NOT NULL DEFAULT 0 CHECK (is_other IN (0,1)),
  custom_item_name TEXT,
  is_available INTEGER NOT NULL DEFAULT 1 CHECK (is_available IN (0,1)),
  owner_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  category_tier1 TEXT,
  category_tier2 TEXT,
  category_tier3 TEXT,
  is_other INTEGER NOT NULL DEFAULT 0 CHECK (is_other IN (0,1)),
  custom_need TEXT,
  status TEXT NOT NULL CHECK (status IN ('open','matched','accepted','expired','cancelled')),
  needed_from TEXT NOT NULL,
  requester_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS matches (
  id TEXT PRIMARY KEY,
  request_id TEXT NOT NULL,
  lender_response TEXT NOT NULL CHECK (lender_response IN ('pending','accepted','declined')),
  FOREIGN KEY (request_id) REFERENCES requests(id)
);

CREATE TABLE IF NOT EXISTS transactions (
  id TEXT PRIMARY KEY,
  item_id TEXT NOT NULL,
  request_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('pending','active','returned','cancelled')),
  borrower_id TEXT NOT NULL,
  FOREIGN KEY (item_id) REFERENCES items(id),
  FOREIGN KEY (request_id) REFERENCES requests(id)
);

CREATE INDEX IF NOT EXISTS idx_matches_request ON matches(request_id);
CREATE INDEX IF NOT EXISTS idx_transactions_item ON transactions(item_id);
CREATE INDEX IF NOT EXISTS idx_transactions_request ON transactions(request_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS reconciliation_lock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  holder TEXT NOT NULL,
  run_kind TEXT NOT NULL,
  acquired_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
    pub run_lock: Option<RunLock>,
}

/// Holder of the single-run reconciliation lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunLock {
    pub holder: String,
    pub run_kind: String,
    pub acquired_at: String,
}

/// Seed data for a store, read from YAML or JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub requests: Vec<Request>,
    #[serde(default)]
    pub matches: Vec<Match>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Dataset {
    /// Read a dataset file; `.yaml`/`.yml` parse as YAML, everything else as JSON.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset file {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        if is_yaml {
            serde_yaml::from_str(&body)
                .with_context(|| format!("invalid dataset YAML in {}", path.display()))
        } else {
            serde_json::from_str(&body)
                .with_context(|| format!("invalid dataset JSON in {}", path.display()))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordCounts {
    pub items: usize,
    pub requests: usize,
    pub matches: usize,
    pub transactions: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed marketplace store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            if !table_exists(&self.conn, "items")? {
                return Err(anyhow!("database schema is invalid: items table is missing"));
            }
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
        tracing::info!(version, "applied schema migration");
        Ok(())
    }

    /// Insert every record of `dataset` in one transaction.
    ///
    /// # Errors
    /// Returns an error when any row violates a constraint; nothing is written in that case.
    pub fn load_dataset(&mut self, dataset: &Dataset) -> Result<RecordCounts> {
        let tx = self.conn.transaction().context("failed to start dataset transaction")?;
        for item in &dataset.items {
            insert_item(&tx, item)?;
        }
        for request in &dataset.requests {
            insert_request(&tx, request)?;
        }
        for record in &dataset.matches {
            insert_match(&tx, record)?;
        }
        for txn in &dataset.transactions {
            insert_transaction(&tx, txn)?;
        }
        tx.commit().context("failed to commit dataset")?;

        let loaded = RecordCounts {
            items: dataset.items.len(),
            requests: dataset.requests.len(),
            matches: dataset.matches.len(),
            transactions: dataset.transactions.len(),
        };
        tracing::info!(?loaded, "loaded dataset");
        Ok(loaded)
    }

    /// # Errors
    /// Returns an error when the row cannot be inserted.
    pub fn insert_item(&mut self, item: &Item) -> Result<()> {
        insert_item(&self.conn, item)
    }

    /// # Errors
    /// Returns an error when the row cannot be inserted.
    pub fn insert_request(&mut self, request: &Request) -> Result<()> {
        insert_request(&self.conn, request)
    }

    /// # Errors
    /// Returns an error when the row cannot be inserted, e.g. an unknown request id.
    pub fn insert_match(&mut self, record: &Match) -> Result<()> {
        insert_match(&self.conn, record)
    }

    /// # Errors
    /// Returns an error when the row cannot be inserted, e.g. an unknown item id.
    pub fn insert_transaction(&mut self, txn: &Transaction) -> Result<()> {
        insert_transaction(&self.conn, txn)
    }

    /// # Errors
    /// Returns an error when a count query fails.
    pub fn record_counts(&self) -> Result<RecordCounts> {
        let count = |table: &str| -> Result<usize> {
            let value: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .with_context(|| format!("failed to count rows in {table}"))?;
            usize::try_from(value).with_context(|| format!("negative row count in {table}"))
        };
        Ok(RecordCounts {
            items: count("items")?,
            requests: count("requests")?,
            matches: count("matches")?,
            transactions: count("transactions")?,
        })
    }

    /// Load items matching `filter`, ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn items(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, listing_type, category_tier1, category_tier2, category_tier3,
                    is_other, custom_item_name, is_available, owner_id
             FROM items
             WHERE (?1 = 0 OR is_available = 1)
               AND (?2 IS NULL OR listing_type = ?2)
             ORDER BY id ASC",
        )?;
        let listing_type = filter.listing_type.map(ListingType::as_str);
        let mut rows = stmt.query(params![filter.available_only, listing_type])?;

        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(decode_row(Collection::Items, row, || {
                let listing_type_raw: String = row.get(2)?;
                Ok(Item {
                    id: ItemId(parse_ulid(&row.get::<_, String>(0)?)?),
                    title: row.get(1)?,
                    listing_type: ListingType::parse(&listing_type_raw)
                        .ok_or_else(|| anyhow!("unknown listing_type: {listing_type_raw}"))?,
                    category_tier1: row.get(3)?,
                    category_tier2: row.get(4)?,
                    category_tier3: row.get(5)?,
                    is_other: row.get(6)?,
                    custom_item_name: row.get(7)?,
                    is_available: row.get(8)?,
                    owner_id: UserId(parse_ulid(&row.get::<_, String>(9)?)?),
                })
            })?);
        }
        Ok(items)
    }

    /// Load requests with their match and active-transaction counts, ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn requests(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.title, r.category_tier1, r.category_tier2, r.category_tier3,
                    r.is_other, r.custom_need, r.status, r.needed_from, r.requester_id,
                    (SELECT COUNT(*) FROM matches m WHERE m.request_id = r.id),
                    (SELECT COUNT(*) FROM transactions t
                      WHERE t.request_id = r.id AND t.status IN ('pending','active'))
             FROM requests r
             ORDER BY r.id ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut requests = Vec::new();
        while let Some(row) = rows.next()? {
            let request = decode_row(Collection::Requests, row, || {
                let status_raw: String = row.get(7)?;
                let needed_from_raw: String = row.get(8)?;
                Ok(Request {
                    id: RequestId(parse_ulid(&row.get::<_, String>(0)?)?),
                    title: row.get(1)?,
                    category_tier1: row.get(2)?,
                    category_tier2: row.get(3)?,
                    category_tier3: row.get(4)?,
                    is_other: row.get(5)?,
                    custom_need: row.get(6)?,
                    status: RequestStatus::parse(&status_raw)
                        .ok_or_else(|| anyhow!("unknown request status: {status_raw}"))?,
                    needed_from: parse_date(&needed_from_raw)
                        .with_context(|| format!("invalid needed_from date: {needed_from_raw}"))?,
                    requester_id: UserId(parse_ulid(&row.get::<_, String>(9)?)?),
                    match_count: row.get(10)?,
                    active_transaction_count: row.get(11)?,
                })
            })?;
            if filter.matches(request.status) {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn matches(&self) -> Result<Vec<Match>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, request_id, lender_response FROM matches ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            matches.push(decode_row(Collection::Matches, row, || {
                let response_raw: String = row.get(2)?;
                Ok(Match {
                    id: MatchId(parse_ulid(&row.get::<_, String>(0)?)?),
                    request_id: RequestId(parse_ulid(&row.get::<_, String>(1)?)?),
                    lender_response: LenderResponse::parse(&response_raw)
                        .ok_or_else(|| anyhow!("unknown lender_response: {response_raw}"))?,
                })
            })?);
        }
        Ok(matches)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn transactions(&self) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_id, request_id, status, borrower_id FROM transactions ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut transactions = Vec::new();
        while let Some(row) = rows.next()? {
            transactions.push(decode_row(Collection::Transactions, row, || {
                let status_raw: String = row.get(3)?;
                let request_id = row
                    .get::<_, Option<String>>(2)?
                    .map(|raw| parse_ulid(&raw).map(RequestId))
                    .transpose()?;
                Ok(Transaction {
                    id: TransactionId(parse_ulid(&row.get::<_, String>(0)?)?),
                    item_id: ItemId(parse_ulid(&row.get::<_, String>(1)?)?),
                    request_id,
                    status: TransactionStatus::parse(&status_raw)
                        .ok_or_else(|| anyhow!("unknown transaction status: {status_raw}"))?,
                    borrower_id: UserId(parse_ulid(&row.get::<_, String>(4)?)?),
                })
            })?);
        }
        Ok(transactions)
    }

    /// Take the reconciliation lock, failing fast when another run holds it.
    ///
    /// # Errors
    /// Returns an error when the lock is already held or the lock row cannot be written.
    pub fn acquire_run_lock(&mut self, holder: &str, run_kind: &str) -> Result<RunLock> {
        let acquired_at = now_rfc3339()?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO reconciliation_lock(id, holder, run_kind, acquired_at)
                 VALUES (1, ?1, ?2, ?3)",
                params![holder, run_kind, acquired_at],
            )
            .context("failed to write reconciliation lock")?;

        if inserted == 0 {
            let held = self
                .run_lock()?
                .map_or_else(|| "unknown holder".to_string(), |lock| {
                    format!("{} ({} run since {})", lock.holder, lock.run_kind, lock.acquired_at)
                });
            return Err(anyhow!("reconciliation lock is already held by {held}"));
        }

        tracing::info!(holder, run_kind, "acquired reconciliation lock");
        Ok(RunLock { holder: holder.to_string(), run_kind: run_kind.to_string(), acquired_at })
    }

    /// Release the lock if `holder` still owns it. Returns whether a row was removed.
    ///
    /// # Errors
    /// Returns an error when the lock row cannot be deleted.
    pub fn release_run_lock(&mut self, holder: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM reconciliation_lock WHERE id = 1 AND holder = ?1",
                params![holder],
            )
            .context("failed to release reconciliation lock")?;
        if removed == 0 {
            tracing::warn!(holder, "reconciliation lock was not held by this run");
        }
        Ok(removed > 0)
    }

    /// Clear a lock left behind by a crashed run, whoever holds it.
    ///
    /// # Errors
    /// Returns an error when the lock row cannot be read or deleted.
    pub fn force_release_run_lock(&mut self) -> Result<Option<RunLock>> {
        let previous = self.run_lock()?;
        self.conn
            .execute("DELETE FROM reconciliation_lock", [])
            .context("failed to clear reconciliation lock")?;
        if let Some(lock) = &previous {
            tracing::warn!(
                holder = %lock.holder,
                run_kind = %lock.run_kind,
                "cleared reconciliation lock"
            );
        }
        Ok(previous)
    }

    /// # Errors
    /// Returns an error when the lock row cannot be read.
    pub fn run_lock(&self) -> Result<Option<RunLock>> {
        if !table_exists(&self.conn, "reconciliation_lock")? {
            return Ok(None);
        }
        self.conn
            .query_row(
                "SELECT holder, run_kind, acquired_at FROM reconciliation_lock WHERE id = 1",
                [],
                |row| {
                    Ok(RunLock {
                        holder: row.get(0)?,
                        run_kind: row.get(1)?,
                        acquired_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to read reconciliation lock")
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, schema status and lock probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
            run_lock: self.run_lock()?,
        })
    }
}

/// A row whose stored values do not decode into a domain record.
#[derive(Debug, thiserror::Error)]
#[error("malformed {collection} row {id}: {reason}")]
pub struct MalformedRow {
    pub collection: Collection,
    pub id: String,
    pub reason: String,
}

/// Decode one row, tagging any failure with the row's raw id so bad data is
/// never mistaken for a driver failure.
fn decode_row<T>(
    collection: Collection,
    row: &rusqlite::Row<'_>,
    decode: impl FnOnce() -> Result<T>,
) -> Result<T> {
    decode().map_err(|err| {
        let id = match row.get_ref(0) {
            Ok(ValueRef::Text(raw)) => String::from_utf8_lossy(raw).into_owned(),
            Ok(ValueRef::Integer(raw)) => raw.to_string(),
            _ => "<unreadable id>".to_string(),
        };
        let reason = format!("{err:#}");
        tracing::warn!(
            collection = collection.as_str(),
            id = %id,
            reason = %reason,
            "malformed row"
        );
        anyhow::Error::new(MalformedRow { collection, id, reason })
    })
}

fn store_error(err: &anyhow::Error) -> StoreError {
    match err.chain().find_map(|cause| cause.downcast_ref::<MalformedRow>()) {
        Some(row) => StoreError::Malformed {
            collection: row.collection,
            id: row.id.clone(),
            reason: row.reason.clone(),
        },
        None => StoreError::Unavailable(format!("{err:#}")),
    }
}

impl StoreAdapter for SqliteStore {
    fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, StoreError> {
        self.items(filter).map_err(|err| store_error(&err))
    }

    fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, StoreError> {
        self.requests(filter).map_err(|err| store_error(&err))
    }

    fn list_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        self.transactions().map_err(|err| store_error(&err))
    }

    fn match_count(&self, request_id: RequestId) -> Result<u32, StoreError> {
        let count = self
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM matches WHERE request_id = ?1)
                 FROM requests WHERE id = ?1",
                params![request_id.to_string()],
                |row| row.get::<_, u32>(0),
            )
            .optional()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        count.ok_or_else(|| StoreError::NotFound {
            collection: Collection::Requests,
            id: request_id.to_string(),
        })
    }

    fn update_item(&mut self, id: ItemId, fields: &ItemUpdate) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE items SET
                    title = COALESCE(?2, title),
                    listing_type = COALESCE(?3, listing_type),
                    category_tier1 = COALESCE(?4, category_tier1),
                    category_tier2 = COALESCE(?5, category_tier2),
                    category_tier3 = COALESCE(?6, category_tier3),
                    is_other = COALESCE(?7, is_other),
                    is_available = COALESCE(?8, is_available)
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    fields.title,
                    fields.listing_type.map(ListingType::as_str),
                    fields.category_tier1,
                    fields.category_tier2,
                    fields.category_tier3,
                    fields.is_other,
                    fields.is_available,
                ],
            )
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound { collection: Collection::Items, id: id.to_string() });
        }
        Ok(())
    }

    fn update_request(&mut self, id: RequestId, fields: &RequestUpdate) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE requests SET
                    title = COALESCE(?2, title),
                    category_tier1 = COALESCE(?3, category_tier1),
                    category_tier2 = COALESCE(?4, category_tier2),
                    category_tier3 = COALESCE(?5, category_tier3),
                    is_other = COALESCE(?6, is_other),
                    status = COALESCE(?7, status)
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    fields.title,
                    fields.category_tier1,
                    fields.category_tier2,
                    fields.category_tier3,
                    fields.is_other,
                    fields.status.map(RequestStatus::as_str),
                ],
            )
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                collection: Collection::Requests,
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn insert_item(conn: &Connection, item: &Item) -> Result<()> {
    conn.execute(
        "INSERT INTO items(
            id, title, listing_type, category_tier1, category_tier2, category_tier3,
            is_other, custom_item_name, is_available, owner_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            item.id.to_string(),
            item.title,
            item.listing_type.as_str(),
            item.category_tier1,
            item.category_tier2,
            item.category_tier3,
            item.is_other,
            item.custom_item_name,
            item.is_available,
            item.owner_id.to_string(),
        ],
    )
    .with_context(|| format!("failed to insert item {}", item.id))?;
    Ok(())
}

fn insert_request(conn: &Connection, request: &Request) -> Result<()> {
    conn.execute(
        "INSERT INTO requests(
            id, title, category_tier1, category_tier2, category_tier3,
            is_other, custom_need, status, needed_from, requester_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            request.id.to_string(),
            request.title,
            request.category_tier1,
            request.category_tier2,
            request.category_tier3,
            request.is_other,
            request.custom_need,
            request.status.as_str(),
            format_date(request.needed_from),
            request.requester_id.to_string(),
        ],
    )
    .with_context(|| format!("failed to insert request {}", request.id))?;
    Ok(())
}

fn insert_match(conn: &Connection, record: &Match) -> Result<()> {
    conn.execute(
        "INSERT INTO matches(id, request_id, lender_response) VALUES (?1, ?2, ?3)",
        params![
            record.id.to_string(),
            record.request_id.to_string(),
            record.lender_response.as_str(),
        ],
    )
    .with_context(|| format!("failed to insert match {}", record.id))?;
    Ok(())
}

fn insert_transaction(conn: &Connection, txn: &Transaction) -> Result<()> {
    conn.execute(
        "INSERT INTO transactions(id, item_id, request_id, status, borrower_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            txn.id.to_string(),
            txn.item_id.to_string(),
            txn.request_id.map(|id| id.to_string()),
            txn.status.as_str(),
            txn.borrower_id.to_string(),
        ],
    )
    .with_context(|| format!("failed to insert transaction {}", txn.id))?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

#[cfg(test)]
mod tests {
    use share_recon_core::{
        audit, repair_lifecycle, repair_titles, AuditOptions, AuditScope, Correction,
        CorrectionSet, RepairOptions, Taxonomy, TitlePolicy, TitleScope,
    };
    use time::macros::date;
    use time::{Date, Duration};

    use super::*;

    const TODAY: Date = date!(2026 - 03 - 14);

    fn open_migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_item(title: &str, tier3: Option<&str>) -> Item {
        Item {
            id: ItemId::new(),
            title: title.to_string(),
            listing_type: ListingType::Item,
            category_tier1: None,
            category_tier2: None,
            category_tier3: tier3.map(str::to_string),
            is_other: false,
            custom_item_name: None,
            is_available: true,
            owner_id: UserId::new(),
        }
    }

    fn mk_request(title: &str, status: RequestStatus, needed_from: Date) -> Request {
        Request {
            id: RequestId::new(),
            title: title.to_string(),
            category_tier1: Some("Sports & Outdoors".to_string()),
            category_tier2: Some("Camping".to_string()),
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

    #[test]
    fn migrate_creates_latest_schema_and_is_repeatable() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(table_exists(&store.conn, "reconciliation_lock")?);
        Ok(())
    }

    #[test]
    fn migrate_upgrades_a_version_one_database() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.apply_migration(1, MIGRATION_001_SQL)?;
        assert_eq!(store.schema_status()?.pending_versions, vec![2]);

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, 2);
        Ok(())
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let store = open_migrated()?;

        let check_result = store.conn.execute(
            "INSERT INTO requests(id, title, status, needed_from, requester_id)
             VALUES (?1, 'Tent', 'archived', '2026-03-14', ?2)",
            params![RequestId::new().to_string(), UserId::new().to_string()],
        );
        assert!(check_result.is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO matches(id, request_id, lender_response) VALUES (?1, ?2, 'pending')",
            params![MatchId::new().to_string(), RequestId::new().to_string()],
        );
        assert!(fk_result.is_err());
        Ok(())
    }

    #[test]
    fn requests_round_trip_with_relation_counts() -> Result<()> {
        let mut store = open_migrated()?;
        let item = mk_item("Tent", Some("Tent"));
        let request = mk_request("Tent", RequestStatus::Matched, TODAY);
        store.insert_item(&item)?;
        store.insert_request(&request)?;
        for _ in 0..2 {
            store.insert_match(&Match {
                id: MatchId::new(),
                request_id: request.id,
                lender_response: LenderResponse::Pending,
            })?;
        }
        for status in [TransactionStatus::Active, TransactionStatus::Returned] {
            store.insert_transaction(&Transaction {
                id: TransactionId::new(),
                item_id: item.id,
                request_id: Some(request.id),
                status,
                borrower_id: UserId::new(),
            })?;
        }

        let loaded = store.requests(&RequestFilter::default())?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].needed_from, TODAY);
        assert_eq!(loaded[0].match_count, 2);
        assert_eq!(loaded[0].active_transaction_count, 1);
        assert_eq!(store.match_count(request.id).ok(), Some(2));
        assert_eq!(store.items(&ItemFilter::default())?, vec![item]);
        assert_eq!(store.transactions()?.len(), 2);
        Ok(())
    }

    #[test]
    fn filters_apply_to_listings() -> Result<()> {
        let mut store = open_migrated()?;
        let mut hidden = mk_item("Drill", Some("Drill"));
        hidden.is_available = false;
        let mut service = mk_item("Handyman", Some("Handyman"));
        service.listing_type = ListingType::Service;
        store.insert_item(&hidden)?;
        store.insert_item(&service)?;
        store.insert_request(&mk_request("Tent", RequestStatus::Cancelled, TODAY))?;
        store.insert_request(&mk_request("Cooler", RequestStatus::Open, TODAY))?;

        let available = store.items(&ItemFilter { available_only: true, listing_type: None })?;
        assert_eq!(available, vec![service]);
        let items_only = store.items(&ItemFilter {
            available_only: false,
            listing_type: Some(ListingType::Item),
        })?;
        assert_eq!(items_only, vec![hidden]);

        let live = store.requests(&RequestFilter::excluding(&[RequestStatus::Cancelled]))?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].title, "Cooler");
        Ok(())
    }

    #[test]
    fn malformed_rows_are_reported_apart_from_outages() -> Result<()> {
        let store = open_migrated()?;
        store.conn.execute(
            "INSERT INTO requests(id, title, status, needed_from, requester_id)
             VALUES ('legacy-7', 'Tent', 'expired', '14/03/2026', ?1)",
            params![UserId::new().to_string()],
        )?;

        match store.list_requests(&RequestFilter::default()) {
            Err(StoreError::Malformed { collection, id, reason }) => {
                assert_eq!(collection, Collection::Requests);
                assert_eq!(id, "legacy-7");
                assert!(reason.contains("invalid"), "reason was {reason}");
            }
            other => panic!("expected a malformed row error, got {other:?}"),
        }

        let taxonomy = Taxonomy::standard();
        let curated = CorrectionSet::empty();
        let options = AuditOptions {
            scope: AuditScope::Lifecycle,
            item_filter: ItemFilter::default(),
            request_filter: RequestFilter::default(),
            today: TODAY,
            curated: &curated,
            taxonomy: &taxonomy,
        };
        let message = match audit(&store, &options) {
            Err(err) => err.to_string(),
            Ok(report) => panic!("audit should refuse undecodable rows, got {report:?}"),
        };
        assert!(message.contains("malformed requests record legacy-7"), "message was {message}");
        assert!(!message.contains("unavailable"), "message was {message}");
        Ok(())
    }

    #[test]
    fn updates_are_partial_and_report_missing_rows() -> Result<()> {
        let mut store = open_migrated()?;
        let item = mk_item("JBL PartyBox 310 Speaker test", None);
        store.insert_item(&item)?;

        let update = ItemUpdate {
            title: Some("JBL PartyBox 310 Speaker".to_string()),
            category_tier3: Some("PA Speaker".to_string()),
            is_other: Some(false),
            ..ItemUpdate::default()
        };
        store.update_item(item.id, &update).map_err(|err| anyhow!(err))?;
        let loaded = store.items(&ItemFilter::default())?;
        assert_eq!(loaded[0].title, "JBL PartyBox 310 Speaker");
        assert_eq!(loaded[0].category_tier3.as_deref(), Some("PA Speaker"));
        assert_eq!(loaded[0].owner_id, item.owner_id);
        assert!(loaded[0].is_available);

        let missing = store.update_item(ItemId::new(), &update);
        assert!(matches!(missing, Err(StoreError::NotFound { collection: Collection::Items, .. })));
        let missing = store.update_request(
            RequestId::new(),
            &RequestUpdate { status: Some(RequestStatus::Open), ..RequestUpdate::default() },
        );
        assert!(matches!(
            missing,
            Err(StoreError::NotFound { collection: Collection::Requests, .. })
        ));
        assert!(matches!(store.match_count(RequestId::new()), Err(StoreError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn dataset_load_is_all_or_nothing() -> Result<()> {
        let mut store = open_migrated()?;
        let item = mk_item("Tent", Some("Tent"));
        let dataset = Dataset {
            items: vec![item.clone()],
            requests: Vec::new(),
            matches: Vec::new(),
            transactions: vec![Transaction {
                id: TransactionId::new(),
                item_id: ItemId::new(),
                request_id: None,
                status: TransactionStatus::Returned,
                borrower_id: UserId::new(),
            }],
        };
        assert!(store.load_dataset(&dataset).is_err());
        assert_eq!(store.record_counts()?, RecordCounts::default());

        let valid = Dataset { items: vec![item], ..Dataset::default() };
        let loaded = store.load_dataset(&valid)?;
        assert_eq!(loaded.items, 1);
        assert_eq!(store.record_counts()?.items, 1);
        Ok(())
    }

    #[test]
    fn dataset_reads_yaml_and_json() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("share-recon-dataset-{}", Ulid::new()));
        fs::create_dir_all(&dir)?;
        let yaml_path = dir.join("seed.yaml");
        fs::write(
            &yaml_path,
            r#"
items:
  - id: "01J00000000000000000000001"
    title: "Snowboard"
    listing_type: item
    category_tier1: "Sports & Outdoors"
    category_tier2: "Winter Sports"
    category_tier3: "Snowboard"
    custom_item_name: null
    is_available: true
    owner_id: "01J000000000000000000000A1"
requests:
  - id: "01J00000000000000000000002"
    title: "Tent"
    category_tier1: "Sports & Outdoors"
    category_tier2: "Camping"
    category_tier3: "Tent"
    custom_need: null
    status: expired
    needed_from: "2026-03-20"
    requester_id: "01J000000000000000000000A2"
"#,
        )?;
        let from_yaml = Dataset::read(&yaml_path)?;
        assert_eq!(from_yaml.items.len(), 1);
        assert_eq!(from_yaml.requests[0].needed_from, date!(2026 - 03 - 20));

        let json_path = dir.join("seed.json");
        fs::write(&json_path, serde_json::to_string(&from_yaml)?)?;
        assert_eq!(Dataset::read(&json_path)?, from_yaml);

        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup dataset dir {}", dir.display()))?;
        Ok(())
    }

    #[test]
    fn run_lock_rejects_a_second_holder() -> Result<()> {
        let mut store = open_migrated()?;
        store.acquire_run_lock("run-a", "titles")?;

        let second = store.acquire_run_lock("run-b", "lifecycle");
        let Err(err) = second else {
            panic!("second lock acquisition should fail");
        };
        assert!(err.to_string().contains("run-a"), "unexpected error: {err}");

        assert!(!store.release_run_lock("run-b")?);
        assert!(store.release_run_lock("run-a")?);
        assert!(store.run_lock()?.is_none());

        store.acquire_run_lock("crashed", "titles")?;
        let cleared = store.force_release_run_lock()?;
        assert_eq!(cleared.map(|lock| lock.holder), Some("crashed".to_string()));
        store.acquire_run_lock("run-c", "titles")?;
        Ok(())
    }

    #[test]
    fn engine_repairs_through_sqlite_adapter() -> Result<()> {
        let mut store = open_migrated()?;
        let jbl = mk_item("JBL PartyBox 310 Speaker test", None);
        let expired = mk_request("Tent", RequestStatus::Expired, TODAY + Duration::days(1));
        store.insert_item(&jbl)?;
        store.insert_request(&expired)?;
        store.insert_match(&Match {
            id: MatchId::new(),
            request_id: expired.id,
            lender_response: LenderResponse::Accepted,
        })?;
        let txn = Transaction {
            id: TransactionId::new(),
            item_id: jbl.id,
            request_id: None,
            status: TransactionStatus::Returned,
            borrower_id: UserId::new(),
        };
        store.insert_transaction(&txn)?;

        let taxonomy = Taxonomy::standard();
        let corrections = CorrectionSet::new(
            vec![Correction {
                match_title: "JBL PartyBox 310 Speaker test".to_string(),
                new_title: Some("JBL PartyBox 310 Speaker".to_string()),
                listing_type: None,
                category_tier1: "Party & Events".to_string(),
                category_tier2: "Audio & Lighting".to_string(),
                category_tier3: "PA Speaker".to_string(),
            }],
            &taxonomy,
        )?;
        let policy = TitlePolicy { corrections, quarantine: false };

        let titles =
            repair_titles(&mut store, &policy, &TitleScope::default(), RepairOptions::default())?;
        assert_eq!(titles.summary.recategorized, 1);
        let lifecycle = repair_lifecycle(
            &mut store,
            &RequestFilter::default(),
            TODAY,
            RepairOptions::default(),
        )?;
        assert_eq!(lifecycle.summary.status_repaired, 1);
        assert_eq!(store.requests(&RequestFilter::default())?[0].status, RequestStatus::Matched);

        let options = AuditOptions {
            scope: AuditScope::All,
            item_filter: ItemFilter::default(),
            request_filter: RequestFilter::default(),
            today: TODAY,
            curated: &policy.corrections,
            taxonomy: &taxonomy,
        };
        let report = audit(&store, &options)?;
        assert!(!report.needs_repair(), "findings: {:?}", report.findings().collect::<Vec<_>>());
        assert_eq!(store.transactions()?, vec![txn]);
        Ok(())
    }

    #[test]
    fn backup_and_restore_round_trip() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("share-recon-backup-{}", Ulid::new()));
        let backup_path = dir.join("backup.sqlite3");

        let mut store = open_migrated()?;
        store.insert_item(&mk_item("Drill", Some("Drill")))?;
        store.backup_database(&backup_path)?;

        let mut restored = SqliteStore::open(Path::new(":memory:"))?;
        restored.restore_database(&backup_path)?;
        assert_eq!(restored.record_counts()?.items, 1);
        assert_eq!(restored.schema_status()?.current_version, LATEST_SCHEMA_VERSION);

        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup backup dir {}", dir.display()))?;
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = open_migrated()?;
        store.acquire_run_lock("integrity-test", "titles")?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        assert_eq!(report.run_lock.map(|lock| lock.holder), Some("integrity-test".to_string()));
        Ok(())
    }
}
