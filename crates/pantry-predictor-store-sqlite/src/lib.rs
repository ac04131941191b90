#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use pantry_predictor_core::{
    anniversary_weekday, apply_event, classify_stock, days_between, forecast_at,
    format_timestamp, init_state, normalize_feedback, now_utc, parse_timestamp, project_state,
    CategoryId, CategoryPrior, CategoryPriorTable, Event, EventId, EventInput, EventKind,
    Forecast, HouseholdId, PredictorError, PredictorState, ProductId, StockState, TrashReason,
    STALE_WINDOW_HOURS,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

const PREDICTOR_MIGRATION_VERSION: i64 = 1;
/// Events older than the newest applied timestamp by more than this window
/// are rejected as stale.
const STALE_WINDOW: Duration = Duration::hours(STALE_WINDOW_HOURS);
const STORAGE_RETRY_ATTEMPTS: u32 = 3;
const STORAGE_RETRY_BASE_MS: u64 = 25;
/// Minimum gap between weekly ticks for one key.
const WEEKLY_TICK_MIN_GAP_DAYS: f64 = 6.0;

const SCHEMA_PREDICTOR_V1: &str = r"
CREATE TABLE IF NOT EXISTS category_priors (
  category_id TEXT PRIMARY KEY,
  mean_days REAL NOT NULL CHECK (mean_days >= 0.5),
  mad_days REAL NOT NULL CHECK (mad_days >= 0.0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS predictor_state (
  household_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  cycle_mean_days REAL NOT NULL CHECK (cycle_mean_days >= 0.5),
  cycle_mad_days REAL NOT NULL CHECK (cycle_mad_days >= 0.0),
  cycle_started_at TEXT,
  last_purchase_at TEXT,
  last_pred_days_left REAL NOT NULL CHECK (last_pred_days_left >= 0.0),
  n_completed_cycles INTEGER NOT NULL CHECK (n_completed_cycles >= 0),
  n_censored_cycles INTEGER NOT NULL CHECK (n_censored_cycles >= 0),
  n_strong_updates INTEGER NOT NULL CHECK (n_strong_updates >= 0),
  n_total_updates INTEGER NOT NULL CHECK (n_total_updates >= 0),
  last_update_at TEXT NOT NULL,
  category_id TEXT,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  last_event_seq INTEGER NOT NULL,
  last_seen_at TEXT NOT NULL,
  PRIMARY KEY (household_id, product_id)
);

CREATE TABLE IF NOT EXISTS event_log (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  idempotency_key TEXT NOT NULL UNIQUE,
  payload_hash TEXT NOT NULL,
  household_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  category_id TEXT,
  kind TEXT NOT NULL CHECK (
    kind IN (
      'purchase',
      'repurchase',
      'empty',
      'trash',
      'adjust_feedback',
      'consume',
      'manual_set',
      'weekly_tick',
      'reset'
    )
  ),
  reason TEXT CHECK (reason IN ('TASTE','EXPIRED','RAN_OUT','OTHER') OR reason IS NULL),
  direction TEXT CHECK (direction IN ('MORE','LESS') OR direction IS NULL),
  delta_days REAL,
  ratio REAL,
  days_left_target REAL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  out_of_order INTEGER NOT NULL DEFAULT 0 CHECK (out_of_order IN (0, 1)),
  days_left_before REAL NOT NULL,
  days_left_after REAL NOT NULL,
  mean_before REAL NOT NULL,
  mean_after REAL NOT NULL,
  note TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_event_log_no_update
BEFORE UPDATE ON event_log
BEGIN
  SELECT RAISE(FAIL, 'event_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_event_log_no_delete
BEFORE DELETE ON event_log
BEGIN
  SELECT RAISE(FAIL, 'event_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_event_log_key_seq
  ON event_log(household_id, product_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_event_log_key_kind_seq
  ON event_log(household_id, product_id, kind, event_seq);

CREATE TABLE IF NOT EXISTS inventory_projection (
  household_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  days_left REAL NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('EMPTY','LOW','MEDIUM','FULL','UNKNOWN')),
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  last_source TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (household_id, product_id)
);

CREATE TABLE IF NOT EXISTS forecast_log (
  forecast_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  forecast_id TEXT NOT NULL UNIQUE,
  household_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  generated_at TEXT NOT NULL,
  expected_days_left REAL NOT NULL,
  predicted_state TEXT NOT NULL CHECK (predicted_state IN ('EMPTY','LOW','MEDIUM','FULL','UNKNOWN')),
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  trigger_event_id TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_forecast_log_no_update
BEFORE UPDATE ON forecast_log
BEGIN
  SELECT RAISE(FAIL, 'forecast_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_forecast_log_no_delete
BEFORE DELETE ON forecast_log
BEGIN
  SELECT RAISE(FAIL, 'forecast_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_forecast_log_key_generated
  ON forecast_log(household_id, product_id, generated_at);

CREATE TABLE IF NOT EXISTS deleted_keys (
  household_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  deleted_at TEXT NOT NULL,
  PRIMARY KEY (household_id, product_id)
);

CREATE TABLE IF NOT EXISTS reconciler_runs (
  utc_day TEXT PRIMARY KEY,
  started_at TEXT NOT NULL,
  keys_swept INTEGER NOT NULL,
  ticks_applied INTEGER NOT NULL
);
";

pub struct SqlitePredictorStore {
    conn: Connection,
}

/// Outcome of one accepted (or idempotently replayed) event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReceipt {
    pub event_id: String,
    pub event_seq: i64,
    pub household_id: String,
    pub product_id: String,
    pub kind: String,
    pub occurred_at: String,
    pub days_left_before: f64,
    pub days_left_after: f64,
    pub stock_state: StockState,
    pub out_of_order: bool,
    /// True when this delivery matched a previously applied idempotency key
    /// and the recorded outcome was returned without reapplying.
    pub replayed: bool,
}

/// Predictor state plus the store-level replay cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    #[serde(flatten)]
    pub state: PredictorState,
    pub last_event_seq: i64,
    pub last_seen_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub event_seq: i64,
    pub event_id: String,
    pub idempotency_key: String,
    pub payload_hash: String,
    pub household_id: String,
    pub product_id: String,
    pub category_id: Option<String>,
    pub kind: String,
    pub reason: Option<String>,
    pub direction: Option<String>,
    pub delta_days: Option<f64>,
    pub ratio: Option<f64>,
    pub days_left_target: Option<f64>,
    pub occurred_at: String,
    pub recorded_at: String,
    pub out_of_order: bool,
    pub days_left_before: f64,
    pub days_left_after: f64,
    pub mean_before: f64,
    pub mean_after: f64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastRow {
    pub forecast_seq: i64,
    pub forecast_id: String,
    pub household_id: String,
    pub product_id: String,
    pub generated_at: String,
    pub expected_days_left: f64,
    pub predicted_state: StockState,
    pub confidence: f64,
    pub trigger_event_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeeklyTickReport {
    pub utc_day: String,
    pub already_ran: bool,
    pub keys_swept: usize,
    pub ticks_applied: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReplayReport {
    pub projected_keys: usize,
    pub processed_events: usize,
    pub last_event_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProjectorStatus {
    pub latest_event_seq: i64,
    pub tracked_keys: usize,
    pub state_rows: usize,
    pub stale_state_rows: usize,
    pub keys_with_events_no_state_row: usize,
    pub state_rows_without_events: usize,
    pub max_stale_seq_gap: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectorIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProjectorIssue {
    pub code: String,
    pub severity: ProjectorIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProjectorCheck {
    pub healthy: bool,
    pub status: ProjectorStatus,
    pub issues: Vec<ProjectorIssue>,
}

struct StoredState {
    state: PredictorState,
    last_seen_at: OffsetDateTime,
}

impl SqlitePredictorStore {
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

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_PREDICTOR_V1)
            .context("failed to apply predictor schema")?;

        let now = format_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PREDICTOR_MIGRATION_VERSION, now],
            )
            .context("failed to register predictor schema migration")?;

        self.seed_canonical_priors()?;
        Ok(())
    }

    /// Seeds the canonical category prior table on an empty database. The
    /// table is immutable afterwards; reruns are no-ops.
    fn seed_canonical_priors(&self) -> Result<()> {
        let existing: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM category_priors", [], |row| row.get(0))
            .context("failed to count category priors")?;
        if existing > 0 {
            return Ok(());
        }

        let now = format_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let canonical = CategoryPriorTable::canonical();
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO category_priors(category_id, mean_days, mad_days, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for name in [
            "Dairy & Eggs",
            "Bread & Bakery",
            "Meat & Poultry",
            "Fish & Seafood",
            "Fruits",
            "Vegetables",
            "Grains & Pasta",
            "Canned & Jarred",
            "Condiments & Sauces",
            "Snacks",
            "Beverages",
            "Frozen Foods",
            "Spices & Seasonings",
        ] {
            let id = CategoryId(name.to_string());
            let prior = canonical.lookup(Some(&id));
            stmt.execute(params![name, prior.mean_days, prior.mad_days, now])?;
        }
        Ok(())
    }

    pub fn priors(&self) -> Result<CategoryPriorTable> {
        query_priors(&self.conn).map_err(|err| anyhow!(err.to_string()))
    }

    // -----------------------------------------------------------------------
    // Submit pipeline
    // -----------------------------------------------------------------------

    /// Validates and applies one event: idempotency and stale checks, the
    /// pure transition, then one transaction covering the log append, state
    /// upsert, inventory projection, and conditional forecast snapshot.
    pub fn submit_event(&mut self, input: &EventInput) -> Result<SubmitReceipt, PredictorError> {
        let event = input.validate()?;
        let payload = serde_json::to_value(input)
            .map_err(|err| PredictorError::Internal(format!("payload serialization: {err}")))?;
        let payload_hash = hash_payload(&payload);
        self.submit_with_retry(&event, &payload_hash)
    }

    pub fn reset(
        &mut self,
        household_id: &str,
        product_id: &str,
    ) -> Result<SubmitReceipt, PredictorError> {
        let household = HouseholdId(household_id.to_string());
        let product = ProductId(product_id.to_string());
        if query_is_deleted(&self.conn, &household, &product)? {
            return Err(PredictorError::UnknownEntity(format!(
                "{household_id}:{product_id} was deleted"
            )));
        }
        if load_stored_state(&self.conn, &household, &product)?.is_none() {
            return Err(PredictorError::UnknownEntity(format!(
                "no predictor state for {household_id}:{product_id}"
            )));
        }

        let event = Event {
            idempotency_key: format!("reset:{household_id}:{product_id}:{}", Ulid::new()),
            household_id: household,
            product_id: product,
            category_id: None,
            occurred_at: now_utc(),
            kind: EventKind::Reset,
            note: Some("operator reset".to_string()),
        };
        let payload = serde_json::to_value(&event)
            .map_err(|err| PredictorError::Internal(format!("payload serialization: {err}")))?;
        let payload_hash = hash_payload(&payload);
        self.submit_with_retry(&event, &payload_hash)
    }

    fn submit_with_retry(
        &mut self,
        event: &Event,
        payload_hash: &str,
    ) -> Result<SubmitReceipt, PredictorError> {
        let mut attempt = 0;
        loop {
            match self.apply_validated(event, payload_hash) {
                Err(err) if err.is_retriable() && attempt + 1 < STORAGE_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let backoff_ms = STORAGE_RETRY_BASE_MS << attempt;
                    tracing::warn!(
                        key = %event.key(),
                        attempt,
                        backoff_ms,
                        "retrying event submit after storage failure"
                    );
                    std::thread::sleep(StdDuration::from_millis(backoff_ms));
                }
                other => return other,
            }
        }
    }

    fn apply_validated(
        &mut self,
        event: &Event,
        payload_hash: &str,
    ) -> Result<SubmitReceipt, PredictorError> {
        // IMMEDIATE so the idempotency/state reads and the writes below are
        // one atomic unit against writers on other connections.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;

        if query_is_deleted(&tx, &event.household_id, &event.product_id)? {
            return Err(PredictorError::UnknownEntity(format!(
                "{} was deleted",
                event.key()
            )));
        }

        if let Some(prior_entry) = query_by_idempotency_key(&tx, &event.idempotency_key)? {
            if prior_entry.payload_hash == payload_hash {
                tracing::debug!(
                    key = %event.key(),
                    idempotency_key = %event.idempotency_key,
                    "idempotent re-delivery, returning recorded outcome"
                );
                return Ok(receipt_from_log_entry(&prior_entry, true));
            }
            return Err(PredictorError::Conflict(format!(
                "idempotency key {:?} was already used with a different payload",
                event.idempotency_key
            )));
        }

        let priors = query_priors(&tx)?;

        let stored = load_stored_state(&tx, &event.household_id, &event.product_id)?;
        let (state, last_seen_at) = match stored {
            Some(stored) => (stored.state, Some(stored.last_seen_at)),
            None => (
                init_state(
                    event.household_id.clone(),
                    event.product_id.clone(),
                    event.category_id.clone(),
                    &priors,
                    event.occurred_at,
                ),
                None,
            ),
        };

        let mut out_of_order = false;
        if let Some(last_seen) = last_seen_at {
            if event.occurred_at < last_seen - STALE_WINDOW {
                return Err(PredictorError::StaleEvent(format!(
                    "event at {} is older than the last applied timestamp {} by more than 24h",
                    event.occurred_at, last_seen
                )));
            }
            out_of_order = event.occurred_at < last_seen;
        }

        let applied = apply_event(&state, event, &priors).map_err(|err| {
            if matches!(err, PredictorError::Internal(_)) {
                tracing::error!(
                    key = %event.key(),
                    error = %err,
                    state = ?state,
                    "invariant violation, aborting event without mutation"
                );
            }
            err
        })?;
        let new_last_seen = match last_seen_at {
            Some(last_seen) => last_seen.max(event.occurred_at),
            None => event.occurred_at,
        };

        let event_id = EventId::new();
        let recorded_at = now_utc();
        let occurred_at_text = format_timestamp(event.occurred_at)?;
        let recorded_at_text = format_timestamp(recorded_at)?;
        let (reason, direction, delta_days, ratio, days_left_target) = kind_columns(&event.kind);

        tx.execute(
            "INSERT INTO event_log(
                event_id, idempotency_key, payload_hash, household_id, product_id,
                category_id, kind, reason, direction, delta_days, ratio,
                days_left_target, occurred_at, recorded_at, out_of_order,
                days_left_before, days_left_after, mean_before, mean_after, note
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20
             )",
            params![
                event_id.to_string(),
                event.idempotency_key,
                payload_hash,
                event.household_id.0,
                event.product_id.0,
                event.category_id.as_ref().map(|id| id.0.clone()),
                event.kind.name(),
                reason,
                direction,
                delta_days,
                ratio,
                days_left_target,
                occurred_at_text,
                recorded_at_text,
                i64::from(out_of_order),
                applied.days_left_before,
                applied.days_left_after,
                applied.mean_before,
                applied.mean_after,
                event.note,
            ],
        )
        .map_err(storage_err)?;

        let event_seq = tx.last_insert_rowid();

        upsert_state(&tx, &applied.state, event_seq, new_last_seen)?;
        upsert_inventory_projection(
            &tx,
            &applied.state,
            applied.days_left_after,
            applied.stock_after,
            event.kind.name(),
            recorded_at,
        )?;

        if applied.forecast_changed {
            tx.execute(
                "INSERT INTO forecast_log(
                    forecast_id, household_id, product_id, generated_at,
                    expected_days_left, predicted_state, confidence, trigger_event_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Ulid::new().to_string(),
                    event.household_id.0,
                    event.product_id.0,
                    occurred_at_text,
                    applied.days_left_after,
                    applied.stock_after.as_str(),
                    applied.state.confidence,
                    event_id.to_string(),
                ],
            )
            .map_err(storage_err)?;
        }

        tx.commit().map_err(storage_err)?;

        tracing::info!(
            key = %event.key(),
            kind = event.kind.name(),
            event_seq,
            days_left = applied.days_left_after,
            stock = %applied.stock_after,
            "event applied"
        );

        Ok(SubmitReceipt {
            event_id: event_id.to_string(),
            event_seq,
            household_id: event.household_id.0.clone(),
            product_id: event.product_id.0.clone(),
            kind: event.kind.name().to_string(),
            occurred_at: occurred_at_text,
            days_left_before: applied.days_left_before,
            days_left_after: applied.days_left_after,
            stock_state: applied.stock_after,
            out_of_order,
            replayed: false,
        })
    }

    // -----------------------------------------------------------------------
    // Read paths
    // -----------------------------------------------------------------------

    /// Read-only forecast at `at_time` (default now). Never mutates state.
    pub fn forecast(
        &self,
        household_id: &str,
        product_id: &str,
        at_time: Option<OffsetDateTime>,
    ) -> Result<Forecast, PredictorError> {
        let household = HouseholdId(household_id.to_string());
        let product = ProductId(product_id.to_string());
        if query_is_deleted(&self.conn, &household, &product)? {
            return Err(PredictorError::UnknownEntity(format!(
                "{household_id}:{product_id} was deleted"
            )));
        }
        let stored = load_stored_state(&self.conn, &household, &product)?.ok_or_else(|| {
            PredictorError::UnknownEntity(format!(
                "no predictor state for {household_id}:{product_id}"
            ))
        })?;
        Ok(forecast_at(&stored.state, at_time.unwrap_or_else(now_utc)))
    }

    pub fn get_state(&self, household_id: &str, product_id: &str) -> Result<Option<StateSnapshot>> {
        query_state_snapshot(&self.conn, household_id, product_id)
            .map_err(|err| anyhow!(err.to_string()))
    }

    pub fn list_events_for_key(
        &self,
        household_id: &str,
        product_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>> {
        let mut query = "SELECT
                event_seq, event_id, idempotency_key, payload_hash, household_id,
                product_id, category_id, kind, reason, direction, delta_days, ratio,
                days_left_target, occurred_at, recorded_at, out_of_order,
                days_left_before, days_left_after, mean_before, mean_after, note
             FROM event_log
             WHERE household_id = ?1 AND product_id = ?2
             ORDER BY event_seq ASC"
            .to_string();
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![household_id, product_id], parse_log_entry_row)?;
        collect_rows(rows)
    }

    pub fn list_forecasts_for_key(
        &self,
        household_id: &str,
        product_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ForecastRow>> {
        let mut query = "SELECT
                forecast_seq, forecast_id, household_id, product_id, generated_at,
                expected_days_left, predicted_state, confidence, trigger_event_id
             FROM forecast_log
             WHERE household_id = ?1 AND product_id = ?2
             ORDER BY forecast_seq DESC"
            .to_string();
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![household_id, product_id], |row| {
            let predicted_raw: String = row.get(6)?;
            Ok(ForecastRow {
                forecast_seq: row.get(0)?,
                forecast_id: row.get(1)?,
                household_id: row.get(2)?,
                product_id: row.get(3)?,
                generated_at: row.get(4)?,
                expected_days_left: row.get(5)?,
                predicted_state: StockState::parse(&predicted_raw).unwrap_or(StockState::Unknown),
                confidence: row.get(7)?,
                trigger_event_id: row.get(8)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Recomputes the decayed forecast for every key of a household and
    /// rewrites the inventory projection. Learning state is untouched, so
    /// the log stays authoritative.
    pub fn refresh_forecasts(&mut self, household_id: &str, now: OffsetDateTime) -> Result<usize> {
        let keys = self.keys_for_household(household_id)?;
        let mut refreshed = 0_usize;

        for (household, product) in keys {
            let Some(stored) =
                load_stored_state(&self.conn, &household, &product).map_err(promote_anyhow)?
            else {
                continue;
            };
            let forecast = forecast_at(&stored.state, now);
            let tx = self.conn.transaction()?;
            upsert_inventory_projection(
                &tx,
                &stored.state,
                forecast.expected_days_left,
                forecast.predicted_state,
                "refresh",
                now,
            )
            .map_err(promote_anyhow)?;
            tx.commit()?;
            refreshed += 1;
        }

        Ok(refreshed)
    }

    // -----------------------------------------------------------------------
    // Weekly anniversary reconciler
    // -----------------------------------------------------------------------

    /// Daily sweep: on each key's anniversary weekday, routes a synthesised
    /// WEEKLY_TICK through the normal submit pipeline. Idempotent for the
    /// UTC day.
    pub fn run_weekly_tick(&mut self, now: OffsetDateTime) -> Result<WeeklyTickReport> {
        let utc_day = now.date().to_string();
        let already: Option<String> = self
            .conn
            .query_row(
                "SELECT utc_day FROM reconciler_runs WHERE utc_day = ?1",
                params![utc_day],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Ok(WeeklyTickReport {
                utc_day,
                already_ran: true,
                keys_swept: 0,
                ticks_applied: 0,
                failures: 0,
            });
        }

        let keys = self.all_state_keys()?;
        let mut keys_swept = 0_usize;
        let mut ticks_applied = 0_usize;
        let mut failures = 0_usize;

        for (household, product) in keys {
            keys_swept += 1;

            let Some(first_at) = self.first_event_at(&household, &product)? else {
                continue;
            };
            if anniversary_weekday(first_at) != now.weekday() {
                continue;
            }
            if let Some(last_tick_at) = self.last_tick_at(&household, &product)? {
                if days_between(now, last_tick_at) < WEEKLY_TICK_MIN_GAP_DAYS {
                    continue;
                }
            }

            let input = EventInput {
                idempotency_key: format!("weekly-tick:{household}:{product}:{utc_day}"),
                household_id: household.0.clone(),
                product_id: product.0.clone(),
                category_id: None,
                timestamp: format_timestamp(now).map_err(|err| anyhow!(err.to_string()))?,
                kind: "weekly_tick".to_string(),
                reason: None,
                direction: None,
                delta_days: None,
                ratio: None,
                days_left_target: None,
                note: None,
            };

            match self.submit_event(&input) {
                Ok(receipt) if !receipt.replayed => ticks_applied += 1,
                Ok(_) => {}
                Err(err) => {
                    failures += 1;
                    tracing::error!(
                        household = %household,
                        product = %product,
                        error = %err,
                        "weekly tick failed for key, continuing sweep"
                    );
                }
            }
        }

        let started_at = format_timestamp(now).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO reconciler_runs(utc_day, started_at, keys_swept, ticks_applied)
                 VALUES (?1, ?2, ?3, ?4)",
                params![utc_day, started_at, keys_swept as i64, ticks_applied as i64],
            )
            .context("failed to record reconciler run")?;

        Ok(WeeklyTickReport { utc_day, already_ran: false, keys_swept, ticks_applied, failures })
    }

    // -----------------------------------------------------------------------
    // Replay & projector maintenance
    // -----------------------------------------------------------------------

    /// Rebuilds every predictor state row by folding its event log from the
    /// empty state. The log is authoritative; this is the recovery path.
    pub fn replay(&mut self) -> Result<ReplayReport> {
        let keys = self.keys_with_any_events()?;
        let priors = self.priors()?;
        let mut projected_keys = 0_usize;
        let mut processed_events = 0_usize;

        for (household, product) in keys {
            if query_is_deleted(&self.conn, &household, &product).map_err(promote_anyhow)? {
                continue;
            }
            let entries = self.list_events_for_key(&household.0, &product.0, None)?;
            processed_events += entries.len();

            let events = entries
                .iter()
                .map(event_from_log_entry)
                .collect::<Result<Vec<_>, _>>()
                .map_err(promote_anyhow)?;

            let Some(state) = project_state(&events, &priors)
                .map_err(|err| anyhow!("failed projecting {household}:{product}: {err}"))?
            else {
                continue;
            };

            let last_event_seq = entries.last().map_or(0, |entry| entry.event_seq);
            let last_seen_at = events
                .iter()
                .map(|event| event.occurred_at)
                .max()
                .unwrap_or(state.last_update_at);

            let days_left = state.last_pred_days_left;
            let stock = state.stock_state();
            let tx = self.conn.transaction()?;
            upsert_state(&tx, &state, last_event_seq, last_seen_at).map_err(promote_anyhow)?;
            upsert_inventory_projection(&tx, &state, days_left, stock, "replay", now_utc())
                .map_err(promote_anyhow)?;
            tx.commit()?;
            projected_keys += 1;
        }

        let last_event_seq = self.latest_event_seq()?.unwrap_or(0);
        Ok(ReplayReport { projected_keys, processed_events, last_event_seq })
    }

    pub fn projector_status(&self) -> Result<ProjectorStatus> {
        let latest_event_seq = self.latest_event_seq()?.unwrap_or(0);
        let tracked_keys: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT household_id, product_id FROM event_log)",
            [],
            |row| row.get(0),
        )?;
        let state_rows: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM predictor_state", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT events.max_event_seq, state.last_event_seq
             FROM (
                SELECT household_id, product_id, MAX(event_seq) AS max_event_seq
                FROM event_log
                GROUP BY household_id, product_id
             ) events
             LEFT JOIN predictor_state state
               ON state.household_id = events.household_id
              AND state.product_id = events.product_id
             WHERE state.last_event_seq IS NULL OR state.last_event_seq < events.max_event_seq",
        )?;
        let mut rows = stmt.query([])?;
        let mut stale_state_rows = 0_usize;
        let mut keys_with_events_no_state_row = 0_usize;
        let mut max_stale_seq_gap = 0_i64;
        while let Some(row) = rows.next()? {
            let max_event_seq: i64 = row.get(0)?;
            let projected: Option<i64> = row.get(1)?;
            stale_state_rows += 1;
            if projected.is_none() {
                keys_with_events_no_state_row += 1;
            }
            max_stale_seq_gap = max_stale_seq_gap.max(max_event_seq - projected.unwrap_or(0));
        }

        let state_rows_without_events: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM predictor_state state
             LEFT JOIN (
                SELECT DISTINCT household_id, product_id FROM event_log
             ) events
               ON events.household_id = state.household_id
              AND events.product_id = state.product_id
             WHERE events.household_id IS NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(ProjectorStatus {
            latest_event_seq,
            tracked_keys: usize::try_from(tracked_keys).unwrap_or(0),
            state_rows: usize::try_from(state_rows).unwrap_or(0),
            stale_state_rows,
            keys_with_events_no_state_row,
            state_rows_without_events: usize::try_from(state_rows_without_events).unwrap_or(0),
            max_stale_seq_gap,
        })
    }

    pub fn projector_check(&self) -> Result<ProjectorCheck> {
        let status = self.projector_status()?;
        let mut issues = Vec::new();

        if status.stale_state_rows > 0 {
            issues.push(ProjectorIssue {
                code: "stale_state_rows".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "stale state rows detected: {} keys behind the log head",
                    status.stale_state_rows
                ),
            });
        }
        if status.keys_with_events_no_state_row > 0 {
            issues.push(ProjectorIssue {
                code: "missing_state_rows".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "{} keys have events but no state row; run replay",
                    status.keys_with_events_no_state_row
                ),
            });
        }
        if status.state_rows_without_events > 0 {
            issues.push(ProjectorIssue {
                code: "orphan_state_rows".to_string(),
                severity: ProjectorIssueSeverity::Warning,
                message: format!(
                    "{} state rows have no events behind them",
                    status.state_rows_without_events
                ),
            });
        }

        let healthy =
            !issues.iter().any(|issue| issue.severity == ProjectorIssueSeverity::Error);
        Ok(ProjectorCheck { healthy, status, issues })
    }

    /// Tombstones a key after external deletion of the household or product.
    /// The append-only log is retained; new events are rejected as unknown.
    pub fn delete_key(&mut self, household_id: &str, product_id: &str) -> Result<bool> {
        let now = format_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO deleted_keys(household_id, product_id, deleted_at)
             VALUES (?1, ?2, ?3)",
            params![household_id, product_id, now],
        )?;
        let removed = tx.execute(
            "DELETE FROM predictor_state WHERE household_id = ?1 AND product_id = ?2",
            params![household_id, product_id],
        )?;
        tx.execute(
            "DELETE FROM inventory_projection WHERE household_id = ?1 AND product_id = ?2",
            params![household_id, product_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // -----------------------------------------------------------------------
    // Internal lookups
    // -----------------------------------------------------------------------

    fn first_event_at(
        &self,
        household: &HouseholdId,
        product: &ProductId,
    ) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT occurred_at FROM event_log
                 WHERE household_id = ?1 AND product_id = ?2
                 ORDER BY event_seq ASC LIMIT 1",
                params![household.0, product.0],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(parse_timestamp(&raw).map_err(promote_anyhow)?)),
            None => Ok(None),
        }
    }

    fn last_tick_at(
        &self,
        household: &HouseholdId,
        product: &ProductId,
    ) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT occurred_at FROM event_log
                 WHERE household_id = ?1 AND product_id = ?2 AND kind = 'weekly_tick'
                 ORDER BY event_seq DESC LIMIT 1",
                params![household.0, product.0],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(parse_timestamp(&raw).map_err(promote_anyhow)?)),
            None => Ok(None),
        }
    }

    fn all_state_keys(&self) -> Result<Vec<(HouseholdId, ProductId)>> {
        let mut stmt = self.conn.prepare(
            "SELECT household_id, product_id FROM predictor_state
             ORDER BY household_id ASC, product_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((HouseholdId(row.get(0)?), ProductId(row.get(1)?)))
        })?;
        collect_rows(rows)
    }

    fn keys_for_household(&self, household_id: &str) -> Result<Vec<(HouseholdId, ProductId)>> {
        let mut stmt = self.conn.prepare(
            "SELECT household_id, product_id FROM predictor_state
             WHERE household_id = ?1
             ORDER BY product_id ASC",
        )?;
        let rows = stmt.query_map(params![household_id], |row| {
            Ok((HouseholdId(row.get(0)?), ProductId(row.get(1)?)))
        })?;
        collect_rows(rows)
    }

    fn keys_with_any_events(&self) -> Result<Vec<(HouseholdId, ProductId)>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT household_id, product_id FROM event_log
             ORDER BY household_id ASC, product_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((HouseholdId(row.get(0)?), ProductId(row.get(1)?)))
        })?;
        collect_rows(rows)
    }

    fn latest_event_seq(&self) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row("SELECT MAX(event_seq) FROM event_log", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to query latest event_seq")?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Row <-> domain helpers
// ---------------------------------------------------------------------------

fn query_is_deleted(
    conn: &Connection,
    household: &HouseholdId,
    product: &ProductId,
) -> Result<bool, PredictorError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT deleted_at FROM deleted_keys WHERE household_id = ?1 AND product_id = ?2",
            params![household.0, product.0],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    Ok(found.is_some())
}

fn query_by_idempotency_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<LogEntry>, PredictorError> {
    conn.prepare(
        "SELECT
            event_seq, event_id, idempotency_key, payload_hash, household_id,
            product_id, category_id, kind, reason, direction, delta_days, ratio,
            days_left_target, occurred_at, recorded_at, out_of_order,
            days_left_before, days_left_after, mean_before, mean_after, note
         FROM event_log
         WHERE idempotency_key = ?1",
    )
    .map_err(storage_err)?
    .query_row(params![key], parse_log_entry_row)
    .optional()
    .map_err(storage_err)
}

fn query_state_snapshot(
    conn: &Connection,
    household_id: &str,
    product_id: &str,
) -> Result<Option<StateSnapshot>, PredictorError> {
    conn.prepare(
        "SELECT household_id, product_id, cycle_mean_days, cycle_mad_days,
                cycle_started_at, last_purchase_at, last_pred_days_left,
                n_completed_cycles, n_censored_cycles, n_strong_updates,
                n_total_updates, last_update_at, category_id, confidence,
                last_event_seq, last_seen_at
         FROM predictor_state
         WHERE household_id = ?1 AND product_id = ?2",
    )
    .map_err(storage_err)?
    .query_row(params![household_id, product_id], parse_state_snapshot_row)
    .optional()
    .map_err(storage_err)
}

fn load_stored_state(
    conn: &Connection,
    household: &HouseholdId,
    product: &ProductId,
) -> Result<Option<StoredState>, PredictorError> {
    let Some(snapshot) = query_state_snapshot(conn, &household.0, &product.0)? else {
        return Ok(None);
    };
    let last_seen_at = parse_timestamp(&snapshot.last_seen_at)?;
    Ok(Some(StoredState { state: snapshot.state, last_seen_at }))
}

fn query_priors(conn: &Connection) -> Result<CategoryPriorTable, PredictorError> {
    let mut stmt = conn
        .prepare("SELECT category_id, mean_days, mad_days FROM category_priors")
        .map_err(storage_err)?;
    let mut rows = stmt.query([]).map_err(storage_err)?;
    let mut map = std::collections::BTreeMap::new();
    while let Some(row) = rows.next().map_err(storage_err)? {
        let id: String = row.get(0).map_err(storage_err)?;
        let mean_days: f64 = row.get(1).map_err(storage_err)?;
        let mad_days: f64 = row.get(2).map_err(storage_err)?;
        map.insert(CategoryId(id), CategoryPrior { mean_days, mad_days });
    }
    CategoryPriorTable::new(map)
}

fn hash_payload(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn storage_err(err: rusqlite::Error) -> PredictorError {
    PredictorError::StorageFailure(err.to_string())
}

fn promote_anyhow(err: PredictorError) -> anyhow::Error {
    anyhow!(err.to_string())
}

fn kind_columns(
    kind: &EventKind,
) -> (Option<&'static str>, Option<&'static str>, Option<f64>, Option<f64>, Option<f64>) {
    match kind {
        EventKind::Trash { reason } => (Some(reason.as_str()), None, None, None, None),
        EventKind::AdjustFeedback { direction } => {
            (None, Some(direction.as_str()), None, None, None)
        }
        EventKind::Consume { delta_days, ratio } => (None, None, *delta_days, *ratio, None),
        EventKind::ManualSet { days_left_target } => {
            (None, None, None, None, Some(*days_left_target))
        }
        EventKind::Purchase
        | EventKind::Repurchase
        | EventKind::Empty
        | EventKind::WeeklyTick
        | EventKind::Reset => (None, None, None, None, None),
    }
}

fn receipt_from_log_entry(entry: &LogEntry, replayed: bool) -> SubmitReceipt {
    SubmitReceipt {
        event_id: entry.event_id.clone(),
        event_seq: entry.event_seq,
        household_id: entry.household_id.clone(),
        product_id: entry.product_id.clone(),
        kind: entry.kind.clone(),
        occurred_at: entry.occurred_at.clone(),
        days_left_before: entry.days_left_before,
        days_left_after: entry.days_left_after,
        stock_state: classify_stock(entry.days_left_after, entry.mean_after),
        out_of_order: entry.out_of_order,
        replayed,
    }
}

/// Rebuilds the typed event a log entry recorded, for replay.
fn event_from_log_entry(entry: &LogEntry) -> Result<Event, PredictorError> {
    let kind = match entry.kind.as_str() {
        "purchase" => EventKind::Purchase,
        "repurchase" => EventKind::Repurchase,
        "empty" => EventKind::Empty,
        "trash" => {
            let raw = entry.reason.as_deref().ok_or_else(|| {
                PredictorError::Internal(format!(
                    "log entry {} is a trash event without a reason",
                    entry.event_seq
                ))
            })?;
            let reason = TrashReason::parse(raw).ok_or_else(|| {
                PredictorError::Internal(format!(
                    "log entry {} carries unknown trash reason {raw:?}",
                    entry.event_seq
                ))
            })?;
            EventKind::Trash { reason }
        }
        "adjust_feedback" => {
            let raw = entry.direction.as_deref().ok_or_else(|| {
                PredictorError::Internal(format!(
                    "log entry {} is a feedback event without a direction",
                    entry.event_seq
                ))
            })?;
            EventKind::AdjustFeedback { direction: normalize_feedback(raw)? }
        }
        "consume" => EventKind::Consume { delta_days: entry.delta_days, ratio: entry.ratio },
        "manual_set" => {
            let target = entry.days_left_target.ok_or_else(|| {
                PredictorError::Internal(format!(
                    "log entry {} is a manual_set event without a target",
                    entry.event_seq
                ))
            })?;
            EventKind::ManualSet { days_left_target: target }
        }
        "weekly_tick" => EventKind::WeeklyTick,
        "reset" => EventKind::Reset,
        other => {
            return Err(PredictorError::Internal(format!(
                "log entry {} carries unknown kind {other:?}",
                entry.event_seq
            )));
        }
    };

    Ok(Event {
        idempotency_key: entry.idempotency_key.clone(),
        household_id: HouseholdId(entry.household_id.clone()),
        product_id: ProductId(entry.product_id.clone()),
        category_id: entry.category_id.clone().map(CategoryId),
        occurred_at: parse_timestamp(&entry.occurred_at)?,
        kind,
        note: entry.note.clone(),
    })
}

fn upsert_state(
    tx: &rusqlite::Transaction<'_>,
    state: &PredictorState,
    last_event_seq: i64,
    last_seen_at: OffsetDateTime,
) -> Result<(), PredictorError> {
    let cycle_started_at = state.cycle_started_at.map(format_timestamp).transpose()?;
    let last_purchase_at = state.last_purchase_at.map(format_timestamp).transpose()?;
    tx.execute(
        "INSERT INTO predictor_state(
            household_id, product_id, cycle_mean_days, cycle_mad_days,
            cycle_started_at, last_purchase_at, last_pred_days_left,
            n_completed_cycles, n_censored_cycles, n_strong_updates,
            n_total_updates, last_update_at, category_id, confidence,
            last_event_seq, last_seen_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(household_id, product_id) DO UPDATE SET
            cycle_mean_days = excluded.cycle_mean_days,
            cycle_mad_days = excluded.cycle_mad_days,
            cycle_started_at = excluded.cycle_started_at,
            last_purchase_at = excluded.last_purchase_at,
            last_pred_days_left = excluded.last_pred_days_left,
            n_completed_cycles = excluded.n_completed_cycles,
            n_censored_cycles = excluded.n_censored_cycles,
            n_strong_updates = excluded.n_strong_updates,
            n_total_updates = excluded.n_total_updates,
            last_update_at = excluded.last_update_at,
            category_id = excluded.category_id,
            confidence = excluded.confidence,
            last_event_seq = excluded.last_event_seq,
            last_seen_at = excluded.last_seen_at",
        params![
            state.household_id.0,
            state.product_id.0,
            state.cycle_mean_days,
            state.cycle_mad_days,
            cycle_started_at,
            last_purchase_at,
            state.last_pred_days_left,
            i64::from(state.n_completed_cycles),
            i64::from(state.n_censored_cycles),
            i64::from(state.n_strong_updates),
            i64::from(state.n_total_updates),
            format_timestamp(state.last_update_at)?,
            state.category_id.as_ref().map(|id| id.0.clone()),
            state.confidence,
            last_event_seq,
            format_timestamp(last_seen_at)?,
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn upsert_inventory_projection(
    tx: &rusqlite::Transaction<'_>,
    state: &PredictorState,
    days_left: f64,
    stock: StockState,
    last_source: &str,
    updated_at: OffsetDateTime,
) -> Result<(), PredictorError> {
    tx.execute(
        "INSERT INTO inventory_projection(
            household_id, product_id, days_left, state, confidence, last_source, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(household_id, product_id) DO UPDATE SET
            days_left = excluded.days_left,
            state = excluded.state,
            confidence = excluded.confidence,
            last_source = excluded.last_source,
            updated_at = excluded.updated_at",
        params![
            state.household_id.0,
            state.product_id.0,
            days_left,
            stock.as_str(),
            state.confidence,
            last_source,
            format_timestamp(updated_at)?,
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn parse_state_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateSnapshot> {
    let cycle_started_at: Option<String> = row.get(4)?;
    let last_purchase_at: Option<String> = row.get(5)?;
    let last_update_at: String = row.get(11)?;
    let category_id: Option<String> = row.get(12)?;

    let parse_opt = |value: Option<String>, index: usize| -> rusqlite::Result<Option<OffsetDateTime>> {
        value
            .map(|raw| {
                parse_timestamp(&raw).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        index,
                        rusqlite::types::Type::Text,
                        Box::new(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            err.to_string(),
                        )),
                    )
                })
            })
            .transpose()
    };

    let state = PredictorState {
        household_id: HouseholdId(row.get(0)?),
        product_id: ProductId(row.get(1)?),
        cycle_mean_days: row.get(2)?,
        cycle_mad_days: row.get(3)?,
        cycle_started_at: parse_opt(cycle_started_at, 4)?,
        last_purchase_at: parse_opt(last_purchase_at, 5)?,
        last_pred_days_left: row.get(6)?,
        n_completed_cycles: u32::try_from(row.get::<_, i64>(7)?).unwrap_or(0),
        n_censored_cycles: u32::try_from(row.get::<_, i64>(8)?).unwrap_or(0),
        n_strong_updates: u32::try_from(row.get::<_, i64>(9)?).unwrap_or(0),
        n_total_updates: u32::try_from(row.get::<_, i64>(10)?).unwrap_or(0),
        last_update_at: parse_opt(Some(last_update_at), 11)?.unwrap_or_else(now_utc),
        category_id: category_id.map(CategoryId),
        confidence: row.get(13)?,
    };

    Ok(StateSnapshot { state, last_event_seq: row.get(14)?, last_seen_at: row.get(15)? })
}

fn parse_log_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        event_seq: row.get(0)?,
        event_id: row.get(1)?,
        idempotency_key: row.get(2)?,
        payload_hash: row.get(3)?,
        household_id: row.get(4)?,
        product_id: row.get(5)?,
        category_id: row.get(6)?,
        kind: row.get(7)?,
        reason: row.get(8)?,
        direction: row.get(9)?,
        delta_days: row.get(10)?,
        ratio: row.get(11)?,
        days_left_target: row.get(12)?,
        occurred_at: row.get(13)?,
        recorded_at: row.get(14)?,
        out_of_order: row.get::<_, i64>(15)? != 0,
        days_left_before: row.get(16)?,
        days_left_after: row.get(17)?,
        mean_before: row.get(18)?,
        mean_after: row.get(19)?,
        note: row.get(20)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("failed to read row")?);
    }
    Ok(items)
}
