//! Durable queue of pending mutations.
//!
//! Every mutating action that cannot be (or has not yet been) confirmed
//! by the server lives here. The id assigned at enqueue time is stable
//! across retries and doubles as the idempotency key the backend
//! deduplicates on, so a retry can never duplicate an action.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Bump when the on-disk schema changes incompatibly.
const SCHEMA_VERSION: i64 = 1;

/// Status of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
  /// Waiting to be drained.
  Pending,
  /// Currently being submitted; excluded from drains until resolved.
  InFlight,
  /// Terminal failure. Kept for explicit operator resolution, never
  /// retried automatically.
  Dead,
}

impl ActionStatus {
  fn as_str(&self) -> &'static str {
    match self {
      ActionStatus::Pending => "pending",
      ActionStatus::InFlight => "in_flight",
      ActionStatus::Dead => "dead",
    }
  }

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(ActionStatus::Pending),
      "in_flight" => Ok(ActionStatus::InFlight),
      "dead" => Ok(ActionStatus::Dead),
      other => Err(eyre!("Unknown action status '{}'", other)),
    }
  }
}

/// A not-yet-synced mutation recorded by the queue.
#[derive(Debug, Clone)]
pub struct PendingAction {
  pub id: Uuid,
  pub kind: String,
  pub payload: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub status: ActionStatus,
  pub retry_count: u32,
  pub last_error: Option<String>,
}

/// Retry/backoff tuning for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Transient failures beyond this count dead-letter the action.
  pub max_retries: u32,
  /// Base backoff delay in seconds; doubles per retry.
  pub base_delay_secs: u64,
  /// Backoff ceiling in seconds.
  pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_delay_secs: 30,
      max_delay_secs: 3600,
    }
  }
}

impl RetryPolicy {
  /// Delay before an action that failed `retry_count` times becomes
  /// eligible again: `base * 2^retry_count`, capped.
  fn backoff_delay_secs(&self, retry_count: u32) -> u64 {
    let factor = 1u64 << retry_count.min(20);
    self
      .base_delay_secs
      .saturating_mul(factor)
      .min(self.max_delay_secs)
  }
}

/// Derived counts over the queue's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  pub pending: u64,
  pub in_flight: u64,
  pub dead: u64,
}

/// SQLite-backed pending action queue.
pub struct ActionQueue {
  conn: Mutex<Connection>,
  policy: RetryPolicy,
}

impl ActionQueue {
  /// Open the queue at the default location.
  pub fn open(policy: RetryPolicy) -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    Self::open_at(&path, policy)
  }

  /// Open the queue at an explicit path.
  pub fn open_at(path: &Path, policy: RetryPolicy) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    let queue = Self {
      conn: Mutex::new(conn),
      policy,
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ledgersync").join("queue.db"))
  }

  /// Run migrations, wiping the queue on an incompatible schema version.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    if version != 0 && version != SCHEMA_VERSION {
      conn
        .execute_batch(
          "DROP TABLE IF EXISTS pending_actions;
           DROP TABLE IF EXISTS sync_meta;",
        )
        .map_err(|e| eyre!("Failed to wipe outdated queue schema: {}", e))?;
    }

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

    Ok(())
  }

  /// Record a mutation. Durable before return: a crash immediately after
  /// `enqueue` leaves exactly one copy of the action in the log.
  pub fn enqueue(&self, kind: &str, payload: &[u8]) -> Result<Uuid> {
    let id = Uuid::new_v4();
    self.enqueue_with_id(id, kind, payload)?;
    Ok(id)
  }

  /// Record a mutation under a caller-assigned id. Used when an
  /// immediate network attempt already spent that id as its idempotency
  /// key, so the queued retry deduplicates against it server-side.
  pub fn enqueue_with_id(&self, id: Uuid, kind: &str, payload: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_actions (id, kind, payload, created_at, status)
         VALUES (?, ?, ?, ?, 'pending')",
        params![id.to_string(), kind, payload, now_timestamp()],
      )
      .map_err(|e| eyre!("Failed to enqueue action: {}", e))?;

    Ok(())
  }

  /// Oldest-first batch of actions eligible for submission: pending
  /// status, backoff elapsed. In-flight and dead actions never appear.
  pub fn peek_batch(&self, limit: usize) -> Result<Vec<PendingAction>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, kind, payload, created_at, status, retry_count, last_error
         FROM pending_actions
         WHERE status = 'pending'
           AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?",
      )
      .map_err(|e| eyre!("Failed to prepare batch query: {}", e))?;

    let actions = stmt
      .query_map(params![now_timestamp(), limit as i64], row_to_action)
      .map_err(|e| eyre!("Failed to query batch: {}", e))?
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| eyre!("Failed to read batch row: {}", e))?;

    Ok(actions)
  }

  /// Mark an action as being submitted, excluding it from further
  /// `peek_batch` calls until it resolves.
  pub fn mark_in_flight(&self, id: Uuid) -> Result<()> {
    self.set_status(id, ActionStatus::InFlight)
  }

  /// The server confirmed the action: remove it from the durable log.
  pub fn mark_synced(&self, id: Uuid) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM pending_actions WHERE id = ?",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to remove synced action: {}", e))?;

    Ok(())
  }

  /// Record a transient failure: bump the retry count and either gate
  /// the action behind its backoff delay or dead-letter it once retries
  /// are exhausted.
  pub fn mark_failed(&self, id: Uuid, error: &str) -> Result<ActionStatus> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let retry_count: Option<u32> = conn
      .query_row(
        "SELECT retry_count FROM pending_actions WHERE id = ?",
        params![id.to_string()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read retry count: {}", e))?;

    let retry_count = retry_count.ok_or_else(|| eyre!("No queued action with id {}", id))?;
    let new_count = retry_count + 1;

    if new_count > self.policy.max_retries {
      conn
        .execute(
          "UPDATE pending_actions
           SET status = 'dead', retry_count = ?, last_error = ?, next_attempt_at = NULL
           WHERE id = ?",
          params![new_count, error, id.to_string()],
        )
        .map_err(|e| eyre!("Failed to dead-letter action: {}", e))?;
      return Ok(ActionStatus::Dead);
    }

    let delay = self.policy.backoff_delay_secs(retry_count);
    let next_attempt = (Utc::now() + chrono::Duration::seconds(delay as i64))
      .to_rfc3339_opts(SecondsFormat::Micros, true);

    conn
      .execute(
        "UPDATE pending_actions
         SET status = 'pending', retry_count = ?, last_error = ?, next_attempt_at = ?
         WHERE id = ?",
        params![new_count, error, next_attempt, id.to_string()],
      )
      .map_err(|e| eyre!("Failed to record transient failure: {}", e))?;

    Ok(ActionStatus::Pending)
  }

  /// Permanent failure (validation rejection): dead-letter immediately
  /// without consuming retries.
  pub fn mark_dead(&self, id: Uuid, error: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE pending_actions
         SET status = 'dead', last_error = ?, next_attempt_at = NULL
         WHERE id = ?",
        params![error, id.to_string()],
      )
      .map_err(|e| eyre!("Failed to dead-letter action: {}", e))?;

    Ok(())
  }

  /// Return interrupted in-flight actions to pending. Called when a
  /// drain cycle aborts and at startup to recover from a crash.
  pub fn revert_in_flight(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let reverted = conn
      .execute(
        "UPDATE pending_actions SET status = 'pending' WHERE status = 'in_flight'",
        [],
      )
      .map_err(|e| eyre!("Failed to revert in-flight actions: {}", e))?;

    Ok(reverted)
  }

  /// All dead-lettered actions, oldest first.
  pub fn dead_letters(&self) -> Result<Vec<PendingAction>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, kind, payload, created_at, status, retry_count, last_error
         FROM pending_actions
         WHERE status = 'dead'
         ORDER BY created_at ASC, rowid ASC",
      )
      .map_err(|e| eyre!("Failed to prepare dead-letter query: {}", e))?;

    let actions = stmt
      .query_map([], row_to_action)
      .map_err(|e| eyre!("Failed to query dead letters: {}", e))?
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| eyre!("Failed to read dead-letter row: {}", e))?;

    Ok(actions)
  }

  /// Operator resolution: put a dead-lettered action back in the queue
  /// with a clean retry budget.
  pub fn retry_dead(&self, id: Uuid) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let updated = conn
      .execute(
        "UPDATE pending_actions
         SET status = 'pending', retry_count = 0, last_error = NULL, next_attempt_at = NULL
         WHERE id = ? AND status = 'dead'",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to retry dead-lettered action: {}", e))?;

    if updated == 0 {
      return Err(eyre!("No dead-lettered action with id {}", id));
    }
    Ok(())
  }

  /// Operator resolution: drop a dead-lettered action for good.
  pub fn discard_dead(&self, id: Uuid) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute(
        "DELETE FROM pending_actions WHERE id = ? AND status = 'dead'",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to discard dead-lettered action: {}", e))?;

    if deleted == 0 {
      return Err(eyre!("No dead-lettered action with id {}", id));
    }
    Ok(())
  }

  /// Remove everything, including dead letters.
  pub fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM pending_actions", [])
      .map_err(|e| eyre!("Failed to clear queue: {}", e))?;

    Ok(())
  }

  /// Derived counts for status reporting.
  pub fn counts(&self) -> Result<QueueCounts> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT status, COUNT(*) FROM pending_actions GROUP BY status")
      .map_err(|e| eyre!("Failed to prepare counts query: {}", e))?;

    let mut counts = QueueCounts::default();
    let rows = stmt
      .query_map([], |row| {
        let status: String = row.get(0)?;
        let count: u64 = row.get(1)?;
        Ok((status, count))
      })
      .map_err(|e| eyre!("Failed to query counts: {}", e))?;

    for row in rows {
      let (status, count) = row.map_err(|e| eyre!("Failed to read counts row: {}", e))?;
      match ActionStatus::from_str(&status)? {
        ActionStatus::Pending => counts.pending = count,
        ActionStatus::InFlight => counts.in_flight = count,
        ActionStatus::Dead => counts.dead = count,
      }
    }

    Ok(counts)
  }

  /// When the last drain cycle completed, surviving restarts.
  pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM sync_meta WHERE key = 'last_sync_time'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read last sync time: {}", e))?;

    match value {
      Some(s) => Ok(Some(parse_timestamp(&s)?)),
      None => Ok(None),
    }
  }

  pub fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES ('last_sync_time', ?)",
        params![at.to_rfc3339_opts(SecondsFormat::Micros, true)],
      )
      .map_err(|e| eyre!("Failed to store last sync time: {}", e))?;

    Ok(())
  }

  fn set_status(&self, id: Uuid, status: ActionStatus) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let updated = conn
      .execute(
        "UPDATE pending_actions SET status = ? WHERE id = ?",
        params![status.as_str(), id.to_string()],
      )
      .map_err(|e| eyre!("Failed to update action status: {}", e))?;

    if updated == 0 {
      return Err(eyre!("No queued action with id {}", id));
    }
    Ok(())
  }
}

/// Schema for queue tables.
const QUEUE_SCHEMA: &str = r#"
-- Durable log of not-yet-synced mutations
CREATE TABLE IF NOT EXISTS pending_actions (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_actions_drain
    ON pending_actions(status, created_at);

-- Small key/value store for engine metadata
CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingAction> {
  use rusqlite::types::Type;

  let id: String = row.get(0)?;
  let id = Uuid::parse_str(&id)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

  let created_at: String = row.get(3)?;
  let created_at = DateTime::parse_from_rfc3339(&created_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

  let status: String = row.get(4)?;
  let status = ActionStatus::from_str(&status).map_err(|_| {
    rusqlite::Error::FromSqlConversionFailure(
      4,
      Type::Text,
      format!("unknown status '{}'", status).into(),
    )
  })?;

  Ok(PendingAction {
    id,
    kind: row.get(1)?,
    payload: row.get(2)?,
    created_at,
    status,
    retry_count: row.get(5)?,
    last_error: row.get(6)?,
  })
}

fn now_timestamp() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}
