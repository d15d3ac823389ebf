//! Cache store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::policy::{Partition, PartitionPolicy};

/// Bump when the on-disk schema changes incompatibly. A mismatch wipes
/// and rebuilds the store; cached data is always refetchable.
const SCHEMA_VERSION: i64 = 1;

/// Generation tag a partition starts out with.
const INITIAL_GENERATION: &str = "v1";

/// A single cached entry with its metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache store backends.
///
/// Readers always see the partition's active generation at call time;
/// `rotate` swaps generations atomically so no response can mix entries
/// from two generations.
pub trait CacheStore: Send + Sync {
  /// Look up an entry in the partition's active generation.
  fn get(&self, partition: Partition, key: &str) -> Result<Option<CacheEntry>>;

  /// Store or overwrite an entry in the active generation.
  fn put(&self, partition: Partition, key: &str, payload: &[u8]) -> Result<()>;

  /// Remove a single entry.
  fn delete(&self, partition: Partition, key: &str) -> Result<()>;

  /// Remove entries exceeding the partition's age or count limits.
  /// Eviction is oldest `stored_at` first. Returns how many were removed.
  fn sweep(&self, partition: Partition, policy: &PartitionPolicy) -> Result<usize>;

  /// Switch the partition to a new generation. Entries under the old
  /// generation become unreachable immediately; `collect_garbage`
  /// reclaims them later.
  fn rotate(&self, partition: Partition, generation: &str) -> Result<()>;

  /// Delete entries whose generation is no longer active anywhere.
  fn collect_garbage(&self) -> Result<usize>;
}

/// Store that persists nothing. All reads miss, all writes are discarded.
/// Used when caching is disabled.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn get(&self, _partition: Partition, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _partition: Partition, _key: &str, _payload: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _partition: Partition, _key: &str) -> Result<()> {
    Ok(())
  }

  fn sweep(&self, _partition: Partition, _policy: &PartitionPolicy) -> Result<usize> {
    Ok(0)
  }

  fn rotate(&self, _partition: Partition, _generation: &str) -> Result<()> {
    Ok(())
  }

  fn collect_garbage(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    Self::open_at(&path)
  }

  /// Open the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ledgersync").join("cache.db"))
  }

  /// Run migrations, wiping the store on an incompatible schema version.
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
          "DROP TABLE IF EXISTS cache_entries;
           DROP TABLE IF EXISTS cache_generations;",
        )
        .map_err(|e| eyre!("Failed to wipe outdated cache schema: {}", e))?;
    }

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

    // Every partition must have an active generation row so reads and
    // garbage collection agree on what is live.
    for partition in Partition::ALL {
      conn
        .execute(
          "INSERT OR IGNORE INTO cache_generations (partition, generation) VALUES (?, ?)",
          params![partition.as_str(), INITIAL_GENERATION],
        )
        .map_err(|e| eyre!("Failed to seed generation for {}: {}", partition.as_str(), e))?;
    }

    Ok(())
  }

  fn active_generation(conn: &Connection, partition: Partition) -> Result<String> {
    conn
      .query_row(
        "SELECT generation FROM cache_generations WHERE partition = ?",
        params![partition.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("No active generation for {}: {}", partition.as_str(), e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Cached payloads, keyed within a partition generation
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    generation TEXT NOT NULL,
    key TEXT NOT NULL,
    payload BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (partition, generation, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(partition, generation, stored_at);

-- Active generation per partition
CREATE TABLE IF NOT EXISTS cache_generations (
    partition TEXT PRIMARY KEY,
    generation TEXT NOT NULL
);
"#;

impl CacheStore for SqliteStore {
  fn get(&self, partition: Partition, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let generation = Self::active_generation(&conn, partition)?;

    let result: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT payload, stored_at FROM cache_entries
         WHERE partition = ? AND generation = ? AND key = ?",
        params![partition.as_str(), generation, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match result {
      Some((payload, stored_at)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        payload,
        stored_at: parse_timestamp(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, partition: Partition, key: &str, payload: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let generation = Self::active_generation(&conn, partition)?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (partition, generation, key, payload, stored_at)
         VALUES (?, ?, ?, ?, ?)",
        params![partition.as_str(), generation, key, payload, now_timestamp()],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn delete(&self, partition: Partition, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let generation = Self::active_generation(&conn, partition)?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND generation = ? AND key = ?",
        params![partition.as_str(), generation, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(())
  }

  fn sweep(&self, partition: Partition, policy: &PartitionPolicy) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let generation = Self::active_generation(&conn, partition)?;

    let cutoff = (Utc::now() - policy.max_age()).to_rfc3339_opts(SecondsFormat::Micros, true);
    let expired = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE partition = ? AND generation = ? AND stored_at < ?",
        params![partition.as_str(), generation, cutoff],
      )
      .map_err(|e| eyre!("Failed to sweep expired entries: {}", e))?;

    // Keep the newest max_entries, evict the rest oldest-first.
    let evicted = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE partition = ?1 AND generation = ?2 AND key IN (
           SELECT key FROM cache_entries
           WHERE partition = ?1 AND generation = ?2
           ORDER BY stored_at DESC
           LIMIT -1 OFFSET ?3
         )",
        params![partition.as_str(), generation, policy.max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to evict over-limit entries: {}", e))?;

    Ok(expired + evicted)
  }

  fn rotate(&self, partition: Partition, generation: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Single-row update: readers see either the old generation or the
    // new one in full, never a mix.
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_generations (partition, generation) VALUES (?, ?)",
        params![partition.as_str(), generation],
      )
      .map_err(|e| eyre!("Failed to rotate partition {}: {}", partition.as_str(), e))?;

    Ok(())
  }

  fn collect_garbage(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE NOT EXISTS (
           SELECT 1 FROM cache_generations g
           WHERE g.partition = cache_entries.partition
             AND g.generation = cache_entries.generation
         )",
        [],
      )
      .map_err(|e| eyre!("Failed to collect orphaned cache entries: {}", e))?;

    Ok(removed)
  }
}

fn now_timestamp() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp as stored by this module.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open_at(&dir.path().join("cache.db")).unwrap()
  }

  fn backdate(store: &SqliteStore, key: &str, seconds: i64) {
    let conn = store.conn.lock().unwrap();
    let stored_at =
      (Utc::now() - chrono::Duration::seconds(seconds)).to_rfc3339_opts(SecondsFormat::Micros, true);
    conn
      .execute(
        "UPDATE cache_entries SET stored_at = ? WHERE key = ?",
        params![stored_at, key],
      )
      .unwrap();
  }

  #[test]
  fn test_put_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Api, "invoices", b"[1,2,3]").unwrap();
    let entry = store.get(Partition::Api, "invoices").unwrap().unwrap();
    assert_eq!(entry.payload, b"[1,2,3]");
    assert_eq!(entry.key, "invoices");
  }

  #[test]
  fn test_keys_are_scoped_per_partition() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Api, "logo", b"api").unwrap();
    store.put(Partition::Images, "logo", b"image").unwrap();

    let api = store.get(Partition::Api, "logo").unwrap().unwrap();
    let image = store.get(Partition::Images, "logo").unwrap().unwrap();
    assert_eq!(api.payload, b"api");
    assert_eq!(image.payload, b"image");
  }

  #[test]
  fn test_put_overwrites() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Api, "k", b"old").unwrap();
    store.put(Partition::Api, "k", b"new").unwrap();
    let entry = store.get(Partition::Api, "k").unwrap().unwrap();
    assert_eq!(entry.payload, b"new");
  }

  #[test]
  fn test_delete() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Api, "k", b"v").unwrap();
    store.delete(Partition::Api, "k").unwrap();
    assert!(store.get(Partition::Api, "k").unwrap().is_none());
  }

  #[test]
  fn test_rotate_hides_previous_generation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Static, "shell", b"old-shell").unwrap();
    store.rotate(Partition::Static, "v2").unwrap();

    // Old generation is unreachable even before garbage collection.
    assert!(store.get(Partition::Static, "shell").unwrap().is_none());

    store.put(Partition::Static, "shell", b"new-shell").unwrap();
    let entry = store.get(Partition::Static, "shell").unwrap().unwrap();
    assert_eq!(entry.payload, b"new-shell");
  }

  #[test]
  fn test_collect_garbage_removes_orphaned_generations() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Static, "a", b"1").unwrap();
    store.put(Partition::Static, "b", b"2").unwrap();
    store.rotate(Partition::Static, "v2").unwrap();
    store.put(Partition::Static, "a", b"3").unwrap();

    let removed = store.collect_garbage().unwrap();
    assert_eq!(removed, 2);

    // The live generation is untouched.
    assert!(store.get(Partition::Static, "a").unwrap().is_some());
  }

  #[test]
  fn test_sweep_evicts_expired_entries() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Api, "fresh", b"1").unwrap();
    store.put(Partition::Api, "old", b"2").unwrap();
    backdate(&store, "old", 7200);

    let policy = PartitionPolicy {
      max_entries: 100,
      max_age_seconds: 3600,
    };
    let removed = store.sweep(Partition::Api, &policy).unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(Partition::Api, "old").unwrap().is_none());
    assert!(store.get(Partition::Api, "fresh").unwrap().is_some());
  }

  #[test]
  fn test_sweep_evicts_oldest_beyond_max_entries() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(Partition::Api, "oldest", b"1").unwrap();
    store.put(Partition::Api, "middle", b"2").unwrap();
    store.put(Partition::Api, "newest", b"3").unwrap();
    backdate(&store, "oldest", 300);
    backdate(&store, "middle", 200);

    let policy = PartitionPolicy {
      max_entries: 2,
      max_age_seconds: 86400,
    };
    let removed = store.sweep(Partition::Api, &policy).unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(Partition::Api, "oldest").unwrap().is_none());
    assert!(store.get(Partition::Api, "middle").unwrap().is_some());
    assert!(store.get(Partition::Api, "newest").unwrap().is_some());
  }

  #[test]
  fn test_noop_store_never_hits() {
    let store = NoopStore;
    store.put(Partition::Api, "k", b"v").unwrap();
    assert!(store.get(Partition::Api, "k").unwrap().is_none());
  }
}
