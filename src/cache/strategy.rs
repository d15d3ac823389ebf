//! Resource cache strategies that wrap a network fetch with cache reads
//! and writes.
//!
//! Read strategies never throw on network failure: when no cached
//! fallback exists they return a synthesized offline response with a
//! distinguishable status, so callers can render a degraded state
//! predictably. Only successful (2xx) responses are ever cached.

use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::queue::ActionQueue;

use super::policy::Partition;
use super::store::{CacheEntry, CacheStore};

/// Status used for synthesized offline responses.
const OFFLINE_STATUS: u16 = 503;

/// A response fetched from the network.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl FetchedResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Where a strategy's payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from the network.
  Network,
  /// Served from the cache store.
  Cache,
  /// Served from the cache store while a background refresh is in flight.
  Stale,
  /// No network and no cached fallback. Nothing was written to the cache.
  Offline,
}

/// Result of running a read strategy.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
  pub status: u16,
  pub payload: Vec<u8>,
  pub source: ResponseSource,
}

impl StrategyOutcome {
  fn from_network(response: FetchedResponse) -> Self {
    Self {
      status: response.status,
      payload: response.body,
      source: ResponseSource::Network,
    }
  }

  fn from_cache(entry: CacheEntry, source: ResponseSource) -> Self {
    Self {
      status: 200,
      payload: entry.payload,
      source,
    }
  }

  fn offline() -> Self {
    Self {
      status: OFFLINE_STATUS,
      payload: Vec::new(),
      source: ResponseSource::Offline,
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == ResponseSource::Offline
  }
}

/// Outcome of a mutating call under the queue-backed strategy.
#[derive(Debug)]
pub enum MutationOutcome {
  /// The server applied the mutation.
  Applied(FetchedResponse),
  /// The server rejected the mutation outright (4xx). Not queued:
  /// retrying an invalid request cannot succeed.
  Rejected(FetchedResponse),
  /// The mutation could not reach the server and now sits in the
  /// pending queue under the returned id.
  Queued { id: Uuid },
}

/// Derive a stable, fixed-length cache key from a resource identifier.
pub fn cache_key(identifier: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(identifier.trim().as_bytes());
  hex::encode(hasher.finalize())
}

/// Cache-first: return the cached entry if present, else fetch and cache.
///
/// Used for static assets where any cached copy is good enough.
pub async fn cache_first<F, Fut>(
  store: &dyn CacheStore,
  partition: Partition,
  key: &str,
  fetch: F,
) -> StrategyOutcome
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<FetchedResponse>>,
{
  if let Some(entry) = read_cache(store, partition, key) {
    return StrategyOutcome::from_cache(entry, ResponseSource::Cache);
  }

  match fetch().await {
    Ok(response) => {
      if response.is_success() {
        write_cache(store, partition, key, &response.body);
      }
      StrategyOutcome::from_network(response)
    }
    Err(e) => {
      warn!(key, "cache-first fetch failed with no cached fallback: {}", e);
      StrategyOutcome::offline()
    }
  }
}

/// Network-first: fetch and cache; on network failure fall back to the
/// cached entry, else to a synthesized offline response.
///
/// Used for API reads and navigable pages where freshness matters.
pub async fn network_first<F, Fut>(
  store: &dyn CacheStore,
  partition: Partition,
  key: &str,
  fetch: F,
) -> StrategyOutcome
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<FetchedResponse>>,
{
  match fetch().await {
    Ok(response) => {
      if response.is_success() {
        write_cache(store, partition, key, &response.body);
      }
      StrategyOutcome::from_network(response)
    }
    Err(e) => match read_cache(store, partition, key) {
      Some(entry) => {
        warn!(key, "network-first fetch failed, serving cache: {}", e);
        StrategyOutcome::from_cache(entry, ResponseSource::Cache)
      }
      None => {
        warn!(key, "network-first fetch failed with no cached fallback: {}", e);
        StrategyOutcome::offline()
      }
    },
  }
}

/// Stale-while-revalidate: return the cached entry immediately and
/// refresh the cache from the network in a background task. Without a
/// cached entry the caller waits on the network fetch.
///
/// Default strategy for uncategorized reads.
pub async fn stale_while_revalidate<F, Fut>(
  store: Arc<dyn CacheStore>,
  partition: Partition,
  key: &str,
  fetch: F,
) -> StrategyOutcome
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<FetchedResponse>> + Send + 'static,
{
  if let Some(entry) = read_cache(store.as_ref(), partition, key) {
    let key = key.to_string();
    let future = fetch();
    tokio::spawn(async move {
      match future.await {
        Ok(response) if response.is_success() => {
          write_cache(store.as_ref(), partition, &key, &response.body);
        }
        Ok(response) => {
          warn!(key = %key, status = response.status, "revalidation returned an error response");
        }
        Err(e) => {
          warn!(key = %key, "revalidation fetch failed: {}", e);
        }
      }
    });
    return StrategyOutcome::from_cache(entry, ResponseSource::Stale);
  }

  match fetch().await {
    Ok(response) => {
      if response.is_success() {
        write_cache(store.as_ref(), partition, key, &response.body);
      }
      StrategyOutcome::from_network(response)
    }
    Err(e) => {
      warn!(key, "fetch failed with no cached fallback: {}", e);
      StrategyOutcome::offline()
    }
  }
}

/// Network-only-with-queue: attempt a mutating request; when it cannot
/// reach the server, record it durably in the pending queue instead of
/// failing the caller. Mutations never touch the read cache here.
///
/// The action id is assigned up front and handed to the fetcher as the
/// idempotency key. A queued retry reuses the same id, so a submission
/// whose response was lost in transit cannot apply twice.
pub async fn network_only_with_queue<F, Fut>(
  queue: &ActionQueue,
  kind: &str,
  payload: &[u8],
  fetch: F,
) -> Result<MutationOutcome>
where
  F: FnOnce(Uuid) -> Fut,
  Fut: Future<Output = Result<FetchedResponse>>,
{
  let id = Uuid::new_v4();

  match fetch(id).await {
    Ok(response) if response.is_success() => Ok(MutationOutcome::Applied(response)),
    Ok(response) if (400..500).contains(&response.status) => {
      Ok(MutationOutcome::Rejected(response))
    }
    Ok(response) => {
      warn!(kind, status = response.status, "mutation failed transiently, queueing");
      queue.enqueue_with_id(id, kind, payload)?;
      Ok(MutationOutcome::Queued { id })
    }
    Err(e) => {
      warn!(kind, "mutation could not reach the server, queueing: {}", e);
      queue.enqueue_with_id(id, kind, payload)?;
      Ok(MutationOutcome::Queued { id })
    }
  }
}

/// Cache reads degrade to a miss on storage failure.
fn read_cache(store: &dyn CacheStore, partition: Partition, key: &str) -> Option<CacheEntry> {
  match store.get(partition, key) {
    Ok(entry) => entry,
    Err(e) => {
      warn!(key, "cache read failed, treating as miss: {}", e);
      None
    }
  }
}

/// Cache writes are fire-and-forget; a failed write must never fail the
/// caller's primary response.
fn write_cache(store: &dyn CacheStore, partition: Partition, key: &str, payload: &[u8]) {
  if let Err(e) = store.put(partition, key, payload) {
    warn!(key, "cache write failed: {}", e);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::{NoopStore, SqliteStore};
  use crate::queue::RetryPolicy;
  use color_eyre::eyre::eyre;
  use tempfile::TempDir;

  fn sqlite_store(dir: &TempDir) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_at(&dir.path().join("cache.db")).unwrap())
  }

  fn ok_response(body: &[u8]) -> Result<FetchedResponse> {
    Ok(FetchedResponse {
      status: 200,
      body: body.to_vec(),
    })
  }

  #[tokio::test]
  async fn test_cache_first_serves_existing_entry_without_fetch() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    store.put(Partition::Static, "k", b"cached").unwrap();

    let outcome = cache_first(store.as_ref(), Partition::Static, "k", || async {
      panic!("fetch must not run on a cache hit")
    })
    .await;

    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(outcome.payload, b"cached");
  }

  #[tokio::test]
  async fn test_cache_first_miss_with_failing_network_is_offline_and_uncached() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);

    let outcome = cache_first(store.as_ref(), Partition::Static, "k", || async {
      Err(eyre!("connection refused"))
    })
    .await;

    assert_eq!(outcome.source, ResponseSource::Offline);
    assert_eq!(outcome.status, 503);
    assert!(store.get(Partition::Static, "k").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_stores_successful_fetch() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);

    let outcome =
      cache_first(store.as_ref(), Partition::Static, "k", || async { ok_response(b"fresh") }).await;

    assert_eq!(outcome.source, ResponseSource::Network);
    let entry = store.get(Partition::Static, "k").unwrap().unwrap();
    assert_eq!(entry.payload, b"fresh");
  }

  #[tokio::test]
  async fn test_error_responses_are_never_cached() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);

    let outcome = network_first(store.as_ref(), Partition::Api, "k", || async {
      Ok(FetchedResponse {
        status: 500,
        body: b"boom".to_vec(),
      })
    })
    .await;

    assert_eq!(outcome.source, ResponseSource::Network);
    assert_eq!(outcome.status, 500);
    assert!(store.get(Partition::Api, "k").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    store.put(Partition::Api, "k", b"cached").unwrap();

    let outcome = network_first(store.as_ref(), Partition::Api, "k", || async {
      Err(eyre!("timed out"))
    })
    .await;

    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(outcome.payload, b"cached");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_returns_cached_without_waiting() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    store.put(Partition::Dynamic, "k", b"stale").unwrap();

    // A fetch that never resolves: the caller must still get the cached
    // payload immediately.
    let outcome = stale_while_revalidate(
      store.clone() as Arc<dyn CacheStore>,
      Partition::Dynamic,
      "k",
      || std::future::pending::<Result<FetchedResponse>>(),
    )
    .await;

    assert_eq!(outcome.source, ResponseSource::Stale);
    assert_eq!(outcome.payload, b"stale");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refreshes_cache_in_background() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    store.put(Partition::Dynamic, "k", b"stale").unwrap();

    let outcome = stale_while_revalidate(
      store.clone() as Arc<dyn CacheStore>,
      Partition::Dynamic,
      "k",
      || async { ok_response(b"refreshed") },
    )
    .await;
    assert_eq!(outcome.payload, b"stale");

    // Wait for the spawned revalidation to land.
    for _ in 0..50 {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      if store.get(Partition::Dynamic, "k").unwrap().unwrap().payload == b"refreshed" {
        return;
      }
    }
    panic!("revalidation never updated the cache");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_waits_on_miss() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);

    let outcome = stale_while_revalidate(
      store.clone() as Arc<dyn CacheStore>,
      Partition::Dynamic,
      "k",
      || async { ok_response(b"first") },
    )
    .await;

    assert_eq!(outcome.source, ResponseSource::Network);
    assert_eq!(outcome.payload, b"first");
  }

  #[tokio::test]
  async fn test_network_only_with_queue_queues_under_the_attempted_id() {
    let dir = TempDir::new().unwrap();
    let queue = ActionQueue::open_at(&dir.path().join("queue.db"), RetryPolicy::default()).unwrap();

    let attempted = Arc::new(std::sync::Mutex::new(None));
    let seen = attempted.clone();
    let outcome = network_only_with_queue(&queue, "create_invoice", b"{}", move |id| {
      *seen.lock().unwrap() = Some(id);
      async move { Err(eyre!("offline")) }
    })
    .await
    .unwrap();

    match outcome {
      MutationOutcome::Queued { id } => {
        // The queued action carries the id the network attempt already
        // used as its idempotency key.
        assert_eq!(*attempted.lock().unwrap(), Some(id));
        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
      }
      other => panic!("expected Queued, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_network_only_with_queue_rejects_validation_failures() {
    let dir = TempDir::new().unwrap();
    let queue = ActionQueue::open_at(&dir.path().join("queue.db"), RetryPolicy::default()).unwrap();

    let outcome = network_only_with_queue(&queue, "create_invoice", b"{}", |_id| async {
      Ok(FetchedResponse {
        status: 422,
        body: b"bad".to_vec(),
      })
    })
    .await
    .unwrap();

    assert!(matches!(outcome, MutationOutcome::Rejected(_)));
    assert!(queue.peek_batch(10).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_noop_store_always_fetches() {
    let outcome = cache_first(&NoopStore, Partition::Static, "k", || async {
      ok_response(b"fetched")
    })
    .await;
    assert_eq!(outcome.source, ResponseSource::Network);
  }
}
