//! Key-scoped, versioned cache layer with pluggable fetch strategies.
//!
//! This module provides the local persistence half of offline support:
//! - Partitioned storage with per-partition eviction policies
//! - Atomic generation rotation for clean cache cutovers
//! - Read strategies (cache-first, network-first, stale-while-revalidate)
//! - A queue-backed strategy for mutations that cannot reach the server

pub mod policy;
pub mod store;
pub mod strategy;

pub use policy::{CachePolicies, Partition, PartitionPolicy};
pub use store::{CacheEntry, CacheStore, NoopStore, SqliteStore};
pub use strategy::{cache_key, FetchedResponse, MutationOutcome, ResponseSource, StrategyOutcome};
