//! # requery
//!
//! A keyed in-memory cache for async data fetching: staleness tracking,
//! in-flight request deduplication, stale-while-revalidate refresh, and
//! chained pagination for infinite lists.
//!
//! ## Architecture
//!
//! The engine is built from a small set of components:
//!
//! - [`QueryKey`] canonicalizes a primitive or sequence key into the string
//!   form that determines cache identity.
//! - [`StaleTime`] decides, purely from the success timestamp, whether an
//!   entry's data is still fresh at a point in time.
//! - The store (internal) maps canonical keys to entry slots, fans updates
//!   out to subscribers, and garbage-collects unsubscribed entries per the
//!   configured [`GcPolicy`].
//! - [`QueryCache`] drives the fetch lifecycle of plain queries,
//!   [`InfiniteQueryCache`] the accumulation of paginated ones, and
//!   [`Mutation`] the independent, non-cached lifecycle of writes.
//!
//! ## Deduplication and ordering
//!
//! Every entry holds at most one outstanding fetch attempt. Concurrent
//! triggers for the same key collapse onto the attempt's shared handle
//! instead of issuing further calls. Each attempt carries a monotonically
//! increasing id; a completion whose id is no longer current — because the
//! entry was invalidated, reset, or superseded by a newer attempt — is
//! discarded, so an entry always reflects the outcome of the most recently
//! *initiated* attempt, never a stale one that happened to resolve late.
//! There is no cancel primitive; superseding an attempt is how its effects
//! are cancelled.
//!
//! ## Stale-while-revalidate
//!
//! A refetch never clears the entry: the previous data (and error) stay
//! visible while the new attempt runs, and consumers distinguish a first
//! load from a background refresh through
//! [`QueryState::is_loading`]. Failures likewise keep the last good data
//! around.
//!
//! ## Consistency
//!
//! Consumers only ever observe immutable snapshots that are replaced
//! atomically, never entries mutated in place, so no reader can see a torn
//! mix of old and new fields. Notifications are synchronous and deliver the
//! snapshot captured at notification time; listeners registered during a
//! delivery are not called for it.
//!
//! ## Errors
//!
//! The engine has no error taxonomy of its own. Fetch and mutation functions
//! translate their failures — transport errors, non-ok responses,
//! application errors — into an opaque [`FetchError`], and the engine stores
//! and routes it without interpretation. There are no automatic retries.

mod config;
mod error;
mod infinite;
mod key;
mod mutation;
mod query;
mod staleness;
mod store;


pub use config::{CacheConfig, GcPolicy};
pub use error::{FetchError, FetchResult};
pub use infinite::{
    InfiniteQueryCache, InfiniteQueryHandle, InfiniteQueryOptions, InfiniteState, NextPageParamFn,
    PageFn,
};
pub use key::QueryKey;
pub use mutation::{Mutation, MutationFn, MutationOptions, MutationState};
pub use query::{
    QueryCache, QueryFn, QueryHandle, QueryOptions, QueryState, QueryStatus, SharedFetch,
};
pub use staleness::StaleTime;
pub use store::Subscription;

#[doc(hidden)]
pub use serde_json;

// The time source: entries are stamped with `time::Instant`. Tests (and the
// `test` feature) route this through tokio so the clock can be paused and
// advanced deterministically.
#[cfg(any(test, feature = "test"))]
pub use tokio::time;
#[cfg(not(any(test, feature = "test")))]
pub use std::time;
