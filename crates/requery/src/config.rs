use std::time::Duration;

use serde::Deserialize;

/// What happens to a cache entry once its last subscriber goes away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcPolicy {
    /// Keep the entry indefinitely.
    #[default]
    Retain,
    /// Drop the entry once it has been continuously unsubscribed for the
    /// given grace period. A re-subscription within the period cancels the
    /// eviction.
    EvictAfter(#[serde(with = "humantime_serde")] Duration),
}

/// Configuration for one cache instance.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name used to tag log output, for processes running several caches.
    pub name: String,
    /// Garbage collection of unsubscribed entries.
    pub gc: GcPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "query".into(),
            gc: GcPolicy::Retain,
        }
    }
}
