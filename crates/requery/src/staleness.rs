use std::time::Duration;

use crate::time::Instant;

/// How long after a successful resolution a cached value counts as fresh.
///
/// Freshness is a pure decision over the entry's success timestamp; the
/// engine consults it on every trigger to decide whether a network call is
/// warranted at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleTime {
    /// Fresh for the given duration, stale afterwards.
    ///
    /// `After(Duration::ZERO)` is stale the instant it resolves, which makes
    /// every subsequent trigger refetch.
    After(Duration),
    /// Never goes stale once resolved.
    Forever,
}

impl Default for StaleTime {
    fn default() -> Self {
        Self::After(Duration::ZERO)
    }
}

impl From<Duration> for StaleTime {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl StaleTime {
    /// Decides freshness at `now` for a value last resolved at `updated_at`.
    ///
    /// A value that never resolved is always stale.
    pub fn is_stale(self, updated_at: Option<Instant>, now: Instant) -> bool {
        match (self, updated_at) {
            (_, None) => true,
            (StaleTime::Forever, Some(_)) => false,
            (StaleTime::After(duration), Some(at)) => now.saturating_duration_since(at) >= duration,
        }
    }
}
