use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Outstanding commands keyed by correlation id.
///
/// Entries are removed when the matching acknowledgment arrives. Commands
/// that are never acknowledged stay until `evict_older_than` drops them.
#[derive(Debug, Default)]
pub struct CorrelationTracker {
    outstanding: HashMap<String, DateTime<Utc>>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a command issue time. A duplicate id overwrites.
    pub fn register(&mut self, cid: impl Into<String>, issued_at: DateTime<Utc>) {
        self.outstanding.insert(cid.into(), issued_at);
    }

    /// Removes `cid` and returns the round-trip latency, or `None` for ids
    /// this process never issued or already resolved.
    pub fn resolve(&mut self, cid: &str, observed_at: DateTime<Utc>) -> Option<Duration> {
        self.outstanding
            .remove(cid)
            .map(|issued_at| observed_at - issued_at)
    }

    #[cfg(test)]
    pub fn contains(&self, cid: &str) -> bool {
        self.outstanding.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Drops entries issued more than `max_age` before `now`.
    pub fn evict_older_than(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let before = self.outstanding.len();
        self.outstanding
            .retain(|_, issued_at| now - *issued_at <= max_age);
        before - self.outstanding.len()
    }
}
