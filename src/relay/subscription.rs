//! Subscription tracking
//!
//! A `SubscriptionSet` holds the prefixes one backend connection wants. The
//! `AggregateView` counts, per exact prefix, how many live connections hold
//! it; upstream directives are only emitted on the 0 -> 1 and 1 -> 0
//! transitions of that count.
//!
//! Concurrency note: neither type synchronizes; callers mutate them under
//! the relay lock.

use std::collections::{HashMap, HashSet};

/// Prefix-match rule: the topic starts with the subscription bytes. The
/// empty prefix matches every topic.
pub fn prefix_matches(prefix: &[u8], topic: &[u8]) -> bool {
    topic.starts_with(prefix)
}

#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    prefixes: HashSet<Vec<u8>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prefix. Returns `false` if it was already present.
    pub fn insert(&mut self, prefix: Vec<u8>) -> bool {
        self.prefixes.insert(prefix)
    }

    /// Remove a prefix. Returns `false` if it was not present.
    pub fn remove(&mut self, prefix: &[u8]) -> bool {
        self.prefixes.remove(prefix)
    }

    pub fn contains(&self, prefix: &[u8]) -> bool {
        self.prefixes.contains(prefix)
    }

    /// Whether any held prefix matches `topic`.
    pub fn matches(&self, topic: &[u8]) -> bool {
        self.prefixes.iter().any(|p| prefix_matches(p, topic))
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Take every prefix out, leaving the set empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.prefixes.drain()
    }
}

/// Per-prefix reference counts across all backend connections.
#[derive(Debug, Default)]
pub struct AggregateView {
    counts: HashMap<Vec<u8>, usize>,
}

impl AggregateView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more holder of `prefix`. Returns `true` when it is the first.
    pub fn acquire(&mut self, prefix: &[u8]) -> bool {
        if let Some(count) = self.counts.get_mut(prefix) {
            *count += 1;
            return false;
        }
        self.counts.insert(prefix.to_vec(), 1);
        true
    }

    /// Count one holder fewer. Returns `true` when it was the last.
    ///
    /// Releasing a prefix nobody holds is ignored.
    pub fn release(&mut self, prefix: &[u8]) -> bool {
        let Some(count) = self.counts.get_mut(prefix) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(prefix);
            return true;
        }
        false
    }

    /// Number of connections holding exactly `prefix`.
    pub fn count(&self, prefix: &[u8]) -> usize {
        self.counts.get(prefix).copied().unwrap_or(0)
    }

    /// Whether some connection's subscription matches `topic`.
    pub fn is_wanted(&self, topic: &[u8]) -> bool {
        self.counts.keys().any(|p| prefix_matches(p, topic))
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &[u8]> {
        self.counts.keys().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
