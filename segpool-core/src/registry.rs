//! Segment registry: the pool-side state machine. Every configured segment
//! moves Available -> Claimed exactly once and Claimed -> Complete at most
//! once. There is no reverse transition: a claimed segment never returns to
//! Available, so work stranded by a vanished peer stays stranded.

use std::collections::BTreeSet;

use crate::paths;

/// Per-job segment lifecycle state, owned exclusively by the pool.
#[derive(Debug, Default)]
pub struct SegmentRegistry {
    expected: Vec<String>,
    available: Vec<String>,
    claimed: Vec<String>,
    complete: BTreeSet<String>,
}

impl SegmentRegistry {
    /// Seed from the configured segment list. Available starts as a copy of
    /// the full list; assignment pops from the back (LIFO, not contractual).
    pub fn new(segments: Vec<String>) -> Self {
        SegmentRegistry {
            available: segments.clone(),
            expected: segments,
            claimed: Vec::new(),
            complete: BTreeSet::new(),
        }
    }

    /// Pop one path from Available and move it to Claimed. `None` when
    /// exhausted. Callers must serialize access: the pool holds this behind
    /// a mutex so concurrent connections never receive the same path.
    pub fn assign(&mut self) -> Option<String> {
        let segment = self.available.pop()?;
        self.claimed.push(segment.clone());
        Some(segment)
    }

    /// Record a completed output by basename. Matching is by basename only:
    /// two expected paths sharing a final component are indistinguishable
    /// here.
    pub fn record_complete(&mut self, basename: impl Into<String>) {
        self.complete.insert(basename.into());
    }

    /// True when the set of completed basenames equals the set of expected
    /// basenames exactly. Not a superset, not a subset; an unconfigured
    /// registry is never complete.
    pub fn is_complete(&self) -> bool {
        if self.expected.is_empty() {
            return false;
        }
        let expected: BTreeSet<&str> = self.expected.iter().map(|p| paths::basename(p)).collect();
        let complete: BTreeSet<&str> = self.complete.iter().map(String::as_str).collect();
        expected == complete
    }

    pub fn expected(&self) -> &[String] {
        &self.expected
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn claimed_len(&self) -> usize {
        self.claimed.len()
    }

    pub fn complete_len(&self) -> usize {
        self.complete.len()
    }
}
