//! Watermarks and the invalidation journal.
//!
//! Every invalidation is appended to the journal with a monotonically
//! increasing sequence number. A fetch captures the current [`Watermark`]
//! when it starts; when it settles, the store consults the journal to decide
//! whether a matching invalidation happened in between and the result must
//! not be written back.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tally_core::{CacheKey, KeyPredicate};

/// A point in the invalidation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    /// Sequence number of the latest recorded invalidation.
    pub sequence: u64,
    /// When this watermark was observed.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    pub fn with_timestamp(sequence: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            observed_at,
        }
    }

    /// Beginning of history.
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    pub fn gap(&self, other: &Watermark) -> u64 {
        self.sequence.abs_diff(other.sequence)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

#[derive(Debug)]
struct JournalRecord {
    sequence: u64,
    recorded_at: DateTime<Utc>,
    predicate: KeyPredicate,
}

/// Bounded log of recent invalidations.
///
/// Not synchronized on its own: the cache store keeps it under the same lock
/// as its entries so that "check journal, then insert" is atomic.
#[derive(Debug)]
pub struct InvalidationJournal {
    records: VecDeque<JournalRecord>,
    sequence: u64,
    /// Highest sequence number dropped by pruning.
    pruned_through: u64,
    retention: Duration,
}

impl InvalidationJournal {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: VecDeque::new(),
            sequence: 0,
            pruned_through: 0,
            retention,
        }
    }

    pub fn current(&self) -> Watermark {
        Watermark::new(self.sequence)
    }

    /// Append an invalidation and return the new watermark.
    ///
    /// Records older than the retention window are pruned first.
    pub fn record(&mut self, predicate: KeyPredicate) -> Watermark {
        let now = Utc::now();
        if let Ok(retention) = chrono::Duration::from_std(self.retention) {
            self.prune(now - retention);
        }

        self.sequence += 1;
        self.records.push_back(JournalRecord {
            sequence: self.sequence,
            recorded_at: now,
            predicate,
        });
        Watermark::with_timestamp(self.sequence, now)
    }

    /// True if an invalidation matching `key` was recorded after `watermark`.
    ///
    /// A watermark that predates the pruned history is reported as
    /// invalidated, since the journal can no longer prove otherwise.
    pub fn invalidated_since(&self, watermark: &Watermark, key: &CacheKey) -> bool {
        if watermark.sequence < self.pruned_through {
            return true;
        }
        self.records
            .iter()
            .rev()
            .take_while(|r| r.sequence > watermark.sequence)
            .any(|r| r.predicate.matches(key))
    }

    /// True if an invalidation matching `key` was recorded at or after `at`.
    ///
    /// Used for durable records, which carry a timestamp but no sequence.
    pub fn invalidated_at_or_after(&self, at: DateTime<Utc>, key: &CacheKey) -> bool {
        self.records
            .iter()
            .rev()
            .take_while(|r| r.recorded_at >= at)
            .any(|r| r.predicate.matches(key))
    }

    /// Drop records older than `before`. Returns the number removed.
    pub fn prune(&mut self, before: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(front) = self.records.front() {
            if front.recorded_at >= before {
                break;
            }
            self.pruned_through = front.sequence;
            self.records.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{OperationName, Params};

    fn key(entity: &str) -> CacheKey {
        CacheKey::new(
            "list-vouchers",
            Params::builder().param("entity", entity).build().unwrap(),
        )
        .unwrap()
    }

    fn op_predicate() -> KeyPredicate {
        KeyPredicate::Operation(OperationName::new("list-vouchers").unwrap())
    }

    #[test]
    fn test_watermark_ordering() {
        let a = Watermark::new(1);
        let b = Watermark::new(3);
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
        assert_eq!(a.gap(&b), 2);
        assert_eq!(Watermark::default(), Watermark::zero());
    }

    #[test]
    fn test_record_advances_sequence() {
        let mut journal = InvalidationJournal::new(Duration::from_secs(60));
        assert_eq!(journal.current().sequence, 0);

        let wm = journal.record(op_predicate());
        assert_eq!(wm.sequence, 1);
        assert_eq!(journal.current().sequence, 1);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_invalidated_since_only_matching_keys() {
        let mut journal = InvalidationJournal::new(Duration::from_secs(60));
        let before = journal.current();
        journal.record(KeyPredicate::Exact(key("E1")));

        assert!(journal.invalidated_since(&before, &key("E1")));
        assert!(!journal.invalidated_since(&before, &key("E2")));

        let after = journal.current();
        assert!(!journal.invalidated_since(&after, &key("E1")));
    }

    #[test]
    fn test_invalidated_at_or_after() {
        let mut journal = InvalidationJournal::new(Duration::from_secs(60));
        let fetched_before = Utc::now() - chrono::Duration::seconds(5);
        journal.record(op_predicate());
        let fetched_after = Utc::now() + chrono::Duration::seconds(5);

        assert!(journal.invalidated_at_or_after(fetched_before, &key("E1")));
        assert!(!journal.invalidated_at_or_after(fetched_after, &key("E1")));
    }

    #[test]
    fn test_prune_marks_old_watermarks_invalidated() {
        let mut journal = InvalidationJournal::new(Duration::from_secs(60));
        let start = journal.current();
        journal.record(KeyPredicate::Exact(key("E1")));
        journal.record(KeyPredicate::Exact(key("E1")));

        let removed = journal.prune(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 2);
        assert!(journal.is_empty());

        // History for E2 is gone, so the journal cannot vouch for it.
        assert!(journal.invalidated_since(&start, &key("E2")));
        assert!(!journal.invalidated_since(&journal.current(), &key("E2")));
    }
}
