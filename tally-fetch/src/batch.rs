//! Bulk-versus-single planning and bulk response demultiplexing.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tally_core::{CacheKey, OperationName, Params};

/// How a group of keys will be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPlan {
    /// One bulk call for every member.
    Bulk,
    /// One coalesced call per member.
    PerKey,
}

/// Keys of one operation requested together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub operation: OperationName,
    /// Sorted and deduplicated.
    pub members: BTreeSet<CacheKey>,
    pub plan: ExecutionPlan,
}

impl BatchRequest {
    /// Coordination key for the bulk call.
    pub fn bulk_key(&self) -> BulkKey {
        BulkKey {
            operation: self.operation.clone(),
            members: self.members.clone(),
        }
    }
}

/// Chooses between a bulk call and per-key calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlanner {
    threshold: usize,
}

impl BatchPlanner {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Bulk when a bulk executor exists and the deduplicated member count
    /// exceeds the threshold; per-key otherwise.
    pub fn plan(
        &self,
        operation: OperationName,
        members: impl IntoIterator<Item = CacheKey>,
        has_bulk: bool,
    ) -> BatchRequest {
        let members: BTreeSet<CacheKey> = members.into_iter().collect();
        let plan = if has_bulk && members.len() > self.threshold {
            ExecutionPlan::Bulk
        } else {
            ExecutionPlan::PerKey
        };
        tracing::debug!(
            operation = %operation,
            members = members.len(),
            threshold = self.threshold,
            ?plan,
            "planned batch"
        );
        BatchRequest {
            operation,
            members,
            plan,
        }
    }
}

/// Request key of a bulk call: the operation plus its sorted member set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BulkKey {
    pub operation: OperationName,
    pub members: BTreeSet<CacheKey>,
}

impl BulkKey {
    /// True if a call for `self` answers every key in `members`.
    pub fn covers(&self, operation: &OperationName, members: &BTreeSet<CacheKey>) -> bool {
        &self.operation == operation && self.members.is_superset(members)
    }
}

impl fmt::Display for BulkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.operation)?;
        for (i, key) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", key.params())?;
        }
        f.write_str("]")
    }
}

/// Per-key view of a bulk response.
#[derive(Debug)]
pub struct BulkOutcome<V> {
    pub found: HashMap<CacheKey, Arc<V>>,
    /// Requested members absent from the response.
    pub missing: BTreeSet<CacheKey>,
}

impl<V> BulkOutcome<V> {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Split a bulk response into entries keyed as if each member were fetched
/// singly. Response entries that were not requested are dropped.
pub fn demultiplex<V>(members: &BTreeSet<CacheKey>, mut response: HashMap<Params, V>) -> BulkOutcome<V> {
    let mut found = HashMap::with_capacity(members.len());
    let mut missing = BTreeSet::new();

    for key in members {
        match response.remove(key.params()) {
            Some(value) => {
                found.insert(key.clone(), Arc::new(value));
            }
            None => {
                missing.insert(key.clone());
            }
        }
    }

    if !response.is_empty() {
        tracing::debug!(extra = response.len(), "bulk response carried unrequested members");
    }

    BulkOutcome { found, missing }
}
