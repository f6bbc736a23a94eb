//! Registry of declared invalidation rules per mutation kind.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tally_core::{FetchError, InvalidationRule, KeyError, KeyPattern, KeyPredicate, MutationContext};

/// Maps a mutation kind to the key patterns it affects.
#[derive(Debug, Default)]
pub struct Invalidator {
    rules: RwLock<HashMap<String, Vec<KeyPattern>>>,
}

impl Invalidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<KeyPattern>>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<KeyPattern>>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a rule. Malformed patterns are rejected up front.
    pub fn register(&self, rule: InvalidationRule) -> Result<(), KeyError> {
        rule.pattern.validate()?;
        if rule.mutation_kind.is_empty() {
            return Err(KeyError::EmptyOperation);
        }
        self.write()
            .entry(rule.mutation_kind)
            .or_default()
            .push(rule.pattern);
        Ok(())
    }

    pub fn is_declared(&self, mutation_kind: &str) -> bool {
        self.read().contains_key(mutation_kind)
    }

    /// Declared mutation kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Resolve every pattern of `mutation_kind` against `context`.
    ///
    /// An undeclared kind is an error: a mutation with no rules would
    /// otherwise silently leave stale reads behind.
    pub fn resolve(
        &self,
        mutation_kind: &str,
        context: &MutationContext,
    ) -> Result<Vec<KeyPredicate>, FetchError> {
        let rules = self.read();
        let patterns = rules
            .get(mutation_kind)
            .ok_or_else(|| FetchError::UndeclaredMutation {
                kind: mutation_kind.to_string(),
            })?;

        patterns
            .iter()
            .map(|pattern| pattern.resolve(context).map_err(FetchError::from))
            .collect()
    }
}
