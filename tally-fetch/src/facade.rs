//! The `FetchCache` facade.
//!
//! Reads consult the volatile tier, then the durable tier for operations
//! registered as durable, then coordinate a fetch. Stale entries are served
//! immediately and refreshed in the background. Mutations call
//! [`FetchCache::invalidate`] with their declared kind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use tally_core::{
    CacheConfig, CacheKey, CacheRead, Cacheable, ConfigError, FetchError, InvalidationRule,
    KeyPattern, KeyPredicate, LastError, MutationContext, OperationName, OperationPolicy, Params,
    ReadSource, TallyResult,
};
use tally_storage::{CacheStats, CacheStore, LmdbSubstrate, PersistenceStats, PersistentAdapter};
use tracing::{debug, info, warn};

use crate::batch::{demultiplex, BatchPlanner, BatchRequest, BulkKey, BulkOutcome, ExecutionPlan};
use crate::executor::{BulkExecutor, Executor};
use crate::inflight::{CoordinatorStats, InFlightCoordinator, Role, SharedOutcome};
use crate::invalidator::Invalidator;

/// Per-key outcomes of a multi-key fetch, sorted by key.
pub type Settled<V> = BTreeMap<CacheKey, Result<Arc<V>, FetchError>>;

/// What an invalidation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub mutation_kind: String,
    /// Resolved patterns, rendered.
    pub patterns: Vec<String>,
    pub volatile_removed: usize,
    pub durable_removed: usize,
    /// In-flight operations detached from the registry.
    pub detached: usize,
}

/// Snapshot of every statistics source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub cache: CacheStats,
    pub coordinator: CoordinatorStats,
    pub durable: Option<PersistenceStats>,
}

struct OperationEntry<V> {
    policy: OperationPolicy,
    executor: Option<Arc<dyn Executor<V>>>,
    bulk_executor: Option<Arc<dyn BulkExecutor<V>>>,
}

impl<V> Clone for OperationEntry<V> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            executor: self.executor.clone(),
            bulk_executor: self.bulk_executor.clone(),
        }
    }
}

struct Inner<V> {
    config: CacheConfig,
    store: CacheStore<V>,
    operations: RwLock<HashMap<OperationName, OperationEntry<V>>>,
    single: Arc<InFlightCoordinator<CacheKey, Arc<V>>>,
    bulk: Arc<InFlightCoordinator<BulkKey, Arc<BulkOutcome<V>>>>,
    invalidator: Invalidator,
    bulk_calls: AtomicU64,
    partial_members: AtomicU64,
}

/// Deduplicating, batching, stale-while-revalidate cache over remote reads.
///
/// Cheap to clone; clones share all state.
///
/// # Example
///
/// ```ignore
/// let cache = FetchCache::<Vec<Voucher>>::new(CacheConfig::default())?;
/// cache.configure("list-vouchers", OperationPolicy::new(Duration::from_secs(60)))?;
/// cache.register_executor("list-vouchers", executor_fn(|p| api.list_vouchers(p)))?;
/// cache.register_rule(InvalidationRule::new(
///     "voucher-created",
///     KeyPattern::prefix("list-vouchers").bind("entity"),
/// ))?;
///
/// let vouchers = cache.fetch("list-vouchers", params).await?;
/// ```
pub struct FetchCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for FetchCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn unknown(operation: &OperationName) -> FetchError {
    FetchError::UnknownOperation {
        operation: operation.to_string(),
    }
}

impl<V: Cacheable> FetchCache<V> {
    /// Create a cache with only the volatile tier.
    pub fn new(config: CacheConfig) -> TallyResult<Self> {
        config.validate()?;
        let store = CacheStore::from_config(&config);
        Ok(Self::from_store(config, store))
    }

    /// Create a cache that mirrors durable operations to `adapter`.
    pub fn with_persistence(config: CacheConfig, adapter: PersistentAdapter) -> TallyResult<Self> {
        config.validate()?;
        let store = CacheStore::from_config(&config).with_persistence(Arc::new(adapter));
        Ok(Self::from_store(config, store))
    }

    /// Create a cache whose durable tier is an LMDB environment at `path`,
    /// sized and swept according to `config`.
    pub fn with_lmdb<P: AsRef<Path>>(config: CacheConfig, path: P) -> TallyResult<Self> {
        config.validate()?;
        let substrate = LmdbSubstrate::open(path, config.durable_map_size_mb)?;
        let adapter = PersistentAdapter::new(substrate, config.durable_capacity);
        Self::with_persistence(config, adapter)
    }

    fn from_store(config: CacheConfig, store: CacheStore<V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                operations: RwLock::new(HashMap::new()),
                single: Arc::new(InFlightCoordinator::new()),
                bulk: Arc::new(InFlightCoordinator::new()),
                invalidator: Invalidator::new(),
                bulk_calls: AtomicU64::new(0),
                partial_members: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Volatile tier, for inspection.
    pub fn store(&self) -> &CacheStore<V> {
        &self.inner.store
    }

    /// Register the policy for `operation`. Each operation is configured once.
    pub fn configure(&self, operation: &str, policy: OperationPolicy) -> TallyResult<()> {
        let name = OperationName::new(operation)?;
        policy.validate()?;

        let mut operations = self.inner.operations.write().unwrap_or_else(PoisonError::into_inner);
        if operations.contains_key(&name) {
            return Err(ConfigError::AlreadyConfigured {
                operation: operation.to_string(),
            }
            .into());
        }

        if policy.durable {
            if self.inner.store.persistence().is_none() {
                warn!(operation, "durable policy without a durable tier; results stay volatile");
            }
            self.inner.store.register_durable(name.clone());
        }

        info!(
            operation,
            ttl_ms = policy.ttl.as_millis() as u64,
            durable = policy.durable,
            bulk_threshold = policy.bulk_threshold,
            "configured operation"
        );
        operations.insert(
            name,
            OperationEntry {
                policy,
                executor: None,
                bulk_executor: None,
            },
        );
        Ok(())
    }

    /// Configure `operation` with the global default policy.
    pub fn configure_default(&self, operation: &str) -> TallyResult<()> {
        self.configure(operation, self.inner.config.default_policy())
    }

    pub fn register_executor<E>(&self, operation: &str, executor: E) -> TallyResult<()>
    where
        E: Executor<V> + 'static,
    {
        self.with_configured(operation, "an executor", |entry| {
            entry.executor = Some(Arc::new(executor));
        })
    }

    pub fn register_bulk_executor<E>(&self, operation: &str, executor: E) -> TallyResult<()>
    where
        E: BulkExecutor<V> + 'static,
    {
        self.with_configured(operation, "a bulk executor", |entry| {
            entry.bulk_executor = Some(Arc::new(executor));
        })
    }

    fn with_configured(
        &self,
        operation: &str,
        what: &str,
        update: impl FnOnce(&mut OperationEntry<V>),
    ) -> TallyResult<()> {
        let name = OperationName::new(operation)?;
        let mut operations = self.inner.operations.write().unwrap_or_else(PoisonError::into_inner);
        let entry = operations.get_mut(&name).ok_or_else(|| ConfigError::NotConfigured {
            operation: operation.to_string(),
            what: what.to_string(),
        })?;
        update(entry);
        Ok(())
    }

    /// Declare that `rule.mutation_kind` affects keys matching `rule.pattern`.
    pub fn register_rule(&self, rule: InvalidationRule) -> TallyResult<()> {
        debug!(mutation_kind = %rule.mutation_kind, pattern = ?rule.pattern, "registered invalidation rule");
        self.inner.invalidator.register(rule)?;
        Ok(())
    }

    /// Fetch one value.
    pub async fn fetch(&self, operation: &str, params: Params) -> Result<Arc<V>, FetchError> {
        self.fetch_read(operation, params)
            .await
            .map(CacheRead::into_value)
    }

    /// Fetch one value with parameters given as a JSON object.
    pub async fn fetch_json(
        &self,
        operation: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<V>, FetchError> {
        let params = Params::from_json(params)?;
        self.fetch(operation, params).await
    }

    /// Fetch one value along with where it came from and how old it is.
    pub async fn fetch_read(
        &self,
        operation: &str,
        params: Params,
    ) -> Result<CacheRead<V>, FetchError> {
        let key = CacheKey::new(operation, params)?;
        let op = self.inner.operation(key.operation())?;

        if let Some(read) = self.inner.read_cached(&key, &op).await {
            return Ok(read);
        }

        if let Some(value) = self.inner.join_covering_bulk(&key).await? {
            return Ok(CacheRead::fetched(value));
        }

        debug!(key = %key, "cache miss, coordinating fetch");
        let value = match &op.executor {
            Some(executor) => {
                let (outcome, _) =
                    self.inner
                        .coordinate_single(key, Arc::clone(executor), op.policy.ttl);
                outcome.await?
            }
            None => {
                let members = BTreeSet::from([key.clone()]);
                let mut settled = self
                    .inner
                    .fetch_missing(key.operation().clone(), &op, members)
                    .await;
                settled
                    .remove(&key)
                    .unwrap_or_else(|| Err(unknown(key.operation())))?
            }
        };
        Ok(CacheRead::fetched(value))
    }

    /// Fetch many values of one operation. Fails with the first error, in key
    /// order, after every member has been attempted; successful members are
    /// cached either way.
    pub async fn fetch_many(
        &self,
        operation: &str,
        params_list: Vec<Params>,
    ) -> Result<HashMap<CacheKey, Arc<V>>, FetchError> {
        let settled = self.fetch_many_settled(operation, params_list).await?;
        let mut values = HashMap::with_capacity(settled.len());
        for (key, result) in settled {
            values.insert(key, result?);
        }
        Ok(values)
    }

    /// Fetch many values of one operation, reporting each member's outcome.
    ///
    /// Only key canonicalization and an unknown operation fail the call as a
    /// whole.
    pub async fn fetch_many_settled(
        &self,
        operation: &str,
        params_list: Vec<Params>,
    ) -> Result<Settled<V>, FetchError> {
        let name = OperationName::new(operation)?;
        let op = self.inner.operation(&name)?;
        let keys: BTreeSet<CacheKey> = params_list
            .into_iter()
            .map(|params| CacheKey::from_parts(name.clone(), params))
            .collect();

        let mut settled = Settled::new();
        let mut missing = BTreeSet::new();
        for key in keys {
            match self.inner.read_cached(&key, &op).await {
                Some(read) => {
                    settled.insert(key, Ok(read.into_value()));
                }
                None => {
                    missing.insert(key);
                }
            }
        }

        if !missing.is_empty() {
            settled.extend(self.inner.fetch_missing(name, &op, missing).await);
        }
        Ok(settled)
    }

    /// Apply the declared rules of `mutation_kind`.
    ///
    /// Call after the mutation succeeded remotely. When this returns, no
    /// subsequent read observes a value cached before the mutation.
    pub async fn invalidate(
        &self,
        mutation_kind: &str,
        context: &MutationContext,
    ) -> Result<InvalidationReport, FetchError> {
        let predicates = self.inner.invalidator.resolve(mutation_kind, context)?;
        let mut report = InvalidationReport {
            mutation_kind: mutation_kind.to_string(),
            patterns: predicates.iter().map(ToString::to_string).collect(),
            ..Default::default()
        };

        for predicate in &predicates {
            report.volatile_removed += self.inner.store.delete(predicate);
            report.detached += self.inner.single.detach(|key| predicate.matches(key));
            report.detached += self
                .inner
                .bulk
                .detach(|bulk| bulk.members.iter().any(|key| predicate.matches(key)));
        }
        for predicate in &predicates {
            report.durable_removed += self.inner.store.delete_durable(predicate).await;
        }

        info!(
            mutation_kind,
            patterns = ?report.patterns,
            volatile_removed = report.volatile_removed,
            durable_removed = report.durable_removed,
            detached = report.detached,
            "applied invalidation"
        );
        Ok(report)
    }

    /// Mark matching entries stale without deleting them. The next read
    /// serves the cached value and refreshes it in the background.
    pub fn expire(&self, predicate: &KeyPredicate) -> usize {
        let marked = self.inner.store.mark_stale(predicate);
        debug!(pattern = %predicate, marked, "expired entries");
        marked
    }

    /// [`expire`](Self::expire) with a pattern resolved against `context`.
    pub fn expire_pattern(
        &self,
        pattern: &KeyPattern,
        context: &MutationContext,
    ) -> Result<usize, FetchError> {
        let predicate = pattern.resolve(context)?;
        Ok(self.expire(&predicate))
    }

    /// Most recent failure for `key`, cleared by the next successful fetch.
    pub fn last_error(&self, key: &CacheKey) -> Option<LastError> {
        self.inner.store.last_error(key)
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.single.is_in_flight(key)
    }

    /// Trim the durable tier to its capacity, oldest records first.
    pub async fn sweep_durable(&self) -> usize {
        match self.inner.store.persistence() {
            Some(adapter) => adapter.sweep_to_capacity().await,
            None => 0,
        }
    }

    /// Drop every volatile entry.
    pub fn clear(&self) -> usize {
        self.inner.store.clear()
    }

    pub fn stats(&self) -> FetchStats {
        let single = self.inner.single.stats();
        let bulk = self.inner.bulk.stats();
        FetchStats {
            cache: self.inner.store.stats(),
            coordinator: CoordinatorStats {
                executions: single.executions + bulk.executions,
                joins: single.joins + bulk.joins,
                bulk_calls: self.inner.bulk_calls.load(Ordering::Relaxed),
                partial_members: self.inner.partial_members.load(Ordering::Relaxed),
                in_flight: single.in_flight + bulk.in_flight,
            },
            durable: self.inner.store.persistence().map(|adapter| adapter.stats()),
        }
    }
}

impl<V: Cacheable> Inner<V> {
    fn operation(&self, name: &OperationName) -> Result<OperationEntry<V>, FetchError> {
        let operations = self.operations.read().unwrap_or_else(PoisonError::into_inner);
        match operations.get(name) {
            Some(entry) if entry.executor.is_some() || entry.bulk_executor.is_some() => {
                Ok(entry.clone())
            }
            _ => Err(unknown(name)),
        }
    }

    /// Serve `key` from the volatile or durable tier, scheduling a refresh
    /// when the entry is stale.
    async fn read_cached(
        self: &Arc<Self>,
        key: &CacheKey,
        op: &OperationEntry<V>,
    ) -> Option<CacheRead<V>> {
        let entry = match self.store.get(key) {
            Some(entry) => entry,
            None => self.store.load_durable(key).await?,
        };

        if entry.is_fresh() {
            debug!(key = %key, origin = ?entry.origin(), "cache hit (fresh)");
            return Some(CacheRead::from_entry(&entry, ReadSource::FreshHit));
        }

        debug!(key = %key, origin = ?entry.origin(), "cache hit (stale), revalidating in background");
        self.revalidate(key, op);
        Some(CacheRead::from_entry(&entry, ReadSource::StaleHit))
    }

    fn revalidate(self: &Arc<Self>, key: &CacheKey, op: &OperationEntry<V>) {
        if let Some(executor) = &op.executor {
            let (_, role) = self.coordinate_single(key.clone(), Arc::clone(executor), op.policy.ttl);
            if role == Role::Follower {
                debug!(key = %key, "refresh already in flight");
            }
        } else if let Some(bulk) = &op.bulk_executor {
            let members = BTreeSet::from([key.clone()]);
            if self
                .bulk
                .join_where(|k| k.covers(key.operation(), &members))
                .is_none()
            {
                let bulk_key = BulkKey {
                    operation: key.operation().clone(),
                    members,
                };
                self.coordinate_bulk(bulk_key, Arc::clone(bulk), op.policy.ttl);
            }
        }
    }

    /// Join an outstanding bulk call whose members include `key` and take
    /// its value from the response, or from a retry that already settled.
    /// `None` when no such call is running or `key` is still unserved.
    async fn join_covering_bulk(&self, key: &CacheKey) -> Result<Option<Arc<V>>, FetchError> {
        let members = BTreeSet::from([key.clone()]);
        let Some(outcome) = self.bulk.join_where(|k| k.covers(key.operation(), &members)) else {
            return Ok(None);
        };
        debug!(key = %key, "cache miss, joined covering bulk fetch");
        let outcome = outcome.await?;
        Ok(outcome.found.get(key).cloned().or_else(|| {
            self.store
                .peek(key)
                .filter(|e| e.is_fresh())
                .map(|e| Arc::clone(e.value()))
        }))
    }

    /// Coordinate a single-key fetch. The result is written back unless an
    /// invalidation matching the key lands while it runs.
    fn coordinate_single(
        self: &Arc<Self>,
        key: CacheKey,
        executor: Arc<dyn Executor<V>>,
        ttl: Duration,
    ) -> (SharedOutcome<Arc<V>>, Role) {
        let since = self.store.watermark();
        let inner = Arc::clone(self);
        let task_key = key.clone();

        let task = async move {
            match executor.execute(task_key.params()).await {
                Ok(value) => {
                    let value = Arc::new(value);
                    inner
                        .store
                        .put_since(task_key, Arc::clone(&value), ttl, &since)
                        .await;
                    Ok(value)
                }
                Err(error) => {
                    warn!(key = %task_key, %error, "fetch failed");
                    inner.store.record_error(&task_key, error.clone());
                    Err(error)
                }
            }
        };

        self.single.coordinate(key, task)
    }

    fn coordinate_bulk(
        self: &Arc<Self>,
        bulk_key: BulkKey,
        executor: Arc<dyn BulkExecutor<V>>,
        ttl: Duration,
    ) -> (SharedOutcome<Arc<BulkOutcome<V>>>, Role) {
        let since = self.store.watermark();
        let inner = Arc::clone(self);
        let operation = bulk_key.operation.clone();
        let members = bulk_key.members.clone();

        let task = async move {
            let params: Vec<Params> = members.iter().map(|key| key.params().clone()).collect();
            match executor.execute_bulk(&params).await {
                Ok(response) => {
                    let outcome = demultiplex(&members, response);
                    for (key, value) in &outcome.found {
                        inner
                            .store
                            .put_since(key.clone(), Arc::clone(value), ttl, &since)
                            .await;
                    }
                    if !outcome.is_complete() {
                        inner
                            .partial_members
                            .fetch_add(outcome.missing.len() as u64, Ordering::Relaxed);
                        warn!(
                            operation = %operation,
                            missing = outcome.missing.len(),
                            "bulk response incomplete, missing members will be retried singly"
                        );
                        for key in &outcome.missing {
                            inner.store.record_error(
                                key,
                                FetchError::PartialBatch {
                                    operation: operation.to_string(),
                                    key: key.to_string(),
                                },
                            );
                        }
                    }
                    Ok(Arc::new(outcome))
                }
                Err(error) => {
                    warn!(operation = %operation, members = members.len(), %error, "bulk fetch failed");
                    for key in &members {
                        inner.store.record_error(key, error.clone());
                    }
                    Err(error)
                }
            }
        };

        let (outcome, role) = self.bulk.coordinate(bulk_key, task);
        if role == Role::Leader {
            self.bulk_calls.fetch_add(1, Ordering::Relaxed);
        }
        (outcome, role)
    }

    /// Fetch keys that neither tier could serve.
    async fn fetch_missing(
        self: &Arc<Self>,
        operation: OperationName,
        op: &OperationEntry<V>,
        mut members: BTreeSet<CacheKey>,
    ) -> Settled<V> {
        let mut settled = Settled::new();
        let mut waits: Vec<(CacheKey, SharedOutcome<Arc<V>>)> = Vec::new();

        // Members already being fetched singly join those operations.
        members.retain(|key| match self.single.join(key) {
            Some(outcome) => {
                waits.push((key.clone(), outcome));
                false
            }
            None => true,
        });

        if !members.is_empty() {
            let planner = BatchPlanner::new(op.policy.bulk_threshold);
            let mut request = planner.plan(operation, members, op.bulk_executor.is_some());
            if op.executor.is_none() {
                request.plan = ExecutionPlan::Bulk;
            }

            match (&request.plan, &op.bulk_executor, &op.executor) {
                (ExecutionPlan::Bulk, Some(bulk), _) => {
                    let (done, retries) = self.run_bulk(&request, Arc::clone(bulk), op).await;
                    settled.extend(done);
                    waits.extend(retries);
                }
                (_, _, Some(executor)) => {
                    for key in request.members {
                        let (outcome, _) =
                            self.coordinate_single(key.clone(), Arc::clone(executor), op.policy.ttl);
                        waits.push((key, outcome));
                    }
                }
                _ => {
                    for key in request.members {
                        settled.insert(key, Err(unknown(&request.operation)));
                    }
                }
            }
        }

        let joined = join_all(
            waits
                .into_iter()
                .map(|(key, outcome)| async move { (key, outcome.await) }),
        )
        .await;
        settled.extend(joined);
        settled
    }

    /// Run or join a bulk call for `request`. Returns settled members and
    /// single-key retries for members the response omitted.
    async fn run_bulk(
        self: &Arc<Self>,
        request: &BatchRequest,
        executor: Arc<dyn BulkExecutor<V>>,
        op: &OperationEntry<V>,
    ) -> (Settled<V>, Vec<(CacheKey, SharedOutcome<Arc<V>>)>) {
        let outcome = match self
            .bulk
            .join_where(|k| k.covers(&request.operation, &request.members))
        {
            Some(outcome) => outcome,
            None => self.coordinate_bulk(request.bulk_key(), executor, op.policy.ttl).0,
        };

        let mut settled = Settled::new();
        let mut retries = Vec::new();

        let outcome = match outcome.await {
            Ok(outcome) => outcome,
            Err(error) => {
                for key in &request.members {
                    settled.insert(key.clone(), Err(error.clone()));
                }
                return (settled, retries);
            }
        };

        for key in &request.members {
            if let Some(value) = outcome.found.get(key) {
                settled.insert(key.clone(), Ok(Arc::clone(value)));
                continue;
            }
            // Another caller joined on the same bulk call may already have
            // retried this member.
            if let Some(entry) = self.store.peek(key).filter(|e| e.is_fresh()) {
                settled.insert(key.clone(), Ok(Arc::clone(entry.value())));
                continue;
            }
            match &op.executor {
                Some(executor) => {
                    debug!(key = %key, "retrying bulk member singly");
                    let (retry, _) =
                        self.coordinate_single(key.clone(), Arc::clone(executor), op.policy.ttl);
                    retries.push((key.clone(), retry));
                }
                None => {
                    settled.insert(
                        key.clone(),
                        Err(FetchError::PartialBatch {
                            operation: request.operation.to_string(),
                            key: key.to_string(),
                        }),
                    );
                }
            }
        }
        (settled, retries)
    }
}
