//! Tally Test Utilities
//!
//! Shared test infrastructure for the Tally workspace:
//! - Counting executors with delays, gates and injected failures
//! - A durable substrate whose writes can be made to fail
//! - Voucher fixtures for the console scenarios
//! - Proptest generators for keys and parameters

pub use tally_core::{CacheConfig, CacheKey, FetchError, OperationName, ParamValue, Params};
pub use tally_fetch::{BulkExecutor, Executor, FetchCache};
pub use tally_storage::{DurableSubstrate, InMemorySubstrate};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tally_core::PersistenceError;
use tokio::sync::Semaphore;

/// Install a test-writer subscriber once. Honors `RUST_LOG`, defaults to `warn`.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every millisecond until it holds. Panics after a second.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met within 1s");
}

type Respond<V> = Arc<dyn Fn(&Params, usize) -> V + Send + Sync>;

// ============================================================================
// EXECUTORS
// ============================================================================

/// Executor that counts invocations.
///
/// Clones share counters, so a test keeps one clone and registers the other.
pub struct CountingExecutor<V> {
    respond: Respond<V>,
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl<V> Clone for CountingExecutor<V> {
    fn clone(&self) -> Self {
        Self {
            respond: Arc::clone(&self.respond),
            calls: Arc::clone(&self.calls),
            failing: Arc::clone(&self.failing),
            delay: self.delay,
            gate: self.gate.clone(),
        }
    }
}

impl<V> CountingExecutor<V> {
    /// `respond` receives the params and the 1-based invocation number.
    pub fn new(respond: impl Fn(&Params, usize) -> V + Send + Sync + 'static) -> Self {
        Self {
            respond: Arc::new(respond),
            calls: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
            delay: None,
            gate: None,
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block every invocation until [`open_gate`](Self::open_gate) lets it through.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` blocked or future invocations proceed.
    pub fn open_gate(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Invocations started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// While set, every invocation fails with a transient error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl CountingExecutor<String> {
    /// Answers `"<params>#<invocation>"`.
    pub fn echo() -> Self {
        Self::new(|params, n| format!("{}#{}", params, n))
    }
}

async fn wait_for_gate(gate: &Option<Arc<Semaphore>>, delay: Option<Duration>) -> Result<(), FetchError> {
    if let Some(gate) = gate {
        gate.acquire()
            .await
            .map_err(|e| FetchError::Aborted {
                operation: "test-executor".into(),
                reason: e.to_string(),
            })?
            .forget();
    }
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

#[async_trait]
impl<V: Send + Sync + 'static> Executor<V> for CountingExecutor<V> {
    async fn execute(&self, params: &Params) -> Result<V, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        wait_for_gate(&self.gate, self.delay).await?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::transient("test-executor", "injected failure"));
        }
        Ok((self.respond)(params, n))
    }
}

/// Bulk executor that records each batch it receives.
pub struct CountingBulkExecutor<V> {
    respond: Respond<V>,
    batches: Arc<Mutex<Vec<Vec<Params>>>>,
    omitted: Arc<Mutex<HashSet<Params>>>,
    failing: Arc<AtomicBool>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl<V> Clone for CountingBulkExecutor<V> {
    fn clone(&self) -> Self {
        Self {
            respond: Arc::clone(&self.respond),
            batches: Arc::clone(&self.batches),
            omitted: Arc::clone(&self.omitted),
            failing: Arc::clone(&self.failing),
            delay: self.delay,
            gate: self.gate.clone(),
        }
    }
}

impl<V> CountingBulkExecutor<V> {
    /// `respond` receives each member's params and the 1-based call number.
    pub fn new(respond: impl Fn(&Params, usize) -> V + Send + Sync + 'static) -> Self {
        Self {
            respond: Arc::new(respond),
            batches: Arc::default(),
            omitted: Arc::default(),
            failing: Arc::new(AtomicBool::new(false)),
            delay: None,
            gate: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn open_gate(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Leave `params` out of every response.
    pub fn omit(&self, params: Params) {
        self.omitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(params);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Bulk calls started so far.
    pub fn calls(&self) -> usize {
        self.batches().len()
    }

    /// Members of each call, in call order.
    pub fn batches(&self) -> Vec<Vec<Params>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CountingBulkExecutor<String> {
    pub fn echo() -> Self {
        Self::new(|params, n| format!("{}#{}", params, n))
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> BulkExecutor<V> for CountingBulkExecutor<V> {
    async fn execute_bulk(&self, members: &[Params]) -> Result<HashMap<Params, V>, FetchError> {
        let n = {
            let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            batches.push(members.to_vec());
            batches.len()
        };
        wait_for_gate(&self.gate, self.delay).await?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::transient("test-bulk-executor", "injected failure"));
        }

        let omitted = self
            .omitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(members
            .iter()
            .filter(|params| !omitted.contains(*params))
            .map(|params| (params.clone(), (self.respond)(params, n)))
            .collect())
    }
}

// ============================================================================
// DURABLE SUBSTRATE
// ============================================================================

/// In-memory substrate whose writes can be made to fail.
#[derive(Clone, Default)]
pub struct FlakySubstrate {
    inner: Arc<InMemorySubstrate>,
    fail_writes: Arc<AtomicBool>,
}

impl FlakySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableSubstrate for FlakySubstrate {
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed {
                reason: "injected failure".into(),
            });
        }
        self.inner.write(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, PersistenceError> {
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PersistenceError> {
        self.inner.scan_prefix(prefix).await
    }

    async fn len(&self) -> Result<usize, PersistenceError> {
        self.inner.len().await
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Console fixtures: entities with vouchers.

    use super::*;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    pub const LIST_VOUCHERS: &str = "list-vouchers";
    pub const VOUCHER_CREATED: &str = "voucher-created";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Voucher {
        pub voucher_id: Uuid,
        pub entity: String,
        pub amount_cents: i64,
    }

    impl Voucher {
        pub fn new(entity: &str, amount_cents: i64) -> Self {
            Self {
                voucher_id: Uuid::now_v7(),
                entity: entity.to_string(),
                amount_cents,
            }
        }
    }

    /// `{entity=<entity>}`
    pub fn entity_params(entity: &str) -> Params {
        Params::builder()
            .param("entity", entity)
            .build()
            .unwrap_or_else(|e| panic!("fixture params: {e}"))
    }

    /// `{id=<id>}`
    pub fn id_params(id: &str) -> Params {
        Params::builder()
            .param("id", id)
            .build()
            .unwrap_or_else(|e| panic!("fixture params: {e}"))
    }

    /// List executor answering `n` vouchers of 100 cents for the requested
    /// entity, where `n` is the invocation number.
    pub fn voucher_list_executor() -> CountingExecutor<Vec<Voucher>> {
        CountingExecutor::new(|params, n| {
            let entity = match params.get("entity") {
                Some(ParamValue::Text(entity)) => entity.clone(),
                _ => String::new(),
            };
            (0..n).map(|_| Voucher::new(&entity, 100)).collect()
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and parameters.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_operation_name() -> impl Strategy<Value = OperationName> {
        "[a-z]{1,8}(-[a-z]{1,8}){0,2}".prop_map(|name| {
            OperationName::new(name).unwrap_or_else(|e| panic!("generated operation name: {e}"))
        })
    }

    pub fn arb_param_value() -> impl Strategy<Value = ParamValue> {
        prop_oneof![
            any::<bool>().prop_map(ParamValue::Bool),
            any::<i64>().prop_map(ParamValue::Int),
            any::<[u8; 16]>().prop_map(|bytes| ParamValue::Id(uuid::Uuid::from_bytes(bytes))),
            "[A-Za-z0-9 ]{0,12}".prop_map(ParamValue::Text),
        ]
    }

    pub fn arb_params() -> impl Strategy<Value = Params> {
        prop::collection::btree_map("[a-z]{1,6}", arb_param_value(), 0..5).prop_map(|map| {
            map.into_iter()
                .fold(Params::builder(), |builder, (name, value)| builder.param(name, value))
                .build()
                .unwrap_or_else(|e| panic!("generated params: {e}"))
        })
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_operation_name(), arb_params())
            .prop_map(|(operation, params)| CacheKey::from_parts(operation, params))
    }

    /// Distinct entity ids, for batch requests.
    pub fn arb_entities(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set("E[0-9]{1,3}", 1..=max).prop_map(|set| set.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn test_counting_executor_counts_and_fails() {
        let executor = CountingExecutor::echo();
        assert_eq!(
            executor.execute(&entity_params("E1")).await.unwrap(),
            "{entity=E1}#1"
        );
        executor.set_failing(true);
        assert!(executor.execute(&entity_params("E1")).await.is_err());
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_bulk_executor_omits_members() {
        let executor = CountingBulkExecutor::echo();
        executor.omit(id_params("k3"));
        let response = executor
            .execute_bulk(&[id_params("k1"), id_params("k3")])
            .await
            .unwrap();
        assert_eq!(response.len(), 1);
        assert_eq!(executor.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_flaky_substrate() {
        let substrate = FlakySubstrate::new();
        substrate.write(b"k", b"v").await.unwrap();
        substrate.set_fail_writes(true);
        assert!(substrate.write(b"k", b"w").await.is_err());
        assert_eq!(substrate.read(b"k").await.unwrap(), Some(b"v".to_vec()));
    }
}
