//! In-flight request coordination.
//!
//! At most one underlying operation runs per request key. The operation is
//! spawned onto the runtime and its outcome is exposed as a shared future,
//! so every joined caller observes the same result and a caller that drops
//! its future only detaches itself.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tally_core::FetchError;
use tokio::sync::oneshot;

/// Outcome of a coordinated operation, cloneable by every joined caller.
pub type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// Whether a caller started the operation or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Registry entry for one outstanding operation.
pub struct InFlightHandle<K, T: Clone> {
    pub request_key: K,
    pub outcome: SharedOutcome<T>,
    pub joined_count: usize,
    id: u64,
}

/// Coordinator statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Underlying operations started.
    pub executions: u64,
    /// Callers that joined an existing operation.
    pub joins: u64,
    /// Bulk calls issued.
    pub bulk_calls: u64,
    /// Bulk members missing from a bulk response.
    pub partial_members: u64,
    /// Operations currently outstanding.
    pub in_flight: u64,
}

/// Tracks outstanding operations by request key.
pub struct InFlightCoordinator<K, T: Clone> {
    handles: Mutex<HashMap<K, InFlightHandle<K, T>>>,
    next_id: AtomicU64,
    executions: AtomicU64,
    joins: AtomicU64,
}

impl<K, T> Default for InFlightCoordinator<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> InFlightCoordinator<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            executions: AtomicU64::new(0),
            joins: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, InFlightHandle<K, T>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the live operation for `key`, or start `task` as a new one.
    ///
    /// `task` runs on a spawned tokio task and is only polled when this call
    /// becomes the leader. Its handle is removed before joined callers are
    /// resolved, so anything `task` writes is visible to whoever arrives next.
    pub fn coordinate<F>(self: &Arc<Self>, key: K, task: F) -> (SharedOutcome<T>, Role)
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mut handles = self.lock();

        if let Some(handle) = handles.get_mut(&key) {
            handle.joined_count += 1;
            self.joins.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request_key = %key, joined = handle.joined_count, "joined in-flight fetch");
            return (handle.outcome.clone(), Role::Follower);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.executions.fetch_add(1, Ordering::Relaxed);

        let (sender, receiver) = oneshot::channel();
        let label = key.to_string();
        let outcome = async move {
            receiver.await.unwrap_or_else(|_| {
                Err(FetchError::Aborted {
                    operation: label,
                    reason: "task ended without a result".to_string(),
                })
            })
        }
        .boxed()
        .shared();

        handles.insert(
            key.clone(),
            InFlightHandle {
                request_key: key.clone(),
                outcome: outcome.clone(),
                joined_count: 1,
                id,
            },
        );
        drop(handles);

        // The completion may run its removal synchronously inside `spawn`
        // when the runtime is shutting down, so the registry lock must be
        // released first.
        let completion = Completion {
            registry: Arc::clone(self),
            key,
            id,
            sender: Some(sender),
        };
        tokio::spawn(async move {
            let result = task.await;
            completion.complete(result);
        });

        (outcome, Role::Leader)
    }

    /// Join an existing operation whose key satisfies `covers`.
    pub fn join_where(&self, covers: impl Fn(&K) -> bool) -> Option<SharedOutcome<T>> {
        let mut handles = self.lock();
        let handle = handles.values_mut().find(|h| covers(&h.request_key))?;
        handle.joined_count += 1;
        self.joins.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(request_key = %handle.request_key, "joined covering in-flight fetch");
        Some(handle.outcome.clone())
    }

    /// Join the operation for `key` if one is outstanding.
    pub fn join(&self, key: &K) -> Option<SharedOutcome<T>> {
        let mut handles = self.lock();
        let handle = handles.get_mut(key)?;
        handle.joined_count += 1;
        self.joins.fetch_add(1, Ordering::Relaxed);
        Some(handle.outcome.clone())
    }

    /// Forget every outstanding operation whose key matches. Callers already
    /// joined still receive its outcome; new callers start a fresh operation.
    pub fn detach(&self, matches: impl Fn(&K) -> bool) -> usize {
        let mut handles = self.lock();
        let before = handles.len();
        handles.retain(|key, _| !matches(key));
        before - handles.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Callers joined on the operation for `key`, including the leader.
    pub fn joined_count(&self, key: &K) -> Option<usize> {
        self.lock().get(key).map(|h| h.joined_count)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            executions: self.executions.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            in_flight: self.len() as u64,
            ..Default::default()
        }
    }

    fn remove(&self, key: &K, id: u64) {
        let mut handles = self.lock();
        if handles.get(key).is_some_and(|h| h.id == id) {
            handles.remove(key);
        }
    }
}

/// Removes a handle when its task finishes, then hands the result to the
/// joined callers. Dropped without completing (panic, cancelled spawn), the
/// handle is still removed and callers observe `Aborted`.
struct Completion<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    registry: Arc<InFlightCoordinator<K, T>>,
    key: K,
    id: u64,
    sender: Option<oneshot::Sender<Result<T, FetchError>>>,
}

impl<K, T> Completion<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn complete(mut self, result: Result<T, FetchError>) {
        let sender = self.sender.take();
        drop(self);
        if let Some(sender) = sender {
            // Every caller may have dropped its future.
            let _ = sender.send(result);
        }
    }
}

impl<K, T> Drop for Completion<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.registry.remove(&self.key, self.id);
    }
}
