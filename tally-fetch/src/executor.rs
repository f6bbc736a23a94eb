//! Network executors consumed by the cache.
//!
//! An [`Executor`] answers one parameter set; a [`BulkExecutor`] answers many
//! in one round trip and omits members it could not resolve.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tally_core::{FetchError, Params};

/// Fetches the value for one parameter set.
#[async_trait]
pub trait Executor<V>: Send + Sync {
    async fn execute(&self, params: &Params) -> Result<V, FetchError>;
}

/// Fetches values for many parameter sets in one call.
///
/// Members missing from the returned map are treated as partial-batch misses
/// and retried singly.
#[async_trait]
pub trait BulkExecutor<V>: Send + Sync {
    async fn execute_bulk(&self, members: &[Params]) -> Result<HashMap<Params, V>, FetchError>;
}

/// Executor built from an async closure.
pub struct FnExecutor<F> {
    f: F,
}

/// Wrap an async closure as an [`Executor`].
///
/// ```ignore
/// let executor = executor_fn(|params: Params| async move {
///     client.list_vouchers(&params).await.map_err(|e| FetchError::transient("list-vouchers", e.to_string()))
/// });
/// ```
pub fn executor_fn<F>(f: F) -> FnExecutor<F> {
    FnExecutor { f }
}

#[async_trait]
impl<V, F, Fut> Executor<V> for FnExecutor<F>
where
    V: Send + 'static,
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, FetchError>> + Send,
{
    async fn execute(&self, params: &Params) -> Result<V, FetchError> {
        (self.f)(params.clone()).await
    }
}

/// Bulk executor built from an async closure.
pub struct FnBulkExecutor<F> {
    f: F,
}

/// Wrap an async closure as a [`BulkExecutor`].
pub fn bulk_executor_fn<F>(f: F) -> FnBulkExecutor<F> {
    FnBulkExecutor { f }
}

#[async_trait]
impl<V, F, Fut> BulkExecutor<V> for FnBulkExecutor<F>
where
    V: Send + 'static,
    F: Fn(Vec<Params>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HashMap<Params, V>, FetchError>> + Send,
{
    async fn execute_bulk(&self, members: &[Params]) -> Result<HashMap<Params, V>, FetchError> {
        (self.f)(members.to_vec()).await
    }
}

/// Executor wrapper that fails with [`FetchError::Timeout`] after a deadline.
pub struct WithTimeout<E> {
    inner: E,
    operation: String,
    after: Duration,
}

impl<E> WithTimeout<E> {
    pub fn new(inner: E, operation: impl Into<String>, after: Duration) -> Self {
        Self {
            inner,
            operation: operation.into(),
            after,
        }
    }

    fn timed_out(&self) -> FetchError {
        FetchError::Timeout {
            operation: self.operation.clone(),
            after: self.after,
        }
    }
}

#[async_trait]
impl<V, E> Executor<V> for WithTimeout<E>
where
    V: Send + 'static,
    E: Executor<V>,
{
    async fn execute(&self, params: &Params) -> Result<V, FetchError> {
        tokio::time::timeout(self.after, self.inner.execute(params))
            .await
            .unwrap_or_else(|_| Err(self.timed_out()))
    }
}

#[async_trait]
impl<V, E> BulkExecutor<V> for WithTimeout<E>
where
    V: Send + 'static,
    E: BulkExecutor<V>,
{
    async fn execute_bulk(&self, members: &[Params]) -> Result<HashMap<Params, V>, FetchError> {
        tokio::time::timeout(self.after, self.inner.execute_bulk(members))
            .await
            .unwrap_or_else(|_| Err(self.timed_out()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entity: &str) -> Params {
        Params::builder().param("entity", entity).build().unwrap()
    }

    #[tokio::test]
    async fn test_fn_executor() {
        let executor = executor_fn(|p: Params| async move { Ok::<_, FetchError>(p.len()) });
        assert_eq!(executor.execute(&params("E1")).await, Ok(1));
    }

    #[tokio::test]
    async fn test_fn_bulk_executor() {
        let executor = bulk_executor_fn(|members: Vec<Params>| async move {
            Ok::<_, FetchError>(members.into_iter().map(|p| (p, 1u32)).collect::<HashMap<_, _>>())
        });
        let result = executor
            .execute_bulk(&[params("E1"), params("E2")])
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wrapper() {
        let slow = executor_fn(|_p: Params| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, FetchError>(1u32)
        });
        let executor = WithTimeout::new(slow, "list-vouchers", Duration::from_millis(100));

        let err = executor.execute(&params("E1")).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Timeout {
                operation: "list-vouchers".into(),
                after: Duration::from_millis(100),
            }
        );
        assert!(err.is_retryable());
    }
}
