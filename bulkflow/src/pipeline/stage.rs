//! Stage definitions.

use super::result::PipelineItem;
use crate::errors::StageError;
use crate::resilience::RetryPolicy;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub(crate) type BlockingFn<T> = Arc<dyn Fn(T) -> Result<T, StageError> + Send + Sync>;
pub(crate) type AsyncFn<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, StageError>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum StageFn<T> {
    /// Runs on the blocking pool with the blocking retry loop.
    Blocking(BlockingFn<T>),
    /// Runs as a task with the async retry loop.
    Async(AsyncFn<T>),
}

/// A named transformation `item -> item'` that may fail.
///
/// # Examples
///
/// ```
/// use bulkflow::errors::StageError;
/// use bulkflow::pipeline::Stage;
///
/// let translate: Stage<String> = Stage::blocking("translate", |text: String| {
///     if text.is_empty() {
///         return Err(StageError::permanent("empty article"));
///     }
///     Ok(text.to_uppercase())
/// })
/// .with_service("openai");
///
/// assert_eq!(translate.name(), "translate");
/// assert_eq!(translate.service(), Some("openai"));
/// ```
#[derive(Clone)]
pub struct Stage<T> {
    name: String,
    func: StageFn<T>,
    service: Option<String>,
    retry: Option<RetryPolicy>,
}

impl<T: PipelineItem> Stage<T> {
    /// Creates a stage from a blocking function.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Result<T, StageError> + Send + Sync + 'static,
    {
        Self::from_fn(name, StageFn::Blocking(Arc::new(f)))
    }

    /// Creates a stage from an async function.
    pub fn from_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StageError>> + Send + 'static,
    {
        let func: AsyncFn<T> = Arc::new(move |item: T| f(item).boxed());
        Self::from_fn(name, StageFn::Async(func))
    }

    fn from_fn(name: impl Into<String>, func: StageFn<T>) -> Self {
        Self {
            name: name.into(),
            func,
            service: None,
            retry: None,
        }
    }
}

impl<T> Stage<T> {
    /// Routes calls through the circuit breaker of `service`.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Overrides the retry policy for this stage.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the service whose breaker guards this stage.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Returns the stage's own retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Returns true if the stage function is async.
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self.func, StageFn::Async(_))
    }

    pub(crate) fn func(&self) -> &StageFn<T> {
        &self.func
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("async", &self.is_async())
            .field("service", &self.service)
            .field("retry", &self.retry)
            .finish()
    }
}
