use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{FetchError, FetchResult};
use crate::query::QueryStatus;

/// The caller-supplied function performing the write operation.
pub type MutationFn<T, V> = Arc<dyn Fn(V) -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;

type SuccessCallback<T, V> = Arc<dyn Fn(&T, &V) + Send + Sync>;
type ErrorCallback<V> = Arc<dyn Fn(&FetchError, &V) + Send + Sync>;
type SettledCallback<T, V> = Arc<dyn Fn(Option<&T>, Option<&FetchError>, &V) + Send + Sync>;

/// Immutable snapshot of one mutation instance.
#[derive(Clone, Debug)]
pub struct MutationState<T> {
    pub status: QueryStatus,
    /// Result of the last applied successful attempt.
    pub data: Option<T>,
    /// Failure of the last applied attempt, cleared when a new one starts.
    pub error: Option<FetchError>,
}

impl<T> Default for MutationState<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl<T> MutationState<T> {
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }
}

/// Options of a mutation instance: the write function plus optional
/// lifecycle callbacks.
///
/// Callbacks run only for attempts that are still current when they
/// complete; `on_settled` always runs after `on_success`/`on_error`.
#[derive(Clone)]
pub struct MutationOptions<T, V> {
    pub(crate) mutation_fn: MutationFn<T, V>,
    pub(crate) on_success: Option<SuccessCallback<T, V>>,
    pub(crate) on_error: Option<ErrorCallback<V>>,
    pub(crate) on_settled: Option<SettledCallback<T, V>>,
}

impl<T, V> MutationOptions<T, V> {
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        Self {
            mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Called with the result and the variables after a successful attempt.
    pub fn on_success(mut self, callback: impl Fn(&T, &V) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called with the failure and the variables after a failed attempt.
    pub fn on_error(mut self, callback: impl Fn(&FetchError, &V) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called after every applied attempt, success or failure.
    pub fn on_settled(
        mut self,
        callback: impl Fn(Option<&T>, Option<&FetchError>, &V) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(callback));
        self
    }
}

struct Attempt<T> {
    state: Arc<MutationState<T>>,
    generation: u64,
}

struct MutationInner<T, V> {
    attempt: Mutex<Attempt<T>>,
    options: MutationOptions<T, V>,
}

/// An imperative write operation with per-instance lifecycle state.
///
/// Mutations are not cached and not keyed; each instance tracks only its own
/// most recently initiated attempt. Clones are handles to the same instance.
/// The cache is never touched: callers decide whether to refresh related
/// queries after a write.
pub struct Mutation<T, V> {
    inner: Arc<MutationInner<T, V>>,
}

impl<T, V> Clone for Mutation<T, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, V> Mutation<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: MutationOptions<T, V>) -> Self {
        Self {
            inner: Arc::new(MutationInner {
                attempt: Mutex::new(Attempt {
                    state: Arc::new(MutationState::default()),
                    generation: 0,
                }),
                options,
            }),
        }
    }

    /// The instance's current snapshot.
    pub fn state(&self) -> Arc<MutationState<T>> {
        Arc::clone(&self.inner.attempt.lock().unwrap().state)
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn data(&self) -> Option<T> {
        self.state().data.clone()
    }

    pub fn error(&self) -> Option<FetchError> {
        self.state().error.clone()
    }

    /// Runs the mutation fire-and-forget on the ambient tokio runtime.
    ///
    /// The outcome is reported through the instance state and the callbacks;
    /// a failure is consumed internally and never propagates to the caller.
    pub fn mutate(&self, variables: V) {
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.run(variables).await;
        });
    }

    /// Runs the mutation with the same side effects as [`mutate`](Self::mutate),
    /// returning the outcome so the caller can observe the failure directly.
    pub async fn mutate_async(&self, variables: V) -> FetchResult<T> {
        self.run(variables).await
    }

    /// Returns to idle with `data` and `error` absent.
    ///
    /// An attempt still in flight is superseded: its eventual completion
    /// applies no state and invokes no callbacks.
    pub fn reset(&self) {
        let mut attempt = self.inner.attempt.lock().unwrap();
        attempt.generation += 1;
        attempt.state = Arc::new(MutationState::default());
    }

    async fn run(&self, variables: V) -> FetchResult<T> {
        let generation = {
            let mut attempt = self.inner.attempt.lock().unwrap();
            attempt.generation += 1;
            let prev = Arc::clone(&attempt.state);
            attempt.state = Arc::new(MutationState {
                status: QueryStatus::Loading,
                data: prev.data.clone(),
                error: None,
            });
            attempt.generation
        };

        let result = (*self.inner.options.mutation_fn)(variables.clone()).await;

        let applied = {
            let mut attempt = self.inner.attempt.lock().unwrap();
            if attempt.generation != generation {
                false
            } else {
                let prev = Arc::clone(&attempt.state);
                attempt.state = Arc::new(match &result {
                    Ok(data) => MutationState {
                        status: QueryStatus::Success,
                        data: Some(data.clone()),
                        error: None,
                    },
                    Err(error) => MutationState {
                        status: QueryStatus::Error,
                        data: prev.data.clone(),
                        error: Some(error.clone()),
                    },
                });
                true
            }
        };

        if applied {
            let options = &self.inner.options;
            match &result {
                Ok(data) => {
                    if let Some(on_success) = &options.on_success {
                        on_success(data, &variables);
                    }
                    if let Some(on_settled) = &options.on_settled {
                        on_settled(Some(data), None, &variables);
                    }
                }
                Err(error) => {
                    if let Some(on_error) = &options.on_error {
                        on_error(error, &variables);
                    }
                    if let Some(on_settled) = &options.on_settled {
                        on_settled(None, Some(error), &variables);
                    }
                }
            }
        } else {
            tracing::trace!(generation, "discarding result of superseded mutation attempt");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn(&str) + Clone + Send + Sync + 'static,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let push = {
            let log = Arc::clone(&log);
            move |entry: &str| log.lock().unwrap().push(entry.to_string())
        };
        (log, push)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_invokes_callbacks_in_order() {
        requery_test::setup();
        let (log, push) = recorded();
        let push_settled = push.clone();
        let options = MutationOptions::new(|title: String| async move { Ok(format!("todo:{title}")) })
            .on_success(move |data: &String, variables: &String| {
                push(&format!("success {data} for {variables}"));
            })
            .on_settled(move |data, error, _variables| {
                assert!(error.is_none());
                push_settled(&format!("settled {}", data.unwrap()));
            });
        let mutation = Mutation::new(options);

        let result = mutation.mutate_async("write tests".to_string()).await;
        assert_eq!(result.unwrap(), "todo:write tests");
        assert_eq!(mutation.state().status, QueryStatus::Success);
        assert_eq!(mutation.data().as_deref(), Some("todo:write tests"));
        assert!(mutation.error().is_none());
        assert_eq!(
            &*log.lock().unwrap(),
            &[
                "success todo:write tests for write tests",
                "settled todo:write tests",
            ],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_swallows_failure() {
        requery_test::setup();
        let (log, push) = recorded();
        let push_error = push.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let options = MutationOptions::new({
            let gate = Arc::clone(&gate);
            move |_variables: &'static str| {
                let gate = Arc::clone(&gate);
                async move {
                    let _permit = gate.acquire().await.unwrap();
                    Err::<String, _>(FetchError::from("x"))
                }
            }
        })
        .on_success(move |_data, _variables| push("success"))
        .on_error(move |error, variables| {
            push_error(&format!("error {} for {variables}", error.message()));
        })
        .on_settled(move |_data, _error, _variables| {
            if let Some(done) = done_tx.lock().unwrap().take() {
                done.send(()).unwrap();
            }
        });
        let mutation = Mutation::new(options);

        mutation.mutate("create");
        while !mutation.is_loading() {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);
        done_rx.await.unwrap();

        assert!(!mutation.is_loading());
        assert_eq!(mutation.state().status, QueryStatus::Error);
        assert_eq!(mutation.error().unwrap().message(), "x");
        assert!(mutation.data().is_none(), "data stays absent on failure");
        assert_eq!(&*log.lock().unwrap(), &["error x for create"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_async_surfaces_failure() {
        requery_test::setup();
        let options: MutationOptions<String, &'static str> =
            MutationOptions::new(|_variables| async move { Err(FetchError::from("x")) });
        let mutation = Mutation::new(options);

        let result = mutation.mutate_async("create").await;
        assert_eq!(result.unwrap_err().message(), "x");
        assert_eq!(mutation.state().status, QueryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_supersedes_outstanding_attempt() {
        requery_test::setup();
        let (log, push) = recorded();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let options = MutationOptions::new({
            let gate = Arc::clone(&gate);
            move |_variables: &'static str| {
                let gate = Arc::clone(&gate);
                async move {
                    let _permit = gate.acquire().await.unwrap();
                    Ok("late".to_string())
                }
            }
        })
        .on_success(move |_data, _variables| push("success"));
        let mutation = Mutation::new(options);

        let join = tokio::spawn({
            let mutation = mutation.clone();
            async move { mutation.mutate_async("create").await }
        });
        while !mutation.is_loading() {
            tokio::task::yield_now().await;
        }

        mutation.reset();
        assert_eq!(mutation.state().status, QueryStatus::Idle);

        gate.add_permits(1);
        let result = join.await.unwrap();
        // The caller still observes the outcome; the instance does not.
        assert_eq!(result.unwrap(), "late");
        assert_eq!(mutation.state().status, QueryStatus::Idle);
        assert!(mutation.data().is_none());
        assert!(log.lock().unwrap().is_empty(), "no callbacks for a superseded attempt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_attempt_wins() {
        requery_test::setup();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let options = MutationOptions::new({
            let gate = Arc::clone(&gate);
            move |variables: String| {
                let gate = Arc::clone(&gate);
                async move {
                    let _permit = gate.acquire().await.unwrap();
                    Ok(variables)
                }
            }
        });
        let mutation = Mutation::new(options);

        let first = tokio::spawn({
            let mutation = mutation.clone();
            async move { mutation.mutate_async("first".to_string()).await }
        });
        while !mutation.is_loading() {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let mutation = mutation.clone();
            async move { mutation.mutate_async("second".to_string()).await }
        });

        // Release both attempts; only the most recently initiated one applies.
        gate.add_permits(2);
        let (first, second) = futures::join!(first, second);
        assert_eq!(first.unwrap().unwrap(), "first");
        assert_eq!(second.unwrap().unwrap(), "second");
        assert_eq!(mutation.data().as_deref(), Some("second"));
    }
}
