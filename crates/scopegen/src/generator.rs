//! Producers written as async bodies.
//!
//! A [`Generator`] wraps an async body that hands values to its consumer with
//! [`Co::yield_`] and registers asynchronous cleanup with [`Co::defer`].
//! Cleanup runs last-registered-first when the body returns, fails, or when
//! the generator is closed while suspended. Closing never resumes the body:
//! it is dropped at its last suspension point, so its destructors run first,
//! and then the deferred cleanups are awaited.
//!
//! Generators are single-threaded: the body and its cleanups may hold `Rc`
//! and other `!Send` state across suspension points.

use crate::producer::Producer;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, ready};

type Cleanup<'a, E> = LocalBoxFuture<'a, Result<(), E>>;

struct Shared<'a, T, E> {
    yielded: Option<T>,
    cleanups: Vec<Cleanup<'a, E>>,
}

/// The body's handle on its generator.
pub struct Co<'a, T, E> {
    shared: Rc<RefCell<Shared<'a, T, E>>>,
}

impl<'a, T, E> Co<'a, T, E> {
    /// Hands `value` to the consumer and suspends until the next pull.
    ///
    /// Only meaningful when awaited from the generator's own body.
    pub fn yield_(&self, value: T) -> Yield<'_, 'a, T, E> {
        Yield {
            co: self,
            value: Some(value),
        }
    }

    /// Registers cleanup to run when the generator finishes or is closed.
    pub fn defer<F>(&self, cleanup: F)
    where
        F: Future<Output = Result<(), E>> + 'a,
    {
        self.shared.borrow_mut().cleanups.push(Box::pin(cleanup));
    }
}

impl<T, E> Clone for Co<'_, T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Co<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Co").finish_non_exhaustive()
    }
}

/// Future for [`Co::yield_`].
#[must_use = "values are only handed over when the yield is awaited"]
pub struct Yield<'c, 'a, T, E> {
    co: &'c Co<'a, T, E>,
    value: Option<T>,
}

// `value` is moved out, never pinned.
impl<T, E> Unpin for Yield<'_, '_, T, E> {}

impl<T, E> Future for Yield<'_, '_, T, E> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.value.take() {
            Some(value) => {
                this.co.shared.borrow_mut().yielded = Some(value);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

enum Stage<'a, E> {
    Running(LocalBoxFuture<'a, Result<(), E>>),
    Unwinding {
        /// What the body returned with; only ever handed out by `poll_next`.
        body_failure: Option<E>,
        /// First failure among the deferred cleanups.
        cleanup_failure: Option<E>,
        current: Option<Cleanup<'a, E>>,
    },
    Finished,
}

/// A lazy producer driven by an async body.
///
/// ```
/// use scopegen::{Generator, ProducerExt};
///
/// # futures::executor::block_on(async {
/// let mut numbers = Generator::new(|co| async move {
///     co.defer(async { Ok::<_, String>(()) });
///     for n in 1..=3 {
///         co.yield_(n).await;
///     }
///     Ok(())
/// });
///
/// assert_eq!(numbers.next().await, Some(Ok(1)));
/// assert_eq!(numbers.close().await, Ok(()));
/// assert_eq!(numbers.next().await, None);
/// # });
/// ```
#[must_use = "producers do nothing unless pulled"]
pub struct Generator<'a, T, E> {
    shared: Rc<RefCell<Shared<'a, T, E>>>,
    stage: Stage<'a, E>,
    /// A cleanup failure held back while the body's own failure was reported.
    unreported: Option<E>,
}

// No field is ever pinned in place.
impl<T, E> Unpin for Generator<'_, T, E> {}

impl<'a, T: 'a, E: 'a> Generator<'a, T, E> {
    /// Builds a generator from `body`.
    ///
    /// `body` is called right away to obtain its future, which is not polled
    /// until the first pull.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Co<'a, T, E>) -> Fut,
        Fut: Future<Output = Result<(), E>> + 'a,
    {
        let shared = Rc::new(RefCell::new(Shared {
            yielded: None,
            cleanups: Vec::new(),
        }));
        let body = body(Co {
            shared: shared.clone(),
        });
        Self {
            shared,
            stage: Stage::Running(body.boxed_local()),
            unreported: None,
        }
    }
}

impl<T, E> Generator<'_, T, E> {
    /// Whether the body and every deferred cleanup have completed.
    pub fn is_finished(&self) -> bool {
        matches!(self.stage, Stage::Finished)
    }

    /// Runs pending cleanups. Resolves to the body's failure and the first
    /// cleanup failure, kept apart.
    fn poll_unwind(&mut self, cx: &mut Context<'_>) -> Poll<(Option<E>, Option<E>)> {
        loop {
            let Stage::Unwinding {
                body_failure,
                cleanup_failure,
                current,
            } = &mut self.stage
            else {
                return Poll::Ready((None, None));
            };
            if current.is_none() {
                *current = self.shared.borrow_mut().cleanups.pop();
            }
            match current {
                Some(cleanup) => {
                    let result = ready!(cleanup.poll_unpin(cx));
                    *current = None;
                    if let Err(error) = result {
                        if cleanup_failure.is_none() {
                            *cleanup_failure = Some(error);
                        }
                    }
                }
                None => {
                    let failures = (body_failure.take(), cleanup_failure.take());
                    self.stage = Stage::Finished;
                    tracing::trace!("generator finished unwinding");
                    return Poll::Ready(failures);
                }
            }
        }
    }
}

impl<T, E> Producer for Generator<'_, T, E> {
    type Item = T;
    type Error = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<T, E>>> {
        let this = self.get_mut();
        loop {
            match &mut this.stage {
                Stage::Running(body) => {
                    let outcome = body.poll_unpin(cx);
                    let yielded = this.shared.borrow_mut().yielded.take();
                    match outcome {
                        Poll::Pending => {
                            return match yielded {
                                Some(value) => Poll::Ready(Some(Ok(value))),
                                None => Poll::Pending,
                            };
                        }
                        Poll::Ready(result) => {
                            tracing::trace!(failed = result.is_err(), "generator body returned");
                            this.stage = Stage::Unwinding {
                                body_failure: result.err(),
                                cleanup_failure: None,
                                current: None,
                            };
                            if let Some(value) = yielded {
                                return Poll::Ready(Some(Ok(value)));
                            }
                        }
                    }
                }
                Stage::Unwinding { .. } => {
                    let (body_failure, cleanup_failure) = ready!(this.poll_unwind(cx));
                    return Poll::Ready(match body_failure {
                        Some(error) => {
                            this.unreported = cleanup_failure;
                            Some(Err(error))
                        }
                        None => cleanup_failure.map(Err),
                    });
                }
                Stage::Finished => return Poll::Ready(this.unreported.take().map(Err)),
            }
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), E>> {
        let this = self.get_mut();
        if let Stage::Running(_) = this.stage {
            tracing::trace!("closing generator at its last suspension point");
            this.stage = Stage::Unwinding {
                body_failure: None,
                cleanup_failure: None,
                current: None,
            };
            this.shared.borrow_mut().yielded = None;
        }
        let (body_failure, cleanup_failure) = ready!(this.poll_unwind(cx));
        if body_failure.is_some() {
            // The pull that would have delivered it was abandoned.
            tracing::trace!("discarding undelivered production failure on close");
        }
        match cleanup_failure.or_else(|| this.unreported.take()) {
            Some(error) => Poll::Ready(Err(error)),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<T, E> fmt::Debug for Generator<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Running(_) => "running",
            Stage::Unwinding { .. } => "unwinding",
            Stage::Finished => "finished",
        };
        f.debug_struct("Generator")
            .field("stage", &stage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::ProducerExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct OnDrop(Arc<Log>, &'static str);

    impl Drop for OnDrop {
        fn drop(&mut self) {
            self.0.push(self.1);
        }
    }

    fn counting(log: Arc<Log>, upto: u32) -> Generator<'static, u32, String> {
        Generator::new(move |co| async move {
            let _guard = OnDrop(log.clone(), "guard dropped");
            let cleanup_log = log.clone();
            co.defer(async move {
                tokio::task::yield_now().await;
                cleanup_log.push("cleanup");
                Ok(())
            });
            for n in 1..=upto {
                log.push(format!("produce {n}"));
                co.yield_(n).await;
            }
            log.push("body done");
            Ok(())
        })
    }

    #[tokio::test]
    async fn body_does_not_run_before_first_pull() {
        let started = Arc::new(AtomicUsize::new(0));
        let flag = started.clone();
        let mut generator = Generator::new(move |co: Co<'static, u8, ()>| async move {
            flag.fetch_add(1, Ordering::SeqCst);
            co.yield_(1).await;
            Ok(())
        });

        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(generator.next().await, Some(Ok(1)));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn yields_in_order_then_runs_cleanup() {
        let log = Arc::new(Log::default());
        let mut generator = counting(log.clone(), 3);

        let mut seen = Vec::new();
        while let Some(value) = generator.next().await {
            seen.push(value.unwrap());
        }

        assert_eq!(seen, vec![1, 2, 3]);
        assert!(generator.is_finished());
        assert_eq!(
            log.entries(),
            vec!["produce 1", "produce 2", "produce 3", "body done", "guard dropped", "cleanup"]
        );
    }

    #[tokio::test]
    async fn close_while_suspended_skips_the_rest_of_the_body() {
        let log = Arc::new(Log::default());
        let mut generator = counting(log.clone(), 5);

        assert_eq!(generator.next().await, Some(Ok(1)));
        assert_eq!(generator.next().await, Some(Ok(2)));
        assert_eq!(generator.close().await, Ok(()));

        assert_eq!(
            log.entries(),
            vec!["produce 1", "produce 2", "guard dropped", "cleanup"]
        );
        assert_eq!(generator.next().await, None);

        assert_eq!(generator.close().await, Ok(()));
        assert_eq!(log.entries().iter().filter(|e| *e == "cleanup").count(), 1);
    }

    #[tokio::test]
    async fn close_before_start_never_runs_the_body() {
        let log = Arc::new(Log::default());
        let mut generator = counting(log.clone(), 3);

        assert_eq!(generator.close().await, Ok(()));
        assert!(log.entries().is_empty());
        assert_eq!(generator.next().await, None);
    }

    #[tokio::test]
    async fn body_failure_is_reported_after_cleanup() {
        let log = Arc::new(Log::default());
        let body_log = log.clone();
        let mut generator = Generator::new(move |co| async move {
            let cleanup_log = body_log.clone();
            co.defer(async move {
                cleanup_log.push("cleanup");
                Ok(())
            });
            co.yield_(1).await;
            Err("boom".to_string())
        });

        assert_eq!(generator.next().await, Some(Ok(1)));
        assert_eq!(log.entries(), Vec::<String>::new());
        assert_eq!(generator.next().await, Some(Err("boom".to_string())));
        assert_eq!(log.entries(), vec!["cleanup"]);
        assert_eq!(generator.next().await, None);
    }

    #[tokio::test]
    async fn cleanups_run_last_registered_first_and_all_run_on_failure() {
        let log = Arc::new(Log::default());
        let body_log = log.clone();
        let mut generator = Generator::new(move |co| async move {
            for name in ["outer", "middle", "inner"] {
                let log = body_log.clone();
                co.defer(async move {
                    log.push(name);
                    if name == "inner" {
                        Ok(())
                    } else {
                        Err(format!("{name} failed"))
                    }
                });
            }
            co.yield_(0u8).await;
            Ok(())
        });

        assert_eq!(generator.next().await, Some(Ok(0)));
        assert_eq!(generator.close().await, Err("middle failed".to_string()));
        assert_eq!(log.entries(), vec!["inner", "middle", "outer"]);
        assert_eq!(generator.close().await, Ok(()));
    }

    #[tokio::test]
    async fn body_and_cleanup_failures_are_both_reported() {
        let mut generator = Generator::new(|co| async move {
            co.defer(async { Err("cleanup failed".to_string()) });
            co.yield_(1).await;
            Err("body failed".to_string())
        });

        assert_eq!(generator.next().await, Some(Ok(1)));
        assert_eq!(generator.next().await, Some(Err("body failed".to_string())));
        assert_eq!(generator.next().await, Some(Err("cleanup failed".to_string())));
        assert_eq!(generator.next().await, None);
        assert_eq!(generator.close().await, Ok(()));
    }

    #[tokio::test]
    async fn abandoned_pull_does_not_turn_body_failure_into_close_failure() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let count = cleanups.clone();
        let mut generator = Generator::new(move |co| async move {
            co.defer(async move {
                tokio::task::yield_now().await;
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            co.yield_(1).await;
            Err("producer broke".to_string())
        });

        assert_eq!(generator.next().await, Some(Ok(1)));
        // The second pull suspends inside the cleanup and is then dropped.
        assert!(futures::poll!(generator.next()).is_pending());

        assert_eq!(generator.close().await, Ok(()));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(generator.next().await, None);
    }

    #[tokio::test]
    async fn body_may_hold_local_state() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let connection = Rc::new(RefCell::new(vec!["open".to_string()]));
        let held = connection.clone();
        let mut generator = Generator::new(move |co| async move {
            let released = held.clone();
            co.defer(async move {
                released.borrow_mut().push("released".to_string());
                Ok::<_, ()>(())
            });
            for row in ["a", "b"] {
                held.borrow_mut().push(format!("read {row}"));
                co.yield_(row).await;
            }
            Ok(())
        });

        assert_eq!(generator.next().await, Some(Ok("a")));
        assert_eq!(generator.close().await, Ok(()));
        assert_eq!(*connection.borrow(), vec!["open", "read a", "released"]);
    }
}
