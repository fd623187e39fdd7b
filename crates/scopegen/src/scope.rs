//! Scoped consumption of a producer.
//!
//! [`ScopedStream`] is both a scoped resource ([`ScopedResource`]) and a
//! [`Stream`]. Entering the scope hands out the producer itself; exiting it,
//! on every path, closes the producer exactly once before any failure is
//! returned to the caller.

use crate::error::Error;
use crate::producer::{FromStream, Producer};
use futures::TryStream;
use futures::stream::{FusedStream, Stream};
use futures::task::noop_waker_ref;
use pin_project::{pin_project, pinned_drop};
use std::fmt;
use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// Lifecycle of a [`ScopedStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed; the producer has not been touched.
    Created,
    /// The scope was entered or iteration has started.
    Active,
    /// The scope was exited or the producer is exhausted. Terminal.
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Created => "created",
            State::Active => "active",
            State::Closed => "closed",
        })
    }
}

/// Why a scope is being exited.
#[derive(Debug)]
pub enum ExitReason<X> {
    /// The scope body ran to completion.
    Completed,
    /// The scope body stopped pulling before the producer was exhausted.
    Break,
    /// The scope body failed; the failure is returned again once the
    /// producer is closed.
    Failed(X),
}

impl<X> ExitReason<X> {
    fn label(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::Break => "break",
            ExitReason::Failed(_) => "failed",
        }
    }
}

/// What to do with a producer that is still open when its [`ScopedStream`]
/// is dropped, e.g. because the task owning it was cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DropClose {
    /// Poll the producer's close once with a no-op waker. Cleanup that
    /// finishes without suspending runs; the rest is dropped with the producer
    /// and never completes. A [`Generator`](crate::Generator) cleanup that
    /// awaits I/O or a timer is skipped this way.
    #[default]
    PollOnce,
    /// Block the dropping thread until the close completes.
    ///
    /// Deadlocks if the close waits on the executor running on this thread.
    Block,
    /// Only drop the producer.
    Skip,
}

/// A scoped resource: entering hands out a resource, exiting releases it.
pub trait ScopedResource {
    type Resource<'a>
    where
        Self: 'a;
    type Error;

    fn enter(&mut self) -> impl Future<Output = Result<Self::Resource<'_>, Self::Error>>;

    fn exit(
        &mut self,
        reason: ExitReason<Self::Error>,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Unentered,
    Entered,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Exhausted,
    Exited { reported: bool },
}

/// Wraps a [`Producer`] so that it can be consumed inside a scope, or
/// iterated directly as a [`Stream`].
///
/// ```
/// use scopegen::{Error, Generator, ProducerExt, ScopedStream};
///
/// # futures::executor::block_on(async {
/// let mut numbers = ScopedStream::new(Generator::new(|co| async move {
///     for n in 1..=5 {
///         co.yield_(n).await;
///     }
///     Ok::<_, String>(())
/// }));
///
/// let firsts = numbers
///     .scope(async |producer| {
///         let a = producer.next().await.transpose().map_err(Error::Producer)?;
///         let b = producer.next().await.transpose().map_err(Error::Producer)?;
///         Ok::<_, Error<String>>((a, b))
///     })
///     .await;
///
/// assert_eq!(firsts.unwrap(), (Some(1), Some(2)));
/// assert!(numbers.is_producer_closed());
/// # });
/// ```
#[pin_project(PinnedDrop)]
#[must_use = "streams do nothing unless polled"]
pub struct ScopedStream<P: Producer> {
    #[pin]
    producer: P,
    state: State,
    end: Option<End>,
    entry: Entry,
    producer_closed: bool,
    on_drop: DropClose,
}

impl<P: Producer> ScopedStream<P> {
    /// Wraps `producer`, which must not have been pulled yet.
    pub fn new(producer: P) -> Self {
        Self {
            producer,
            state: State::Created,
            end: None,
            entry: Entry::Unentered,
            producer_closed: false,
            on_drop: DropClose::default(),
        }
    }

    /// Sets what happens to a still-open producer when this is dropped.
    pub fn on_drop(mut self, policy: DropClose) -> Self {
        self.on_drop = policy;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the producer's close has run to completion.
    pub fn is_producer_closed(&self) -> bool {
        self.producer_closed
    }

    /// The stream itself, for direct iteration.
    pub fn iter(&mut self) -> &mut Self {
        self
    }

    fn poll_pull(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<P::Item, Error<P::Error>>> {
        let this = self.project();
        match *this.state {
            State::Closed => {
                return Poll::Ready(Err(match this.end {
                    Some(End::Exhausted) => Error::Exhausted,
                    _ => Error::invalid_state("pull from", State::Closed),
                }));
            }
            State::Created => {
                tracing::trace!("starting direct iteration");
                *this.state = State::Active;
            }
            State::Active => {}
        }

        Poll::Ready(match ready!(this.producer.poll_next(cx)) {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => Err(Error::Producer(error)),
            None => {
                tracing::debug!("producer exhausted");
                *this.state = State::Closed;
                *this.end = Some(End::Exhausted);
                Err(Error::Exhausted)
            }
        })
    }

    fn poll_close_producer(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), P::Error>> {
        let this = self.project();
        if *this.producer_closed {
            return Poll::Ready(Ok(()));
        }
        let result = ready!(this.producer.poll_close(cx));
        *this.producer_closed = true;
        Poll::Ready(result)
    }
}

impl<S: TryStream> ScopedStream<FromStream<S>> {
    /// Wraps a stream; closing the scope drops it.
    pub fn from_stream(stream: S) -> Self {
        Self::new(FromStream::new(stream))
    }
}

impl<P: Producer + Unpin> ScopedStream<P> {
    /// Enters the scope, handing out the producer for manual pulls.
    pub async fn enter(&mut self) -> Result<&mut P, Error<P::Error>> {
        if self.entry != Entry::Unentered || self.state == State::Closed {
            return Err(Error::invalid_state("enter", self.state));
        }
        self.entry = Entry::Entered;
        self.state = State::Active;
        tracing::debug!("entered producer scope");
        Ok(&mut self.producer)
    }

    /// Exits the scope, closing the producer.
    ///
    /// A [`ExitReason::Failed`] cause is returned as the error once the
    /// producer is closed. If closing fails as well, both are returned in
    /// [`Error::Unwound`].
    ///
    /// Exiting a scope that was never entered, or was already exited, fails
    /// with [`Error::InvalidState`]; a `Failed` cause is kept as its
    /// [`Error::cause`].
    pub async fn exit(&mut self, reason: ExitReason<Error<P::Error>>) -> Result<(), Error<P::Error>> {
        let closed = match self.close_scope().await {
            Ok(closed) => closed,
            Err(rejected) => {
                return Err(match reason {
                    ExitReason::Failed(cause) => rejected.with_cause(cause),
                    _ => rejected,
                });
            }
        };
        tracing::debug!(reason = reason.label(), "exited producer scope");
        match (reason, closed) {
            (ExitReason::Failed(cause), closed) => Err(unwound(cause, closed)),
            (_, Ok(())) => Ok(()),
            (_, Err(closure)) => Err(Error::Closure(closure)),
        }
    }

    /// Runs `body` inside the scope. The producer is closed before this
    /// returns, whether `body` succeeded or not.
    ///
    /// If the returned future is dropped before it completes, the producer is
    /// closed when this `ScopedStream` is dropped, following its
    /// [`DropClose`] policy. Under the default policy, cleanup that has to
    /// suspend does not run; call [`exit`](Self::exit) or use
    /// [`DropClose::Block`] when it must.
    pub async fn scope<R>(
        &mut self,
        body: impl AsyncFnOnce(&mut P) -> Result<R, Error<P::Error>>,
    ) -> Result<R, Error<P::Error>> {
        let producer = self.enter().await?;
        let outcome = body(producer).await;
        match outcome {
            Ok(value) => self.exit(ExitReason::Completed).await.map(|()| value),
            Err(cause) => {
                let closed = match self.close_scope().await {
                    Ok(closed) => closed,
                    Err(rejected) => return Err(rejected.with_cause(cause)),
                };
                tracing::debug!(reason = "failed", "exited producer scope");
                Err(unwound(cause, closed))
            }
        }
    }

    /// Pulls the next value, failing with [`Error::Exhausted`] once the
    /// producer is done and with [`Error::InvalidState`] after the scope
    /// was exited.
    pub async fn pull(&mut self) -> Result<P::Item, Error<P::Error>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_pull(cx)).await
    }

    async fn close_scope(&mut self) -> Result<Result<(), P::Error>, Error<P::Error>> {
        if self.entry != Entry::Entered {
            return Err(Error::invalid_state("exit", self.state));
        }
        self.entry = Entry::Exited;
        self.state = State::Closed;
        if self.end.is_none() {
            self.end = Some(End::Exited { reported: false });
        }
        Ok(poll_fn(|cx| Pin::new(&mut *self).poll_close_producer(cx)).await)
    }
}

fn unwound<E>(cause: Error<E>, closed: Result<(), E>) -> Error<E> {
    match closed {
        Ok(()) => cause,
        Err(closure) => Error::Unwound {
            cause: Box::new(cause),
            closure,
        },
    }
}

impl<P: Producer + Unpin> ScopedResource for ScopedStream<P> {
    type Resource<'a>
        = &'a mut P
    where
        Self: 'a;
    type Error = Error<P::Error>;

    fn enter(&mut self) -> impl Future<Output = Result<Self::Resource<'_>, Self::Error>> {
        ScopedStream::enter(self)
    }

    fn exit(
        &mut self,
        reason: ExitReason<Self::Error>,
    ) -> impl Future<Output = Result<(), Self::Error>> {
        ScopedStream::exit(self, reason)
    }
}

impl<P: Producer> Stream for ScopedStream<P> {
    type Item = Result<P::Item, Error<P::Error>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(End::Exited { reported }) = self.as_mut().project().end {
            if *reported {
                return Poll::Ready(None);
            }
            *reported = true;
            return Poll::Ready(Some(Err(Error::invalid_state("pull from", State::Closed))));
        }

        Poll::Ready(match ready!(self.poll_pull(cx)) {
            Ok(value) => Some(Ok(value)),
            Err(Error::Exhausted) => None,
            Err(error) => Some(Err(error)),
        })
    }
}

impl<P: Producer> FusedStream for ScopedStream<P> {
    fn is_terminated(&self) -> bool {
        match self.end {
            Some(End::Exhausted) => true,
            Some(End::Exited { reported }) => reported,
            None => false,
        }
    }
}

#[pinned_drop]
impl<P: Producer> PinnedDrop for ScopedStream<P> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.producer_closed {
            return;
        }

        let mut producer = this.producer;
        match *this.on_drop {
            DropClose::Skip => {
                tracing::debug!("dropping producer without closing it");
            }
            DropClose::PollOnce => {
                let mut cx = Context::from_waker(noop_waker_ref());
                match producer.as_mut().poll_close(&mut cx) {
                    Poll::Ready(_) => {
                        *this.producer_closed = true;
                        tracing::debug!("closed producer on drop");
                    }
                    Poll::Pending => {
                        tracing::debug!("producer close suspended on drop, dropping it");
                    }
                }
            }
            DropClose::Block => {
                let _ = futures::executor::block_on(poll_fn(|cx| producer.as_mut().poll_close(cx)));
                *this.producer_closed = true;
                tracing::debug!("closed producer on drop");
            }
        }
    }
}

impl<P: Producer + fmt::Debug> fmt::Debug for ScopedStream<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedStream")
            .field("producer", &self.producer)
            .field("state", &self.state)
            .field("producer_closed", &self.producer_closed)
            .field("on_drop", &self.on_drop)
            .finish_non_exhaustive()
    }
}
