//! The producer protocol.
//!
//! A producer is a lazy asynchronous sequence that can be pulled for its next
//! value and closed. Closing runs whatever cleanup the producer still has
//! pending and makes every later pull report completion.

use futures::TryStream;
use pin_project::pin_project;
use std::future::Future;
use std::ops::DerefMut;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A lazy asynchronous sequence with an explicit, asynchronous close.
pub trait Producer {
    /// Values produced by the sequence.
    type Item;

    /// Failures raised by production or by closing.
    type Error;

    /// Attempts to pull the next value.
    ///
    /// `Poll::Ready(None)` signals that the sequence is complete.
    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Item, Self::Error>>>;

    /// Drives the producer's pending cleanup to completion.
    ///
    /// Must be safe to call before the first pull and after a previous close
    /// completed; both cases finish immediately with `Ok(())` once nothing is
    /// left to clean up.
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
}

impl<P: ?Sized + Producer + Unpin> Producer for &mut P {
    type Item = P::Item;
    type Error = P::Error;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Item, Self::Error>>> {
        P::poll_next(Pin::new(&mut **self), cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        P::poll_close(Pin::new(&mut **self), cx)
    }
}

impl<P: ?Sized + Producer + Unpin> Producer for Box<P> {
    type Item = P::Item;
    type Error = P::Error;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Item, Self::Error>>> {
        Pin::new(&mut **self).poll_next(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut **self).poll_close(cx)
    }
}

impl<Ptr> Producer for Pin<Ptr>
where
    Ptr: DerefMut + Unpin,
    Ptr::Target: Producer,
{
    type Item = <Ptr::Target as Producer>::Item;
    type Error = <Ptr::Target as Producer>::Error;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Item, Self::Error>>> {
        self.get_mut().as_mut().poll_next(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().as_mut().poll_close(cx)
    }
}

/// Convenience futures for driving an [`Unpin`] producer by hand.
pub trait ProducerExt: Producer {
    /// Pulls the next value. Resolves to `None` once the producer is done.
    fn next(&mut self) -> Next<'_, Self>
    where
        Self: Unpin,
    {
        Next { producer: self }
    }

    /// Closes the producer, running its pending cleanup.
    fn close(&mut self) -> Close<'_, Self>
    where
        Self: Unpin,
    {
        Close { producer: self }
    }
}

impl<P: ?Sized + Producer> ProducerExt for P {}

/// Future for [`ProducerExt::next`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Next<'a, P: ?Sized> {
    producer: &'a mut P,
}

impl<P: ?Sized + Producer + Unpin> Future for Next<'_, P> {
    type Output = Option<Result<P::Item, P::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut *self.producer).poll_next(cx)
    }
}

/// Future for [`ProducerExt::close`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Close<'a, P: ?Sized> {
    producer: &'a mut P,
}

impl<P: ?Sized + Producer + Unpin> Future for Close<'_, P> {
    type Output = Result<(), P::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut *self.producer).poll_close(cx)
    }
}

/// A producer backed by a [`TryStream`].
///
/// Closing drops the stream, which releases whatever it holds through its
/// destructors.
#[pin_project]
#[derive(Debug)]
#[must_use = "producers do nothing unless pulled"]
pub struct FromStream<S> {
    #[pin]
    stream: Option<S>,
}

impl<S> FromStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Whether the stream has been dropped by a close.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl<S: TryStream> Producer for FromStream<S> {
    type Item = S::Ok;
    type Error = S::Error;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Item, Self::Error>>> {
        match self.project().stream.as_pin_mut() {
            Some(stream) => stream.try_poll_next(cx),
            None => Poll::Ready(None),
        }
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut stream = self.project().stream;
        if stream.is_some() {
            tracing::trace!("dropping stream on close");
            stream.set(None);
        }
        Poll::Ready(Ok(()))
    }
}
