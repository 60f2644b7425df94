//! The incoming half of a channel.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::error::Event;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// The incoming half of a channel: an ordered, finite sequence of events
/// with exactly one terminal.
///
/// Ownership is the subscription. There is only ever one `ChannelStream`
/// per channel, so a second subscriber cannot exist.
///
/// A stream may carry a stop token raised when the outgoing half closes or
/// a disconnector fires. A raised token forces the terminal immediately,
/// ahead of anything still buffered.
pub struct ChannelStream<T> {
    inner: BoxStream<'static, Event<T>>,
    stop: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    terminated: bool,
}

impl<T> ChannelStream<T> {
    /// Wraps an arbitrary event stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Event<T>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            stop: None,
            terminated: false,
        }
    }

    /// Like [`from_stream`](Self::from_stream), with a stop token that
    /// preempts buffered items once cancelled.
    pub(crate) fn with_stop<S>(stream: S, stop: CancellationToken) -> Self
    where
        S: Stream<Item = Event<T>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            stop: Some(Box::pin(stop.cancelled_owned())),
            terminated: false,
        }
    }
}

impl<T> Stream for ChannelStream<T> {
    type Item = Event<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        // The stop token wins over buffered items.
        if let Some(stop) = &mut this.stop {
            if stop.as_mut().poll(cx).is_ready() {
                this.terminated = true;
                return Poll::Ready(None);
            }
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T> std::fmt::Debug for ChannelStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// `Stream` view of a tokio unbounded receiver.
pub(crate) struct RecvStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> RecvStream<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }
}

impl<T> Stream for RecvStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
