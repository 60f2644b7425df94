//! The channel pair and its composition operators.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::sink::ChannelSink;
use crate::stream::ChannelStream;
use futures_util::StreamExt;
use tracing::trace;

/// One endpoint of a logical connection: a single-subscription incoming
/// stream paired with an outgoing sink.
///
/// The stream half is owned by the channel and handed out exactly once
/// ([`split`] or [`stream_mut`]); the sink half is a cloneable handle.
/// Construct one directly from parts, or through the factories in this
/// crate ([`guarantee`], [`ChannelController`], [`port_channel`], ...).
///
/// [`split`]: Self::split
/// [`stream_mut`]: Self::stream_mut
/// [`guarantee`]: crate::guarantee
/// [`ChannelController`]: crate::ChannelController
/// [`port_channel`]: crate::port_channel
#[derive(Debug)]
pub struct Channel<T> {
    stream: ChannelStream<T>,
    sink: ChannelSink<T>,
}

impl<T: Send + 'static> Channel<T> {
    /// Pairs an arbitrary stream and sink into a channel.
    ///
    /// The parts are taken as they are; to obtain the full lifecycle
    /// contract from loose parts, use [`guarantee`](crate::guarantee).
    pub fn new(stream: ChannelStream<T>, sink: ChannelSink<T>) -> Self {
        Self { stream, sink }
    }

    /// Splits the channel into its halves.
    pub fn split(self) -> (ChannelStream<T>, ChannelSink<T>) {
        (self.stream, self.sink)
    }

    /// The incoming stream, for polling in place.
    pub fn stream_mut(&mut self) -> &mut ChannelStream<T> {
        &mut self.stream
    }

    /// A handle to the outgoing sink.
    pub fn sink(&self) -> ChannelSink<T> {
        self.sink.clone()
    }

    /// Connects this channel back-to-back with another.
    ///
    /// Each channel's stream is fed into the other's sink; a terminal on
    /// either stream closes the opposite sink. Resolves when both
    /// directions have finished.
    pub async fn pipe(self, other: Channel<T>) {
        let (stream_a, sink_a) = self.split();
        let (stream_b, sink_b) = other.split();
        futures_util::future::join(pump_into(stream_a, sink_b), pump_into(stream_b, sink_a))
            .await;
    }

    /// Applies a transformer to this channel.
    pub fn transform<O, X>(self, transformer: X) -> Channel<O>
    where
        X: Transformer<T, O>,
    {
        transformer.bind(self)
    }

    /// Replaces the stream half, keeping the sink untouched.
    ///
    /// The replacement must preserve the channel contract.
    pub fn change_stream<F>(self, change: F) -> Channel<T>
    where
        F: FnOnce(ChannelStream<T>) -> ChannelStream<T>,
    {
        Channel {
            stream: change(self.stream),
            sink: self.sink,
        }
    }

    /// Replaces the sink half, keeping the stream untouched.
    ///
    /// The replacement must preserve the channel contract.
    pub fn change_sink<F>(self, change: F) -> Channel<T>
    where
        F: FnOnce(ChannelSink<T>) -> ChannelSink<T>,
    {
        Channel {
            stream: self.stream,
            sink: change(self.sink),
        }
    }
}

/// Feeds every event of `stream` into `sink`, then closes the sink.
async fn pump_into<T: Send + 'static>(mut stream: ChannelStream<T>, sink: ChannelSink<T>) {
    while let Some(event) = stream.next().await {
        let result = match event {
            Ok(value) => sink.add(value),
            Err(error) => sink.add_error(error),
        };
        if result.is_err() {
            // The sink was closed under us; stop forwarding.
            trace!("pipe target closed, dropping remaining events");
            break;
        }
    }
    sink.close().ok();
}

/// Anything that can wrap a channel into another channel.
///
/// Transformers must preserve the channel contract: binding a conforming
/// channel yields a conforming channel.
pub trait Transformer<I, O> {
    fn bind(self, channel: Channel<I>) -> Channel<O>;
}

/// A channel that forwards to an inner channel.
///
/// Contributes no behavior of its own; embed one to build a decorator
/// that overrides only part of the channel surface.
#[derive(Debug)]
pub struct ChannelView<T> {
    inner: Channel<T>,
}

impl<T: Send + 'static> ChannelView<T> {
    pub fn new(inner: Channel<T>) -> Self {
        Self { inner }
    }

    pub fn stream_mut(&mut self) -> &mut ChannelStream<T> {
        self.inner.stream_mut()
    }

    pub fn sink(&self) -> ChannelSink<T> {
        self.inner.sink()
    }

    pub fn get_ref(&self) -> &Channel<T> {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut Channel<T> {
        &mut self.inner
    }

    pub fn into_inner(self) -> Channel<T> {
        self.inner
    }
}
