//! A channel whose real endpoints are supplied later.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::Channel;
use crate::error::{ChannelError, Event};
use crate::sink::{queue_sink, SinkItem, SinkQueue};
use crate::stream::{ChannelStream, RecvStream};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::trace;

/// Hands out a channel now and connects it to a source channel later.
///
/// The placeholder channel is fully usable from the start: values added to
/// its sink are buffered in order and flushed into the source's sink once
/// [`supply`] is called, and the source's stream becomes the placeholder's
/// stream. [`fail`] instead delivers a single error and a terminal.
///
/// Exactly one of `supply` / `fail` may be called, once.
///
/// [`supply`]: Self::supply
/// [`fail`]: Self::fail
pub struct ChannelCompleter<T> {
    pending: Option<Pending<T>>,
}

struct Pending<T> {
    queue: SinkQueue<T>,
    in_tx: mpsc::UnboundedSender<Event<T>>,
}

impl<T: Send + 'static> ChannelCompleter<T> {
    /// Creates a completer and its placeholder channel.
    pub fn new() -> (Self, Channel<T>) {
        let (sink, queue) = queue_sink(None, false);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = Channel::new(ChannelStream::from_stream(RecvStream::new(in_rx)), sink);
        let completer = Self {
            pending: Some(Pending { queue, in_tx }),
        };
        (completer, channel)
    }

    /// Routes the placeholder through `source`.
    ///
    /// Buffered sink traffic is flushed into `source`'s sink in order;
    /// from then on both halves pass straight through.
    pub fn supply(&mut self, source: Channel<T>) -> Result<(), ChannelError> {
        let pending = self.pending.take().ok_or(ChannelError::AlreadyCompleted)?;
        let (source_stream, source_sink) = source.split();
        let Pending { queue, in_tx } = pending;
        tokio::spawn(forward_outgoing(queue, source_sink));
        tokio::spawn(forward_incoming(source_stream, in_tx));
        Ok(())
    }

    /// Completes the placeholder with an error instead of a channel.
    ///
    /// The stream emits `error` once and terminates; the sink drops
    /// everything already buffered and everything yet to come, and its
    /// `done` resolves cleanly.
    pub fn fail(&mut self, error: ChannelError) -> Result<(), ChannelError> {
        let pending = self.pending.take().ok_or(ChannelError::AlreadyCompleted)?;
        pending.in_tx.send(Err(error)).ok();
        // Dropping the queue receiver turns all sink traffic into no-ops.
        pending.queue.cell.resolve(Ok(()));
        Ok(())
    }
}

async fn forward_outgoing<T: Send + 'static>(
    mut queue: SinkQueue<T>,
    sink: crate::sink::ChannelSink<T>,
) {
    while let Some(item) = queue.rx.recv().await {
        match item {
            SinkItem::Event(Ok(value)) => {
                sink.add(value).ok();
            }
            SinkItem::Event(Err(error)) => {
                sink.add_error(error).ok();
            }
            SinkItem::Close => break,
        }
    }
    trace!("placeholder sink finished, closing the source sink");
    let result = match sink.close() {
        Ok(done) => done.wait().await,
        Err(error) => Err(error),
    };
    queue.cell.resolve(result);
}

async fn forward_incoming<T: Send + 'static>(
    mut stream: ChannelStream<T>,
    in_tx: mpsc::UnboundedSender<Event<T>>,
) {
    while let Some(event) = stream.next().await {
        // A parted subscriber drops events; keep draining so the source
        // stream still reaches its terminal.
        in_tx.send(event).ok();
    }
}
