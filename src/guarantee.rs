//! Contract guarantees around an arbitrary stream/sink pair.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::Channel;
use crate::error::{ChannelError, Event};
use crate::sink::{queue_sink, SinkItem, SinkQueue};
use crate::stream::{ChannelStream, RecvStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Adapts a loose stream/sink pair into a [`Channel`] honoring the full
/// lifecycle contract:
///
/// - events arriving before the subscriber attaches are buffered in order;
/// - closing the sink forces the stream to its terminal at once and
///   resolves `done` after the underlying sink has closed;
/// - once the stream terminates, the sink drops further data silently
///   while `close` still resolves `done`;
/// - dropping the stream does not affect the sink.
///
/// With `allow_errors` set, error events travel through to the underlying
/// sink; otherwise the first error closes the sink and resolves `done`
/// with it, and nothing more reaches the remote.
pub fn guarantee<T, S, K>(stream: S, sink: K, allow_errors: bool) -> Channel<T>
where
    T: Send + 'static,
    S: Stream<Item = Event<T>> + Send + Unpin + 'static,
    K: Sink<Event<T>> + Send + Unpin + 'static,
    K::Error: std::fmt::Display,
{
    let stop = CancellationToken::new();
    let (sink_handle, queue) = queue_sink(Some(stop.clone()), !allow_errors);
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(stream, sink, queue, in_tx, stop.clone()));
    Channel::new(
        ChannelStream::with_stop(RecvStream::new(in_rx), stop),
        sink_handle,
    )
}

/// Couples the two halves: one task owns both underlying parts, so there
/// is exactly one place where lifecycle transitions happen.
#[tracing::instrument(skip_all, level = "trace")]
async fn pump<T, S, K>(
    mut incoming: S,
    mut outgoing: K,
    mut queue: SinkQueue<T>,
    in_tx: mpsc::UnboundedSender<Event<T>>,
    stop: CancellationToken,
) where
    T: Send + 'static,
    S: Stream<Item = Event<T>> + Send + Unpin + 'static,
    K: Sink<Event<T>> + Send + Unpin + 'static,
    K::Error: std::fmt::Display,
{
    // `None` once the incoming stream has terminated.
    let mut in_tx = Some(in_tx);
    loop {
        tokio::select! {
            item = queue.rx.recv() => match item {
                Some(SinkItem::Event(event)) => {
                    if in_tx.is_none() {
                        trace!("dropping event added after the stream terminal");
                        continue;
                    }
                    if let Err(error) = outgoing.send(event).await {
                        debug!("underlying sink failed: {error}");
                        queue.cell.resolve(Err(ChannelError::Transport(error.to_string())));
                        stop.cancel();
                        break;
                    }
                }
                Some(SinkItem::Close) | None => {
                    // If the remote terminal came first, `done` has already
                    // resolved and the underlying sink is left alone.
                    if in_tx.is_some() {
                        let result = outgoing
                            .close()
                            .await
                            .map_err(|error| ChannelError::Transport(error.to_string()));
                        queue.cell.resolve(result);
                    }
                    stop.cancel();
                    break;
                }
            },
            event = incoming.next(), if in_tx.is_some() => match event {
                Some(event) => {
                    // Buffered until the subscriber attaches. A parted
                    // subscriber drops events without affecting the sink.
                    if let Some(tx) = &in_tx {
                        tx.send(event).ok();
                    }
                }
                None => {
                    trace!("incoming stream terminated");
                    in_tx = None;
                    queue.cell.resolve(Ok(()));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::QueueSink;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    type Parts = (
        mpsc::UnboundedSender<Event<u32>>,
        mpsc::UnboundedReceiver<Event<u32>>,
        Channel<u32>,
    );

    /// A guaranteed channel plus the remote ends of its underlying parts.
    fn harness(allow_errors: bool) -> Parts {
        let (source_tx, source_rx) = mpsc::unbounded_channel();
        let (under_tx, under_rx) = mpsc::unbounded_channel();
        let channel = guarantee(
            RecvStream::new(source_rx),
            QueueSink::new(under_tx),
            allow_errors,
        );
        (source_tx, under_rx, channel)
    }

    #[tokio::test]
    async fn fail_on_error_closes_everything_with_the_error() {
        let (_source_tx, mut under_rx, channel) = harness(false);
        let (mut stream, sink) = channel.split();
        sink.add_error(ChannelError::Remote("oh no".into())).unwrap();
        assert_eq!(
            sink.done().wait().await,
            Err(ChannelError::Remote("oh no".into()))
        );
        assert_eq!(stream.next().await, None);
        // Nothing reached the remote.
        assert!(under_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closing_the_sink_preempts_buffered_events() {
        let (source_tx, _under_rx, channel) = harness(true);
        let (mut stream, sink) = channel.split();
        for value in [1, 2, 3] {
            source_tx.send(Ok(value)).unwrap();
        }
        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Ok(2)));
        sink.close().unwrap();
        // `3` may still be buffered, but the terminal comes first.
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn sink_receives_values_then_terminal() {
        let (_source_tx, mut under_rx, channel) = harness(true);
        let sink = channel.sink();
        for value in [1, 2, 3] {
            sink.add(value).unwrap();
        }
        sink.close().unwrap().wait().await.unwrap();
        assert_eq!(under_rx.recv().await, Some(Ok(1)));
        assert_eq!(under_rx.recv().await, Some(Ok(2)));
        assert_eq!(under_rx.recv().await, Some(Ok(3)));
        assert!(under_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn errors_are_forwarded_in_allow_mode() {
        let (_source_tx, mut under_rx, channel) = harness(true);
        let sink = channel.sink();
        sink.add_error(ChannelError::Remote("pass this on".into()))
            .unwrap();
        assert_eq!(
            under_rx.recv().await,
            Some(Err(ChannelError::Remote("pass this on".into())))
        );
    }

    #[tokio::test]
    async fn adds_after_the_remote_terminal_are_dropped() {
        let (source_tx, mut under_rx, channel) = harness(true);
        let sink = channel.sink();
        drop(source_tx);
        sink.done().wait().await.unwrap();
        sink.add(5).unwrap();
        sink.close().unwrap().wait().await.unwrap();
        assert!(under_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_subscriber_keeps_the_sink_usable() {
        let (source_tx, mut under_rx, channel) = harness(true);
        let (stream, sink) = channel.split();
        drop(stream);
        sink.add(8).unwrap();
        assert_eq!(under_rx.recv().await, Some(Ok(8)));
        // A later remote terminal still completes `done`.
        drop(source_tx);
        sink.done().wait().await.unwrap();
    }

    #[tokio::test]
    async fn events_before_subscription_are_buffered_in_order() {
        let (source_tx, _under_rx, mut channel) = harness(true);
        source_tx.send(Ok(10)).unwrap();
        source_tx.send(Ok(20)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(channel.stream_mut().next().await, Some(Ok(10)));
        assert_eq!(channel.stream_mut().next().await, Some(Ok(20)));
    }

    /// Sink that rejects every operation.
    struct BrokenSink;

    impl<T> futures_util::Sink<T> for BrokenSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Err("wire cut".into()))
        }

        fn start_send(self: Pin<&mut Self>, _: T) -> Result<(), String> {
            Err("wire cut".into())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Err("wire cut".into()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Err("wire cut".into()))
        }
    }

    #[tokio::test]
    async fn transport_failure_resolves_done_and_ends_the_stream() {
        let (_source_tx, source_rx) = mpsc::unbounded_channel::<Event<u32>>();
        let mut channel = guarantee(RecvStream::new(source_rx), BrokenSink, true);
        let sink = channel.sink();
        sink.add(1).unwrap();
        assert_eq!(
            sink.done().wait().await,
            Err(ChannelError::Transport("wire cut".into()))
        );
        assert_eq!(channel.stream_mut().next().await, None);
    }
}
