//! Back-to-back channel pairs over in-memory queues.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::Channel;
use crate::guarantee::guarantee;
use crate::sink::QueueSink;
use crate::stream::RecvStream;
use tokio::sync::mpsc;

/// Two channels bridged by a pair of unbounded FIFO queues: whatever goes
/// into `local`'s sink comes out of `foreign`'s stream and vice versa.
///
/// Typical use is to hand `foreign` to the transport plumbing and `local`
/// to application code. Both sides carry the full lifecycle contract:
/// closing either sink terminates the opposite stream once the queued
/// items have drained.
#[derive(Debug)]
pub struct ChannelController<T> {
    pub local: Channel<T>,
    pub foreign: Channel<T>,
}

impl<T: Send + 'static> ChannelController<T> {
    /// Creates the pair. With `allow_errors` set, errors added to one
    /// side's sink arrive as error events on the other side's stream;
    /// otherwise an error tears the adding side down.
    pub fn new(allow_errors: bool) -> Self {
        let (local_to_foreign_tx, local_to_foreign_rx) = mpsc::unbounded_channel();
        let (foreign_to_local_tx, foreign_to_local_rx) = mpsc::unbounded_channel();
        let local = guarantee(
            RecvStream::new(foreign_to_local_rx),
            QueueSink::new(local_to_foreign_tx),
            allow_errors,
        );
        let foreign = guarantee(
            RecvStream::new(local_to_foreign_rx),
            QueueSink::new(foreign_to_local_tx),
            allow_errors,
        );
        Self { local, foreign }
    }
}

impl<T: Send + 'static> Default for ChannelController<T> {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn values_cross_in_both_directions() {
        let controller = ChannelController::new(true);
        let (mut local_stream, local_sink) = controller.local.split();
        let (mut foreign_stream, foreign_sink) = controller.foreign.split();

        local_sink.add("ping").unwrap();
        assert_eq!(foreign_stream.next().await, Some(Ok("ping")));
        foreign_sink.add("pong").unwrap();
        assert_eq!(local_stream.next().await, Some(Ok("pong")));
    }

    #[tokio::test]
    async fn closing_one_sink_terminates_the_opposite_stream_after_drain() {
        let controller = ChannelController::new(true);
        let (_local_stream, local_sink) = controller.local.split();
        let (mut foreign_stream, _foreign_sink) = controller.foreign.split();

        local_sink.add(1).unwrap();
        local_sink.add(2).unwrap();
        local_sink.close().unwrap().wait().await.unwrap();
        assert_eq!(foreign_stream.next().await, Some(Ok(1)));
        assert_eq!(foreign_stream.next().await, Some(Ok(2)));
        assert_eq!(foreign_stream.next().await, None);
    }

    #[tokio::test]
    async fn errors_cross_sides_in_allow_mode() {
        let controller: ChannelController<&str> = ChannelController::new(true);
        let local_sink = controller.local.sink();
        let (mut foreign_stream, _foreign_sink) = controller.foreign.split();

        local_sink
            .add_error(ChannelError::Remote("crossed".into()))
            .unwrap();
        assert_eq!(
            foreign_stream.next().await,
            Some(Err(ChannelError::Remote("crossed".into())))
        );
    }
}
