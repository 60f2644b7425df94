//! Channels over one-way message ports.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::Channel;
use crate::completer::ChannelCompleter;
use crate::error::{ChannelError, Event};
use crate::guarantee::guarantee;
use futures_util::{Sink, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// What travels over a message port: a payload, or another port's send
/// endpoint (only ever the first message, during the handshake).
#[derive(Debug)]
pub enum PortMessage<T> {
    Value(T),
    Port(PortSender<T>),
}

/// Send endpoint of a one-way message port.
pub type PortSender<T> = mpsc::UnboundedSender<PortMessage<T>>;
/// Receive endpoint of a one-way message port.
pub type PortReceiver<T> = mpsc::UnboundedReceiver<PortMessage<T>>;

/// Creates a one-way message port.
pub fn port<T>() -> (PortSender<T>, PortReceiver<T>) {
    mpsc::unbounded_channel()
}

/// Adapts a receive/send port pair into a [`Channel`].
///
/// The incoming port is owned by the channel: `close` (or a failed
/// `add_error`) drops it, which is the only disconnect signal a one-way
/// port can carry. Ports cannot transmit errors either, so the sink runs
/// in fail-on-error mode: `add_error` resolves `done` with the error and
/// disconnects.
pub fn port_channel<T: Send + 'static>(
    incoming: PortReceiver<T>,
    outgoing: PortSender<T>,
) -> Channel<T> {
    guarantee(
        PortStream { rx: incoming },
        PortSink { tx: Some(outgoing) },
        false,
    )
}

/// Connects over a fresh port pair, initiating the handshake.
///
/// Creates a receive port for this endpoint and sends its send endpoint
/// as the very first message on `peer`.
pub fn connect_send<T: Send + 'static>(peer: PortSender<T>) -> Channel<T> {
    let (tx, rx) = port();
    peer.send(PortMessage::Port(tx)).ok();
    port_channel(rx, peer)
}

/// Connects over an owned receive port, answering the handshake.
///
/// The first incoming message must be the peer's send endpoint; anything
/// else is a protocol violation, surfaced as a single stream error
/// followed by the terminal.
pub fn connect_receive<T: Send + 'static>(mut incoming: PortReceiver<T>) -> Channel<T> {
    let (mut completer, channel) = ChannelCompleter::new();
    tokio::spawn(async move {
        let result = match incoming.recv().await {
            Some(PortMessage::Port(peer)) => completer.supply(port_channel(incoming, peer)),
            Some(PortMessage::Value(_)) => {
                debug!("handshake received a value where a port was expected");
                completer.fail(ChannelError::Protocol(
                    "expected a port as the first handshake message".into(),
                ))
            }
            None => completer.fail(ChannelError::Protocol(
                "port closed before the handshake completed".into(),
            )),
        };
        // `completer` is private to this task, so it cannot have been
        // completed before.
        result.ok();
    });
    channel
}

/// Incoming port as an event stream. A port showing up after the
/// handshake is a protocol violation.
struct PortStream<T> {
    rx: PortReceiver<T>,
}

impl<T> Stream for PortStream<T> {
    type Item = Event<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(PortMessage::Value(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(PortMessage::Port(_))) => Poll::Ready(Some(Err(
                ChannelError::Protocol("unexpected port in the message stream".into()),
            ))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outgoing port as an event sink. A vanished peer swallows sends; error
/// events never reach this sink because the port channel is fail-on-error.
struct PortSink<T> {
    tx: Option<PortSender<T>>,
}

impl<T> Sink<Event<T>> for PortSink<T> {
    type Error = std::convert::Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Event<T>) -> Result<(), Self::Error> {
        if let (Some(tx), Ok(value)) = (&self.tx, item) {
            tx.send(PortMessage::Value(value)).ok();
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn handshake_connects_both_endpoints() {
        let (initial_tx, initial_rx) = port();
        let mut sender_side = connect_send(initial_tx);
        let mut receiver_side = connect_receive(initial_rx);

        sender_side.sink().add("to receiver").unwrap();
        assert_eq!(
            receiver_side.stream_mut().next().await,
            Some(Ok("to receiver"))
        );
        receiver_side.sink().add("to sender").unwrap();
        assert_eq!(sender_side.stream_mut().next().await, Some(Ok("to sender")));
    }

    #[tokio::test]
    async fn bad_first_message_is_a_protocol_violation() {
        let (initial_tx, initial_rx) = port();
        let mut channel = connect_receive(initial_rx);
        initial_tx.send(PortMessage::Value("mallory")).unwrap();
        assert_eq!(
            channel.stream_mut().next().await,
            Some(Err(ChannelError::Protocol(
                "expected a port as the first handshake message".into()
            )))
        );
        assert_eq!(channel.stream_mut().next().await, None);
    }

    #[tokio::test]
    async fn add_error_disconnects_and_resolves_done_with_it() {
        let (peer_tx, mut peer_rx) = port::<&str>();
        let (_incoming_tx, incoming_rx) = port();
        let channel = port_channel(incoming_rx, peer_tx);
        let sink = channel.sink();
        sink.add_error(ChannelError::Remote("went wrong".into()))
            .unwrap();
        assert_eq!(
            sink.done().wait().await,
            Err(ChannelError::Remote("went wrong".into()))
        );
        // Nothing was sent to the peer and its port is gone.
        assert!(peer_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_drops_the_incoming_port() {
        let (peer_tx, _peer_rx) = port::<u8>();
        let (incoming_tx, incoming_rx) = port();
        let channel = port_channel(incoming_rx, peer_tx);
        channel.sink().close().unwrap().wait().await.unwrap();
        // The receive endpoint is gone, so sends no longer deliver.
        tokio::task::yield_now().await;
        assert!(incoming_tx.send(PortMessage::Value(1)).is_err());
    }

    #[tokio::test]
    async fn values_sent_before_subscribing_are_buffered() {
        let (peer_tx, _peer_rx) = port::<u8>();
        let (incoming_tx, incoming_rx) = port();
        let mut channel = port_channel(incoming_rx, peer_tx);
        incoming_tx.send(PortMessage::Value(1)).unwrap();
        incoming_tx.send(PortMessage::Value(2)).unwrap();
        assert_eq!(channel.stream_mut().next().await, Some(Ok(1)));
        assert_eq!(channel.stream_mut().next().await, Some(Ok(2)));
    }
}
