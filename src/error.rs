//! Error kinds shared by every channel flavor.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Errors produced by channel operations or carried in-band on a stream.
///
/// The first group are programming errors: they are returned synchronously
/// from the offending call and never travel through a channel. The rest are
/// event errors and arrive as `Err` items on a [`ChannelStream`], at most
/// once each.
///
/// The type is `Clone` so an error can be forwarded end-to-end.
///
/// [`ChannelStream`]: crate::ChannelStream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// A value or error was added to a sink that was explicitly closed.
    #[error("sink is already closed")]
    SinkClosed,
    /// A sink operation was attempted while a pumped stream is being added.
    #[error("a pumped stream is still being added")]
    PumpInProgress,
    /// A virtual channel id is already registered on this multiplexer.
    #[error("virtual channel id {0} is already in use")]
    DuplicateId(u64),
    /// The multiplexer has lost its underlying channel.
    #[error("multiplexer is closed")]
    MuxClosed,
    /// `supply` or `fail` was called on an already-completed completer.
    #[error("channel has already been completed")]
    AlreadyCompleted,
    /// A peer violated the framing or handshake rules.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A value could not be encoded for the underlying channel.
    #[error("cannot encode value: {0}")]
    Encode(String),
    /// The underlying transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),
    /// An error forwarded by the remote endpoint.
    #[error("remote error: {0}")]
    Remote(String),
}

/// One item on a channel stream: a value, or an in-band error event.
pub type Event<T> = Result<T, ChannelError>;
