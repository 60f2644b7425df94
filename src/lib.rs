//! Bidirectional typed message channels.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! A [`Channel`] pairs a single-subscription incoming stream with an
//! outgoing sink, forming one endpoint of a logical connection. On top of
//! that contract this crate provides:
//!
//! - [`guarantee`]: wraps any loose stream/sink pair so the full
//!   lifecycle contract holds (close/terminal coupling, silent dropping,
//!   buffering until subscription);
//! - [`Multiplexer`]: many independent virtual channels over one
//!   underlying channel, with collision-free symmetric id assignment;
//! - [`Disconnector`]: a transformer severing every channel it wrapped,
//!   on demand;
//! - [`ChannelCompleter`] and [`ChannelController`]: a channel promised
//!   later, and an in-memory back-to-back pair;
//! - [`port_channel`] with [`connect_send`]/[`connect_receive`]: channels
//!   over one-way message ports, including the bring-up handshake;
//! - [`CodecTransformer`] / [`json_document`]: byte/value codecs as
//!   channel transformers.
//!
//! Streams carry [`Event`]s: plain values or in-band [`ChannelError`]
//! events, terminated exactly once. Sinks are cloneable handles whose
//! mutators are synchronous; pumping a whole stream ([`ChannelSink::add_stream`])
//! and waiting for completion ([`Done::wait`]) are the only suspension
//! points.

mod channel;
mod codec;
mod completer;
mod controller;
mod disconnector;
mod error;
mod guarantee;
mod mux;
mod port;
mod sink;
mod stream;

pub use channel::{Channel, ChannelView, Transformer};
pub use codec::{json, json_document, CodecTransformer};
pub use completer::ChannelCompleter;
pub use controller::ChannelController;
pub use disconnector::Disconnector;
pub use error::{ChannelError, Event};
pub use guarantee::guarantee;
pub use mux::{Frame, MuxHandle, Multiplexer, VirtualChannel, DEFAULT_ID};
pub use port::{
    connect_receive, connect_send, port, port_channel, PortMessage, PortReceiver, PortSender,
};
pub use sink::{ChannelSink, Done};
pub use stream::ChannelStream;
