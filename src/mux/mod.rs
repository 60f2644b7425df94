//! Many virtual channels over one underlying channel.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod frame;
mod inner;

pub use frame::Frame;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::sink::ChannelSink;
use crate::stream::ChannelStream;
use inner::{receive_loop, IdRequest, MuxInner};
use std::sync::{Arc, Weak};

/// Id of the default virtual channel, present on both endpoints without
/// any handshake.
pub const DEFAULT_ID: u64 = 0;

/// Carries many independent virtual channels over one underlying channel
/// of [`Frame`]s.
///
/// The multiplexer itself is the default virtual channel (id 0); further
/// channels come from [`virtual_channel`]. Ids are symmetric without
/// coordination: a locally-originated channel takes the next odd id and
/// the remote replies on `id + 1`, so each endpoint's originations can
/// never collide with the other's.
///
/// The underlying channel is owned by the multiplexer and closed once the
/// default channel's sink and every virtual channel are closed. When the
/// underlying stream terminates, every virtual channel terminates with it.
///
/// [`virtual_channel`]: Self::virtual_channel
#[derive(Debug)]
pub struct Multiplexer<T> {
    inner: Arc<MuxInner<T>>,
    channel: Channel<T>,
}

impl<T: Send + 'static> Multiplexer<T> {
    /// Takes ownership of `underlying` and starts dispatching its frames.
    pub fn new(underlying: Channel<Frame<T>>) -> Self {
        let (stream, sink) = underlying.split();
        let inner = Arc::new(MuxInner::new(sink));
        let (_, channel) = MuxInner::open(&inner, IdRequest::Default)
            // The registry is empty and nothing else has seen it yet, so
            // the default id cannot collide.
            .expect("default channel registration cannot fail");
        tokio::spawn(receive_loop(inner.clone(), stream));
        Self { inner, channel }
    }

    /// Opens a virtual channel.
    ///
    /// With `id` absent, originates a new channel under a fresh odd id;
    /// announce the returned [`VirtualChannel::id`] to the peer so it can
    /// connect. With `id` present, connects to a channel the peer
    /// originated under that id.
    pub fn virtual_channel(&self, id: Option<u64>) -> Result<VirtualChannel<T>, ChannelError> {
        open_virtual(&self.inner, id)
    }

    /// A cloneable handle for opening virtual channels elsewhere.
    pub fn handle(&self) -> MuxHandle<T> {
        MuxHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The default channel's stream, for polling in place.
    pub fn stream_mut(&mut self) -> &mut ChannelStream<T> {
        self.channel.stream_mut()
    }

    /// A handle to the default channel's sink.
    pub fn sink(&self) -> ChannelSink<T> {
        self.channel.sink()
    }

    /// Splits into the default channel and an opening handle.
    pub fn split(self) -> (Channel<T>, MuxHandle<T>) {
        let handle = self.handle();
        (self.channel, handle)
    }
}

fn open_virtual<T: Send + 'static>(
    inner: &Arc<MuxInner<T>>,
    id: Option<u64>,
) -> Result<VirtualChannel<T>, ChannelError> {
    let request = match id {
        None => IdRequest::Fresh,
        Some(id) => IdRequest::Adopt(id),
    };
    let (output_id, channel) = MuxInner::open(inner, request)?;
    Ok(VirtualChannel {
        id: output_id,
        channel,
        mux: Arc::downgrade(inner),
    })
}

/// One logical channel on a [`Multiplexer`].
///
/// Behaves as any other channel; closing its sink (from either endpoint)
/// destroys the virtual channel without affecting its siblings. Holds
/// only a weak reference back to its multiplexer.
#[derive(Debug)]
pub struct VirtualChannel<T> {
    id: u64,
    channel: Channel<T>,
    mux: Weak<MuxInner<T>>,
}

impl<T: Send + 'static> VirtualChannel<T> {
    /// The id under which this endpoint sends; an originator announces it
    /// to the peer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Opens a sibling channel on the parent multiplexer.
    pub fn virtual_channel(&self, id: Option<u64>) -> Result<VirtualChannel<T>, ChannelError> {
        match self.mux.upgrade() {
            Some(inner) => open_virtual(&inner, id),
            None => Err(ChannelError::MuxClosed),
        }
    }

    pub fn stream_mut(&mut self) -> &mut ChannelStream<T> {
        self.channel.stream_mut()
    }

    pub fn sink(&self) -> ChannelSink<T> {
        self.channel.sink()
    }

    /// Discards the id and handle, leaving a plain channel.
    pub fn into_channel(self) -> Channel<T> {
        self.channel
    }

    /// Splits into the two channel halves.
    pub fn split(self) -> (ChannelStream<T>, ChannelSink<T>) {
        self.channel.split()
    }
}

/// Weak handle for opening virtual channels on a [`Multiplexer`].
#[derive(Debug)]
pub struct MuxHandle<T> {
    inner: Weak<MuxInner<T>>,
}

impl<T> Clone for MuxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> MuxHandle<T> {
    pub fn virtual_channel(&self, id: Option<u64>) -> Result<VirtualChannel<T>, ChannelError> {
        match self.inner.upgrade() {
            Some(inner) => open_virtual(&inner, id),
            None => Err(ChannelError::MuxClosed),
        }
    }
}
