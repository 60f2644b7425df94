//! Registry and processing loops of the multiplexer.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::frame::Frame;
use super::DEFAULT_ID;
use crate::channel::Channel;
use crate::error::{ChannelError, Event};
use crate::sink::{queue_sink, ChannelSink, SinkItem, SinkQueue};
use crate::stream::{ChannelStream, RecvStream};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How a virtual channel's ids are chosen.
pub(super) enum IdRequest {
    /// The reserved default channel, present on both endpoints.
    Default,
    /// A locally-originated channel: take the next odd output id.
    Fresh,
    /// Connect to a remote-originated channel by its announced id.
    Adopt(u64),
}

/// Multiplexer inner: the underlying sink handle plus the registry.
///
/// The registry maps the *input id* (the id seen on incoming frames) to
/// the incoming-message sender and to the cancel token of the outgoing
/// pump. The underlying sink is closed once the registry empties.
pub(super) struct MuxInner<T> {
    pub(super) sink: ChannelSink<Frame<T>>,
    state: Mutex<MuxState<T>>,
}

struct MuxState<T> {
    next_id: u64,
    incoming: HashMap<u64, mpsc::UnboundedSender<Event<T>>>,
    outgoing: HashMap<u64, CancellationToken>,
    torn_down: bool,
}

impl<T: Send + 'static> MuxInner<T> {
    pub(super) fn new(sink: ChannelSink<Frame<T>>) -> Self {
        Self {
            sink,
            state: Mutex::new(MuxState {
                next_id: 1,
                incoming: HashMap::new(),
                outgoing: HashMap::new(),
                torn_down: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a virtual channel and wires its outgoing pump.
    ///
    /// Returns the channel's outward-facing id along with its endpoint.
    pub(super) fn open(
        this: &Arc<Self>,
        request: IdRequest,
    ) -> Result<(u64, Channel<T>), ChannelError> {
        let stop = CancellationToken::new();
        let (sink, queue) = queue_sink(Some(stop.clone()), true);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let (input_id, output_id) = {
            let mut state = this.lock();
            if state.torn_down {
                return Err(ChannelError::MuxClosed);
            }
            let (input_id, output_id) = match request {
                IdRequest::Default => (DEFAULT_ID, DEFAULT_ID),
                IdRequest::Fresh => {
                    let id = state.next_id;
                    state.next_id += 2;
                    (id + 1, id)
                }
                IdRequest::Adopt(id) => (id, id + 1),
            };
            if state.incoming.contains_key(&input_id) {
                return Err(ChannelError::DuplicateId(input_id));
            }
            state.incoming.insert(input_id, in_tx);
            state.outgoing.insert(input_id, cancel.clone());
            (input_id, output_id)
        };
        trace!(input_id, output_id, "virtual channel registered");
        tokio::spawn(output_pump(this.clone(), input_id, output_id, queue, cancel));
        let channel = Channel::new(ChannelStream::with_stop(RecvStream::new(in_rx), stop), sink);
        Ok((output_id, channel))
    }

    /// Local close: announce it to the remote, drop the registration, and
    /// close the underlying channel if this was the last one.
    fn close_channel(&self, input_id: u64, output_id: u64) {
        let last = {
            let mut state = self.lock();
            state.incoming.remove(&input_id);
            state.outgoing.remove(&input_id);
            let last = !state.torn_down && state.incoming.is_empty() && state.outgoing.is_empty();
            // An empty registry destroys the multiplexer.
            state.torn_down = state.torn_down || last;
            last
        };
        self.sink.add(Frame::Close { id: output_id }).ok();
        if last {
            debug!("last virtual channel closed, closing the underlying channel");
            self.sink.close().ok();
        }
    }

    /// Remote close: tear the channel down locally. No notification goes
    /// back out; close frames are never echoed.
    fn remote_close(&self, input_id: u64) {
        let (cancel, last) = {
            let mut state = self.lock();
            let known = state.incoming.remove(&input_id).is_some();
            let cancel = state.outgoing.remove(&input_id);
            let known = known || cancel.is_some();
            let last = known
                && !state.torn_down
                && state.incoming.is_empty()
                && state.outgoing.is_empty();
            state.torn_down = state.torn_down || last;
            (cancel, last)
        };
        match cancel {
            Some(cancel) => cancel.cancel(),
            // Late close for a channel we already dropped: expected race.
            None => trace!(id = input_id, "close notification for an unknown channel"),
        }
        if last {
            debug!("remote closed the last virtual channel, closing the underlying channel");
            self.sink.close().ok();
        }
    }

    /// The underlying stream terminated: cascade-close everything.
    fn shutdown(&self) {
        debug!("underlying channel terminated, tearing down the multiplexer");
        let outgoing = {
            let mut state = self.lock();
            state.torn_down = true;
            state.incoming.clear();
            std::mem::take(&mut state.outgoing)
        };
        for cancel in outgoing.into_values() {
            cancel.cancel();
        }
        self.sink.close().ok();
    }

    fn incoming_sender(&self, id: u64) -> Option<mpsc::UnboundedSender<Event<T>>> {
        self.lock().incoming.get(&id).cloned()
    }
}

impl<T> std::fmt::Debug for MuxInner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MuxInner")
            .field("next_id", &state.next_id)
            .field("channels", &state.incoming.len())
            .field("torn_down", &state.torn_down)
            .finish()
    }
}

/// Forwards one virtual channel's outgoing events as frames.
#[tracing::instrument(skip(inner, queue, cancel), level = "trace")]
async fn output_pump<T: Send + 'static>(
    inner: Arc<MuxInner<T>>,
    input_id: u64,
    output_id: u64,
    mut queue: SinkQueue<T>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Torn down by the remote or the mux itself; whoever
                // cancelled has already unregistered us.
                queue.cell.resolve(Ok(()));
                return;
            }
            item = queue.rx.recv() => match item {
                Some(SinkItem::Event(Ok(payload))) => {
                    inner.sink.add(Frame::Message { id: output_id, payload }).ok();
                }
                Some(SinkItem::Event(Err(_))) => {
                    // Fail-fast sinks convert errors into closes upstream.
                }
                Some(SinkItem::Close) | None => {
                    trace!(output_id, "virtual channel closed locally");
                    inner.close_channel(input_id, output_id);
                    queue.cell.resolve(Ok(()));
                    return;
                }
            },
        }
    }
}

/// Dispatches incoming frames until the underlying stream terminates.
#[tracing::instrument(skip_all, level = "trace")]
pub(super) async fn receive_loop<T: Send + 'static>(
    inner: Arc<MuxInner<T>>,
    mut stream: ChannelStream<Frame<T>>,
) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(Frame::Message { id, payload }) => match inner.incoming_sender(id) {
                Some(tx) => {
                    tx.send(Ok(payload)).ok();
                }
                // A frame racing our close notification: drop it.
                None => trace!(id, "dropping frame for an unregistered channel"),
            },
            Ok(Frame::Close { id }) => {
                trace!(id, "remote closed virtual channel");
                inner.remote_close(id);
            }
            Err(error) => {
                // Transport errors surface on the default channel only;
                // later frames are still processed.
                debug!("forwarding transport error to the default channel: {error}");
                if let Some(tx) = inner.incoming_sender(DEFAULT_ID) {
                    tx.send(Err(error)).ok();
                }
            }
        }
    }
    inner.shutdown();
}
