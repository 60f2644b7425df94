//! Severing wrapped channels on demand.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::{Channel, Transformer};
use crate::error::{ChannelError, Event};
use crate::sink::{ChannelSink, Done, SinkCore};
use crate::stream::ChannelStream;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Transformer that can cut every channel it has wrapped, at once.
///
/// [`bind`](Self::bind) may be applied to any number of channels. The
/// first [`disconnect`](Self::disconnect) closes all their inner sinks,
/// cancels in-flight pumped streams (reporting success to their callers),
/// and forces every wrapped stream to its terminal; later calls are
/// no-ops. After a disconnect, wrapped sinks silently drop everything,
/// except that a sink the user explicitly closed keeps raising
/// [`ChannelError::SinkClosed`], so misuse stays visible.
pub struct Disconnector<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Disconnector<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Disconnector<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

struct State<T> {
    disconnected: bool,
    members: Vec<Member<T>>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            disconnected: false,
            members: Vec::new(),
        }
    }
}

struct Member<T> {
    inner_sink: ChannelSink<T>,
    severed: Arc<AtomicBool>,
    /// Cancels an in-flight `add_stream` on the wrapped sink.
    pump_cancel: CancellationToken,
    /// Forces the wrapped stream to its terminal.
    stop: CancellationToken,
}

impl<T: Send + 'static> Disconnector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a channel so it can later be severed.
    ///
    /// Binding after [`disconnect`](Self::disconnect) yields an
    /// already-severed channel.
    pub fn bind(&self, channel: Channel<T>) -> Channel<T> {
        let (inner_stream, inner_sink) = channel.split();
        let stop = CancellationToken::new();
        let severed = Arc::new(AtomicBool::new(false));
        let sink = ChannelSink::from_core(Arc::new(SeveringCore {
            inner: inner_sink.clone(),
            severed: severed.clone(),
        }));
        let member = Member {
            inner_sink,
            severed,
            pump_cancel: sink.gate().cancel_token(),
            stop: stop.clone(),
        };
        let mut state = lock(&self.state);
        if state.disconnected {
            sever(&member);
        } else {
            state.members.push(member);
        }
        Channel::new(ChannelStream::with_stop(inner_stream, stop), sink)
    }

    /// Severs every channel produced by [`bind`](Self::bind).
    ///
    /// Idempotent. Resolves once all wrapped channels have quiesced: every
    /// inner sink is closed and its `done` has resolved.
    pub async fn disconnect(&self) {
        let members = {
            let mut state = lock(&self.state);
            state.disconnected = true;
            std::mem::take(&mut state.members)
        };
        if !members.is_empty() {
            debug!("disconnecting {} wrapped channels", members.len());
        }
        for member in &members {
            sever(member);
        }
        for member in members {
            member.inner_sink.done().wait().await.ok();
        }
    }
}

fn sever<T>(member: &Member<T>) {
    member.severed.store(true, Ordering::Release);
    member.pump_cancel.cancel();
    member.stop.cancel();
    member.inner_sink.close().ok();
}

fn lock<T>(state: &Arc<Mutex<State<T>>>) -> std::sync::MutexGuard<'_, State<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forwards to the inner sink until severed, then drops silently.
struct SeveringCore<T> {
    inner: ChannelSink<T>,
    severed: Arc<AtomicBool>,
}

impl<T: Send + 'static> SinkCore<T> for SeveringCore<T> {
    fn try_add(&self, event: Event<T>) -> Result<(), ChannelError> {
        if self.severed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = match event {
            Ok(value) => self.inner.add(value),
            Err(error) => self.inner.add_error(error),
        };
        // A disconnect can race us to the inner sink; that is the severed
        // state, not caller misuse.
        result.or(Ok(()))
    }

    fn start_close(&self) {
        self.inner.close().ok();
    }

    fn done(&self) -> Done {
        self.inner.done()
    }
}

impl<T: Send + 'static> Transformer<T, T> for &Disconnector<T> {
    fn bind(self, channel: Channel<T>) -> Channel<T> {
        Disconnector::bind(self, channel)
    }
}

impl<T> std::fmt::Debug for Disconnector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Disconnector")
            .field("disconnected", &state.disconnected)
            .field("members", &state.members.len())
            .finish()
    }
}
