//! The outgoing half of a channel.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::error::{ChannelError, Event};
use futures_util::stream::{Stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Future half of a sink's `done` signal. Cheap to clone; every clone
/// resolves to the same result.
#[derive(Clone)]
pub struct Done {
    rx: watch::Receiver<Option<Result<(), ChannelError>>>,
}

impl Done {
    /// Waits until the outgoing half has finished.
    ///
    /// Resolves with the error when the sink failed (fail-on-error mode or
    /// a transport breakdown), otherwise with `Ok`.
    pub async fn wait(&self) -> Result<(), ChannelError> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // The resolving side went away without a verdict; the
                // outgoing half can do no more work, so report a clean end.
                return Ok(());
            }
        }
    }

    /// Whether the outgoing half has already finished.
    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl std::fmt::Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Write end of a `done` signal. The first resolution wins.
pub(crate) struct DoneCell {
    tx: watch::Sender<Option<Result<(), ChannelError>>>,
}

impl DoneCell {
    pub(crate) fn new() -> (Arc<DoneCell>, Done) {
        let (tx, rx) = watch::channel(None);
        (Arc::new(DoneCell { tx }), Done { rx })
    }

    pub(crate) fn resolve(&self, result: Result<(), ChannelError>) {
        let mut result = Some(result);
        self.tx.send_modify(|slot| {
            if slot.is_none() {
                *slot = result.take();
            }
        });
    }
}

/// One queued instruction for the task draining a sink.
pub(crate) enum SinkItem<T> {
    Event(Event<T>),
    Close,
}

/// What a concrete sink does with events once the gate has let them
/// through. Implementations silently drop data when the remote side is
/// gone; an `Err` return is a programming error surfaced to the caller.
pub(crate) trait SinkCore<T>: Send + Sync {
    fn try_add(&self, event: Event<T>) -> Result<(), ChannelError>;
    /// Idempotent. Called at most once by the gate.
    fn start_close(&self);
    fn done(&self) -> Done;
}

/// Per-sink state shared by every clone of a [`ChannelSink`].
pub(crate) struct Gate {
    flags: Mutex<GateFlags>,
    /// Raised by a disconnector to cancel an in-flight pumped stream.
    cancel: CancellationToken,
}

#[derive(Default)]
struct GateFlags {
    closed: bool,
    pumping: bool,
}

fn unpoison<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl Gate {
    pub(crate) fn new() -> Arc<Gate> {
        Arc::new(Gate {
            flags: Mutex::new(GateFlags::default()),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// The outgoing half of a channel.
///
/// A cheaply cloneable handle; all clones share one gate, so the contract
/// (no adds after an explicit close, exclusivity of [`add_stream`]) holds
/// across handles. All mutators are synchronous except `add_stream`.
///
/// [`add_stream`]: Self::add_stream
pub struct ChannelSink<T> {
    core: Arc<dyn SinkCore<T>>,
    gate: Arc<Gate>,
}

impl<T> Clone for ChannelSink<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<T> ChannelSink<T> {
    pub(crate) fn from_core(core: Arc<dyn SinkCore<T>>) -> Self {
        Self {
            core,
            gate: Gate::new(),
        }
    }

    pub(crate) fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    /// Sends one value toward the remote endpoint.
    ///
    /// Data is silently dropped once the channel's stream has terminated;
    /// an error is returned only for contract violations (adding after an
    /// explicit `close`, or while a pumped stream is in flight).
    pub fn add(&self, value: T) -> Result<(), ChannelError> {
        self.check_mutable()?;
        self.core.try_add(Ok(value))
    }

    /// Sends one error event toward the remote endpoint.
    ///
    /// In allow-errors mode the error travels to the remote stream; in
    /// fail-on-error mode it closes this sink and resolves `done` with the
    /// error instead.
    pub fn add_error(&self, error: ChannelError) -> Result<(), ChannelError> {
        self.check_mutable()?;
        self.core.try_add(Err(error))
    }

    /// Pumps an entire event stream into the sink.
    ///
    /// While the pump is in flight every other mutator (including `close`)
    /// fails with [`ChannelError::PumpInProgress`]. A disconnect cancels
    /// the pump, which then reports success to the caller.
    pub async fn add_stream<S>(&self, stream: S) -> Result<(), ChannelError>
    where
        S: Stream<Item = Event<T>> + Unpin,
    {
        {
            let mut flags = unpoison(self.gate.flags.lock());
            if flags.closed {
                return Err(ChannelError::SinkClosed);
            }
            if flags.pumping {
                return Err(ChannelError::PumpInProgress);
            }
            flags.pumping = true;
        }
        let mut stream = stream;
        let result = loop {
            tokio::select! {
                _ = self.gate.cancel.cancelled() => {
                    trace!("pumped stream cancelled by disconnect");
                    break Ok(());
                }
                event = stream.next() => match event {
                    Some(event) => {
                        if let Err(error) = self.core.try_add(event) {
                            break Err(error);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };
        unpoison(self.gate.flags.lock()).pumping = false;
        result
    }

    /// Stops the outgoing half and returns its `done` future.
    ///
    /// Also forces the channel's own stream to its terminal. Idempotent:
    /// repeated closes return the same `done`. Fails only while a pumped
    /// stream is in flight.
    pub fn close(&self) -> Result<Done, ChannelError> {
        let started = {
            let mut flags = unpoison(self.gate.flags.lock());
            if flags.pumping {
                return Err(ChannelError::PumpInProgress);
            }
            !std::mem::replace(&mut flags.closed, true)
        };
        if started {
            self.core.start_close();
        }
        Ok(self.core.done())
    }

    /// The `done` future without closing anything.
    pub fn done(&self) -> Done {
        self.core.done()
    }

    fn check_mutable(&self) -> Result<(), ChannelError> {
        let flags = unpoison(self.gate.flags.lock());
        if flags.closed {
            return Err(ChannelError::SinkClosed);
        }
        if flags.pumping {
            return Err(ChannelError::PumpInProgress);
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for ChannelSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = unpoison(self.gate.flags.lock());
        f.debug_struct("ChannelSink")
            .field("closed", &flags.closed)
            .field("pumping", &flags.pumping)
            .finish()
    }
}

/// Queue-backed sink core. Events pile up in an unbounded queue until the
/// draining task consumes them; sends to a parted consumer are dropped.
struct QueueCore<T> {
    tx: mpsc::UnboundedSender<SinkItem<T>>,
    cell: Arc<DoneCell>,
    done: Done,
    /// Raised when the sink finishes so the paired stream terminates at
    /// once, ahead of anything buffered.
    stop: Option<CancellationToken>,
    /// Fail-on-error mode: an error event closes the sink instead of
    /// travelling to the remote.
    fail_fast: bool,
}

impl<T: Send + 'static> SinkCore<T> for QueueCore<T> {
    fn try_add(&self, event: Event<T>) -> Result<(), ChannelError> {
        match event {
            Err(error) if self.fail_fast => {
                self.cell.resolve(Err(error));
                if let Some(stop) = &self.stop {
                    stop.cancel();
                }
                self.tx.send(SinkItem::Close).ok();
            }
            event => {
                self.tx.send(SinkItem::Event(event)).ok();
            }
        }
        Ok(())
    }

    fn start_close(&self) {
        if let Some(stop) = &self.stop {
            stop.cancel();
        }
        if self.tx.send(SinkItem::Close).is_err() {
            // No consumer left to finish the close on our behalf.
            self.cell.resolve(Ok(()));
        }
    }

    fn done(&self) -> Done {
        self.done.clone()
    }
}

/// Consumer side of a queue-backed sink.
pub(crate) struct SinkQueue<T> {
    pub(crate) rx: mpsc::UnboundedReceiver<SinkItem<T>>,
    pub(crate) cell: Arc<DoneCell>,
}

/// Creates a queue-backed sink and the queue its draining task consumes.
///
/// `stop` is cancelled when the sink finishes; `fail_fast` selects
/// fail-on-error mode.
pub(crate) fn queue_sink<T: Send + 'static>(
    stop: Option<CancellationToken>,
    fail_fast: bool,
) -> (ChannelSink<T>, SinkQueue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (cell, done) = DoneCell::new();
    let core = QueueCore {
        tx,
        cell: cell.clone(),
        done,
        stop,
        fail_fast,
    };
    (ChannelSink::from_core(Arc::new(core)), SinkQueue { rx, cell })
}

/// Sink core that maps values into an inner sink of another type.
/// Mapping failures surface synchronously from `add`.
pub(crate) struct MappedCore<I, O> {
    pub(crate) inner: ChannelSink<I>,
    pub(crate) map: Arc<dyn Fn(&O) -> Result<I, ChannelError> + Send + Sync>,
}

impl<I: Send + 'static, O: Send + Sync> SinkCore<O> for MappedCore<I, O> {
    fn try_add(&self, event: Event<O>) -> Result<(), ChannelError> {
        match event {
            Ok(value) => {
                let mapped = (*self.map)(&value)?;
                self.inner.add(mapped)
            }
            Err(error) => self.inner.add_error(error),
        }
    }

    fn start_close(&self) {
        self.inner.close().ok();
    }

    fn done(&self) -> Done {
        self.inner.done()
    }
}

/// `futures` sink over a tokio unbounded sender. Sends to a parted
/// receiver are dropped: a vanished remote is a normal end of life here,
/// not an error.
pub(crate) struct QueueSink<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
}

impl<T> QueueSink<T> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl<T> futures_util::Sink<T> for QueueSink<T> {
    type Error = std::convert::Infallible;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn start_send(mut self: std::pin::Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        if let Some(tx) = &self.tx {
            tx.send(item).ok();
        }
        Ok(())
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.tx = None;
        std::task::Poll::Ready(Ok(()))
    }
}
