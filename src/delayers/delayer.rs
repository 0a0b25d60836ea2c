//! Buffering of incoming writes with size- and time-triggered flushes.
//!
//! A flush runs under the buffer lock: the operator commits every buffered
//! item, then matches them in arrival order. The timer thread is started by
//! the first item of an empty buffer and stops on the first flush that finds
//! nothing to do.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{DelayerSettings, EventCloudConfig};
use crate::delayers::buffer::{Buffer, BufferedItem, ItemClass};
use crate::error::Result;
use crate::overlay::PeerId;

/// Applies a flushed buffer to the peer.
pub trait BufferOperator: Send + Sync {
    /// Write every buffered item in one transaction.
    fn commit(&self, buffer: &Buffer) -> Result<()>;

    /// Match the committed items; effects are dispatched, never awaited.
    fn trigger_matching(&self, buffer: &Buffer);
}

struct TimerSlot {
    generation: u64,
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    buffer: Buffer,
    timer: Option<TimerSlot>,
    next_generation: u64,
    closed: bool,
}

struct Inner {
    peer: PeerId,
    state: Mutex<State>,
    operator: Arc<dyn BufferOperator>,
    quadruples: DelayerSettings,
    subscriptions: DelayerSettings,
    compound_events: DelayerSettings,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self, class: ItemClass) -> &DelayerSettings {
        match class {
            ItemClass::Quadruple => &self.quadruples,
            ItemClass::Subscription => &self.subscriptions,
            ItemClass::CompoundEvent => &self.compound_events,
        }
    }

    fn interval(&self) -> Duration {
        [&self.quadruples, &self.subscriptions, &self.compound_events]
            .iter()
            .map(|s| s.flush_interval())
            .min()
            .unwrap_or(Duration::from_millis(100))
    }

    fn flush_locked(&self, state: &mut State) -> usize {
        let flushed = state.buffer.len();
        if flushed == 0 {
            return 0;
        }

        match self.operator.commit(&state.buffer) {
            Ok(()) => self.operator.trigger_matching(&state.buffer),
            Err(e) => {
                tracing::error!(peer = %self.peer, items = flushed, error = %e, "commit failed, buffer dropped");
            }
        }
        state.buffer.clear();
        tracing::debug!(peer = %self.peer, items = flushed, "buffer flushed");
        flushed
    }
}

pub struct Delayer {
    inner: Arc<Inner>,
}

impl Delayer {
    pub fn new(peer: PeerId, config: &EventCloudConfig, operator: Arc<dyn BufferOperator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer,
                state: Mutex::new(State::default()),
                operator,
                quadruples: config.quadruples,
                subscriptions: config.subscriptions,
                compound_events: config.compound_events,
            }),
        }
    }

    /// Buffer `item`, flushing right away once its class reaches its size.
    pub fn receive(&self, item: BufferedItem) {
        let class = item.class();
        let mut state = self.inner.lock();
        state.buffer.push(item);

        if state.closed || state.buffer.count(class) >= self.inner.settings(class).buffer_size {
            self.inner.flush_locked(&mut state);
        } else if state.timer.is_none() {
            self.start_timer(&mut state);
        }
    }

    /// Flush now. Returns the number of items flushed.
    pub fn flush(&self) -> usize {
        let mut state = self.inner.lock();
        self.inner.flush_locked(&mut state)
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn has_timer(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// Stop the timer and flush what is left. Items received afterwards are
    /// flushed one by one.
    pub fn close(&self) {
        let slot = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.timer.take()
        };
        if let Some(slot) = slot {
            let _ = slot.cancel.send(());
            if slot.handle.thread().id() != thread::current().id() && slot.handle.join().is_err() {
                tracing::warn!(peer = %self.inner.peer, "delayer timer panicked");
            }
        }
        self.flush();
    }

    fn start_timer(&self, state: &mut State) {
        let generation = state.next_generation;
        state.next_generation += 1;

        let (cancel, cancelled) = mpsc::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let interval = inner.interval();
        let spawned = thread::Builder::new()
            .name(format!("delayer-{}", inner.peer))
            .spawn(move || loop {
                match cancelled.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let mut state = inner.lock();
                        if state.timer.as_ref().map(|slot| slot.generation) != Some(generation) {
                            return;
                        }
                        if inner.flush_locked(&mut state) == 0 {
                            state.timer = None;
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            });

        match spawned {
            Ok(handle) => state.timer = Some(TimerSlot { generation, cancel, handle }),
            Err(e) => {
                tracing::error!(peer = %self.inner.peer, error = %e, "cannot start delayer timer, flushing now");
                self.inner.flush_locked(state);
            }
        }
    }
}

impl Drop for Delayer {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        // dropping the slot disconnects the timer's channel
        state.timer = None;
    }
}
