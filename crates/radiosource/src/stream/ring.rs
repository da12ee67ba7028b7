//! Fixed-capacity byte ring shared by the network worker and the consumer
//!
//! Architecture:
//!   Network → worker thread (single writer)
//!                  ↓ reserve() / commit_write()
//!            RingBuffer (`Box<[u8]>` + Mutex + two Condvars)
//!                  ↓ contig_read() / commit_contig_read()
//!            pull() caller (single reader)
//!
//! Reads copy into the caller's linear buffer, so a region that wraps around
//! the end of storage still arrives contiguous. Read data is only released by
//! `commit_contig_read`, so the writer never overwrites bytes the reader has
//! not confirmed.
//!
//! The stop signal is level-triggered: once set it wakes every waiter and
//! makes all later waits fail fast until `clear_stop_signal` is called.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

/// Why a blocking ring operation returned without data or space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring buffer wait timed out")]
    TimedOut,
    #[error("ring buffer stopped")]
    Stopped,
    /// The writer's interrupt predicate fired (a command is pending)
    #[error("ring buffer wait interrupted")]
    Interrupted,
}

struct RingState {
    data: Box<[u8]>,
    read_pos: usize,
    /// Committed bytes not yet released by the reader
    len: usize,
    stop: bool,
    flush_pending: bool,
}

impl RingState {
    fn free(&self) -> usize {
        self.data.len() - self.len
    }
}

/// Single-producer / single-consumer blocking byte ring
pub struct RingBuffer {
    state: Mutex<RingState>,
    data_available: Condvar,
    space_available: Condvar,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                len: 0,
                stop: false,
                flush_pending: false,
            }),
            data_available: Condvar::new(),
            space_available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for free space and return how many bytes (at most `max`) the
    /// writer may commit next.
    ///
    /// `interrupted` is polled on every wake-up; when it returns true the wait
    /// ends with `RingError::Interrupted` so pending commands are never starved
    /// by a full buffer.
    pub fn reserve(
        &self,
        max: usize,
        timeout: Duration,
        interrupted: impl Fn() -> bool,
    ) -> Result<usize, RingError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.stop {
                return Err(RingError::Stopped);
            }
            if interrupted() {
                return Err(RingError::Interrupted);
            }
            let free = state.free();
            if free > 0 {
                return Ok(free.min(max));
            }
            state = wait_until(&self.space_available, state, deadline)?;
        }
    }

    /// Append `bytes` and make them readable.
    ///
    /// The caller must not commit more than the last `reserve` granted;
    /// overrunning the reader is a broken invariant and panics.
    pub fn commit_write(&self, bytes: &[u8]) -> Result<(), RingError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        if state.stop {
            return Err(RingError::Stopped);
        }
        assert!(
            bytes.len() <= state.free(),
            "commit_write of {} bytes exceeds free space {}",
            bytes.len(),
            state.free()
        );

        let cap = state.data.len();
        let write_pos = (state.read_pos + state.len) % cap;
        let first = bytes.len().min(cap - write_pos);
        state.data[write_pos..write_pos + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            state.data[..rest].copy_from_slice(&bytes[first..]);
        }
        state.len += bytes.len();

        drop(state);
        self.data_available.notify_all();
        Ok(())
    }

    /// Copy up to `dest.len()` committed bytes into `dest` without releasing
    /// them. Blocks until data is available, the timeout elapses or the stop
    /// signal is raised.
    pub fn contig_read(&self, dest: &mut [u8], timeout: Duration) -> Result<usize, RingError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.stop {
                return Err(RingError::Stopped);
            }
            if dest.is_empty() {
                return Ok(0);
            }
            if state.len > 0 {
                break;
            }
            state = wait_until(&self.data_available, state, deadline)?;
        }

        let cap = state.data.len();
        let n = state.len.min(dest.len());
        let first = n.min(cap - state.read_pos);
        let start = state.read_pos;
        dest[..first].copy_from_slice(&state.data[start..start + first]);
        if n > first {
            dest[first..n].copy_from_slice(&state.data[..n - first]);
        }
        Ok(n)
    }

    /// Release `n` bytes previously returned by `contig_read`.
    pub fn commit_contig_read(&self, n: usize) {
        let mut state = self.lock();
        let n = if n > state.len {
            warn!(requested = n, available = state.len, "Confirming more bytes than buffered");
            state.len
        } else {
            n
        };
        if n == 0 {
            return;
        }
        let cap = state.data.len();
        state.read_pos = (state.read_pos + n) % cap;
        state.len -= n;
        if state.len == 0 {
            state.read_pos = 0;
        }
        drop(state);
        self.space_available.notify_all();
    }

    /// Block until at least one byte is readable.
    pub fn wait_for_data(&self, timeout: Duration) -> Result<(), RingError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.stop {
                return Err(RingError::Stopped);
            }
            if state.len > 0 {
                return Ok(());
            }
            state = wait_until(&self.data_available, state, deadline)?;
        }
    }

    /// Block until the reader has released every committed byte.
    pub fn wait_for_empty(&self, timeout: Duration) -> Result<(), RingError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.stop {
                return Err(RingError::Stopped);
            }
            if state.len == 0 {
                return Ok(());
            }
            state = wait_until(&self.space_available, state, deadline)?;
        }
    }

    pub fn total_data_avail(&self) -> usize {
        self.lock().len
    }

    pub fn has_data(&self) -> bool {
        self.total_data_avail() > 0
    }

    /// Drop all buffered data.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.read_pos = 0;
        state.len = 0;
        drop(state);
        self.space_available.notify_all();
    }

    pub fn set_stop_signal(&self) {
        self.lock().stop = true;
        self.wake();
    }

    pub fn clear_stop_signal(&self) {
        self.lock().stop = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stop
    }

    pub fn set_flush_pending(&self) {
        self.lock().flush_pending = true;
    }

    /// One-shot: returns true once per `set_flush_pending`.
    pub fn take_flush_pending(&self) -> bool {
        std::mem::take(&mut self.lock().flush_pending)
    }

    /// Wake every waiter so it re-evaluates its condition (and the writer's
    /// interrupt predicate).
    pub fn wake(&self) {
        self.data_available.notify_all();
        self.space_available.notify_all();
    }
}

/// Wait on `cond` until woken or `deadline` passes.
fn wait_until<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Instant,
) -> Result<MutexGuard<'a, T>, RingError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(RingError::TimedOut);
    }
    let (guard, _) = cond
        .wait_timeout(guard, deadline - now)
        .unwrap_or_else(PoisonError::into_inner);
    Ok(guard)
}

struct GateState {
    waiting: bool,
    stopped: bool,
}

/// Level-triggered "waiting for prefill" flag the consumer can block on.
///
/// Independent of the ring's own condition variables so the consumer can
/// wait here while the worker is blocked on the network.
pub struct PrefillGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl PrefillGate {
    pub fn new(waiting: bool) -> Self {
        Self {
            state: Mutex::new(GateState {
                waiting,
                stopped: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.lock().waiting = waiting;
        self.changed.notify_all();
    }

    pub fn is_waiting(&self) -> bool {
        self.lock().waiting
    }

    /// Block until prefill is satisfied, the gate is stopped or the timeout elapses.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), RingError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.stopped {
                return Err(RingError::Stopped);
            }
            if !state.waiting {
                return Ok(());
            }
            state = wait_until(&self.changed, state, deadline)?;
        }
    }

    pub fn set_stop_signal(&self) {
        self.lock().stopped = true;
        self.changed.notify_all();
    }

    pub fn clear_stop_signal(&self) {
        self.lock().stopped = false;
    }
}
