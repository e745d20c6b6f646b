//! Frame-arrival signal.
//!
//! Readers that want to follow ingestion block on [`FrameSignal::wait_for_frame`]
//! instead of polling. The signal is notified exactly when a frame is stored,
//! when the router resets, and when it shuts down.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{DenError, Result};

#[derive(Debug, Default)]
struct SignalState {
    latest: Option<u64>,
    terminated: bool,
}

/// Condition variable tracking the newest stored frame index.
#[derive(Debug, Default)]
pub struct FrameSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl FrameSignal {
    /// Creates a signal that has seen no frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that resumes from an already stored index.
    pub fn starting_at(latest: Option<u64>) -> Self {
        Self {
            state: Mutex::new(SignalState {
                latest,
                terminated: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Records that the frame with `index` is stored and wakes waiters.
    pub fn notify_stored(&self, index: u64) {
        let mut state = self.state.lock();
        if state.latest.map_or(true, |latest| index > latest) {
            state.latest = Some(index);
            self.condvar.notify_all();
        }
    }

    /// Forgets every stored index after a reset.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.latest = None;
        self.condvar.notify_all();
    }

    /// Wakes every waiter with a terminated error.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        self.condvar.notify_all();
    }

    /// Returns the newest stored index.
    pub fn latest(&self) -> Option<u64> {
        self.state.lock().latest
    }

    /// Blocks until a frame newer than `after` is stored.
    ///
    /// Returns `Ok(Some(index))` with the newest index, or `Ok(None)` if the
    /// timeout elapses first.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::Terminated`] if the router shuts down while waiting.
    pub fn wait_for_frame(&self, after: Option<u64>, timeout: Duration) -> Result<Option<u64>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if state.terminated {
                return Err(DenError::Terminated {
                    door: "frame-signal".to_string(),
                });
            }
            if let Some(latest) = state.latest {
                if after.map_or(true, |after| latest > after) {
                    return Ok(Some(latest));
                }
            }
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut state, deadline).timed_out() {
                        return Ok(None);
                    }
                }
                // Unrepresentable deadline: wait for a frame or termination.
                None => self.condvar.wait(&mut state),
            }
        }
    }
}
