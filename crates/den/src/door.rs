//! Named read/write doors with scoped guards.
//!
//! A [`Door`] wraps a [`parking_lot::RwLock`] and adds the diagnostics the
//! engine needs around its locking discipline:
//!
//! - every acquisition carries a location tag that shows up in long-wait
//!   and long-hold warnings,
//! - a door can be terminated, after which every waiter gets
//!   [`DenError::Terminated`] instead of the protected state,
//! - a thread that already holds the door for writing gets
//!   [`DenError::DoorReentry`] instead of deadlocking on itself.
//!
//! Release is tied to guard drop, so every exit path unlocks.
//!
//! ```text
//! intake ──▶ router ──▶ partition ──▶ registration mutex
//! aggregate ──▶ router (snapshot, released) ──▶ partition
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use crate::error::{DenError, Result};

/// Default threshold after which waits and holds are reported.
pub const DEFAULT_LONG_WAIT: Duration = Duration::from_secs(5);

/// A named read/write lock with long-wait diagnostics and termination.
pub struct Door<T> {
    name: String,
    lock: RwLock<T>,
    terminated: AtomicBool,
    writer: Mutex<Option<(ThreadId, &'static str)>>,
    long_wait: Duration,
}

impl<T> Door<T> {
    /// Creates a door with the default long-wait threshold.
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self::with_long_wait(name, value, DEFAULT_LONG_WAIT)
    }

    /// Creates a door that warns after `long_wait`.
    pub fn with_long_wait(name: impl Into<String>, value: T, long_wait: Duration) -> Self {
        Self {
            name: name.into(),
            lock: RwLock::new(value),
            terminated: AtomicBool::new(false),
            writer: Mutex::new(None),
            long_wait,
        }
    }

    /// Returns the door name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the door has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Acquires the door for shared reading.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::Terminated`] if the door is torn down before or
    /// while waiting, and [`DenError::DoorReentry`] if the calling thread
    /// holds the door for writing.
    pub fn read(&self, location: &'static str) -> Result<DoorReadGuard<'_, T>> {
        self.check_reentry(location)?;
        let started = Instant::now();
        loop {
            self.check_terminated()?;
            if let Some(guard) = self.lock.try_read_for(self.long_wait) {
                self.check_terminated()?;
                return Ok(DoorReadGuard {
                    guard,
                    door: self,
                    location,
                    acquired: Instant::now(),
                });
            }
            self.report_long_wait("read", location, started);
        }
    }

    /// Acquires the door for exclusive writing.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Door::read`].
    pub fn write(&self, location: &'static str) -> Result<DoorWriteGuard<'_, T>> {
        self.check_reentry(location)?;
        let started = Instant::now();
        loop {
            self.check_terminated()?;
            if let Some(guard) = self.lock.try_write_for(self.long_wait) {
                self.check_terminated()?;
                *self.writer.lock() = Some((thread::current().id(), location));
                return Ok(DoorWriteGuard {
                    guard,
                    door: self,
                    location,
                    acquired: Instant::now(),
                });
            }
            self.report_long_wait("write", location, started);
        }
    }

    fn check_terminated(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(DenError::Terminated {
                door: self.name.clone(),
            });
        }
        Ok(())
    }

    fn check_reentry(&self, location: &'static str) -> Result<()> {
        if let Some((holder, _)) = *self.writer.lock() {
            if holder == thread::current().id() {
                return Err(DenError::DoorReentry {
                    door: self.name.clone(),
                    location,
                });
            }
        }
        Ok(())
    }

    fn report_long_wait(&self, mode: &str, location: &'static str, started: Instant) {
        let holder = match *self.writer.lock() {
            Some((_, at)) => at,
            None => "readers",
        };
        warn!(
            door = %self.name,
            location,
            holder,
            waited_ms = started.elapsed().as_millis() as u64,
            "Long wait for {} access",
            mode
        );
    }

    fn report_long_hold(&self, mode: &str, location: &'static str, acquired: Instant) {
        let held = acquired.elapsed();
        if held > self.long_wait {
            warn!(
                door = %self.name,
                location,
                held_ms = held.as_millis() as u64,
                "Door held for {} longer than the long-wait threshold",
                mode
            );
        }
    }
}

impl<T> fmt::Debug for Door<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Door")
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Shared access to the state behind a [`Door`].
pub struct DoorReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    door: &'a Door<T>,
    location: &'static str,
    acquired: Instant,
}

impl<T> Deref for DoorReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for DoorReadGuard<'_, T> {
    fn drop(&mut self) {
        self.door.report_long_hold("read", self.location, self.acquired);
    }
}

/// Exclusive access to the state behind a [`Door`].
pub struct DoorWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    door: &'a Door<T>,
    location: &'static str,
    acquired: Instant,
}

impl<T> DoorWriteGuard<'_, T> {
    /// Terminates the door. Current waiters fail once this guard drops.
    pub fn terminate(&self) {
        self.door.terminated.store(true, Ordering::Release);
    }
}

impl<T> Deref for DoorWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for DoorWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for DoorWriteGuard<'_, T> {
    fn drop(&mut self) {
        *self.door.writer.lock() = None;
        self.door.report_long_hold("write", self.location, self.acquired);
    }
}
