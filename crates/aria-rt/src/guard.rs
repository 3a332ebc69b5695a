//! Shared/exclusive spin guard for bus buffers
//!
//! Buses are written by one synth per block by construction, but plugins
//! may share an output bus and accumulate into it. The guard arbitrates
//! that case: wait-free when uncontended, a short spin otherwise. No
//! blocking primitive is ever involved, so it is safe on the audio path.

use std::sync::atomic::{AtomicU32, Ordering};

/// Exclusive-writer marker in the guard state
const WRITER: u32 = u32::MAX;

/// Lightweight shared/exclusive guard
///
/// State is a single word: 0 = free, `WRITER` = exclusive, anything else
/// counts shared readers.
#[derive(Debug, Default)]
pub struct BusGuard {
    state: AtomicU32,
}

impl BusGuard {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquire shared (read) access
    pub fn read(&self) -> ReadGuard<'_> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state != WRITER
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ReadGuard { guard: self };
            }
            std::hint::spin_loop();
        }
    }

    /// Acquire exclusive (write) access
    pub fn write(&self) -> WriteGuard<'_> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return WriteGuard { guard: self };
            }
            std::hint::spin_loop();
        }
    }
}

/// RAII shared access
pub struct ReadGuard<'a> {
    guard: &'a BusGuard,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.guard.state.fetch_sub(1, Ordering::Release);
    }
}

/// RAII exclusive access
pub struct WriteGuard<'a> {
    guard: &'a BusGuard,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.guard.state.store(0, Ordering::Release);
    }
}
