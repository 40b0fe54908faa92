use std::{
    sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

const PARKED: u8 = 0b01;
const TOKEN: u8 = 0b10;

/// One-token parker: an `unpark` before `park` is not lost.
#[derive(Debug, Default)]
pub struct Parker {
    state: AtomicU8,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Parker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self) {
        while !self.park_timeout(Duration::from_secs(3600)) {}
    }

    /// Returns `true` when woken by [`unpark`](Self::unpark), `false` on
    /// timeout.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        // Fast path: unpark before park => just consume it
        if self.try_consume_token() {
            return true;
        }

        self.state.fetch_or(PARKED, Release);
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        let woken = loop {
            if self.try_consume_token() {
                break true;
            }
            if self.cv.wait_until(&mut guard, deadline).timed_out() {
                break self.try_consume_token();
            }
        };
        drop(guard);

        self.state.fetch_and(!PARKED, AcqRel);
        woken
    }

    #[inline]
    fn try_consume_token(&self) -> bool {
        let mut s = self.state.load(Acquire);
        while s & TOKEN != 0 {
            match self
                .state
                .compare_exchange_weak(s, s & !TOKEN, AcqRel, Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
        false
    }

    pub fn unpark(&self) {
        let prev = self.state.fetch_or(TOKEN, Release);

        if prev & PARKED != 0 {
            let _g = self.lock.lock();
            self.cv.notify_one();
        }
    }
}
