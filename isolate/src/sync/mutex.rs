use std::{any::Any, time::Duration};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{Heap, HeapId, HostObject, POLL_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("attempt to unlock a mutex which is not locked")]
    NotLocked,
    #[error("wait was cancelled")]
    Cancelled,
    #[error("deadlock; recursive locking")]
    Deadlock,
    #[error("attempt to unlock a mutex which is locked by another thread")]
    NotOwner,
}

/// Guest `Mutex`. Owned by a heap, since every guest thread runs on its own
/// heap.
#[derive(Debug, Default)]
pub struct GuestMutex {
    owner: Mutex<Option<HeapId>>,
    released: Condvar,
}

/// Unlocks on drop, whether the critical section returned or unwound.
struct Held<'a> {
    mutex: &'a GuestMutex,
    holder: HeapId,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.mutex.release(self.holder);
    }
}

impl GuestMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the mutex is free, or fail once `heap` is cancelled.
    pub fn lock(&self, heap: &Heap) -> Result<(), SyncError> {
        let me = heap.id();
        let interrupts = heap.interrupts();
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                None => {
                    *owner = Some(me);
                    return Ok(());
                }
                Some(holder) if holder == me => return Err(SyncError::Deadlock),
                Some(_) => {}
            }
            if interrupts.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.released.wait_for(&mut owner, POLL_INTERVAL);
        }
    }

    pub fn try_lock(&self, heap: &Heap) -> bool {
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(heap.id());
                true
            }
            Some(_) => false,
        }
    }

    pub fn unlock(&self, heap: &Heap) -> Result<(), SyncError> {
        let mut owner = self.owner.lock();
        match *owner {
            None => Err(SyncError::NotLocked),
            Some(holder) if holder != heap.id() => Err(SyncError::NotOwner),
            Some(_) => {
                *owner = None;
                drop(owner);
                self.released.notify_one();
                Ok(())
            }
        }
    }

    fn release(&self, holder: HeapId) {
        let mut owner = self.owner.lock();
        if *owner == Some(holder) {
            *owner = None;
            drop(owner);
            self.released.notify_one();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn is_owned_by(&self, heap: &Heap) -> bool {
        *self.owner.lock() == Some(heap.id())
    }

    /// Run `f` with the mutex held. The mutex is released however `f`
    /// finishes.
    pub fn synchronize<R>(
        &self,
        heap: &mut Heap,
        f: impl FnOnce(&mut Heap) -> R,
    ) -> Result<R, SyncError> {
        self.lock(heap)?;
        let _held = Held {
            mutex: self,
            holder: heap.id(),
        };
        Ok(f(heap))
    }

    /// Release the mutex, sleep for `timeout` (forever when `None`) or until
    /// the thread is woken, then take it back. Returns the time slept.
    /// A cancelled sleep leaves the mutex unlocked.
    pub fn sleep(&self, heap: &Heap, timeout: Option<Duration>) -> Result<Duration, SyncError> {
        self.unlock(heap)?;
        let slept = heap.interrupts().sleep(timeout);
        if heap.interrupts().is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.lock(heap)?;
        Ok(slept)
    }
}

impl HostObject for GuestMutex {
    fn class_name(&self) -> &'static str {
        "Mutex"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Instant,
    };

    #[test]
    fn lock_and_unlock() {
        let heap = Heap::open();
        let mutex = GuestMutex::new();
        assert_eq!(mutex.unlock(&heap), Err(SyncError::NotLocked));
        mutex.lock(&heap).unwrap();
        assert!(mutex.is_locked());
        assert!(mutex.is_owned_by(&heap));
        assert_eq!(mutex.lock(&heap), Err(SyncError::Deadlock));
        assert!(!mutex.try_lock(&heap));
        mutex.unlock(&heap).unwrap();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn only_the_owner_unlocks() {
        let a = Heap::open();
        let b = Heap::open();
        let mutex = GuestMutex::new();
        assert!(mutex.try_lock(&a));
        assert_eq!(mutex.unlock(&b), Err(SyncError::NotOwner));
        mutex.unlock(&a).unwrap();
    }

    #[test]
    fn synchronize_unlocks_when_the_body_fails() {
        let mut heap = Heap::open();
        let mutex = GuestMutex::new();
        let result = mutex.synchronize(&mut heap, |_| Err::<(), _>("boom"));
        assert_eq!(result, Ok(Err("boom")));
        assert!(!mutex.is_locked());
    }

    #[test]
    fn contended_lock_is_exclusive() {
        let mutex = Arc::new(GuestMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    let mut heap = Heap::open();
                    for _ in 0..50 {
                        mutex
                            .synchronize(&mut heap, |_| {
                                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                                thread::yield_now();
                                inside.fetch_sub(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn kill_cancels_a_blocked_lock() {
        let holder = Heap::open();
        let mutex = Arc::new(GuestMutex::new());
        mutex.lock(&holder).unwrap();

        let waiter = Heap::open();
        let interrupts = waiter.interrupts().clone();
        let blocked = {
            let mutex = mutex.clone();
            thread::spawn(move || mutex.lock(&waiter))
        };
        thread::sleep(Duration::from_millis(30));
        interrupts.kill();
        assert_eq!(blocked.join().unwrap(), Err(SyncError::Cancelled));
        assert!(mutex.is_owned_by(&holder));
    }

    #[test]
    fn sleep_releases_and_reacquires() {
        let heap = Heap::open();
        let mutex = GuestMutex::new();
        mutex.lock(&heap).unwrap();
        let start = Instant::now();
        let slept = mutex.sleep(&heap, Some(Duration::from_millis(20))).unwrap();
        assert!(slept >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(mutex.is_owned_by(&heap));
        assert_eq!(
            GuestMutex::new().sleep(&heap, None),
            Err(SyncError::NotLocked)
        );
    }
}
