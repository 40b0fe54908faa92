use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{Heap, HeapCreateInfo, Parker, ScaleConfig, Scheduler, SchedulerError, scheduler::Job};

/// Slice in which blocking waits re-check cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Flags a heap's owner and the rest of the process use to reach into a
/// running heap: kill, cooperative stop and process shutdown.
#[derive(Debug)]
pub struct Interrupts {
    shutdown: Arc<AtomicBool>,
    killed: AtomicBool,
    stop_requested: AtomicBool,
    sleeping: AtomicBool,
    parker: Parker,
}

impl Interrupts {
    pub(crate) fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            killed: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            parker: Parker::new(),
        }
    }

    /// Interrupts of a heap that belongs to no runtime.
    pub(crate) fn detached() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Blocking operations give up once this is set.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.is_killed() || self.is_shutdown()
    }

    /// Anything the interpreter has to act on before the next instruction.
    #[inline]
    pub(crate) fn pending(&self) -> bool {
        self.is_cancelled() || self.stop_requested.load(Ordering::Acquire)
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.parker.unpark();
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn wakeup(&self) {
        self.stop_requested.store(false, Ordering::Release);
        self.parker.unpark();
    }

    /// Park while a stop is requested and nothing cancelled it.
    pub(crate) fn wait_while_stopped(&self) {
        self.sleeping.store(true, Ordering::Release);
        while self.stop_requested.load(Ordering::Acquire) && !self.is_cancelled() {
            self.parker.park_timeout(POLL_INTERVAL);
        }
        self.sleeping.store(false, Ordering::Release);
    }

    /// Sleep for `duration` (forever when `None`) or until woken or
    /// cancelled. Returns the time slept.
    pub fn sleep(&self, duration: Option<Duration>) -> Duration {
        let start = Instant::now();
        let deadline = duration.map(|d| start + d);
        self.sleeping.store(true, Ordering::Release);
        while !self.is_cancelled() {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            if self.parker.park_timeout(slice) {
                break;
            }
        }
        self.sleeping.store(false, Ordering::Release);
        start.elapsed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeCreateInfo {
    pub heap: HeapCreateInfo,
    pub scale: ScaleConfig,
}

struct RuntimeShared {
    scheduler: Arc<Scheduler>,
    shutdown: Arc<AtomicBool>,
    heap_info: HeapCreateInfo,
    thread_ids: AtomicU64,
}

/// Process-wide state shared by every heap that can start threads: the
/// worker pool, the shutdown signal and the heap settings.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Self {
        let inner = RuntimeShared {
            scheduler: Arc::new(Scheduler::new(info.scale)),
            shutdown: Arc::new(AtomicBool::new(false)),
            heap_info: info.heap,
            thread_ids: AtomicU64::new(1),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Open a root heap attached to this runtime.
    pub fn open_heap(&self) -> Heap {
        Heap::with_parts(&self.inner.heap_info, Some(self.clone()), self.new_interrupts())
    }

    pub(crate) fn open_worker_heap(&self, interrupts: Arc<Interrupts>) -> Heap {
        Heap::with_parts(&self.inner.heap_info, Some(self.clone()), interrupts)
    }

    pub(crate) fn new_interrupts(&self) -> Arc<Interrupts> {
        Arc::new(Interrupts::new(Arc::clone(&self.inner.shutdown)))
    }

    pub(crate) fn submit(&self, job: Job) -> Result<(), SchedulerError> {
        self.inner.scheduler.submit(job)
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.inner.thread_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Raise the shutdown signal: blocked joins, locks and pops return a
    /// cancellation result, running guest code stops at the next
    /// instruction, and the worker pool is torn down.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("runtime shutting down");
        self.inner.scheduler.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("shutdown", &self.is_shutdown())
            .field("workers", &self.inner.scheduler.worker_count())
            .finish()
    }
}
