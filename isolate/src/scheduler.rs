use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    Stopped,
    #[error("could not spawn a worker thread: {0}")]
    Spawn(String),
}

struct WorkItem {
    job: Job,
}

struct Worker {
    id: WorkerId,
    local: Mutex<VecDeque<WorkItem>>,
    has_work: Condvar,
    should_stop: AtomicBool,
    /// Set while the worker runs a job or is about to.
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            local: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            should_stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    fn push(&self, w: WorkItem) {
        {
            let mut q = self.local.lock();
            q.push_back(w);
        }
        self.has_work.notify_one();
    }

    fn steal_back(&self) -> Option<WorkItem> {
        self.local.lock().pop_back()
    }

    /// Neither running nor holding queued work.
    fn is_idle(&self) -> bool {
        let q = self.local.lock();
        q.is_empty() && !self.running.load(Ordering::Acquire)
    }

    fn backlog(&self) -> usize {
        self.local.lock().len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScaleConfig {
    /// If a pool worker is idle for this long, it exits.
    pub retire_after_idle: Duration,
    /// Upper bound of pool workers.
    pub max_pool_workers: usize,
    pub worker_stack_size: usize,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            retire_after_idle: Duration::from_millis(500),
            max_pool_workers: 256,
            worker_stack_size: 8 * 1024 * 1024,
        }
    }
}

/// Worker pool running guest threads. Jobs may block for a long time
/// (joins, queue pops), so a job is only queued behind another when no
/// idle worker exists and the pool cannot grow.
pub struct Scheduler {
    pool: Mutex<Vec<Arc<Worker>>>,
    id_gen: AtomicU64,
    scale: ScaleConfig,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn new(scale: ScaleConfig) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            id_gen: AtomicU64::new(0),
            scale,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn scale(&self) -> &ScaleConfig {
        &self.scale
    }

    pub fn worker_count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Create a new pool worker thread. Called with the pool locked.
    fn spawn_pool_worker(
        self: &Arc<Self>,
        pool: &mut Vec<Arc<Worker>>,
    ) -> std::io::Result<Arc<Worker>> {
        let id = WorkerId(self.id_gen.fetch_add(1, Ordering::Relaxed) + 1);
        let w = Worker::new(id);
        let me = Arc::clone(self);
        let w_clone = Arc::clone(&w);
        let handle = thread::Builder::new()
            .name(format!("isolate-worker-{}", id.0))
            .stack_size(self.scale.worker_stack_size)
            .spawn(move || me.worker_loop(w_clone))?;
        *w.handle.lock() = Some(handle);
        pool.push(Arc::clone(&w));
        log::debug!("spawned worker {} ({} in pool)", id.0, pool.len());
        Ok(w)
    }

    /// Submit a job for execution on the pool.
    pub fn submit(self: &Arc<Self>, job: Job) -> Result<(), SchedulerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SchedulerError::Stopped);
        }
        // Pushing with the pool locked keeps retiring workers from taking
        // a job with them.
        let mut pool = self.pool.lock();
        let w = self.pick_or_spawn_pool_worker(&mut pool)?;
        w.push(WorkItem { job });
        Ok(())
    }

    fn pick_or_spawn_pool_worker(
        self: &Arc<Self>,
        pool: &mut Vec<Arc<Worker>>,
    ) -> Result<Arc<Worker>, SchedulerError> {
        if let Some(idle) = pool.iter().find(|w| w.is_idle()) {
            return Ok(Arc::clone(idle));
        }

        if pool.len() < self.scale.max_pool_workers {
            match self.spawn_pool_worker(pool) {
                Ok(w) => return Ok(w),
                Err(e) if pool.is_empty() => return Err(SchedulerError::Spawn(e.to_string())),
                Err(e) => log::warn!("could not grow worker pool: {e}"),
            }
        }

        pool.iter()
            .min_by_key(|w| w.backlog())
            .cloned()
            .ok_or(SchedulerError::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop all workers once their current job finishes. Queued jobs are
    /// dropped.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let workers: Vec<_> = self.pool.lock().drain(..).collect();
        for w in &workers {
            w.should_stop.store(true, Ordering::Release);
            w.has_work.notify_all();
        }
        let current = thread::current().id();
        for w in workers {
            let handle = w.handle.lock().take();
            if let Some(h) = handle {
                if h.thread().id() != current {
                    let _ = h.join();
                }
            }
        }
    }

    fn next_job(&self, me: &Arc<Worker>) -> Option<WorkItem> {
        {
            let mut q = me.local.lock();
            me.running.store(true, Ordering::Release);
            if let Some(work) = q.pop_front() {
                return Some(work);
            }
        }
        if let Some(work) = self.try_steal(me) {
            return Some(work);
        }
        me.running.store(false, Ordering::Release);
        None
    }

    fn worker_loop(self: Arc<Self>, me: Arc<Worker>) {
        let retire_after = self.scale.retire_after_idle;
        let mut last_work = Instant::now();

        loop {
            if me.should_stop.load(Ordering::Acquire) {
                break;
            }

            if let Some(work) = self.next_job(&me) {
                self.run_job(&me, work);
                me.running.store(false, Ordering::Release);
                last_work = Instant::now();
                continue;
            }

            let timeout = Duration::from_millis(10);
            {
                let mut guard = me.local.lock();
                if guard.is_empty() && !me.should_stop.load(Ordering::Acquire) {
                    let _ = me.has_work.wait_for(&mut guard, timeout);
                }
            }

            if Instant::now().duration_since(last_work) >= retire_after {
                let mut pool = self.pool.lock();
                if !me.local.lock().is_empty() {
                    continue;
                }
                if let Some(pos) = pool.iter().position(|w| w.id == me.id) {
                    pool.swap_remove(pos);
                }
                log::debug!("worker {} retired ({} left)", me.id.0, pool.len());
                break;
            }
        }
    }

    fn try_steal(&self, me: &Arc<Worker>) -> Option<WorkItem> {
        let pool_snapshot = self.pool.lock().clone();
        for w in pool_snapshot {
            if w.id != me.id {
                if let Some(work) = w.steal_back() {
                    return Some(work);
                }
            }
        }
        None
    }

    fn run_job(&self, me: &Worker, work: WorkItem) {
        if panic::catch_unwind(AssertUnwindSafe(work.job)).is_err() {
            log::error!("job panicked on worker {}", me.id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn small_pool(max: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(ScaleConfig {
            retire_after_idle: Duration::from_millis(50),
            max_pool_workers: max,
            worker_stack_size: 256 * 1024,
        }))
    }

    #[test]
    fn pool_workers_run_all_jobs() {
        let sched = small_pool(4);
        let n = 16;
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..n {
            let ran = ran.clone();
            sched
                .submit(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), n);
        assert!(sched.worker_count() <= 4);
        sched.shutdown();
    }

    #[test]
    fn blocking_job_does_not_starve_the_next_one() {
        let sched = small_pool(8);
        let (tx, rx) = mpsc::channel::<u32>();
        let (done_tx, done_rx) = mpsc::channel::<u32>();

        sched
            .submit(Box::new(move || {
                let v = rx.recv_timeout(Duration::from_secs(5)).unwrap_or(0);
                done_tx.send(v).unwrap();
            }))
            .unwrap();
        sched
            .submit(Box::new(move || {
                tx.send(42).unwrap();
            }))
            .unwrap();

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(42));
        sched.shutdown();
    }

    #[test]
    fn idle_workers_retire() {
        let sched = small_pool(2);
        let (tx, rx) = mpsc::channel();
        sched
            .submit(Box::new(move || {
                tx.send(()).unwrap();
            }))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sched.worker_count(), 1);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(sched.worker_count(), 0);
        sched.shutdown();
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let sched = small_pool(1);
        sched
            .submit(Box::new(|| {
                panic!("boom");
            }))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        sched
            .submit(Box::new(move || {
                tx.send(7).unwrap();
            }))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(7));
        sched.shutdown();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let sched = small_pool(1);
        sched.shutdown();
        assert!(sched.is_stopped());
        assert_eq!(sched.submit(Box::new(|| ())), Err(SchedulerError::Stopped));
    }
}
