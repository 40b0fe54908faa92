use std::{any::Any, sync::Arc};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{
    GuestException, Heap, HeapId, HostObject, HostRef, Interrupts, MigrationError, Migrator,
    NativeFn, POLL_INTERVAL, Runtime, SchedulerError, Value, migrate, prime_symbols,
    scheduler::Job,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Migrating,
    Running,
    Completed,
    Killed,
    /// Never started: setting up the worker heap failed.
    Failed,
}

/// What guest `Thread#status` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Run,
    Sleep,
    /// Returned normally or was killed.
    Finished,
    /// Raised, or never started.
    Errored,
}

impl ThreadStatus {
    pub fn to_value(self, heap: &mut Heap) -> Value {
        match self {
            Self::Run => heap.new_string("run"),
            Self::Sleep => heap.new_string("sleep"),
            Self::Finished => Value::Bool(false),
            Self::Errored => Value::Nil,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThreadError {
    #[error("thread could not be created: {0}")]
    CreationFailed(MigrationError),
    #[error("must be called with a block")]
    NotAProc,
    #[error("thread terminated with an exception")]
    Raised(Value),
    #[error("thread result was taken by another heap")]
    ForeignHeap,
    #[error("thread result cannot be copied back: {0}")]
    ResultMigration(MigrationError),
    #[error(transparent)]
    Schedule(#[from] SchedulerError),
    #[error("heap is not attached to a runtime")]
    NoRuntime,
    #[error("target thread must not be current thread")]
    SelfJoin,
}

#[derive(Debug)]
struct ThreadSlot {
    state: ThreadState,
    /// The worker heap while the thread is not running on it.
    worker: Option<Heap>,
    /// Return value or raised exception, both values of the worker heap.
    outcome: Option<Result<Value, Value>>,
    raised: bool,
    /// First join: the joining heap and what it got.
    joined: Option<(HeapId, Result<Value, ThreadError>)>,
    failure: Option<ThreadError>,
    name: Option<String>,
}

/// A guest thread: one procedure running on its own heap on the runtime's
/// worker pool.
#[derive(Debug)]
pub struct ThreadContext {
    id: u64,
    slot: Mutex<ThreadSlot>,
    done: Condvar,
    interrupts: Arc<Interrupts>,
}

impl ThreadContext {
    fn new(runtime: &Runtime) -> Self {
        Self {
            id: runtime.next_thread_id(),
            slot: Mutex::new(ThreadSlot {
                state: ThreadState::Created,
                worker: None,
                outcome: None,
                raised: false,
                joined: None,
                failure: None,
                name: None,
            }),
            done: Condvar::new(),
            interrupts: runtime.new_interrupts(),
        }
    }

    /// Start `target` with `args` on a new heap. The procedure, the
    /// arguments and the globals that are safe to share are copied over
    /// first; a copy failure is reported here and nothing runs.
    pub fn spawn(caller: &Heap, target: &Value, args: &[Value]) -> Result<Arc<Self>, ThreadError> {
        let runtime = caller.runtime().ok_or(ThreadError::NoRuntime)?;
        if !matches!(target, Value::Proc(_)) {
            return Err(ThreadError::NotAProc);
        }
        let ctx = Arc::new(Self::new(runtime));
        ctx.slot.lock().state = ThreadState::Migrating;

        let mut worker = runtime.open_worker_heap(Arc::clone(&ctx.interrupts));
        prime_symbols(caller, &mut worker);
        let (target, args) = match Self::prepare(caller, &mut worker, target, args) {
            Ok(prepared) => prepared,
            Err(err) => {
                log::debug!("thread {} not created: {err}", ctx.id);
                worker.close();
                let err = ThreadError::CreationFailed(err);
                ctx.fail(err.clone());
                return Err(err);
            }
        };
        ctx.start(runtime, worker, target, args)?;
        Ok(ctx)
    }

    /// Like [`spawn`](Self::spawn), but a host function runs on a bare heap:
    /// only the arguments are copied.
    pub fn go(caller: &Heap, target: &Value, args: &[Value]) -> Result<Arc<Self>, ThreadError> {
        if !target.as_host().is_some_and(HostRef::is::<NativeFn>) {
            return Self::spawn(caller, target, args);
        }
        let runtime = caller.runtime().ok_or(ThreadError::NoRuntime)?;
        let ctx = Arc::new(Self::new(runtime));
        ctx.slot.lock().state = ThreadState::Migrating;

        let mut worker = runtime.open_worker_heap(Arc::clone(&ctx.interrupts));
        let mut migrator = Migrator::new(caller, &mut worker);
        let copied: Result<Vec<_>, _> = args.iter().map(|arg| migrator.migrate(arg)).collect();
        let args = match copied {
            Ok(args) => args,
            Err(err) => {
                worker.close();
                let err = ThreadError::CreationFailed(err);
                ctx.fail(err.clone());
                return Err(err);
            }
        };
        ctx.start(runtime, worker, target.clone(), args)?;
        Ok(ctx)
    }

    /// A handle for a thread that never started. Joining it reports `cause`.
    pub fn failed(runtime: &Runtime, cause: ThreadError) -> Arc<Self> {
        let ctx = Arc::new(Self::new(runtime));
        ctx.fail(cause);
        ctx
    }

    fn prepare(
        caller: &Heap,
        worker: &mut Heap,
        target: &Value,
        args: &[Value],
    ) -> Result<(Value, Vec<Value>), MigrationError> {
        let mut migrator = Migrator::new(caller, worker);
        let target = migrator.migrate(target)?;
        let args = args
            .iter()
            .map(|arg| migrator.migrate(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let snapshot = migrator.copy_globals()?;
        log::trace!(
            "thread heap {:?}: globals copied {:?}, skipped {:?}",
            worker.id(),
            snapshot.copied,
            snapshot.skipped
        );

        let object = worker.specials().object;
        if let Some(proc) = target.object_id().and_then(|id| worker.proc_mut(id)) {
            proc.target_class = Some(object);
        }
        Ok((target, args))
    }

    fn fail(&self, cause: ThreadError) {
        let mut slot = self.slot.lock();
        slot.state = ThreadState::Failed;
        slot.failure = Some(cause);
        drop(slot);
        self.done.notify_all();
    }

    fn start(
        self: &Arc<Self>,
        runtime: &Runtime,
        mut worker: Heap,
        target: Value,
        args: Vec<Value>,
    ) -> Result<(), ThreadError> {
        worker.current_thread = Some(self.handle());
        self.slot.lock().state = ThreadState::Running;

        let ctx = Arc::clone(self);
        let job: Job = Box::new(move || ctx.run(worker, target, args));
        if let Err(err) = runtime.submit(job) {
            log::warn!("thread {} could not be scheduled: {err}", self.id);
            let err = ThreadError::from(err);
            self.fail(err.clone());
            return Err(err);
        }
        log::debug!("thread {} started", self.id);
        Ok(())
    }

    fn run(self: Arc<Self>, mut heap: Heap, target: Value, args: Vec<Value>) {
        let outcome = match self.interrupts.is_cancelled() {
            true => Ok(Value::Nil),
            false => heap
                .invoke(&target, Value::Nil, &args)
                .map_err(GuestException::into_value),
        };
        heap.current_thread = None;

        let mut slot = self.slot.lock();
        let discarded = match slot.state {
            ThreadState::Killed => Some(heap),
            _ => {
                if let Err(exc) = &outcome {
                    log::debug!("thread {} raised {}", self.id, heap.inspect(exc));
                }
                slot.state = ThreadState::Completed;
                slot.raised = outcome.is_err();
                slot.outcome = Some(outcome);
                slot.worker = Some(heap);
                None
            }
        };
        drop(slot);
        self.done.notify_all();
        drop(discarded);
        log::debug!("thread {} finished", self.id);
    }

    /// Wait for the thread and copy its result into `caller`. Returns nil
    /// when the thread was killed or the wait was cancelled.
    pub fn join(&self, caller: &mut Heap) -> Result<Value, ThreadError> {
        if caller
            .current_thread()
            .is_some_and(|current| current.addr() == self.addr())
        {
            return Err(ThreadError::SelfJoin);
        }
        let mut slot = self.slot.lock();
        while matches!(
            slot.state,
            ThreadState::Created | ThreadState::Migrating | ThreadState::Running
        ) {
            if caller.interrupts().is_cancelled() {
                return Ok(Value::Nil);
            }
            self.done.wait_for(&mut slot, POLL_INTERVAL);
        }

        match slot.state {
            ThreadState::Failed => slot.failure.clone().map_or(Ok(Value::Nil), Err),
            ThreadState::Completed => {
                if let Some((heap, result)) = &slot.joined {
                    return match *heap == caller.id() {
                        true => result.clone(),
                        false => Err(ThreadError::ForeignHeap),
                    };
                }
                let worker = slot.worker.take();
                let outcome = slot.outcome.take();
                let result = match (&worker, outcome) {
                    (Some(worker), Some(Ok(value))) => {
                        migrate(worker, caller, &value).map_err(ThreadError::ResultMigration)
                    }
                    (Some(worker), Some(Err(exc))) => match migrate(worker, caller, &exc) {
                        Ok(exc) => Err(ThreadError::Raised(exc)),
                        Err(err) => Err(ThreadError::ResultMigration(err)),
                    },
                    _ => Ok(Value::Nil),
                };
                slot.joined = Some((caller.id(), result.clone()));
                drop(slot);
                if let Some(worker) = worker {
                    worker.close();
                }
                result
            }
            _ => Ok(Value::Nil),
        }
    }

    /// Stop the thread at its next instruction or blocking wait and drop
    /// its heap. Does nothing once the thread has finished.
    pub fn kill(&self) {
        let mut slot = self.slot.lock();
        if !matches!(
            slot.state,
            ThreadState::Created | ThreadState::Migrating | ThreadState::Running
        ) {
            return;
        }
        slot.state = ThreadState::Killed;
        slot.outcome = None;
        let worker = slot.worker.take();
        drop(slot);
        self.interrupts.kill();
        self.done.notify_all();
        drop(worker);
        log::debug!("thread {} killed", self.id);
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Created | ThreadState::Migrating | ThreadState::Running
        )
    }

    pub fn state(&self) -> ThreadState {
        self.slot.lock().state
    }

    pub fn status(&self) -> ThreadStatus {
        let slot = self.slot.lock();
        match slot.state {
            ThreadState::Created | ThreadState::Migrating => ThreadStatus::Run,
            ThreadState::Running if self.interrupts.is_sleeping() => ThreadStatus::Sleep,
            ThreadState::Running => ThreadStatus::Run,
            ThreadState::Completed if slot.raised => ThreadStatus::Errored,
            ThreadState::Completed | ThreadState::Killed => ThreadStatus::Finished,
            ThreadState::Failed => ThreadStatus::Errored,
        }
    }

    /// Ask the thread to park at its next instruction until woken.
    pub fn stop(&self) {
        self.interrupts.request_stop();
    }

    /// Resume a stopped thread or cut a sleep short.
    pub fn wakeup(&self) {
        self.interrupts.wakeup();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.slot.lock().name.clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        self.slot.lock().name = name;
    }

    pub fn describe(&self) -> String {
        let status = match self.status() {
            ThreadStatus::Run => "run",
            ThreadStatus::Sleep => "sleep",
            ThreadStatus::Finished | ThreadStatus::Errored => "dead",
        };
        match self.name() {
            Some(name) => format!("#<Thread:{}@{name} {status}>", self.id),
            None => format!("#<Thread:{} {status}>", self.id),
        }
    }

    /// The guest value for this thread.
    pub fn handle(self: &Arc<Self>) -> HostRef {
        HostRef::from_arc(Arc::clone(self) as Arc<dyn HostObject>)
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

impl HostObject for ThreadContext {
    fn class_name(&self) -> &'static str {
        "Thread"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuntimeCreateInfo, test_support::*};
    use std::{
        thread,
        time::{Duration, Instant},
    };

    fn runtime() -> Runtime {
        Runtime::new(RuntimeCreateInfo::default())
    }

    fn spin_proc(heap: &mut Heap) -> Value {
        compile(heap, 0, &[], |b| {
            let top = b.current_offset();
            b.load_nil();
            b.pop();
            b.jump_back(top);
        })
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn join_returns_the_result() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let proc = compile(&mut root, 0, &["+"], |b| {
            b.load_smi(21);
            b.load_smi(21);
            b.send(0, 1);
            b.return_();
        });
        let ctx = ThreadContext::spawn(&root, &proc, &[]).unwrap();
        assert_eq!(ctx.join(&mut root), Ok(Value::Integer(42)));
        assert_eq!(ctx.join(&mut root), Ok(Value::Integer(42)));
        assert_eq!(ctx.status(), ThreadStatus::Finished);
        assert!(!ctx.is_alive());

        let mut other = runtime.open_heap();
        assert_eq!(ctx.join(&mut other), Err(ThreadError::ForeignHeap));
        runtime.shutdown();
    }

    #[test]
    fn raised_exceptions_surface_at_join() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let proc = raising_proc(&mut root, "boom");
        let ctx = ThreadContext::spawn(&root, &proc, &[]).unwrap();
        let Err(ThreadError::Raised(exc)) = ctx.join(&mut root) else {
            panic!("expected a raised exception");
        };
        assert_eq!(root.exception_message(&exc).as_deref(), Some("boom"));
        assert_eq!(root.class_of(&exc), root.specials().runtime_error);
        assert_eq!(ctx.status(), ThreadStatus::Errored);
        runtime.shutdown();
    }

    #[test]
    fn recursive_closures_run_on_the_worker() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let fib = fib_proc(&mut root);
        let ctx = ThreadContext::spawn(&root, &fib, &[Value::Integer(20)]).unwrap();
        assert_eq!(ctx.join(&mut root), Ok(Value::Integer(6765)));
        runtime.shutdown();
    }

    #[test]
    fn arguments_and_safe_globals_are_copied() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        root.set_global("$base", Value::Integer(10));
        let object = root.specials().object;
        let unsafe_global = root.new_object(object);
        root.set_global("$handle", unsafe_global);
        let proc = compile(&mut root, 1, &["$base", "+", "$handle"], |b| {
            b.load_global(0);
            b.load_arg(0);
            b.send(1, 1);
            b.load_global(2);
            b.make_array(2);
            b.return_();
        });
        let ctx = ThreadContext::spawn(&root, &proc, &[Value::Integer(5)]).unwrap();
        let result = ctx.join(&mut root).unwrap();
        assert_eq!(root.inspect(&result), "[15, nil]");
        runtime.shutdown();
    }

    #[test]
    fn globals_holding_closures_over_unknown_classes_are_skipped() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let point = root.define_class("Point", None);
        let captured = root.new_object(point);
        let helper = constant_proc(&mut root, 1);
        root.set_proc_env(&helper, 0, captured);
        root.set_global("$helper", helper);

        let mut other = runtime.open_heap();
        let snapshot = Migrator::new(&root, &mut other).copy_globals().unwrap();
        assert_eq!(snapshot.skipped, vec!["$helper"]);
        assert_eq!(other.get_global("$helper"), Value::Nil);
        other.close();

        let proc = constant_proc(&mut root, 5);
        let ctx = ThreadContext::spawn(&root, &proc, &[]).unwrap();
        assert_eq!(ctx.join(&mut root), Ok(Value::Integer(5)));
        runtime.shutdown();
    }

    #[test]
    fn creation_failure_is_reported() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let point = root.define_class("Point", None);
        let captured = root.new_object(point);
        let proc = constant_proc(&mut root, 1);
        root.set_proc_env(&proc, 0, captured);

        let err = ThreadContext::spawn(&root, &proc, &[]).unwrap_err();
        assert_eq!(
            err,
            ThreadError::CreationFailed(MigrationError::UnknownClassPath("Point".into()))
        );
        let handle = ThreadContext::failed(&runtime, err.clone());
        assert_eq!(handle.join(&mut root), Err(err));
        assert_eq!(handle.status(), ThreadStatus::Errored);
        runtime.shutdown();
    }

    #[test]
    fn kill_stops_a_running_thread() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let proc = spin_proc(&mut root);
        let ctx = ThreadContext::spawn(&root, &proc, &[]).unwrap();
        assert!(ctx.is_alive());
        ctx.kill();
        assert!(!ctx.is_alive());
        assert_eq!(ctx.state(), ThreadState::Killed);
        assert_eq!(ctx.join(&mut root), Ok(Value::Nil));
        assert_eq!(ctx.status(), ThreadStatus::Finished);
        ctx.kill();
        runtime.shutdown();
    }

    #[test]
    fn stop_parks_until_wakeup() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let proc = spin_proc(&mut root);
        let ctx = ThreadContext::spawn(&root, &proc, &[]).unwrap();
        ctx.stop();
        assert!(wait_until(|| ctx.status() == ThreadStatus::Sleep));
        ctx.wakeup();
        assert!(wait_until(|| ctx.status() == ThreadStatus::Run));
        ctx.kill();
        runtime.shutdown();
    }

    #[test]
    fn shutdown_unblocks_join() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let proc = spin_proc(&mut root);
        let ctx = ThreadContext::spawn(&root, &proc, &[]).unwrap();
        let stopper = {
            let runtime = runtime.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                runtime.shutdown();
            })
        };
        assert_eq!(ctx.join(&mut root), Ok(Value::Nil));
        stopper.join().unwrap();
    }

    #[test]
    fn go_runs_host_functions_on_a_bare_heap() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        root.set_global("$ignored", Value::Integer(1));
        let native = NativeFn::new("double_and_peek", |heap, args| {
            let doubled = match args.first() {
                Some(Value::Integer(i)) => Value::Integer(i * 2),
                _ => Value::Nil,
            };
            let peeked = heap.get_global("$ignored");
            Ok(heap.new_array(vec![doubled, peeked]))
        });
        let target = Value::Host(HostRef::new(native));
        let ctx = ThreadContext::go(&root, &target, &[Value::Integer(21)]).unwrap();
        let result = ctx.join(&mut root).unwrap();
        assert_eq!(root.inspect(&result), "[42, nil]");
        runtime.shutdown();
    }

    #[test]
    fn spawning_needs_a_runtime_and_a_proc() {
        let runtime = runtime();
        let root = runtime.open_heap();
        assert_eq!(
            ThreadContext::spawn(&root, &Value::Integer(1), &[]).unwrap_err(),
            ThreadError::NotAProc
        );
        let mut standalone = Heap::open();
        let proc = constant_proc(&mut standalone, 1);
        assert_eq!(
            ThreadContext::spawn(&standalone, &proc, &[]).unwrap_err(),
            ThreadError::NoRuntime
        );
        runtime.shutdown();
    }

    #[test]
    fn names_and_descriptions() {
        let runtime = runtime();
        let mut root = runtime.open_heap();
        let proc = constant_proc(&mut root, 0);
        let ctx = ThreadContext::spawn(&root, &proc, &[]).unwrap();
        ctx.set_name(Some("worker".into()));
        ctx.join(&mut root).unwrap();
        assert_eq!(ctx.describe(), format!("#<Thread:{}@worker dead>", ctx.id()));
        runtime.shutdown();
    }
}
