//! Guest-visible `Thread`, `Mutex`, `Queue` and `SizedQueue`.

use crate::{
    ClassId, GuestException, GuestMutex, GuestQueue, Heap, HostRef, QueueError, SyncError,
    ThreadContext, ThreadError, Value,
    builtins::{
        MethodResult, check_args, expect_block, expect_integer, expect_interval, expect_string,
        yield_to,
    },
};

pub(crate) fn class_method(
    heap: &mut Heap,
    class: ClassId,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    let s = *heap.specials();
    let value = if class == s.thread {
        match name {
            "new" | "start" | "fork" => start_thread(heap, args, block, false)?,
            "go" => start_thread(heap, args, block, true)?,
            "current" => {
                check_args(heap, args, 0, 0)?;
                heap.current_thread().cloned().map_or(Value::Nil, Value::Host)
            }
            "pass" => {
                std::thread::yield_now();
                Value::Nil
            }
            _ => return Ok(None),
        }
    } else if name != "new" {
        return Ok(None);
    } else if class == s.mutex {
        check_args(heap, args, 0, 0)?;
        Value::Host(HostRef::new(GuestMutex::new()))
    } else if class == s.queue {
        check_args(heap, args, 0, 0)?;
        Value::Host(HostRef::new(GuestQueue::new()))
    } else if class == s.sized_queue {
        check_args(heap, args, 1, 1)?;
        let capacity = expect_integer(heap, &args[0])?;
        let capacity = match usize::try_from(capacity) {
            Ok(capacity) if capacity > 0 => capacity,
            _ => return Err(heap.argument_error("queue size must be positive")),
        };
        Value::Host(HostRef::new(GuestQueue::sized(capacity)))
    } else {
        return Ok(None);
    };
    Ok(Some(value))
}

/// `Thread.new { }` and `Thread.new(callable, *args)`. A creation failure
/// still hands back a thread; joining it raises the cause.
fn start_thread(
    heap: &mut Heap,
    args: &[Value],
    block: Option<&Value>,
    go: bool,
) -> Result<Value, GuestException> {
    let (target, args) = match (block, args.split_first()) {
        (Some(block), _) => (block.clone(), args),
        (None, Some((target, rest))) => (target.clone(), rest),
        (None, None) => return Err(thread_error(heap, &ThreadError::NotAProc)),
    };
    let started = match go {
        true => ThreadContext::go(heap, &target, args),
        false => ThreadContext::spawn(heap, &target, args),
    };
    match started {
        Ok(ctx) => Ok(Value::Host(ctx.handle())),
        Err(err @ ThreadError::CreationFailed(_)) => match heap.runtime() {
            Some(runtime) => Ok(Value::Host(ThreadContext::failed(runtime, err).handle())),
            None => Err(thread_error(heap, &err)),
        },
        Err(err) => Err(thread_error(heap, &err)),
    }
}

pub(crate) fn host_method(
    heap: &mut Heap,
    host: &HostRef,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    if let Some(thread) = host.downcast_ref::<ThreadContext>() {
        return thread_method(heap, host, thread, name, args);
    }
    if let Some(mutex) = host.downcast_ref::<GuestMutex>() {
        return mutex_method(heap, host, mutex, name, args, block);
    }
    if let Some(queue) = host.downcast_ref::<GuestQueue>() {
        return queue_method(heap, host, queue, name, args);
    }
    Ok(None)
}

fn thread_method(
    heap: &mut Heap,
    host: &HostRef,
    thread: &ThreadContext,
    name: &str,
    args: &[Value],
) -> MethodResult {
    let value = match name {
        "join" | "value" => {
            check_args(heap, args, 0, 0)?;
            match thread.join(heap) {
                Ok(value) => value,
                Err(err) => return Err(thread_error(heap, &err)),
            }
        }
        "kill" | "terminate" | "exit" => {
            thread.kill();
            Value::Host(host.clone())
        }
        "alive?" => Value::Bool(thread.is_alive()),
        "status" => thread.status().to_value(heap),
        "stop" => {
            thread.stop();
            Value::Nil
        }
        "wakeup" | "run" => {
            thread.wakeup();
            Value::Host(host.clone())
        }
        "name" => match thread.name() {
            Some(name) => heap.new_string(name),
            None => Value::Nil,
        },
        "name=" => {
            check_args(heap, args, 1, 1)?;
            let name = match &args[0] {
                Value::Nil => None,
                other => Some(expect_string(heap, other)?),
            };
            thread.set_name(name);
            args[0].clone()
        }
        "to_s" | "inspect" => {
            let text = thread.describe();
            heap.new_string(text)
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn mutex_method(
    heap: &mut Heap,
    host: &HostRef,
    mutex: &GuestMutex,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    let value = match name {
        "lock" => {
            mutex.lock(heap).map_err(|err| sync_error(heap, err))?;
            Value::Host(host.clone())
        }
        "unlock" => {
            mutex.unlock(heap).map_err(|err| sync_error(heap, err))?;
            Value::Host(host.clone())
        }
        "try_lock" => Value::Bool(mutex.try_lock(heap)),
        "locked?" => Value::Bool(mutex.is_locked()),
        "owned?" => Value::Bool(mutex.is_owned_by(heap)),
        "synchronize" => {
            let block = expect_block(heap, block, "synchronize")?;
            match mutex.synchronize(heap, |heap| yield_to(heap, &block, &[])) {
                Ok(result) => result?,
                Err(err) => return Err(sync_error(heap, err)),
            }
        }
        "sleep" => {
            check_args(heap, args, 0, 1)?;
            let timeout = expect_interval(heap, args.first())?;
            let slept = mutex.sleep(heap, timeout).map_err(|err| sync_error(heap, err))?;
            Value::Integer(slept.as_secs() as i64)
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn queue_method(
    heap: &mut Heap,
    host: &HostRef,
    queue: &GuestQueue,
    name: &str,
    args: &[Value],
) -> MethodResult {
    let value = match name {
        "push" | "<<" | "enq" | "unshift" => {
            check_args(heap, args, 1, 2)?;
            let non_block = args.get(1).is_some_and(Value::is_truthy);
            queue
                .push(heap, &args[0], non_block)
                .map_err(|err| queue_error(heap, err))?;
            Value::Host(host.clone())
        }
        "pop" | "shift" | "deq" => {
            check_args(heap, args, 0, 1)?;
            let non_block = args.first().is_some_and(Value::is_truthy);
            queue.pop(heap, non_block).map_err(|err| queue_error(heap, err))?
        }
        "close" => {
            queue.close();
            Value::Host(host.clone())
        }
        "closed?" => Value::Bool(queue.is_closed()),
        "size" | "length" => Value::Integer(queue.len() as i64),
        "empty?" => Value::Bool(queue.is_empty()),
        "clear" => {
            queue.clear();
            Value::Host(host.clone())
        }
        "max" => queue.max().map_or(Value::Nil, |max| Value::Integer(max as i64)),
        "num_waiting" => Value::Integer(queue.num_waiting() as i64),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn thread_error(heap: &mut Heap, err: &ThreadError) -> GuestException {
    match err {
        ThreadError::Raised(exc) => GuestException(exc.clone()),
        _ => {
            let class = heap.specials().thread_error;
            heap.raise_error(class, err.to_string())
        }
    }
}

fn sync_error(heap: &mut Heap, err: SyncError) -> GuestException {
    match err {
        SyncError::Cancelled => heap.cancellation(),
        _ => {
            let class = heap.specials().thread_error;
            heap.raise_error(class, err.to_string())
        }
    }
}

fn queue_error(heap: &mut Heap, err: QueueError) -> GuestException {
    let s = *heap.specials();
    match err {
        QueueError::Cancelled => heap.cancellation(),
        QueueError::Closed => heap.raise_error(s.closed_queue_error, err.to_string()),
        QueueError::Migration(_) => heap.type_error(err.to_string()),
        QueueError::Empty | QueueError::Full => heap.raise_error(s.thread_error, err.to_string()),
    }
}
