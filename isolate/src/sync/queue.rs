use std::{any::Any, collections::VecDeque, fmt};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::{Heap, HostObject, MigrationError, POLL_INTERVAL, Value, migrate};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("queue empty")]
    Empty,
    #[error("queue full")]
    Full,
    #[error("wait was cancelled")]
    Cancelled,
    #[error("item cannot cross heaps: {0}")]
    Migration(#[from] MigrationError),
}

struct QueueState {
    /// Holds queued items between the pushing and the popping heap.
    transit: Heap,
    items: VecDeque<Value>,
    closed: bool,
    waiting: usize,
}

/// Guest `Queue` and `SizedQueue`: a blocking FIFO shared between heaps.
/// Items are copied into the queue's own heap on push and out of it on pop.
pub struct GuestQueue {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl GuestQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// A bounded queue. `capacity` must be positive.
    pub fn sized(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                transit: Heap::open(),
                items: VecDeque::new(),
                closed: false,
                waiting: 0,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn wait(&self, cv: &Condvar, state: &mut MutexGuard<'_, QueueState>) {
        state.waiting += 1;
        cv.wait_for(state, POLL_INTERVAL);
        state.waiting -= 1;
    }

    /// Copy `value` from `heap` onto the back of the queue, waiting for
    /// room unless `non_block`.
    pub fn push(&self, heap: &Heap, value: &Value, non_block: bool) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if self.capacity.is_none_or(|cap| state.items.len() < cap) {
                break;
            }
            if non_block {
                return Err(QueueError::Full);
            }
            if heap.interrupts().is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            self.wait(&self.not_full, &mut state);
        }
        let item = migrate(heap, &mut state.transit, value)?;
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the front item, copied into `heap`. Waits for one unless
    /// `non_block`. A closed queue still hands out what it holds.
    pub fn pop(&self, heap: &mut Heap, non_block: bool) -> Result<Value, QueueError> {
        let mut guard = self.state.lock();
        loop {
            let state = &mut *guard;
            if let Some(item) = state.items.pop_front() {
                let value = migrate(&state.transit, heap, &item);
                state.transit.collect(state.items.make_contiguous());
                drop(guard);
                self.not_full.notify_one();
                return Ok(value?);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if non_block {
                return Err(QueueError::Empty);
            }
            if heap.interrupts().is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            self.wait(&self.not_empty, &mut guard);
        }
    }

    /// Refuse further pushes and wake every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            log::trace!("queue closed with {} items", state.items.len());
        }
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.transit.collect(&[]);
        drop(state);
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max(&self) -> Option<usize> {
        self.capacity
    }

    /// Heaps blocked in `push` or `pop`.
    pub fn num_waiting(&self) -> usize {
        self.state.lock().waiting
    }
}

impl Default for GuestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GuestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GuestQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

impl HostObject for GuestQueue {
    fn class_name(&self) -> &'static str {
        match self.capacity {
            Some(_) => "SizedQueue",
            None => "Queue",
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn items_cross_heaps_by_copy() {
        let queue = GuestQueue::new();
        let mut producer = Heap::open();
        let mut consumer = Heap::open();

        let text = producer.new_string("hello");
        let array = producer.new_array(vec![text.clone(), Value::Integer(1)]);
        queue.push(&producer, &array, false).unwrap();
        producer.array_push(&array, Value::Integer(2));

        let popped = queue.pop(&mut consumer, true).unwrap();
        assert_eq!(consumer.inspect(&popped), "[\"hello\", 1]");
        assert!(queue.is_empty());
        assert_eq!(queue.state.lock().transit.live_objects(), 0);
    }

    #[test]
    fn transit_heap_holds_only_queued_items() {
        let queue = GuestQueue::new();
        let mut producer = Heap::open();
        let mut consumer = Heap::open();

        let first = producer.new_array(vec![Value::Integer(-1)]);
        queue.push(&producer, &first, false).unwrap();
        for i in 0..1000 {
            let item = producer.new_array(vec![Value::Integer(i)]);
            queue.push(&producer, &item, false).unwrap();
            let popped = queue.pop(&mut consumer, true).unwrap();
            assert_eq!(consumer.inspect(&popped), format!("[{}]", i - 1));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state.lock().transit.live_objects(), 1);
        let last = queue.pop(&mut consumer, true).unwrap();
        assert_eq!(consumer.inspect(&last), "[999]");
    }

    #[test]
    fn fifo_order_across_threads() {
        let queue = Arc::new(GuestQueue::sized(2));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let heap = Heap::open();
                for i in 0..20 {
                    queue.push(&heap, &Value::Integer(i), false).unwrap();
                }
                queue.close();
            })
        };
        let mut heap = Heap::open();
        let mut seen = Vec::new();
        loop {
            match queue.pop(&mut heap, false) {
                Ok(Value::Integer(i)) => seen.push(i),
                Ok(other) => panic!("unexpected {other:?}"),
                Err(QueueError::Closed) => break,
                Err(err) => panic!("{err}"),
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn closed_queues_drain_then_fail() {
        let queue = GuestQueue::new();
        let mut heap = Heap::open();
        queue.push(&heap, &Value::Integer(1), false).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.push(&heap, &Value::Integer(2), false), Err(QueueError::Closed));
        assert_eq!(queue.pop(&mut heap, false), Ok(Value::Integer(1)));
        assert_eq!(queue.pop(&mut heap, false), Err(QueueError::Closed));
        assert_eq!(queue.pop(&mut heap, true), Err(QueueError::Closed));
    }

    #[test]
    fn close_wakes_a_blocked_pop() {
        let queue = Arc::new(GuestQueue::new());
        let popper = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut heap = Heap::open();
                queue.pop(&mut heap, false)
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.num_waiting(), 1);
        queue.close();
        assert_eq!(popper.join().unwrap(), Err(QueueError::Closed));
    }

    #[test]
    fn non_blocking_operations() {
        let queue = GuestQueue::sized(1);
        let mut heap = Heap::open();
        assert_eq!(queue.pop(&mut heap, true), Err(QueueError::Empty));
        queue.push(&heap, &Value::Nil, true).unwrap();
        assert_eq!(queue.push(&heap, &Value::Nil, true), Err(QueueError::Full));
        assert_eq!(queue.max(), Some(1));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn items_of_unknown_classes_are_refused() {
        let queue = GuestQueue::new();
        let mut heap = Heap::open();
        let point = heap.define_class("Point", None);
        let obj = heap.new_object(point);
        assert_eq!(
            queue.push(&heap, &obj, false),
            Err(QueueError::Migration(MigrationError::UnknownClassPath("Point".into())))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn kill_cancels_a_blocked_push() {
        let queue = Arc::new(GuestQueue::sized(1));
        let heap = Heap::open();
        queue.push(&heap, &Value::Integer(1), false).unwrap();
        let interrupts = heap.interrupts().clone();
        let pusher = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(&heap, &Value::Integer(2), false))
        };
        thread::sleep(Duration::from_millis(30));
        interrupts.kill();
        assert_eq!(pusher.join().unwrap(), Err(QueueError::Cancelled));
        assert_eq!(queue.len(), 1);
    }
}
