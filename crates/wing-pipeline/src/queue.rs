use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity FIFO where the producer never waits: a `put` on a full
/// queue evicts the oldest entry ("newest wins"). Consumers block in `get`.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<State<T>>,
    ready: Condvar,
    evicted: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            state: Mutex::new(State { items: VecDeque::with_capacity(capacity), closed: false }),
            ready: Condvar::new(),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Never blocks. Returns the evicted entry when the queue was full.
    /// Puts after `close` are dropped and handed back.
    pub fn put(&self, item: T) -> Option<T> {
        let mut st = self.lock();
        if st.closed {
            return Some(item);
        }
        let evicted = if st.items.len() >= self.capacity {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            st.items.pop_front()
        } else {
            None
        };
        st.items.push_back(item);
        drop(st);
        self.ready.notify_one();
        evicted
    }

    /// Blocks until an item is available. `None` once closed and drained.
    pub fn get(&self) -> Option<T> {
        let mut st = self.lock();
        loop {
            if let Some(item) = st.items.pop_front() {
                return Some(item);
            }
            if st.closed {
                return None;
            }
            st = self.ready.wait(st).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Like `get`, giving up after `timeout`. Stage loops use this so they
    /// can look at the shutdown flag between waits.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        loop {
            if let Some(item) = st.items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if st.closed || now >= deadline {
                return None;
            }
            st = self.ready.wait_timeout(st, deadline - now).unwrap_or_else(|p| p.into_inner()).0;
        }
    }

    /// Wakes every waiting consumer; remaining items can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
