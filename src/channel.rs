// Typed FIFO channel connecting pipeline stages
//
// Two flavors: bounded (between pipeline stages, produces backpressure) and
// unbounded (context queues between spanners, where a bound could deadlock
// two spanners waiting on each other at asymmetric rates).
//
// Lifecycle: `close` lets readers drain what is buffered and then reports
// empty; `poison` makes readers and writers fail immediately and is the
// cancellation path for fatal errors. Every waiter wakes on any state change.
//
// Locking: a plain std::sync::Mutex guards the queue; it is never held
// across an await. Wakeups go through two tokio Notify instances, with the
// Notified future enabled before re-checking state so no wakeup is lost.

use crate::errors::PipelineError;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct ChannelState<T> {
    queue: VecDeque<T>,
    closed: bool,
    poisoned: bool,
}

/// A FIFO channel with cooperative async push/pop, close and poison.
#[derive(Debug)]
pub struct Channel<T> {
    state: Mutex<ChannelState<T>>,
    capacity: Option<usize>,
    readable: Notify,
    writable: Notify,
}

impl<T> Channel<T> {
    /// Channel that blocks writers once `capacity` values are buffered.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "the channel must have a capacity of at least 1");
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                poisoned: false,
            }),
            capacity: Some(capacity),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Channel that never blocks writers.
    pub fn unbounded() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                closed: false,
                poisoned: false,
            }),
            capacity: None,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Push a value, waiting while the channel is full. Returns false if the
    /// channel is closed or poisoned (the value is dropped).
    pub async fn push(&self, value: T) -> bool {
        let mut value = Some(value);
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.closed || state.poisoned {
                    return false;
                }
                if self.capacity.map_or(true, |cap| state.queue.len() < cap) {
                    state.queue.push_back(value.take().expect("value pushed twice"));
                    drop(state);
                    self.readable.notify_one();
                    return true;
                }
            }

            notified.await;
        }
    }

    /// Push for pipeline stages: distinguishes the downstream finishing
    /// early (ChannelClosed, a normal stop) from fatal shutdown
    /// (ChannelPoisoned).
    pub async fn send(&self, value: T) -> Result<(), PipelineError> {
        if self.push(value).await {
            return Ok(());
        }
        if self.is_poisoned() {
            Err(PipelineError::ChannelPoisoned)
        } else {
            Err(PipelineError::ChannelClosed)
        }
    }

    /// Non-blocking push. Returns false if full, closed, or poisoned.
    #[allow(dead_code)]
    pub fn try_push(&self, value: T) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.poisoned {
            return false;
        }
        if let Some(cap) = self.capacity {
            if state.queue.len() >= cap {
                return false;
            }
        }
        state.queue.push_back(value);
        drop(state);
        self.readable.notify_one();
        true
    }

    /// Pop a value, waiting until one is available. Returns None once the
    /// channel is drained after close, or immediately after poison.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.poisoned {
                    return None;
                }
                if let Some(value) = state.queue.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if state.poisoned {
            return None;
        }
        let value = state.queue.pop_front()?;
        drop(state);
        self.writable.notify_one();
        Some(value)
    }

    /// Stop writers; readers may still drain buffered values.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Fatal shutdown: readers and writers fail immediately, buffered
    /// values are discarded.
    pub fn poison(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.poisoned = true;
            state.queue.clear();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().unwrap().poisoned
    }

    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
