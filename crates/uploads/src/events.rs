use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::ring::RingBuffer;

/// Bounded, non-blocking event queue feeding a single consumer task.
///
/// `add` never blocks and never fails: when the queue is full the oldest
/// undelivered event is silently discarded. Surviving events are delivered
/// strictly in arrival order. Events added after [`stop`](Self::stop) are
/// dropped.
pub struct EventsQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    buf: RingBuffer<T>,
    closed: bool,
}

impl<T: Send + 'static> EventsQueue<T> {
    /// Creates a queue holding up to `capacity` pending events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    buf: RingBuffer::new(capacity),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues an event and wakes the consumer. No-op after `stop`.
    pub fn add(&self, event: T) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.buf.put(event);
        }
        self.inner.notify.notify_one();
    }

    /// Spawns the consumer task, invoking `consume` once per delivered event.
    ///
    /// The queue supports exactly one consumer; events pending when the queue
    /// is stopped are not delivered.
    pub fn start(&self, consume: impl Fn(T) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = {
                    let mut state = inner.state.lock().unwrap();
                    if state.closed {
                        break;
                    }
                    state.buf.pop()
                };

                match event {
                    Some(e) => consume(e),
                    None => inner.notify.notified().await,
                }
            }
        });
    }

    /// Stops the consumer without draining. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
        }
        // notify_one leaves a permit behind, so a consumer that parks between
        // the closed check and the await still wakes up.
        self.inner.notify.notify_one();
    }
}
