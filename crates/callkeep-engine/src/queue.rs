//! Bounded multi-producer, single-consumer action queue.
//!
//! Producers never wait: when the buffer is full the oldest buffered action
//! is discarded so the newest directive always survives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use callkeep_core::{Action, ActionTicket};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::EngineError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

struct Buffer {
    items: VecDeque<(ActionTicket, Action)>,
    closed: bool,
}

pub struct ActionQueue {
    buffer: Mutex<Buffer>,
    notify: Notify,
    capacity: usize,
    next_ticket: AtomicU64,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ActionQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(Buffer {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Buffer an action. Never blocks; a closed queue discards it.
    pub fn enqueue(&self, action: Action) -> ActionTicket {
        match self.try_enqueue(action) {
            Ok(ticket) => ticket,
            Err(_) => {
                let ticket = self.issue_ticket();
                warn!(ticket = %ticket, "action submitted after queue close, discarded");
                ticket
            }
        }
    }

    pub fn try_enqueue(&self, action: Action) -> Result<ActionTicket, EngineError> {
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return Err(EngineError::QueueClosed);
        }
        let ticket = self.issue_ticket();
        if buffer.items.len() >= self.capacity {
            if let Some((dropped_ticket, dropped)) = buffer.items.pop_front() {
                debug!(ticket = %dropped_ticket, action = dropped.name(), "queue full, dropped oldest action");
            }
        }
        buffer.items.push_back((ticket, action));
        drop(buffer);
        self.notify.notify_one();
        Ok(ticket)
    }

    /// Next buffered action. `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<(ActionTicket, Action)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut buffer = self.buffer.lock();
                if let Some(item) = buffer.items.pop_front() {
                    return Some(item);
                }
                if buffer.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting actions. Already buffered actions are still delivered.
    pub fn close(&self) {
        self.buffer.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.lock().closed
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn issue_ticket(&self) -> ActionTicket {
        ActionTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed))
    }
}
