use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::{PopError, PushError};

/// An unbounded (optionally size-capped) blocking FIFO.
///
/// Unlike [`BufferQueue`](crate::BufferQueue), storage grows on demand, so
/// pushes only ever block when a maximum size was set with
/// [`with_max_size`](Self::with_max_size). The close semantics are the same:
/// one-way, idempotent, pops drain the remainder and then report
/// [`PopError::Closed`].
pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    max_size: usize,
}

struct Inner<T> {
    elements: VecDeque<T>,
    closed: bool,
}

impl<T> std::fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BlockingQueue")
            .field("len", &inner.elements.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    /// Create a queue with no size limit.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                elements: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_size: usize::MAX,
        }
    }

    /// Create a queue holding at most `max_size` elements.
    ///
    /// Panics if `max_size` is zero.
    pub fn with_max_size(max_size: usize) -> Self {
        assert!(max_size >= 1, "queue size limit must be at least one");
        Self {
            max_size,
            ..Self::new()
        }
    }

    /// Create a queue pre-filled from `items`.
    ///
    /// Panics if `max_size` is zero or `items` yields more than `max_size`
    /// elements.
    pub fn with_items(max_size: usize, items: impl IntoIterator<Item = T>) -> Self {
        let queue = Self::with_max_size(max_size);
        {
            let mut inner = queue.inner.lock().unwrap();
            inner.elements.extend(items);
            assert!(
                inner.elements.len() <= max_size,
                "size limit less than the initial item count"
            );
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().elements.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Push an element, blocking while the queue is at its size limit.
    pub fn push(&self, element: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(PushError::Closed(element));
            }
            if inner.elements.len() < self.max_size {
                break;
            }
            inner = self.not_full.wait(inner).unwrap();
        }
        inner.elements.push_back(element);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push an element without blocking.
    pub fn try_push(&self, element: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(PushError::Closed(element));
        }
        if inner.elements.len() >= self.max_size {
            return Err(PushError::Full(element));
        }
        inner.elements.push_back(element);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the front element, blocking while the queue is empty.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(element) = inner.elements.pop_front() {
                self.not_full.notify_one();
                return Ok(element);
            }
            if inner.closed {
                return Err(PopError::Closed);
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Pop the front element without blocking.
    pub fn try_pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.elements.pop_front() {
            Some(element) => {
                self.not_full.notify_one();
                Ok(element)
            }
            None if inner.closed => Err(PopError::Closed),
            None => Err(PopError::Empty),
        }
    }
}

static_assertions::assert_impl_all!(BlockingQueue<i32>: Send, Sync);
