use std::sync::{Condvar, Mutex};

use crate::{PopError, PushError};

/// A lock-based bounded ring buffer.
///
/// Capacity is fixed at construction. Blocking pushes wait while the queue
/// is full; blocking pops wait while it is empty. Closing the queue is
/// one-way and wakes every waiter: pushes then fail with
/// [`PushError::Closed`], pops drain the remaining elements and then fail
/// with [`PopError::Closed`].
pub struct BufferQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    /// One spare slot distinguishes full from empty by index comparison.
    slots: Box<[Option<T>]>,
    push_index: usize,
    pop_index: usize,
    closed: bool,
    /// Producers currently blocked on `not_full`.
    waiting_full: usize,
    /// Consumers currently blocked on `not_empty`.
    waiting_empty: usize,
}

impl<T> Inner<T> {
    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.push_index == self.pop_index
    }
}

impl<T> std::fmt::Debug for BufferQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BufferQueue")
            .field("capacity", &(inner.slots.len() - 1))
            .field("is_empty", &inner.is_empty())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> BufferQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least one");
        let slots = (0..capacity + 1).map(|_| None).collect();
        Self {
            inner: Mutex::new(Inner {
                slots,
                push_index: 0,
                pop_index: 0,
                closed: false,
                waiting_full: 0,
                waiting_empty: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Create a queue pre-filled from `items`.
    ///
    /// Panics if `capacity` is zero or `items` yields more than `capacity`
    /// elements.
    pub fn with_items(capacity: usize, items: impl IntoIterator<Item = T>) -> Self {
        let queue = Self::new(capacity);
        {
            let mut inner = queue.inner.lock().unwrap();
            for (count, item) in items.into_iter().enumerate() {
                assert!(count < capacity, "too few slots for the initial items");
                let index = inner.push_index;
                inner.slots[index] = Some(item);
                inner.push_index = inner.next(index);
            }
        }
        queue
    }

    /// The maximum number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().slots.len() - 1
    }

    /// Close the queue and wake every blocked producer and consumer.
    /// Idempotent; any participant may close.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Push an element, blocking while the queue is full.
    ///
    /// Fails with [`PushError::Closed`] (handing the element back) once the
    /// queue is closed.
    pub fn push(&self, element: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(PushError::Closed(element));
            }
            if inner.next(inner.push_index) != inner.pop_index {
                break;
            }
            inner.waiting_full += 1;
            inner = self.not_full.wait(inner).unwrap();
        }
        self.push_at(&mut inner, element);
        Ok(())
    }

    /// Push an element without blocking.
    pub fn try_push(&self, element: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(PushError::Closed(element));
        }
        if inner.next(inner.push_index) == inner.pop_index {
            return Err(PushError::Full(element));
        }
        self.push_at(&mut inner, element);
        Ok(())
    }

    /// Pop the front element, blocking while the queue is empty.
    ///
    /// Fails with [`PopError::Closed`] once the queue is closed and drained.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.is_empty() {
                break;
            }
            if inner.closed {
                return Err(PopError::Closed);
            }
            inner.waiting_empty += 1;
            inner = self.not_empty.wait(inner).unwrap();
        }
        Ok(self.pop_front(&mut inner))
    }

    /// Pop the front element without blocking.
    pub fn try_pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_empty() {
            if inner.closed {
                return Err(PopError::Closed);
            }
            return Err(PopError::Empty);
        }
        Ok(self.pop_front(&mut inner))
    }

    fn push_at(&self, inner: &mut Inner<T>, element: T) {
        let index = inner.push_index;
        inner.slots[index] = Some(element);
        inner.push_index = inner.next(index);
        if inner.waiting_empty > 0 {
            inner.waiting_empty -= 1;
            self.not_empty.notify_one();
        }
    }

    fn pop_front(&self, inner: &mut Inner<T>) -> T {
        let index = inner.pop_index;
        let element = inner.slots[index].take().unwrap();
        inner.pop_index = inner.next(index);
        if inner.waiting_full > 0 {
            inner.waiting_full -= 1;
            self.not_full.notify_one();
        }
        element
    }
}

static_assertions::assert_impl_all!(BufferQueue<i32>: Send, Sync);

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_fifo_single_producer_consumer() {
        let queue = Arc::new(BufferQueue::new(4));

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 1..=1000 {
                    queue.push(i).unwrap();
                }
                queue.close();
            })
        };

        let mut popped = Vec::new();
        loop {
            match queue.pop() {
                Ok(v) => popped.push(v),
                Err(PopError::Closed) => break,
                Err(e) => panic!("unexpected pop result: {e:?}"),
            }
        }

        producer.join().unwrap();
        assert_eq!(popped, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_try_surfaces() {
        let queue = BufferQueue::new(2);
        assert_eq!(queue.try_pop(), Err(PopError::Empty));
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_push(3), Err(PushError::Full(3)));
        assert_eq!(queue.try_pop(), Ok(1));
        queue.close();
        assert_eq!(queue.try_push(4), Err(PushError::Closed(4)));
        // remaining elements drain after close
        assert_eq!(queue.try_pop(), Ok(2));
        assert_eq!(queue.try_pop(), Err(PopError::Closed));
    }

    #[test]
    fn test_with_items() {
        let queue = BufferQueue::with_items(3, [1, 2]);
        assert_eq!(queue.try_pop(), Ok(1));
        assert_eq!(queue.try_pop(), Ok(2));
        assert_eq!(queue.try_pop(), Err(PopError::Empty));
        queue.try_push(3).unwrap();
        assert_eq!(queue.try_pop(), Ok(3));
    }

    #[test]
    #[should_panic]
    fn test_with_items_overflow() {
        let _ = BufferQueue::with_items(2, [1, 2, 3]);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue: Arc<BufferQueue<i32>> = Arc::new(BufferQueue::new(1));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), Err(PopError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(BufferQueue::new(1));
        queue.push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(2))
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(producer.join().unwrap(), Err(PushError::Closed(2)));
    }

    #[test]
    fn test_conservation_many_producers_consumers() {
        let queue = Arc::new(BufferQueue::new(4));
        let num_producers = 4;
        let num_consumers = 4;
        let per_producer = 250;

        let producers: Vec<_> = (0..num_producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        queue.push(p * per_producer + i).unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..num_consumers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        match queue.pop() {
                            Ok(v) => got.push(v),
                            Err(PopError::Closed) => break got,
                            Err(e) => panic!("unexpected pop result: {e:?}"),
                        }
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        queue.close();

        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<i32> = (0..num_producers * per_producer).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_conservation_with_random_interleavings() {
        // same conservation property, but through a two-slot queue with
        // randomized delays on both sides to vary which thread wins each
        // slot
        let queue = Arc::new(BufferQueue::new(2));
        let num_producers = 3;
        let num_consumers = 3;
        let per_producer = 30;

        let producers: Vec<_> = (0..num_producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut rng = rand::rngs::StdRng::seed_from_u64(p as u64);
                    for i in 0..per_producer {
                        std::thread::sleep(Duration::from_millis(rng.gen_range(0..2)));
                        queue.push(p * per_producer + i).unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..num_consumers)
            .map(|seed| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut rng = rand::rngs::StdRng::seed_from_u64(100 + seed as u64);
                    let mut got = Vec::new();
                    loop {
                        std::thread::sleep(Duration::from_millis(rng.gen_range(0..2)));
                        match queue.pop() {
                            Ok(v) => got.push(v),
                            Err(PopError::Closed) => break got,
                            Err(e) => panic!("unexpected pop result: {e:?}"),
                        }
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        queue.close();

        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<i32> = (0..num_producers * per_producer).collect();
        assert_eq!(all, expected);
    }
}
