use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::{PopError, PushError};

/// The lifecycle of one ring slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
enum SlotState {
    /// The slot holds no element; a producer may reserve it.
    Waiting,
    /// The slot holds an element ready to pop.
    Valid,
    /// The slot was reserved but its element will never materialize; the
    /// next pop at this position skips and recycles it.
    Invalid,
}

impl From<u8> for SlotState {
    fn from(value: u8) -> Self {
        const WAITING: u8 = SlotState::Waiting as u8;
        const VALID: u8 = SlotState::Valid as u8;
        const INVALID: u8 = SlotState::Invalid as u8;
        match value {
            WAITING => SlotState::Waiting,
            VALID => SlotState::Valid,
            INVALID => SlotState::Invalid,
            _ => panic!("bad slot state {value}"),
        }
    }
}

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Waiting as u8),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn state(&self, order: Ordering) -> SlotState {
        SlotState::from(self.state.load(order))
    }

    /// Flip the slot state, asserting the expected prior state.
    fn transition(&self, from: SlotState, to: SlotState, order: Ordering) {
        let result = self
            .state
            .compare_exchange(from as u8, to as u8, order, Ordering::Relaxed);
        debug_assert!(result.is_ok(), "slot state changed underneath its owner");
    }
}

/// A lock-free bounded ring buffer.
///
/// `head` (next position to pop) and `tail` (next position to reserve for a
/// push) increase monotonically and are reduced modulo the capacity only
/// when indexing, so full/empty are distinguished without a spare slot. A
/// push first reserves a position by compare-exchanging `tail`, then writes
/// the element, then marks the slot [`SlotState::Valid`]; the counter
/// reservation keeps concurrent producers from contending on the value
/// write. Pops mirror this on `head`.
///
/// The non-blocking operations report `Busy` whenever another operation
/// holds the slot mid-transfer; [`try_push`](Self::try_push) and
/// [`try_pop`](Self::try_pop) spin those out. There are no blocking
/// operations on this queue.
pub struct LockFreeQueue<T> {
    capacity: usize,
    head: AtomicU64,
    tail: AtomicU64,
    closed: AtomicBool,
    slots: Box<[Slot<T>]>,
}

// SAFETY: elements move across threads through the slots, but the slot state
// machine guarantees a single owner for any slot mid-transfer.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> std::fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("capacity", &self.capacity)
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> LockFreeQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least one");
        let slots = (0..capacity).map(|_| Slot::new()).collect();
        Self {
            capacity,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            slots,
        }
    }

    /// Create a queue pre-filled from `items`.
    ///
    /// Panics if `capacity` is zero or `items` yields more than `capacity`
    /// elements.
    pub fn with_items(capacity: usize, items: impl IntoIterator<Item = T>) -> Self {
        let queue = Self::new(capacity);
        for item in items {
            assert!(!queue.is_full(), "too few slots for the initial items");
            queue
                .try_push(item)
                .unwrap_or_else(|_| unreachable!("unshared queue refused a push"));
        }
        queue
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True iff no element is present. May transiently report non-empty
    /// while pushes are still mid-flight.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Relaxed)
    }

    /// True iff every position is reserved.
    pub fn is_full(&self) -> bool {
        self.tail.load(Ordering::Relaxed)
            == self.head.load(Ordering::Relaxed) + self.capacity as u64
    }

    /// Close the queue. One-way and idempotent: later pushes fail with
    /// [`PushError::Closed`], pops drain the remaining elements and then
    /// fail with [`PopError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Push, retrying internally while the queue reports `Busy`.
    pub fn try_push(&self, element: T) -> Result<(), PushError<T>> {
        let mut element = element;
        loop {
            match self.nonblocking_push(element) {
                Err(PushError::Busy(e)) => {
                    element = e;
                    std::hint::spin_loop();
                }
                other => return other,
            }
        }
    }

    /// Pop, retrying internally while the queue reports `Busy`.
    pub fn try_pop(&self) -> Result<T, PopError> {
        loop {
            match self.nonblocking_pop() {
                Err(PopError::Busy) => std::hint::spin_loop(),
                other => return other,
            }
        }
    }

    /// Attempt one push without retrying.
    ///
    /// `Busy` means a concurrent operation held the target slot: a pop has
    /// reserved the position but not yet cleared it, a failed transfer is
    /// awaiting recovery, or the reservation race was lost outright.
    pub fn nonblocking_push(&self, element: T) -> Result<(), PushError<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::Closed(element));
        }

        // A stale head makes the queue look full when it no longer is; the
        // caller simply retries. A stale tail is corrected by the
        // compare-exchange below.
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Relaxed) + self.capacity as u64 {
            return Err(PushError::Full(element));
        }

        let slot = &self.slots[(tail % self.capacity as u64) as usize];
        match slot.state(Ordering::Acquire) {
            // a pop from this position is still pending, or a failed
            // transfer has not been recycled yet
            SlotState::Valid | SlotState::Invalid => Err(PushError::Busy(element)),
            SlotState::Waiting => {
                if self
                    .tail
                    .compare_exchange(tail, tail + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
                {
                    return Err(PushError::Busy(element));
                }
                // The reservation succeeded: this thread is the sole owner
                // of the slot until it is marked Valid.
                //
                // SAFETY: the tail compare-exchange claimed this position;
                // no other producer writes it and no consumer reads it
                // until the Release store of Valid below.
                unsafe {
                    (*slot.value.get()).write(element);
                }
                slot.transition(SlotState::Waiting, SlotState::Valid, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Attempt one pop without retrying.
    pub fn nonblocking_pop(&self) -> Result<T, PopError> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Relaxed) {
            if self.closed.load(Ordering::Acquire) {
                // a push may have landed between the tail load and the
                // closed check; re-read before reporting the terminal state
                if self.tail.load(Ordering::Acquire) == head {
                    return Err(PopError::Closed);
                }
                return Err(PopError::Busy);
            }
            return Err(PopError::Empty);
        }

        let slot = &self.slots[(head % self.capacity as u64) as usize];
        match slot.state(Ordering::Acquire) {
            SlotState::Valid => {
                if self
                    .head
                    .compare_exchange(head, head + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
                {
                    return Err(PopError::Busy);
                }
                // SAFETY: the head compare-exchange claimed this position
                // and the Acquire load above observed the producer's
                // Release store of Valid, so the element is fully written
                // and this thread is its sole owner.
                let element = unsafe { (*slot.value.get()).assume_init_read() };
                slot.transition(SlotState::Valid, SlotState::Waiting, Ordering::Release);
                Ok(element)
            }
            SlotState::Invalid => {
                // the element for this reservation never materialized: skip
                // the position and recycle the slot
                if self
                    .head
                    .compare_exchange(head, head + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.transition(SlotState::Invalid, SlotState::Waiting, Ordering::Release);
                }
                Err(PopError::Busy)
            }
            // a push reserved this position but has not finished writing
            SlotState::Waiting => Err(PopError::Busy),
        }
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for position in head..tail {
            let slot = &mut self.slots[(position % self.capacity as u64) as usize];
            if SlotState::from(*slot.state.get_mut()) == SlotState::Valid {
                // SAFETY: Valid slots hold an initialized element that no
                // one else can reach through an exclusive reference.
                unsafe {
                    slot.value.get_mut().assume_init_drop();
                }
            }
        }
    }
}

static_assertions::assert_impl_all!(LockFreeQueue<i32>: Send, Sync);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_fifo_single_thread() {
        let queue = LockFreeQueue::new(4);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_pop(), Ok(1));
        queue.try_push(3).unwrap();
        queue.try_push(4).unwrap();
        queue.try_push(5).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.try_push(6), Err(PushError::Full(6)));
        assert_eq!(queue.try_pop(), Ok(2));
        assert_eq!(queue.try_pop(), Ok(3));
        assert_eq!(queue.try_pop(), Ok(4));
        assert_eq!(queue.try_pop(), Ok(5));
        assert_eq!(queue.try_pop(), Err(PopError::Empty));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wraparound() {
        let queue = LockFreeQueue::new(2);
        for i in 0..100 {
            queue.try_push(i).unwrap();
            assert_eq!(queue.try_pop(), Ok(i));
        }
    }

    #[test]
    fn test_close() {
        let queue = LockFreeQueue::new(4);
        queue.try_push(1).unwrap();
        queue.close();
        assert_eq!(queue.try_push(2), Err(PushError::Closed(2)));
        assert_eq!(queue.try_pop(), Ok(1));
        assert_eq!(queue.try_pop(), Err(PopError::Closed));
    }

    #[test]
    fn test_with_items() {
        let queue = LockFreeQueue::with_items(3, [7, 8]);
        assert_eq!(queue.try_pop(), Ok(7));
        assert_eq!(queue.try_pop(), Ok(8));
        assert_eq!(queue.try_pop(), Err(PopError::Empty));
    }

    #[test]
    #[should_panic]
    fn test_with_items_overflow() {
        let _ = LockFreeQueue::with_items(1, [1, 2]);
    }

    #[test]
    fn test_drop_releases_elements() {
        let element = Arc::new(());
        {
            let queue = LockFreeQueue::new(4);
            queue.try_push(Arc::clone(&element)).unwrap();
            queue.try_push(Arc::clone(&element)).unwrap();
            assert_eq!(Arc::strong_count(&element), 3);
        }
        assert_eq!(Arc::strong_count(&element), 1);
    }

    #[test]
    fn test_two_producers_two_consumers() {
        let queue = Arc::new(LockFreeQueue::new(4));
        let count = 1000;

        let producer_a = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 1..=count {
                    loop {
                        match queue.try_push(i) {
                            Ok(()) => break,
                            Err(PushError::Full(_)) => std::thread::yield_now(),
                            Err(e) => panic!("unexpected push result: {e:?}"),
                        }
                    }
                }
            })
        };
        let producer_b = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 1..=count {
                    loop {
                        match queue.try_push(-i) {
                            Ok(()) => break,
                            Err(PushError::Full(_)) => std::thread::yield_now(),
                            Err(e) => panic!("unexpected push result: {e:?}"),
                        }
                    }
                }
            })
        };

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut got: Vec<i64> = Vec::new();
                    loop {
                        match queue.try_pop() {
                            Ok(v) => got.push(v),
                            Err(PopError::Empty) => std::thread::yield_now(),
                            Err(PopError::Closed) => break got,
                            Err(e) => panic!("unexpected pop result: {e:?}"),
                        }
                    }
                })
            })
            .collect();

        producer_a.join().unwrap();
        producer_b.join().unwrap();
        queue.close();

        let drained: Vec<Vec<i64>> = consumers
            .into_iter()
            .map(|c| c.join().unwrap())
            .collect();

        // each producer's elements arrive in its push order
        for got in &drained {
            let positives: Vec<i64> = got.iter().copied().filter(|v| *v > 0).collect();
            let negatives: Vec<i64> = got.iter().copied().filter(|v| *v < 0).collect();
            assert!(positives.windows(2).all(|w| w[0] < w[1]));
            assert!(negatives.windows(2).all(|w| w[0] > w[1]));
        }

        // nothing lost, nothing duplicated
        let mut all: Vec<i64> = drained.into_iter().flatten().collect();
        all.sort_unstable();
        let expected: Vec<i64> = (-count..=-1).chain(1..=count).collect();
        assert_eq!(all, expected);
    }
}
