use std::fmt::Display;
use std::sync::{Condvar, Mutex};

/// Error returned by [`Latch::count_down`] and [`Latch::count_down_and_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchError {
    /// The decrement would drive the count below zero. The latch is left
    /// unchanged.
    Underflow,
}

impl Display for LatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatchError::Underflow => write!(f, "latch count would go below zero"),
        }
    }
}

impl std::error::Error for LatchError {}

/// A single-use count-down gate.
///
/// A latch is created with an initial count. Threads calling [`wait()`](Self::wait)
/// block until the count reaches zero; [`count_down()`](Self::count_down)
/// decrements it. The transition to zero is one-way: once the latch is ready
/// it stays ready.
///
/// All calls to `count_down` happen-before any return from `wait` on the same
/// latch.
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

struct LatchState {
    count: usize,
    /// Invoked exactly once when the count reaches zero, before any waiter is
    /// released.
    completion: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Latch")
            .field("count", &state.count)
            .field("has_completion", &state.completion.is_some())
            .finish()
    }
}

impl Latch {
    /// Create a new latch with the given count. A latch created with a count
    /// of zero is immediately ready.
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                count,
                completion: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Create a new latch that invokes `completion` exactly once when the
    /// count reaches zero, before any waiter is released. The hook runs on
    /// whichever thread performs the final decrement, with the latch lock
    /// held, so it must not call back into this latch.
    pub fn with_completion(count: usize, completion: impl FnOnce() + Send + 'static) -> Self {
        assert!(count > 0, "completion hook on an already-ready latch");
        Self {
            state: Mutex::new(LatchState {
                count,
                completion: Some(Box::new(completion)),
            }),
            cond: Condvar::new(),
        }
    }

    /// Decrement the count by `n`. If the count reaches zero, the completion
    /// hook (if any) is invoked and all waiters are released.
    ///
    /// Returns [`LatchError::Underflow`], leaving the latch unchanged, if
    /// fewer than `n` counts remain.
    pub fn count_down(&self, n: usize) -> Result<(), LatchError> {
        let mut state = self.state.lock().unwrap();
        self.count_down_locked(&mut state, n)
    }

    /// Decrement the count by one, then wait for it to reach zero.
    ///
    /// Provides the rendezvous contract: all calls to `count_down` on this
    /// latch happen-before any return from this method.
    pub fn count_down_and_wait(&self) -> Result<(), LatchError> {
        let mut state = self.state.lock().unwrap();
        self.count_down_locked(&mut state, 1)?;
        let _state = self.cond.wait_while(state, |s| s.count > 0).unwrap();
        Ok(())
    }

    /// Block until the count reaches zero. Returns immediately if the latch
    /// is already ready. Any number of threads may wait.
    pub fn wait(&self) {
        let state = self.state.lock().unwrap();
        let _state = self.cond.wait_while(state, |s| s.count > 0).unwrap();
    }

    /// Returns true iff the count has reached zero, without blocking.
    pub fn try_wait(&self) -> bool {
        self.state.lock().unwrap().count == 0
    }

    fn count_down_locked(&self, state: &mut LatchState, n: usize) -> Result<(), LatchError> {
        if n > state.count {
            return Err(LatchError::Underflow);
        }
        state.count -= n;
        if state.count == 0 {
            if let Some(completion) = state.completion.take() {
                completion();
            }
            self.cond.notify_all();
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(Latch: Send, Sync);
