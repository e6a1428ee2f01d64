use std::fmt::Display;
use std::sync::{Condvar, Mutex};

/// Error returned by [`Barrier::arrive_and_drop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierError {
    /// The sole remaining participant may not leave; the barrier population
    /// must stay above zero. The barrier is left unchanged.
    LastParticipant,
}

impl Display for BarrierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarrierError::LastParticipant => {
                write!(f, "the last barrier participant may not drop out")
            }
        }
    }
}

impl std::error::Error for BarrierError {}

/// A reusable arrive-point for a fixed set of threads, with a shrinkable
/// population and a flexible completion hook.
///
/// Each *phase* completes when `thread_count` participants have arrived via
/// [`arrive_and_wait()`](Self::arrive_and_wait). The last arriver invokes the
/// completion hook (if any) before any participant is released; the hook's
/// return value becomes the participant count for the next phase. A
/// participant may also leave permanently with
/// [`arrive_and_drop()`](Self::arrive_and_drop).
///
/// Memory ordering: for any two participants X and Y of the same phase, X's
/// call to `arrive_and_wait` happens-before Y's return from it.
///
/// Phase isolation: a thread entering phase k+1 blocks until every
/// participant of phase k has fully left its `arrive_and_wait` call, so a
/// straggler from the previous phase can never observe the next phase's
/// state.
pub struct Barrier {
    state: Mutex<BarrierState>,
    /// Signalled when all threads from the previous phase have left.
    idle: Condvar,
    /// Signalled when the current phase completes.
    ready: Condvar,
}

struct BarrierState {
    /// Expected arrivals for the current phase.
    thread_count: usize,
    /// Participant count for the next phase, set by the completion hook.
    new_thread_count: usize,
    /// Arrivals so far in the current phase.
    num_waiting: usize,
    /// Released participants that have not yet left `arrive_and_wait`.
    num_to_leave: usize,
    /// Run by the last arriver of each phase. `None` keeps the current
    /// participant count for the next phase.
    completion: Option<Box<dyn FnMut() -> Option<usize> + Send>>,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Barrier")
            .field("thread_count", &state.thread_count)
            .field("num_waiting", &state.num_waiting)
            .field("num_to_leave", &state.num_to_leave)
            .finish()
    }
}

impl Barrier {
    /// Create a barrier for `num_threads` participants.
    ///
    /// Panics if `num_threads` is zero.
    pub fn new(num_threads: usize) -> Self {
        Self::build(num_threads, None)
    }

    /// Create a barrier for `num_threads` participants with a completion
    /// hook. The hook is invoked exactly once per phase, by the last arriver,
    /// before any participant is released. Its return value is the
    /// participant count for the next phase; `None` keeps the current count.
    ///
    /// The hook runs with the barrier lock held: it must not call back into
    /// this barrier, must not return `Some(0)`, and must not panic (a panic
    /// propagates on the completing thread and leaves the phase unreleased).
    ///
    /// Panics if `num_threads` is zero.
    pub fn with_completion(
        num_threads: usize,
        completion: impl FnMut() -> Option<usize> + Send + 'static,
    ) -> Self {
        Self::build(num_threads, Some(Box::new(completion)))
    }

    fn build(
        num_threads: usize,
        completion: Option<Box<dyn FnMut() -> Option<usize> + Send>>,
    ) -> Self {
        assert!(num_threads > 0, "barrier must have at least one participant");
        Self {
            state: Mutex::new(BarrierState {
                thread_count: num_threads,
                new_thread_count: num_threads,
                num_waiting: 0,
                num_to_leave: 0,
                completion,
            }),
            idle: Condvar::new(),
            ready: Condvar::new(),
        }
    }

    /// Arrive at the barrier and block until the current phase completes.
    pub fn arrive_and_wait(&self) {
        let state = self.state.lock().unwrap();

        // wait for the stragglers of the previous phase to leave
        let mut state = self.idle.wait_while(state, |s| s.num_to_leave > 0).unwrap();

        state.num_waiting += 1;
        if state.num_waiting == state.thread_count {
            // this thread completes the phase
            state.num_to_leave = state.thread_count;
            Self::complete_phase(&mut state);
            self.ready.notify_all();
        } else {
            state = self
                .ready
                .wait_while(state, |s| s.num_waiting != s.thread_count)
                .unwrap();
        }

        // the last thread to leave resets the barrier for the next phase
        if state.num_to_leave == 1 {
            state.thread_count = state.new_thread_count;
            state.num_waiting = 0;
            self.idle.notify_all();
        }
        state.num_to_leave -= 1;
    }

    /// Permanently remove the calling thread from the barrier's population.
    /// If the remaining waiters now fill the phase, the phase completes.
    ///
    /// Returns [`BarrierError::LastParticipant`] (leaving the barrier
    /// unchanged) if the drop would empty the barrier.
    pub fn arrive_and_drop(&self) -> Result<(), BarrierError> {
        let state = self.state.lock().unwrap();
        let mut state = self.idle.wait_while(state, |s| s.num_to_leave > 0).unwrap();

        if state.thread_count == 1 {
            return Err(BarrierError::LastParticipant);
        }
        state.thread_count -= 1;

        if state.num_waiting == state.thread_count {
            state.num_to_leave = state.thread_count;
            Self::complete_phase(&mut state);
            self.ready.notify_all();
        }
        Ok(())
    }

    /// Run the completion hook and record the next phase's participant count.
    fn complete_phase(state: &mut BarrierState) {
        let next = match state.completion.as_mut() {
            Some(hook) => hook(),
            None => None,
        };
        match next {
            Some(0) => panic!("barrier completion hook returned a zero participant count"),
            Some(n) => state.new_thread_count = n,
            None => state.new_thread_count = state.thread_count,
        }
    }
}

static_assertions::assert_impl_all!(Barrier: Send, Sync);
