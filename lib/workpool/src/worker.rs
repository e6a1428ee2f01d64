use std::sync::{Arc, Condvar, Mutex};

use crate::Task;

/// Lifecycle of a [`Worker`]. Transitions are linear except the
/// `Running → Idle` loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Parked, ready for work.
    Idle,
    /// Executing a task.
    Running,
    /// `join` was requested; the worker finishes its current and queued
    /// task, then stops.
    Joining,
    /// The worker thread has stopped and accepts no more work.
    Done,
    /// The worker thread has stopped and been reaped.
    Joined,
}

struct WorkerState {
    phase: Phase,
    /// The task the thread will pick up (or is running) now.
    current: Option<Task>,
    /// At most one task may queue behind the current one.
    queued: Option<Task>,
}

struct Inner {
    state: Mutex<WorkerState>,
    /// Signalled on every state change: new work, a freed slot, joining.
    paused: Condvar,
}

/// A thread that parks while idle and can repeatedly be handed new
/// zero-argument functions to run.
///
/// The worker holds at most one *current* and one *queued* task.
/// [`try_execute`](Self::try_execute) succeeds iff a slot is free;
/// [`execute`](Self::execute) blocks until one frees or the worker starts
/// joining. [`join`](Self::join) lets the worker finish its current and
/// queued task before stopping it.
pub struct Worker {
    inner: Arc<Inner>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Worker")
            .field("phase", &state.phase)
            .field("has_current", &state.current.is_some())
            .field("has_queued", &state.queued.is_some())
            .finish()
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    /// Spawn a new worker thread, parked until it receives work.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(WorkerState {
                phase: Phase::Idle,
                current: None,
                queued: None,
            }),
            paused: Condvar::new(),
        });

        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("workpool-worker".to_string())
            .spawn(move || work_loop(&inner_clone))
            .unwrap();

        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Hand the worker a task without blocking. Returns false if both task
    /// slots are occupied or the worker is joining or done.
    pub fn try_execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if !Self::accepts(&state) {
            return false;
        }
        if state.current.is_none() {
            state.current = Some(Box::new(task));
        } else if state.queued.is_none() {
            state.queued = Some(Box::new(task));
        } else {
            return false;
        }
        self.inner.paused.notify_all();
        true
    }

    /// Hand the worker a task, blocking until a slot frees. Returns false if
    /// the worker starts joining (or is done) before a slot opens.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let state = self.inner.state.lock().unwrap();
        let mut state = self
            .inner
            .paused
            .wait_while(state, |s| {
                Self::accepts(s) && s.current.is_some() && s.queued.is_some()
            })
            .unwrap();
        if !Self::accepts(&state) {
            return false;
        }
        if state.current.is_none() {
            state.current = Some(Box::new(task));
        } else {
            state.queued = Some(Box::new(task));
        }
        self.inner.paused.notify_all();
        true
    }

    /// Stop the worker once its current and queued tasks have finished, and
    /// reap the thread. Safe to call more than once.
    ///
    /// Panics if the worker thread itself panicked.
    pub fn join(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != Phase::Done && state.phase != Phase::Joined {
                state.phase = Phase::Joining;
            }
            self.inner.paused.notify_all();
        }

        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.join().expect("worker thread panicked");
            self.inner.state.lock().unwrap().phase = Phase::Joined;
        }
    }

    /// Join has been requested but the thread is still winding down.
    pub fn is_joining(&self) -> bool {
        self.inner.state.lock().unwrap().phase == Phase::Joining
    }

    /// The thread has stopped and will not accept any more work.
    pub fn is_done(&self) -> bool {
        matches!(
            self.inner.state.lock().unwrap().phase,
            Phase::Done | Phase::Joined
        )
    }

    fn accepts(state: &WorkerState) -> bool {
        !matches!(state.phase, Phase::Joining | Phase::Done | Phase::Joined)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != Phase::Done && state.phase != Phase::Joined {
                state.phase = Phase::Joining;
            }
            self.inner.paused.notify_all();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            // a task panic already unwound through the thread; nothing to
            // add to it here
            let _ = handle.join();
        }
    }
}

fn work_loop(inner: &Inner) {
    loop {
        let task = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(task) = state.current.take() {
                    if state.phase == Phase::Idle {
                        state.phase = Phase::Running;
                    }
                    break Some(task);
                }
                if state.phase == Phase::Joining {
                    break None;
                }
                state = inner.paused.wait(state).unwrap();
            }
        };

        match task {
            Some(task) => {
                task();
                let mut state = inner.state.lock().unwrap();
                state.current = state.queued.take();
                if state.current.is_none() && state.phase == Phase::Running {
                    state.phase = Phase::Idle;
                }
                // a slot freed: wake blocked `execute` callers
                inner.paused.notify_all();
            }
            None => {
                let mut state = inner.state.lock().unwrap();
                state.phase = Phase::Done;
                inner.paused.notify_all();
                break;
            }
        }
    }
}

static_assertions::assert_impl_all!(Worker: Send, Sync);

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_runs_tasks() {
        let worker = Worker::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(worker.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        worker.join();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(worker.is_done());
    }

    #[test]
    fn test_one_deep_queueing() {
        let worker = Worker::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        // occupy the current slot with a task that blocks until released
        assert!(worker.try_execute(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }));
        started_rx.recv().unwrap();

        // one more fits in the queued slot, a third does not
        assert!(worker.try_execute(|| {}));
        assert!(!worker.try_execute(|| {}));

        release_tx.send(()).unwrap();
        worker.join();
    }

    #[test]
    fn test_join_finishes_queued_work() {
        let worker = Worker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        {
            let counter = Arc::clone(&counter);
            assert!(worker.try_execute(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        started_rx.recv().unwrap();
        {
            let counter = Arc::clone(&counter);
            assert!(worker.try_execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // request the join while both slots are full, then release
        release_tx.send(()).unwrap();
        worker.join();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rejects_work_after_join() {
        let worker = Worker::new();
        worker.join();
        assert!(!worker.try_execute(|| {}));
        assert!(!worker.execute(|| {}));
    }

    #[test]
    fn test_execute_blocks_until_slot_frees() {
        let worker = Arc::new(Worker::new());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        assert!(worker.try_execute(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }));
        started_rx.recv().unwrap();
        assert!(worker.try_execute(|| {}));

        let blocked = {
            let worker = Arc::clone(&worker);
            std::thread::spawn(move || worker.execute(|| {}))
        };

        // the third task cannot be placed until the first one finishes
        std::thread::sleep(Duration::from_millis(20));
        assert!(!blocked.is_finished());

        release_tx.send(()).unwrap();
        assert!(blocked.join().unwrap());
        worker.join();
    }
}
