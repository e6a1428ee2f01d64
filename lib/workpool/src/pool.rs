use std::sync::{Arc, Mutex};

use crate::Worker;

/// A factory and custodian for [`Worker`] threads.
///
/// Callers lease workers with [`try_get_unused`](Self::try_get_unused); the
/// pool tracks them as *active* until they are handed back with
/// [`donate`](Self::donate) (making them leasable again) or removed with
/// [`release`](Self::release) (transferring ownership to the caller).
/// Dropping the pool joins every worker it still owns, idle or active, and
/// refuses new hand-outs while doing so.
pub struct ThreadPool {
    state: Mutex<PoolState>,
    max_threads: usize,
}

struct PoolState {
    shutting_down: bool,
    /// Leased out, still owned by the pool.
    active: Vec<Arc<Worker>>,
    /// Idle, ready to lease.
    unused: Vec<Arc<Worker>>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ThreadPool")
            .field("active", &state.active.len())
            .field("unused", &state.unused.len())
            .field("max_threads", &self.max_threads)
            .finish()
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    /// Create a pool with no cap on the number of workers.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                shutting_down: false,
                active: Vec::new(),
                unused: Vec::new(),
            }),
            max_threads: usize::MAX,
        }
    }

    /// Create a pool that pre-spawns `min_threads` idle workers and never
    /// has more than `max_threads` leased out at once.
    pub fn bounded(min_threads: usize, max_threads: usize) -> Self {
        let unused = (0..min_threads).map(|_| Arc::new(Worker::new())).collect();
        Self {
            state: Mutex::new(PoolState {
                shutting_down: false,
                active: Vec::new(),
                unused,
            }),
            max_threads,
        }
    }

    /// Lease an idle worker, spawning a new one if none is idle and the
    /// active count is below the cap. Returns `None` at the cap or while
    /// the pool is shutting down. The worker stays owned by the pool until
    /// donated back or released.
    pub fn try_get_unused(&self) -> Option<Arc<Worker>> {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return None;
        }
        let worker = match state.unused.pop() {
            Some(worker) => worker,
            None => {
                if state.active.len() >= self.max_threads {
                    return None;
                }
                Arc::new(Worker::new())
            }
        };
        state.active.push(Arc::clone(&worker));
        Some(worker)
    }

    /// Hand a worker back for reuse. An active worker moves to the idle
    /// set; a foreign worker is adopted. Returns false if the worker is
    /// already idle in this pool or the pool is shutting down.
    pub fn donate(&self, worker: &Arc<Worker>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return false;
        }
        if let Some(index) = state
            .active
            .iter()
            .position(|w| Arc::ptr_eq(w, worker))
        {
            state.active.remove(index);
            state.unused.push(Arc::clone(worker));
            true
        } else if !state.unused.iter().any(|w| Arc::ptr_eq(w, worker)) {
            state.unused.push(Arc::clone(worker));
            true
        } else {
            false
        }
    }

    /// Stop tracking an active worker; the caller takes ownership and the
    /// worker is joined when its last handle drops. Returns false if the
    /// worker is not active in this pool.
    pub fn release(&self, worker: &Arc<Worker>) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state
            .active
            .iter()
            .position(|w| Arc::ptr_eq(w, worker))
        {
            state.active.remove(index);
            true
        } else {
            false
        }
    }

    /// The number of workers currently leased out.
    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// The number of idle workers ready to lease.
    pub fn unused_count(&self) -> usize {
        self.state.lock().unwrap().unused.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let (active, unused) = {
            let mut state = self.state.lock().unwrap();
            state.shutting_down = true;
            (
                std::mem::take(&mut state.active),
                std::mem::take(&mut state.unused),
            )
        };

        for worker in active.into_iter().chain(unused) {
            worker.join();
        }
    }
}

static_assertions::assert_impl_all!(ThreadPool: Send, Sync);
