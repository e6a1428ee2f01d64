use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gates::{Barrier, Latch};
use workpool::{ThreadPool, Worker};

use crate::pipeline::{Plan, Stage};

/// Error returned by [`execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteError {
    /// The pool could not supply one worker per stage. No stage was
    /// started; workers leased before the shortfall were handed back.
    NoIdleWorker,
}

impl Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteError::NoIdleWorker => {
                write!(f, "the pool could not supply a worker for every stage")
            }
        }
    }
}

impl std::error::Error for ExecuteError {}

/// A running pipeline.
///
/// Dropping the execution waits for it; see [`wait()`](Self::wait).
pub struct Execution {
    /// Opens once all stage workers have fully left the completion barrier.
    end: Arc<Latch>,
    /// Stage workers arrive here as they finish; the completion hook marks
    /// the execution done and shrinks the barrier so `wait` can arrive
    /// alone.
    thread_end: Arc<Barrier>,
    done: Arc<AtomicBool>,
    pool: Arc<ThreadPool>,
    /// Leased stage workers, handed back to the pool on `wait`.
    workers: Mutex<Vec<Arc<Worker>>>,
}

/// Run a plan on workers leased from `pool`, one per stage. The returned
/// handle observes completion; the stages are already running (or blocked
/// on their queues) when this returns.
pub fn execute(plan: Plan, pool: &Arc<ThreadPool>) -> Result<Execution, ExecuteError> {
    let stages = plan.into_stages();
    let num_stages = stages.len();
    log::debug!("executing pipeline with {num_stages} stages");

    // lease everything up front so a shortfall cannot start a partial
    // pipeline
    let mut workers = Vec::with_capacity(num_stages);
    for _ in 0..num_stages {
        match pool.try_get_unused() {
            Some(worker) => workers.push(worker),
            None => {
                for worker in &workers {
                    pool.donate(worker);
                }
                return Err(ExecuteError::NoIdleWorker);
            }
        }
    }

    let start = Arc::new(Latch::new(1));
    let end = Arc::new(Latch::new(1));
    let done = Arc::new(AtomicBool::new(false));

    let thread_end = {
        let done = Arc::clone(&done);
        let end = Arc::clone(&end);
        let mut fired = false;
        Arc::new(Barrier::with_completion(num_stages, move || {
            if fired {
                return None;
            }
            fired = true;
            done.store(true, Ordering::SeqCst);
            end.count_down(1).unwrap();
            // shrink to one participant so the waiter can arrive alone
            Some(1)
        }))
    };

    for (stage, worker) in stages.into_iter().zip(&workers) {
        let start = Arc::clone(&start);
        let thread_end = Arc::clone(&thread_end);
        let accepted = worker.execute(move || stage_main(stage, start, thread_end));
        assert!(accepted, "a freshly leased worker refused its stage");
    }

    start.count_down(1).unwrap();

    Ok(Execution {
        end,
        thread_end,
        done,
        pool: Arc::clone(pool),
        workers: Mutex::new(workers),
    })
}

impl Execution {
    /// True once every stage has finished and arrived at the completion
    /// barrier.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Block until the pipeline has completed and every stage worker has
    /// fully exited its loop, then hand the leased workers back to the
    /// pool. Safe to call repeatedly.
    pub fn wait(&self) {
        self.end.wait();
        self.thread_end.arrive_and_wait();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            self.pool.donate(&worker);
        }
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        self.wait();
    }
}

/// The body every stage worker runs: rendezvous on the start latch, tick
/// the stage until it reports done, close its queues, and meet the other
/// stages at the completion barrier.
fn stage_main(mut stage: Stage, start: Arc<Latch>, thread_end: Arc<Barrier>) {
    start.wait();
    log::trace!("{} stage starting", stage.kind);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        while (stage.run)() {}
    }));
    if outcome.is_err() {
        log::warn!(
            "{} stage terminated by a panic in user code; closing its queues",
            stage.kind
        );
    }

    // close both sides on every exit path; this is what propagates
    // shutdown through the rest of the chain
    (stage.shutdown)();
    log::trace!("{} stage finished", stage.kind);

    thread_end.arrive_and_wait();
}

static_assertions::assert_impl_all!(Execution: Send, Sync);
