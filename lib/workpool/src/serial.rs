use std::sync::Arc;

use queues::{BlockingQueue, PopError};

use crate::Task;

/// Runs submitted tasks one at a time, in submission order, on a single
/// dedicated thread.
///
/// Dropping the executor discards tasks that have not started, waits for the
/// in-flight task to finish, and joins the thread.
pub struct SerialExecutor {
    tasks: Arc<BlockingQueue<Task>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("pending", &self.tasks.len())
            .finish()
    }
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialExecutor {
    pub fn new() -> Self {
        let tasks: Arc<BlockingQueue<Task>> = Arc::new(BlockingQueue::new());
        let tasks_clone = Arc::clone(&tasks);
        let handle = std::thread::Builder::new()
            .name("serial-executor".to_string())
            .spawn(move || run(&tasks_clone))
            .unwrap();
        Self {
            tasks,
            handle: Some(handle),
        }
    }

    /// Enqueue a task. Tasks run in submission order. Returns false if the
    /// executor is already shutting down.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tasks.try_push(Box::new(task)).is_ok()
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        // drop any work that has not started, then stop the runner
        while self.tasks.try_pop().is_ok() {}
        self.tasks.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(tasks: &BlockingQueue<Task>) {
    loop {
        match tasks.pop() {
            Ok(task) => task(),
            Err(PopError::Closed) => break,
            Err(_) => unreachable!("blocking pop yields an element or Closed"),
        }
    }
}

static_assertions::assert_impl_all!(SerialExecutor: Send, Sync);

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_runs_in_order() {
        let executor = SerialExecutor::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        for i in 0..20 {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            assert!(executor.execute(move || {
                order.lock().unwrap().push(i);
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..20 {
            rx.recv().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_waits_for_in_flight_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let executor = SerialExecutor::new();
            let counter = Arc::clone(&counter);
            let (started_tx, started_rx) = mpsc::channel();
            assert!(executor.execute(move || {
                started_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(30));
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            started_rx.recv().unwrap();
        }
        // drop returned only after the running task completed
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_discards_unstarted_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let releaser;
        {
            let executor = SerialExecutor::new();
            let (started_tx, started_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel::<()>();
            assert!(executor.execute(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }));
            started_rx.recv().unwrap();

            // queued behind the blocked task; drained by the drop below
            // before the runner can reach them
            for _ in 0..5 {
                let counter = Arc::clone(&counter);
                assert!(executor.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }

            // unblock the in-flight task only after the drop has begun
            releaser = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                release_tx.send(()).unwrap();
            });
        }
        releaser.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
