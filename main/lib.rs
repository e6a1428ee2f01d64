//! Staged, parallel data pipelines over a shared worker pool.
//!
//! This crate composes the workspace's coordination primitives into two
//! execution engines:
//!
//! - [`pipeline`]: a fluent builder for linear chains of stages connected by
//!   bounded queues, run with one pooled worker per stage. Closing any queue
//!   propagates shutdown through the whole chain.
//! - [`mapreduce`]: a two-phase parallel driver running user mappers and
//!   reducers on pooled workers, with deterministic shard assignment.
//!
//! The building blocks re-exported here come from the leaf crates:
//! [`gates`] (latch and barrier), [`queues`] (bounded lock-based, bounded
//! lock-free, and unbounded queues) and [`workpool`] (reusable workers and
//! the thread pool).
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use conflux::pipeline;
//! use conflux::ThreadPool;
//!
//! let pool = Arc::new(ThreadPool::new());
//! let sink = Arc::new(Mutex::new(Vec::new()));
//! let sink_clone = Arc::clone(&sink);
//!
//! let plan = pipeline::produce(|out| {
//!     for word in ["a", "bb", "ccc"] {
//!         out.push(word.to_string()).unwrap();
//!     }
//! })
//! .then(|word: String| word.len())
//! .consume(move |len| sink_clone.lock().unwrap().push(len));
//!
//! pipeline::execute(plan, &pool).unwrap().wait();
//! assert_eq!(*sink.lock().unwrap(), vec![1, 2, 3]);
//! ```

pub mod mapreduce;
pub mod pipeline;

pub use gates::{Barrier, BarrierError, Latch, LatchError};
pub use queues::{BlockingQueue, BufferQueue, LockFreeQueue, PopError, PushError};
pub use workpool::{SerialExecutor, ThreadPool, Worker};
