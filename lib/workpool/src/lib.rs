//! Long-lived worker threads for staged pipelines.
//!
//! A [`Worker`] is a thread that parks while idle and can repeatedly be
//! handed new work, with room for one running and one queued task. The
//! [`ThreadPool`] is a factory and custodian for workers: callers lease an
//! idle worker, run long-lived loops on it, and either donate it back for
//! reuse or release it and take over ownership. [`SerialExecutor`] runs
//! submitted tasks one at a time, in order, on a single dedicated thread.

pub mod pool;
pub mod serial;
pub mod worker;

pub use pool::ThreadPool;
pub use serial::SerialExecutor;
pub use worker::Worker;

/// The unit of work handed to a worker thread.
pub type Task = Box<dyn FnOnce() + Send>;
