//! Counting coordinators for staged parallel execution.
//!
//! This crate provides the two gate primitives the rest of the workspace is
//! built on:
//!
//! - [`Latch`]: a single-use count-down gate. Threads block in
//!   [`Latch::wait`] until the count reaches zero; every call to
//!   [`Latch::count_down`] happens-before any return from `wait`.
//! - [`Barrier`]: a reusable arrive-point for a fixed set of threads. The
//!   participant population may shrink ([`Barrier::arrive_and_drop`]), and a
//!   completion hook run by the last arriver of each phase may replace the
//!   participant count for the next phase.
//!
//! Both are built on a standard mutex + condition variable and are shared
//! between threads behind an [`Arc`](std::sync::Arc).

pub mod barrier;
pub mod latch;

pub use barrier::{Barrier, BarrierError};
pub use latch::{Latch, LatchError};
