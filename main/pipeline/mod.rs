//! A fluent builder for staged, queue-linked pipelines.
//!
//! A plan is a linear chain of stages. Each stage pops from the queue behind
//! it, applies user code, and pushes into the queue ahead of it; the queues
//! between stages are owned by the plan. Execution leases one pooled worker
//! per stage, so every filter in the chain runs on its own thread. A sink
//! reads the preceding stage's queue directly rather than adding a queue of
//! its own, but it is still a stage with its own leased worker.
//!
//! Build a plan starting from [`from`] (read an external queue) or
//! [`produce`] (run a generator), chain [`Segment::then`] /
//! [`Segment::expand`] transforms, and finish with [`Segment::consume`] or
//! [`Segment::to`]. Run it with [`execute`].
//!
//! Shutdown propagates through the queues: closing any queue makes the
//! stage reading it terminate, which closes that stage's own queues, and so
//! on through the chain in both directions.

mod execution;

pub use execution::{execute, ExecuteError, Execution};

use std::sync::Arc;

use queues::BufferQueue;

/// Capacity of the plan-owned queues between stages.
const STAGE_QUEUE_CAPACITY: usize = 10;

/// The shape of a stage, for the engine's dispatch and logging. A `from`
/// source carries no stage of its own; it fuses into the stage that reads
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageKind {
    /// Runs a generator once, filling its output queue.
    Produce,
    /// 1:1 element transform.
    Transform,
    /// 1:N element transform writing through a queue handle.
    Expand,
    /// Consumes elements; the end of a plan.
    Sink,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Produce => "produce",
            StageKind::Transform => "transform",
            StageKind::Expand => "expand",
            StageKind::Sink => "sink",
        };
        write!(f, "{name}")
    }
}

/// One leased-worker unit of pipeline work.
pub(crate) struct Stage {
    pub(crate) kind: StageKind,
    /// One tick of the stage loop; returning false terminates the stage.
    pub(crate) run: Box<dyn FnMut() -> bool + Send>,
    /// Closes the stage's upstream and downstream queues. Closing is
    /// idempotent, so this is safe on every exit path.
    pub(crate) shutdown: Box<dyn FnMut() + Send>,
}

/// A partially built plan whose last queue carries elements of type `T`.
pub struct Segment<T> {
    stages: Vec<Stage>,
    /// The queue the next stage will read.
    tail: Arc<BufferQueue<T>>,
}

/// An immutable blueprint for a pipeline. Created by finishing a
/// [`Segment`] with [`Segment::consume`] or [`Segment::to`]; run with
/// [`execute`], which consumes it.
pub struct Plan {
    stages: Vec<Stage>,
}

impl Plan {
    /// The number of workers an execution of this plan will lease.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub(crate) fn into_stages(self) -> Vec<Stage> {
        self.stages
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<StageKind> = self.stages.iter().map(|s| s.kind).collect();
        f.debug_struct("Plan").field("stages", &kinds).finish()
    }
}

/// Start a plan that reads elements from an external queue. The source
/// fuses into the stage that follows it; terminating that stage closes the
/// external queue, which is how cancellation reaches outside producers.
pub fn from<T: Send + 'static>(queue: Arc<BufferQueue<T>>) -> Segment<T> {
    Segment {
        stages: Vec::new(),
        tail: queue,
    }
}

/// Start a plan with a generator. The generator runs once, on its own
/// stage, pushing into a plan-owned queue that is closed when it returns.
pub fn produce<T, F>(generator: F) -> Segment<T>
where
    T: Send + 'static,
    F: FnOnce(&BufferQueue<T>) + Send + 'static,
{
    let queue = Arc::new(BufferQueue::new(STAGE_QUEUE_CAPACITY));

    let output = Arc::clone(&queue);
    let mut generator = Some(generator);
    let run = Box::new(move || {
        if let Some(generator) = generator.take() {
            generator(&output);
        }
        false
    });

    let downstream = Arc::clone(&queue);
    let shutdown = Box::new(move || downstream.close());

    Segment {
        stages: vec![Stage {
            kind: StageKind::Produce,
            run,
            shutdown,
        }],
        tail: queue,
    }
}

impl<T: Send + 'static> Segment<T> {
    /// Append a 1:1 transform running on its own stage.
    pub fn then<O, F>(mut self, mut transform: F) -> Segment<O>
    where
        O: Send + 'static,
        F: FnMut(T) -> O + Send + 'static,
    {
        let output = Arc::new(BufferQueue::new(STAGE_QUEUE_CAPACITY));

        let input = Arc::clone(&self.tail);
        let out = Arc::clone(&output);
        let run = Box::new(move || match input.pop() {
            Ok(element) => out.push(transform(element)).is_ok(),
            Err(_) => false,
        });

        self.stages.push(Stage {
            kind: StageKind::Transform,
            run,
            shutdown: close_both(&self.tail, &output),
        });
        Segment {
            stages: self.stages,
            tail: output,
        }
    }

    /// Append a 1:N transform. For each input element, `expand` may push
    /// any number of elements into the queue handle it is given.
    pub fn expand<O, F>(mut self, mut expand: F) -> Segment<O>
    where
        O: Send + 'static,
        F: FnMut(T, &BufferQueue<O>) + Send + 'static,
    {
        let output = Arc::new(BufferQueue::new(STAGE_QUEUE_CAPACITY));

        let input = Arc::clone(&self.tail);
        let out = Arc::clone(&output);
        let run = Box::new(move || match input.pop() {
            Ok(element) => {
                expand(element, &out);
                // a closed downstream means the consumer is gone
                !out.is_closed()
            }
            Err(_) => false,
        });

        self.stages.push(Stage {
            kind: StageKind::Expand,
            run,
            shutdown: close_both(&self.tail, &output),
        });
        Segment {
            stages: self.stages,
            tail: output,
        }
    }

    /// Finish the plan with a consuming sink.
    pub fn consume<F>(mut self, mut consume: F) -> Plan
    where
        F: FnMut(T) + Send + 'static,
    {
        let input = Arc::clone(&self.tail);
        let run = Box::new(move || match input.pop() {
            Ok(element) => {
                consume(element);
                true
            }
            Err(_) => false,
        });

        let upstream = self.tail;
        let shutdown = Box::new(move || upstream.close());

        self.stages.push(Stage {
            kind: StageKind::Sink,
            run,
            shutdown,
        });
        Plan {
            stages: self.stages,
        }
    }

    /// Finish the plan by forwarding into an external queue, which is
    /// closed when the plan drains.
    pub fn to(mut self, queue: Arc<BufferQueue<T>>) -> Plan {
        let input = Arc::clone(&self.tail);
        let out = Arc::clone(&queue);
        let run = Box::new(move || match input.pop() {
            Ok(element) => out.push(element).is_ok(),
            Err(_) => false,
        });

        self.stages.push(Stage {
            kind: StageKind::Sink,
            run,
            shutdown: close_both(&self.tail, &queue),
        });
        Plan {
            stages: self.stages,
        }
    }
}

static_assertions::assert_impl_all!(Plan: Send);

fn close_both<I: Send + 'static, O: Send + 'static>(
    upstream: &Arc<BufferQueue<I>>,
    downstream: &Arc<BufferQueue<O>>,
) -> Box<dyn FnMut() + Send> {
    let upstream = Arc::clone(upstream);
    let downstream = Arc::clone(downstream);
    Box::new(move || {
        upstream.close();
        downstream.close();
    })
}
