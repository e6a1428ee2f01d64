//! A two-phase parallel map/reduce driver on top of the workspace's queues,
//! latches, and thread pool.
//!
//! A [`Job`] runs user [`Mapper`]s and [`Reducer`]s on workers leased from a
//! [`ThreadPool`]. Inputs are drained from a shared queue by the mapper
//! workers, each of which accumulates a private key → values map. The driver
//! then merges those maps, partitions the keys into shards with a pure,
//! deterministic shard function, and hands the shards to reducer workers
//! through a second queue. Reducer output goes to a caller-supplied
//! thread-safe [`OutputSink`].
//!
//! A panic in user map or reduce code stops only the worker it happened on:
//! the phase still completes, surviving workers drain the remaining work,
//! and the job finishes with partial results (the failure is logged).

mod helpers;

pub use helpers::{default_shard, MapSink, OutputSink};

use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use gates::Latch;
use queues::BufferQueue;
use workpool::{ThreadPool, Worker};

/// User map logic. One mapper instance is created per mapper worker; for
/// each input element the driver calls [`start`](Self::start),
/// [`map`](Self::map), then [`flush`](Self::flush).
pub trait Mapper {
    type Input;
    type Key;
    type Value;

    /// Called before each input element is mapped.
    fn start(&mut self) {}

    /// Map one input element, calling `emit` for every (key, value) pair it
    /// produces.
    fn map(&mut self, input: Self::Input, emit: &mut dyn FnMut(Self::Key, Self::Value));

    /// Called after each input element has been mapped.
    fn flush(&mut self) {}
}

/// User reduce logic. One reducer instance is created per reducer worker;
/// [`start`](Self::start) and [`flush`](Self::flush) bracket each shard.
pub trait Reducer {
    type Key;
    type Value;
    type Output;

    /// Called when the reducer picks up a shard.
    fn start(&mut self, _shard_id: usize) {}

    /// Reduce the full value list of one key, calling `emit` for every
    /// (key, output) pair it produces.
    fn reduce(
        &mut self,
        key: &Self::Key,
        values: &[Self::Value],
        emit: &mut dyn FnMut(Self::Key, Self::Output),
    );

    /// Called when the reducer finishes a shard.
    fn flush(&mut self) {}
}

/// Error returned by [`Job::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// The pool had no worker to lease for a phase, so the job could not
    /// make progress at all.
    NoIdleWorker,
}

impl Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::NoIdleWorker => write!(f, "the pool could not supply any worker"),
        }
    }
}

impl std::error::Error for JobError {}

/// Parallelism knobs for a [`Job`]. `num_reduce_shards` controls how finely
/// the key space is chunked into reducer work units and is usually at least
/// `num_reducers`.
#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub num_mappers: usize,
    pub num_reducers: usize,
    pub num_reduce_shards: usize,
}

/// One reducer work unit: the keys of one shard plus a shared read-only
/// view of the merged map output.
struct ShardTask<K, V> {
    shard_id: usize,
    keys: Vec<K>,
    data: Arc<BTreeMap<K, Vec<V>>>,
}

type ShardFn<K> = Arc<dyn Fn(&K, usize) -> usize + Send + Sync>;

/// A configured map/reduce job. The factories build one mapper per mapper
/// worker and one reducer per reducer worker.
pub struct Job<M: Mapper, R: Reducer> {
    opts: JobOptions,
    mapper_factory: Arc<dyn Fn() -> M + Send + Sync>,
    reducer_factory: Arc<dyn Fn() -> R + Send + Sync>,
    shard_fn: ShardFn<M::Key>,
}

impl<M, R> Job<M, R>
where
    M: Mapper + 'static,
    M::Input: Send + 'static,
    M::Key: Ord + Clone + Send + Sync + 'static,
    M::Value: Send + Sync + 'static,
    R: Reducer<Key = M::Key, Value = M::Value> + 'static,
    R::Output: Send + 'static,
{
    /// Create a job with the default shard assignment (a hash of the key
    /// modulo the shard count).
    ///
    /// Panics if any of the option counts is zero.
    pub fn new(
        opts: JobOptions,
        mapper_factory: impl Fn() -> M + Send + Sync + 'static,
        reducer_factory: impl Fn() -> R + Send + Sync + 'static,
    ) -> Self
    where
        M::Key: Hash,
    {
        Self::with_shard_fn(opts, mapper_factory, reducer_factory, default_shard)
    }

    /// Create a job with a custom shard assignment. The function must be
    /// pure and deterministic so repeated runs shard identically.
    ///
    /// Panics if any of the option counts is zero.
    pub fn with_shard_fn(
        opts: JobOptions,
        mapper_factory: impl Fn() -> M + Send + Sync + 'static,
        reducer_factory: impl Fn() -> R + Send + Sync + 'static,
        shard_fn: impl Fn(&M::Key, usize) -> usize + Send + Sync + 'static,
    ) -> Self {
        assert!(opts.num_mappers >= 1, "a job needs at least one mapper");
        assert!(opts.num_reducers >= 1, "a job needs at least one reducer");
        assert!(
            opts.num_reduce_shards >= 1,
            "a job needs at least one reduce shard"
        );
        Self {
            opts,
            mapper_factory: Arc::new(mapper_factory),
            reducer_factory: Arc::new(reducer_factory),
            shard_fn: Arc::new(shard_fn),
        }
    }

    /// Run the job over `inputs`, writing reducer output to `output`.
    ///
    /// Blocks until both phases have completed and every leased worker has
    /// been handed back to the pool.
    pub fn run<O>(
        &self,
        pool: &ThreadPool,
        inputs: impl IntoIterator<Item = M::Input>,
        output: &Arc<O>,
    ) -> Result<(), JobError>
    where
        O: OutputSink<M::Key, R::Output> + 'static,
    {
        let merged = self.map_phase(pool, inputs)?;
        if merged.is_empty() {
            log::debug!("map phase produced no keys; skipping the reduce phase");
            return Ok(());
        }
        self.reduce_phase(pool, Arc::new(merged), output)
    }

    /// Map phase plus shuffle: every input element is offered to exactly
    /// one mapper, and the per-mapper outputs are merged into one ordered
    /// key → values map.
    fn map_phase(
        &self,
        pool: &ThreadPool,
        inputs: impl IntoIterator<Item = M::Input>,
    ) -> Result<BTreeMap<M::Key, Vec<M::Value>>, JobError> {
        let inputs: Vec<M::Input> = inputs.into_iter().collect();
        let input_queue = Arc::new(BufferQueue::with_items(inputs.len().max(1), inputs));
        input_queue.close();

        let workers = lease_workers(pool, self.opts.num_mappers, "mapper")?;
        let latch = Arc::new(Latch::new(workers.len()));

        let mapper_outputs: Vec<Arc<AtomicRefCell<BTreeMap<M::Key, Vec<M::Value>>>>> = workers
            .iter()
            .map(|_| Arc::new(AtomicRefCell::new(BTreeMap::new())))
            .collect();

        for (index, worker) in workers.iter().enumerate() {
            let input_queue = Arc::clone(&input_queue);
            let output = Arc::clone(&mapper_outputs[index]);
            let latch = Arc::clone(&latch);
            let factory = Arc::clone(&self.mapper_factory);

            log::debug!("starting mapper {index}");
            let accepted = worker.execute(move || {
                // count down even if the mapper panics
                let _guard = CountDownGuard(latch);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut mapper = factory();
                    while let Ok(input) = input_queue.pop() {
                        let mut output = output.borrow_mut();
                        mapper.start();
                        mapper.map(input, &mut |key, value| {
                            output.entry(key).or_default().push(value);
                        });
                        mapper.flush();
                    }
                }));
                if outcome.is_err() {
                    log::warn!("mapper {index} terminated by a panic in user code");
                }
            });
            assert!(accepted, "a freshly leased worker refused its mapper");
        }

        latch.wait();
        for worker in &workers {
            pool.donate(worker);
        }

        // shuffle: merge the per-mapper maps, preserving each mapper's
        // emission order within a key
        let mut merged: BTreeMap<M::Key, Vec<M::Value>> = BTreeMap::new();
        for output in mapper_outputs {
            let output = std::mem::take(&mut *output.borrow_mut());
            for (key, values) in output {
                merged.entry(key).or_default().extend(values);
            }
        }
        Ok(merged)
    }

    fn reduce_phase<O>(
        &self,
        pool: &ThreadPool,
        merged: Arc<BTreeMap<M::Key, Vec<M::Value>>>,
        output: &Arc<O>,
    ) -> Result<(), JobError>
    where
        O: OutputSink<M::Key, R::Output> + 'static,
    {
        // partition the key space into shard work units
        let mut shard_keys: BTreeMap<usize, Vec<M::Key>> = BTreeMap::new();
        for key in merged.keys() {
            let shard_id = (self.shard_fn)(key, self.opts.num_reduce_shards);
            assert!(
                shard_id < self.opts.num_reduce_shards,
                "shard function returned an out-of-range shard"
            );
            shard_keys.entry(shard_id).or_default().push(key.clone());
        }
        log::debug!(
            "reduce phase: {} keys in {} shards",
            merged.len(),
            shard_keys.len()
        );

        let task_queue = Arc::new(BufferQueue::new(shard_keys.len()));
        for (shard_id, keys) in shard_keys {
            let task = ShardTask {
                shard_id,
                keys,
                data: Arc::clone(&merged),
            };
            task_queue
                .try_push(task)
                .unwrap_or_else(|_| unreachable!("the task queue was sized for every shard"));
        }
        task_queue.close();

        let workers = lease_workers(pool, self.opts.num_reducers, "reducer")?;
        let latch = Arc::new(Latch::new(workers.len()));

        for (index, worker) in workers.iter().enumerate() {
            let task_queue = Arc::clone(&task_queue);
            let latch = Arc::clone(&latch);
            let factory = Arc::clone(&self.reducer_factory);
            let output = Arc::clone(output);

            log::debug!("starting reducer {index}");
            let accepted = worker.execute(move || {
                let _guard = CountDownGuard(latch);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut reducer = factory();
                    while let Ok(task) = task_queue.pop() {
                        reducer.start(task.shard_id);
                        for key in &task.keys {
                            let values = &task.data[key];
                            reducer.reduce(key, values, &mut |key, value| {
                                output.write(key, value);
                            });
                        }
                        reducer.flush();
                    }
                }));
                if outcome.is_err() {
                    log::warn!("reducer {index} terminated by a panic in user code");
                }
            });
            assert!(accepted, "a freshly leased worker refused its reducer");
        }

        latch.wait();
        for worker in &workers {
            pool.donate(worker);
        }
        Ok(())
    }
}

/// Lease up to `wanted` workers. Running a phase below its configured
/// parallelism is fine (and logged); running it with no workers at all is
/// an error.
fn lease_workers(
    pool: &ThreadPool,
    wanted: usize,
    role: &str,
) -> Result<Vec<Arc<Worker>>, JobError> {
    let mut workers = Vec::with_capacity(wanted);
    for _ in 0..wanted {
        match pool.try_get_unused() {
            Some(worker) => workers.push(worker),
            None => break,
        }
    }
    if workers.is_empty() {
        return Err(JobError::NoIdleWorker);
    }
    if workers.len() < wanted {
        log::debug!(
            "pool granted {} of {} requested {role} workers",
            workers.len(),
            wanted
        );
    }
    Ok(workers)
}

/// Counts a latch down when dropped, so a worker's phase accounting
/// survives a panic in user code.
struct CountDownGuard(Arc<Latch>);

impl Drop for CountDownGuard {
    fn drop(&mut self) {
        let _ = self.0.count_down(1);
    }
}
