//! # Parallel Map over Independent Units
//!
//! The one concurrency primitive of the crate. Units (feature specs, evaluation
//! buckets) are pure functions of shared read-only inputs, so they are mapped on a
//! bounded rayon pool and collected in input order. The first error aborts the map.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Maps `f` over `units` on the current rayon pool, preserving input order.
pub fn par_map<T, R, E, F>(units: &[T], f: F) -> Result<Vec<R>, E>
where
    T: Sync,
    R: Send,
    E: Send,
    F: Fn(&T) -> Result<R, E> + Sync + Send,
{
    units.par_iter().map(f).collect()
}

/// A bounded worker pool, sized to the available cores unless told otherwise.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(n_workers: Option<usize>) -> Result<Self, rayon::ThreadPoolBuildError> {
        let threads = n_workers.unwrap_or_else(num_cpus::get).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("timeflat-worker-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn map<T, R, E, F>(&self, units: &[T], f: F) -> Result<Vec<R>, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> Result<R, E> + Sync + Send,
    {
        self.pool.install(|| par_map(units, f))
    }
}
