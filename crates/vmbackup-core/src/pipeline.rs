//! Bounded worker pool for independent per-disk transfers.
//!
//! Disks under one snapshot share nothing but the engine session, so each
//! can run its whole open → download → finalize sequence on its own worker.
//! With a single worker the items run in order on the calling thread.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

/// Configuration for the transfer pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of workers (0 = one per CPU, 1 = sequential).
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::sequential()
    }
}

impl PipelineConfig {
    /// Create a configuration with the given worker count.
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    /// One item at a time, in input order.
    pub fn sequential() -> Self {
        Self { workers: 1 }
    }
}

/// Runs a fallible job over a list of items with bounded parallelism.
#[derive(Default)]
pub struct Pipeline {
    pool: Option<ThreadPool>,
}

impl Pipeline {
    /// Build a pipeline, spawning a dedicated thread pool unless sequential.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        if config.workers == 1 {
            return Ok(Self::default());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|index| format!("transfer-{}", index))
            .build()
            .map_err(|e| Error::configuration(format!("failed to start transfer workers: {}", e)))?;

        Ok(Self { pool: Some(pool) })
    }

    /// Number of workers items are spread over.
    pub fn workers(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(1, |pool| pool.current_num_threads())
    }

    /// Run `job(index, item)` for every item.
    ///
    /// Returns one result per item, in input order. A failing item does not
    /// stop the others; callers that want that use a cancellation token.
    pub fn process<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<Result<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> Result<R> + Send + Sync,
    {
        match &self.pool {
            None => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| job(index, item))
                .collect(),
            Some(pool) => pool.install(|| {
                items
                    .into_par_iter()
                    .enumerate()
                    .map(|(index, item)| job(index, item))
                    .collect()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_default_is_sequential() {
        assert_eq!(PipelineConfig::default().workers, 1);
        assert_eq!(Pipeline::default().workers(), 1);
    }

    #[test]
    fn test_sequential_runs_in_order() {
        let pipeline = Pipeline::new(PipelineConfig::sequential()).unwrap();
        let seen = Mutex::new(Vec::new());

        let results = pipeline.process(vec!["a", "b", "c"], |index, item| {
            seen.lock().unwrap().push(index);
            Ok(item.to_uppercase())
        });

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        let values: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_parallel_preserves_result_order() {
        let pipeline = Pipeline::new(PipelineConfig::new(4)).unwrap();
        assert_eq!(pipeline.workers(), 4);

        let items: Vec<u32> = (0..32).collect();
        let results = pipeline.process(items, |index, item| {
            assert_eq!(index as u32, item);
            Ok(item * 2)
        });

        for (index, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), index as u32 * 2);
        }
    }

    #[test]
    fn test_failure_does_not_stop_other_items() {
        let pipeline = Pipeline::new(PipelineConfig::new(2)).unwrap();
        let runs = AtomicUsize::new(0);

        let results = pipeline.process(vec![1, 2, 3, 4], |_, item| {
            runs.fetch_add(1, Ordering::SeqCst);
            if item == 2 {
                Err(Error::transfer("disk2", "boom"))
            } else {
                Ok(item)
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert!(results[1].is_err());
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    }
}
