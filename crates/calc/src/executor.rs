//! # Task Executor
//!
//! Fan-out/fan-in of calculator tasks. A worker returns a partial result
//! and optionally a list of subtasks; subtasks are scheduled in a later
//! round until none remain. Results are folded by the caller in
//! completion order.
//!
//! ## Table of Contents
//! 1. TaskOutput
//! 2. Executor trait
//! 3. Rayon and sequential executors
//! 4. Starmap

use std::time::Instant;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info};

use crate::error::{CalcError, Result};

// ============================================================================
// 1. TaskOutput
// ============================================================================

/// What a worker returns
#[derive(Debug, Clone)]
pub struct TaskOutput<A, R> {
    /// Partial result, if any
    pub result: Option<R>,
    /// Further tasks to schedule
    pub subtasks: Vec<A>,
}

impl<A, R> TaskOutput<A, R> {
    pub fn done(result: R) -> Self {
        Self {
            result: Some(result),
            subtasks: Vec::new(),
        }
    }

    pub fn with_subtasks(result: Option<R>, subtasks: Vec<A>) -> Self {
        Self { result, subtasks }
    }
}

// ============================================================================
// 2. Executor trait
// ============================================================================

/// Runs tasks and their subtasks until exhaustion
pub trait Executor: Send + Sync {
    /// Execute `tasks` with `worker` and return every partial result.
    /// The first error aborts the whole run.
    fn execute<A, R, F>(&self, tasks: Vec<A>, worker: &F) -> Result<Vec<R>>
    where
        A: Send,
        R: Send,
        F: Fn(A) -> Result<TaskOutput<A, R>> + Sync;

    /// Number of workers available
    fn num_workers(&self) -> usize;
}

// ============================================================================
// 3. Rayon and sequential executors
// ============================================================================

/// Executor backed by rayon, on the global pool or on a dedicated one
#[derive(Default)]
pub struct RayonExecutor {
    pool: Option<ThreadPool>,
}

impl RayonExecutor {
    /// Use the global rayon pool
    pub fn new() -> Self {
        Self { pool: None }
    }

    /// Use a dedicated pool of `num_threads` threads
    pub fn with_threads(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("seisma-worker-{i}"))
            .build()
            .map_err(|e| CalcError::task(format!("cannot build thread pool: {e}")))?;
        Ok(Self { pool: Some(pool) })
    }

    fn run_round<A, R, F>(tasks: Vec<A>, worker: &F) -> Result<Vec<TaskOutput<A, R>>>
    where
        A: Send,
        R: Send,
        F: Fn(A) -> Result<TaskOutput<A, R>> + Sync,
    {
        tasks.into_par_iter().map(worker).collect()
    }
}

impl Executor for RayonExecutor {
    fn execute<A, R, F>(&self, tasks: Vec<A>, worker: &F) -> Result<Vec<R>>
    where
        A: Send,
        R: Send,
        F: Fn(A) -> Result<TaskOutput<A, R>> + Sync,
    {
        let mut results = Vec::new();
        let mut pending = tasks;
        let mut round = 0;
        while !pending.is_empty() {
            debug!(round, tasks = pending.len(), "Running round");
            let outputs = match &self.pool {
                Some(pool) => pool.install(|| Self::run_round(pending, worker))?,
                None => Self::run_round(pending, worker)?,
            };
            pending = Vec::new();
            for out in outputs {
                results.extend(out.result);
                pending.extend(out.subtasks);
            }
            round += 1;
        }
        Ok(results)
    }

    fn num_workers(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

/// Executor running everything in the calling thread, depth first
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialExecutor;

impl Executor for SequentialExecutor {
    fn execute<A, R, F>(&self, tasks: Vec<A>, worker: &F) -> Result<Vec<R>>
    where
        A: Send,
        R: Send,
        F: Fn(A) -> Result<TaskOutput<A, R>> + Sync,
    {
        let mut results = Vec::new();
        let mut stack: Vec<A> = tasks.into_iter().rev().collect();
        while let Some(task) = stack.pop() {
            let out = worker(task)?;
            results.extend(out.result);
            stack.extend(out.subtasks.into_iter().rev());
        }
        Ok(results)
    }

    fn num_workers(&self) -> usize {
        1
    }
}

// ============================================================================
// 4. Starmap
// ============================================================================

/// A named batch of tasks submitted to an executor
pub struct Starmap<'a, E: Executor, A> {
    executor: &'a E,
    name: String,
    tasks: Vec<A>,
}

impl<'a, E: Executor, A: Send> Starmap<'a, E, A> {
    pub fn new(executor: &'a E, name: impl Into<String>) -> Self {
        Self {
            executor,
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Queue a task
    pub fn submit(&mut self, task: A) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task and fold the partial results into `acc`
    pub fn reduce<R, T, F, C>(self, worker: F, mut acc: T, mut combine: C) -> Result<T>
    where
        R: Send,
        F: Fn(A) -> Result<TaskOutput<A, R>> + Sync,
        C: FnMut(&mut T, R) -> Result<()>,
    {
        let start = Instant::now();
        let submitted = self.tasks.len();
        info!(name = %self.name, tasks = submitted, "Submitting tasks");
        let results = self.executor.execute(self.tasks, &worker)?;
        let received = results.len();
        for res in results {
            combine(&mut acc, res)?;
        }
        info!(
            name = %self.name,
            submitted,
            received,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tasks completed"
        );
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitting_worker(n: u32) -> Result<TaskOutput<u32, u32>> {
        if n > 10 {
            Ok(TaskOutput::with_subtasks(None, vec![n / 2, n - n / 2]))
        } else {
            Ok(TaskOutput::done(n))
        }
    }

    #[test]
    fn test_subtasks_are_executed() {
        let exec = RayonExecutor::new();
        let mut smap = Starmap::new(&exec, "split");
        smap.submit(100);
        smap.submit(7);
        let total = smap.reduce(splitting_worker, 0u32, |acc, r| {
            *acc += r;
            Ok(())
        });
        assert_eq!(total.unwrap(), 107);
    }

    #[test]
    fn test_sequential_matches_rayon() {
        let tasks: Vec<u32> = (1..50).collect();
        let seq = SequentialExecutor.execute(tasks.clone(), &splitting_worker).unwrap();
        let par = RayonExecutor::with_threads(2).unwrap().execute(tasks, &splitting_worker).unwrap();
        let (mut a, mut b) = (seq, par);
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }

    #[test]
    fn test_error_aborts() {
        let worker = |n: u32| -> Result<TaskOutput<u32, u32>> {
            if n == 3 {
                Err(CalcError::task("boom"))
            } else {
                Ok(TaskOutput::done(n))
            }
        };
        let out = RayonExecutor::new().execute(vec![1, 2, 3, 4], &worker);
        assert!(matches!(out, Err(CalcError::Task(_))));
        let out = SequentialExecutor.execute(vec![1, 2, 3, 4], &worker);
        assert!(out.is_err());
    }

    #[test]
    fn test_empty_starmap() {
        let exec = SequentialExecutor;
        let smap: Starmap<'_, _, u32> = Starmap::new(&exec, "empty");
        assert!(smap.is_empty());
        let acc = smap.reduce(splitting_worker, Vec::new(), |acc: &mut Vec<u32>, r| {
            acc.push(r);
            Ok(())
        });
        assert!(acc.unwrap().is_empty());
    }
}
