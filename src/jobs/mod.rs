//! Asynchronous job scheduler.
//!
//! Jobs are queued by priority and run on a fixed pool of long-lived worker
//! threads. Each worker advertises a [`JobType`] mask and only picks up jobs
//! whose type intersects it. Results are copied into a bounded table and
//! handed to the job's callbacks on the thread that calls [`JobSystem::update`],
//! normally once per frame.
//!
//! Within a priority tier jobs are dispatched in submission order. A head job
//! whose dependencies have not completed blocks the rest of its tier until a
//! later `update`.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//! use lumen_engine::jobs::{JobInfo, JobSystem, JobSystemConfig, JobType};
//!
//! let jobs = JobSystem::new(JobSystemConfig::with_threads(vec![JobType::GENERAL])).unwrap();
//! let answer = Rc::new(RefCell::new(None));
//!
//! let sink = Rc::clone(&answer);
//! jobs.submit(
//!     JobInfo::new(|_, result| {
//!         result.push(42);
//!         true
//!     })
//!     .on_success(move |bytes| *sink.borrow_mut() = Some(bytes[0])),
//! )
//! .unwrap();
//!
//! assert!(jobs.wait_idle(Duration::from_secs(5)));
//! assert_eq!(*answer.borrow(), Some(42));
//! ```

mod job;
mod semaphore;
mod worker;

pub use job::{JobCallback, JobEntry, JobId, JobInfo, JobPriority, JobType};

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use job::Job;
use worker::Shared;

/// Hard limit on worker threads.
pub const MAX_JOB_THREADS: usize = 32;

/// Job scheduler errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job system requires at least one worker thread")]
    NoThreads,
    #[error("Requested {requested} worker threads, the maximum is {max}")]
    TooManyThreads { requested: usize, max: usize },
    #[error("Result table size must be non-zero")]
    InvalidResultCapacity,
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
    #[error("Dependency {0} was never submitted")]
    UnknownDependency(JobId),
    #[error("No worker thread accepts job type {0:?}")]
    NoCapableThread(JobType),
}

/// Worker pool layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// One entry per worker thread: the job types it accepts.
    pub thread_types: Vec<JobType>,
    /// Capacity of the result table; workers wait when it is full.
    pub max_results: usize,
}

impl JobSystemConfig {
    pub const DEFAULT_MAX_RESULTS: usize = 512;

    pub fn with_threads(thread_types: Vec<JobType>) -> Self {
        Self {
            thread_types,
            max_results: Self::DEFAULT_MAX_RESULTS,
        }
    }

    /// One worker per spare core. The first worker owns GPU resource jobs and
    /// the second owns resource loads, both also taking general work.
    pub fn default_for_cores() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let count = cores.saturating_sub(1).clamp(1, MAX_JOB_THREADS);
        let thread_types = (0..count)
            .map(|i| match (count, i) {
                (1, _) => JobType::all(),
                (_, 0) => JobType::GENERAL | JobType::GPU_RESOURCE,
                (_, 1) => JobType::GENERAL | JobType::RESOURCE_LOAD,
                _ => JobType::GENERAL,
            })
            .collect();
        Self::with_threads(thread_types)
    }
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self::default_for_cores()
    }
}

#[derive(Default)]
struct Callbacks {
    on_success: Option<JobCallback>,
    on_failure: Option<JobCallback>,
}

/// Priority-queued worker pool with main-thread result delivery.
///
/// Owned by the main thread. Callbacks never leave it, so the scheduler itself
/// is `!Send`; only entry points and their parameter blobs cross to workers.
pub struct JobSystem {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    /// High, Normal, Low.
    queues: [Mutex<VecDeque<Job>>; 3],
    callbacks: Mutex<HashMap<JobId, Callbacks>>,
    next_id: Cell<u32>,
    /// Submitted jobs whose results have not been delivered yet.
    pending: Cell<usize>,
}

impl JobSystem {
    pub fn new(config: JobSystemConfig) -> Result<Self, JobError> {
        let thread_count = config.thread_types.len();
        if thread_count == 0 {
            return Err(JobError::NoThreads);
        }
        if thread_count > MAX_JOB_THREADS {
            log::error!("Job system configured with {thread_count} threads, max is {MAX_JOB_THREADS}");
            return Err(JobError::TooManyThreads {
                requested: thread_count,
                max: MAX_JOB_THREADS,
            });
        }
        if config.max_results == 0 {
            return Err(JobError::InvalidResultCapacity);
        }

        let shared = Arc::new(Shared::new(&config.thread_types, config.max_results));
        let mut system = Self {
            shared: Arc::clone(&shared),
            threads: Vec::with_capacity(thread_count),
            queues: Default::default(),
            callbacks: Mutex::new(HashMap::new()),
            next_id: Cell::new(0),
            pending: Cell::new(0),
        };

        for index in 0..thread_count {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("job-worker-{index}"))
                .spawn(move || worker::run(shared, index));
            match handle {
                Ok(handle) => system.threads.push(handle),
                Err(e) => {
                    log::error!("Failed to spawn job worker {index}: {e}");
                    // Drop joins the workers that did start.
                    return Err(JobError::ThreadSpawn(e));
                }
            }
        }

        log::info!(
            "Job system started with {} worker threads (result table: {})",
            thread_count,
            config.max_results
        );
        Ok(system)
    }

    pub fn thread_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Submitted jobs whose callbacks have not run yet.
    pub fn pending_jobs(&self) -> usize {
        self.pending.get()
    }

    /// Whether the job has finished running. Its callbacks may still be
    /// waiting for the next [`update`](Self::update).
    pub fn query_job_complete(&self, id: JobId) -> bool {
        self.shared.is_complete(id)
    }

    /// Submit a job.
    ///
    /// High-priority jobs go straight to an idle capable worker when the High
    /// queue is empty and their dependencies are met; everything else is
    /// queued until the next [`update`](Self::update).
    ///
    /// # Panics
    ///
    /// Panics when the 16-bit job ID space is exhausted.
    pub fn submit(&self, info: JobInfo) -> Result<JobId, JobError> {
        crate::profile_function!();

        let issued = self.next_id.get();
        for dep in &info.dependencies {
            if u32::from(dep.0) >= issued {
                log::error!("Job submitted with unknown dependency {dep}");
                return Err(JobError::UnknownDependency(*dep));
            }
        }
        if !self
            .shared
            .workers
            .iter()
            .any(|w| w.job_type.intersects(info.job_type))
        {
            log::error!("No worker accepts job type {:?}", info.job_type);
            return Err(JobError::NoCapableThread(info.job_type));
        }

        assert!(
            issued <= u32::from(u16::MAX),
            "job ID space exhausted after {issued} jobs"
        );
        let id = JobId(issued as u16);
        self.next_id.set(issued + 1);

        self.callbacks.lock().insert(
            id,
            Callbacks {
                on_success: info.on_success,
                on_failure: info.on_failure,
            },
        );
        self.pending.set(self.pending.get() + 1);

        let priority = info.priority;
        let mut job = Job {
            id,
            entry: info.entry,
            params: info.params,
            result_size: info.result_size,
            job_type: info.job_type,
            dependencies: info.dependencies,
        };

        let mut queue = self.queues[priority.queue_index()].lock();
        if priority == JobPriority::High && queue.is_empty() && self.dependencies_met(&job) {
            match self.try_dispatch(job) {
                Ok(()) => {
                    log::trace!("{id} dispatched immediately");
                    return Ok(id);
                }
                Err(returned) => job = returned,
            }
        }
        queue.push_back(job);
        log::trace!("{id} queued at {priority:?}");
        Ok(id)
    }

    /// Dispatch queued jobs to idle workers, then deliver finished results.
    ///
    /// Never blocks on workers; work that cannot be placed waits for the next
    /// call.
    pub fn update(&self) {
        crate::profile_function!();

        for priority in JobPriority::DISPATCH_ORDER {
            let mut queue = self.queues[priority.queue_index()].lock();
            while let Some(job) = queue.pop_front() {
                if !self.dependencies_met(&job) {
                    log::trace!("{} blocked on dependencies", job.id);
                    queue.push_front(job);
                    break;
                }
                if let Err(job) = self.try_dispatch(job) {
                    queue.push_front(job);
                    break;
                }
            }
        }

        self.deliver_results();
    }

    /// Call [`update`](Self::update) until every submitted job has been
    /// delivered or `timeout` expires. Returns whether the system went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.update();
            if self.pending_jobs() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("{} jobs still pending after {:?}", self.pending_jobs(), timeout);
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn dependencies_met(&self, job: &Job) -> bool {
        job.dependencies.is_empty() || {
            let completed = self.shared.completed.lock();
            job.dependencies.iter().all(|d| completed.contains(d.index()))
        }
    }

    fn try_dispatch(&self, mut job: Job) -> Result<(), Job> {
        for slot in &self.shared.workers {
            match slot.try_assign(job) {
                Ok(()) => return Ok(()),
                Err(returned) => job = returned,
            }
        }
        Err(job)
    }

    fn deliver_results(&self) {
        let mut outcomes = {
            let mut table = self.shared.results.lock();
            std::mem::take(&mut table.outcomes)
        };
        self.shared.results_drained.notify_all();
        if outcomes.is_empty() {
            return;
        }
        outcomes.sort_by_key(|o| o.sequence);

        for outcome in outcomes {
            let callbacks = self.callbacks.lock().remove(&outcome.id).unwrap_or_default();
            self.pending.set(self.pending.get().saturating_sub(1));
            let callback = if outcome.success {
                callbacks.on_success
            } else {
                callbacks.on_failure
            };
            log::trace!(
                "Delivering {} ({})",
                outcome.id,
                if outcome.success { "success" } else { "failure" }
            );
            if let Some(callback) = callback {
                callback(&outcome.data);
            }
        }
    }

    /// Whether every worker is idle.
    pub fn workers_idle(&self) -> bool {
        self.shared.workers.iter().all(|w| w.is_idle())
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        {
            // Workers check `running` under the result lock before waiting.
            let _table = self.shared.results.lock();
            self.shared.running.store(false, Ordering::Release);
            self.shared.results_drained.notify_all();
        }
        for slot in &self.shared.workers {
            slot.signal.release();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Job worker panicked during shutdown");
            }
        }
        log::info!("Job system shut down");
    }
}

impl std::fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSystem")
            .field("threads", &self.thread_count())
            .field("pending", &self.pending_jobs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_worker() -> JobSystem {
        JobSystem::new(JobSystemConfig::with_threads(vec![JobType::GENERAL])).unwrap()
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(matches!(
            JobSystem::new(JobSystemConfig::with_threads(Vec::new())),
            Err(JobError::NoThreads)
        ));
    }

    #[test]
    fn rejects_too_many_threads() {
        let config = JobSystemConfig::with_threads(vec![JobType::GENERAL; MAX_JOB_THREADS + 1]);
        assert!(matches!(
            JobSystem::new(config),
            Err(JobError::TooManyThreads { requested: 33, .. })
        ));
    }

    #[test]
    fn default_config_within_limits() {
        let config = JobSystemConfig::default_for_cores();
        assert!(!config.thread_types.is_empty());
        assert!(config.thread_types.len() <= MAX_JOB_THREADS);
        let combined = config
            .thread_types
            .iter()
            .fold(JobType::empty(), |acc, t| acc | *t);
        assert_eq!(combined, JobType::all());
    }

    #[test]
    fn unknown_dependency_rejected() {
        let jobs = single_worker();
        let result = jobs.submit(JobInfo::new(|_, _| true).with_dependencies([JobId(7)]));
        assert!(matches!(result, Err(JobError::UnknownDependency(JobId(7)))));
        assert_eq!(jobs.pending_jobs(), 0);
    }

    #[test]
    fn unsupported_type_rejected() {
        let jobs = single_worker();
        let result = jobs.submit(JobInfo::new(|_, _| true).with_type(JobType::GPU_RESOURCE));
        assert!(matches!(result, Err(JobError::NoCapableThread(_))));
    }

    #[test]
    fn ids_increase() {
        let jobs = single_worker();
        let a = jobs.submit(JobInfo::new(|_, _| true)).unwrap();
        let b = jobs.submit(JobInfo::new(|_, _| true)).unwrap();
        assert!(b > a);
        assert!(jobs.wait_idle(Duration::from_secs(5)));
    }

    fn two_workers_one_result_slot() -> JobSystem {
        let mut config = JobSystemConfig::with_threads(vec![JobType::GENERAL; 2]);
        config.max_results = 1;
        JobSystem::new(config).unwrap()
    }

    #[test]
    fn full_result_table_applies_back_pressure() {
        let jobs = two_workers_one_result_slot();
        for _ in 0..4 {
            jobs.submit(JobInfo::new(|_, _| true).with_priority(JobPriority::High))
                .unwrap();
        }
        assert!(jobs.wait_idle(Duration::from_secs(5)));
        assert_eq!(jobs.pending_jobs(), 0);
    }

    #[test]
    fn drop_wakes_worker_blocked_on_full_results() {
        for _ in 0..20 {
            let jobs = two_workers_one_result_slot();
            let a = jobs
                .submit(JobInfo::new(|_, _| true).with_priority(JobPriority::High))
                .unwrap();
            let b = jobs
                .submit(JobInfo::new(|_, _| true).with_priority(JobPriority::High))
                .unwrap();
            while !(jobs.query_job_complete(a) || jobs.query_job_complete(b)) {
                std::thread::sleep(Duration::from_millis(1));
            }
            // The other worker is waiting for a result slot; drop must not hang.
            drop(jobs);
        }
    }

    #[test]
    fn running_job_keeps_worker_busy() {
        use std::sync::atomic::AtomicBool;

        let jobs = single_worker();
        let started = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(AtomicBool::new(false));
        let (started_flag, gate_flag) = (Arc::clone(&started), Arc::clone(&gate));
        jobs.submit(JobInfo::new(move |_, _| {
            started_flag.store(true, Ordering::Release);
            while !gate_flag.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            true
        }))
        .unwrap();
        jobs.update();
        while !started.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        assert!(!jobs.workers_idle());

        gate.store(true, Ordering::Release);
        assert!(jobs.wait_idle(Duration::from_secs(5)));
        // The slot returns to idle just after its result is stored.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !jobs.workers_idle() {
            assert!(Instant::now() < deadline);
            std::thread::yield_now();
        }
    }

    #[test]
    fn panicking_entry_reports_failure() {
        use std::cell::Cell;
        use std::rc::Rc;

        let jobs = single_worker();
        let failed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&failed);
        jobs.submit(
            JobInfo::new(|_, _| panic!("boom")).on_failure(move |_| flag.set(true)),
        )
        .unwrap();
        assert!(jobs.wait_idle(Duration::from_secs(5)));
        assert!(failed.get());
        // Worker survives and keeps serving jobs.
        jobs.submit(JobInfo::new(|_, _| true)).unwrap();
        assert!(jobs.wait_idle(Duration::from_secs(5)));
    }
}
