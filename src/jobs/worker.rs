//! Worker threads and the state they share with the scheduler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use parking_lot::{Condvar, Mutex};

use super::job::{Job, JobId, JobOutcome, JobType};
use super::semaphore::Semaphore;

/// What a worker is doing.
pub(crate) enum WorkerState {
    Idle,
    /// Handed over by the scheduler, not yet picked up.
    Assigned(Job),
    Running,
}

pub(crate) struct WorkerSlot {
    pub job_type: JobType,
    pub state: Mutex<WorkerState>,
    pub signal: Semaphore,
}

impl WorkerSlot {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            state: Mutex::new(WorkerState::Idle),
            signal: Semaphore::new(0),
        }
    }

    /// Hand `job` to this worker if it is idle and capable of running it.
    pub fn try_assign(&self, job: Job) -> Result<(), Job> {
        if !self.job_type.intersects(job.job_type) {
            return Err(job);
        }
        let mut state = self.state.lock();
        if !matches!(*state, WorkerState::Idle) {
            return Err(job);
        }
        *state = WorkerState::Assigned(job);
        drop(state);
        self.signal.release();
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        matches!(*self.state.lock(), WorkerState::Idle)
    }
}

pub(crate) struct ResultTable {
    pub outcomes: Vec<JobOutcome>,
    pub next_sequence: u64,
}

pub(crate) struct Shared {
    pub running: AtomicBool,
    /// One bit per job ID, set once the job has finished.
    pub completed: Mutex<FixedBitSet>,
    pub results: Mutex<ResultTable>,
    /// Signalled when the result table is drained or on shutdown.
    pub results_drained: Condvar,
    pub max_results: usize,
    pub workers: Vec<WorkerSlot>,
}

impl Shared {
    pub fn new(thread_types: &[JobType], max_results: usize) -> Self {
        Self {
            running: AtomicBool::new(true),
            completed: Mutex::new(FixedBitSet::with_capacity(u16::MAX as usize + 1)),
            results: Mutex::new(ResultTable {
                outcomes: Vec::with_capacity(max_results),
                next_sequence: 0,
            }),
            results_drained: Condvar::new(),
            max_results,
            workers: thread_types.iter().map(|&t| WorkerSlot::new(t)).collect(),
        }
    }

    pub fn is_complete(&self, id: JobId) -> bool {
        self.completed.lock().contains(id.index())
    }

    /// Store a finished job's output, waiting while the table is full.
    fn store_result(&self, id: JobId, success: bool, data: Vec<u8>) {
        let mut table = self.results.lock();
        while table.outcomes.len() >= self.max_results {
            if !self.running.load(Ordering::Acquire) {
                log::debug!("Dropping result of {id}: job system shutting down");
                return;
            }
            log::trace!("Result table full, {id} waiting for update()");
            self.results_drained.wait(&mut table);
        }
        let sequence = table.next_sequence;
        table.next_sequence += 1;
        table.outcomes.push(JobOutcome {
            id,
            success,
            data,
            sequence,
        });
    }
}

/// Worker thread body.
pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    let slot = &shared.workers[index];
    log::debug!("Job worker {index} started (types: {:?})", slot.job_type);

    loop {
        slot.signal.acquire();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let job = {
            let mut state = slot.state.lock();
            match std::mem::replace(&mut *state, WorkerState::Idle) {
                WorkerState::Assigned(job) => {
                    *state = WorkerState::Running;
                    job
                }
                other => {
                    *state = other;
                    continue;
                }
            }
        };

        let id = job.id;
        crate::profile_scope!("job");
        log::trace!("Worker {index} running {id}");

        let mut result = Vec::with_capacity(job.result_size);
        let entry = job.entry;
        let params = job.params;
        let success = match panic::catch_unwind(AssertUnwindSafe(|| entry(&params, &mut result))) {
            Ok(success) => success,
            Err(_) => {
                log::error!("{id} panicked on worker {index}; reporting failure");
                result.clear();
                false
            }
        };
        drop(params);

        shared.store_result(id, success, result);
        shared.completed.lock().insert(id.index());
        *slot.state.lock() = WorkerState::Idle;
    }

    log::debug!("Job worker {index} stopped");
}
