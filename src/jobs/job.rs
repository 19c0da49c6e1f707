//! Job description types.

use serde::{Deserialize, Serialize};

/// Identifier of a submitted job.
///
/// IDs are issued from a monotonically increasing 16-bit counter and are never
/// reused within one [`JobSystem`](super::JobSystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub(crate) u16);

impl JobId {
    pub fn raw(&self) -> u16 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Dispatch priority.
///
/// Derives `Ord`, so `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum JobPriority {
    /// Only runs when nothing more urgent is queued.
    Low,
    #[default]
    Normal,
    /// May bypass the queue entirely when a capable worker is idle.
    High,
}

impl JobPriority {
    /// Tiers in dispatch order.
    pub const DISPATCH_ORDER: [JobPriority; 3] =
        [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub(crate) fn queue_index(&self) -> usize {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }
}

bitflags::bitflags! {
    /// Which worker threads may run a job.
    ///
    /// A job runs on a worker whose mask intersects the job's mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct JobType: u8 {
        const GENERAL = 1 << 0;
        /// File or network reads, decoding.
        const RESOURCE_LOAD = 1 << 1;
        /// Work that must stay on the thread owning GPU upload state.
        const GPU_RESOURCE = 1 << 2;
    }
}

impl Default for JobType {
    fn default() -> Self {
        JobType::GENERAL
    }
}

/// Worker entry point: reads the parameter blob, writes the result blob, and
/// reports success.
pub type JobEntry = Box<dyn FnOnce(&[u8], &mut Vec<u8>) -> bool + Send + 'static>;

/// Completion callback, run on the thread that calls [`JobSystem::update`](super::JobSystem::update).
pub type JobCallback = Box<dyn FnOnce(&[u8]) + 'static>;

/// Everything needed to submit a job.
///
/// # Example
///
/// ```
/// use lumen_engine::jobs::{JobInfo, JobPriority, JobType};
///
/// let info = JobInfo::new(|params, result| {
///     let sum: u32 = params.iter().map(|&b| b as u32).sum();
///     result.extend_from_slice(&sum.to_le_bytes());
///     true
/// })
/// .with_params(vec![1u8, 2, 3])
/// .with_result_size(4)
/// .with_type(JobType::GENERAL)
/// .with_priority(JobPriority::High)
/// .on_success(|bytes| assert_eq!(bytes, &6u32.to_le_bytes()));
/// # let _ = info;
/// ```
pub struct JobInfo {
    pub(crate) entry: JobEntry,
    pub(crate) params: Vec<u8>,
    pub(crate) result_size: usize,
    pub(crate) on_success: Option<JobCallback>,
    pub(crate) on_failure: Option<JobCallback>,
    pub(crate) job_type: JobType,
    pub(crate) priority: JobPriority,
    pub(crate) dependencies: Vec<JobId>,
}

impl JobInfo {
    pub fn new<F>(entry: F) -> Self
    where
        F: FnOnce(&[u8], &mut Vec<u8>) -> bool + Send + 'static,
    {
        Self {
            entry: Box::new(entry),
            params: Vec::new(),
            result_size: 0,
            on_success: None,
            on_failure: None,
            job_type: JobType::GENERAL,
            priority: JobPriority::Normal,
            dependencies: Vec::new(),
        }
    }

    /// Parameter blob; the job owns this copy.
    pub fn with_params(mut self, params: impl Into<Vec<u8>>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_param_value<T: bytemuck::Pod>(mut self, value: &T) -> Self {
        self.params = bytemuck::bytes_of(value).to_vec();
        self
    }

    /// Capacity reserved for the result blob.
    pub fn with_result_size(mut self, size: usize) -> Self {
        self.result_size = size;
        self
    }

    pub fn on_success<F: FnOnce(&[u8]) + 'static>(mut self, callback: F) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure<F: FnOnce(&[u8]) + 'static>(mut self, callback: F) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = JobId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }
}

impl std::fmt::Debug for JobInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInfo")
            .field("params", &self.params.len())
            .field("result_size", &self.result_size)
            .field("job_type", &self.job_type)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Worker-side half of a job; callbacks stay behind with the scheduler.
pub(crate) struct Job {
    pub id: JobId,
    pub entry: JobEntry,
    pub params: Vec<u8>,
    pub result_size: usize,
    pub job_type: JobType,
    pub dependencies: Vec<JobId>,
}

/// Output of a finished job waiting in the result table.
#[derive(Debug)]
pub(crate) struct JobOutcome {
    pub id: JobId,
    pub success: bool,
    pub data: Vec<u8>,
    /// Completion order across all workers.
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert_eq!(JobPriority::DISPATCH_ORDER[0], JobPriority::High);
    }

    #[test]
    fn type_mask_intersection() {
        let worker = JobType::GENERAL | JobType::RESOURCE_LOAD;
        assert!(worker.intersects(JobType::RESOURCE_LOAD));
        assert!(!worker.intersects(JobType::GPU_RESOURCE));
    }

    #[test]
    fn param_value_is_copied() {
        let info = JobInfo::new(|_, _| true).with_param_value(&42u32);
        assert_eq!(info.params, 42u32.to_le_bytes());
    }
}
