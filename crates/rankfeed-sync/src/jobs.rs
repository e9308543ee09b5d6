//! Keyed lifecycle store for bulk-scrape jobs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rankfeed_core::ScrapeJobStatus;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    #[default]
    KeepForever,
    /// Drop finished jobs this long after they reached a terminal state.
    EvictAfter(Duration),
}

impl RetentionPolicy {
    pub fn from_secs(secs: Option<u64>) -> Self {
        match secs {
            Some(secs) => Self::EvictAfter(Duration::from_secs(secs)),
            None => Self::KeepForever,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobTrackError {
    #[error("job id must not be empty")]
    EmptyJobId,
    #[error("job {0} is already running")]
    AlreadyRunning(String),
}

#[derive(Debug, Clone, Copy)]
struct JobEntry {
    status: ScrapeJobStatus,
    finished_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<String, JobEntry>>,
    retention: RetentionPolicy,
}

impl JobTracker {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            jobs: Mutex::default(),
            retention,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn start(&self, job_id: &str) -> Result<(), JobTrackError> {
        if job_id.trim().is_empty() {
            return Err(JobTrackError::EmptyJobId);
        }
        let mut jobs = self.lock_evicted();
        if matches!(jobs.get(job_id), Some(entry) if entry.status == ScrapeJobStatus::Running) {
            return Err(JobTrackError::AlreadyRunning(job_id.to_string()));
        }
        jobs.insert(
            job_id.to_string(),
            JobEntry {
                status: ScrapeJobStatus::Running,
                finished_at: None,
            },
        );
        Ok(())
    }

    pub fn complete(&self, job_id: &str) -> bool {
        self.finish(job_id, ScrapeJobStatus::Completed)
    }

    pub fn fail(&self, job_id: &str) -> bool {
        self.finish(job_id, ScrapeJobStatus::Failed)
    }

    /// `None` when the job was never started or has been evicted.
    pub fn status(&self, job_id: &str) -> Option<ScrapeJobStatus> {
        self.lock_evicted().get(job_id).map(|entry| entry.status)
    }

    pub fn snapshot(&self) -> Vec<(String, ScrapeJobStatus)> {
        let mut out: Vec<_> = self
            .lock_evicted()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Returns the number of evicted jobs.
    pub fn evict_expired(&self) -> usize {
        let mut jobs = self.lock();
        self.evict_locked(&mut jobs, Instant::now())
    }

    fn finish(&self, job_id: &str, status: ScrapeJobStatus) -> bool {
        let mut jobs = self.lock_evicted();
        match jobs.get_mut(job_id) {
            Some(entry) => {
                entry.status = status;
                entry.finished_at = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    fn evict_locked(&self, jobs: &mut HashMap<String, JobEntry>, now: Instant) -> usize {
        let RetentionPolicy::EvictAfter(window) = self.retention else {
            return 0;
        };
        let before = jobs.len();
        jobs.retain(|_, entry| match entry.finished_at {
            Some(finished) => now.saturating_duration_since(finished) < window,
            None => true,
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!(evicted, "evicted finished jobs");
        }
        evicted
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_evicted(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        let mut jobs = self.lock();
        self.evict_locked(&mut jobs, Instant::now());
        jobs
    }
}
