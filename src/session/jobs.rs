//! Registry of in-flight batch jobs.
//!
//! A batch job is resumable: if the socket drops while any of its
//! fingerprints is still pending, the session resends the job's
//! continuation frame after re-authenticating. Jobs are kept in submission
//! order so server job ids, which arrive without any correlation key, are
//! assigned to the oldest job still waiting for one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ulid::Ulid;

use crate::cache::{CacheSlot, CacheStore, Fingerprint};
use crate::error::LockResultExt;
use crate::protocol::RequestFrame;

#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: Ulid,
    /// Fingerprints listed in this job's `cache_key`.
    pub fingerprints: Vec<Fingerprint>,
    pub continuation: RequestFrame,
    pub job_id: Option<String>,
    /// Connection generation this job was last sent on.
    sent_generation: Option<u64>,
}

impl BatchJob {
    /// The frame to (re)send, carrying the server job id once known.
    pub fn outbound_frame(&self) -> RequestFrame {
        match &self.job_id {
            Some(job_id) => self.continuation.clone().with_monitor_hash_key(job_id),
            None => self.continuation.clone(),
        }
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<Vec<BatchJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, fingerprints: Vec<Fingerprint>, continuation: RequestFrame) -> Ulid {
        let id = Ulid::new();
        self.jobs
            .lock()
            .recover_poison("JobRegistry::register")
            .push(BatchJob {
                id,
                fingerprints,
                continuation,
                job_id: None,
                sent_generation: None,
            });
        id
    }

    pub fn remove(&self, id: Ulid) {
        self.jobs
            .lock()
            .recover_poison("JobRegistry::remove")
            .retain(|job| job.id != id);
    }

    /// Record a server job id against the oldest job that has none.
    pub fn assign_job_id(&self, job_id: String) -> Option<Ulid> {
        let mut jobs = self.jobs.lock().recover_poison("JobRegistry::assign_job_id");
        let job = jobs.iter_mut().find(|job| job.job_id.is_none())?;
        job.job_id = Some(job_id);
        Some(job.id)
    }

    /// Claim the right to send job `id` on connection `generation`.
    ///
    /// Returns the frame to send the first time it is called for a given
    /// generation and `None` afterwards, so a job goes out at most once per
    /// connection.
    pub fn claim_send(&self, id: Ulid, generation: u64) -> Option<RequestFrame> {
        let mut jobs = self.jobs.lock().recover_poison("JobRegistry::claim_send");
        let job = jobs.iter_mut().find(|job| job.id == id)?;
        if job.sent_generation == Some(generation) {
            return None;
        }
        job.sent_generation = Some(generation);
        Some(job.outbound_frame())
    }

    /// Jobs with at least one fingerprint still pending, oldest first.
    pub fn resumable(&self, cache: &CacheStore) -> Vec<Ulid> {
        self.jobs
            .lock()
            .recover_poison("JobRegistry::resumable")
            .iter()
            .filter(|job| {
                job.fingerprints
                    .iter()
                    .any(|fp| cache.peek(fp) == Some(CacheSlot::Pending))
            })
            .map(|job| job.id)
            .collect()
    }

    /// Every fingerprint covered by a registered job.
    pub fn tracked_fingerprints(&self) -> HashSet<Fingerprint> {
        self.jobs
            .lock()
            .recover_poison("JobRegistry::tracked_fingerprints")
            .iter()
            .flat_map(|job| job.fingerprints.iter().cloned())
            .collect()
    }

    pub fn job(&self, id: Ulid) -> Option<BatchJob> {
        self.jobs
            .lock()
            .recover_poison("JobRegistry::job")
            .iter()
            .find(|job| job.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().recover_poison("JobRegistry::len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deregisters a job when the dispatch that owns it finishes or is dropped.
pub struct JobGuard {
    registry: Arc<JobRegistry>,
    id: Ulid,
}

impl JobGuard {
    pub fn new(registry: Arc<JobRegistry>, id: Ulid) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
