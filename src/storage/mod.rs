//! Storage contract the core relies on
//!
//! Every mutation is a conditional update: the store checks the caller's
//! expectations and applies the change in one atomic step, or rejects it and
//! hands back the row as it currently is. This is the only concurrency
//! primitive the scheduler, the lock manager and the merger use.

pub mod memory;

pub use memory::{lock_path, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use vidpair_core::{Chunk, ChunkState, JobStatus, ProcessingJob, Result, ReviewLock, Segment, Video};

use crate::audit::AuditRecord;
use crate::review::ConflictArtifact;
use crate::scheduler::credentials::Credential;
use crate::scheduler::OperatorAlert;

/// Result of a conditional update
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    /// The precondition held and the change was written
    Applied(T),
    /// The precondition failed; carries the row as stored
    Rejected(T),
}

impl<T> CasOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            CasOutcome::Applied(value) | CasOutcome::Rejected(value) => value,
        }
    }
}

/// Precondition on a chunk row
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkCondition {
    StateIs(ChunkState),
    StateIn(Vec<ChunkState>),
    VersionIs(u64),
    /// No lock, an expired lock, or a lock already held by `reviewer`
    LockAvailableTo { reviewer: String, now: DateTime<Utc> },
    /// A lock (expired or not) recorded for `reviewer`
    LockHeldBy(String),
    /// No lock that is still live at `now`
    NoActiveLock { now: DateTime<Utc> },
}

impl ChunkCondition {
    pub fn holds(&self, chunk: &Chunk) -> bool {
        match self {
            ChunkCondition::StateIs(state) => chunk.state == *state,
            ChunkCondition::StateIn(states) => states.contains(&chunk.state),
            ChunkCondition::VersionIs(version) => chunk.sync_version == *version,
            ChunkCondition::LockAvailableTo { reviewer, now } => match chunk.active_lock(*now) {
                None => true,
                Some(lock) => lock.holder == *reviewer,
            },
            ChunkCondition::LockHeldBy(reviewer) => chunk
                .lock
                .as_ref()
                .map_or(false, |lock| lock.holder == *reviewer),
            ChunkCondition::NoActiveLock { now } => chunk.active_lock(*now).is_none(),
        }
    }
}

/// How a chunk update touches the chunk's segment rows
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentWrite {
    /// Supersede every current segment and insert a new generation
    ReplaceAll(Vec<Segment>),
    /// Insert revisions; each one supersedes the row named in `supersedes`
    Revise(Vec<Segment>),
}

/// Field changes applied to a chunk when its conditions hold
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPatch {
    pub state: Option<ChunkState>,
    pub lock: Option<Option<ReviewLock>>,
    pub bump_version: bool,
    pub needs_rereview: Option<bool>,
    pub needs_manual_intervention: Option<bool>,
    pub segments: Option<SegmentWrite>,
    /// Timestamp written to `updated_at`, taken from the caller's clock
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChunkPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: ChunkState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn lock(mut self, lock: Option<ReviewLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn bump_version(mut self) -> Self {
        self.bump_version = true;
        self
    }

    pub fn needs_rereview(mut self, flag: bool) -> Self {
        self.needs_rereview = Some(flag);
        self
    }

    pub fn needs_manual_intervention(mut self, flag: bool) -> Self {
        self.needs_manual_intervention = Some(flag);
        self
    }

    pub fn segments(mut self, write: SegmentWrite) -> Self {
        self.segments = Some(write);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.updated_at = Some(now);
        self
    }

    /// Apply the non-segment fields to `chunk`, stamping `fallback` if the patch carries no time
    pub fn apply_to(&self, chunk: &mut Chunk, fallback: DateTime<Utc>) {
        if let Some(state) = self.state {
            chunk.state = state;
        }
        if let Some(lock) = &self.lock {
            chunk.lock = lock.clone();
        }
        if self.bump_version {
            chunk.sync_version += 1;
        }
        if let Some(flag) = self.needs_rereview {
            chunk.needs_rereview = flag;
        }
        if let Some(flag) = self.needs_manual_intervention {
            chunk.needs_manual_intervention = flag;
        }
        chunk.updated_at = self.updated_at.unwrap_or(fallback);
    }
}

/// Field changes applied to a job when its status matches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    pub not_before: Option<Option<DateTime<Utc>>>,
    pub attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub worker_id: Option<Option<String>>,
    pub credential_id: Option<Option<String>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn lease_expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.lease_expires_at = Some(at);
        self
    }

    pub fn not_before(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn worker_id(mut self, worker: Option<String>) -> Self {
        self.worker_id = Some(worker);
        self
    }

    pub fn credential_id(mut self, credential: Option<String>) -> Self {
        self.credential_id = Some(credential);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.updated_at = Some(now);
        self
    }

    pub fn apply_to(&self, job: &mut ProcessingJob, fallback: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(at) = self.lease_expires_at {
            job.lease_expires_at = at;
        }
        if let Some(at) = self.not_before {
            job.not_before = at;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(error) = &self.last_error {
            job.last_error = error.clone();
        }
        if let Some(worker) = &self.worker_id {
            job.worker_id = worker.clone();
        }
        if let Some(credential) = &self.credential_id {
            job.credential_id = credential.clone();
        }
        job.updated_at = self.updated_at.unwrap_or(fallback);
    }
}

/// Transactional store the pipeline core runs against
#[async_trait]
pub trait Store: Send + Sync {
    // Videos
    async fn insert_video(&self, video: Video) -> Result<()>;
    async fn get_video(&self, id: &str) -> Result<Option<Video>>;
    async fn list_videos(&self) -> Result<Vec<Video>>;

    /// Insert a video and all of its chunks, or nothing at all
    async fn register_video(&self, video: Video, chunks: Vec<Chunk>) -> Result<()>;

    // Chunks
    async fn insert_chunk(&self, chunk: Chunk) -> Result<()>;
    async fn get_chunk(&self, id: Uuid) -> Result<Option<Chunk>>;
    /// Chunks of one video ordered by index
    async fn chunks_for_video(&self, video_id: &str) -> Result<Vec<Chunk>>;
    async fn list_chunks(&self, state: Option<ChunkState>) -> Result<Vec<Chunk>>;
    /// Apply `patch` only if every condition holds ("update ... where ...")
    async fn update_chunk(
        &self,
        id: Uuid,
        conditions: &[ChunkCondition],
        patch: ChunkPatch,
    ) -> Result<CasOutcome<Chunk>>;

    // Jobs
    /// Insert a job unless its chunk already has an active one (returned as `Rejected`)
    async fn insert_job(&self, job: ProcessingJob) -> Result<CasOutcome<ProcessingJob>>;
    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>>;
    async fn active_job_for_chunk(&self, chunk_id: Uuid) -> Result<Option<ProcessingJob>>;
    async fn jobs_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<ProcessingJob>>;
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<ProcessingJob>>;
    async fn update_job(
        &self,
        id: Uuid,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<CasOutcome<ProcessingJob>>;

    // Segments
    /// Current (not superseded) segments of a chunk ordered by start
    async fn current_segments(&self, chunk_id: Uuid) -> Result<Vec<Segment>>;
    /// Every segment row ever written for a chunk
    async fn segment_history(&self, chunk_id: Uuid) -> Result<Vec<Segment>>;

    // Credentials
    async fn insert_credential(&self, credential: Credential) -> Result<()>;
    async fn list_credentials(&self) -> Result<Vec<Credential>>;
    /// Replace a credential if its stored revision equals `expected_revision`
    async fn update_credential(
        &self,
        id: &str,
        expected_revision: u64,
        credential: Credential,
    ) -> Result<CasOutcome<Credential>>;

    // Audit log
    async fn append_audit(&self, record: AuditRecord) -> Result<()>;
    async fn audit_log(&self, entity_id: Option<&str>) -> Result<Vec<AuditRecord>>;

    // Review conflicts
    async fn save_conflict(&self, artifact: ConflictArtifact) -> Result<()>;
    async fn conflicts_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<ConflictArtifact>>;

    // Operator queue
    async fn push_alert(&self, alert: OperatorAlert) -> Result<()>;
    async fn list_alerts(&self) -> Result<Vec<OperatorAlert>>;
    /// Mark a chunk's open alerts resolved, returns how many were open
    async fn resolve_alerts(&self, chunk_id: Uuid) -> Result<usize>;

    /// Make every change so far durable; stores that write through do nothing
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
