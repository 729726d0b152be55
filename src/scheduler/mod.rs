//! Lease-based dispatch of transcription jobs
//!
//! Workers pull work with [`JobScheduler::acquire_next`]. A chunk only leaves
//! `PENDING` through a conditional update, so out of any number of racing
//! workers exactly one gets it. Leases that run out are reclaimed by a sweep
//! and fed through the same retry path as a reported failure.

pub mod credentials;
pub mod retry;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vidpair_core::{
    Chunk, ChunkState, Clock, JobStatus, PipelineError, ProcessingJob, RawSegment, Result,
    WorkerFailure,
};

use crate::audit::{AuditRecord, EntityKind};
use crate::config::Config;
use crate::merge::SegmentMerger;
use crate::state::StateMachine;
use crate::storage::{CasOutcome, ChunkCondition, ChunkPatch, JobPatch, SegmentWrite, Store};
use credentials::{CredentialLease, CredentialPool};
use retry::{RetryDecision, RetryPolicy};

/// Executor name recorded for reclamation in the audit log
pub const LEASE_SWEEPER: &str = "lease-sweeper";

/// A job handed to a worker, with everything needed to run it
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: ProcessingJob,
    pub chunk: Chunk,
    pub credential: Option<CredentialLease>,
}

/// What happened to a job after `complete` or `fail`
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Segments staged, chunk is review-ready
    Completed {
        job_id: Uuid,
        chunk_id: Uuid,
        sync_version: u64,
    },
    /// Job back in the queue, dispatchable from `not_before`
    Requeued {
        job_id: Uuid,
        attempts: u32,
        not_before: DateTime<Utc>,
    },
    /// Retries exhausted or fatal input; an operator alert was raised
    Failed {
        job_id: Uuid,
        attempts: u32,
        reason: String,
    },
    /// The job was no longer leased to the caller; nothing changed
    Stale,
}

/// Entry in the operator queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorAlert {
    pub id: Uuid,
    pub job_id: Uuid,
    pub chunk_id: Uuid,
    pub video_id: String,
    pub reason: String,
    pub attempts: u32,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
}

impl fmt::Display for OperatorAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] video {} chunk {} after {} attempt(s): {}{}",
            self.raised_at.format("%Y-%m-%d %H:%M:%S"),
            self.video_id,
            self.chunk_id,
            self.attempts,
            self.reason,
            if self.resolved { " (resolved)" } else { "" }
        )
    }
}

/// Summary of one reclamation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub requeued: usize,
    pub failed: usize,
    pub skipped: usize,
    /// `PROCESSING` chunks with no leased job, handed back to `PENDING`
    pub orphans: usize,
}

impl ReclaimReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed + self.skipped + self.orphans
    }
}

/// Job counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    machine: StateMachine,
    credentials: CredentialPool,
    merger: SegmentMerger,
    lease_ttl: Duration,
    policy: RetryPolicy,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            machine: StateMachine::new(store.clone(), clock.clone()),
            credentials: CredentialPool::new(store.clone(), config.credentials.reset_hour_utc),
            merger: SegmentMerger::new(store.clone(), clock.clone(), config.merge.clone()),
            lease_ttl: config.scheduler.lease_ttl(),
            policy: config.scheduler.retry_policy(),
            store,
            clock,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    /// Lease the oldest eligible chunk to `worker_id`
    ///
    /// Never blocks: `None` means there is nothing to hand out right now
    /// (no eligible chunk, or every credential is exhausted).
    pub async fn acquire_next(&self, worker_id: &str) -> Result<Option<Lease>> {
        self.reclaim_expired().await?;

        let now = self.clock.now();
        let uses_credentials = !self.credentials.is_empty().await?;
        if uses_credentials && !self.credentials.has_headroom(now).await? {
            debug!("All credentials exhausted, nothing dispatched to {}", worker_id);
            return Ok(None);
        }

        let mut candidates = Vec::new();
        for chunk in self.store.list_chunks(Some(ChunkState::Pending)).await? {
            if chunk.needs_manual_intervention {
                continue;
            }
            match self.store.active_job_for_chunk(chunk.id).await? {
                None => candidates.push((chunk.created_at, chunk, None)),
                Some(job) if job.is_dispatchable(now) => {
                    candidates.push((job.created_at, chunk, Some(job)))
                }
                Some(_) => {}
            }
        }
        candidates.sort_by(|(a_at, a, _), (b_at, b, _)| {
            a_at.cmp(b_at)
                .then(a.index.cmp(&b.index))
                .then(a.id.cmp(&b.id))
        });

        for (_, chunk, queued) in candidates {
            let chunk = match self
                .machine
                .transition_chunk(chunk.id, ChunkState::Pending, ChunkState::Processing, worker_id)
                .await
            {
                Ok(chunk) => chunk,
                // Another worker got there first
                Err(PipelineError::StaleState { .. }) => continue,
                Err(e) => return Err(e),
            };

            let credential = if uses_credentials {
                match self.credentials.checkout(now).await {
                    Ok(Some(credential)) => Some(credential),
                    Ok(None) => {
                        self.return_chunk(chunk.id, worker_id).await?;
                        return Ok(None);
                    }
                    Err(e) => {
                        self.return_chunk(chunk.id, worker_id).await?;
                        return Err(e);
                    }
                }
            } else {
                None
            };
            let credential_id = credential.as_ref().map(|c| c.id.clone());

            let job = match queued {
                Some(job) => self.lease_queued(job.id, worker_id, credential_id, now).await?,
                None => self.lease_new(&chunk, worker_id, credential_id, now).await?,
            };

            match job {
                Some(job) => {
                    info!(
                        "🚀 Leased chunk {} of {} to {} (job {}, attempt {})",
                        chunk.index,
                        chunk.video_id,
                        worker_id,
                        job.id,
                        job.attempts + 1
                    );
                    return Ok(Some(Lease {
                        job,
                        chunk,
                        credential,
                    }));
                }
                None => {
                    self.return_chunk(chunk.id, worker_id).await?;
                    if let Some(credential) = &credential {
                        self.credentials.refund(&credential.id, now).await?;
                    }
                }
            }
        }

        Ok(None)
    }

    async fn lease_queued(
        &self,
        job_id: Uuid,
        worker_id: &str,
        credential_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingJob>> {
        let patch = JobPatch::new()
            .lease_expires_at(Some(now + self.lease_ttl))
            .not_before(None)
            .worker_id(Some(worker_id.to_string()))
            .credential_id(credential_id);
        match self
            .machine
            .transition_job(job_id, JobStatus::Queued, JobStatus::Leased, worker_id, patch)
            .await
        {
            Ok(job) => Ok(Some(job)),
            Err(PipelineError::StaleState { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lease_new(
        &self,
        chunk: &Chunk,
        worker_id: &str,
        credential_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingJob>> {
        let job = ProcessingJob::leased(chunk, worker_id, credential_id, now, self.lease_ttl);
        match self.store.insert_job(job).await? {
            CasOutcome::Applied(job) => {
                self.machine.record_job_created(&job, worker_id).await?;
                Ok(Some(job))
            }
            CasOutcome::Rejected(active) => {
                warn!(
                    "Chunk {} already has active job {}, not creating another",
                    chunk.id, active.id
                );
                Ok(None)
            }
        }
    }

    async fn return_chunk(&self, chunk_id: Uuid, executor: &str) -> Result<()> {
        self.machine
            .transition_chunk(chunk_id, ChunkState::Processing, ChunkState::Pending, executor)
            .await
            .map(|_| ())
    }

    /// Accept a worker's segments and make the chunk review-ready
    ///
    /// A result that fails validation is handled as a malformed response.
    pub async fn complete(
        &self,
        job_id: Uuid,
        segments: Vec<RawSegment>,
        worker_id: &str,
    ) -> Result<JobOutcome> {
        let Some(job) = self.leased_to(job_id, worker_id).await? else {
            return Ok(JobOutcome::Stale);
        };
        let chunk = self
            .store
            .get_chunk(job.chunk_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("chunk", job.chunk_id))?;

        let staged = match self.merger.prepare(&chunk, &segments, Some(job.id)) {
            Ok(staged) => staged,
            Err(e @ PipelineError::InvalidSegments { .. }) => {
                warn!("⚠️ Job {} returned unusable segments: {}", job.id, e);
                return self
                    .handle_failure(job, WorkerFailure::MalformedResponse(e.to_string()), worker_id)
                    .await;
            }
            Err(e) => return Err(e),
        };
        let count = staged.len();

        // The job CAS decides between a late completion and the lease sweeper
        let patch = JobPatch::new().lease_expires_at(None).last_error(None);
        match self
            .machine
            .transition_job(job.id, JobStatus::Leased, JobStatus::Completed, worker_id, patch)
            .await
        {
            Ok(_) => {}
            Err(PipelineError::StaleState { .. }) => return Ok(JobOutcome::Stale),
            Err(e) => return Err(e),
        }

        let patch = ChunkPatch::new()
            .segments(SegmentWrite::ReplaceAll(staged))
            .bump_version();
        let chunk = match self
            .machine
            .transition_chunk_with(
                chunk.id,
                ChunkState::Processing,
                ChunkState::ReviewReady,
                worker_id,
                Vec::new(),
                patch,
            )
            .await?
        {
            CasOutcome::Applied(chunk) => chunk,
            CasOutcome::Rejected(chunk) => {
                return Err(PipelineError::StaleState {
                    entity: "chunk",
                    id: chunk.id.to_string(),
                    expected: ChunkState::Processing.to_string(),
                    actual: chunk.state.to_string(),
                })
            }
        };

        info!(
            "✅ Job {} completed: chunk {} of {} review-ready with {} segments (v{})",
            job.id, chunk.index, chunk.video_id, count, chunk.sync_version
        );
        Ok(JobOutcome::Completed {
            job_id: job.id,
            chunk_id: chunk.id,
            sync_version: chunk.sync_version,
        })
    }

    /// Record a typed worker failure and retry or escalate
    pub async fn fail(
        &self,
        job_id: Uuid,
        failure: WorkerFailure,
        worker_id: &str,
    ) -> Result<JobOutcome> {
        match self.leased_to(job_id, worker_id).await? {
            Some(job) => self.handle_failure(job, failure, worker_id).await,
            None => Ok(JobOutcome::Stale),
        }
    }

    /// Job if it is still leased to `worker_id`
    async fn leased_to(&self, job_id: Uuid, worker_id: &str) -> Result<Option<ProcessingJob>> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;

        if job.status != JobStatus::Leased || job.worker_id.as_deref() != Some(worker_id) {
            debug!(
                "Ignoring report for job {} from {}: status {}, leased to {:?}",
                job_id, worker_id, job.status, job.worker_id
            );
            return Ok(None);
        }
        Ok(Some(job))
    }

    async fn handle_failure(
        &self,
        job: ProcessingJob,
        failure: WorkerFailure,
        executor: &str,
    ) -> Result<JobOutcome> {
        let now = self.clock.now();

        if failure == WorkerFailure::QuotaExceeded {
            if let Some(credential_id) = &job.credential_id {
                self.credentials.mark_exhausted(credential_id, now).await?;
            }
        }

        let attempts = job.attempts + u32::from(failure.consumes_attempt());
        let patch = JobPatch::new()
            .attempts(attempts)
            .last_error(Some(failure.to_string()))
            .lease_expires_at(None);
        match self
            .machine
            .transition_job(job.id, JobStatus::Leased, JobStatus::Failed, executor, patch)
            .await
        {
            Ok(_) => {}
            Err(PipelineError::StaleState { .. }) => return Ok(JobOutcome::Stale),
            Err(e) => return Err(e),
        }

        match self.policy.decide(&failure, attempts) {
            RetryDecision::Retry { delay } => {
                let not_before = now + delay;
                let patch = JobPatch::new()
                    .not_before(Some(not_before))
                    .worker_id(None)
                    .credential_id(None);
                self.machine
                    .transition_job(job.id, JobStatus::Failed, JobStatus::Queued, executor, patch)
                    .await?;
                self.return_chunk(job.chunk_id, executor).await?;

                info!(
                    "🔄 Job {} requeued after {} (attempt {}/{}, retry in {}s)",
                    job.id,
                    failure,
                    attempts,
                    self.policy.max_retries(),
                    delay.num_seconds()
                );
                Ok(JobOutcome::Requeued {
                    job_id: job.id,
                    attempts,
                    not_before,
                })
            }
            RetryDecision::GiveUp => {
                let outcome = self
                    .machine
                    .transition_chunk_with(
                        job.chunk_id,
                        ChunkState::Processing,
                        ChunkState::Pending,
                        executor,
                        Vec::new(),
                        ChunkPatch::new().needs_manual_intervention(true),
                    )
                    .await?;
                if !outcome.is_applied() {
                    warn!("Chunk {} changed while escalating job {}", job.chunk_id, job.id);
                }

                let reason = failure.to_string();
                self.store
                    .push_alert(OperatorAlert {
                        id: Uuid::new_v4(),
                        job_id: job.id,
                        chunk_id: job.chunk_id,
                        video_id: job.video_id.clone(),
                        reason: reason.clone(),
                        attempts,
                        raised_at: now,
                        resolved: false,
                    })
                    .await?;

                error!(
                    "❌ Job {} failed for good after {} attempt(s): {}. Chunk {} needs an operator",
                    job.id, attempts, reason, job.chunk_id
                );
                Ok(JobOutcome::Failed {
                    job_id: job.id,
                    attempts,
                    reason,
                })
            }
        }
    }

    /// Treat every expired lease as a failed attempt
    ///
    /// Safe to run concurrently with itself and with late worker reports:
    /// each job leaves `LEASED` at most once.
    pub async fn reclaim_expired(&self) -> Result<ReclaimReport> {
        let now = self.clock.now();
        let mut report = ReclaimReport::default();

        let expired: Vec<ProcessingJob> = self
            .store
            .list_jobs(Some(JobStatus::Leased))
            .await?
            .into_iter()
            .filter(|job| job.lease_expired(now))
            .collect();

        for job in expired {
            warn!(
                "⏰ Lease on job {} held by {:?} expired at {:?}",
                job.id, job.worker_id, job.lease_expires_at
            );
            match self
                .handle_failure(job, WorkerFailure::LeaseExpired, LEASE_SWEEPER)
                .await?
            {
                JobOutcome::Requeued { .. } => report.requeued += 1,
                JobOutcome::Failed { .. } => report.failed += 1,
                JobOutcome::Stale | JobOutcome::Completed { .. } => report.skipped += 1,
            }
        }

        report.orphans = self.recover_orphans().await?;

        if report.total() > 0 {
            info!(
                "🧹 Lease sweep: {} requeued, {} escalated, {} already handled, {} orphaned chunk(s) recovered",
                report.requeued, report.failed, report.skipped, report.orphans
            );
        }
        Ok(report)
    }

    /// Return `PROCESSING` chunks that have had no leased job for a full lease TTL
    ///
    /// A crash between the job update and the chunk update of a retry leaves
    /// the chunk stranded this way. Both the chunk and its latest job must be
    /// idle for a lease TTL, which keeps the sweep away from a lease being
    /// created and from a failure being handled right now. A stranded chunk
    /// whose last job ended `FAILED` goes to an operator instead of the queue.
    async fn recover_orphans(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut recovered = 0;

        for chunk in self.store.list_chunks(Some(ChunkState::Processing)).await? {
            if chunk.updated_at + self.lease_ttl > now {
                continue;
            }
            let latest = self.store.jobs_for_chunk(chunk.id).await?.into_iter().last();
            if let Some(job) = &latest {
                if job.status == JobStatus::Leased || job.updated_at + self.lease_ttl > now {
                    continue;
                }
            }
            let escalate = latest
                .as_ref()
                .map_or(false, |job| job.status == JobStatus::Failed);

            match self
                .machine
                .transition_chunk_with(
                    chunk.id,
                    ChunkState::Processing,
                    ChunkState::Pending,
                    LEASE_SWEEPER,
                    vec![ChunkCondition::VersionIs(chunk.sync_version)],
                    ChunkPatch::new().needs_manual_intervention(escalate),
                )
                .await
            {
                Ok(CasOutcome::Applied(_)) => {
                    warn!(
                        "🩹 Chunk {} of {} was stuck in PROCESSING without a lease, back to PENDING",
                        chunk.index, chunk.video_id
                    );
                    recovered += 1;
                }
                Ok(CasOutcome::Rejected(_)) | Err(PipelineError::StaleState { .. }) => continue,
                Err(e) => return Err(e),
            }

            if let (true, Some(job)) = (escalate, latest) {
                self.store
                    .push_alert(OperatorAlert {
                        id: Uuid::new_v4(),
                        job_id: job.id,
                        chunk_id: chunk.id,
                        video_id: chunk.video_id.clone(),
                        reason: format!(
                            "failure handling was interrupted: {}",
                            job.last_error.as_deref().unwrap_or("unknown error")
                        ),
                        attempts: job.attempts,
                        raised_at: now,
                        resolved: false,
                    })
                    .await?;
            }
        }
        Ok(recovered)
    }

    /// Put an escalated chunk back into the dispatch pool
    ///
    /// Returns how many open alerts were resolved.
    pub async fn release_for_retry(&self, chunk_id: Uuid, operator: &str) -> Result<usize> {
        if self.store.active_job_for_chunk(chunk_id).await?.is_some() {
            return Err(PipelineError::DuplicateActiveJob { chunk_id });
        }

        let outcome = self
            .store
            .update_chunk(
                chunk_id,
                &[ChunkCondition::StateIs(ChunkState::Pending)],
                ChunkPatch::new()
                    .needs_manual_intervention(false)
                    .at(self.clock.now()),
            )
            .await?;
        let chunk = match outcome {
            CasOutcome::Applied(chunk) => chunk,
            CasOutcome::Rejected(chunk) => {
                return Err(PipelineError::StaleState {
                    entity: "chunk",
                    id: chunk_id.to_string(),
                    expected: ChunkState::Pending.to_string(),
                    actual: chunk.state.to_string(),
                })
            }
        };

        let resolved = self.store.resolve_alerts(chunk_id).await?;
        let record = AuditRecord::new(
            EntityKind::Chunk,
            chunk_id,
            "release_for_retry",
            operator,
            self.clock.now(),
        )
        .with_detail(format!("{} alert(s) resolved", resolved));
        self.store.append_audit(record).await?;

        info!(
            "🔓 Chunk {} of {} released for retry by {}",
            chunk.index, chunk.video_id, operator
        );
        Ok(resolved)
    }

    pub async fn open_alerts(&self) -> Result<Vec<OperatorAlert>> {
        Ok(self
            .store
            .list_alerts()
            .await?
            .into_iter()
            .filter(|alert| !alert.resolved)
            .collect())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for job in self.store.list_jobs(None).await? {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Leased => stats.leased += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::storage::MemoryStore;
    use vidpair_core::ManualClock;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        scheduler: JobScheduler,
    }

    async fn fixture(chunks: u32, config: Config) -> (Fixture, Vec<Chunk>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let scheduler = JobScheduler::new(store.clone(), clock.clone(), &config);

        let mut created = Vec::new();
        for index in 0..chunks {
            let start = index as f64 * 290.0;
            let chunk = Chunk::new("vid", index, start, start + 300.0, "a.wav", clock.now());
            store.insert_chunk(chunk.clone()).await.unwrap();
            created.push(chunk);
        }
        (Fixture { store, clock, scheduler }, created)
    }

    #[tokio::test]
    async fn test_acquire_is_fifo_by_index() {
        let (f, chunks) = fixture(3, Config::default()).await;

        let first = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        let second = f.scheduler.acquire_next("w2").await.unwrap().unwrap();
        assert_eq!(first.chunk.id, chunks[0].id);
        assert_eq!(second.chunk.id, chunks[1].id);
        assert_eq!(first.job.status, JobStatus::Leased);
        assert_eq!(first.chunk.state, ChunkState::Processing);
    }

    #[tokio::test]
    async fn test_acquire_returns_none_when_idle() {
        let (f, _) = fixture(1, Config::default()).await;
        assert!(f.scheduler.acquire_next("w1").await.unwrap().is_some());
        assert!(f.scheduler.acquire_next("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_stages_segments() {
        let (f, chunks) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        let outcome = f
            .scheduler
            .complete(lease.job.id, vec![RawSegment::new("xin chào", 0.0, 2.0)], "w1")
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { sync_version: 1, .. }));

        let chunk = f.store.get_chunk(chunks[0].id).await.unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::ReviewReady);
        assert_eq!(f.store.current_segments(chunk.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_from_other_worker_is_stale() {
        let (f, _) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        let outcome = f.scheduler.complete(lease.job.id, Vec::new(), "w2").await.unwrap();
        assert_eq!(outcome, JobOutcome::Stale);
    }

    #[tokio::test]
    async fn test_malformed_result_is_retried() {
        let (f, chunks) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        let outcome = f
            .scheduler
            .complete(lease.job.id, vec![RawSegment::new("bad", 5.0, 1.0)], "w1")
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Requeued { attempts: 1, .. }));

        let chunk = f.store.get_chunk(chunks[0].id).await.unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::Pending);
    }

    #[tokio::test]
    async fn test_backoff_delays_redispatch() {
        let (f, _) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        let outcome = f.scheduler.fail(lease.job.id, WorkerFailure::Timeout, "w1").await.unwrap();
        let JobOutcome::Requeued { not_before, .. } = outcome else {
            panic!("expected requeue, got {:?}", outcome);
        };
        assert_eq!(not_before, f.clock.now() + Duration::seconds(60));

        assert!(f.scheduler.acquire_next("w1").await.unwrap().is_none());
        f.clock.advance(Duration::seconds(60));
        let again = f.scheduler.acquire_next("w2").await.unwrap().unwrap();
        assert_eq!(again.job.id, lease.job.id);
        assert_eq!(again.job.attempts, 1);
        assert_eq!(again.job.worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_fatal_error_escalates_immediately() {
        let (f, chunks) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        let outcome = f
            .scheduler
            .fail(lease.job.id, WorkerFailure::FatalInputError("no audio".into()), "w1")
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { attempts: 1, .. }));

        let chunk = f.store.get_chunk(chunks[0].id).await.unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::Pending);
        assert!(chunk.needs_manual_intervention);
        assert_eq!(f.scheduler.open_alerts().await.unwrap().len(), 1);
        assert!(f.scheduler.acquire_next("w1").await.unwrap().is_none());

        assert_eq!(f.scheduler.release_for_retry(chunks[0].id, "ops").await.unwrap(), 1);
        assert!(f.scheduler.open_alerts().await.unwrap().is_empty());
        let retried = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        assert_ne!(retried.job.id, lease.job.id);
    }

    #[tokio::test]
    async fn test_release_refuses_chunk_with_active_job() {
        let (f, chunks) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        f.scheduler.fail(lease.job.id, WorkerFailure::Timeout, "w1").await.unwrap();

        let err = f.scheduler.release_for_retry(chunks[0].id, "ops").await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateActiveJob { .. }));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let config = ConfigBuilder::new().with_max_retries(2).with_backoff(0, 0).build();
        let (f, _) = fixture(1, config).await;

        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        let first = f.scheduler.fail(lease.job.id, WorkerFailure::Timeout, "w1").await.unwrap();
        assert!(matches!(first, JobOutcome::Requeued { attempts: 1, .. }));

        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        let second = f.scheduler.fail(lease.job.id, WorkerFailure::Timeout, "w1").await.unwrap();
        assert!(matches!(second, JobOutcome::Failed { attempts: 2, .. }));

        let job = f.store.get_job(lease.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_quota_rotates_credential_without_using_an_attempt() {
        let config = ConfigBuilder::new()
            .with_credential("key-a", "sk-a", None)
            .with_credential("key-b", "sk-b", None)
            .build();
        let (f, _) = fixture(1, config.clone()).await;
        f.scheduler
            .credentials()
            .register(&config.credentials.keys, f.clock.now())
            .await
            .unwrap();

        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        assert_eq!(lease.credential.as_ref().unwrap().id, "key-a");

        let outcome = f
            .scheduler
            .fail(lease.job.id, WorkerFailure::QuotaExceeded, "w1")
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Requeued { attempts: 0, .. }));

        let retry = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        assert_eq!(retry.job.id, lease.job.id);
        assert_eq!(retry.credential.as_ref().unwrap().id, "key-b");
    }

    #[tokio::test]
    async fn test_no_dispatch_when_all_credentials_exhausted() {
        let config = ConfigBuilder::new().with_credential("only", "sk", Some(1)).build();
        let (f, _) = fixture(2, config.clone()).await;
        f.scheduler
            .credentials()
            .register(&config.credentials.keys, f.clock.now())
            .await
            .unwrap();

        assert!(f.scheduler.acquire_next("w1").await.unwrap().is_some());
        assert!(f.scheduler.acquire_next("w2").await.unwrap().is_none());
        assert_eq!(f.store.list_chunks(Some(ChunkState::Pending)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_stranded_with_queued_job_is_recovered() {
        let (f, chunks) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        // Retry path interrupted after the job was requeued but before the chunk followed
        let machine = StateMachine::new(f.store.clone(), f.clock.clone());
        machine
            .transition_job(lease.job.id, JobStatus::Leased, JobStatus::Failed, "w1", JobPatch::new())
            .await
            .unwrap();
        machine
            .transition_job(
                lease.job.id,
                JobStatus::Failed,
                JobStatus::Queued,
                "w1",
                JobPatch::new().worker_id(None),
            )
            .await
            .unwrap();

        // Too fresh to touch: this could be a retry still in flight
        assert_eq!(f.scheduler.reclaim_expired().await.unwrap().orphans, 0);
        assert_eq!(
            f.store.get_chunk(chunks[0].id).await.unwrap().unwrap().state,
            ChunkState::Processing
        );

        f.clock.advance(Duration::seconds(901));
        let report = f.scheduler.reclaim_expired().await.unwrap();
        assert_eq!(report.orphans, 1);
        assert_eq!(report.requeued, 0);

        let retry = f.scheduler.acquire_next("w2").await.unwrap().unwrap();
        assert_eq!(retry.chunk.id, chunks[0].id);
        assert_eq!(retry.job.id, lease.job.id);
    }

    #[tokio::test]
    async fn test_chunk_stranded_with_failed_job_goes_to_operator() {
        let (f, chunks) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        let machine = StateMachine::new(f.store.clone(), f.clock.clone());
        machine
            .transition_job(
                lease.job.id,
                JobStatus::Leased,
                JobStatus::Failed,
                "w1",
                JobPatch::new().last_error(Some("fatal input error: gone".to_string())),
            )
            .await
            .unwrap();

        f.clock.advance(Duration::seconds(901));
        assert_eq!(f.scheduler.reclaim_expired().await.unwrap().orphans, 1);

        let chunk = f.store.get_chunk(chunks[0].id).await.unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::Pending);
        assert!(chunk.needs_manual_intervention);
        let alerts = f.scheduler.open_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].job_id, lease.job.id);
        assert!(f.scheduler.acquire_next("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_requeues_exactly_once() {
        let (f, _) = fixture(1, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();

        f.clock.advance(Duration::seconds(901));
        let (a, b) = tokio::join!(f.scheduler.reclaim_expired(), f.scheduler.reclaim_expired());
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.requeued + b.requeued, 1);

        let job = f.store.get_job(lease.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));

        // The vanished worker reporting late changes nothing
        let late = f.scheduler.complete(lease.job.id, Vec::new(), "w1").await.unwrap();
        assert_eq!(late, JobOutcome::Stale);
    }

    #[tokio::test]
    async fn test_stats_count_by_status() {
        let (f, _) = fixture(2, Config::default()).await;
        let lease = f.scheduler.acquire_next("w1").await.unwrap().unwrap();
        f.scheduler.acquire_next("w2").await.unwrap().unwrap();
        f.scheduler.complete(lease.job.id, Vec::new(), "w1").await.unwrap();

        let stats = f.scheduler.stats().await.unwrap();
        assert_eq!(stats, QueueStats { queued: 0, leased: 1, completed: 1, failed: 0 });
    }
}
