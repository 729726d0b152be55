use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use vidpair_core::{Chunk, ChunkState, Clock, JobStatus, PipelineError, ProcessingJob, Result};

use crate::audit::{AuditRecord, EntityKind};
use crate::storage::{CasOutcome, ChunkCondition, ChunkPatch, JobPatch, Store};

/// Validates and applies lifecycle transitions for chunks and jobs
///
/// A transition names the state the caller believes the entity is in. The
/// store applies it only if that is still true, so two racing callers can
/// never both move the same entity. Every attempt lands in the audit log.
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Move a chunk from `from` to `to`
    pub async fn transition_chunk(
        &self,
        chunk_id: Uuid,
        from: ChunkState,
        to: ChunkState,
        executor: &str,
    ) -> Result<Chunk> {
        match self
            .transition_chunk_with(chunk_id, from, to, executor, Vec::new(), ChunkPatch::new())
            .await?
        {
            CasOutcome::Applied(chunk) => Ok(chunk),
            // Only the state condition was supplied, so a rejection here is a stale state
            CasOutcome::Rejected(chunk) => Err(stale_chunk(chunk_id, from, chunk.state)),
        }
    }

    /// Move a chunk from `from` to `to` together with extra conditions and field changes
    ///
    /// Returns `StaleState` when the chunk is no longer in `from`, and
    /// `CasOutcome::Rejected` when the state matched but another condition did not.
    pub async fn transition_chunk_with(
        &self,
        chunk_id: Uuid,
        from: ChunkState,
        to: ChunkState,
        executor: &str,
        mut conditions: Vec<ChunkCondition>,
        patch: ChunkPatch,
    ) -> Result<CasOutcome<Chunk>> {
        let now = self.clock.now();
        let record = AuditRecord::new(EntityKind::Chunk, chunk_id, "transition", executor, now)
            .states(Some(from), Some(to));

        if !from.can_transition_to(to) {
            self.store
                .append_audit(record.failed("illegal transition"))
                .await?;
            return Err(PipelineError::IllegalTransition {
                entity: "chunk",
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        conditions.insert(0, ChunkCondition::StateIs(from));
        let outcome = self
            .store
            .update_chunk(chunk_id, &conditions, patch.state(to).at(now))
            .await?;

        match outcome {
            CasOutcome::Applied(chunk) => {
                self.store.append_audit(record).await?;
                debug!("🔁 Chunk {} {} -> {} by {}", chunk_id, from, to, executor);
                Ok(CasOutcome::Applied(chunk))
            }
            CasOutcome::Rejected(chunk) if chunk.state != from => {
                self.store
                    .append_audit(record.failed(format!("stale state, found {}", chunk.state)))
                    .await?;
                Err(stale_chunk(chunk_id, from, chunk.state))
            }
            CasOutcome::Rejected(chunk) => {
                self.store
                    .append_audit(record.failed("precondition not met"))
                    .await?;
                Ok(CasOutcome::Rejected(chunk))
            }
        }
    }

    /// Move a job from `from` to `to`, applying `patch` in the same update
    pub async fn transition_job(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        executor: &str,
        patch: JobPatch,
    ) -> Result<ProcessingJob> {
        let now = self.clock.now();
        let record = AuditRecord::new(EntityKind::Job, job_id, "transition", executor, now)
            .states(Some(from), Some(to));

        if !from.can_transition_to(to) {
            self.store
                .append_audit(record.failed("illegal transition"))
                .await?;
            return Err(PipelineError::IllegalTransition {
                entity: "job",
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        match self.store.update_job(job_id, from, patch.status(to).at(now)).await? {
            CasOutcome::Applied(job) => {
                let record = match &job.last_error {
                    Some(error) if to == JobStatus::Failed => record.with_detail(error.clone()),
                    _ => record,
                };
                self.store.append_audit(record).await?;
                debug!("🔁 Job {} {} -> {} by {}", job_id, from, to, executor);
                Ok(job)
            }
            CasOutcome::Rejected(job) => {
                self.store
                    .append_audit(record.failed(format!("stale state, found {}", job.status)))
                    .await?;
                Err(PipelineError::StaleState {
                    entity: "job",
                    id: job_id.to_string(),
                    expected: from.to_string(),
                    actual: job.status.to_string(),
                })
            }
        }
    }

    /// Record the creation of a job (no previous state)
    pub async fn record_job_created(&self, job: &ProcessingJob, executor: &str) -> Result<()> {
        let record = AuditRecord::new(EntityKind::Job, job.id, "create", executor, self.clock.now())
            .states(None::<JobStatus>, Some(job.status))
            .with_detail(format!("chunk {}", job.chunk_id));
        self.store.append_audit(record).await
    }
}

fn stale_chunk(chunk_id: Uuid, expected: ChunkState, actual: ChunkState) -> PipelineError {
    PipelineError::StaleState {
        entity: "chunk",
        id: chunk_id.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use vidpair_core::SystemClock;

    async fn setup() -> (Arc<MemoryStore>, StateMachine, Chunk) {
        let store = Arc::new(MemoryStore::new());
        let machine = StateMachine::new(store.clone(), Arc::new(SystemClock));
        let chunk = Chunk::new("video", 0, 0.0, 300.0, "a.wav", Utc::now());
        store.insert_chunk(chunk.clone()).await.unwrap();
        (store, machine, chunk)
    }

    #[tokio::test]
    async fn test_transition_applies_and_audits() {
        let (store, machine, chunk) = setup().await;

        let updated = machine
            .transition_chunk(chunk.id, ChunkState::Pending, ChunkState::Processing, "worker-1")
            .await
            .unwrap();
        assert_eq!(updated.state, ChunkState::Processing);

        let log = store.audit_log(Some(&chunk.id.to_string())).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].success);
        assert_eq!(log[0].previous.as_deref(), Some("PENDING"));
        assert_eq!(log[0].new.as_deref(), Some("PROCESSING"));
        assert_eq!(log[0].executor, "worker-1");
    }

    #[tokio::test]
    async fn test_updates_are_stamped_by_the_injected_clock() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(vidpair_core::ManualClock::default());
        let machine = StateMachine::new(store.clone(), clock.clone());
        let chunk = Chunk::new("video", 0, 0.0, 300.0, "a.wav", clock.now());
        store.insert_chunk(chunk.clone()).await.unwrap();

        clock.advance(chrono::Duration::minutes(5));
        let updated = machine
            .transition_chunk(chunk.id, ChunkState::Pending, ChunkState::Processing, "worker-1")
            .await
            .unwrap();
        assert_eq!(updated.updated_at, clock.now());

        let job = ProcessingJob::leased(&updated, "worker-1", None, clock.now(), chrono::Duration::seconds(60));
        store.insert_job(job.clone()).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));
        let job = machine
            .transition_job(job.id, JobStatus::Leased, JobStatus::Completed, "worker-1", JobPatch::new())
            .await
            .unwrap();
        assert_eq!(job.updated_at, clock.now());
    }

    #[tokio::test]
    async fn test_stale_expected_state() {
        let (store, machine, chunk) = setup().await;

        let err = machine
            .transition_chunk(chunk.id, ChunkState::Processing, ChunkState::ReviewReady, "w")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StaleState { .. }));

        let log = store.audit_log(None).await.unwrap();
        assert!(!log[0].success);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_checked_first() {
        let (store, machine, chunk) = setup().await;

        let err = machine
            .transition_chunk(chunk.id, ChunkState::Pending, ChunkState::Approved, "w")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IllegalTransition { .. }));
        assert_eq!(
            store.get_chunk(chunk.id).await.unwrap().unwrap().state,
            ChunkState::Pending
        );
    }

    #[tokio::test]
    async fn test_racing_transitions_only_one_wins() {
        let (_store, machine, chunk) = setup().await;

        let a = machine.transition_chunk(chunk.id, ChunkState::Pending, ChunkState::Processing, "a");
        let b = machine.transition_chunk(chunk.id, ChunkState::Pending, ChunkState::Processing, "b");
        let (a, b) = tokio::join!(a, b);

        assert!(a.is_ok() ^ b.is_ok());
    }

    #[tokio::test]
    async fn test_extra_condition_rejection_is_not_stale() {
        let (_store, machine, chunk) = setup().await;

        let outcome = machine
            .transition_chunk_with(
                chunk.id,
                ChunkState::Pending,
                ChunkState::Processing,
                "w",
                vec![ChunkCondition::VersionIs(7)],
                ChunkPatch::new(),
            )
            .await
            .unwrap();
        assert!(!outcome.is_applied());
    }
}
