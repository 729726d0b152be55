//! Review locks and conflict-checked review commits
//!
//! Two layers work together here. The lock (holder + expiry on the chunk)
//! keeps two reviewers from editing at the same time. `sync_version` decides
//! whether a commit may land: if the segments changed since the lock was
//! taken, the commit becomes a conflict and the edits are kept aside.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vidpair_core::{
    Chunk, ChunkState, Clock, PipelineError, Result, ReviewLock, Segment, SegmentReviewStatus,
};

use crate::audit::{AuditRecord, EntityKind};
use crate::config::ReviewConfig;
use crate::state::StateMachine;
use crate::storage::{CasOutcome, ChunkCondition, ChunkPatch, SegmentWrite, Store};

/// Executor name recorded for lock expiry in the audit log
pub const LOCK_SWEEPER: &str = "lock-sweeper";

const MAX_LOCK_ATTEMPTS: usize = 8;

/// Proof of a granted review lock, carrying the version the reviewer saw
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockToken {
    pub chunk_id: Uuid,
    pub reviewer: String,
    pub sync_version: u64,
    pub expires_at: DateTime<Utc>,
}

/// One reviewer change to a segment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SegmentEdit {
    pub segment_id: Uuid,
    pub transcript: Option<String>,
    pub translation: Option<String>,
    pub status: Option<SegmentReviewStatus>,
}

impl SegmentEdit {
    pub fn new(segment_id: Uuid) -> Self {
        Self {
            segment_id,
            ..Self::default()
        }
    }

    pub fn transcript(mut self, text: impl Into<String>) -> Self {
        self.transcript = Some(text.into());
        self
    }

    pub fn translation(mut self, text: impl Into<String>) -> Self {
        self.translation = Some(text.into());
        self
    }

    pub fn status(mut self, status: SegmentReviewStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Layer `later` over this edit; fields set in `later` win
    fn absorb(&mut self, later: &SegmentEdit) {
        if later.transcript.is_some() {
            self.transcript = later.transcript.clone();
        }
        if later.translation.is_some() {
            self.translation = later.translation.clone();
        }
        if later.status.is_some() {
            self.status = later.status;
        }
    }

    fn apply(&self, segment: &Segment, reviewer: &str, now: DateTime<Utc>) -> Segment {
        let mut revised = segment.revise(reviewer, now);
        if let Some(text) = &self.transcript {
            revised.transcript = text.trim().to_string();
        }
        if let Some(text) = &self.translation {
            revised.translation = text.trim().to_string();
        }
        if let Some(status) = self.status {
            revised.review_status = status;
        }
        revised
    }
}

/// Collapse edits to one per segment, keeping first-seen order
///
/// A segment gets exactly one revision per commit no matter how many edits
/// name it.
pub fn fold_edits(edits: &[SegmentEdit]) -> Vec<SegmentEdit> {
    let mut folded: Vec<SegmentEdit> = Vec::with_capacity(edits.len());
    for edit in edits {
        match folded.iter_mut().find(|e| e.segment_id == edit.segment_id) {
            Some(existing) => existing.absorb(edit),
            None => folded.push(edit.clone()),
        }
    }
    folded
}

/// Where the reviewer sends the chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    /// Save edits and hand the chunk back to the review queue
    SendBack,
}

impl ReviewDecision {
    pub fn target_state(&self) -> ChunkState {
        match self {
            ReviewDecision::Approve => ChunkState::Approved,
            ReviewDecision::Reject => ChunkState::Rejected,
            ReviewDecision::SendBack => ChunkState::ReviewReady,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Applied {
        sync_version: u64,
        state: ChunkState,
        revisions: usize,
    },
    /// The chunk changed underneath the reviewer; nothing was applied
    Conflict {
        artifact_id: Uuid,
        token_version: u64,
        current_version: u64,
    },
}

/// Edits that lost against a reprocess, kept for the re-review
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictArtifact {
    pub id: Uuid,
    pub chunk_id: Uuid,
    pub reviewer: String,
    pub token_version: u64,
    pub current_version: u64,
    pub decision: ReviewDecision,
    pub edits: Vec<SegmentEdit>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReviewLockManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    machine: StateMachine,
    lock_ttl: Duration,
}

impl ReviewLockManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &ReviewConfig) -> Self {
        Self {
            machine: StateMachine::new(store.clone(), clock.clone()),
            lock_ttl: config.lock_ttl(),
            store,
            clock,
        }
    }

    async fn load(&self, chunk_id: Uuid) -> Result<Chunk> {
        self.store
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("chunk", chunk_id))
    }

    /// Grant or renew `reviewer`'s lock on a chunk
    pub async fn acquire_lock(&self, chunk_id: Uuid, reviewer: &str) -> Result<LockToken> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let chunk = self.load(chunk_id).await?;
            let now = self.clock.now();

            if !matches!(chunk.state, ChunkState::ReviewReady | ChunkState::InReview) {
                return Err(PipelineError::NotReviewable {
                    chunk_id,
                    state: chunk.state,
                });
            }
            if let Some(lock) = chunk.active_lock(now) {
                if lock.holder != reviewer {
                    return Err(PipelineError::AlreadyLocked {
                        chunk_id,
                        holder: lock.holder.clone(),
                        expires_at: lock.expires_at,
                    });
                }
            }

            let lock = ReviewLock {
                holder: reviewer.to_string(),
                expires_at: now + self.lock_ttl,
                version: chunk.sync_version,
            };
            let conditions = vec![
                ChunkCondition::LockAvailableTo {
                    reviewer: reviewer.to_string(),
                    now,
                },
                ChunkCondition::VersionIs(chunk.sync_version),
            ];
            let patch = ChunkPatch::new().lock(Some(lock.clone()));

            let outcome = if chunk.state == ChunkState::ReviewReady {
                match self
                    .machine
                    .transition_chunk_with(
                        chunk_id,
                        ChunkState::ReviewReady,
                        ChunkState::InReview,
                        reviewer,
                        conditions,
                        patch,
                    )
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(PipelineError::StaleState { .. }) => continue,
                    Err(e) => return Err(e),
                }
            } else {
                let mut conditions = conditions;
                conditions.insert(0, ChunkCondition::StateIs(ChunkState::InReview));
                let outcome = self.store.update_chunk(chunk_id, &conditions, patch.at(now)).await?;
                if outcome.is_applied() {
                    let record = AuditRecord::new(EntityKind::Chunk, chunk_id, "lock", reviewer, now)
                        .states(Some(ChunkState::InReview), Some(ChunkState::InReview))
                        .with_detail(format!("until {}", lock.expires_at));
                    self.store.append_audit(record).await?;
                }
                outcome
            };

            if let CasOutcome::Applied(chunk) = outcome {
                info!(
                    "🔒 {} locked chunk {} of {} until {} (v{})",
                    reviewer,
                    chunk.index,
                    chunk.video_id,
                    lock.expires_at.format("%H:%M:%S"),
                    chunk.sync_version
                );
                return Ok(LockToken {
                    chunk_id,
                    reviewer: reviewer.to_string(),
                    sync_version: chunk.sync_version,
                    expires_at: lock.expires_at,
                });
            }
            debug!("Lock attempt on chunk {} by {} raced, retrying", chunk_id, reviewer);
        }

        Err(PipelineError::Contention {
            entity: "chunk",
            id: chunk_id.to_string(),
            attempts: MAX_LOCK_ATTEMPTS,
        })
    }

    /// Drop `reviewer`'s lock; calling it again, or after expiry, is harmless
    ///
    /// Returns whether a lock was actually released.
    pub async fn release_lock(&self, chunk_id: Uuid, reviewer: &str) -> Result<bool> {
        let chunk = self.load(chunk_id).await?;
        if chunk.lock.as_ref().map_or(true, |lock| lock.holder != reviewer) {
            debug!("{} holds no lock on chunk {}, nothing to release", reviewer, chunk_id);
            return Ok(false);
        }

        let conditions = vec![ChunkCondition::LockHeldBy(reviewer.to_string())];
        let patch = ChunkPatch::new().lock(None);
        let released = if chunk.state == ChunkState::InReview {
            match self
                .machine
                .transition_chunk_with(
                    chunk_id,
                    ChunkState::InReview,
                    ChunkState::ReviewReady,
                    reviewer,
                    conditions,
                    patch,
                )
                .await
            {
                Ok(outcome) => outcome.is_applied(),
                Err(PipelineError::StaleState { .. }) => false,
                Err(e) => return Err(e),
            }
        } else {
            self.store
                .update_chunk(chunk_id, &conditions, patch.at(self.clock.now()))
                .await?
                .is_applied()
        };

        if released {
            info!("🔓 {} released chunk {}", reviewer, chunk_id);
        }
        Ok(released)
    }

    /// Apply a review if the chunk still has the version the token was issued for
    pub async fn commit_review(
        &self,
        chunk_id: Uuid,
        token: &LockToken,
        edits: Vec<SegmentEdit>,
        decision: ReviewDecision,
    ) -> Result<CommitOutcome> {
        if token.chunk_id != chunk_id {
            return Err(PipelineError::not_found("lock token for chunk", chunk_id));
        }
        let reviewer = token.reviewer.as_str();
        let version = token.sync_version;

        let mut chunk = self.load(chunk_id).await?;
        if chunk.sync_version != version {
            return self.record_conflict(chunk, token, edits, decision).await;
        }

        // The lock expired and was swept; a late commit may still land
        if chunk.state == ChunkState::ReviewReady {
            match self
                .machine
                .transition_chunk_with(
                    chunk_id,
                    ChunkState::ReviewReady,
                    ChunkState::InReview,
                    reviewer,
                    vec![ChunkCondition::VersionIs(version)],
                    ChunkPatch::new(),
                )
                .await
            {
                Ok(CasOutcome::Applied(updated)) => chunk = updated,
                Ok(CasOutcome::Rejected(current)) => {
                    return self.record_conflict(current, token, edits, decision).await
                }
                Err(PipelineError::StaleState { .. }) => chunk = self.load(chunk_id).await?,
                Err(e) => return Err(e),
            }
        }
        if chunk.state != ChunkState::InReview {
            return Err(PipelineError::NotReviewable {
                chunk_id,
                state: chunk.state,
            });
        }

        let now = self.clock.now();
        let current = self.store.current_segments(chunk_id).await?;
        let folded = fold_edits(&edits);
        let mut revisions = Vec::with_capacity(folded.len());
        for edit in &folded {
            let segment = current
                .iter()
                .find(|s| s.id == edit.segment_id)
                .ok_or_else(|| PipelineError::InvalidSegments {
                    chunk_id,
                    detail: format!("segment {} is not a current segment", edit.segment_id),
                })?;
            revisions.push(edit.apply(segment, reviewer, now));
        }
        let revision_count = revisions.len();

        let target = decision.target_state();
        let patch = ChunkPatch::new()
            .lock(None)
            .bump_version()
            .needs_rereview(false)
            .segments(SegmentWrite::Revise(revisions));
        let outcome = self
            .machine
            .transition_chunk_with(
                chunk_id,
                ChunkState::InReview,
                target,
                reviewer,
                vec![ChunkCondition::VersionIs(version)],
                patch,
            )
            .await;

        match outcome {
            Ok(CasOutcome::Applied(chunk)) => {
                info!(
                    "📝 {} committed review of chunk {} of {}: {} ({} edits, v{})",
                    reviewer, chunk.index, chunk.video_id, target, revision_count, chunk.sync_version
                );
                Ok(CommitOutcome::Applied {
                    sync_version: chunk.sync_version,
                    state: chunk.state,
                    revisions: revision_count,
                })
            }
            Ok(CasOutcome::Rejected(current)) => {
                self.record_conflict(current, token, edits, decision).await
            }
            Err(PipelineError::StaleState { .. }) => {
                let current = self.load(chunk_id).await?;
                if current.sync_version != version {
                    self.record_conflict(current, token, edits, decision).await
                } else {
                    Err(PipelineError::NotReviewable {
                        chunk_id,
                        state: current.state,
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn record_conflict(
        &self,
        chunk: Chunk,
        token: &LockToken,
        edits: Vec<SegmentEdit>,
        decision: ReviewDecision,
    ) -> Result<CommitOutcome> {
        let now = self.clock.now();
        let artifact = ConflictArtifact {
            id: Uuid::new_v4(),
            chunk_id: chunk.id,
            reviewer: token.reviewer.clone(),
            token_version: token.sync_version,
            current_version: chunk.sync_version,
            decision,
            edits,
            created_at: now,
        };
        let artifact_id = artifact.id;
        self.store.save_conflict(artifact).await?;

        let holds_lock = chunk
            .lock
            .as_ref()
            .map_or(false, |lock| lock.holder == token.reviewer);
        let flagged = if chunk.state == ChunkState::InReview && holds_lock {
            match self
                .machine
                .transition_chunk_with(
                    chunk.id,
                    ChunkState::InReview,
                    ChunkState::ReviewReady,
                    &token.reviewer,
                    vec![ChunkCondition::LockHeldBy(token.reviewer.clone())],
                    ChunkPatch::new().lock(None).needs_rereview(true),
                )
                .await
            {
                Ok(outcome) => outcome.is_applied(),
                Err(PipelineError::StaleState { .. }) => false,
                Err(e) => return Err(e),
            }
        } else {
            false
        };
        if !flagged {
            self.store
                .update_chunk(
                    chunk.id,
                    &[ChunkCondition::StateIn(vec![
                        ChunkState::ReviewReady,
                        ChunkState::InReview,
                    ])],
                    ChunkPatch::new().needs_rereview(true).at(now),
                )
                .await?;
        }

        let record = AuditRecord::new(EntityKind::Chunk, chunk.id, "commit_review", &token.reviewer, now)
            .failed(format!(
                "conflict: token v{}, chunk v{}, edits kept as {}",
                token.sync_version, chunk.sync_version, artifact_id
            ));
        self.store.append_audit(record).await?;

        warn!(
            "⚠️ Review conflict on chunk {}: {} reviewed v{} but chunk is at v{}",
            chunk.id, token.reviewer, token.sync_version, chunk.sync_version
        );
        Ok(CommitOutcome::Conflict {
            artifact_id,
            token_version: token.sync_version,
            current_version: chunk.sync_version,
        })
    }

    pub async fn pending_conflicts(&self, chunk_id: Uuid) -> Result<Vec<ConflictArtifact>> {
        self.store.conflicts_for_chunk(chunk_id).await
    }

    /// Hand chunks whose lock ran out back to the review queue
    pub async fn sweep_expired_locks(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut swept = 0;
        for chunk in self.store.list_chunks(Some(ChunkState::InReview)).await? {
            if chunk.active_lock(now).is_some() {
                continue;
            }
            match self
                .machine
                .transition_chunk_with(
                    chunk.id,
                    ChunkState::InReview,
                    ChunkState::ReviewReady,
                    LOCK_SWEEPER,
                    vec![ChunkCondition::NoActiveLock { now }],
                    ChunkPatch::new().lock(None),
                )
                .await
            {
                Ok(CasOutcome::Applied(_)) => swept += 1,
                Ok(CasOutcome::Rejected(_)) | Err(PipelineError::StaleState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if swept > 0 {
            info!("🧹 Returned {} chunk(s) with expired review locks", swept);
        }
        Ok(swept)
    }

    /// Chunks a reviewer can pick up now, flagged re-reviews first
    pub async fn review_queue(&self) -> Result<Vec<Chunk>> {
        let now = self.clock.now();
        let mut queue: Vec<Chunk> = self
            .store
            .list_chunks(None)
            .await?
            .into_iter()
            .filter(|c| match c.state {
                ChunkState::ReviewReady => true,
                ChunkState::InReview => c.active_lock(now).is_none(),
                _ => false,
            })
            .collect();
        queue.sort_by(|a, b| {
            b.needs_rereview
                .cmp(&a.needs_rereview)
                .then(a.video_id.cmp(&b.video_id))
                .then(a.index.cmp(&b.index))
        });
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::SegmentMerger;
    use crate::storage::MemoryStore;
    use crate::config::MergeConfig;
    use vidpair_core::{ManualClock, RawSegment};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        locks: ReviewLockManager,
        merger: SegmentMerger,
        chunk: Chunk,
    }

    async fn review_ready() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let locks = ReviewLockManager::new(store.clone(), clock.clone(), &ReviewConfig::default());
        let merger = SegmentMerger::new(store.clone(), clock.clone(), MergeConfig::default());

        let mut chunk = Chunk::new("vid", 0, 0.0, 300.0, "a.wav", clock.now());
        chunk.state = ChunkState::ReviewReady;
        store.insert_chunk(chunk.clone()).await.unwrap();
        let chunk = merger
            .stage(chunk.id, &[RawSegment::new("xin chao", 0.0, 2.0)], "worker")
            .await
            .unwrap();

        Fixture { store, clock, locks, merger, chunk }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_expiry() {
        let f = review_ready().await;

        let token = f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();
        assert_eq!(token.sync_version, 1);

        let err = f.locks.acquire_lock(f.chunk.id, "bob").await.unwrap_err();
        match err {
            PipelineError::AlreadyLocked { holder, expires_at, .. } => {
                assert_eq!(holder, "alice");
                assert_eq!(expires_at, token.expires_at);
            }
            other => panic!("unexpected error: {other}"),
        }

        f.clock.advance(Duration::minutes(31));
        let bob = f.locks.acquire_lock(f.chunk.id, "bob").await.unwrap();
        assert_eq!(bob.reviewer, "bob");
    }

    #[tokio::test]
    async fn test_reacquire_renews() {
        let f = review_ready().await;
        let first = f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();
        f.clock.advance(Duration::minutes(10));
        let second = f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();
        assert!(second.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let f = review_ready().await;
        f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();

        assert!(f.locks.release_lock(f.chunk.id, "alice").await.unwrap());
        assert!(!f.locks.release_lock(f.chunk.id, "alice").await.unwrap());
        assert!(!f.locks.release_lock(f.chunk.id, "bob").await.unwrap());

        let chunk = f.store.get_chunk(f.chunk.id).await.unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::ReviewReady);
        assert!(chunk.lock.is_none());
    }

    #[tokio::test]
    async fn test_commit_applies_revisions() {
        let f = review_ready().await;
        let token = f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();
        let segment = f.store.current_segments(f.chunk.id).await.unwrap().remove(0);

        let outcome = f
            .locks
            .commit_review(
                f.chunk.id,
                &token,
                vec![SegmentEdit::new(segment.id).transcript("xin chào").translation("hello")],
                ReviewDecision::Approve,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Applied { sync_version: 2, state: ChunkState::Approved, revisions: 1 }
        );

        let current = f.store.current_segments(f.chunk.id).await.unwrap();
        assert_eq!(current[0].transcript, "xin chào");
        assert_eq!(current[0].supersedes, Some(segment.id));
        assert_eq!(f.store.segment_history(f.chunk.id).await.unwrap().len(), 2);
        assert!(f.store.get_chunk(f.chunk.id).await.unwrap().unwrap().lock.is_none());
    }

    #[tokio::test]
    async fn test_edits_to_one_segment_make_one_revision() {
        let f = review_ready().await;
        let token = f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();
        let segment = f.store.current_segments(f.chunk.id).await.unwrap().remove(0);

        let outcome = f
            .locks
            .commit_review(
                f.chunk.id,
                &token,
                vec![
                    SegmentEdit::new(segment.id).transcript("xin chào"),
                    SegmentEdit::new(segment.id).translation("hello"),
                ],
                ReviewDecision::Approve,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Applied { sync_version: 2, state: ChunkState::Approved, revisions: 1 }
        );

        let current = f.store.current_segments(f.chunk.id).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].transcript, "xin chào");
        assert_eq!(current[0].translation, "hello");
        assert_eq!(current[0].supersedes, Some(segment.id));
    }

    #[test]
    fn test_fold_edits_later_fields_win() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let folded = fold_edits(&[
            SegmentEdit::new(a).transcript("one"),
            SegmentEdit::new(b).status(SegmentReviewStatus::Rejected),
            SegmentEdit::new(a).transcript("two").translation("hai"),
        ]);

        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0], SegmentEdit::new(a).transcript("two").translation("hai"));
        assert_eq!(folded[1].segment_id, b);
    }

    #[tokio::test]
    async fn test_stale_token_conflicts_and_keeps_edits() {
        let f = review_ready().await;
        let token = f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();
        let segment = f.store.current_segments(f.chunk.id).await.unwrap().remove(0);

        f.merger
            .stage(f.chunk.id, &[RawSegment::new("xin chào bạn", 0.0, 2.5)], "backend")
            .await
            .unwrap();

        let edits = vec![SegmentEdit::new(segment.id).transcript("xin chào")];
        let outcome = f
            .locks
            .commit_review(f.chunk.id, &token, edits.clone(), ReviewDecision::Approve)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Conflict { token_version: 1, current_version: 2, .. }
        ));

        let chunk = f.store.get_chunk(f.chunk.id).await.unwrap().unwrap();
        assert!(chunk.needs_rereview);
        assert_eq!(chunk.state, ChunkState::ReviewReady);
        assert_eq!(chunk.sync_version, 2);
        let current = f.store.current_segments(f.chunk.id).await.unwrap();
        assert_eq!(current[0].transcript, "xin chào bạn");

        let conflicts = f.locks.pending_conflicts(f.chunk.id).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].edits, edits);
    }

    #[tokio::test]
    async fn test_late_commit_after_expiry_still_lands() {
        let f = review_ready().await;
        let token = f.locks.acquire_lock(f.chunk.id, "alice").await.unwrap();

        f.clock.advance(Duration::hours(1));
        assert_eq!(f.locks.sweep_expired_locks().await.unwrap(), 1);

        let outcome = f
            .locks
            .commit_review(f.chunk.id, &token, Vec::new(), ReviewDecision::Reject)
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Applied { state: ChunkState::Rejected, .. }));
    }

    #[tokio::test]
    async fn test_review_queue_puts_rereviews_first() {
        let f = review_ready().await;
        let mut other = Chunk::new("vid", 1, 290.0, 590.0, "b.wav", f.clock.now());
        other.state = ChunkState::ReviewReady;
        f.store.insert_chunk(other.clone()).await.unwrap();

        let token = f.locks.acquire_lock(other.id, "alice").await.unwrap();
        f.merger.stage(other.id, &[], "backend").await.unwrap();
        f.locks
            .commit_review(other.id, &token, Vec::new(), ReviewDecision::Approve)
            .await
            .unwrap();

        let queue = f.locks.review_queue().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].id, other.id);
        assert!(queue[0].needs_rereview);
    }

    #[tokio::test]
    async fn test_cannot_lock_pending_chunk() {
        let f = review_ready().await;
        let pending = Chunk::new("vid", 2, 580.0, 600.0, "c.wav", f.clock.now());
        f.store.insert_chunk(pending.clone()).await.unwrap();

        let err = f.locks.acquire_lock(pending.id, "alice").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotReviewable { .. }));
    }
}
