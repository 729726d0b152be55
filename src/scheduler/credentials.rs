//! Rotating pool of transcription API credentials with daily quotas

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vidpair_core::{PipelineError, Result};

use crate::audit::{AuditRecord, EntityKind};
use crate::config::CredentialEntry;
use crate::storage::{CasOutcome, Store};

/// Retries of a credential compare-and-set before giving up on this round
const MAX_CAS_ATTEMPTS: usize = 16;

/// Short growing pause after a lost compare-and-set
async fn back_off(attempt: usize) {
    if attempt == 0 {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(std::time::Duration::from_millis(attempt.min(8) as u64)).await;
    }
}

/// An external API credential and its usage in the current day window
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub id: String,
    pub key: String,
    pub daily_limit: Option<u32>,
    pub usage_today: u32,
    pub exhausted: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Start of the day window `usage_today` and `exhausted` refer to
    pub window_start: DateTime<Utc>,
    /// Bumped by the store on every update
    pub revision: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("key", &"***")
            .field("daily_limit", &self.daily_limit)
            .field("usage_today", &self.usage_today)
            .field("exhausted", &self.exhausted)
            .field("last_used_at", &self.last_used_at)
            .field("window_start", &self.window_start)
            .field("revision", &self.revision)
            .finish()
    }
}

impl Credential {
    pub fn new(id: impl Into<String>, key: impl Into<String>, window_start: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            daily_limit: None,
            usage_today: 0,
            exhausted: false,
            last_used_at: None,
            window_start,
            revision: 0,
        }
    }

    pub fn with_daily_limit(mut self, limit: Option<u32>) -> Self {
        self.daily_limit = limit;
        self
    }

    /// This credential as it looks in the window starting at `window_start`
    pub fn in_window(&self, window_start: DateTime<Utc>) -> Self {
        let mut current = self.clone();
        if current.window_start < window_start {
            current.window_start = window_start;
            current.usage_today = 0;
            current.exhausted = false;
        }
        current
    }

    pub fn has_headroom(&self) -> bool {
        !self.exhausted && self.daily_limit.map_or(true, |limit| self.usage_today < limit)
    }
}

/// Credential handed to a worker together with a job
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialLease {
    pub id: String,
    pub key: String,
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .field("key", &"***")
            .finish()
    }
}

/// Start of the daily window containing `now`, windows begin at `reset_hour` UTC
pub fn window_start(now: DateTime<Utc>, reset_hour: u32) -> DateTime<Utc> {
    let reset_hour = reset_hour.min(23);
    let today = now.date_naive();
    let boundary = today
        .and_hms_opt(reset_hour, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    if now.hour() < reset_hour {
        boundary - Duration::days(1)
    } else {
        boundary
    }
}

/// Least-recently-used selection over the credentials kept in the store
#[derive(Clone)]
pub struct CredentialPool {
    store: Arc<dyn Store>,
    reset_hour: u32,
}

impl CredentialPool {
    pub fn new(store: Arc<dyn Store>, reset_hour: u32) -> Self {
        Self { store, reset_hour }
    }

    /// Insert configured credentials that the store does not know yet
    pub async fn register(&self, entries: &[CredentialEntry], now: DateTime<Utc>) -> Result<usize> {
        let known: Vec<String> = self
            .store
            .list_credentials()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut added = 0;
        for entry in entries.iter().filter(|e| !known.contains(&e.id)) {
            let credential = Credential::new(&entry.id, &entry.key, window_start(now, self.reset_hour))
                .with_daily_limit(entry.daily_limit);
            self.store.insert_credential(credential).await?;
            added += 1;
        }
        if added > 0 {
            info!("🔑 Registered {} credential(s)", added);
        }
        Ok(added)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.store.list_credentials().await?.is_empty())
    }

    /// Whether any credential could be handed out at `now`
    pub async fn has_headroom(&self, now: DateTime<Utc>) -> Result<bool> {
        let window = window_start(now, self.reset_hour);
        Ok(self
            .store
            .list_credentials()
            .await?
            .iter()
            .any(|c| c.in_window(window).has_headroom()))
    }

    /// Hand out the least-recently-used credential with headroom and count one use
    ///
    /// `None` means no credential has headroom. Losing every compare-and-set
    /// round is reported as `Contention`, not as an empty pool.
    pub async fn checkout(&self, now: DateTime<Utc>) -> Result<Option<CredentialLease>> {
        let window = window_start(now, self.reset_hour);

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let mut candidates: Vec<(u64, Credential)> = self
                .store
                .list_credentials()
                .await?
                .into_iter()
                .map(|stored| (stored.revision, stored.in_window(window)))
                .filter(|(_, c)| c.has_headroom())
                .collect();
            // Never-used first, then oldest use; id keeps the order total
            candidates.sort_by(|(_, a), (_, b)| {
                a.last_used_at.cmp(&b.last_used_at).then_with(|| a.id.cmp(&b.id))
            });

            let Some((revision, mut chosen)) = candidates.into_iter().next() else {
                return Ok(None);
            };

            chosen.usage_today += 1;
            chosen.last_used_at = Some(now);
            if chosen.daily_limit.map_or(false, |limit| chosen.usage_today >= limit) {
                chosen.exhausted = true;
            }

            let id = chosen.id.clone();
            match self.store.update_credential(&id, revision, chosen).await? {
                CasOutcome::Applied(credential) => {
                    debug!(
                        "🔑 Credential {} checked out ({} used today)",
                        credential.id, credential.usage_today
                    );
                    return Ok(Some(CredentialLease {
                        id: credential.id,
                        key: credential.key,
                    }));
                }
                CasOutcome::Rejected(_) => back_off(attempt).await,
            }
        }

        warn!("Credential pool contention, no credential handed out this round");
        Err(PipelineError::Contention {
            entity: "credential pool",
            id: "checkout".to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Exclude a credential until the next daily reset
    pub async fn mark_exhausted(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let window = window_start(now, self.reset_hour);
        self.modify(id, window, |credential| credential.exhausted = true).await?;
        let record = AuditRecord::new(EntityKind::Credential, id, "exhaust", "scheduler", now)
            .with_detail(format!("excluded until the reset after {}", window));
        self.store.append_audit(record).await?;
        warn!("🚫 Credential {} exhausted until next reset", id);
        Ok(())
    }

    /// Give back a use counted by a checkout that did not lead to a dispatch
    pub async fn refund(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let window = window_start(now, self.reset_hour);
        self.modify(id, window, |credential| {
            credential.usage_today = credential.usage_today.saturating_sub(1);
            if credential.daily_limit.map_or(false, |limit| credential.usage_today < limit) {
                credential.exhausted = false;
            }
        })
        .await
    }

    async fn modify<F>(&self, id: &str, window: DateTime<Utc>, change: F) -> Result<()>
    where
        F: Fn(&mut Credential),
    {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let stored = self
                .store
                .list_credentials()
                .await?
                .into_iter()
                .find(|c| c.id == id)
                .ok_or_else(|| PipelineError::not_found("credential", id))?;

            let revision = stored.revision;
            let mut updated = stored.in_window(window);
            change(&mut updated);
            if self.store.update_credential(id, revision, updated).await?.is_applied() {
                return Ok(());
            }
            back_off(attempt).await;
        }
        Err(PipelineError::Contention {
            entity: "credential",
            id: id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::review::ConflictArtifact;
    use crate::scheduler::{JobScheduler, OperatorAlert};
    use crate::storage::{ChunkCondition, ChunkPatch, JobPatch, MemoryStore};
    use uuid::Uuid;
    use vidpair_core::{Chunk, ChunkState, JobStatus, ManualClock, ProcessingJob, Segment};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, 30, 0).unwrap()
    }

    fn entries() -> Vec<CredentialEntry> {
        vec![
            CredentialEntry { id: "a".into(), key: "ka".into(), daily_limit: None },
            CredentialEntry { id: "b".into(), key: "kb".into(), daily_limit: Some(2) },
        ]
    }

    #[test]
    fn test_window_start_before_and_after_reset() {
        assert_eq!(window_start(at(10), 8), Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap());
        assert_eq!(window_start(at(3), 8), Utc.with_ymd_and_hms(2024, 5, 9, 8, 0, 0).unwrap());
        assert_eq!(window_start(at(0), 0), Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_checkout_rotates_least_recently_used() {
        let pool = CredentialPool::new(Arc::new(MemoryStore::new()), 0);
        pool.register(&entries(), at(9)).await.unwrap();

        let first = pool.checkout(at(9)).await.unwrap().unwrap();
        let second = pool.checkout(at(10)).await.unwrap().unwrap();
        let third = pool.checkout(at(11)).await.unwrap().unwrap();

        assert_eq!(first.id, "a");
        assert_eq!(second.id, "b");
        assert_eq!(third.id, "a");
    }

    #[tokio::test]
    async fn test_daily_limit_and_reset() {
        let store = Arc::new(MemoryStore::new());
        let pool = CredentialPool::new(store.clone(), 0);
        pool.register(&entries()[1..], at(9)).await.unwrap();

        assert!(pool.checkout(at(9)).await.unwrap().is_some());
        assert!(pool.checkout(at(9)).await.unwrap().is_some());
        assert!(pool.checkout(at(9)).await.unwrap().is_none());
        assert!(!pool.has_headroom(at(9)).await.unwrap());

        let next_day = at(9) + Duration::days(1);
        assert!(pool.has_headroom(next_day).await.unwrap());
        let lease = pool.checkout(next_day).await.unwrap().unwrap();
        assert_eq!(lease.id, "b");
        assert_eq!(store.list_credentials().await.unwrap()[0].usage_today, 1);
    }

    #[tokio::test]
    async fn test_exhausted_credential_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let pool = CredentialPool::new(store.clone(), 0);
        pool.register(&entries(), at(9)).await.unwrap();

        pool.mark_exhausted("a", at(9)).await.unwrap();
        for _ in 0..2 {
            assert_eq!(pool.checkout(at(9)).await.unwrap().unwrap().id, "b");
        }
        assert!(pool.checkout(at(9)).await.unwrap().is_none());

        let log = store.audit_log(Some("a")).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].entity, EntityKind::Credential);
        assert_eq!(log[0].operation, "exhaust");
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_never_overspend() {
        let store = Arc::new(MemoryStore::new());
        let pool = CredentialPool::new(store.clone(), 0);
        pool.register(
            &[CredentialEntry { id: "only".into(), key: "k".into(), daily_limit: Some(5) }],
            at(9),
        )
        .await
        .unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.checkout(at(9)).await.unwrap() })
            })
            .collect();
        let results = futures::future::join_all(handles).await;
        let granted = results.into_iter().filter(|r| matches!(r, Ok(Some(_)))).count();

        assert_eq!(granted, 5);
        assert_eq!(store.list_credentials().await.unwrap()[0].usage_today, 5);
    }

    /// Store whose credential updates always lose the compare-and-set
    struct RacingStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl Store for RacingStore {
        async fn insert_video(&self, video: vidpair_core::Video) -> Result<()> {
            self.inner.insert_video(video).await
        }
        async fn register_video(
            &self,
            video: vidpair_core::Video,
            chunks: Vec<Chunk>,
        ) -> Result<()> {
            self.inner.register_video(video, chunks).await
        }
        async fn get_video(&self, id: &str) -> Result<Option<vidpair_core::Video>> {
            self.inner.get_video(id).await
        }
        async fn list_videos(&self) -> Result<Vec<vidpair_core::Video>> {
            self.inner.list_videos().await
        }
        async fn insert_chunk(&self, chunk: Chunk) -> Result<()> {
            self.inner.insert_chunk(chunk).await
        }
        async fn get_chunk(&self, id: Uuid) -> Result<Option<Chunk>> {
            self.inner.get_chunk(id).await
        }
        async fn chunks_for_video(&self, video_id: &str) -> Result<Vec<Chunk>> {
            self.inner.chunks_for_video(video_id).await
        }
        async fn list_chunks(&self, state: Option<ChunkState>) -> Result<Vec<Chunk>> {
            self.inner.list_chunks(state).await
        }
        async fn update_chunk(
            &self,
            id: Uuid,
            conditions: &[ChunkCondition],
            patch: ChunkPatch,
        ) -> Result<CasOutcome<Chunk>> {
            self.inner.update_chunk(id, conditions, patch).await
        }
        async fn insert_job(&self, job: ProcessingJob) -> Result<CasOutcome<ProcessingJob>> {
            self.inner.insert_job(job).await
        }
        async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>> {
            self.inner.get_job(id).await
        }
        async fn active_job_for_chunk(&self, chunk_id: Uuid) -> Result<Option<ProcessingJob>> {
            self.inner.active_job_for_chunk(chunk_id).await
        }
        async fn jobs_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<ProcessingJob>> {
            self.inner.jobs_for_chunk(chunk_id).await
        }
        async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<ProcessingJob>> {
            self.inner.list_jobs(status).await
        }
        async fn update_job(
            &self,
            id: Uuid,
            expected: JobStatus,
            patch: JobPatch,
        ) -> Result<CasOutcome<ProcessingJob>> {
            self.inner.update_job(id, expected, patch).await
        }
        async fn current_segments(&self, chunk_id: Uuid) -> Result<Vec<Segment>> {
            self.inner.current_segments(chunk_id).await
        }
        async fn segment_history(&self, chunk_id: Uuid) -> Result<Vec<Segment>> {
            self.inner.segment_history(chunk_id).await
        }
        async fn insert_credential(&self, credential: Credential) -> Result<()> {
            self.inner.insert_credential(credential).await
        }
        async fn list_credentials(&self) -> Result<Vec<Credential>> {
            self.inner.list_credentials().await
        }
        async fn update_credential(
            &self,
            id: &str,
            _expected_revision: u64,
            _credential: Credential,
        ) -> Result<CasOutcome<Credential>> {
            let stored = self
                .inner
                .list_credentials()
                .await?
                .into_iter()
                .find(|c| c.id == id)
                .ok_or_else(|| PipelineError::not_found("credential", id))?;
            Ok(CasOutcome::Rejected(stored))
        }
        async fn append_audit(&self, record: AuditRecord) -> Result<()> {
            self.inner.append_audit(record).await
        }
        async fn audit_log(&self, entity_id: Option<&str>) -> Result<Vec<AuditRecord>> {
            self.inner.audit_log(entity_id).await
        }
        async fn save_conflict(&self, artifact: ConflictArtifact) -> Result<()> {
            self.inner.save_conflict(artifact).await
        }
        async fn conflicts_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<ConflictArtifact>> {
            self.inner.conflicts_for_chunk(chunk_id).await
        }
        async fn push_alert(&self, alert: OperatorAlert) -> Result<()> {
            self.inner.push_alert(alert).await
        }
        async fn list_alerts(&self) -> Result<Vec<OperatorAlert>> {
            self.inner.list_alerts().await
        }
        async fn resolve_alerts(&self, chunk_id: Uuid) -> Result<usize> {
            self.inner.resolve_alerts(chunk_id).await
        }
    }

    #[tokio::test]
    async fn test_lost_races_are_contention_not_an_empty_pool() {
        let store = Arc::new(RacingStore { inner: MemoryStore::new() });
        let pool = CredentialPool::new(store.clone(), 0);
        pool.register(&entries(), at(9)).await.unwrap();
        assert!(pool.has_headroom(at(9)).await.unwrap());

        let err = pool.checkout(at(9)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Contention { attempts: MAX_CAS_ATTEMPTS, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_acquire_hands_chunk_back_on_credential_contention() {
        let store = Arc::new(RacingStore { inner: MemoryStore::new() });
        let clock = Arc::new(ManualClock::new(at(9)));
        let config = ConfigBuilder::new().with_credential("a", "ka", None).build();
        let scheduler = JobScheduler::new(store.clone(), clock.clone(), &config);
        scheduler
            .credentials()
            .register(&config.credentials.keys, at(9))
            .await
            .unwrap();

        let chunk = Chunk::new("vid", 0, 0.0, 300.0, "a.wav", at(9));
        store.insert_chunk(chunk.clone()).await.unwrap();

        let err = scheduler.acquire_next("w1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Contention { .. }));
        let chunk = store.get_chunk(chunk.id).await.unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::Pending);
        assert!(store.list_jobs(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_debug_hides_key() {
        let credential = Credential::new("a", "sk-secret", at(0));
        assert!(!format!("{:?}", credential).contains("sk-secret"));
    }
}
