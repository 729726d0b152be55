use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;
use vidpair_core::{
    Chunk, ChunkState, JobStatus, PipelineError, ProcessingJob, Result, Segment, Video,
};

use super::{CasOutcome, ChunkCondition, ChunkPatch, JobPatch, SegmentWrite, Store};
use crate::audit::AuditRecord;
use crate::review::ConflictArtifact;
use crate::scheduler::credentials::Credential;
use crate::scheduler::OperatorAlert;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    videos: BTreeMap<String, Video>,
    chunks: HashMap<Uuid, Chunk>,
    jobs: HashMap<Uuid, ProcessingJob>,
    /// Segment rows keyed by chunk, append-only
    segments: HashMap<Uuid, Vec<Segment>>,
    credentials: BTreeMap<String, Credential>,
    audit: Vec<AuditRecord>,
    conflicts: Vec<ConflictArtifact>,
    alerts: Vec<OperatorAlert>,
}

/// In-process reference store
///
/// Every conditional update runs under a single write guard, which gives the
/// same all-or-nothing behaviour a relational `UPDATE ... WHERE` provides.
/// The tables can be written to and reloaded from a JSON snapshot. A store
/// opened with [`MemoryStore::open`] holds an exclusive lock next to the
/// snapshot for as long as any clone of it lives, so a second process cannot
/// work on the same file.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    snapshot_path: Option<PathBuf>,
    /// Held for the store's lifetime; the OS releases it when the file closes
    lock_file: Option<Arc<File>>,
    /// One snapshot write at a time
    save_guard: Arc<Mutex<()>>,
    read_only: bool,
}

/// Sibling file carrying the process lock for a snapshot
pub fn lock_path(snapshot_path: &Path) -> PathBuf {
    let mut name = snapshot_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    snapshot_path.with_file_name(name)
}

fn acquire_process_lock(snapshot_path: &Path) -> Result<File> {
    if let Some(parent) = snapshot_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let path = lock_path(snapshot_path);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    FileExt::try_lock_exclusive(&file).map_err(|e| {
        PipelineError::Storage(format!(
            "snapshot {} is in use by another process ({}): {}",
            snapshot_path.display(),
            path.display(),
            e
        ))
    })?;
    Ok(file)
}

async fn load_tables(snapshot_path: &Path) -> Result<Tables> {
    if fs::try_exists(snapshot_path).await? {
        let content = fs::read_to_string(snapshot_path).await?;
        let tables: Tables = serde_json::from_str(&content)?;
        info!(
            "📊 Loaded store snapshot {} ({} videos, {} chunks, {} jobs)",
            snapshot_path.display(),
            tables.videos.len(),
            tables.chunks.len(),
            tables.jobs.len()
        );
        Ok(tables)
    } else {
        debug!("📁 No snapshot at {}, starting empty", snapshot_path.display());
        Ok(Tables::default())
    }
}

impl MemoryStore {
    /// Create an empty store with no snapshot file
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a snapshot file, loading it if it exists
    ///
    /// Fails fast with a storage error when another process has the snapshot open.
    pub async fn open(snapshot_path: PathBuf) -> Result<Self> {
        let lock_file = acquire_process_lock(&snapshot_path)?;
        let tables = load_tables(&snapshot_path).await?;

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            snapshot_path: Some(snapshot_path),
            lock_file: Some(Arc::new(lock_file)),
            save_guard: Arc::new(Mutex::new(())),
            read_only: false,
        })
    }

    /// Load a snapshot for inspection without taking the process lock
    ///
    /// The result may be behind a running worker and can never be saved.
    pub async fn open_read_only(snapshot_path: PathBuf) -> Result<Self> {
        let tables = load_tables(&snapshot_path).await?;
        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            snapshot_path: Some(snapshot_path),
            lock_file: None,
            save_guard: Arc::new(Mutex::new(())),
            read_only: true,
        })
    }

    /// Write the snapshot file this store was opened with
    pub async fn save(&self) -> Result<()> {
        if self.read_only {
            return Err(PipelineError::Storage(
                "store was opened read-only".to_string(),
            ));
        }
        match &self.snapshot_path {
            Some(path) => self.save_to(path).await,
            None => Err(PipelineError::Storage(
                "store was created without a snapshot path".to_string(),
            )),
        }
    }

    /// Write a snapshot of all tables to `path`
    ///
    /// The file is written beside the target and renamed over it, so a crash
    /// mid-write leaves the previous snapshot intact.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        let _guard = self.save_guard.lock().await;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let json_content = {
            let tables = self.tables.read().await;
            serde_json::to_string_pretty(&*tables)?
        };
        let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);
        fs::write(&temp_path, json_content).await?;
        fs::rename(&temp_path, path).await?;
        debug!("💾 Store snapshot written to {}", path.display());
        Ok(())
    }
}

/// Every revision must replace a distinct current row
fn validate_revisions(chunk_id: Uuid, existing: &[Segment], revisions: &[Segment]) -> Result<()> {
    let current: HashSet<Uuid> = existing
        .iter()
        .filter(|s| !s.superseded)
        .map(|s| s.id)
        .collect();
    let mut targeted = HashSet::new();
    for revision in revisions {
        if let Some(target) = revision.supersedes {
            if !current.contains(&target) {
                return Err(PipelineError::not_found("current segment", target));
            }
            if !targeted.insert(target) {
                return Err(PipelineError::InvalidSegments {
                    chunk_id,
                    detail: format!("segment {} revised twice in one write", target),
                });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_video(&self, video: Video) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.videos.contains_key(&video.id) {
            return Err(PipelineError::Storage(format!("video {} already exists", video.id)));
        }
        tables.videos.insert(video.id.clone(), video);
        Ok(())
    }

    async fn register_video(&self, video: Video, chunks: Vec<Chunk>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.videos.contains_key(&video.id) {
            return Err(PipelineError::Storage(format!("video {} already exists", video.id)));
        }
        let mut indices = HashSet::new();
        for chunk in &chunks {
            let taken = !indices.insert(chunk.index)
                || tables.chunks.contains_key(&chunk.id)
                || tables
                    .chunks
                    .values()
                    .any(|c| c.video_id == video.id && c.index == chunk.index);
            if chunk.video_id != video.id || taken {
                return Err(PipelineError::Storage(format!(
                    "chunk {} cannot be registered for video {}",
                    chunk.index, video.id
                )));
            }
        }

        for chunk in chunks {
            tables.chunks.insert(chunk.id, chunk);
        }
        tables.videos.insert(video.id.clone(), video);
        Ok(())
    }

    async fn get_video(&self, id: &str) -> Result<Option<Video>> {
        Ok(self.tables.read().await.videos.get(id).cloned())
    }

    async fn list_videos(&self) -> Result<Vec<Video>> {
        Ok(self.tables.read().await.videos.values().cloned().collect())
    }

    async fn insert_chunk(&self, chunk: Chunk) -> Result<()> {
        let mut tables = self.tables.write().await;
        let duplicate_index = tables
            .chunks
            .values()
            .any(|c| c.video_id == chunk.video_id && c.index == chunk.index);
        if duplicate_index || tables.chunks.contains_key(&chunk.id) {
            return Err(PipelineError::Storage(format!(
                "chunk {} of video {} already exists",
                chunk.index, chunk.video_id
            )));
        }
        tables.chunks.insert(chunk.id, chunk);
        Ok(())
    }

    async fn get_chunk(&self, id: Uuid) -> Result<Option<Chunk>> {
        Ok(self.tables.read().await.chunks.get(&id).cloned())
    }

    async fn chunks_for_video(&self, video_id: &str) -> Result<Vec<Chunk>> {
        let tables = self.tables.read().await;
        let mut chunks: Vec<Chunk> = tables
            .chunks
            .values()
            .filter(|c| c.video_id == video_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    async fn list_chunks(&self, state: Option<ChunkState>) -> Result<Vec<Chunk>> {
        let tables = self.tables.read().await;
        let mut chunks: Vec<Chunk> = tables
            .chunks
            .values()
            .filter(|c| state.map_or(true, |s| c.state == s))
            .cloned()
            .collect();
        chunks.sort_by(|a, b| a.video_id.cmp(&b.video_id).then(a.index.cmp(&b.index)));
        Ok(chunks)
    }

    async fn update_chunk(
        &self,
        id: Uuid,
        conditions: &[ChunkCondition],
        patch: ChunkPatch,
    ) -> Result<CasOutcome<Chunk>> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let chunk = tables
            .chunks
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("chunk", id))?;
        if !conditions.iter().all(|condition| condition.holds(chunk)) {
            return Ok(CasOutcome::Rejected(chunk.clone()));
        }

        let rows = tables.segments.entry(id).or_default();
        match &patch.segments {
            Some(SegmentWrite::ReplaceAll(segments)) => {
                for row in rows.iter_mut() {
                    row.superseded = true;
                }
                rows.extend(segments.iter().cloned());
            }
            Some(SegmentWrite::Revise(revisions)) => {
                validate_revisions(id, rows, revisions)?;
                for revision in revisions {
                    if let Some(target) = revision.supersedes {
                        if let Some(row) = rows.iter_mut().find(|s| s.id == target) {
                            row.superseded = true;
                        }
                    }
                }
                rows.extend(revisions.iter().cloned());
            }
            None => {}
        }

        patch.apply_to(chunk, Utc::now());
        Ok(CasOutcome::Applied(chunk.clone()))
    }

    async fn insert_job(&self, job: ProcessingJob) -> Result<CasOutcome<ProcessingJob>> {
        let mut tables = self.tables.write().await;
        if let Some(active) = tables
            .jobs
            .values()
            .find(|j| j.chunk_id == job.chunk_id && j.status.is_active())
        {
            return Ok(CasOutcome::Rejected(active.clone()));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(CasOutcome::Applied(job))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn active_job_for_chunk(&self, chunk_id: Uuid) -> Result<Option<ProcessingJob>> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .values()
            .find(|j| j.chunk_id == chunk_id && j.status.is_active())
            .cloned())
    }

    async fn jobs_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<ProcessingJob>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<ProcessingJob> = tables
            .jobs
            .values()
            .filter(|j| j.chunk_id == chunk_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<ProcessingJob>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<ProcessingJob> = tables
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn update_job(
        &self,
        id: Uuid,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<CasOutcome<ProcessingJob>> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("job", id))?;
        if job.status != expected {
            return Ok(CasOutcome::Rejected(job.clone()));
        }
        patch.apply_to(job, Utc::now());
        Ok(CasOutcome::Applied(job.clone()))
    }

    async fn current_segments(&self, chunk_id: Uuid) -> Result<Vec<Segment>> {
        let tables = self.tables.read().await;
        let mut segments: Vec<Segment> = tables
            .segments
            .get(&chunk_id)
            .map(|rows| rows.iter().filter(|s| !s.superseded).cloned().collect())
            .unwrap_or_default();
        segments.sort_by(|a, b| a.start_secs.total_cmp(&b.start_secs).then(a.id.cmp(&b.id)));
        Ok(segments)
    }

    async fn segment_history(&self, chunk_id: Uuid) -> Result<Vec<Segment>> {
        Ok(self
            .tables
            .read()
            .await
            .segments
            .get(&chunk_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_credential(&self, credential: Credential) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.credentials.contains_key(&credential.id) {
            return Err(PipelineError::Storage(format!(
                "credential {} already exists",
                credential.id
            )));
        }
        tables.credentials.insert(credential.id.clone(), credential);
        Ok(())
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>> {
        Ok(self.tables.read().await.credentials.values().cloned().collect())
    }

    async fn update_credential(
        &self,
        id: &str,
        expected_revision: u64,
        mut credential: Credential,
    ) -> Result<CasOutcome<Credential>> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .credentials
            .get_mut(id)
            .ok_or_else(|| PipelineError::not_found("credential", id))?;
        if stored.revision != expected_revision {
            return Ok(CasOutcome::Rejected(stored.clone()));
        }
        credential.revision = expected_revision + 1;
        *stored = credential;
        Ok(CasOutcome::Applied(stored.clone()))
    }

    async fn append_audit(&self, mut record: AuditRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        record.sequence = tables.audit.len() as u64 + 1;
        tables.audit.push(record);
        Ok(())
    }

    async fn audit_log(&self, entity_id: Option<&str>) -> Result<Vec<AuditRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .audit
            .iter()
            .filter(|r| entity_id.map_or(true, |id| r.entity_id == id))
            .cloned()
            .collect())
    }

    async fn save_conflict(&self, artifact: ConflictArtifact) -> Result<()> {
        self.tables.write().await.conflicts.push(artifact);
        Ok(())
    }

    async fn conflicts_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<ConflictArtifact>> {
        let tables = self.tables.read().await;
        Ok(tables
            .conflicts
            .iter()
            .filter(|c| c.chunk_id == chunk_id)
            .cloned()
            .collect())
    }

    async fn push_alert(&self, alert: OperatorAlert) -> Result<()> {
        self.tables.write().await.alerts.push(alert);
        Ok(())
    }

    async fn list_alerts(&self) -> Result<Vec<OperatorAlert>> {
        Ok(self.tables.read().await.alerts.clone())
    }

    async fn flush(&self) -> Result<()> {
        if self.snapshot_path.is_some() && !self.read_only {
            self.save().await?;
        }
        Ok(())
    }

    async fn resolve_alerts(&self, chunk_id: Uuid) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let mut resolved = 0;
        for alert in tables
            .alerts
            .iter_mut()
            .filter(|a| a.chunk_id == chunk_id && !a.resolved)
        {
            alert.resolved = true;
            resolved += 1;
        }
        Ok(resolved)
    }
}
