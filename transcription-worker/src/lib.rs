use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vidpair_core::{Chunk, ChunkState, PipelineError, RawSegment, WorkerFailure};
use vidpair_pipeline::scheduler::{JobOutcome, JobScheduler, Lease};
use vidpair_pipeline::storage::Store;
use vidpair_pipeline::CredentialLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMode {
    Batch,
    Continuous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    batch_size: usize,
    mode: WorkerMode,
    worker_name: String,
    concurrency: usize,
    dry_run: bool,
    poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            mode: WorkerMode::Batch,
            worker_name: "transcription-worker-1".to_string(),
            concurrency: 1,
            dry_run: false,
            poll_interval_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_concurrency(mut self, tasks: usize) -> Self {
        self.concurrency = tasks.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_worker_name(mut self, name: String) -> Self {
        self.worker_name = name;
        self
    }

    pub fn with_poll_interval(mut self, seconds: u64) -> Self {
        self.poll_interval_secs = seconds;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub chunks_processed: usize,
    pub chunks_requeued: usize,
    pub chunks_failed: usize,
    pub segments_produced: usize,
    pub total_processing_time_secs: f64,
    #[serde(skip)]
    pub started_at: Option<Instant>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            chunks_processed: 0,
            chunks_requeued: 0,
            chunks_failed: 0,
            segments_produced: 0,
            total_processing_time_secs: 0.0,
            started_at: None,
        }
    }
}

/// Failure taxonomy of a transcription backend
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscribeError {
    #[error("API quota exceeded")]
    QuotaExceeded,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Transcription timed out")]
    Timeout,

    #[error("Unusable input: {0}")]
    FatalInput(String),
}

impl From<TranscribeError> for WorkerFailure {
    fn from(error: TranscribeError) -> Self {
        match error {
            TranscribeError::QuotaExceeded => WorkerFailure::QuotaExceeded,
            TranscribeError::MalformedResponse(detail) => WorkerFailure::MalformedResponse(detail),
            TranscribeError::Timeout => WorkerFailure::Timeout,
            TranscribeError::FatalInput(detail) => WorkerFailure::FatalInputError(detail),
        }
    }
}

/// Turns a chunk's audio into chunk-relative segments
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(
        &self,
        chunk: &Chunk,
        credential: Option<&CredentialLease>,
    ) -> std::result::Result<Vec<RawSegment>, TranscribeError>;
}

/// Replays transcripts that were produced elsewhere
///
/// For a chunk whose audio is `audio/abc_001.wav` the segments are read from
/// `audio/abc_001.json`, a JSON array of `{start, end, text, translation}`.
#[derive(Debug, Clone)]
pub struct ReplayTranscriber {
    timeout: Duration,
}

impl Default for ReplayTranscriber {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl ReplayTranscriber {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transcript_path(audio_ref: &str) -> PathBuf {
        Path::new(audio_ref).with_extension("json")
    }
}

#[async_trait]
impl Transcriber for ReplayTranscriber {
    fn name(&self) -> &str {
        "replay"
    }

    async fn transcribe(
        &self,
        chunk: &Chunk,
        _credential: Option<&CredentialLease>,
    ) -> std::result::Result<Vec<RawSegment>, TranscribeError> {
        let path = Self::transcript_path(&chunk.audio_ref);
        let read = tokio::time::timeout(self.timeout, tokio::fs::read_to_string(&path)).await;

        let content = match read {
            Err(_) => return Err(TranscribeError::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscribeError::FatalInput(format!(
                    "no transcript at {}",
                    path.display()
                )))
            }
            Ok(Err(e)) => return Err(TranscribeError::FatalInput(e.to_string())),
            Ok(Ok(content)) => content,
        };

        serde_json::from_str(&content)
            .map_err(|e| TranscribeError::MalformedResponse(format!("{}: {}", path.display(), e)))
    }
}

pub struct TranscriptionWorker {
    config: WorkerConfig,
    scheduler: JobScheduler,
    store: Arc<dyn Store>,
    transcriber: Arc<dyn Transcriber>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl TranscriptionWorker {
    pub fn new(
        config: WorkerConfig,
        scheduler: JobScheduler,
        store: Arc<dyn Store>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            config,
            scheduler,
            store,
            transcriber,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.worker_name
    }

    pub async fn get_stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Chunks waiting for transcription, without leasing anything
    pub async fn scan_for_work(&self) -> Result<Vec<Chunk>> {
        Ok(self
            .store
            .list_chunks(Some(ChunkState::Pending))
            .await?
            .into_iter()
            .filter(|c| !c.needs_manual_intervention)
            .collect())
    }

    /// Lease one job, transcribe it and report back
    ///
    /// `None` means the scheduler had nothing to hand out.
    pub async fn process_next(&self, worker_id: &str) -> Result<Option<JobOutcome>> {
        let Some(lease) = self.scheduler.acquire_next(worker_id).await? else {
            return Ok(None);
        };
        let outcome = self.process_lease(worker_id, &lease).await?;
        self.record(&outcome, lease.job.id).await;
        self.store.flush().await?;
        Ok(Some(outcome))
    }

    async fn process_lease(&self, worker_id: &str, lease: &Lease) -> Result<JobOutcome> {
        let start_time = Instant::now();
        tracing::info!(
            "🎙️ {} transcribing chunk {} of {} with {}",
            worker_id,
            lease.chunk.index,
            lease.chunk.video_id,
            self.transcriber.name()
        );

        let result = self
            .transcriber
            .transcribe(&lease.chunk, lease.credential.as_ref())
            .await;

        let outcome = match result {
            Ok(segments) => {
                let count = segments.len();
                let outcome = self.scheduler.complete(lease.job.id, segments, worker_id).await?;
                if matches!(outcome, JobOutcome::Completed { .. }) {
                    self.stats.lock().await.segments_produced += count;
                }
                outcome
            }
            Err(e) => {
                tracing::warn!("Chunk {} failed on {}: {}", lease.chunk.id, worker_id, e);
                self.scheduler.fail(lease.job.id, e.into(), worker_id).await?
            }
        };

        tracing::debug!(
            "{} finished job {} in {:.2}s",
            worker_id,
            lease.job.id,
            start_time.elapsed().as_secs_f64()
        );
        Ok(outcome)
    }

    async fn record(&self, outcome: &JobOutcome, job_id: Uuid) {
        let mut stats = self.stats.lock().await;
        match outcome {
            JobOutcome::Completed { .. } => stats.chunks_processed += 1,
            JobOutcome::Requeued { .. } => stats.chunks_requeued += 1,
            JobOutcome::Failed { .. } => stats.chunks_failed += 1,
            JobOutcome::Stale => {
                tracing::warn!("Report for job {} arrived after the lease was lost", job_id)
            }
        }
    }

    /// Run until the work runs out (batch) or `shutdown` fires (continuous)
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerStats> {
        let started = Instant::now();
        self.stats.lock().await.started_at = Some(started);

        if self.config.dry_run {
            for chunk in self.scan_for_work().await? {
                tracing::info!(
                    "Dry run: Would transcribe chunk {} of {} ({})",
                    chunk.index,
                    chunk.video_id,
                    chunk.audio_ref
                );
            }
            return Ok(self.get_stats().await);
        }

        tracing::info!(
            "Starting {:?} mode with {} task(s)",
            self.config.mode,
            self.config.concurrency
        );
        let taken = AtomicUsize::new(0);
        let tasks = (0..self.config.concurrency).map(|i| {
            let worker_id = if self.config.concurrency == 1 {
                self.config.worker_name.clone()
            } else {
                format!("{}-{}", self.config.worker_name, i + 1)
            };
            self.run_task(worker_id, &taken, shutdown.clone())
        });
        let results = futures::future::join_all(tasks).await;
        for result in results {
            result?;
        }

        let mut stats = self.stats.lock().await;
        stats.total_processing_time_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            "Worker finished. Processed: {}, Requeued: {}, Failed: {}, Total time: {:.1}s",
            stats.chunks_processed,
            stats.chunks_requeued,
            stats.chunks_failed,
            stats.total_processing_time_secs
        );
        Ok(stats.clone())
    }

    async fn run_task(
        &self,
        worker_id: String,
        taken: &AtomicUsize,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            if self.config.mode == WorkerMode::Batch
                && taken.fetch_add(1, Ordering::SeqCst) >= self.config.batch_size
            {
                return Ok(());
            }

            match self.process_next(&worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) if self.config.mode == WorkerMode::Batch => return Ok(()),
                Ok(None) => {
                    tracing::debug!(
                        "No work found, sleeping for {} seconds",
                        self.config.poll_interval_secs
                    );
                }
                Err(e) if is_retryable(&e) => {
                    tracing::warn!("{} lost a race, trying again: {}", worker_id, e);
                    if self.config.mode == WorkerMode::Batch {
                        taken.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                }
                Err(e) => {
                    tracing::error!("{} hit a scheduler error: {}", worker_id, e);
                    if self.config.mode == WorkerMode::Batch {
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }
}

fn is_retryable(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<PipelineError>()
        .map_or(false, PipelineError::is_retryable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size(), 10);
        assert_eq!(config.mode(), WorkerMode::Batch);
        assert_eq!(config.concurrency(), 1);
        assert_eq!(config.worker_name(), "transcription-worker-1");
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_batch_size(20)
            .with_mode(WorkerMode::Continuous)
            .with_concurrency(0)
            .with_worker_name("test-worker".to_string());

        assert_eq!(config.batch_size(), 20);
        assert_eq!(config.mode(), WorkerMode::Continuous);
        assert_eq!(config.concurrency(), 1);
        assert_eq!(config.worker_name(), "test-worker");
    }

    #[test]
    fn test_errors_map_to_failures() {
        assert_eq!(WorkerFailure::from(TranscribeError::QuotaExceeded), WorkerFailure::QuotaExceeded);
        assert!(WorkerFailure::from(TranscribeError::FatalInput("gone".into())).is_fatal());
    }

    #[test]
    fn test_transcript_path_sits_next_to_audio() {
        assert_eq!(
            ReplayTranscriber::transcript_path("audio/abc_001.wav"),
            PathBuf::from("audio/abc_001.json")
        );
    }
}
