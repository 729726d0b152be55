//! Entities tracked by the pipeline: videos, chunks, jobs and segments

use crate::states::{ChunkState, JobStatus, SegmentReviewStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A source recording
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Video {
    /// Source identifier (e.g. the YouTube video id)
    pub id: String,

    /// Optional display title
    pub title: Option<String>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// When this video was registered
    pub created_at: DateTime<Utc>,
}

impl Video {
    pub fn new(id: impl Into<String>, duration_secs: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: None,
            duration_secs,
            created_at,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Exclusive review claim on a chunk, embedded in the chunk record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewLock {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    /// `sync_version` observed when the lock was granted
    pub version: u64,
}

impl ReviewLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A contiguous audio window of one video
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: Uuid,
    pub video_id: String,

    /// Position within the video, starting at 0
    pub index: u32,

    /// Window start offset in the video, seconds
    pub start_secs: f64,

    /// Window end offset in the video, seconds
    pub end_secs: f64,

    /// Where the extracted audio for this window lives
    pub audio_ref: String,

    pub state: ChunkState,

    /// Bumped whenever the chunk's segments change
    pub sync_version: u64,

    pub lock: Option<ReviewLock>,

    /// Set when a review commit lost a race against reprocessing
    pub needs_rereview: bool,

    /// Set when a job failed for good and an operator must step in
    pub needs_manual_intervention: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(
        video_id: impl Into<String>,
        index: u32,
        start_secs: f64,
        end_secs: f64,
        audio_ref: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            video_id: video_id.into(),
            index,
            start_secs,
            end_secs,
            audio_ref: audio_ref.into(),
            state: ChunkState::Pending,
            sync_version: 0,
            lock: None,
            needs_rereview: false,
            needs_manual_intervention: false,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }

    /// Lock that still blocks other reviewers at `now`
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<&ReviewLock> {
        self.lock.as_ref().filter(|lock| !lock.is_expired(now))
    }

    /// Convert a chunk-relative offset to video-absolute time
    pub fn to_absolute(&self, offset_secs: f64) -> f64 {
        self.start_secs + offset_secs
    }
}

/// Typed failure reported by a transcription worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WorkerFailure {
    QuotaExceeded,
    MalformedResponse(String),
    Timeout,
    FatalInputError(String),
    /// Synthesised by lease reclamation when a worker vanished
    LeaseExpired,
}

impl WorkerFailure {
    /// Structural problems that no retry can fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerFailure::FatalInputError(_))
    }

    /// Quota failures are retried under another credential without using up an attempt
    pub fn consumes_attempt(&self) -> bool {
        !matches!(self, WorkerFailure::QuotaExceeded)
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailure::QuotaExceeded => write!(f, "quota_exceeded"),
            WorkerFailure::MalformedResponse(detail) => write!(f, "malformed_response: {}", detail),
            WorkerFailure::Timeout => write!(f, "timeout"),
            WorkerFailure::FatalInputError(detail) => write!(f, "fatal_input_error: {}", detail),
            WorkerFailure::LeaseExpired => write!(f, "lease expired"),
        }
    }
}

/// A unit of scheduled transcription work for one chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub chunk_id: Uuid,
    pub video_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set while leased
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Earliest dispatch time for a requeued job (backoff)
    pub not_before: Option<DateTime<Utc>>,

    pub attempts: u32,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub credential_id: Option<String>,
}

impl ProcessingJob {
    /// Create a job that is leased to `worker_id` from the start
    pub fn leased(
        chunk: &Chunk,
        worker_id: &str,
        credential_id: Option<String>,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chunk_id: chunk.id,
            video_id: chunk.video_id.clone(),
            status: JobStatus::Leased,
            created_at: now,
            updated_at: now,
            lease_expires_at: Some(now + lease_ttl),
            not_before: None,
            attempts: 0,
            last_error: None,
            worker_id: Some(worker_id.to_string()),
            credential_id,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased
            && self.lease_expires_at.map_or(false, |expiry| expiry <= now)
    }

    /// Queued job whose backoff has elapsed
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.not_before.map_or(true, |t| t <= now)
    }
}

/// Segment exactly as a transcription worker returns it (chunk-relative times)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub translation: String,
}

impl RawSegment {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            translation: String::new(),
        }
    }

    pub fn with_translation(mut self, translation: impl Into<String>) -> Self {
        self.translation = translation.into();
        self
    }
}

/// Who produced a segment row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentSource {
    Transcription { job_id: Option<Uuid> },
    Review { reviewer: String },
}

/// A transcribed and translated utterance
///
/// Rows are append-only: a review edit writes a new revision that points at the
/// row it replaces, and the old row is only marked `superseded`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub id: Uuid,
    pub chunk_id: Uuid,
    pub video_id: String,

    /// Chunk-relative start, seconds
    pub start_secs: f64,

    /// Chunk-relative end, seconds
    pub end_secs: f64,

    pub transcript: String,
    pub translation: String,
    pub review_status: SegmentReviewStatus,

    pub revision: u32,
    pub supersedes: Option<Uuid>,
    pub superseded: bool,

    pub source: SegmentSource,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn from_raw(chunk: &Chunk, raw: &RawSegment, job_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chunk_id: chunk.id,
            video_id: chunk.video_id.clone(),
            start_secs: raw.start,
            end_secs: raw.end,
            transcript: raw.text.trim().to_string(),
            translation: raw.translation.trim().to_string(),
            review_status: SegmentReviewStatus::Pending,
            revision: 0,
            supersedes: None,
            superseded: false,
            source: SegmentSource::Transcription { job_id },
            created_at: now,
        }
    }

    /// Copy of this segment as the next revision, attributed to `reviewer`
    pub fn revise(&self, reviewer: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            revision: self.revision + 1,
            supersedes: Some(self.id),
            superseded: false,
            source: SegmentSource::Review {
                reviewer: reviewer.to_string(),
            },
            created_at: now,
            ..self.clone()
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }
}
