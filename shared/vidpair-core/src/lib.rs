//! vidpair Core - Shared data model and lifecycle rules for the chunk review pipeline

pub mod chunking;
pub mod clock;
pub mod model;
pub mod states;

pub use chunking::{coverage_gaps, plan_windows, validate_cover, ChunkWindow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use model::{
    Chunk, ProcessingJob, RawSegment, ReviewLock, Segment, SegmentSource, Video, WorkerFailure,
};
pub use states::{ChunkState, JobStatus, SegmentReviewStatus, VideoState};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result type for vidpair Core operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error types shared by every component of the pipeline
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Stale state for {entity} {id}: expected {expected}, found {actual}")]
    StaleState {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Chunk {chunk_id} is locked by {holder} until {expires_at}")]
    AlreadyLocked {
        chunk_id: Uuid,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Chunk {chunk_id} cannot be reviewed in state {state}")]
    NotReviewable { chunk_id: Uuid, state: ChunkState },

    #[error("Video {video_id} is not ready for merge: {unfinished} chunk(s) not terminal")]
    NotReady { video_id: String, unfinished: usize },

    #[error("Timeline invariant violated for video {video_id}: {detail}")]
    TimelineInvariant { video_id: String, detail: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid chunk plan: {0}")]
    InvalidChunkPlan(String),

    #[error("Invalid segments for chunk {chunk_id}: {detail}")]
    InvalidSegments { chunk_id: Uuid, detail: String },

    #[error("Chunk {chunk_id} already has an active job")]
    DuplicateActiveJob { chunk_id: Uuid },

    #[error("Gave up on {entity} {id} after {attempts} conflicting updates")]
    Contention {
        entity: &'static str,
        id: String,
        attempts: usize,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PipelineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Errors a caller can resolve by re-reading and trying again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::StaleState { .. }
                | PipelineError::AlreadyLocked { .. }
                | PipelineError::Contention { .. }
        )
    }
}
