//! Lifecycle states for chunks, jobs and segments and their legal transitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing and review states of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    /// Waiting for a transcription job
    Pending,

    /// A worker holds a leased job for this chunk
    Processing,

    /// Segments are staged and waiting for a reviewer
    ReviewReady,

    /// A reviewer holds (or held) the review lock
    InReview,

    /// Reviewed and accepted into the dataset
    Approved,

    /// Audio unusable, excluded from export
    Rejected,
}

impl ChunkState {
    pub const ALL: [ChunkState; 6] = [
        ChunkState::Pending,
        ChunkState::Processing,
        ChunkState::ReviewReady,
        ChunkState::InReview,
        ChunkState::Approved,
        ChunkState::Rejected,
    ];

    /// Whether `self -> to` appears in the chunk transition table
    pub fn can_transition_to(&self, to: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, ReviewReady)
                | (Processing, Pending)
                | (ReviewReady, InReview)
                | (ReviewReady, Rejected)
                | (InReview, Approved)
                | (InReview, Rejected)
                | (InReview, ReviewReady)
        )
    }

    /// Approved and rejected chunks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkState::Approved | ChunkState::Rejected)
    }

    /// Get progress percentage for this state
    pub fn progress_percentage(&self) -> u8 {
        match self {
            ChunkState::Pending => 0,
            ChunkState::Processing => 25,
            ChunkState::ReviewReady => 50,
            ChunkState::InReview => 75,
            ChunkState::Approved | ChunkState::Rejected => 100,
        }
    }

    /// Get human-readable status string
    pub fn status_string(&self) -> &'static str {
        match self {
            ChunkState::Pending => "Pending",
            ChunkState::Processing => "Processing",
            ChunkState::ReviewReady => "Review Ready",
            ChunkState::InReview => "In Review",
            ChunkState::Approved => "Approved",
            ChunkState::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkState::Pending => "PENDING",
            ChunkState::Processing => "PROCESSING",
            ChunkState::ReviewReady => "REVIEW_READY",
            ChunkState::InReview => "IN_REVIEW",
            ChunkState::Approved => "APPROVED",
            ChunkState::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// Status of a transcription job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Leased,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Leased) | (Leased, Completed) | (Leased, Failed) | (Failed, Queued)
        )
    }

    /// Queued and leased jobs count against the one-active-job-per-chunk rule
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Leased)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Leased => "LEASED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Per-segment verdict recorded by a reviewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentReviewStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

/// Aggregate state of a video, derived from its chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    /// No chunk has been picked up yet
    Pending,
    /// At least one chunk is still waiting for or undergoing transcription
    Processing,
    /// Every chunk is transcribed, some still need review
    InReview,
    /// Every chunk is approved or rejected
    ReadyForMerge,
}

impl VideoState {
    pub fn derive(chunk_states: &[ChunkState]) -> Self {
        if chunk_states.is_empty() {
            return VideoState::Pending;
        }
        if chunk_states.iter().all(|s| s.is_terminal()) {
            return VideoState::ReadyForMerge;
        }
        if chunk_states.iter().all(|s| *s == ChunkState::Pending) {
            return VideoState::Pending;
        }
        if chunk_states
            .iter()
            .any(|s| matches!(s, ChunkState::Pending | ChunkState::Processing))
        {
            return VideoState::Processing;
        }
        VideoState::InReview
    }
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoState::Pending => "pending",
            VideoState::Processing => "processing",
            VideoState::InReview => "in_review",
            VideoState::ReadyForMerge => "ready_for_merge",
        };
        f.write_str(name)
    }
}
