//! Overlap-aware segment merger
//!
//! Consecutive chunks share a seam, so an utterance near a boundary is often
//! transcribed by both. Per video, once every chunk is terminal, segments
//! are moved to absolute time and near-identical pairs inside a seam are
//! collapsed onto the later chunk's copy.

pub mod similarity;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use vidpair_core::{
    coverage_gaps, Chunk, ChunkState, ChunkWindow, Clock, PipelineError, RawSegment, Result,
    Segment, SegmentReviewStatus, Video,
};

use crate::audit::{AuditRecord, EntityKind};
use crate::config::MergeConfig;
use crate::storage::{CasOutcome, ChunkCondition, ChunkPatch, SegmentWrite, Store};
pub use similarity::{TextSimilarity, TokenOverlap};

/// A segment placed on the video timeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub segment_id: Uuid,
    pub chunk_id: Uuid,
    pub chunk_index: u32,
    /// Video-absolute seconds
    pub start_secs: f64,
    pub end_secs: f64,
    pub transcript: String,
    pub translation: String,
    pub review_status: SegmentReviewStatus,
}

/// A seam duplicate that was dropped in favour of the later chunk's copy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscardedSegment {
    pub segment_id: Uuid,
    pub chunk_index: u32,
    pub kept: Uuid,
    pub similarity: f64,
}

/// Ordered, deduplicated segments of one video
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalTimeline {
    pub video_id: String,
    pub duration_secs: f64,
    pub entries: Vec<TimelineEntry>,
    pub discarded: Vec<DiscardedSegment>,
    /// Parts of the video no chunk window covers
    pub coverage_gaps: Vec<(f64, f64)>,
}

impl CanonicalTimeline {
    pub fn is_gap_free(&self) -> bool {
        self.coverage_gaps.is_empty()
    }
}

#[derive(Clone)]
pub struct SegmentMerger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: MergeConfig,
    similarity: Arc<dyn TextSimilarity>,
}

impl SegmentMerger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: MergeConfig) -> Self {
        Self {
            store,
            clock,
            config,
            similarity: Arc::new(TokenOverlap),
        }
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn TextSimilarity>) -> Self {
        self.similarity = similarity;
        self
    }

    /// Validate a worker's raw output and turn it into segment rows for `chunk`
    pub fn prepare(
        &self,
        chunk: &Chunk,
        raws: &[RawSegment],
        job_id: Option<Uuid>,
    ) -> Result<Vec<Segment>> {
        let limit = chunk.duration_secs() + self.config.boundary_tolerance_secs;
        for (position, raw) in raws.iter().enumerate() {
            let valid = raw.start.is_finite()
                && raw.end.is_finite()
                && raw.start >= 0.0
                && raw.start < raw.end
                && raw.end <= limit;
            if !valid {
                return Err(PipelineError::InvalidSegments {
                    chunk_id: chunk.id,
                    detail: format!(
                        "segment {} spans {}s..{}s, chunk lasts {}s",
                        position,
                        raw.start,
                        raw.end,
                        chunk.duration_secs()
                    ),
                });
            }
        }

        let now = self.clock.now();
        let mut segments: Vec<Segment> = raws
            .iter()
            .map(|raw| Segment::from_raw(chunk, raw, job_id, now))
            .collect();
        segments.sort_by(|a, b| a.start_secs.total_cmp(&b.start_secs));
        Ok(segments)
    }

    /// Replace the segments of a chunk that is already out of processing
    ///
    /// This is how a backend reprocess lands. The version bump makes any
    /// review started on the old segments end in a conflict.
    pub async fn stage(&self, chunk_id: Uuid, raws: &[RawSegment], executor: &str) -> Result<Chunk> {
        let chunk = self
            .store
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("chunk", chunk_id))?;
        let segments = self.prepare(&chunk, raws, None)?;
        let count = segments.len();

        let conditions = [ChunkCondition::StateIn(vec![
            ChunkState::ReviewReady,
            ChunkState::InReview,
        ])];
        let now = self.clock.now();
        let patch = ChunkPatch::new()
            .segments(SegmentWrite::ReplaceAll(segments))
            .bump_version()
            .at(now);
        let record = AuditRecord::new(EntityKind::Chunk, chunk_id, "restage", executor, now);

        match self.store.update_chunk(chunk_id, &conditions, patch).await? {
            CasOutcome::Applied(chunk) => {
                self.store
                    .append_audit(record.states(Some(chunk.state), Some(chunk.state)).with_detail(
                        format!("{} segments, sync_version {}", count, chunk.sync_version),
                    ))
                    .await?;
                info!(
                    "📥 Restaged chunk {} of {} with {} segments (v{})",
                    chunk.index, chunk.video_id, count, chunk.sync_version
                );
                Ok(chunk)
            }
            CasOutcome::Rejected(chunk) => {
                self.store
                    .append_audit(
                        record
                            .states(Some(chunk.state), None::<ChunkState>)
                            .failed("chunk is not reviewable"),
                    )
                    .await?;
                Err(PipelineError::NotReviewable {
                    chunk_id,
                    state: chunk.state,
                })
            }
        }
    }

    /// Build the canonical timeline of a video whose chunks are all terminal
    pub async fn merge_video(&self, video_id: &str) -> Result<CanonicalTimeline> {
        let video = self
            .store
            .get_video(video_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("video", video_id))?;
        let chunks = self.store.chunks_for_video(video_id).await?;
        if chunks.is_empty() {
            return Err(PipelineError::TimelineInvariant {
                video_id: video_id.to_string(),
                detail: "video has no chunks".to_string(),
            });
        }

        let unfinished = chunks.iter().filter(|c| !c.state.is_terminal()).count();
        if unfinished > 0 {
            return Err(PipelineError::NotReady {
                video_id: video_id.to_string(),
                unfinished,
            });
        }

        let mut segments = Vec::new();
        for chunk in &chunks {
            segments.extend(self.store.current_segments(chunk.id).await?);
        }

        let timeline = self.merge(&video, &chunks, &segments);
        info!(
            "🧵 Merged {}: {} segments kept, {} seam duplicates dropped",
            video_id,
            timeline.entries.len(),
            timeline.discarded.len()
        );
        Ok(timeline)
    }

    /// Deterministic merge of a video's chunks and their current segments
    pub fn merge(&self, video: &Video, chunks: &[Chunk], segments: &[Segment]) -> CanonicalTimeline {
        let tolerance = self.config.boundary_tolerance_secs;
        let by_id: HashMap<Uuid, &Chunk> = chunks.iter().map(|c| (c.id, c)).collect();

        let mut entries: Vec<TimelineEntry> = segments
            .iter()
            .filter(|s| !s.superseded && s.review_status != SegmentReviewStatus::Rejected)
            .filter_map(|segment| {
                let chunk = by_id.get(&segment.chunk_id)?;
                if chunk.state == ChunkState::Rejected {
                    return None;
                }
                Some(TimelineEntry {
                    segment_id: segment.id,
                    chunk_id: chunk.id,
                    chunk_index: chunk.index,
                    start_secs: chunk.to_absolute(segment.start_secs),
                    end_secs: chunk.to_absolute(segment.end_secs),
                    transcript: segment.transcript.clone(),
                    translation: segment.translation.clone(),
                    review_status: segment.review_status,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.start_secs
                .total_cmp(&b.start_secs)
                .then(a.chunk_index.cmp(&b.chunk_index))
                .then(a.end_secs.total_cmp(&b.end_secs))
                .then(a.segment_id.cmp(&b.segment_id))
        });

        let mut usable: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.state != ChunkState::Rejected)
            .collect();
        usable.sort_by_key(|c| c.index);

        let mut dropped: BTreeSet<usize> = BTreeSet::new();
        let mut discarded = Vec::new();
        for pair in usable.windows(2) {
            let (earlier, later) = (pair[0], pair[1]);
            if later.start_secs >= earlier.end_secs + tolerance {
                continue;
            }
            let seam = (later.start_secs - tolerance, earlier.end_secs + tolerance);
            self.collapse_seam(&entries, earlier.index, later.index, seam, &mut dropped, &mut discarded);
        }

        let entries = entries
            .into_iter()
            .enumerate()
            .filter(|(position, _)| !dropped.contains(position))
            .map(|(_, entry)| entry)
            .collect();

        let windows: Vec<ChunkWindow> = chunks
            .iter()
            .map(|c| ChunkWindow::new(c.index, c.start_secs, c.end_secs))
            .collect();

        CanonicalTimeline {
            video_id: video.id.clone(),
            duration_secs: video.duration_secs,
            entries,
            discarded,
            coverage_gaps: coverage_gaps(&windows, video.duration_secs, tolerance),
        }
    }

    /// Drop every earlier seam segment that a later-chunk segment duplicates
    ///
    /// The later copy always survives. Among several later copies the best
    /// score is recorded as the keeper, equal scores going to the longer text.
    fn collapse_seam(
        &self,
        entries: &[TimelineEntry],
        earlier_index: u32,
        later_index: u32,
        seam: (f64, f64),
        dropped: &mut BTreeSet<usize>,
        discarded: &mut Vec<DiscardedSegment>,
    ) {
        let in_seam = |entry: &TimelineEntry| entry.start_secs < seam.1 && entry.end_secs > seam.0;
        let side = |index: u32| -> Vec<usize> {
            entries
                .iter()
                .enumerate()
                .filter(|(position, e)| {
                    e.chunk_index == index && in_seam(e) && !dropped.contains(position)
                })
                .map(|(position, _)| position)
                .collect()
        };
        let earlier = side(earlier_index);
        let later = side(later_index);
        let text_len = |position: usize| entries[position].transcript.chars().count();

        for e in earlier {
            let keeper = later
                .iter()
                .map(|&l| {
                    let score = self
                        .similarity
                        .similarity(&entries[e].transcript, &entries[l].transcript);
                    (score, l)
                })
                .filter(|(score, _)| *score >= self.config.dedup_threshold)
                .max_by(|(score_a, l_a), (score_b, l_b)| {
                    score_a
                        .total_cmp(score_b)
                        .then(text_len(*l_a).cmp(&text_len(*l_b)))
                        .then(l_b.cmp(l_a))
                });
            let Some((score, l)) = keeper else {
                continue;
            };

            dropped.insert(e);
            debug!(
                "Seam {}/{}: '{}' at {:.2}s duplicates '{}' at {:.2}s ({:.2})",
                earlier_index,
                later_index,
                entries[e].transcript,
                entries[e].start_secs,
                entries[l].transcript,
                entries[l].start_secs,
                score
            );
            discarded.push(DiscardedSegment {
                segment_id: entries[e].segment_id,
                chunk_index: entries[e].chunk_index,
                kept: entries[l].segment_id,
                similarity: score,
            });
        }
    }
}
