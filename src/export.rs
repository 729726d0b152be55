//! Final dataset manifest: one (start, end, transcript, translation) row per utterance

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use vidpair_core::{PipelineError, Result, SegmentReviewStatus};

use crate::config::ExportFormat;
use crate::merge::{CanonicalTimeline, SegmentMerger};

/// One exported utterance, video-absolute seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestRow {
    pub start: f64,
    pub end: f64,
    pub transcript: String,
    pub translation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoManifest {
    pub video_id: String,
    pub rows: Vec<ManifestRow>,
}

/// Which text an SRT file carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleTrack {
    Transcript,
    Translation,
}

/// Files written for one video
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    pub video_id: String,
    pub rows: usize,
    pub files: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct ExportAssembler {
    merger: SegmentMerger,
}

impl ExportAssembler {
    pub fn new(merger: SegmentMerger) -> Self {
        Self { merger }
    }

    /// Turn a canonical timeline into manifest rows
    ///
    /// Fails instead of dropping anything when the timeline has a coverage gap
    /// or an inverted or out-of-order segment.
    pub fn assemble(&self, timeline: &CanonicalTimeline) -> Result<VideoManifest> {
        let invariant = |detail: String| PipelineError::TimelineInvariant {
            video_id: timeline.video_id.clone(),
            detail,
        };

        if let Some((from, to)) = timeline.coverage_gaps.first() {
            return Err(invariant(format!(
                "{} uncovered region(s), first at {:.3}s..{:.3}s",
                timeline.coverage_gaps.len(),
                from,
                to
            )));
        }

        let mut rows: Vec<ManifestRow> = Vec::with_capacity(timeline.entries.len());
        for entry in timeline
            .entries
            .iter()
            .filter(|e| e.review_status != SegmentReviewStatus::Rejected)
        {
            if !(entry.start_secs.is_finite() && entry.end_secs > entry.start_secs) {
                return Err(invariant(format!(
                    "segment {} is inverted ({:.3}s..{:.3}s)",
                    entry.segment_id, entry.start_secs, entry.end_secs
                )));
            }
            if let Some(previous) = rows.last() {
                if entry.start_secs < previous.start {
                    return Err(invariant(format!(
                        "segment {} starts at {:.3}s, before the previous row at {:.3}s",
                        entry.segment_id, entry.start_secs, previous.start
                    )));
                }
            }
            rows.push(ManifestRow {
                start: entry.start_secs,
                end: entry.end_secs,
                transcript: entry.transcript.clone(),
                translation: entry.translation.clone(),
            });
        }

        Ok(VideoManifest {
            video_id: timeline.video_id.clone(),
            rows,
        })
    }

    /// Merge a finished video and write it in every requested format
    pub async fn export_video(
        &self,
        video_id: &str,
        formats: &[ExportFormat],
        output_dir: &Path,
    ) -> Result<ExportReport> {
        let timeline = self.merger.merge_video(video_id).await?;
        let manifest = self.assemble(&timeline)?;
        fs::create_dir_all(output_dir).await?;

        let mut files = Vec::new();
        for format in formats {
            match format {
                ExportFormat::Jsonl => {
                    let path = output_dir.join(format!("{}.jsonl", video_id));
                    write_jsonl(&manifest, &path).await?;
                    files.push(path);
                }
                ExportFormat::Srt => {
                    let path = output_dir.join(format!("{}.srt", video_id));
                    write_srt(&manifest, SubtitleTrack::Transcript, &path).await?;
                    files.push(path);

                    let path = output_dir.join(format!("{}.translation.srt", video_id));
                    write_srt(&manifest, SubtitleTrack::Translation, &path).await?;
                    files.push(path);
                }
            }
        }

        info!(
            "📦 Exported {} rows for {} to {}",
            manifest.rows.len(),
            video_id,
            output_dir.display()
        );
        Ok(ExportReport {
            video_id: video_id.to_string(),
            rows: manifest.rows.len(),
            files,
        })
    }
}

/// One JSON object per line
pub async fn write_jsonl(manifest: &VideoManifest, path: &Path) -> Result<()> {
    let mut content = String::new();
    for row in &manifest.rows {
        content.push_str(&serde_json::to_string(row)?);
        content.push('\n');
    }
    fs::write(path, content).await?;
    Ok(())
}

pub fn render_srt(manifest: &VideoManifest, track: SubtitleTrack) -> String {
    let mut srt_content = String::new();
    for (i, row) in manifest.rows.iter().enumerate() {
        let text = match track {
            SubtitleTrack::Transcript => &row.transcript,
            SubtitleTrack::Translation => &row.translation,
        };
        let _ = write!(
            srt_content,
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_timestamp(row.start),
            format_timestamp(row.end),
            text.trim()
        );
    }
    srt_content
}

pub async fn write_srt(manifest: &VideoManifest, track: SubtitleTrack, path: &Path) -> Result<()> {
    fs::write(path, render_srt(manifest, track)).await?;
    Ok(())
}

/// `HH:MM:SS,mmm`
fn format_timestamp(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}
