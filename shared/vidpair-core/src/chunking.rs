//! Overlapping chunk windows over a video's duration

use crate::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// One audio window, video-absolute seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkWindow {
    pub index: u32,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl ChunkWindow {
    pub fn new(index: u32, start_secs: f64, end_secs: f64) -> Self {
        Self {
            index,
            start_secs,
            end_secs,
        }
    }

    /// Overlap region shared with the following window
    pub fn seam_with(&self, next: &ChunkWindow) -> Option<(f64, f64)> {
        if next.start_secs < self.end_secs {
            Some((next.start_secs, self.end_secs))
        } else {
            None
        }
    }
}

/// Split `duration_secs` into windows of `chunk_secs` that overlap by `seam_secs`
pub fn plan_windows(duration_secs: f64, chunk_secs: f64, seam_secs: f64) -> Result<Vec<ChunkWindow>> {
    if !(duration_secs > 0.0) {
        return Err(PipelineError::InvalidChunkPlan(format!(
            "duration must be positive, got {}",
            duration_secs
        )));
    }
    if !(seam_secs >= 0.0) || seam_secs >= chunk_secs {
        return Err(PipelineError::InvalidChunkPlan(format!(
            "seam ({}s) must be non-negative and shorter than the chunk ({}s)",
            seam_secs, chunk_secs
        )));
    }

    let step = chunk_secs - seam_secs;
    let mut windows = Vec::new();
    let mut start = 0.0_f64;
    loop {
        let end = (start + chunk_secs).min(duration_secs);
        windows.push(ChunkWindow::new(windows.len() as u32, start, end));
        if end >= duration_secs {
            break;
        }
        start += step;
    }

    Ok(windows)
}

/// Check that `windows` form an ordered cover of the video overlapping by `seam_secs`
pub fn validate_cover(
    windows: &[ChunkWindow],
    duration_secs: f64,
    seam_secs: f64,
    tolerance_secs: f64,
) -> Result<()> {
    let first = windows
        .first()
        .ok_or_else(|| PipelineError::InvalidChunkPlan("no chunk windows".to_string()))?;
    if first.start_secs.abs() > tolerance_secs {
        return Err(PipelineError::InvalidChunkPlan(format!(
            "first window starts at {}s instead of 0",
            first.start_secs
        )));
    }

    for (position, window) in windows.iter().enumerate() {
        if window.index as usize != position {
            return Err(PipelineError::InvalidChunkPlan(format!(
                "window at position {} has index {}",
                position, window.index
            )));
        }
        if window.end_secs <= window.start_secs {
            return Err(PipelineError::InvalidChunkPlan(format!(
                "window {} is empty or inverted ({}s..{}s)",
                window.index, window.start_secs, window.end_secs
            )));
        }
    }

    for pair in windows.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.start_secs <= prev.start_secs {
            return Err(PipelineError::InvalidChunkPlan(format!(
                "window {} does not start after window {}",
                next.index, prev.index
            )));
        }
        let overlap = prev.end_secs - next.start_secs;
        if (overlap - seam_secs).abs() > tolerance_secs {
            return Err(PipelineError::InvalidChunkPlan(format!(
                "windows {} and {} overlap by {:.3}s, expected {:.3}s",
                prev.index, next.index, overlap, seam_secs
            )));
        }
    }

    if let Some(last) = windows.last() {
        if (last.end_secs - duration_secs).abs() > tolerance_secs {
            return Err(PipelineError::InvalidChunkPlan(format!(
                "last window ends at {}s but video lasts {}s",
                last.end_secs, duration_secs
            )));
        }
    }

    Ok(())
}

/// Regions of `[0, duration_secs]` that no window covers
pub fn coverage_gaps(windows: &[ChunkWindow], duration_secs: f64, tolerance_secs: f64) -> Vec<(f64, f64)> {
    let mut sorted: Vec<&ChunkWindow> = windows.iter().collect();
    sorted.sort_by(|a, b| a.start_secs.total_cmp(&b.start_secs));

    let mut gaps = Vec::new();
    let mut covered_until = 0.0_f64;
    for window in sorted {
        if window.start_secs - covered_until > tolerance_secs {
            gaps.push((covered_until, window.start_secs));
        }
        covered_until = covered_until.max(window.end_secs);
    }
    if duration_secs - covered_until > tolerance_secs {
        gaps.push((covered_until, duration_secs));
    }
    gaps
}
