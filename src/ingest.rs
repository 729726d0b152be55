//! Registering videos and their chunk windows

use std::sync::Arc;
use tracing::info;
use vidpair_core::{plan_windows, validate_cover, Chunk, ChunkWindow, Clock, Result, Video};

use crate::config::MergeConfig;
use crate::storage::Store;

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: MergeConfig,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: MergeConfig) -> Self {
        Self { store, clock, config }
    }

    /// Windows for a video of `duration_secs` using the configured chunk and seam length
    pub fn plan(&self, duration_secs: f64) -> Result<Vec<ChunkWindow>> {
        plan_windows(duration_secs, self.config.chunk_secs, self.config.seam_secs)
    }

    /// Store a video and one `PENDING` chunk per window
    ///
    /// `audio_ref` maps a window to the location of its extracted audio.
    pub async fn register_video<F>(
        &self,
        video: Video,
        windows: &[ChunkWindow],
        audio_ref: F,
    ) -> Result<Vec<Chunk>>
    where
        F: Fn(&ChunkWindow) -> String,
    {
        validate_cover(
            windows,
            video.duration_secs,
            self.config.seam_secs,
            self.config.boundary_tolerance_secs,
        )?;

        let now = self.clock.now();
        let chunks: Vec<Chunk> = windows
            .iter()
            .map(|w| Chunk::new(&video.id, w.index, w.start_secs, w.end_secs, audio_ref(w), now))
            .collect();

        let video_id = video.id.clone();
        self.store.register_video(video, chunks.clone()).await?;

        info!("🎬 Registered video {} with {} chunks", video_id, chunks.len());
        Ok(chunks)
    }
}

/// Conventional audio location: `<dir>/<video>_<index:03>.wav`
pub fn default_audio_ref(audio_dir: &str, video_id: &str, window: &ChunkWindow) -> String {
    format!("{}/{}_{:03}.wav", audio_dir.trim_end_matches('/'), video_id, window.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use vidpair_core::{ChunkState, PipelineError, SystemClock};

    fn ingestor() -> (Arc<MemoryStore>, Ingestor) {
        let store = Arc::new(MemoryStore::new());
        let ingestor = Ingestor::new(store.clone(), Arc::new(SystemClock), MergeConfig::default());
        (store, ingestor)
    }

    #[tokio::test]
    async fn test_register_planned_video() {
        let (store, ingestor) = ingestor();
        let windows = ingestor.plan(595.0).unwrap();

        let chunks = ingestor
            .register_video(Video::new("abc", 595.0, Utc::now()), &windows, |w| {
                default_audio_ref("audio/", "abc", w)
            })
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].audio_ref, "audio/abc_001.wav");
        let stored = store.chunks_for_video("abc").await.unwrap();
        assert!(stored.iter().all(|c| c.state == ChunkState::Pending));
        assert_eq!(stored[2].start_secs, 580.0);
    }

    #[tokio::test]
    async fn test_register_rejects_broken_cover() {
        let (store, ingestor) = ingestor();
        let windows = vec![ChunkWindow::new(0, 0.0, 300.0), ChunkWindow::new(1, 320.0, 600.0)];

        let err = ingestor
            .register_video(Video::new("abc", 600.0, Utc::now()), &windows, |_| String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChunkPlan(_)));
        assert!(store.get_video("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_registration_leaves_nothing_behind() {
        let (store, ingestor) = ingestor();
        let stray = Chunk::new("abc", 1, 290.0, 590.0, "stray.wav", Utc::now());
        store.insert_chunk(stray.clone()).await.unwrap();

        let windows = ingestor.plan(600.0).unwrap();
        let err = ingestor
            .register_video(Video::new("abc", 600.0, Utc::now()), &windows, |_| String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));

        assert!(store.get_video("abc").await.unwrap().is_none());
        let chunks = store.chunks_for_video("abc").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, stray.id);
    }
}
