/// vidpair Pipeline - chunk processing and review concurrency core
///
/// Tracks every chunk of a long recording through transcription and human
/// review, hands transcription jobs to a pool of workers without duplicate or
/// lost work, arbitrates review access with expiring locks and version checks,
/// and stitches the overlapping chunk transcripts into one exportable timeline.

pub mod audit;
pub mod config;
pub mod export;
pub mod ingest;
pub mod maintenance;
pub mod merge;
pub mod review;
pub mod scheduler;
pub mod state;
pub mod storage;

use std::sync::Arc;
use vidpair_core::Clock;

// Re-export main types for easy access
pub use crate::audit::{AuditRecord, EntityKind};
pub use crate::config::{Config, ConfigBuilder, ExportFormat};
pub use crate::export::{ExportAssembler, ExportReport, ManifestRow, VideoManifest};
pub use crate::ingest::Ingestor;
pub use crate::maintenance::{Maintenance, SweepReport};
pub use crate::merge::{CanonicalTimeline, SegmentMerger, TextSimilarity, TimelineEntry, TokenOverlap};
pub use crate::review::{
    CommitOutcome, ConflictArtifact, LockToken, ReviewDecision, ReviewLockManager, SegmentEdit,
};
pub use crate::scheduler::credentials::{CredentialLease, CredentialPool};
pub use crate::scheduler::retry::RetryPolicy;
pub use crate::scheduler::{JobOutcome, JobScheduler, Lease, OperatorAlert, ReclaimReport};
pub use crate::state::StateMachine;
pub use crate::storage::{CasOutcome, MemoryStore, Store};
pub use vidpair_core;

/// Every component wired to one store and one clock
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub ingestor: Ingestor,
    pub scheduler: JobScheduler,
    pub locks: ReviewLockManager,
    pub merger: SegmentMerger,
    pub exporter: ExportAssembler,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let merger = SegmentMerger::new(store.clone(), clock.clone(), config.merge.clone());
        Self {
            ingestor: Ingestor::new(store.clone(), clock.clone(), config.merge.clone()),
            scheduler: JobScheduler::new(store.clone(), clock.clone(), config),
            locks: ReviewLockManager::new(store.clone(), clock, &config.review),
            exporter: ExportAssembler::new(merger.clone()),
            merger,
            store,
        }
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance::new(self.store.clone(), self.scheduler.clone(), self.locks.clone())
    }
}
