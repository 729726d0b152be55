use chrono::{Duration, Utc};
use vidpair_core::{
    coverage_gaps, plan_windows, validate_cover, Chunk, ChunkState, ChunkWindow, JobStatus,
    PipelineError, ProcessingJob, RawSegment, Segment, SegmentSource, VideoState, WorkerFailure,
};

#[test]
fn test_planned_windows_form_a_valid_cover() {
    let windows = plan_windows(600.0, 300.0, 10.0).unwrap();

    assert_eq!(windows.len(), 3);
    assert_eq!((windows[0].start_secs, windows[0].end_secs), (0.0, 300.0));
    assert_eq!((windows[1].start_secs, windows[1].end_secs), (290.0, 590.0));
    assert_eq!((windows[2].start_secs, windows[2].end_secs), (580.0, 600.0));
    validate_cover(&windows, 600.0, 10.0, 0.5).unwrap();
    assert!(coverage_gaps(&windows, 600.0, 0.5).is_empty());
}

#[test]
fn test_short_video_is_one_window() {
    let windows = plan_windows(42.0, 300.0, 10.0).unwrap();
    assert_eq!(windows, vec![ChunkWindow::new(0, 0.0, 42.0)]);
}

#[test]
fn test_invalid_plans_are_rejected() {
    assert!(matches!(
        plan_windows(0.0, 300.0, 10.0),
        Err(PipelineError::InvalidChunkPlan(_))
    ));
    assert!(matches!(
        plan_windows(600.0, 300.0, 300.0),
        Err(PipelineError::InvalidChunkPlan(_))
    ));

    let short_of_end = vec![ChunkWindow::new(0, 0.0, 300.0), ChunkWindow::new(1, 290.0, 550.0)];
    assert!(validate_cover(&short_of_end, 600.0, 10.0, 0.5).is_err());
}

#[test]
fn test_coverage_gaps_report_uncovered_ranges() {
    let windows = vec![ChunkWindow::new(0, 0.0, 300.0), ChunkWindow::new(2, 580.0, 600.0)];
    assert_eq!(coverage_gaps(&windows, 600.0, 0.5), vec![(300.0, 580.0)]);
}

#[test]
fn test_chunk_transition_table() {
    use ChunkState::*;
    assert!(Pending.can_transition_to(Processing));
    assert!(Processing.can_transition_to(Pending));
    assert!(InReview.can_transition_to(ReviewReady));
    assert!(!Pending.can_transition_to(ReviewReady));
    assert!(!Approved.can_transition_to(InReview));
    assert!(!Rejected.can_transition_to(Pending));

    assert!(JobStatus::Leased.can_transition_to(JobStatus::Completed));
    assert!(JobStatus::Failed.can_transition_to(JobStatus::Queued));
    assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
}

#[test]
fn test_video_state_derivation() {
    use ChunkState::*;
    assert_eq!(VideoState::derive(&[]), VideoState::Pending);
    assert_eq!(VideoState::derive(&[Pending, Pending]), VideoState::Pending);
    assert_eq!(VideoState::derive(&[ReviewReady, Processing]), VideoState::Processing);
    assert_eq!(VideoState::derive(&[ReviewReady, Approved]), VideoState::InReview);
    assert_eq!(VideoState::derive(&[Approved, Rejected]), VideoState::ReadyForMerge);
}

#[test]
fn test_worker_failure_wire_format() {
    let failure = WorkerFailure::MalformedResponse("truncated".to_string());
    let json = serde_json::to_string(&failure).unwrap();
    assert_eq!(json, r#"{"kind":"malformed_response","detail":"truncated"}"#);

    assert!(!WorkerFailure::QuotaExceeded.consumes_attempt());
    assert!(WorkerFailure::Timeout.consumes_attempt());
    assert!(WorkerFailure::FatalInputError("gone".into()).is_fatal());
}

#[test]
fn test_job_lease_expiry_and_backoff() {
    let now = Utc::now();
    let chunk = Chunk::new("vid", 0, 0.0, 300.0, "a.wav", now);
    let mut job = ProcessingJob::leased(&chunk, "w1", None, now, Duration::seconds(60));

    assert!(!job.lease_expired(now));
    assert!(job.lease_expired(now + Duration::seconds(60)));

    job.status = JobStatus::Queued;
    job.not_before = Some(now + Duration::seconds(30));
    assert!(!job.is_dispatchable(now));
    assert!(job.is_dispatchable(now + Duration::seconds(30)));
}

#[test]
fn test_segment_revision_chain() {
    let now = Utc::now();
    let chunk = Chunk::new("vid", 1, 290.0, 590.0, "a.wav", now);
    let raw = RawSegment::new("  xin chào ", 3.0, 5.5).with_translation("hello");
    let original = Segment::from_raw(&chunk, &raw, None, now);

    assert_eq!(original.transcript, "xin chào");
    assert_eq!(chunk.to_absolute(original.start_secs), 293.0);

    let revised = original.revise("alice", now);
    assert_eq!(revised.revision, 1);
    assert_eq!(revised.supersedes, Some(original.id));
    assert_ne!(revised.id, original.id);
    assert_eq!(
        revised.source,
        SegmentSource::Review {
            reviewer: "alice".to_string()
        }
    );
}
