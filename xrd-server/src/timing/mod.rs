// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Frame pacing: predicting per-frame wake-up, submit and present
//! deadlines, and adapting them to observed feedback.
//!
//! Two pacers implement the same interface. [`display::DisplayTiming`] is
//! the closed-loop controller used when the presentation path reports
//! timing feedback; [`fake::FakeTiming`] is the open-loop fallback. The
//! render loop owns one of them; every client additionally gets a
//! [`client::ClientTiming`] helper that re-bases the global prediction.
//!
//! All entry points take explicit `now_ns`/`when_ns` arguments, so tests
//! drive synthetic clocks through the production code path.

pub mod client;
pub mod display;
pub mod fake;

/// Depth of the frame record ring.
pub const NUM_FRAMES: usize = 16;

/// Where a frame is in its lifecycle. Transitions are monotone:
/// Predicted → Woke → Began → Submitted → Info.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FramePhase {
    Cleared,
    Predicted,
    Woke,
    Began,
    Submitted,
    Info,
    Skipped,
}

/// One frame's timing ledger, keyed by `frame_id % NUM_FRAMES`.
#[derive(Debug, Copy, Clone)]
pub struct FrameRecord {
    pub frame_id: i64,
    pub phase: FramePhase,
    pub when_predict_ns: i64,
    pub wake_up_ns: i64,
    pub desired_present_ns: i64,
    pub predicted_display_ns: i64,
    pub when_woke_ns: i64,
    pub when_began_ns: i64,
    pub when_submitted_ns: i64,
    pub actual_present_ns: i64,
    pub earliest_present_ns: i64,
    pub present_margin_ns: i64,
    pub app_time_ns: i64,
}

impl Default for FrameRecord {
    fn default() -> Self {
        Self {
            frame_id: -1,
            phase: FramePhase::Cleared,
            when_predict_ns: 0,
            wake_up_ns: 0,
            desired_present_ns: 0,
            predicted_display_ns: 0,
            when_woke_ns: 0,
            when_began_ns: 0,
            when_submitted_ns: 0,
            actual_present_ns: 0,
            earliest_present_ns: 0,
            present_margin_ns: 0,
            app_time_ns: 0,
        }
    }
}

/// What `predict` hands the render loop for one upcoming frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub frame_id: i64,
    pub wake_up_ns: i64,
    pub desired_present_ns: i64,
    pub present_slop_ns: i64,
    pub predicted_display_ns: i64,
    pub period_ns: i64,
    pub min_period_ns: i64,
}

/// The pacing interface shared by both engines.
pub trait FramePacer: Send {
    /// Predicts the next frame. Returned `predicted_display_ns` values are
    /// non-decreasing across calls.
    fn predict(&mut self, now_ns: i64) -> Prediction;

    /// Advances a frame's phase. Out-of-order marks are programmer errors:
    /// they panic in debug builds and are logged and ignored in release.
    fn mark_point(&mut self, phase: FramePhase, frame_id: i64, when_ns: i64);

    /// Records present feedback for a frame.
    fn info(
        &mut self,
        frame_id: i64,
        desired_present_ns: i64,
        actual_present_ns: i64,
        earliest_present_ns: i64,
        present_margin_ns: i64,
    );

    fn period_ns(&self) -> i64;
}

pub(crate) fn record_slot(frame_id: i64) -> usize {
    (frame_id.rem_euclid(NUM_FRAMES as i64)) as usize
}

/// Shared mark_point plumbing: validates the id and the phase order.
pub(crate) fn mark_record(
    frames: &mut [FrameRecord; NUM_FRAMES],
    phase: FramePhase,
    frame_id: i64,
    when_ns: i64,
) {
    let record = &mut frames[record_slot(frame_id)];
    if record.frame_id != frame_id {
        debug_assert!(false, "mark_point for unknown frame {frame_id}");
        tracing::warn!(frame_id, "mark_point for unknown frame");
        return;
    }

    let expected_prev = match phase {
        FramePhase::Woke => FramePhase::Predicted,
        FramePhase::Began => FramePhase::Woke,
        FramePhase::Submitted => FramePhase::Began,
        _ => {
            debug_assert!(false, "invalid mark_point phase {phase:?}");
            tracing::warn!(?phase, "invalid mark_point phase");
            return;
        }
    };

    if record.phase != expected_prev {
        debug_assert!(
            false,
            "out-of-order mark for frame {frame_id}: {:?} -> {phase:?}",
            record.phase
        );
        tracing::warn!(
            frame_id,
            from = ?record.phase,
            to = ?phase,
            "ignoring out-of-order frame mark"
        );
        return;
    }

    match phase {
        FramePhase::Woke => record.when_woke_ns = when_ns,
        FramePhase::Began => record.when_began_ns = when_ns,
        FramePhase::Submitted => record.when_submitted_ns = when_ns,
        _ => unreachable!(),
    }

    record.phase = phase;
}
