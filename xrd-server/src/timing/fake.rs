// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The open-loop pacer, used when the presentation path offers no timing
//! feedback. Display times advance on a fixed affine grid; feedback is
//! accepted but ignored.

use tracing::warn;

use super::{FramePacer, FramePhase, Prediction, NUM_FRAMES};

/// Mirrors the closed-loop constants so a client can't tell which pacer
/// is driving it from the shape of the numbers alone.
const PRESENT_OFFSET_NS: i64 = 4_000_000;
const PRESENT_SLOP_NS: i64 = 500_000;
const APP_TIME_PCT: i64 = 10;
const MARGIN_NS: i64 = 1_000_000;

pub struct FakeTiming {
    frame_period_ns: i64,
    app_time_ns: i64,
    last_display_ns: i64,
    next_frame_id: i64,
    // Only enough state to sanity-check marks.
    issued: [i64; NUM_FRAMES],
}

impl FakeTiming {
    pub fn new(frame_period_ns: i64) -> Self {
        assert!(frame_period_ns > 0);

        Self {
            frame_period_ns,
            app_time_ns: frame_period_ns * APP_TIME_PCT / 100,
            last_display_ns: 0,
            next_frame_id: 0,
            issued: [-1; NUM_FRAMES],
        }
    }
}

impl FramePacer for FakeTiming {
    fn predict(&mut self, now_ns: i64) -> Prediction {
        // The smallest whole number of periods that beats the deadline.
        let mut predicted_display_ns = self.last_display_ns + self.frame_period_ns;
        while predicted_display_ns < now_ns + PRESENT_OFFSET_NS + self.app_time_ns {
            predicted_display_ns += self.frame_period_ns;
        }

        self.last_display_ns = predicted_display_ns;

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        self.issued[(frame_id % NUM_FRAMES as i64) as usize] = frame_id;

        let desired_present_ns = predicted_display_ns - PRESENT_OFFSET_NS;

        Prediction {
            frame_id,
            wake_up_ns: desired_present_ns - (self.app_time_ns + MARGIN_NS),
            desired_present_ns,
            present_slop_ns: PRESENT_SLOP_NS,
            predicted_display_ns,
            period_ns: self.frame_period_ns,
            min_period_ns: self.frame_period_ns,
        }
    }

    fn mark_point(&mut self, phase: FramePhase, frame_id: i64, _when_ns: i64) {
        if !matches!(
            phase,
            FramePhase::Woke | FramePhase::Began | FramePhase::Submitted
        ) {
            warn!(?phase, frame_id, "invalid mark_point phase");
            return;
        }

        if self.issued[(frame_id.rem_euclid(NUM_FRAMES as i64)) as usize] != frame_id {
            warn!(frame_id, "mark_point for unknown frame");
        }
    }

    fn info(
        &mut self,
        frame_id: i64,
        _desired_present_ns: i64,
        _actual_present_ns: i64,
        _earliest_present_ns: i64,
        _present_margin_ns: i64,
    ) {
        if self.issued[(frame_id.rem_euclid(NUM_FRAMES as i64)) as usize] != frame_id {
            warn!(frame_id, "feedback for unknown frame");
        }
    }

    fn period_ns(&self) -> i64 {
        self.frame_period_ns
    }
}
