// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The closed-loop pacer, used when the presentation path reports actual
//! present times. It budgets a per-frame app time and adapts it: misses
//! grow the budget quickly, persistent excess margin shrinks it slowly.

use tracing::trace;

use super::{mark_record, record_slot, FramePacer, FramePhase, FrameRecord, Prediction, NUM_FRAMES};

/// Presents later than desired by more than this count as misses.
pub const PRESENT_SLOP_NS: i64 = 500_000;

/// Initial app time, as a fraction of the frame period.
const APP_TIME_INITIAL_PCT: i64 = 10;
/// Growth applied on a missed frame (4% of the period).
const ADJUST_MISSED_PCT: i64 = 4;
/// Nudge applied when the margin drifts (2% of the period).
const ADJUST_NON_MISS_PCT: i64 = 2;
/// Ceiling for the adaptive app time (30% of the period).
const APP_TIME_MAX_PCT: i64 = 30;

/// Scan-out lag: how long after the desired present the image lights up.
const PRESENT_OFFSET_NS: i64 = 4_000_000;
/// The margin the controller steers towards.
const TARGET_MARGIN_NS: i64 = 1_000_000;

pub struct DisplayTiming {
    frame_period_ns: i64,
    app_time_ns: i64,
    margin_ns: i64,
    present_offset_ns: i64,

    adjust_missed_ns: i64,
    adjust_non_miss_ns: i64,
    app_time_max_ns: i64,

    next_frame_id: i64,
    frames: [FrameRecord; NUM_FRAMES],
}

impl DisplayTiming {
    pub fn new(frame_period_ns: i64) -> Self {
        assert!(frame_period_ns > 0);

        Self {
            frame_period_ns,
            app_time_ns: frame_period_ns * APP_TIME_INITIAL_PCT / 100,
            margin_ns: TARGET_MARGIN_NS,
            present_offset_ns: PRESENT_OFFSET_NS,
            adjust_missed_ns: frame_period_ns * ADJUST_MISSED_PCT / 100,
            adjust_non_miss_ns: frame_period_ns * ADJUST_NON_MISS_PCT / 100,
            app_time_max_ns: frame_period_ns * APP_TIME_MAX_PCT / 100,
            next_frame_id: 0,
            frames: [FrameRecord::default(); NUM_FRAMES],
        }
    }

    pub fn app_time_ns(&self) -> i64 {
        self.app_time_ns
    }

    pub fn adjust_missed_ns(&self) -> i64 {
        self.adjust_missed_ns
    }

    pub fn adjust_non_miss_ns(&self) -> i64 {
        self.adjust_non_miss_ns
    }

    /// The present time to walk forward from: the newest record with
    /// feedback or, failing that, a prediction. A late actual present
    /// pushes the base past the slots the frame actually occupied.
    fn base_present_ns(&self, now_ns: i64) -> i64 {
        let newest = self
            .frames
            .iter()
            .filter(|r| {
                matches!(
                    r.phase,
                    FramePhase::Predicted
                        | FramePhase::Woke
                        | FramePhase::Began
                        | FramePhase::Submitted
                        | FramePhase::Info
                )
            })
            .max_by_key(|r| r.frame_id);

        let Some(record) = newest else {
            // First frame: one period out from now, on a fresh grid.
            return now_ns;
        };

        let mut base = record.desired_present_ns;
        if record.phase == FramePhase::Info {
            while base < record.actual_present_ns {
                base += self.frame_period_ns;
            }
        }

        // The next frame presents strictly after the base frame.
        base + self.frame_period_ns
    }
}

impl FramePacer for DisplayTiming {
    fn predict(&mut self, now_ns: i64) -> Prediction {
        let headroom = self.app_time_ns + self.margin_ns;

        let mut desired_present_ns = self.base_present_ns(now_ns);
        while desired_present_ns < now_ns + headroom {
            desired_present_ns += self.frame_period_ns;
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let prediction = Prediction {
            frame_id,
            wake_up_ns: desired_present_ns - headroom,
            desired_present_ns,
            present_slop_ns: PRESENT_SLOP_NS,
            predicted_display_ns: desired_present_ns + self.present_offset_ns,
            period_ns: self.frame_period_ns,
            min_period_ns: self.frame_period_ns,
        };

        self.frames[record_slot(frame_id)] = FrameRecord {
            frame_id,
            phase: FramePhase::Predicted,
            when_predict_ns: now_ns,
            wake_up_ns: prediction.wake_up_ns,
            desired_present_ns,
            predicted_display_ns: prediction.predicted_display_ns,
            app_time_ns: self.app_time_ns,
            ..FrameRecord::default()
        };

        trace!(
            frame_id,
            desired_present_ns,
            wake_up_ns = prediction.wake_up_ns,
            "predicted frame"
        );

        prediction
    }

    fn mark_point(&mut self, phase: FramePhase, frame_id: i64, when_ns: i64) {
        mark_record(&mut self.frames, phase, frame_id, when_ns);
    }

    fn info(
        &mut self,
        frame_id: i64,
        desired_present_ns: i64,
        actual_present_ns: i64,
        earliest_present_ns: i64,
        present_margin_ns: i64,
    ) {
        let record = &mut self.frames[record_slot(frame_id)];
        if record.frame_id != frame_id {
            tracing::warn!(frame_id, "feedback for unknown frame");
            return;
        }

        record.phase = FramePhase::Info;
        record.actual_present_ns = actual_present_ns;
        record.earliest_present_ns = earliest_present_ns;
        record.present_margin_ns = present_margin_ns;

        if actual_present_ns > desired_present_ns + PRESENT_SLOP_NS {
            // Missed the slot. Grow the budget aggressively, up to the cap.
            let grown = (self.app_time_ns + self.adjust_missed_ns).min(self.app_time_max_ns);
            trace!(
                frame_id,
                late_ns = actual_present_ns - desired_present_ns,
                app_time_ns = grown,
                "frame missed its present slot"
            );

            self.app_time_ns = grown;
        } else if (present_margin_ns - TARGET_MARGIN_NS).abs() > self.adjust_non_miss_ns {
            let nudge = if present_margin_ns > TARGET_MARGIN_NS {
                -self.adjust_non_miss_ns
            } else {
                self.adjust_non_miss_ns
            };

            self.app_time_ns = (self.app_time_ns + nudge)
                .clamp(self.adjust_non_miss_ns, self.app_time_max_ns);
        }
    }

    fn period_ns(&self) -> i64 {
        self.frame_period_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: i64 = 11_111_111; // 90 Hz

    fn drive_frame(pacer: &mut DisplayTiming, now: i64, late_ns: i64, margin: i64) -> Prediction {
        let p = pacer.predict(now);
        pacer.mark_point(FramePhase::Woke, p.frame_id, p.wake_up_ns);
        pacer.mark_point(FramePhase::Began, p.frame_id, p.wake_up_ns + 100_000);
        pacer.mark_point(
            FramePhase::Submitted,
            p.frame_id,
            p.desired_present_ns - 1_000_000,
        );
        pacer.info(
            p.frame_id,
            p.desired_present_ns,
            p.desired_present_ns + late_ns,
            p.desired_present_ns,
            margin,
        );

        p
    }

    #[test]
    fn predictions_are_monotone() {
        let mut pacer = DisplayTiming::new(PERIOD);

        let mut last = 0;
        let mut now = 0;
        for _ in 0..100 {
            let p = pacer.predict(now);
            assert!(p.predicted_display_ns > last);
            last = p.predicted_display_ns;
            now += PERIOD / 3; // predict faster than the period
        }
    }

    #[test]
    fn steady_state_steps_one_period() {
        let mut pacer = DisplayTiming::new(PERIOD);

        let first = drive_frame(&mut pacer, 0, 0, TARGET_MARGIN_NS);
        let mut prev = first;
        for i in 1..100 {
            let now = first.wake_up_ns + i * PERIOD;
            let p = drive_frame(&mut pacer, now, 0, TARGET_MARGIN_NS);
            assert_eq!(p.desired_present_ns, prev.desired_present_ns + PERIOD);
            assert_eq!(
                p.predicted_display_ns,
                p.desired_present_ns + PRESENT_OFFSET_NS
            );
            prev = p;
        }

        // With on-target margins the app time holds its initial value.
        assert_eq!(pacer.app_time_ns(), PERIOD * 10 / 100);
    }

    // Feedback deltas of +3ms, 0, 0, 0, 0: the budget grows by exactly one
    // adjust_missed after the miss and stabilizes thereafter.
    #[test]
    fn controller_single_miss() {
        let mut pacer = DisplayTiming::new(PERIOD);
        let initial = pacer.app_time_ns();
        let adjust_missed = pacer.adjust_missed_ns();
        assert_eq!(adjust_missed, PERIOD * 4 / 100);

        let mut now = 0;
        for (i, late) in [3_000_000, 0, 0, 0, 0].iter().enumerate() {
            let p = drive_frame(&mut pacer, now, *late, TARGET_MARGIN_NS);
            now = p.desired_present_ns;

            if i == 0 {
                assert_eq!(pacer.app_time_ns(), initial + adjust_missed);
            }
        }

        assert_eq!(pacer.app_time_ns(), initial + adjust_missed);
    }

    // A missed frame occupies the next slot, so the following prediction
    // lands two periods past the missed frame's desired present.
    #[test]
    fn miss_skips_a_slot() {
        let mut pacer = DisplayTiming::new(PERIOD);

        let mut now = 0;
        let mut prev = drive_frame(&mut pacer, now, 0, TARGET_MARGIN_NS);
        for _ in 0..49 {
            now = prev.desired_present_ns;
            prev = drive_frame(&mut pacer, now, 0, TARGET_MARGIN_NS);
        }

        let missed = drive_frame(&mut pacer, prev.desired_present_ns, 3_000_000, TARGET_MARGIN_NS);
        let next = pacer.predict(missed.desired_present_ns);

        assert_eq!(next.desired_present_ns, missed.desired_present_ns + 2 * PERIOD);
    }

    #[test]
    fn app_time_capped() {
        let mut pacer = DisplayTiming::new(PERIOD);

        let mut now = 0;
        for _ in 0..20 {
            let p = drive_frame(&mut pacer, now, 4_000_000, TARGET_MARGIN_NS);
            now = p.desired_present_ns;
        }

        assert_eq!(pacer.app_time_ns(), PERIOD * 30 / 100);
    }

    #[test]
    fn margin_nudges_down() {
        let mut pacer = DisplayTiming::new(PERIOD);
        let initial = pacer.app_time_ns();

        // Plenty of spare margin: the budget shrinks by the small step.
        let p = drive_frame(&mut pacer, 0, 0, 5_000_000);
        assert_eq!(pacer.app_time_ns(), initial - pacer.adjust_non_miss_ns());

        // Margin slightly low: it grows back.
        drive_frame(&mut pacer, p.desired_present_ns, 0, 100_000);
        assert_eq!(pacer.app_time_ns(), initial);
    }

    #[test]
    #[should_panic]
    fn out_of_order_mark_panics_in_debug() {
        let mut pacer = DisplayTiming::new(PERIOD);
        let p = pacer.predict(0);
        pacer.mark_point(FramePhase::Submitted, p.frame_id, 1);
    }
}
