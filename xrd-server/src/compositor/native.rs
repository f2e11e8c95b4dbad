// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The native-compositor capability: the render loop's window onto the
//! actual display path. A Vulkan direct-mode implementation plugs in
//! behind the same trait; the built-in headless implementation paces
//! frames against the configured refresh rate and synthesizes present
//! feedback so the closed-loop pacer runs its real code path.

use xrd_protocol::EnvBlendMode;

use super::ResolvedLayer;
use crate::{
    clock,
    timing::{display::DisplayTiming, fake::FakeTiming, FramePacer, FramePhase},
};

/// One tick's identity and prediction, from `wait_frame`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NativeFrame {
    pub frame_id: i64,
    pub predicted_display_ns: i64,
    pub period_ns: i64,
}

/// Out-of-band signals from the presentation path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// The display went away; sessions escalate to LOSS_PENDING.
    Lost,
}

pub trait NativeCompositor: Send {
    /// Blocks until the next frame's wake-up point.
    fn wait_frame(&mut self) -> anyhow::Result<NativeFrame>;

    fn begin_frame(&mut self, frame_id: i64) -> anyhow::Result<()>;

    fn layer_begin(&mut self, frame_id: i64) -> anyhow::Result<()>;

    fn submit_layer(
        &mut self,
        client_id: u64,
        layer: &ResolvedLayer,
        blend_mode: EnvBlendMode,
    ) -> anyhow::Result<()>;

    fn layer_commit(&mut self, frame_id: i64) -> anyhow::Result<()>;

    fn poll_events(&mut self) -> Vec<NativeEvent>;

    fn destroy(&mut self) -> anyhow::Result<()>;
}

/// Statistics the headless compositor keeps per commit, mostly for tests
/// and the debug log.
#[derive(Debug, Default, Copy, Clone)]
pub struct CommitStats {
    pub frames: u64,
    pub layers: u64,
}

pub struct HeadlessCompositor {
    pacer: Box<dyn FramePacer>,
    current: Option<crate::timing::Prediction>,
    stats: CommitStats,
}

impl HeadlessCompositor {
    /// `with_feedback` selects the closed-loop pacer; without it, the
    /// open-loop one. Headless presents always complete on time, so the
    /// closed loop simply holds its initial budget.
    pub fn new(frame_period_ns: i64, with_feedback: bool) -> Self {
        let pacer: Box<dyn FramePacer> = if with_feedback {
            Box::new(DisplayTiming::new(frame_period_ns))
        } else {
            Box::new(FakeTiming::new(frame_period_ns))
        };

        Self {
            pacer,
            current: None,
            stats: CommitStats::default(),
        }
    }

    pub fn stats(&self) -> CommitStats {
        self.stats
    }
}

impl NativeCompositor for HeadlessCompositor {
    fn wait_frame(&mut self) -> anyhow::Result<NativeFrame> {
        let prediction = self.pacer.predict(clock::now_ns());

        clock::sleep_until(prediction.wake_up_ns);
        self.pacer
            .mark_point(FramePhase::Woke, prediction.frame_id, clock::now_ns());

        let frame = NativeFrame {
            frame_id: prediction.frame_id,
            predicted_display_ns: prediction.predicted_display_ns,
            period_ns: prediction.period_ns,
        };

        self.current = Some(prediction);
        Ok(frame)
    }

    fn begin_frame(&mut self, frame_id: i64) -> anyhow::Result<()> {
        self.pacer
            .mark_point(FramePhase::Began, frame_id, clock::now_ns());
        Ok(())
    }

    fn layer_begin(&mut self, _frame_id: i64) -> anyhow::Result<()> {
        Ok(())
    }

    fn submit_layer(
        &mut self,
        _client_id: u64,
        _layer: &ResolvedLayer,
        _blend_mode: EnvBlendMode,
    ) -> anyhow::Result<()> {
        self.stats.layers += 1;
        Ok(())
    }

    fn layer_commit(&mut self, frame_id: i64) -> anyhow::Result<()> {
        self.pacer
            .mark_point(FramePhase::Submitted, frame_id, clock::now_ns());
        self.stats.frames += 1;

        // No display means no real scan-out; report an ideal present so
        // the adaptive controller sees a closed loop.
        if let Some(prediction) = self.current.take() {
            let desired = prediction.desired_present_ns;
            self.pacer
                .info(prediction.frame_id, desired, desired, desired, 1_000_000);
        }

        Ok(())
    }

    fn poll_events(&mut self) -> Vec<NativeEvent> {
        Vec::new()
    }

    fn destroy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fast period so the sleep in wait_frame doesn't slow the suite.
    const PERIOD: i64 = 1_000_000;

    #[test]
    fn ticks_advance_monotonically() {
        let mut xc = HeadlessCompositor::new(PERIOD, true);

        let mut last = 0;
        for _ in 0..5 {
            let frame = xc.wait_frame().unwrap();
            assert!(frame.predicted_display_ns > last);
            last = frame.predicted_display_ns;

            xc.begin_frame(frame.frame_id).unwrap();
            xc.layer_begin(frame.frame_id).unwrap();
            xc.layer_commit(frame.frame_id).unwrap();
        }

        assert_eq!(xc.stats().frames, 5);
    }

    #[test]
    fn open_loop_variant_ticks_too() {
        let mut xc = HeadlessCompositor::new(PERIOD, false);

        let a = xc.wait_frame().unwrap();
        xc.begin_frame(a.frame_id).unwrap();
        xc.layer_commit(a.frame_id).unwrap();

        let b = xc.wait_frame().unwrap();
        assert!(b.predicted_display_ns > a.predicted_display_ns);
        assert_eq!(b.period_ns, PERIOD);
    }
}
