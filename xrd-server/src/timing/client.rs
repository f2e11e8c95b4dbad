// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The per-client render-timing helper. The render loop broadcasts its
//! latest prediction to every client; `wait_frame` re-bases that shared
//! sample per client, stepping forward in whole periods so that each
//! client sees non-decreasing display times no matter how fast it spins.
//!
//! `predict` is also the frame-loop throttle: once a client has consumed
//! the current sample, the next call parks until the compositor
//! broadcasts a fresh one (bounded, so a stalled compositor degrades to
//! open-loop stepping instead of hanging the worker).

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Depth of the per-client frame ring.
pub const NUM_CLIENT_FRAMES: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub frame_id: i64,
    pub predicted_display_ns: i64,
    pub when_waited_ns: i64,
    pub when_begun_ns: i64,
    pub when_submitted_ns: i64,
}

impl Default for ClientFrame {
    fn default() -> Self {
        Self {
            frame_id: -1,
            predicted_display_ns: 0,
            when_waited_ns: 0,
            when_begun_ns: 0,
            when_submitted_ns: 0,
        }
    }
}

struct Inner {
    period_ns: i64,
    server_display_ns: i64,
    last_returned_display_ns: i64,
    next_frame_id: i64,
    frames: [ClientFrame; NUM_CLIENT_FRAMES],
}

pub struct ClientTiming {
    inner: Mutex<Inner>,
    tick: Condvar,
}

impl ClientTiming {
    pub fn new(period_ns: i64) -> Self {
        assert!(period_ns > 0);

        Self {
            inner: Mutex::new(Inner {
                period_ns,
                server_display_ns: 0,
                last_returned_display_ns: 0,
                next_frame_id: 0,
                frames: [ClientFrame::default(); NUM_CLIENT_FRAMES],
            }),
            tick: Condvar::new(),
        }
    }

    /// Called by the render loop with its latest prediction. Stale samples
    /// (a re-synchronizing compositor) are ignored.
    pub fn broadcast(&self, display_ns: i64, period_ns: i64) {
        let mut inner = self.inner.lock();

        if display_ns > inner.server_display_ns {
            inner.server_display_ns = display_ns;
        }

        if period_ns > 0 {
            inner.period_ns = period_ns;
        }

        self.tick.notify_all();
    }

    /// Predicts the next frame for this client: the newest server sample,
    /// advanced in whole periods past both `now` and anything previously
    /// returned. Re-prediction always re-bases on the server sample rather
    /// than extrapolating an extrapolation.
    ///
    /// This is also the frame-loop throttle: once this client has consumed
    /// the current sample, the call parks until the next vsync broadcast,
    /// bounded so a stalled compositor degrades to open-loop stepping.
    pub fn predict(&self, now_ns: i64) -> ClientFrame {
        let mut inner = self.inner.lock();

        if inner.server_display_ns == 0
            || inner.last_returned_display_ns >= inner.server_display_ns
        {
            let timeout = Duration::from_nanos(2 * inner.period_ns as u64);
            let _ = self.tick.wait_for(&mut inner, timeout);
        }

        let mut display_ns = inner.server_display_ns;
        while display_ns < now_ns || display_ns < inner.last_returned_display_ns {
            display_ns += inner.period_ns;
        }

        // Distinct frames get distinct display times.
        if display_ns == inner.last_returned_display_ns && inner.next_frame_id > 0 {
            display_ns += inner.period_ns;
        }

        let frame_id = inner.next_frame_id;
        inner.next_frame_id += 1;

        let frame = ClientFrame {
            frame_id,
            predicted_display_ns: display_ns,
            when_waited_ns: now_ns,
            when_begun_ns: 0,
            when_submitted_ns: 0,
        };

        inner.last_returned_display_ns = display_ns;
        inner.frames[slot(frame_id)] = frame;

        frame
    }

    pub fn period_ns(&self) -> i64 {
        self.inner.lock().period_ns
    }

    pub fn mark_begun(&self, frame_id: i64, when_ns: i64) {
        let mut inner = self.inner.lock();
        let record = &mut inner.frames[slot(frame_id)];
        if record.frame_id == frame_id {
            record.when_begun_ns = when_ns;
        }
    }

    pub fn mark_submitted(&self, frame_id: i64, when_ns: i64) {
        let mut inner = self.inner.lock();
        let record = &mut inner.frames[slot(frame_id)];
        if record.frame_id == frame_id {
            record.when_submitted_ns = when_ns;
        }
    }

    /// The prediction handed out for `frame_id`, if it's still in the ring.
    pub fn frame(&self, frame_id: i64) -> Option<ClientFrame> {
        let inner = self.inner.lock();
        let record = inner.frames[slot(frame_id)];
        (record.frame_id == frame_id).then_some(record)
    }
}

fn slot(frame_id: i64) -> usize {
    frame_id.rem_euclid(NUM_CLIENT_FRAMES as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: i64 = 11_111_111;

    #[test]
    fn first_prediction_uses_server_sample() {
        let timing = ClientTiming::new(PERIOD);
        timing.broadcast(100 * PERIOD, PERIOD);

        let frame = timing.predict(99 * PERIOD);
        assert_eq!(frame.predicted_display_ns, 100 * PERIOD);
        assert_eq!(frame.frame_id, 0);
    }

    #[test]
    fn repredictions_step_by_whole_periods() {
        let timing = ClientTiming::new(PERIOD);
        timing.broadcast(10 * PERIOD, PERIOD);

        // A client spinning faster than the compositor ticks.
        let a = timing.predict(9 * PERIOD);
        let b = timing.predict(9 * PERIOD + 1000);
        let c = timing.predict(9 * PERIOD + 2000);

        assert_eq!(a.predicted_display_ns, 10 * PERIOD);
        assert_eq!(b.predicted_display_ns, 11 * PERIOD);
        assert_eq!(c.predicted_display_ns, 12 * PERIOD);
    }

    #[test]
    fn monotone_across_interleaved_broadcasts() {
        let timing = ClientTiming::new(PERIOD);

        let mut last = 0;
        for tick in 1..200i64 {
            timing.broadcast(tick * PERIOD, PERIOD);

            // Stale rebroadcast must not regress anything.
            if tick % 7 == 0 {
                timing.broadcast((tick - 3) * PERIOD, PERIOD);
            }

            if tick % 2 == 0 {
                let frame = timing.predict((tick - 1) * PERIOD);
                assert!(frame.predicted_display_ns >= last);
                last = frame.predicted_display_ns;
            }
        }
    }

    #[test]
    fn stale_client_catches_up_to_now() {
        let timing = ClientTiming::new(PERIOD);
        timing.broadcast(PERIOD, PERIOD);

        // The client went quiet for a long time; predictions may not be in
        // the past.
        let frame = timing.predict(50 * PERIOD + 1);
        assert!(frame.predicted_display_ns > 50 * PERIOD);
    }

    #[test]
    fn marks_land_in_ring() {
        let timing = ClientTiming::new(PERIOD);
        timing.broadcast(PERIOD, PERIOD);

        let frame = timing.predict(0);
        timing.mark_begun(frame.frame_id, 123);
        timing.mark_submitted(frame.frame_id, 456);

        let stored = timing.frame(frame.frame_id).unwrap();
        assert_eq!(stored.when_begun_ns, 123);
        assert_eq!(stored.when_submitted_ns, 456);
    }
}
