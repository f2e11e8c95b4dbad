// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The per-session state machine and frame-loop interlocks.
//!
//! State transitions are driven from two sides: request handlers (create,
//! begin/end session, request_exit, the first begin_frame) and the central
//! `update_server_state` pass, which owns visibility and focus. Every
//! transition lands a state-change event on the client's ring.

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use xrd_protocol::{EventPayload, SessionState};

use super::events::EventQueue;
use crate::error::SessionError;

/// A client may have at most this many `wait_frame` calls in flight.
pub const MAX_ACTIVE_WAITS: u8 = 2;

#[derive(Debug)]
pub struct SessionData {
    pub state: SessionState,
    /// Between `begin_session` and `end_session`.
    pub running: bool,
    pub exit_requested: bool,

    pub overlay: bool,
    pub z_order: i32,
    pub visible: bool,
    pub focused: bool,
    /// Last overlay-visibility value announced to the client.
    pub overlay_visible: bool,

    pub frames_waited: i64,
    pub frames_begun: i64,
    last_waited_frame: i64,
    in_frame: Option<i64>,
}

/// The outcome of a valid `begin_frame`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Rendered,
    /// The prediction has already passed; the frame won't be shown.
    Discarded,
}

pub struct Session {
    data: Mutex<SessionData>,
    sem: BeginSem,
    active_waits: Mutex<u8>,
    /// Log transitions at info instead of debug (XRD_VERBOSE_LIFECYCLE).
    verbose_lifecycle: bool,
}

impl Session {
    pub fn new(verbose_lifecycle: bool) -> Self {
        Self {
            data: Mutex::new(SessionData {
                state: SessionState::Idle,
                running: false,
                exit_requested: false,
                overlay: false,
                z_order: 0,
                visible: false,
                focused: false,
                overlay_visible: false,
                frames_waited: 0,
                frames_begun: 0,
                last_waited_frame: -1,
                in_frame: None,
            }),
            sem: BeginSem::new(),
            active_waits: Mutex::new(0),
            verbose_lifecycle,
        }
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&mut SessionData) -> R) -> R {
        f(&mut self.data.lock())
    }

    pub fn state(&self) -> SessionState {
        self.data.lock().state
    }

    /// Moves to `new`, enqueuing the state-change event. Unexpected edges
    /// are logged but honored; the callers are the authority.
    pub fn transition(&self, new: SessionState, events: &EventQueue, now_ns: i64) {
        let mut data = self.data.lock();
        if data.state == new {
            return;
        }

        if !edge_expected(data.state, new) {
            warn!(from = ?data.state, to = ?new, "unexpected session transition");
        }

        if self.verbose_lifecycle {
            info!(from = ?data.state, to = ?new, "session transition");
        } else {
            debug!(from = ?data.state, to = ?new, "session transition");
        }

        data.state = new;
        drop(data);

        events.push(
            now_ns as u64,
            EventPayload::SessionStateChanged { state: new },
        );
    }

    // --- session lifecycle ------------------------------------------------

    pub fn create(&self, events: &EventQueue, now_ns: i64) -> Result<(), SessionError> {
        {
            let data = self.data.lock();
            if data.state != SessionState::Idle {
                return Err(SessionError::call_order("session already exists"));
            }
        }

        self.transition(SessionState::Ready, events, now_ns);
        Ok(())
    }

    pub fn begin(&self) -> Result<(), SessionError> {
        let mut data = self.data.lock();

        if data.state == SessionState::Idle {
            return Err(SessionError::call_order("no session"));
        }

        if data.running {
            return Err(SessionError::call_order("session already begun"));
        }

        data.running = true;
        Ok(())
    }

    pub fn end(&self, events: &EventQueue, now_ns: i64) -> Result<(), SessionError> {
        {
            let mut data = self.data.lock();
            if !data.running {
                return Err(SessionError::call_order("session not begun"));
            }

            if data.state != SessionState::Stopping {
                return Err(SessionError::call_order(
                    "end_session before exit was requested",
                ));
            }

            data.running = false;
            data.visible = false;
            data.focused = false;
        }

        // Unblock any wait_frame parked on the semaphore.
        self.sem.post();

        self.transition(SessionState::Idle, events, now_ns);
        if self.data.lock().exit_requested {
            self.transition(SessionState::Exiting, events, now_ns);
        }

        Ok(())
    }

    pub fn request_exit(&self, events: &EventQueue, now_ns: i64) -> Result<(), SessionError> {
        {
            let mut data = self.data.lock();
            if data.state == SessionState::Idle {
                return Err(SessionError::call_order("no session"));
            }

            data.exit_requested = true;
        }

        self.transition(SessionState::Stopping, events, now_ns);
        Ok(())
    }

    /// IPC or device loss: LOSS_PENDING now, EXITING after the drain.
    pub fn lose(&self, events: &EventQueue, now_ns: i64) {
        self.transition(SessionState::LossPending, events, now_ns);
        self.sem.close();
    }

    /// Wakes any thread parked on the begin/wait semaphore with an error;
    /// used at service shutdown.
    pub fn interrupt(&self) {
        self.sem.close();
    }

    // --- frame loop interlocks --------------------------------------------

    /// The entry half of `wait_frame`: reserves an active-wait slot and
    /// takes the begin/wait semaphore, blocking if a frame is in flight.
    pub fn begin_wait(&self) -> Result<(), SessionError> {
        if !self.data.lock().running {
            return Err(SessionError::call_order("session not begun"));
        }

        {
            let mut waits = self.active_waits.lock();
            if *waits >= MAX_ACTIVE_WAITS {
                return Err(SessionError::call_order(
                    "too many outstanding wait_frame calls",
                ));
            }

            *waits += 1;
        }

        if !self.sem.try_acquire() {
            if self.data.lock().frames_begun == 0 {
                self.abort_wait();
                return Err(SessionError::call_order(
                    "wait_frame before the prior frame was begun",
                ));
            }

            if !self.sem.acquire() {
                self.abort_wait();
                return Err(SessionError::Ipc("session closed during wait_frame".into()));
            }
        }

        Ok(())
    }

    /// Records the frame id handed out by the timing helper.
    pub fn note_waited(&self, frame_id: i64) {
        let mut data = self.data.lock();
        data.frames_waited += 1;
        data.last_waited_frame = frame_id;
    }

    /// Rolls back a failed `begin_wait`.
    pub fn abort_wait(&self) {
        let mut waits = self.active_waits.lock();
        *waits = waits.saturating_sub(1);
    }

    /// Rolls back a wait that already took the semaphore, returning the
    /// permit so the frame loop isn't wedged.
    pub fn cancel_wait(&self) {
        self.abort_wait();
        self.sem.post();
    }

    pub fn active_waits(&self) -> u8 {
        *self.active_waits.lock()
    }

    /// Validates and accounts a `begin_frame`. On success the semaphore is
    /// posted, letting the next `wait_frame` through.
    pub fn begin_frame(&self, frame_id: i64, discarded: bool) -> Result<BeginOutcome, SessionError> {
        {
            let mut data = self.data.lock();

            if !data.running {
                return Err(SessionError::call_order("session not begun"));
            }

            if data.frames_begun == data.frames_waited {
                return Err(SessionError::call_order("begin_frame without wait_frame"));
            }

            if frame_id != data.last_waited_frame {
                return Err(SessionError::validation(format!(
                    "begin_frame for unknown frame {frame_id}"
                )));
            }

            if data.in_frame.is_some() {
                return Err(SessionError::call_order("frame already begun"));
            }

            data.frames_begun += 1;
            data.in_frame = Some(frame_id);
        }

        {
            let mut waits = self.active_waits.lock();
            *waits = waits.saturating_sub(1);
        }

        self.sem.post();

        Ok(if discarded {
            BeginOutcome::Discarded
        } else {
            BeginOutcome::Rendered
        })
    }

    /// Validates an `end_frame` and closes out the in-flight frame.
    pub fn end_frame(&self, frame_id: i64) -> Result<(), SessionError> {
        let mut data = self.data.lock();

        match data.in_frame {
            Some(id) if id == frame_id => {
                data.in_frame = None;
                Ok(())
            }
            Some(id) => Err(SessionError::validation(format!(
                "end_frame for frame {frame_id}, but frame {id} is in flight"
            ))),
            None => Err(SessionError::call_order("end_frame without begin_frame")),
        }
    }
}

/// The begin/wait semaphore, capacity one. `close` wakes parked waiters
/// so a dying session can't strand its worker.
struct BeginSem {
    state: Mutex<SemState>,
    cond: Condvar,
}

struct SemState {
    permits: u8,
    closed: bool,
}

impl BeginSem {
    fn new() -> Self {
        Self {
            state: Mutex::new(SemState {
                permits: 1,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Blocks for a permit. Returns false if the semaphore was closed.
    fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }

            if state.permits > 0 {
                state.permits -= 1;
                return true;
            }

            self.cond.wait(&mut state);
        }
    }

    fn post(&self) {
        let mut state = self.state.lock();
        state.permits = 1;
        self.cond.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// The transition edges the design calls for. Others are logged.
fn edge_expected(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    matches!(
        (from, to),
        (Idle, Ready)
            | (Ready, Synchronized)
            | (Synchronized, Visible)
            | (Visible, Focused)
            | (Focused, Visible)
            | (Visible, Synchronized)
            | (Focused, Synchronized)
            | (Stopping, Idle)
            | (Idle, Exiting)
            | (LossPending, Exiting)
            | (_, Stopping)
            | (_, LossPending)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_session() -> (Session, EventQueue) {
        let session = Session::new(false);
        let events = EventQueue::new();
        session.create(&events, 0).unwrap();
        session.begin().unwrap();

        (session, events)
    }

    #[test]
    fn lifecycle_events() {
        let session = Session::new(false);
        let events = EventQueue::new();

        session.create(&events, 1).unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        session.begin().unwrap();
        session.request_exit(&events, 2).unwrap();
        assert_eq!(session.state(), SessionState::Stopping);

        session.end(&events, 3).unwrap();
        assert_eq!(session.state(), SessionState::Exiting);

        let states: Vec<_> = std::iter::from_fn(|| events.pop())
            .map(|ev| match ev.payload {
                EventPayload::SessionStateChanged { state } => state,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();

        assert_eq!(
            states,
            vec![
                SessionState::Ready,
                SessionState::Stopping,
                SessionState::Idle,
                SessionState::Exiting,
            ]
        );
    }

    #[test]
    fn end_session_requires_stopping() {
        let (session, events) = running_session();

        assert!(matches!(
            session.end(&events, 0),
            Err(SessionError::CallOrder(_))
        ));
    }

    #[test]
    fn wait_begin_balance() {
        let (session, _events) = running_session();

        // An arbitrary run of wait/begin pairs leaves the interlocks
        // balanced.
        for frame in 0..20 {
            session.begin_wait().unwrap();
            session.note_waited(frame);
            assert_eq!(session.active_waits(), 1);

            session.begin_frame(frame, false).unwrap();
            session.end_frame(frame).unwrap();
            assert_eq!(session.active_waits(), 0);
        }
    }

    #[test]
    fn second_wait_without_begin_is_call_order() {
        let (session, _events) = running_session();

        session.begin_wait().unwrap();
        session.note_waited(0);

        // No begin_frame has ever completed, so rather than deadlock the
        // second wait fails.
        assert!(matches!(
            session.begin_wait(),
            Err(SessionError::CallOrder(_))
        ));

        // The failed wait didn't leak an active-wait slot.
        assert_eq!(session.active_waits(), 1);
    }

    #[test]
    fn begin_without_wait_is_call_order() {
        let (session, _events) = running_session();

        assert!(matches!(
            session.begin_frame(0, false),
            Err(SessionError::CallOrder(_))
        ));
    }

    #[test]
    fn begin_frame_wrong_id() {
        let (session, _events) = running_session();

        session.begin_wait().unwrap();
        session.note_waited(5);

        assert!(matches!(
            session.begin_frame(6, false),
            Err(SessionError::Validation(_))
        ));

        // The right id still goes through.
        session.begin_frame(5, false).unwrap();
    }

    #[test]
    fn end_frame_requires_begin() {
        let (session, _events) = running_session();

        assert!(matches!(
            session.end_frame(0),
            Err(SessionError::CallOrder(_))
        ));
    }

    #[test]
    fn closed_sem_unblocks_waiter() {
        let (session, events) = running_session();
        let session = std::sync::Arc::new(session);

        session.begin_wait().unwrap();
        session.note_waited(0);
        session.begin_frame(0, false).unwrap();
        session.begin_wait().unwrap();
        session.note_waited(1);

        // A third wait parks on the semaphore; losing the session frees it.
        let waiter = {
            let session = session.clone();
            std::thread::spawn(move || session.begin_wait())
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        session.lose(&events, 99);

        assert!(matches!(
            waiter.join().unwrap(),
            Err(SessionError::Ipc(_))
        ));
    }

    #[test]
    fn loss_pending_event_enqueued_on_lose() {
        let (session, events) = running_session();

        session.lose(&events, 50);
        assert_eq!(session.state(), SessionState::LossPending);

        let ev = events.pop().unwrap();
        assert!(matches!(
            ev.payload,
            EventPayload::SessionStateChanged {
                state: SessionState::LossPending
            }
        ));
    }
}
