// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Per-client request handling. Each worker thread loops here: read one
//! datagram, dispatch, send exactly one reply. Validation failures go back
//! to the client; fatal errors fall out of the loop into the teardown
//! path, which marks the session lost and frees everything the client
//! owned.

use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::BytesMut;
use crossbeam_channel::Sender;
use slotmap::{new_key_type, Key, KeyData, SlotMap};
use tracing::{debug, info, trace, warn};
use uds::UnixSeqpacketConn;
use xrd_protocol as protocol;
use xrd_protocol::{EventPayload, Message, SessionState, Status};

use super::validation;
use crate::{
    clock,
    compositor::{LayerSource, LayerStack, ResolvedLayer},
    config::DebugConfig,
    error::SessionError,
    session::{
        generate_id,
        swapchain::{
            self, ImageAllocator, MemfdAllocator, Swapchain, SwapchainCarcass, SwapchainImages,
        },
        ClientHandle,
    },
    state::SharedState,
};

/// Swapchains one client may hold at once.
const MAX_SWAPCHAINS: usize = 64;

new_key_type! {
    struct SwapchainKey;
}

struct Outcome {
    status: Status,
    message: Message,
    fds: Vec<RawFd>,
}

impl Outcome {
    fn ok(message: impl Into<Message>) -> Result<Self, SessionError> {
        Ok(Self {
            status: Status::Ok,
            message: message.into(),
            fds: Vec::new(),
        })
    }

    fn with_fds(message: impl Into<Message>, fds: Vec<RawFd>) -> Result<Self, SessionError> {
        Ok(Self {
            status: Status::Ok,
            message: message.into(),
            fds,
        })
    }
}

struct ClientCtx {
    state: SharedState,
    gc_send: Sender<SwapchainCarcass>,
    conn: UnixSeqpacketConn,
    client_id: u64,
    handle: Arc<ClientHandle>,

    allocator: Arc<dyn ImageAllocator>,
    swapchains: SlotMap<SwapchainKey, Swapchain>,
    instance_id: Option<u64>,
    session_id: Option<u64>,
    debug: DebugConfig,

    scratch: BytesMut,
}

/// The worker entry point. Returns once the client is gone and every
/// resource it owned has been handed off or freed.
pub(super) fn serve(
    state: SharedState,
    gc_send: Sender<SwapchainCarcass>,
    conn: UnixSeqpacketConn,
    client_id: u64,
    handle: Arc<ClientHandle>,
) {
    let debug = state.lock().cfg.debug.clone();

    // If anything below panics, the client table entry still goes away;
    // unregistering twice is harmless.
    let state_clone = state.clone();
    scopeguard::defer! {
        state_clone.lock().unregister_client(client_id);
    }

    let mut ctx = ClientCtx {
        state,
        gc_send,
        conn,
        client_id,
        handle,
        allocator: Arc::new(MemfdAllocator {}),
        swapchains: SlotMap::with_key(),
        instance_id: None,
        session_id: None,
        debug,
        scratch: BytesMut::new(),
    };

    let reason = ctx.serve_loop();
    ctx.teardown(reason);
}

impl ClientCtx {
    /// Reads and answers requests until the peer goes away. `None` means a
    /// clean disconnect; `Some` carries the fatal error.
    fn serve_loop(&mut self) -> Option<SessionError> {
        let mut buf = vec![0u8; protocol::MAX_MESSAGE_SIZE];
        let mut fd_buf = [-1 as RawFd; 8];

        loop {
            let (len, _truncated, num_fds) = match self.conn.recv_fds(&mut buf, &mut fd_buf) {
                Ok(v) => v,
                Err(e) => return Some(e.into()),
            };

            if len == 0 {
                return None;
            }

            // Requests never carry handles; close any that arrived.
            for fd in fd_buf.iter().take(num_fds) {
                if *fd >= 0 {
                    drop(unsafe { OwnedFd::from_raw_fd(*fd) });
                }
            }

            let (sequence, message) = match protocol::decode_frame(&buf[..len]) {
                Ok(protocol::Frame::Request { sequence, message }) => (sequence, message),
                Ok(_) => {
                    return Some(SessionError::Ipc(
                        "client sent a non-request frame".into(),
                    ))
                }
                Err(e) => return Some(SessionError::Ipc(format!("malformed frame: {e}"))),
            };

            trace!(sequence, %message, "request");
            let opcode = message.opcode();

            match self.dispatch(message) {
                Ok(outcome) => {
                    if let Err(e) = self.send_reply(sequence, outcome) {
                        return Some(e);
                    }
                }
                Err(e) => {
                    debug!(sequence, status = ?e.status(), "request failed: {e}");

                    self.scratch.clear();
                    let send_res = protocol::encode_error_reply(
                        sequence,
                        opcode,
                        e.status(),
                        &e.to_string(),
                        &mut self.scratch,
                    )
                    .map_err(|enc| SessionError::runtime(enc.to_string()))
                    .and_then(|_| {
                        self.conn
                            .send(&self.scratch)
                            .map_err(SessionError::from)
                            .map(|_| ())
                    });

                    if e.is_fatal() {
                        return Some(e);
                    }

                    if let Err(send_err) = send_res {
                        return Some(send_err);
                    }
                }
            }
        }
    }

    fn send_reply(&mut self, sequence: u32, outcome: Outcome) -> Result<(), SessionError> {
        self.scratch.clear();
        protocol::encode_reply(
            sequence,
            outcome.status,
            &outcome.message,
            !outcome.fds.is_empty(),
            &mut self.scratch,
        )
        .map_err(|e| SessionError::runtime(e.to_string()))?;

        trace!(sequence, %outcome.message, num_fds = outcome.fds.len(), "reply");

        if outcome.fds.is_empty() {
            self.conn.send(&self.scratch)?;
        } else {
            self.conn.send_fds(&self.scratch, &outcome.fds)?;
        }

        Ok(())
    }

    fn dispatch(&mut self, message: Message) -> Result<Outcome, SessionError> {
        match message {
            Message::InstanceCreate(m) => self.instance_create(m),
            Message::SystemGetProperties(_) => self.system_get_properties(),
            Message::SessionCreate(m) => self.session_create(m),
            Message::SwapchainCreate(m) => self.swapchain_create(m),
            Message::SwapchainAcquire(m) => self.swapchain_acquire(m),
            Message::SwapchainWait(m) => self.swapchain_wait(m),
            Message::SwapchainRelease(m) => self.swapchain_release(m),
            Message::SwapchainDestroy(m) => self.swapchain_destroy(m),
            Message::BeginSession(m) => self.begin_session(m),
            Message::EndSession(_) => self.end_session(),
            Message::RequestExit(_) => self.request_exit(),
            Message::WaitFrame(_) => self.wait_frame(),
            Message::BeginFrame(m) => self.begin_frame(m),
            Message::EndFrame(m) => self.end_frame(m),
            Message::PollEvent(_) => self.poll_event(),
            Message::ApplyHaptic(m) => self.apply_haptic(m),
            other => Err(SessionError::validation(format!(
                "unexpected message {other}"
            ))),
        }
    }

    // --- instance and system ----------------------------------------------

    fn instance_create(&mut self, m: protocol::InstanceCreate) -> Result<Outcome, SessionError> {
        if self.instance_id.is_some() {
            return Err(SessionError::call_order("instance already created"));
        }

        validation::app_name(&m.app_name)?;

        let (shm_fd, device_table_offset) = {
            let state = self.state.lock();

            if self.debug.debug_views {
                if let Some(hmd) = state.devices.hmd().and_then(|d| d.hmd.as_ref()) {
                    for (eye, view) in hmd.views.iter().enumerate() {
                        debug!(eye, viewport = ?view.viewport, fov = ?view.fov, "view");
                    }
                }
            }

            if self.debug.debug_spaces {
                for origin in &state.devices.origins {
                    debug!(
                        name = %origin.name,
                        class = ?origin.class,
                        offset = ?origin.offset.position,
                        "tracking origin"
                    );
                }
            }

            (state.shm.raw_fd(), state.shm.layout().offset_devices)
        };

        let instance_id = generate_id();
        self.instance_id = Some(instance_id);
        *self.handle.app_name.lock() = m.app_name.clone();

        info!(app_name = %m.app_name, instance_id, "created instance");

        Outcome::with_fds(
            protocol::InstanceCreated {
                instance_id,
                device_table_offset,
            },
            vec![shm_fd],
        )
    }

    fn system_get_properties(&mut self) -> Result<Outcome, SessionError> {
        self.require_instance()?;

        let state = self.state.lock();
        let hmd = state
            .devices
            .hmd()
            .and_then(|d| d.hmd.as_ref())
            .ok_or(SessionError::DeviceLost)?;

        let view = &hmd.views[0];

        Outcome::ok(protocol::SystemProperties {
            view_count: 2,
            view_resolution: [view.viewport.width, view.viewport.height],
            refresh_hz: hmd.refresh_hz,
            hmd: protocol::HmdProperties {
                display_resolution: hmd.display_resolution,
                fovs: [hmd.views[0].fov, hmd.views[1].fov],
                ipd_m: (self.debug.ipd_mm / 1000.0) as f32,
            },
        })
    }

    // --- session lifecycle ------------------------------------------------

    fn session_create(&mut self, m: protocol::SessionCreate) -> Result<Outcome, SessionError> {
        self.require_instance()?;
        validation::graphics_binding(m.graphics_binding_type)?;

        let now_ns = clock::now_ns();

        self.handle.session.with_data(|d| {
            d.overlay = m.overlay;
            d.z_order = m.z_order;
        });

        self.handle.session.create(&self.handle.events, now_ns)?;

        let session_id = generate_id();
        self.session_id = Some(session_id);

        info!(
            session_id,
            overlay = m.overlay,
            z_order = m.z_order,
            "created session"
        );

        Outcome::ok(protocol::SessionCreated { session_id })
    }

    fn begin_session(&mut self, m: protocol::BeginSession) -> Result<Outcome, SessionError> {
        self.require_session()?;
        validation::view_config(m.primary_view_config)?;

        self.handle.session.begin()?;

        let overlay = self.handle.session.with_data(|d| d.overlay);
        if !overlay {
            let mut state = self.state.lock();
            state.set_active_primary(self.client_id);
            state.update_server_state(clock::now_ns());
        }

        Outcome::ok(protocol::SessionBegun {})
    }

    fn end_session(&mut self) -> Result<Outcome, SessionError> {
        self.require_session()?;

        let now_ns = clock::now_ns();
        self.handle.session.end(&self.handle.events, now_ns)?;

        {
            let mut state = self.state.lock();
            self.handle.slot.clear();
            state.shm.write_slot(self.handle.slot_index, false, 0, 0, 0);
            state.update_server_state(now_ns);
        }

        Outcome::ok(protocol::SessionEnded {})
    }

    fn request_exit(&mut self) -> Result<Outcome, SessionError> {
        self.require_session()?;

        self.handle
            .session
            .request_exit(&self.handle.events, clock::now_ns())?;

        Outcome::ok(protocol::ExitRequested {})
    }

    // --- swapchains -------------------------------------------------------

    fn swapchain_create(&mut self, m: protocol::SwapchainCreate) -> Result<Outcome, SessionError> {
        self.require_session()?;
        swapchain::validate_create_info(&m)?;

        if self.swapchains.len() >= MAX_SWAPCHAINS {
            return Err(SessionError::exhausted(format!(
                "swapchain limit ({MAX_SWAPCHAINS}) reached"
            )));
        }

        let fds = self
            .allocator
            .allocate(&m)
            .map_err(|e| SessionError::runtime(format!("image allocation failed: {e:#}")))?;

        let images = Arc::new(SwapchainImages { info: m, fds });
        let raw_fds: Vec<RawFd> = images.fds.iter().map(|fd| fd.as_raw_fd()).collect();

        let key = self.swapchains.insert(Swapchain::new(images));
        let swapchain_id = key.data().as_ffi();

        debug!(
            swapchain_id,
            width = m.width,
            height = m.height,
            image_count = m.image_count,
            "created swapchain"
        );

        Outcome::with_fds(
            protocol::SwapchainCreated {
                swapchain_id,
                image_count: m.image_count,
            },
            raw_fds,
        )
    }

    fn swapchain_acquire(&mut self, m: protocol::SwapchainAcquire) -> Result<Outcome, SessionError> {
        let chain = self.chain_mut(m.swapchain_id)?;
        let image_index = chain.acquire()?;

        Outcome::ok(protocol::ImageAcquired { image_index })
    }

    fn swapchain_wait(&mut self, m: protocol::SwapchainWait) -> Result<Outcome, SessionError> {
        let chain = self.chain_mut(m.swapchain_id)?;
        chain.wait(m.timeout_ns)?;

        Outcome::ok(protocol::ImageWaited {})
    }

    fn swapchain_release(&mut self, m: protocol::SwapchainRelease) -> Result<Outcome, SessionError> {
        let chain = self.chain_mut(m.swapchain_id)?;
        chain.release()?;

        Outcome::ok(protocol::ImageReleased {})
    }

    fn swapchain_destroy(&mut self, m: protocol::SwapchainDestroy) -> Result<Outcome, SessionError> {
        let key = SwapchainKey::from(KeyData::from_ffi(m.swapchain_id));
        let chain = self
            .swapchains
            .remove(key)
            .ok_or_else(|| SessionError::validation("no such swapchain"))?;

        // Deferred: the render task drops the carcass at its next safe
        // point, after any in-flight composite.
        let _ = self.gc_send.send(SwapchainCarcass {
            client_id: self.client_id,
            swapchain_id: m.swapchain_id,
            images: chain.images.clone(),
        });

        debug!(swapchain_id = m.swapchain_id, "queued swapchain for gc");

        Outcome::ok(protocol::SwapchainDestroyed {})
    }

    // --- frame loop -------------------------------------------------------

    fn wait_frame(&mut self) -> Result<Outcome, SessionError> {
        self.handle.session.begin_wait()?;

        if self.debug.wait_frame_sleep_ms > 0 {
            thread::sleep(Duration::from_millis(self.debug.wait_frame_sleep_ms));
        }

        let frame = self.handle.timing.predict(clock::now_ns());
        if frame.predicted_display_ns <= 0 {
            self.handle.session.cancel_wait();
            return Err(SessionError::runtime("non-positive display prediction"));
        }

        self.handle.session.note_waited(frame.frame_id);

        Outcome::ok(protocol::FrameWaited {
            frame_id: frame.frame_id,
            predicted_display_ns: frame.predicted_display_ns,
            predicted_display_period_ns: self.handle.timing.period_ns(),
        })
    }

    fn begin_frame(&mut self, m: protocol::BeginFrame) -> Result<Outcome, SessionError> {
        let now_ns = clock::now_ns();

        // A prediction that has already scanned out can't be rendered to.
        let discarded = self
            .handle
            .timing
            .frame(m.frame_id)
            .map(|f| f.predicted_display_ns < now_ns)
            .unwrap_or(false);

        let outcome = self.handle.session.begin_frame(m.frame_id, discarded)?;

        if self.handle.session.state() == SessionState::Ready {
            self.handle
                .session
                .transition(SessionState::Synchronized, &self.handle.events, now_ns);
        }

        self.handle.timing.mark_begun(m.frame_id, now_ns);

        Ok(Outcome {
            status: match outcome {
                crate::session::machine::BeginOutcome::Rendered => Status::Ok,
                crate::session::machine::BeginOutcome::Discarded => Status::FrameDiscarded,
            },
            message: protocol::FrameBegun {}.into(),
            fds: Vec::new(),
        })
    }

    fn end_frame(&mut self, m: protocol::EndFrame) -> Result<Outcome, SessionError> {
        let now_ns = clock::now_ns();

        self.handle.session.end_frame(m.frame_id)?;

        if m.display_time_ns <= 0 {
            return Err(SessionError::runtime("non-positive display time"));
        }

        if self.handle.slot.delivered_active()
            && m.display_time_ns < self.handle.slot.delivered_display_ns()
        {
            return Err(SessionError::validation(
                "display time regresses behind the delivered frame",
            ));
        }

        let mut layers = Vec::with_capacity(m.layers.len());
        for entry in &m.layers {
            validation::layer(entry)?;

            let mut sources = Vec::with_capacity(entry.sub_images.len());
            for sub in &entry.sub_images {
                let chain = self.chain(sub.swapchain_id)?;
                let image_index = chain.last_released().ok_or_else(|| {
                    SessionError::validation(
                        "layer references a swapchain with no released image",
                    )
                })?;

                sources.push(LayerSource {
                    images: chain.images.clone(),
                    image_index,
                    rect: sub.image_rect,
                    array_index: sub.array_index,
                });
            }

            layers.push(ResolvedLayer {
                entry: entry.clone(),
                sources,
            });
        }

        self.handle.slot.schedule(LayerStack {
            frame_id: m.frame_id,
            display_time_ns: m.display_time_ns,
            blend_mode: m.env_blend_mode,
            layers,
        });

        self.handle.timing.mark_submitted(m.frame_id, now_ns);

        Outcome::ok(protocol::FrameEnded {})
    }

    fn poll_event(&mut self) -> Result<Outcome, SessionError> {
        Outcome::ok(protocol::EventPolled {
            event: self.handle.events.pop(),
        })
    }

    fn apply_haptic(&mut self, m: protocol::ApplyHaptic) -> Result<Outcome, SessionError> {
        self.require_session()?;
        validation::haptic(&m)?;

        if !self.handle.session.with_data(|d| d.running) {
            return Err(SessionError::call_order("session not begun"));
        }

        self.state.lock().trigger_haptic(
            self.client_id,
            m.device_index,
            m.output_index,
            m.duration_ns,
            m.amplitude,
            clock::now_ns(),
        )?;

        Outcome::ok(protocol::HapticApplied {})
    }

    // --- plumbing ---------------------------------------------------------

    fn require_instance(&self) -> Result<(), SessionError> {
        self.instance_id
            .map(|_| ())
            .ok_or_else(|| SessionError::call_order("no instance"))
    }

    fn require_session(&self) -> Result<(), SessionError> {
        self.session_id
            .map(|_| ())
            .ok_or_else(|| SessionError::call_order("no session"))
    }

    fn chain(&self, id: u64) -> Result<&Swapchain, SessionError> {
        self.swapchains
            .get(SwapchainKey::from(KeyData::from_ffi(id)))
            .ok_or_else(|| SessionError::validation("no such swapchain"))
    }

    fn chain_mut(&mut self, id: u64) -> Result<&mut Swapchain, SessionError> {
        self.swapchains
            .get_mut(SwapchainKey::from(KeyData::from_ffi(id)))
            .ok_or_else(|| SessionError::validation("no such swapchain"))
    }

    /// Releases everything this client owned. On an unclean exit the
    /// session is declared lost first: LOSS_PENDING then EXITING go out
    /// over the direct event path, since the ring will never be polled
    /// again (it is cleared so nothing can be seen twice).
    fn teardown(&mut self, reason: Option<SessionError>) {
        let now_ns = clock::now_ns();

        match &reason {
            Some(e) => warn!(client_id = self.client_id, "client lost: {e}"),
            None => info!(client_id = self.client_id, "client disconnected"),
        }

        let clean = reason.is_none()
            && matches!(
                self.handle.session.state(),
                SessionState::Idle | SessionState::Exiting
            );

        if !clean {
            self.handle.session.lose(&self.handle.events, now_ns);
            self.handle
                .session
                .transition(SessionState::Exiting, &self.handle.events, now_ns);
            self.handle.events.clear();

            for event in [EventPayload::LossPending, EventPayload::Exiting] {
                self.scratch.clear();
                if protocol::encode_event(0, now_ns as u64, &event, &mut self.scratch).is_ok() {
                    let _ = self.conn.send(&self.scratch);
                }
            }
        }

        for (key, chain) in self.swapchains.drain() {
            let _ = self.gc_send.send(SwapchainCarcass {
                client_id: self.client_id,
                swapchain_id: key.data().as_ffi(),
                images: chain.images.clone(),
            });
        }

        self.state.lock().unregister_client(self.client_id);
    }
}
