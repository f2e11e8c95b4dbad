// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! End-to-end scenarios: a real service (headless compositor, fast
//! refresh) driven over a real seqpacket socket by protocol-level
//! clients.

use std::{
    io::Read,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bytes::BytesMut;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use uds::UnixSeqpacketConn;
use xrd_protocol as protocol;
use xrd_protocol::{
    EnvBlendMode, EventPayload, Frame, LayerEntry, LayerType, Message, Pose, Rect2D, SessionState,
    Status, SubImage,
};

use crate::{
    compositor::{
        native::HeadlessCompositor,
        render::{RenderControl, RenderLoop},
    },
    config::Config,
    device::{DeviceTable, SimulatedProvider},
    server::Server,
    shm::{self, ShmRegion},
    state::{ServerState, SharedState},
    waking_sender::WakingSender,
};

static NEXT_SOCKET: AtomicU32 = AtomicU32::new(0);

struct TestService {
    state: SharedState,
    socket_path: PathBuf,
    closer: WakingSender<()>,
    render_send: crossbeam_channel::Sender<RenderControl>,
    server_thread: Option<thread::JoinHandle<anyhow::Result<()>>>,
    render_thread: Option<thread::JoinHandle<anyhow::Result<()>>>,
}

impl TestService {
    fn start() -> Self {
        let mut cfg = Config::default();
        // Tick fast so scenarios settle quickly.
        cfg.display.refresh_hz = 250.0;

        let socket_path = std::env::temp_dir().join(format!(
            "xrd-test-{}-{}.sock",
            std::process::id(),
            NEXT_SOCKET.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&socket_path);

        let devices = DeviceTable::simulated(&cfg);
        let shm = ShmRegion::create(&devices, cfg.service.max_clients.get(), 1).unwrap();
        let state = Arc::new(Mutex::new(ServerState::new(
            cfg.clone(),
            devices,
            shm,
            Box::new(SimulatedProvider::default()),
        )));

        let (gc_send, gc_recv) = crossbeam_channel::unbounded();
        let (render_send, render_recv) = crossbeam_channel::bounded(1);
        let (ready_send, ready_recv) = oneshot::channel();

        let native = HeadlessCompositor::new(cfg.display.frame_period_ns(), true);
        let render_thread = RenderLoop::spawn(
            state.clone(),
            Box::new(native),
            gc_recv,
            render_recv,
            ready_send,
        );
        ready_recv.recv().unwrap();

        let listener = uds::UnixSeqpacketListener::bind(&socket_path).unwrap();
        let mut srv = Server::new(listener, state.clone(), gc_send).unwrap();
        let closer = srv.closer();

        let server_thread = thread::Builder::new()
            .name("xrd-test-server".into())
            .spawn(move || srv.run())
            .unwrap();

        Self {
            state,
            socket_path,
            closer,
            render_send,
            server_thread: Some(server_thread),
            render_thread: Some(render_thread),
        }
    }

    fn connect(&self) -> TestClient {
        TestClient::connect(&self.socket_path)
    }

    fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.closer.send(()).ok();
        if let Some(handle) = self.server_thread.take() {
            handle.join().unwrap().unwrap();
        }

        self.render_send.send(RenderControl::Shutdown).ok();
        if let Some(handle) = self.render_thread.take() {
            handle.join().unwrap().unwrap();
        }

        let _ = std::fs::remove_file(&self.socket_path);
    }
}

struct Reply {
    status: Status,
    message: Option<Message>,
    diagnostic: String,
    fds: Vec<OwnedFd>,
}

struct TestClient {
    conn: UnixSeqpacketConn,
    next_seq: u32,
}

impl TestClient {
    fn connect(path: &PathBuf) -> Self {
        // The listener may not have polled yet; retry briefly.
        for _ in 0..50 {
            if let Ok(conn) = UnixSeqpacketConn::connect(path) {
                return Self { conn, next_seq: 1 };
            }

            thread::sleep(Duration::from_millis(10));
        }

        panic!("failed to connect to {path:?}");
    }

    fn request(&mut self, message: impl Into<Message>) -> Reply {
        let message = message.into();
        let sequence = self.next_seq;
        self.next_seq += 1;

        let mut buf = BytesMut::new();
        protocol::encode_request(sequence, &message, &mut buf).unwrap();
        self.conn.send(&buf).unwrap();

        let mut recv_buf = vec![0u8; protocol::MAX_MESSAGE_SIZE];
        let mut fd_buf = [-1 as RawFd; 8];

        loop {
            let (len, _truncated, num_fds) =
                self.conn.recv_fds(&mut recv_buf, &mut fd_buf).unwrap();
            assert!(len > 0, "server hung up mid-request");

            let fds = fd_buf
                .iter()
                .take(num_fds)
                .map(|&fd| unsafe { OwnedFd::from_raw_fd(fd) })
                .collect();

            match protocol::decode_frame(&recv_buf[..len]).unwrap() {
                Frame::Reply {
                    sequence: seq,
                    status,
                    message,
                    diagnostic,
                    ..
                } => {
                    assert_eq!(seq, sequence, "reply for the wrong request");
                    return Reply {
                        status,
                        message,
                        diagnostic,
                        fds,
                    };
                }
                // Direct event frames only show up on teardown paths.
                Frame::Event { .. } => continue,
                Frame::Request { .. } => panic!("server sent a request"),
            }
        }
    }

    fn expect_ok(&mut self, message: impl Into<Message>) -> Message {
        let reply = self.request(message);
        assert_eq!(reply.status, Status::Ok, "{}", reply.diagnostic);
        reply.message.unwrap()
    }

    // --- convenience ------------------------------------------------------

    fn create_instance(&mut self, app_name: &str) -> Vec<OwnedFd> {
        let reply = self.request(protocol::InstanceCreate {
            app_name: app_name.into(),
        });
        assert_eq!(reply.status, Status::Ok, "{}", reply.diagnostic);
        reply.fds
    }

    fn start_session(&mut self, overlay: bool, z_order: i32) {
        self.expect_ok(protocol::SessionCreate {
            graphics_binding_type: 0,
            binding_args: Vec::new(),
            overlay,
            z_order,
        });
        self.expect_ok(protocol::BeginSession {
            primary_view_config: 1,
        });
    }

    fn create_swapchain(&mut self, image_count: u32) -> (u64, Vec<OwnedFd>) {
        let reply = self.request(protocol::SwapchainCreate {
            width: 64,
            height: 64,
            format: 0,
            sample_count: 1,
            array_size: 1,
            mip_count: 1,
            image_count,
        });
        assert_eq!(reply.status, Status::Ok, "{}", reply.diagnostic);

        match reply.message.unwrap() {
            Message::SwapchainCreated(m) => {
                assert_eq!(m.image_count, image_count);
                assert_eq!(reply.fds.len(), image_count as usize);
                (m.swapchain_id, reply.fds)
            }
            other => panic!("unexpected reply {other}"),
        }
    }

    fn cycle_image(&mut self, swapchain_id: u64) -> u32 {
        let acquired = match self.expect_ok(protocol::SwapchainAcquire { swapchain_id }) {
            Message::ImageAcquired(m) => m.image_index,
            other => panic!("unexpected reply {other}"),
        };

        self.expect_ok(protocol::SwapchainWait {
            swapchain_id,
            timeout_ns: -1,
        });
        self.expect_ok(protocol::SwapchainRelease { swapchain_id });

        acquired
    }

    fn wait_frame(&mut self) -> protocol::FrameWaited {
        match self.expect_ok(protocol::WaitFrame {}) {
            Message::FrameWaited(m) => m,
            other => panic!("unexpected reply {other}"),
        }
    }

    /// One whole frame: wait, begin, submit a quad from the swapchain.
    fn submit_frame(&mut self, swapchain_id: u64) -> protocol::FrameWaited {
        let frame = self.wait_frame();

        let begin = self.request(protocol::BeginFrame {
            frame_id: frame.frame_id,
        });
        assert!(begin.status.is_success(), "{}", begin.diagnostic);

        self.cycle_image(swapchain_id);
        self.expect_ok(protocol::EndFrame {
            frame_id: frame.frame_id,
            display_time_ns: frame.predicted_display_ns,
            env_blend_mode: EnvBlendMode::Opaque,
            layers: vec![quad_layer(swapchain_id)],
        });

        frame
    }

    fn drain_events(&mut self) -> Vec<EventPayload> {
        let mut out = Vec::new();
        loop {
            match self.expect_ok(protocol::PollEvent {}) {
                Message::EventPolled(m) => match m.event {
                    Some(ev) => out.push(ev.payload),
                    None => return out,
                },
                other => panic!("unexpected reply {other}"),
            }
        }
    }
}

fn quad_layer(swapchain_id: u64) -> LayerEntry {
    LayerEntry {
        layer_type: LayerType::Quad,
        flags: 0,
        pose: Pose::IDENTITY,
        sub_images: vec![SubImage {
            swapchain_id,
            image_rect: Rect2D {
                x: 0,
                y: 0,
                width: 64,
                height: 64,
            },
            array_index: 0,
        }],
    }
}

fn settle() {
    // A few compositor ticks at 250 Hz.
    thread::sleep(Duration::from_millis(30));
}

#[test_log::test]
fn solo_session_reaches_focused() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("steady");
    client.start_session(false, 0);
    let (swapchain, _fds) = client.create_swapchain(3);

    let mut last_display = 0;
    for _ in 0..30 {
        let frame = client.submit_frame(swapchain);
        assert!(
            frame.predicted_display_ns >= last_display,
            "prediction regressed"
        );
        last_display = frame.predicted_display_ns;
    }

    settle();

    // The session walked Ready -> Synchronized -> Visible -> Focused, in
    // order, with no other transitions.
    let states: Vec<SessionState> = client
        .drain_events()
        .into_iter()
        .filter_map(|ev| match ev {
            EventPayload::SessionStateChanged { state } => Some(state),
            _ => None,
        })
        .collect();

    assert_eq!(
        states,
        vec![
            SessionState::Ready,
            SessionState::Synchronized,
            SessionState::Visible,
            SessionState::Focused,
        ]
    );
}

#[test_log::test]
fn instance_handshake_exposes_device_table() {
    let service = TestService::start();
    let mut client = service.connect();

    let mut fds = client.create_instance("handshake");
    assert_eq!(fds.len(), 1);

    // The fd is a mapping of the device table; parsing it back yields
    // exactly the table the service built.
    let mut bytes = Vec::new();
    std::fs::File::from(fds.remove(0))
        .read_to_end(&mut bytes)
        .unwrap();

    let (parsed, _epoch) = shm::parse_device_table(&bytes).unwrap();
    assert_eq!(parsed, service.state.lock().devices);

    // And the properties line up with the HMD block.
    match client.expect_ok(protocol::SystemGetProperties {}) {
        Message::SystemProperties(props) => {
            assert_eq!(props.view_count, 2);
            assert_eq!(props.refresh_hz, 250.0);
            assert_eq!(props.view_resolution, [1832, 1920]);
        }
        other => panic!("unexpected reply {other}"),
    }
}

#[test_log::test]
fn second_instance_is_call_order() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("one");
    let reply = client.request(protocol::InstanceCreate {
        app_name: "two".into(),
    });

    assert_eq!(reply.status, Status::CallOrder);
}

#[test_log::test]
fn swapchain_fifo_over_the_wire() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("fifo");
    client.start_session(false, 0);
    let (swapchain, _fds) = client.create_swapchain(3);

    let indices: Vec<u32> = (0..6).map(|_| client.cycle_image(swapchain)).collect();
    assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);

    // Exhausting the FIFO is a call-order error.
    for _ in 0..3 {
        client.expect_ok(protocol::SwapchainAcquire {
            swapchain_id: swapchain,
        });
    }

    let reply = client.request(protocol::SwapchainAcquire {
        swapchain_id: swapchain,
    });
    assert_eq!(reply.status, Status::CallOrder);
}

#[test_log::test]
fn back_pressure_second_wait_is_call_order() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("pressure");
    client.start_session(false, 0);

    client.wait_frame();

    // No begin_frame has ever completed; a second wait would deadlock a
    // serial connection, so it fails instead.
    let reply = client.request(protocol::WaitFrame {});
    assert_eq!(reply.status, Status::CallOrder);
}

#[test_log::test]
fn begin_frame_without_wait_is_call_order() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("order");
    client.start_session(false, 0);

    let reply = client.request(protocol::BeginFrame { frame_id: 0 });
    assert_eq!(reply.status, Status::CallOrder);
}

#[test_log::test]
fn stale_begin_frame_is_discarded() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("late");
    client.start_session(false, 0);

    let frame = client.wait_frame();

    // Sleep far past the predicted display time (4ms period).
    thread::sleep(Duration::from_millis(60));

    let reply = client.request(protocol::BeginFrame {
        frame_id: frame.frame_id,
    });
    assert_eq!(reply.status, Status::FrameDiscarded);
}

#[test_log::test]
fn two_overlays_over_one_primary() {
    let service = TestService::start();

    let mut primary = service.connect();
    primary.create_instance("primary");
    primary.start_session(false, 0);
    let (primary_chain, _a) = primary.create_swapchain(3);

    let mut overlay_hi = service.connect();
    overlay_hi.create_instance("overlay-hi");
    overlay_hi.start_session(true, 20);
    let (hi_chain, _b) = overlay_hi.create_swapchain(3);

    let mut overlay_lo = service.connect();
    overlay_lo.create_instance("overlay-lo");
    overlay_lo.start_session(true, 10);
    let (lo_chain, _c) = overlay_lo.create_swapchain(3);

    for _ in 0..10 {
        primary.submit_frame(primary_chain);
        overlay_hi.submit_frame(hi_chain);
        overlay_lo.submit_frame(lo_chain);
    }

    settle();

    // The composition plan puts the primary first, then overlays by
    // ascending z.
    let plan: Vec<String> = service
        .state
        .lock()
        .render_plan()
        .iter()
        .map(|(_, handle)| handle.app_name.lock().clone())
        .collect();
    assert_eq!(plan, vec!["primary", "overlay-lo", "overlay-hi"]);

    // Each overlay hears that it became visible over a primary, exactly
    // once.
    for overlay in [&mut overlay_hi, &mut overlay_lo] {
        let visibility: Vec<bool> = overlay
            .drain_events()
            .into_iter()
            .filter_map(|ev| match ev {
                EventPayload::OverlayVisibilityChanged { visible } => Some(visible),
                _ => None,
            })
            .collect();

        assert_eq!(visibility, vec![true]);
    }

    // The primary has focus; the overlays are visible but not focused.
    let focused: Vec<bool> = service
        .state
        .lock()
        .render_plan()
        .iter()
        .map(|(_, handle)| handle.session.with_data(|d| d.focused))
        .collect();
    assert_eq!(focused, vec![true, false, false]);
}

#[test_log::test]
fn client_drop_mid_session_leaves_service_serving() {
    let service = TestService::start();

    let mut doomed = service.connect();
    doomed.create_instance("doomed");
    doomed.start_session(false, 0);
    let (chain, _fds) = doomed.create_swapchain(3);
    doomed.submit_frame(chain);

    let mut survivor = service.connect();
    survivor.create_instance("survivor");
    survivor.start_session(true, 1);

    assert_eq!(service.client_count(), 2);

    // The doomed client vanishes without end_session.
    drop(doomed);

    // Its worker notices, tears the context down, and the service keeps
    // serving everyone else.
    for _ in 0..100 {
        if service.client_count() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(service.client_count(), 1);

    survivor.expect_ok(protocol::PollEvent {});

    // A fresh client can still join.
    let mut fresh = service.connect();
    fresh.create_instance("fresh");
}

#[test_log::test]
fn swapchain_destroy_while_delivered() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("gc");
    client.start_session(false, 0);
    let (chain, _fds) = client.create_swapchain(3);

    client.submit_frame(chain);
    settle();

    // The delivered stack still references the swapchain's images when the
    // client destroys it; the render loop keeps compositing and the
    // carcass is collected at a tick boundary.
    client.expect_ok(protocol::SwapchainDestroy {
        swapchain_id: chain,
    });

    settle();

    // The service is still healthy: a full frame loop works on a new
    // swapchain.
    let (chain2, _fds2) = client.create_swapchain(2);
    client.submit_frame(chain2);
}

#[test_log::test]
fn graceful_exit_sequence() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("exiting");
    client.start_session(false, 0);
    let (chain, _fds) = client.create_swapchain(3);
    client.submit_frame(chain);
    settle();

    client.expect_ok(protocol::RequestExit {});
    client.expect_ok(protocol::EndSession {});

    let states: Vec<SessionState> = client
        .drain_events()
        .into_iter()
        .filter_map(|ev| match ev {
            EventPayload::SessionStateChanged { state } => Some(state),
            _ => None,
        })
        .collect();

    // Everything through STOPPING/IDLE/EXITING arrives in order, exactly
    // once.
    assert_eq!(
        states.last(),
        Some(&SessionState::Exiting),
        "full sequence: {states:?}"
    );
    assert_eq!(
        states.iter().filter(|s| **s == SessionState::Exiting).count(),
        1
    );

    // The frame loop is rejected after end_session.
    let reply = client.request(protocol::WaitFrame {});
    assert_eq!(reply.status, Status::CallOrder);
}

#[test_log::test]
fn haptic_round_trip() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("buzz");
    client.start_session(false, 0);

    // Device 1 is the left controller; its single output vibrates for a
    // few milliseconds, then the stop event lands on the ring.
    client.expect_ok(protocol::ApplyHaptic {
        device_index: 1,
        output_index: 0,
        duration_ns: 5_000_000,
        frequency_hz: 160.0,
        amplitude: 0.5,
    });

    let mut saw_stop = false;
    for _ in 0..100 {
        if client.drain_events().iter().any(|ev| {
            matches!(
                ev,
                EventPayload::HapticStop {
                    device_index: 1,
                    output_index: 0,
                }
            )
        }) {
            saw_stop = true;
            break;
        }

        thread::sleep(Duration::from_millis(5));
    }

    assert!(saw_stop, "HAPTIC_STOP never delivered");

    // The HMD has no haptic outputs.
    let reply = client.request(protocol::ApplyHaptic {
        device_index: 0,
        output_index: 0,
        duration_ns: 5_000_000,
        frequency_hz: 160.0,
        amplitude: 0.5,
    });
    assert_eq!(reply.status, Status::Validation);
}

#[test_log::test]
fn poll_event_on_empty_queue_returns_none() {
    let service = TestService::start();
    let mut client = service.connect();

    client.create_instance("quiet");

    match client.expect_ok(protocol::PollEvent {}) {
        Message::EventPolled(m) => assert_eq!(m.event, None),
        other => panic!("unexpected reply {other}"),
    }
}
