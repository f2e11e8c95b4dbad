// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The control socket: a seqpacket listener plus one worker thread per
//! connected client. The accept loop is a small mio poll so a ctrl-c (or
//! any closer) can interrupt it; workers block on their own sockets and
//! take the global state lock only briefly per request.

mod handlers;
mod validation;

use std::{os::fd::AsRawFd, sync::Arc, thread};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use tracing::{debug, debug_span, error, info, warn};
use uds::UnixSeqpacketConn;

use crate::{
    clock,
    session::{generate_id, swapchain::SwapchainCarcass, ClientHandle},
    state::SharedState,
    waking_sender::WakingSender,
};

const LISTENER: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);

pub struct Server {
    listener: uds::UnixSeqpacketListener,
    state: SharedState,
    gc_send: Sender<SwapchainCarcass>,

    poll: mio::Poll,
    close_recv: Receiver<()>,
    close_send: WakingSender<()>,

    /// Cloned connection handles, for interrupting workers at shutdown.
    worker_conns: HashMap<u64, UnixSeqpacketConn>,
    workers: Vec<(u64, thread::JoinHandle<()>)>,
}

impl Server {
    pub fn new(
        listener: uds::UnixSeqpacketListener,
        state: SharedState,
        gc_send: Sender<SwapchainCarcass>,
    ) -> anyhow::Result<Self> {
        listener
            .set_nonblocking(true)
            .context("setting listener nonblocking")?;

        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);

        poll.registry().register(
            &mut mio::unix::SourceFd(&listener.as_raw_fd()),
            LISTENER,
            mio::Interest::READABLE,
        )?;

        let (close_send, close_recv) = crossbeam_channel::bounded(1);
        let close_send = WakingSender::new(waker, close_send);

        Ok(Self {
            listener,
            state,
            gc_send,
            poll,
            close_recv,
            close_send,
            worker_conns: HashMap::new(),
            workers: Vec::new(),
        })
    }

    pub fn closer(&self) -> WakingSender<()> {
        self.close_send.clone()
    }

    /// Accepts clients until the closer fires, then drains the workers.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let mut events = mio::Events::with_capacity(64);

        'accept: loop {
            match self.poll.poll(&mut events, None) {
                Ok(_) => (),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if self.close_recv.try_recv().is_ok() {
                debug!("shutting down control socket");
                break 'accept;
            }

            // Reap finished workers.
            self.workers.retain(|(id, handle)| {
                if handle.is_finished() {
                    debug!(client_id = *id, "worker finished");
                    false
                } else {
                    true
                }
            });
            let workers = &self.workers;
            self.worker_conns
                .retain(|id, _| workers.iter().any(|(wid, _)| wid == id));

            loop {
                let (conn, _addr) = match self.listener.accept_unix_addr() {
                    Ok(v) => v,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        break;
                    }
                };

                // Workers block on their sockets; only the listener is
                // nonblocking.
                if let Err(e) = conn.set_nonblocking(false) {
                    error!("failed to configure client socket: {}", e);
                    continue;
                }

                self.accept_client(conn);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept_client(&mut self, conn: UnixSeqpacketConn) {
        let client_id = generate_id();

        let handle = match self.state.lock().register_client(client_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("rejecting connection: {}", e);
                let mut buf = bytes::BytesMut::new();
                // No request to pair with; sequence zero.
                let _ = xrd_protocol::encode_error_reply(0, 0, e.status(), &e.to_string(), &mut buf)
                    .map(|_| conn.send(&buf));
                return;
            }
        };

        let Ok(conn_clone) = conn.try_clone() else {
            error!("failed to clone client socket");
            self.state.lock().unregister_client(client_id);
            return;
        };

        info!(client_id, "new client connection");

        let state = self.state.clone();
        let gc_send = self.gc_send.clone();
        let worker = thread::Builder::new()
            .name(format!("xrd-client-{client_id}"))
            .spawn(move || {
                let span = debug_span!("client", client_id);
                let _guard = span.enter();

                handlers::serve(state, gc_send, conn, client_id, handle);
            })
            .expect("failed to spawn client worker");

        self.worker_conns.insert(client_id, conn_clone);
        self.workers.push((client_id, worker));
    }

    /// Interrupts every worker and waits for them to tear down.
    fn shutdown(&mut self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;

            let now_ns = clock::now_ns();
            for handle in state.clients.values() {
                mark_stopping(handle, now_ns);
            }
        }

        for (client_id, conn) in self.worker_conns.drain() {
            debug!(client_id, "closing client connection");
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }

        for (client_id, worker) in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(client_id, "client worker panicked");
            }
        }
    }
}

fn mark_stopping(handle: &ClientHandle, now_ns: i64) {
    use xrd_protocol::SessionState;

    if !matches!(
        handle.session.state(),
        SessionState::Idle | SessionState::Exiting
    ) {
        handle
            .session
            .transition(SessionState::Stopping, &handle.events, now_ns);
    }

    // A worker parked in wait_frame has to be kicked loose, or the join
    // below never finishes.
    handle.session.interrupt();
}
