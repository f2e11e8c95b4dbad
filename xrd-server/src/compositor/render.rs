// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The render loop: one dedicated task that owns the native compositor
//! and, each vsync, promotes due layer stacks, merges them in z-order,
//! and commits a single native present.
//!
//! Blocking happens only inside `wait_frame`; the control and GC channels
//! are drained non-blockingly at the top of every tick, so shutdown and
//! deferred destruction are bounded by one frame.

use std::thread;

use crossbeam_channel::{Receiver, TryRecvError};
use hashbrown::HashMap;
use tracing::{debug, debug_span, error, warn};

use super::{
    native::{NativeCompositor, NativeEvent},
    LayerStack,
};
use crate::{clock, session::swapchain::SwapchainCarcass, state::SharedState};

/// Consecutive failed presents before every session is declared lost.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub enum RenderControl {
    Shutdown,
}

pub struct RenderLoop {
    state: SharedState,
    native: Box<dyn NativeCompositor>,
    gc: Receiver<SwapchainCarcass>,
    control: Receiver<RenderControl>,

    /// What each client is currently showing. Owned by this task alone.
    delivered: HashMap<u64, LayerStack>,
    consecutive_failures: u32,
}

impl RenderLoop {
    pub fn spawn(
        state: SharedState,
        native: Box<dyn NativeCompositor>,
        gc: Receiver<SwapchainCarcass>,
        control: Receiver<RenderControl>,
        ready: oneshot::Sender<()>,
    ) -> thread::JoinHandle<anyhow::Result<()>> {
        thread::Builder::new()
            .name("xrd-render".into())
            .spawn(move || {
                let span = debug_span!("render");
                let _guard = span.enter();

                let mut this = RenderLoop {
                    state,
                    native,
                    gc,
                    control,
                    delivered: HashMap::new(),
                    consecutive_failures: 0,
                };

                // The caller won't accept clients until the compositor
                // thread is actually up.
                let _ = ready.send(());

                let res = this.run();
                if let Err(e) = &res {
                    error!("render loop exited: {:#}", e);
                }

                res
            })
            .expect("failed to spawn render thread")
    }

    fn run(&mut self) -> anyhow::Result<()> {
        let res = self.run_inner();
        let destroyed = self.native.destroy();

        res.and(destroyed)
    }

    fn run_inner(&mut self) -> anyhow::Result<()> {
        loop {
            // The safe point: nothing from the previous tick is in flight,
            // so deferred swapchain carcasses can finally be dropped.
            while let Ok(carcass) = self.gc.try_recv() {
                debug!(
                    client_id = carcass.client_id,
                    swapchain_id = carcass.swapchain_id,
                    "collecting destroyed swapchain"
                );
            }

            match self.control.try_recv() {
                Ok(RenderControl::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => (),
            }

            if let Err(e) = self.tick() {
                warn!("render tick failed: {:#}", e);

                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("presentation path wedged; declaring sessions lost");
                    self.escalate_loss();
                    self.consecutive_failures = 0;
                }
            } else {
                self.consecutive_failures = 0;
            }

            for event in self.native.poll_events() {
                match event {
                    NativeEvent::Lost => {
                        error!("native compositor lost the display");
                        self.escalate_loss();
                    }
                }
            }
        }

        Ok(())
    }

    fn tick(&mut self) -> anyhow::Result<()> {
        let frame = self.native.wait_frame()?;
        let now_ns = clock::now_ns();

        // Fan the prediction out to every client's timing helper, and
        // refresh device state, under the global lock.
        {
            let mut state = self.state.lock();
            for handle in state.clients.values() {
                handle
                    .timing
                    .broadcast(frame.predicted_display_ns, frame.period_ns);
            }

            state.refresh_inputs(now_ns);
            state.tick_haptics(now_ns);
        }

        self.native.begin_frame(frame.frame_id)?;
        self.native.layer_begin(frame.frame_id)?;
        self.merge_and_submit_layers(frame.predicted_display_ns);
        self.native.layer_commit(frame.frame_id)?;

        // Visibility and focus follow from what was just delivered.
        self.state.lock().update_server_state(clock::now_ns());

        Ok(())
    }

    /// Promotes every due `scheduled` stack and walks the z-sorted client
    /// list, dispatching each delivered layer. A failure kills only the
    /// offending client's output for this tick.
    fn merge_and_submit_layers(&mut self, target_display_ns: i64) {
        let plan = {
            let mut state = self.state.lock();
            let plan = state.render_plan();

            for (client_id, handle) in &plan {
                if let Some(stack) = handle.slot.take_due(target_display_ns) {
                    state.shm.write_slot(
                        handle.slot_index,
                        true,
                        stack.layers.len() as u32,
                        stack.display_time_ns,
                        stack.blend_mode as u32,
                    );

                    self.delivered.insert(*client_id, stack);
                }
            }

            let clients = &state.clients;
            self.delivered.retain(|id, _| clients.contains_key(id));

            plan
        };

        for (client_id, _) in &plan {
            let Some(stack) = self.delivered.get(client_id) else {
                continue;
            };

            debug_assert!(stack.display_time_ns <= target_display_ns);

            for layer in &stack.layers {
                if let Err(e) = self.native.submit_layer(*client_id, layer, stack.blend_mode) {
                    warn!(
                        client_id = *client_id,
                        "layer submission failed, dropping client for this tick: {:#}", e
                    );

                    self.delivered.remove(client_id);
                    break;
                }
            }
        }
    }

    fn escalate_loss(&mut self) {
        let state = self.state.lock();
        let now_ns = clock::now_ns();

        for handle in state.clients.values() {
            handle.session.lose(&handle.events, now_ns);
        }
    }
}
