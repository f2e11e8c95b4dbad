// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Process-wide mutable state: the client table, the device table and its
//! live snapshots, the shared-memory region, and the central
//! `update_server_state` pass that owns focus and visibility.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};
use xrd_protocol::{EventPayload, SessionState};

use crate::{
    compositor::{render_order, ZEntry},
    config::Config,
    device::{DeviceProvider, DeviceTable, InputSnapshot},
    error::SessionError,
    session::ClientHandle,
    shm::ShmRegion,
};

pub type SharedState = Arc<Mutex<ServerState>>;

/// A vibration in flight on one output, keyed by global output index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingHaptic {
    pub client_id: u64,
    pub device_index: u32,
    pub output_index: u32,
    pub stop_deadline_ns: i64,
}

pub struct ServerState {
    pub cfg: Config,
    pub devices: DeviceTable,
    pub snapshots: Vec<InputSnapshot>,
    pub shm: ShmRegion,

    pub clients: HashMap<u64, Arc<ClientHandle>>,
    /// Most-recently-activated primary, if still valid.
    pub active_primary: Option<u64>,
    pub shutting_down: bool,

    provider: Box<dyn DeviceProvider>,
    haptics: Vec<Option<PendingHaptic>>,
    slots_in_use: Vec<bool>,
}

impl ServerState {
    pub fn new(
        cfg: Config,
        devices: DeviceTable,
        shm: ShmRegion,
        provider: Box<dyn DeviceProvider>,
    ) -> Self {
        let num_inputs = devices.inputs.len();
        let num_outputs = devices.outputs.len();
        let max_clients = cfg.service.max_clients.get() as usize;

        Self {
            cfg,
            snapshots: vec![InputSnapshot::default(); num_inputs],
            haptics: vec![None; num_outputs],
            devices,
            shm,
            clients: HashMap::new(),
            active_primary: None,
            shutting_down: false,
            provider,
            slots_in_use: vec![false; max_clients],
        }
    }

    /// Registers a fresh connection, allocating its render slot.
    pub fn register_client(&mut self, client_id: u64) -> Result<Arc<ClientHandle>, SessionError> {
        if self.shutting_down {
            return Err(SessionError::Ipc("service is shutting down".into()));
        }

        let slot_index = self
            .slots_in_use
            .iter()
            .position(|used| !used)
            .ok_or_else(|| {
                SessionError::exhausted(format!(
                    "client limit ({}) reached",
                    self.cfg.service.max_clients
                ))
            })?;

        self.slots_in_use[slot_index] = true;

        let handle = Arc::new(ClientHandle::new(
            client_id,
            slot_index as u32,
            self.cfg.display.frame_period_ns(),
            self.cfg.debug.verbose_lifecycle,
        ));

        self.clients.insert(client_id, handle.clone());
        debug!(client_id, slot_index, "registered client");

        Ok(handle)
    }

    /// Drops a client and everything that pointed at it.
    pub fn unregister_client(&mut self, client_id: u64) {
        let Some(handle) = self.clients.remove(&client_id) else {
            return;
        };

        self.slots_in_use[handle.slot_index as usize] = false;
        self.shm.write_slot(handle.slot_index, false, 0, 0, 0);
        handle.slot.clear();

        for (index, pending) in self.haptics.iter_mut().enumerate() {
            if pending.map(|p| p.client_id) == Some(client_id) {
                *pending = None;
                self.shm.write_output_haptic(index as u32, 0, 0.0);
            }
        }

        if self.active_primary == Some(client_id) {
            self.active_primary = None;
        }

        debug!(client_id, "unregistered client");
    }

    /// Refreshes device poses and publishes them to shared memory.
    pub fn refresh_inputs(&mut self, now_ns: i64) {
        self.provider
            .refresh(now_ns, &self.devices, &mut self.snapshots);
        self.shm.write_snapshots(&self.snapshots);
    }

    /// Starts a vibration; the stop event fires when the deadline passes.
    /// The pending state is mirrored into the shared-memory output entry
    /// so drivers (and debug tooling) can see it.
    pub fn trigger_haptic(
        &mut self,
        client_id: u64,
        device_index: u32,
        output_index: u32,
        duration_ns: i64,
        amplitude: f32,
        now_ns: i64,
    ) -> Result<(), SessionError> {
        let device = self
            .devices
            .devices
            .get(device_index as usize)
            .ok_or_else(|| SessionError::validation("no such device"))?;

        if output_index >= device.num_outputs {
            return Err(SessionError::validation("no such output"));
        }

        let global = device.first_output + output_index;
        let stop_deadline_ns = now_ns + duration_ns.max(0);

        self.haptics[global as usize] = Some(PendingHaptic {
            client_id,
            device_index,
            output_index,
            stop_deadline_ns,
        });
        self.shm
            .write_output_haptic(global, stop_deadline_ns as u64, amplitude);

        Ok(())
    }

    /// Fires HAPTIC_STOP events for vibrations whose deadline has passed.
    pub fn tick_haptics(&mut self, now_ns: i64) {
        for (index, pending) in self.haptics.iter_mut().enumerate() {
            let Some(haptic) = *pending else { continue };
            if haptic.stop_deadline_ns > now_ns {
                continue;
            }

            *pending = None;
            self.shm.write_output_haptic(index as u32, 0, 0.0);

            if let Some(handle) = self.clients.get(&haptic.client_id) {
                handle.events.push(
                    now_ns as u64,
                    EventPayload::HapticStop {
                        device_index: haptic.device_index,
                        output_index: haptic.output_index,
                    },
                );
            }
        }
    }

    /// Marks a client as the most-recently-activated primary.
    pub fn set_active_primary(&mut self, client_id: u64) {
        info!(client_id, "new active primary");
        self.active_primary = Some(client_id);
    }

    /// The z-sorted composition plan for one tick.
    pub fn render_plan(&self) -> Vec<(u64, Arc<ClientHandle>)> {
        let mut overlays: Vec<ZEntry> = Vec::new();

        let mut ids: Vec<u64> = self.clients.keys().copied().collect();
        ids.sort_unstable();

        for id in &ids {
            let handle = &self.clients[id];
            let (running, overlay, z_order, state) = handle
                .session
                .with_data(|d| (d.running, d.overlay, d.z_order, d.state));

            if running
                && overlay
                && !matches!(state, SessionState::LossPending | SessionState::Exiting)
            {
                overlays.push(ZEntry {
                    client_id: *id,
                    z_order,
                });
            }
        }

        render_order(&overlays, self.active_primary)
            .into_iter()
            .filter_map(|id| self.clients.get(&id).map(|h| (id, h.clone())))
            .collect()
    }

    /// The central state pass: selects the active primary, recomputes
    /// per-client visibility and focus, and drives the corresponding
    /// session transitions and overlay events. Runs under the global lock
    /// once per render tick and after lifecycle requests.
    pub fn update_server_state(&mut self, now_ns: i64) {
        // The most-recently-set primary keeps the role while it's valid;
        // otherwise fall back to the first session-active non-overlay
        // client, in id order.
        let primary_ok = |handle: &ClientHandle| {
            handle.session.with_data(|d| {
                d.running
                    && !d.overlay
                    && !matches!(d.state, SessionState::LossPending | SessionState::Exiting)
            })
        };

        if let Some(id) = self.active_primary {
            match self.clients.get(&id) {
                Some(handle) if primary_ok(handle) => (),
                _ => self.active_primary = None,
            }
        }

        if self.active_primary.is_none() {
            let mut ids: Vec<u64> = self.clients.keys().copied().collect();
            ids.sort_unstable();

            self.active_primary = ids
                .into_iter()
                .find(|id| primary_ok(&self.clients[id]));

            if let Some(id) = self.active_primary {
                debug!(client_id = id, "fallback primary promoted");
            }
        }

        let primary_exists = self.active_primary.is_some();

        let mut ids: Vec<u64> = self.clients.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let handle = self.clients[&id].clone();
            let is_primary = self.active_primary == Some(id);
            let has_delivered = handle.slot.delivered_active();

            let (state, running, overlay, was_overlay_visible) = handle
                .session
                .with_data(|d| (d.state, d.running, d.overlay, d.overlay_visible));

            let visible = running && has_delivered;
            let focused = visible && is_primary;

            match state {
                SessionState::Synchronized if visible => {
                    handle
                        .session
                        .transition(SessionState::Visible, &handle.events, now_ns);
                    if focused {
                        handle
                            .session
                            .transition(SessionState::Focused, &handle.events, now_ns);
                    }
                }
                SessionState::Visible if focused => {
                    handle
                        .session
                        .transition(SessionState::Focused, &handle.events, now_ns);
                }
                SessionState::Visible if !visible => {
                    handle
                        .session
                        .transition(SessionState::Synchronized, &handle.events, now_ns);
                }
                SessionState::Focused if !focused => {
                    handle
                        .session
                        .transition(SessionState::Visible, &handle.events, now_ns);
                    if !visible {
                        handle
                            .session
                            .transition(SessionState::Synchronized, &handle.events, now_ns);
                    }
                }
                _ => (),
            }

            handle.session.with_data(|d| {
                d.visible = visible;
                d.focused = focused;
            });

            // Overlays learn when a primary appears or disappears beneath
            // them.
            if overlay && running {
                let overlay_visible = primary_exists;
                if overlay_visible != was_overlay_visible {
                    handle.session.with_data(|d| d.overlay_visible = overlay_visible);
                    handle.events.push(
                        now_ns as u64,
                        EventPayload::OverlayVisibilityChanged {
                            visible: overlay_visible,
                        },
                    );
                }
            }
        }
    }
}
