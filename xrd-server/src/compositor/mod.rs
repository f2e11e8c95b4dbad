// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Multi-client composition: the triple-buffered per-client layer slots
//! and the z-ordered merge that turns every connected client's layer
//! stack into one native present per vsync.
//!
//! Each slot has three stages. `progress` is the stack a worker is
//! assembling between begin_frame and end_frame (owned by the worker, no
//! lock). `scheduled` is the latest completed stack, behind the slot lock.
//! `delivered` is whatever the render task promoted this tick, owned by
//! the render task alone.

pub mod native;
pub mod render;

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use xrd_protocol::{EnvBlendMode, LayerEntry, Rect2D};

use crate::session::swapchain::SwapchainImages;

/// One swapchain reference within a resolved layer. Holding the image set
/// by `Arc` keeps the memory alive even if the owning swapchain is
/// destroyed while the stack is in flight.
pub struct LayerSource {
    pub images: Arc<SwapchainImages>,
    pub image_index: u32,
    pub rect: Rect2D,
    pub array_index: u32,
}

/// A layer with its swapchain references resolved to image memory.
pub struct ResolvedLayer {
    pub entry: LayerEntry,
    pub sources: Vec<LayerSource>,
}

/// A complete frame submission from one client.
pub struct LayerStack {
    pub frame_id: i64,
    pub display_time_ns: i64,
    pub blend_mode: EnvBlendMode,
    pub layers: Vec<ResolvedLayer>,
}

/// The scheduled/delivered hand-off point for one client.
pub struct ClientSlot {
    scheduled: Mutex<Option<LayerStack>>,
    delivered_active: AtomicBool,
    delivered_display_ns: AtomicI64,
}

impl Default for ClientSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSlot {
    pub fn new() -> Self {
        Self {
            scheduled: Mutex::new(None),
            delivered_active: AtomicBool::new(false),
            delivered_display_ns: AtomicI64::new(0),
        }
    }

    /// Publishes a completed stack. An undisplayed predecessor is
    /// superseded and dropped.
    pub fn schedule(&self, stack: LayerStack) {
        let mut scheduled = self.scheduled.lock();
        if let Some(old) = scheduled.replace(stack) {
            tracing::trace!(
                frame_id = old.frame_id,
                display_time_ns = old.display_time_ns,
                "superseding undisplayed layer stack"
            );
        }
    }

    /// Promotes the scheduled stack if its display time has arrived.
    /// Called only by the render task.
    pub fn take_due(&self, target_display_ns: i64) -> Option<LayerStack> {
        let mut scheduled = self.scheduled.lock();

        match scheduled.as_ref() {
            Some(stack) if stack.display_time_ns <= target_display_ns => {
                let stack = scheduled.take().unwrap();
                self.delivered_active.store(true, Ordering::Release);
                self.delivered_display_ns
                    .store(stack.display_time_ns, Ordering::Release);

                Some(stack)
            }
            _ => None,
        }
    }

    /// Whether the render task has ever promoted a stack for this client.
    pub fn delivered_active(&self) -> bool {
        self.delivered_active.load(Ordering::Acquire)
    }

    pub fn delivered_display_ns(&self) -> i64 {
        self.delivered_display_ns.load(Ordering::Acquire)
    }

    /// Drops everything, e.g. on session teardown.
    pub fn clear(&self) {
        self.scheduled.lock().take();
        self.delivered_active.store(false, Ordering::Release);
        self.delivered_display_ns.store(0, Ordering::Release);
    }
}

/// An entry in the z-order computation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZEntry {
    pub client_id: u64,
    pub z_order: i32,
}

/// The per-tick render order: the active primary first (pinned below every
/// overlay), then overlay-active sessions by ascending z. The sort is
/// stable, so equal z values keep their submission order.
pub fn render_order(overlays: &[ZEntry], active_primary: Option<u64>) -> Vec<u64> {
    let mut entries: Vec<ZEntry> = Vec::with_capacity(overlays.len() + 1);

    if let Some(primary) = active_primary {
        entries.push(ZEntry {
            client_id: primary,
            z_order: i32::MIN,
        });
    }

    entries.extend_from_slice(overlays);
    entries.sort_by_key(|e| e.z_order);

    entries.into_iter().map(|e| e.client_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(frame_id: i64, display_time_ns: i64) -> LayerStack {
        LayerStack {
            frame_id,
            display_time_ns,
            blend_mode: EnvBlendMode::Opaque,
            layers: Vec::new(),
        }
    }

    #[test]
    fn take_due_respects_display_time() {
        let slot = ClientSlot::new();
        slot.schedule(stack(1, 100));

        // Not due yet.
        assert!(slot.take_due(99).is_none());
        assert!(!slot.delivered_active());

        // Due exactly at the boundary.
        let taken = slot.take_due(100).unwrap();
        assert_eq!(taken.frame_id, 1);
        assert!(slot.delivered_active());
        assert_eq!(slot.delivered_display_ns(), 100);

        // Nothing left.
        assert!(slot.take_due(1000).is_none());
    }

    #[test]
    fn newer_stack_supersedes() {
        let slot = ClientSlot::new();
        slot.schedule(stack(1, 100));
        slot.schedule(stack(2, 200));

        let taken = slot.take_due(500).unwrap();
        assert_eq!(taken.frame_id, 2);
    }

    #[test]
    fn delivered_never_exceeds_target() {
        let slot = ClientSlot::new();

        // Whatever mix of scheduling happens, a promoted stack's display
        // time is never past the tick's target.
        for i in 0..50 {
            slot.schedule(stack(i, i * 10));
            let target = i * 10 - 5;
            if let Some(taken) = slot.take_due(target) {
                assert!(taken.display_time_ns <= target);
            }
        }
    }

    #[test]
    fn order_is_primary_then_ascending_z() {
        let overlays = [
            ZEntry {
                client_id: 20,
                z_order: 20,
            },
            ZEntry {
                client_id: 10,
                z_order: 10,
            },
        ];

        assert_eq!(render_order(&overlays, Some(1)), vec![1, 10, 20]);
        assert_eq!(render_order(&overlays, None), vec![10, 20]);
        assert_eq!(render_order(&[], Some(7)), vec![7]);
        assert_eq!(render_order(&[], None), Vec::<u64>::new());
    }

    #[test]
    fn equal_z_keeps_submission_order() {
        let overlays = [
            ZEntry {
                client_id: 5,
                z_order: 3,
            },
            ZEntry {
                client_id: 6,
                z_order: 3,
            },
            ZEntry {
                client_id: 4,
                z_order: -1,
            },
        ];

        assert_eq!(render_order(&overlays, None), vec![4, 5, 6]);
    }
}
