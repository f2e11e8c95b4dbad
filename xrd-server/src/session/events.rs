// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The per-client outbound event ring. Fixed capacity; overflow evicts the
//! oldest pending entry with a diagnostic, so a client that never polls
//! can't grow the service. Each entry is delivered at most once.

use parking_lot::Mutex;
use tracing::warn;
use xrd_protocol::{EventPayload, QueuedEvent};

/// Slots per client.
pub const EVENT_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
struct EventSlot {
    seq: u64,
    timestamp_ns: u64,
    pending: bool,
    payload: EventPayload,
}

struct Inner {
    slots: Vec<Option<EventSlot>>,
    next_seq: u64,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: vec![None; EVENT_QUEUE_DEPTH],
                next_seq: 0,
            }),
        }
    }

    /// Enqueues an event, evicting the oldest pending entry when full.
    pub fn push(&self, timestamp_ns: u64, payload: EventPayload) {
        let mut inner = self.inner.lock();

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let slot = Self::find_slot(&mut inner.slots);
        if let Some(old) = slot.as_ref().filter(|s| s.pending) {
            warn!(?old.payload, "event queue overflow, evicting oldest");
        }

        *slot = Some(EventSlot {
            seq,
            timestamp_ns,
            pending: true,
            payload,
        });
    }

    /// The oldest pending event, consumed.
    pub fn pop(&self) -> Option<QueuedEvent> {
        let mut inner = self.inner.lock();

        let slot = inner
            .slots
            .iter_mut()
            .flatten()
            .filter(|s| s.pending)
            .min_by_key(|s| s.seq)?;

        slot.pending = false;

        Some(QueuedEvent {
            timestamp_ns: slot.timestamp_ns,
            payload: slot.payload.clone(),
        })
    }

    /// Drops everything pending; used at teardown so nothing is delivered
    /// both here and over the direct event path.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut().flatten() {
            slot.pending = false;
        }
    }

    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .flatten()
            .filter(|s| s.pending)
            .count()
    }

    /// The first non-pending slot, or the oldest pending one.
    fn find_slot(slots: &mut [Option<EventSlot>]) -> &mut Option<EventSlot> {
        let pick = slots
            .iter()
            .position(|s| !s.as_ref().map(|s| s.pending).unwrap_or(false))
            .unwrap_or_else(|| {
                slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.as_ref().unwrap().seq)
                    .map(|(i, _)| i)
                    .unwrap()
            });

        &mut slots[pick]
    }
}
