// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Per-client state. The worker thread owns the connection and the
//! swapchain table; everything the render loop or the central state pass
//! needs to see lives behind [`ClientHandle`], which is shared via `Arc`.

pub mod events;
pub mod machine;
pub mod swapchain;

use std::sync::Mutex as StdMutex;

use lazy_static::lazy_static;

use crate::{compositor::ClientSlot, timing::client::ClientTiming};
use events::EventQueue;
use machine::Session;

/// The shared half of a client context.
pub struct ClientHandle {
    pub client_id: u64,
    /// Identity of this client's render slot (and shm slot entry).
    pub slot_index: u32,
    pub app_name: parking_lot::Mutex<String>,

    pub session: Session,
    pub events: EventQueue,
    pub timing: ClientTiming,
    pub slot: ClientSlot,
}

impl ClientHandle {
    pub fn new(client_id: u64, slot_index: u32, period_ns: i64, verbose_lifecycle: bool) -> Self {
        Self {
            client_id,
            slot_index,
            app_name: parking_lot::Mutex::new(String::new()),
            session: Session::new(verbose_lifecycle),
            events: EventQueue::new(),
            timing: ClientTiming::new(period_ns),
            slot: ClientSlot::new(),
        }
    }
}

lazy_static! {
    static ref ID_GENERATOR: StdMutex<tiny_id::ShortCodeGenerator<char>> =
        StdMutex::new(tiny_id::ShortCodeGenerator::new_numeric(6));
}

/// Ids for clients, instances, and sessions.
pub fn generate_id() -> u64 {
    ID_GENERATOR.lock().unwrap().next_int()
}
