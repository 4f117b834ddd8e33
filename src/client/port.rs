//! Local port registry of a client.
//!
//! Ports are logical endpoints scoped to one public key. A port is either
//! held by a [`Listener`] or reserved as the ephemeral source port of an
//! outgoing transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rand::Rng;
use tracing::Span;

use super::listener::Listener;
use crate::core::{Addr, EPHEMERAL_PORT_END, EPHEMERAL_PORT_START, Error, Result};

pub(crate) enum Slot {
    Listening(Listener),
    Ephemeral,
}

pub(crate) type Slots = Mutex<HashMap<u16, Slot>>;

/// Maps ports to listeners and hands out ephemeral ports.
#[derive(Clone, Default)]
pub struct PortManager {
    slots: Arc<Slots>,
}

impl PortManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u16, Slot>> {
        lock_slots(&self.slots)
    }

    /// Listener on `port`, if any.
    pub fn listener(&self, port: u16) -> Option<Listener> {
        match self.slots().get(&port) {
            Some(Slot::Listening(l)) => Some(l.clone()),
            _ => None,
        }
    }

    /// Register a listener on `addr.port`.
    pub fn new_listener(&self, addr: Addr, accept_buffer: usize, parent: &Span) -> Result<Listener> {
        let mut slots = self.slots();
        if slots.contains_key(&addr.port) {
            return Err(Error::PortInUse(addr.port));
        }
        let listener = Listener::new(addr, accept_buffer, Arc::downgrade(&self.slots), parent);
        slots.insert(addr.port, Slot::Listening(listener.clone()));
        Ok(listener)
    }

    /// Unregister the listener on `port`. Ephemeral reservations are kept.
    pub fn remove_listener(&self, port: u16) {
        remove_listener_slot(&self.slots, port);
    }

    /// A random free port of the ephemeral range. The port is not reserved.
    pub fn next_empty_ephemeral_port(&self) -> Option<u16> {
        free_ephemeral(&self.slots())
    }

    /// Pick and reserve a free ephemeral port.
    pub fn reserve_ephemeral(&self) -> Result<u16> {
        let mut slots = self.slots();
        let port = free_ephemeral(&slots).ok_or(Error::NoFreePorts)?;
        slots.insert(port, Slot::Ephemeral);
        Ok(port)
    }

    /// Free an ephemeral reservation.
    pub fn release(&self, port: u16) {
        let mut slots = self.slots();
        if matches!(slots.get(&port), Some(Slot::Ephemeral)) {
            slots.remove(&port);
        }
    }

    /// Whether `port` is held.
    pub fn in_use(&self, port: u16) -> bool {
        self.slots().contains_key(&port)
    }

    /// Close every listener and drop every reservation.
    pub async fn close_all(&self) {
        let listeners: Vec<Listener> = self
            .slots()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Listening(l) => Some(l),
                Slot::Ephemeral => None,
            })
            .collect();
        for listener in listeners {
            let _ = listener.close().await;
        }
    }
}

pub(crate) fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<u16, Slot>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn remove_listener_slot(slots: &Slots, port: u16) {
    let mut slots = lock_slots(slots);
    if matches!(slots.get(&port), Some(Slot::Listening(_))) {
        slots.remove(&port);
    }
}

pub(crate) fn remove_listener_weak(slots: &Weak<Slots>, port: u16) {
    if let Some(slots) = slots.upgrade() {
        remove_listener_slot(&slots, port);
    }
}

fn free_ephemeral(slots: &HashMap<u16, Slot>) -> Option<u16> {
    let span = usize::from(EPHEMERAL_PORT_END - EPHEMERAL_PORT_START) + 1;
    let start = rand::thread_rng().gen_range(0..span);
    (0..span)
        .map(|i| EPHEMERAL_PORT_START + ((start + i) % span) as u16)
        .find(|port| !slots.contains_key(port))
}
