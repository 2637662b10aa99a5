// SPDX-License-Identifier: GPL-3.0-only
//! Live registrations keyed by display entry id
//!
//! The registry answers "is this display provisioned, and is it streaming".
//! It holds no policy; the lifecycle controller decides what goes in and out.

use std::collections::HashMap;

use super::backend::{DisplayStream, Presentation, VirtualDevice};
use crate::config::{DisplayId, GlassId};

/// Stream and window of an active display.
///
/// Kept as one value so a registration can never hold one without the other.
pub struct ActiveStream {
    /// Tags frames so deliveries from an older stream can be told apart
    pub generation: u64,
    pub stream: Box<dyn DisplayStream>,
    pub presentation: Box<dyn Presentation>,
}

/// Runtime binding of one display entry to its live handles
pub struct Registration {
    device: Box<dyn VirtualDevice>,
    active: Option<ActiveStream>,
}

impl Registration {
    pub fn new(device: Box<dyn VirtualDevice>) -> Self {
        Self {
            device,
            active: None,
        }
    }

    pub fn display_id(&self) -> DisplayId {
        self.device.display_id()
    }

    pub fn device(&self) -> &dyn VirtualDevice {
        self.device.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.generation)
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveStream> {
        self.active.as_mut()
    }

    pub fn set_active(&mut self, active: ActiveStream) {
        debug_assert!(self.active.is_none(), "stream already attached");
        self.active = Some(active);
    }

    pub fn take_active(&mut self) -> Option<ActiveStream> {
        self.active.take()
    }

    /// Give up the device. The caller must have detached the stream first.
    pub fn into_device(self) -> Box<dyn VirtualDevice> {
        debug_assert!(self.active.is_none(), "device released while streaming");
        self.device
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Registration(device: {:?}, stream generation: {:?})",
            self.device,
            self.active_generation()
        )
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    registrations: HashMap<GlassId, Registration>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a registration, handing back any previous one for the id
    pub fn insert(&mut self, id: GlassId, registration: Registration) -> Option<Registration> {
        self.registrations.insert(id, registration)
    }

    pub fn remove(&mut self, id: &str) -> Option<Registration> {
        self.registrations.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registrations.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Registration> {
        self.registrations.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Registration> {
        self.registrations.get_mut(id)
    }

    pub fn ids(&self) -> Vec<GlassId> {
        self.registrations.keys().cloned().collect()
    }
}
