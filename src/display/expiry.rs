// SPDX-License-Identifier: GPL-3.0-only
//! Automatic unregistration of idle virtual displays
//!
//! Each registered display gets at most one pending timer. When it fires the
//! scheduler does not touch the registry itself: it posts an [`ExpiryNotice`]
//! to the control loop, which unregisters the display in order with every
//! other command.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::config::{GlassId, Settings};

/// Posted when a display's expiry timer elapses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryNotice {
    pub id: GlassId,
    /// Matches the arm call that produced this notice
    pub generation: u64,
}

struct PendingExpiry {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct AutoExpiryScheduler {
    enabled: bool,
    delay: Duration,
    next_generation: u64,
    pending: HashMap<GlassId, PendingExpiry>,
    notices: UnboundedSender<ExpiryNotice>,
}

impl AutoExpiryScheduler {
    pub fn new(settings: &Settings, notices: UnboundedSender<ExpiryNotice>) -> Self {
        Self {
            enabled: settings.automatic_unregister_enabled,
            delay: settings.unregister_delay(),
            next_generation: 0,
            pending: HashMap::new(),
            notices,
        }
    }

    /// Apply new settings.
    ///
    /// Disabling cancels every pending timer. A new delay only affects timers
    /// armed from now on.
    pub fn configure(&mut self, settings: &Settings) {
        self.enabled = settings.automatic_unregister_enabled;
        self.delay = settings.unregister_delay();
        if !self.enabled && !self.pending.is_empty() {
            info!(
                count = self.pending.len(),
                "Automatic unregister disabled, cancelling pending timers"
            );
            self.disarm_all();
        }
    }

    /// (Re)start the expiry timer for `id`.
    ///
    /// Returns false when automatic unregister is disabled and nothing was
    /// scheduled.
    pub fn arm(&mut self, id: &str) -> bool {
        self.disarm(id);
        if !self.enabled {
            return false;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let notice = ExpiryNotice {
            id: id.to_string(),
            generation,
        };
        let notices = self.notices.clone();
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The control loop may already be gone during shutdown
            let _ = notices.send(notice);
        });

        debug!(glass_id = %id, ?delay, generation, "Armed automatic unregister");
        self.pending
            .insert(id.to_string(), PendingExpiry { generation, task });
        true
    }

    /// Cancel the pending timer for `id`, if any
    pub fn disarm(&mut self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some(pending) => {
                pending.task.abort();
                debug!(glass_id = %id, generation = pending.generation, "Disarmed automatic unregister");
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.task.abort();
        }
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Accept a fired notice if it belongs to the timer currently armed for
    /// its id. Stale notices (disarmed or superseded) return false.
    pub fn take_fired(&mut self, notice: &ExpiryNotice) -> bool {
        match self.pending.get(&notice.id) {
            Some(pending) if pending.generation == notice.generation => {
                self.pending.remove(&notice.id);
                true
            }
            _ => false,
        }
    }
}

impl Drop for AutoExpiryScheduler {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
