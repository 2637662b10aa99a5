// SPDX-License-Identifier: GPL-3.0-only
//! Virtual display lifecycle controller
//!
//! Drives every display entry through
//! `Unregistered -> Registered -> Active -> Registered -> Unregistered`.
//!
//! # Ownership
//!
//! The controller is owned by the control loop (see `service.rs`) and is the
//! only writer of the registry and of the `registered`/`active` flags of the
//! stored entries. Its methods are synchronous; everything asynchronous
//! (frame delivery, expiry timers) reaches it as a message on the loop.
//!
//! # Teardown order
//!
//! A stream is always asked to stop before its device is torn down. Stop and
//! teardown failures are logged and never abort the teardown, so a display
//! can always be released.

use tokio::sync::mpsc::{self, error::TrySendError};

use super::backend::{Backend, Frame, FrameCallback, RenderParams};
use super::expiry::{AutoExpiryScheduler, ExpiryNotice};
use super::registry::{ActiveStream, DeviceRegistry, Registration};
use crate::config::{self, DisplayId, GlassConfig, GlassId, Settings};
use crate::error::{AppError, Result};
use crate::store::ConfigStore;

/// Lifecycle position of one display entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unregistered,
    Registered,
    Active,
}

/// Outcome of a successful `activate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Started,
    /// The display was already streaming; nothing changed
    AlreadyActive,
}

/// Snapshot of a live registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub id: GlassId,
    pub display_id: DisplayId,
    pub active: bool,
}

/// How stored `registered`/`active` flags are treated at start-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPolicy {
    /// Bring back what was registered or active in the previous run
    Restore,
    /// Start with every display unregistered
    Reset,
}

/// A frame on its way from a stream to the control loop
#[derive(Debug)]
pub struct FrameDelivery {
    pub id: GlassId,
    /// Generation of the stream that produced the frame
    pub generation: u64,
    pub frame: Frame,
}

pub struct LifecycleController {
    configs: Vec<GlassConfig>,
    settings: Settings,
    registry: DeviceRegistry,
    backend: Backend,
    store: Box<dyn ConfigStore>,
    expiry: AutoExpiryScheduler,
    frames: mpsc::Sender<FrameDelivery>,
    next_stream_generation: u64,
    /// The stored list failed to load; only an explicit edit may replace it
    store_unreadable: bool,
}

impl LifecycleController {
    /// Load stored state and reconcile it according to `policy`.
    ///
    /// Stored flags describe intent only: no device exists at this point.
    /// Must run inside a tokio runtime.
    pub fn new(
        store: Box<dyn ConfigStore>,
        backend: Backend,
        policy: StartupPolicy,
        frames: mpsc::Sender<FrameDelivery>,
        notices: mpsc::UnboundedSender<ExpiryNotice>,
    ) -> Self {
        let mut store_unreadable = false;
        let mut configs = store.load().unwrap_or_else(|err| {
            error!(
                "can't load display configurations, leaving the stored copy alone until the list is edited: {}",
                err
            );
            store_unreadable = true;
            Vec::new()
        });
        config::ensure_not_empty(&mut configs);

        let settings = store.load_settings().unwrap_or_else(|err| {
            error!("can't load settings: {}", err);
            Settings::default()
        });

        let expiry = AutoExpiryScheduler::new(&settings, notices);

        let mut controller = Self {
            configs,
            settings,
            registry: DeviceRegistry::new(),
            backend,
            store,
            expiry,
            frames,
            next_stream_generation: 0,
            store_unreadable,
        };

        match policy {
            StartupPolicy::Restore => controller.restore(),
            StartupPolicy::Reset => controller.reset_runtime_flags(),
        }
        controller
    }

    pub fn configs(&self) -> &[GlassConfig] {
        &self.configs
    }

    #[cfg(test)]
    pub fn config(&self, id: &str) -> Option<&GlassConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self, id: &str) -> LifecycleState {
        match self.registry.get(id) {
            Some(registration) if registration.is_active() => LifecycleState::Active,
            Some(_) => LifecycleState::Registered,
            None => LifecycleState::Unregistered,
        }
    }

    #[cfg(test)]
    pub fn registration(&self, id: &str) -> Option<RegistrationInfo> {
        self.registry.get(id).map(|registration| RegistrationInfo {
            id: id.to_string(),
            display_id: registration.display_id(),
            active: registration.is_active(),
        })
    }

    #[cfg(test)]
    pub fn registered_ids(&self) -> Vec<GlassId> {
        self.registry.ids()
    }

    #[cfg(test)]
    pub fn is_expiry_armed(&self, id: &str) -> bool {
        self.expiry.is_armed(id)
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.configs
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| AppError::ConfigNotFound(id.to_string()))
    }

    fn set_flags(&mut self, id: &str, registered: bool, active: bool) {
        if let Some(config) = self.configs.iter_mut().find(|c| c.id == id) {
            config.registered = registered;
            config.active = active;
        }
    }

    /// Persist after a user edit, replacing an unreadable stored list
    fn persist_edit(&mut self) {
        if self.store_unreadable {
            warn!("Replacing unreadable display configurations");
            self.store_unreadable = false;
        }
        self.persist();
    }

    fn persist(&mut self) {
        if self.store_unreadable {
            debug!("Not saving over unreadable display configurations");
            return;
        }
        if let Err(err) = self.store.save(&self.configs) {
            error!("can't save display configurations: {}", err);
        }
    }

    /// Allocate the virtual display for an entry.
    ///
    /// On device failure nothing changes. On success the device-assigned id
    /// replaces `displayConfig.id` and the expiry timer is (re)armed.
    pub fn register(&mut self, id: &str) -> Result<RegistrationInfo> {
        let index = self.index_of(id)?;
        if self.registry.contains(id) {
            return Err(AppError::AlreadyRegistered(id.to_string()));
        }

        let device = self
            .backend
            .devices
            .create(&self.configs[index].display_config)
            .map_err(|source| AppError::DeviceCreation {
                id: id.to_string(),
                source,
            })?;
        let display_id = device.display_id();

        self.registry
            .insert(id.to_string(), Registration::new(device));

        let config = &mut self.configs[index];
        config.display_config.id = display_id;
        config.registered = true;
        config.active = false;

        let armed = self.expiry.arm(id);
        info!(glass_id = %id, display_id, auto_unregister = armed, "Registered virtual display");
        self.persist();

        Ok(RegistrationInfo {
            id: id.to_string(),
            display_id,
            active: false,
        })
    }

    /// Open the presentation window and start streaming into it.
    ///
    /// Render parameters come from the entry as it is now. If the stream
    /// can't start, the window opened for it is closed again.
    pub fn activate(&mut self, id: &str) -> Result<Activation> {
        let index = self.index_of(id)?;
        let Some(registration) = self.registry.get(id) else {
            return Err(AppError::NotRegistered(id.to_string()));
        };
        if registration.is_active() {
            debug!(glass_id = %id, "Display already active");
            return Ok(Activation::AlreadyActive);
        }

        let config = &self.configs[index];
        let display_id = registration.display_id();
        let title = config.window_title(Some(display_id));
        let (window_width, window_height) = config.window_size();
        let params = RenderParams::from_config(config);

        let mut presentation = self
            .backend
            .presenter
            .open(&title, window_width, window_height)
            .map_err(|source| AppError::PresentationOpen {
                id: id.to_string(),
                source,
            })?;

        let generation = self.next_stream_generation;
        self.next_stream_generation += 1;
        let on_frame = forward_frames(self.frames.clone(), id.to_string(), generation);

        let stream = match self
            .backend
            .streams
            .start(registration.device(), params, on_frame)
        {
            Ok(stream) => stream,
            Err(source) => {
                presentation.close();
                return Err(AppError::StreamStart {
                    id: id.to_string(),
                    source,
                });
            }
        };

        if let Some(registration) = self.registry.get_mut(id) {
            registration.set_active(ActiveStream {
                generation,
                stream,
                presentation,
            });
        }
        self.configs[index].active = true;

        info!(
            glass_id = %id,
            display_id,
            title = %title,
            output_width = params.output_width,
            output_height = params.output_height,
            frame_delay = ?params.frame_delay,
            "Activated virtual display"
        );
        self.persist();
        Ok(Activation::Started)
    }

    /// Stop streaming and close the window. Returns false if the display
    /// wasn't active.
    pub fn deactivate(&mut self, id: &str) -> bool {
        let Some(active) = self
            .registry
            .get_mut(id)
            .and_then(Registration::take_active)
        else {
            return false;
        };

        stop_and_close(id, active);
        self.set_flags(id, true, false);
        info!(glass_id = %id, "Deactivated virtual display");
        self.persist();
        true
    }

    /// Release the display entirely. Returns false if it wasn't registered.
    pub fn unregister(&mut self, id: &str) -> bool {
        self.expiry.disarm(id);
        let Some(registration) = self.registry.remove(id) else {
            return false;
        };

        release(id, registration);
        self.set_flags(id, false, false);
        info!(glass_id = %id, "Unregistered virtual display");
        self.persist();
        true
    }

    /// Handle a fired expiry timer. Notices superseded by a later register or
    /// cancelled by an unregister are ignored.
    pub fn expire(&mut self, notice: &ExpiryNotice) -> bool {
        if !self.expiry.take_fired(notice) {
            debug!(glass_id = %notice.id, generation = notice.generation, "Ignoring stale expiry notice");
            return false;
        }
        info!(glass_id = %notice.id, "Automatic unregister delay elapsed");
        self.unregister(&notice.id)
    }

    /// Show a delivered frame if it belongs to the display's current stream
    pub fn deliver_frame(&mut self, delivery: FrameDelivery) -> bool {
        let Some(active) = self
            .registry
            .get_mut(&delivery.id)
            .and_then(Registration::active_mut)
        else {
            trace!(glass_id = %delivery.id, "Dropping frame for inactive display");
            return false;
        };

        if active.generation != delivery.generation {
            trace!(
                glass_id = %delivery.id,
                frame_generation = delivery.generation,
                current_generation = active.generation,
                "Dropping frame from stopped stream"
            );
            return false;
        }

        active.presentation.present(&delivery.frame);
        true
    }

    /// The user closed the presentation window
    pub fn presentation_closed(&mut self, id: &str) -> bool {
        debug!(glass_id = %id, "Presentation window closed");
        self.deactivate(id)
    }

    /// Append a new default entry
    pub fn add_config(&mut self, name: Option<String>) -> GlassConfig {
        let config = GlassConfig::new_display(name);
        info!(glass_id = %config.id, "Added display configuration");
        self.configs.push(config.clone());
        self.persist_edit();
        config
    }

    /// Replace the editable fields of an existing entry.
    ///
    /// Takes effect the next time the display is registered or activated.
    pub fn update_config(&mut self, edit: &GlassConfig) -> Result<()> {
        let index = self.index_of(&edit.id)?;
        self.configs[index].apply_edit(edit);
        debug!(glass_id = %edit.id, "Updated display configuration");
        self.persist_edit();
        Ok(())
    }

    /// Unregister and remove an entry. The list is never left empty.
    pub fn delete_config(&mut self, id: &str) -> Result<()> {
        self.index_of(id)?;
        self.unregister(id);
        config::remove_config(&mut self.configs, id);
        info!(glass_id = %id, "Deleted display configuration");
        self.persist_edit();
        Ok(())
    }

    pub fn set_settings(&mut self, settings: Settings) -> Result<()> {
        settings.validate()?;
        self.store.save_settings(&settings)?;
        self.expiry.configure(&settings);
        info!(
            enabled = settings.automatic_unregister_enabled,
            delay_secs = settings.automatic_unregister_delay_in_seconds,
            "Updated automatic unregister settings"
        );
        self.settings = settings;
        Ok(())
    }

    /// Re-register what was registered last run and re-activate what was
    /// active. Anything that fails stays unregistered.
    fn restore(&mut self) {
        let intents: Vec<(GlassId, bool, bool)> = self
            .configs
            .iter()
            .map(|c| (c.id.clone(), c.registered, c.active))
            .collect();

        for config in &mut self.configs {
            config.registered = false;
            config.active = false;
        }

        for (id, registered, active) in intents {
            if !registered {
                continue;
            }
            if let Err(err) = self.register(&id) {
                warn!(glass_id = %id, "can't restore registration: {}", err);
                continue;
            }
            if active {
                if let Err(err) = self.activate(&id) {
                    warn!(glass_id = %id, "can't restore activation: {}", err);
                }
            }
        }
        self.persist();
    }

    fn reset_runtime_flags(&mut self) {
        let stale = self
            .configs
            .iter()
            .filter(|c| c.registered || c.active)
            .count();
        if stale == 0 {
            return;
        }
        for config in &mut self.configs {
            config.registered = false;
            config.active = false;
        }
        info!(count = stale, "Cleared stale registration flags");
        self.persist();
    }

    /// Release every live display without touching the stored flags, so the
    /// next start can restore them.
    pub fn shutdown(&mut self) {
        self.expiry.disarm_all();
        for id in self.registry.ids() {
            if let Some(registration) = self.registry.remove(&id) {
                release(&id, registration);
            }
        }
        info!("Released all virtual displays");
    }
}

fn forward_frames(
    frames: mpsc::Sender<FrameDelivery>,
    id: GlassId,
    generation: u64,
) -> FrameCallback {
    Box::new(move |frame| {
        let delivery = FrameDelivery {
            id: id.clone(),
            generation,
            frame,
        };
        match frames.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!(glass_id = %id, "Frame queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                trace!(glass_id = %id, "Control loop gone, dropping frame");
            }
        }
    })
}

fn stop_and_close(id: &str, mut active: ActiveStream) {
    if let Err(err) = active.stream.stop() {
        warn!(glass_id = %id, "Error stopping display stream: {}", err);
    }
    active.presentation.close();
}

/// Stream first, then device
fn release(id: &str, mut registration: Registration) {
    if let Some(active) = registration.take_active() {
        stop_and_close(id, active);
    }
    let mut device = registration.into_device();
    if let Err(err) = device.teardown() {
        error!(glass_id = %id, display_id = device.display_id(), "Error tearing down virtual display: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayMode, Settings};
    use crate::display::testing::{frame, Event, Faults, Recorder};
    use crate::store::{JsonFileStore, MemoryStore};

    struct Harness {
        controller: LifecycleController,
        recorder: Recorder,
        store: MemoryStore,
        frames: mpsc::Receiver<FrameDelivery>,
        _notices: mpsc::UnboundedReceiver<ExpiryNotice>,
    }

    fn no_expiry() -> Settings {
        Settings {
            automatic_unregister_enabled: false,
            ..Settings::default()
        }
    }

    fn harness_with(configs: Vec<GlassConfig>, settings: Settings, policy: StartupPolicy) -> Harness {
        let recorder = Recorder::new();
        harness_for(recorder, configs, settings, policy)
    }

    fn harness_for(
        recorder: Recorder,
        configs: Vec<GlassConfig>,
        settings: Settings,
        policy: StartupPolicy,
    ) -> Harness {
        let store = MemoryStore::new(configs, settings);
        let (frames_tx, frames) = mpsc::channel(16);
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let controller = LifecycleController::new(
            Box::new(store.clone()),
            recorder.backend(),
            policy,
            frames_tx,
            notices_tx,
        );
        Harness {
            controller,
            recorder,
            store,
            frames,
            _notices: notices,
        }
    }

    fn single(config: GlassConfig) -> (Harness, GlassId) {
        let id = config.id.clone();
        (harness_with(vec![config], no_expiry(), StartupPolicy::Reset), id)
    }

    #[tokio::test]
    async fn test_register_then_unregister_clears_registry() {
        let (mut h, id) = single(GlassConfig::new_display(None));

        let info = h.controller.register(&id).unwrap();
        assert_eq!(h.controller.state(&id), LifecycleState::Registered);
        assert!(h.controller.config(&id).unwrap().registered);
        assert_eq!(info.display_id, 101);

        assert!(h.controller.unregister(&id));
        assert_eq!(h.controller.state(&id), LifecycleState::Unregistered);
        assert!(h.controller.registered_ids().is_empty());
        let config = h.controller.config(&id).unwrap();
        assert!(!config.registered);
        assert!(!config.active);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::DeviceTornDown(101))), 1);

        // Persisted state follows the flags
        let stored = h.store.load().unwrap();
        assert!(!stored[0].registered);
    }

    #[tokio::test]
    async fn test_register_writes_device_id_into_config() {
        let mut glass = GlassConfig::new_display(None);
        glass.display_config.id = 7;
        let (mut h, id) = single(glass);

        h.controller.register(&id).unwrap();
        assert_eq!(h.controller.config(&id).unwrap().display_config.id, 101);
    }

    #[tokio::test]
    async fn test_double_register_allocates_one_device() {
        let (mut h, id) = single(GlassConfig::new_display(None));

        h.controller.register(&id).unwrap();
        let second = h.controller.register(&id);

        assert!(matches!(second, Err(AppError::AlreadyRegistered(_))));
        assert_eq!(h.recorder.count(|e| matches!(e, Event::DeviceCreated(_))), 1);
    }

    #[tokio::test]
    async fn test_register_unknown_config() {
        let (mut h, _) = single(GlassConfig::new_display(None));
        assert!(matches!(
            h.controller.register("missing"),
            Err(AppError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_device_failure_mutates_nothing() {
        let mut glass = GlassConfig::new_display(None);
        glass.display_config.id = 7;
        let (mut h, id) = single(glass);
        let saves = h.store.saves();
        h.recorder.set_faults(Faults {
            fail_create: true,
            ..Faults::default()
        });

        let result = h.controller.register(&id);

        assert!(matches!(result, Err(AppError::DeviceCreation { .. })));
        assert_eq!(h.controller.state(&id), LifecycleState::Unregistered);
        let config = h.controller.config(&id).unwrap();
        assert!(!config.registered);
        assert_eq!(config.display_config.id, 7);
        assert_eq!(h.store.saves(), saves);
    }

    #[tokio::test]
    async fn test_activate_unregistered_creates_nothing() {
        let (mut h, id) = single(GlassConfig::new_display(None));

        let result = h.controller.activate(&id);

        assert!(matches!(result, Err(AppError::NotRegistered(_))));
        assert!(h.recorder.events().is_empty());
        assert!(!h.controller.config(&id).unwrap().active);
    }

    #[tokio::test]
    async fn test_full_lifecycle_scenario() {
        let mut glass = GlassConfig::new_display(Some("Desk".into()));
        glass.display_config.display_modes = vec![DisplayMode {
            width_pixels: 1920,
            height_pixels: 1080,
            refresh_rate_hz: 60.0,
        }];
        glass.render_width_pixels = Some(800);
        glass.window_width_pixels = 1280;
        glass.window_height_pixels = 720;
        let (mut h, id) = single(glass);

        h.controller.register(&id).unwrap();
        let info = h.controller.registration(&id).unwrap();
        assert!(!info.active);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::StreamStarted { .. })), 0);

        assert_eq!(h.controller.activate(&id).unwrap(), Activation::Started);
        assert_eq!(h.controller.state(&id), LifecycleState::Active);
        assert!(h.controller.config(&id).unwrap().active);
        let events = h.recorder.events();
        assert!(events.contains(&Event::WindowOpened {
            title: "Desk".into(),
            width: 1280,
            height: 720,
        }));
        let started = events.iter().find_map(|e| match e {
            Event::StreamStarted { params, .. } => Some(*params),
            _ => None,
        });
        let params = started.unwrap();
        assert_eq!((params.output_width, params.output_height), (800, 720));

        assert!(h.controller.deactivate(&id));
        assert_eq!(h.controller.state(&id), LifecycleState::Registered);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::StreamStopped(_))), 1);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::WindowClosed(_))), 1);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::DeviceTornDown(_))), 0);

        assert!(h.controller.unregister(&id));
        assert_eq!(h.recorder.count(|e| matches!(e, Event::DeviceTornDown(_))), 1);
        assert!(h.controller.registration(&id).is_none());
    }

    #[tokio::test]
    async fn test_activate_twice_is_a_no_op() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();

        assert_eq!(h.controller.activate(&id).unwrap(), Activation::Started);
        assert_eq!(h.controller.activate(&id).unwrap(), Activation::AlreadyActive);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::StreamStarted { .. })), 1);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::WindowOpened { .. })), 1);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.controller.activate(&id).unwrap();

        assert!(h.controller.deactivate(&id));
        let after_first = h.recorder.events();
        assert!(!h.controller.deactivate(&id));

        assert_eq!(h.recorder.events(), after_first);
        assert_eq!(h.controller.state(&id), LifecycleState::Registered);
        assert!(!h.controller.deactivate("missing"));
    }

    #[tokio::test]
    async fn test_stream_failure_closes_window() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.recorder.set_faults(Faults {
            fail_start: true,
            ..Faults::default()
        });

        let result = h.controller.activate(&id);

        assert!(matches!(result, Err(AppError::StreamStart { .. })));
        assert_eq!(h.recorder.count(|e| matches!(e, Event::WindowOpened { .. })), 1);
        assert_eq!(h.recorder.count(|e| matches!(e, Event::WindowClosed(_))), 1);
        assert_eq!(h.controller.state(&id), LifecycleState::Registered);
        assert!(!h.controller.config(&id).unwrap().active);
    }

    #[tokio::test]
    async fn test_window_failure_starts_no_stream() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.recorder.set_faults(Faults {
            fail_open: true,
            ..Faults::default()
        });

        assert!(matches!(
            h.controller.activate(&id),
            Err(AppError::PresentationOpen { .. })
        ));
        assert_eq!(h.recorder.count(|e| matches!(e, Event::StreamStarted { .. })), 0);
    }

    #[tokio::test]
    async fn test_unregister_stops_stream_before_teardown_despite_stop_error() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.controller.activate(&id).unwrap();
        h.recorder.set_faults(Faults {
            fail_stop: true,
            ..Faults::default()
        });

        assert!(h.controller.unregister(&id));

        let stopped = h.recorder.position(|e| matches!(e, Event::StreamStopped(_)));
        let closed = h.recorder.position(|e| matches!(e, Event::WindowClosed(_)));
        let torn_down = h.recorder.position(|e| matches!(e, Event::DeviceTornDown(_)));
        assert!(stopped.unwrap() < torn_down.unwrap());
        assert!(closed.unwrap() < torn_down.unwrap());
        assert_eq!(h.controller.state(&id), LifecycleState::Unregistered);
        assert!(!h.controller.unregister(&id));
    }

    #[tokio::test]
    async fn test_stale_frames_are_not_presented() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.controller.activate(&id).unwrap();
        let first_stream = h.recorder.callbacks()[0].clone();

        first_stream(frame(101, 0));
        let delivery = h.frames.try_recv().unwrap();
        assert!(h.controller.deliver_frame(delivery));

        h.controller.deactivate(&id);
        first_stream(frame(101, 1));
        let late = h.frames.try_recv().unwrap();
        assert!(!h.controller.deliver_frame(late));

        // A new stream does not resurrect frames of the old one
        h.controller.activate(&id).unwrap();
        let second_stream = h.recorder.callbacks()[1].clone();
        first_stream(frame(101, 2));
        second_stream(frame(101, 0));
        let stale = h.frames.try_recv().unwrap();
        let fresh = h.frames.try_recv().unwrap();
        assert!(!h.controller.deliver_frame(stale));
        assert!(h.controller.deliver_frame(fresh));

        assert_eq!(h.recorder.count(|e| matches!(e, Event::FramePresented { .. })), 2);
    }

    #[tokio::test]
    async fn test_full_frame_queue_drops_frames() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.controller.activate(&id).unwrap();
        let stream = h.recorder.callbacks()[0].clone();

        for sequence in 0..40 {
            stream(frame(101, sequence));
        }

        let mut queued = 0;
        while h.frames.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 16);
    }

    #[tokio::test]
    async fn test_presentation_closed_deactivates() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.controller.activate(&id).unwrap();

        assert!(h.controller.presentation_closed(&id));
        assert_eq!(h.controller.state(&id), LifecycleState::Registered);
        assert!(!h.controller.config(&id).unwrap().active);
    }

    #[tokio::test]
    async fn test_delete_last_config_recreates_default() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();

        h.controller.delete_config(&id).unwrap();

        assert_eq!(h.recorder.count(|e| matches!(e, Event::DeviceTornDown(_))), 1);
        assert_eq!(h.controller.configs().len(), 1);
        assert_ne!(h.controller.configs()[0].id, id);
        assert_eq!(h.store.load().unwrap().len(), 1);
        assert!(matches!(
            h.controller.delete_config(&id),
            Err(AppError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_and_update_config() {
        let (mut h, _) = single(GlassConfig::new_display(None));

        let added = h.controller.add_config(Some("Side".into()));
        assert_eq!(h.controller.configs().len(), 2);

        let mut edit = added.clone();
        edit.window_width_pixels = 1600;
        edit.registered = true;
        h.controller.update_config(&edit).unwrap();

        let stored = h.controller.config(&added.id).unwrap();
        assert_eq!(stored.window_width_pixels, 1600);
        assert!(!stored.registered);

        edit.id = "missing".into();
        assert!(matches!(
            h.controller.update_config(&edit),
            Err(AppError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_reregisters_previous_intent() {
        let mut streaming = GlassConfig::new_display(Some("Streaming".into()));
        streaming.registered = true;
        streaming.active = true;
        let mut broken = GlassConfig::new_display(None);
        broken.display_config.name = Some("broken".into());
        broken.registered = true;
        let idle = GlassConfig::new_display(None);
        let ids = [streaming.id.clone(), broken.id.clone(), idle.id.clone()];

        let recorder = Recorder::new();
        recorder.set_faults(Faults {
            fail_create_named: Some("broken".into()),
            ..Faults::default()
        });
        let h = harness_for(
            recorder,
            vec![streaming, broken, idle],
            no_expiry(),
            StartupPolicy::Restore,
        );

        assert_eq!(h.controller.state(&ids[0]), LifecycleState::Active);
        assert_eq!(h.controller.state(&ids[1]), LifecycleState::Unregistered);
        assert!(!h.controller.config(&ids[1]).unwrap().registered);
        assert_eq!(h.controller.state(&ids[2]), LifecycleState::Unregistered);
    }

    #[tokio::test]
    async fn test_reset_clears_stale_flags() {
        let mut glass = GlassConfig::new_display(None);
        glass.registered = true;
        glass.active = true;
        let (h, id) = single(glass);

        let config = h.controller.config(&id).unwrap();
        assert!(!config.registered && !config.active);
        assert!(h.recorder.events().is_empty());
        assert!(!h.store.load().unwrap()[0].registered);
    }

    #[tokio::test]
    async fn test_empty_store_gets_default_entry() {
        let h = harness_with(Vec::new(), no_expiry(), StartupPolicy::Reset);
        assert_eq!(h.controller.configs().len(), 1);
    }

    #[tokio::test]
    async fn test_register_arms_expiry_and_unregister_disarms() {
        let glass = GlassConfig::new_display(None);
        let id = glass.id.clone();
        let mut h = harness_with(vec![glass], Settings::default(), StartupPolicy::Reset);

        h.controller.register(&id).unwrap();
        assert!(h.controller.is_expiry_armed(&id));

        h.controller.unregister(&id);
        assert!(!h.controller.is_expiry_armed(&id));
    }

    #[tokio::test]
    async fn test_stale_expiry_notice_is_ignored() {
        let glass = GlassConfig::new_display(None);
        let id = glass.id.clone();
        let mut h = harness_with(vec![glass], Settings::default(), StartupPolicy::Reset);

        h.controller.register(&id).unwrap();
        h.controller.unregister(&id);
        h.controller.register(&id).unwrap();

        let old = ExpiryNotice {
            id: id.clone(),
            generation: 0,
        };
        assert!(!h.controller.expire(&old));
        assert_eq!(h.controller.state(&id), LifecycleState::Registered);

        let current = ExpiryNotice {
            id: id.clone(),
            generation: 1,
        };
        assert!(h.controller.expire(&current));
        assert_eq!(h.controller.state(&id), LifecycleState::Unregistered);
    }

    #[tokio::test]
    async fn test_set_settings() {
        let glass = GlassConfig::new_display(None);
        let id = glass.id.clone();
        let mut h = harness_with(vec![glass], Settings::default(), StartupPolicy::Reset);
        h.controller.register(&id).unwrap();

        let invalid = Settings {
            automatic_unregister_delay_in_seconds: -5.0,
            ..Settings::default()
        };
        assert!(matches!(h.controller.set_settings(invalid), Err(AppError::Config(_))));
        assert!(h.controller.is_expiry_armed(&id));

        h.controller.set_settings(no_expiry()).unwrap();
        assert!(!h.controller.is_expiry_armed(&id));
        assert_eq!(h.store.load_settings().unwrap(), no_expiry());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything_but_keeps_intent() {
        let (mut h, id) = single(GlassConfig::new_display(None));
        h.controller.register(&id).unwrap();
        h.controller.activate(&id).unwrap();

        h.controller.shutdown();

        assert_eq!(h.controller.state(&id), LifecycleState::Unregistered);
        let stopped = h.recorder.position(|e| matches!(e, Event::StreamStopped(_)));
        let torn_down = h.recorder.position(|e| matches!(e, Event::DeviceTornDown(_)));
        assert!(stopped.unwrap() < torn_down.unwrap());
        let stored = h.store.load().unwrap();
        assert!(stored[0].registered && stored[0].active);
    }

    #[tokio::test]
    async fn test_unreadable_store_is_kept_until_edited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glass_configs.json");
        std::fs::write(&path, "{ hand edited, one typo").unwrap();

        let recorder = Recorder::new();
        let (frames_tx, _frames) = mpsc::channel(16);
        let (notices_tx, _notices) = mpsc::unbounded_channel();
        let mut controller = LifecycleController::new(
            Box::new(JsonFileStore::new(dir.path())),
            recorder.backend(),
            StartupPolicy::Restore,
            frames_tx,
            notices_tx,
        );
        assert_eq!(controller.configs().len(), 1);

        // Lifecycle changes alone don't replace the user's file
        let id = controller.configs()[0].id.clone();
        controller.register(&id).unwrap();
        controller.unregister(&id);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{ hand edited, one typo"
        );

        let added = controller.add_config(Some("Fresh".into()));
        let stored = JsonFileStore::new(dir.path()).load().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].id, added.id);
    }
}
