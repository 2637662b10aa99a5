// SPDX-License-Identifier: GPL-3.0-only
//! The control loop that owns the lifecycle controller
//!
//! Editor commands, frames from running streams and fired expiry timers all
//! arrive here as messages and are applied one at a time. Nothing else ever
//! touches the registry, which is what keeps register / activate / deactivate
//! / unregister for one display from interleaving.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::backend::Backend;
use super::controller::{
    Activation, FrameDelivery, LifecycleController, LifecycleState, RegistrationInfo,
    StartupPolicy,
};
use super::expiry::ExpiryNotice;
use crate::config::{GlassConfig, GlassId, Settings};
use crate::error::{AppError, Result};
use crate::store::ConfigStore;

/// Frames waiting for the loop; producers drop frames beyond this
const FRAME_QUEUE_DEPTH: usize = 8;
const COMMAND_QUEUE_DEPTH: usize = 32;

enum Command {
    Register {
        id: GlassId,
        reply: oneshot::Sender<Result<RegistrationInfo>>,
    },
    Activate {
        id: GlassId,
        reply: oneshot::Sender<Result<Activation>>,
    },
    Deactivate {
        id: GlassId,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        id: GlassId,
        reply: oneshot::Sender<bool>,
    },
    PresentationClosed {
        id: GlassId,
    },
    State {
        id: GlassId,
        reply: oneshot::Sender<LifecycleState>,
    },
    Configs {
        reply: oneshot::Sender<Vec<GlassConfig>>,
    },
    AddConfig {
        name: Option<String>,
        reply: oneshot::Sender<GlassConfig>,
    },
    UpdateConfig {
        config: Box<GlassConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteConfig {
        id: GlassId,
        reply: oneshot::Sender<Result<()>>,
    },
    Settings {
        reply: oneshot::Sender<Settings>,
    },
    SetSettings {
        settings: Settings,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct ControlLoop {
    controller: LifecycleController,
    commands: mpsc::Receiver<Command>,
    frames: mpsc::Receiver<FrameDelivery>,
    notices: mpsc::UnboundedReceiver<ExpiryNotice>,
}

impl ControlLoop {
    /// Build the controller and the handle used to drive it.
    ///
    /// Must be called inside a tokio runtime: restoring displays may start
    /// streams and expiry timers.
    pub fn new(
        store: Box<dyn ConfigStore>,
        backend: Backend,
        policy: StartupPolicy,
    ) -> (Self, LifecycleHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (frames_tx, frames) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (notices_tx, notices) = mpsc::unbounded_channel();

        let controller = LifecycleController::new(store, backend, policy, frames_tx, notices_tx);

        (
            Self {
                controller,
                commands,
                frames,
                notices,
            },
            LifecycleHandle {
                commands: commands_tx,
            },
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Display control loop started");
        loop {
            tokio::select! {
                // Commands first so a frame flood can't starve lifecycle changes
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => {
                        // Every handle is gone
                        self.controller.shutdown();
                        break;
                    }
                },
                Some(notice) = self.notices.recv() => {
                    self.controller.expire(&notice);
                }
                Some(delivery) = self.frames.recv() => {
                    self.controller.deliver_frame(delivery);
                }
            }
        }
        info!("Display control loop stopped");
    }

    /// Apply one command. Returns false once the loop should stop.
    fn handle(&mut self, command: Command) -> bool {
        // A dropped reply receiver only means the caller stopped waiting
        match command {
            Command::Register { id, reply } => {
                let _ = reply.send(self.controller.register(&id));
            }
            Command::Activate { id, reply } => {
                let _ = reply.send(self.controller.activate(&id));
            }
            Command::Deactivate { id, reply } => {
                let _ = reply.send(self.controller.deactivate(&id));
            }
            Command::Unregister { id, reply } => {
                let _ = reply.send(self.controller.unregister(&id));
            }
            Command::PresentationClosed { id } => {
                self.controller.presentation_closed(&id);
            }
            Command::State { id, reply } => {
                let _ = reply.send(self.controller.state(&id));
            }
            Command::Configs { reply } => {
                let _ = reply.send(self.controller.configs().to_vec());
            }
            Command::AddConfig { name, reply } => {
                let _ = reply.send(self.controller.add_config(name));
            }
            Command::UpdateConfig { config, reply } => {
                let _ = reply.send(self.controller.update_config(&config));
            }
            Command::DeleteConfig { id, reply } => {
                let _ = reply.send(self.controller.delete_config(&id));
            }
            Command::Settings { reply } => {
                let _ = reply.send(self.controller.settings().clone());
            }
            Command::SetSettings { settings, reply } => {
                let _ = reply.send(self.controller.set_settings(settings));
            }
            Command::Shutdown { reply } => {
                self.controller.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

/// Cloneable handle for issuing commands to the control loop
#[derive(Clone)]
pub struct LifecycleHandle {
    commands: mpsc::Sender<Command>,
}

impl LifecycleHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| AppError::ControlLoopClosed)?;
        response.await.map_err(|_| AppError::ControlLoopClosed)
    }

    pub async fn register(&self, id: impl Into<GlassId>) -> Result<RegistrationInfo> {
        let id = id.into();
        self.request(|reply| Command::Register { id, reply }).await?
    }

    pub async fn activate(&self, id: impl Into<GlassId>) -> Result<Activation> {
        let id = id.into();
        self.request(|reply| Command::Activate { id, reply }).await?
    }

    /// Returns whether the display was active
    pub async fn deactivate(&self, id: impl Into<GlassId>) -> Result<bool> {
        let id = id.into();
        self.request(|reply| Command::Deactivate { id, reply }).await
    }

    /// Returns whether the display was registered
    pub async fn unregister(&self, id: impl Into<GlassId>) -> Result<bool> {
        let id = id.into();
        self.request(|reply| Command::Unregister { id, reply }).await
    }

    /// Report that the user closed a display's window
    pub async fn presentation_closed(&self, id: impl Into<GlassId>) -> Result<()> {
        let id = id.into();
        self.commands
            .send(Command::PresentationClosed { id })
            .await
            .map_err(|_| AppError::ControlLoopClosed)
    }

    pub async fn state(&self, id: impl Into<GlassId>) -> Result<LifecycleState> {
        let id = id.into();
        self.request(|reply| Command::State { id, reply }).await
    }

    pub async fn configs(&self) -> Result<Vec<GlassConfig>> {
        self.request(|reply| Command::Configs { reply }).await
    }

    pub async fn add_config(&self, name: Option<String>) -> Result<GlassConfig> {
        self.request(|reply| Command::AddConfig { name, reply }).await
    }

    pub async fn update_config(&self, config: GlassConfig) -> Result<()> {
        let config = Box::new(config);
        self.request(|reply| Command::UpdateConfig { config, reply })
            .await?
    }

    pub async fn delete_config(&self, id: impl Into<GlassId>) -> Result<()> {
        let id = id.into();
        self.request(|reply| Command::DeleteConfig { id, reply }).await?
    }

    pub async fn settings(&self) -> Result<Settings> {
        self.request(|reply| Command::Settings { reply }).await
    }

    pub async fn set_settings(&self, settings: Settings) -> Result<()> {
        self.request(|reply| Command::SetSettings { settings, reply })
            .await?
    }

    /// Release every display and stop the loop
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
