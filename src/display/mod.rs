// SPDX-License-Identifier: GPL-3.0-only
mod backend;
mod controller;
mod expiry;
mod registry;
mod service;
#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    Backend, DeviceFactory, DisplayStream, Frame, FrameCallback, Presentation, PresentationSink,
    RenderParams, StreamFactory, VirtualDevice,
};
pub use controller::{Activation, LifecycleState, StartupPolicy};
pub use service::{ControlLoop, LifecycleHandle};
