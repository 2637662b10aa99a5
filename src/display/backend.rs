// SPDX-License-Identifier: GPL-3.0-only
//! Platform capabilities the lifecycle controller drives
//!
//! Allocating a virtual monitor, capturing its frames and putting them on
//! screen are platform work. The controller only sees these traits; the
//! headless implementations live in `crate::backends`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::{DisplayConfig, DisplayId, GlassConfig};

/// One rendered frame of a virtual display
#[derive(Clone, Debug)]
pub struct Frame {
    pub display_id: DisplayId,
    pub width: u32,
    pub height: u32,
    /// Counts up from zero for each stream
    pub sequence: u64,
    pub captured_at: Instant,
    /// BGRA pixels, may be empty for producers that only signal damage
    pub data: Arc<[u8]>,
}

/// Called from the stream's delivery context for every produced frame
pub type FrameCallback = Box<dyn Fn(Frame) + Send + Sync + 'static>;

/// Stream parameters resolved from a [`GlassConfig`] at activation time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderParams {
    pub output_width: u32,
    pub output_height: u32,
    /// Minimum time between two frames
    pub frame_delay: Duration,
}

impl RenderParams {
    pub fn from_config(config: &GlassConfig) -> Self {
        let (output_width, output_height) = config.output_size();
        Self {
            output_width,
            output_height,
            frame_delay: config.frame_delay(),
        }
    }
}

/// A live virtual display
pub trait VirtualDevice: std::fmt::Debug + Send {
    /// Id the platform assigned to this display
    fn display_id(&self) -> DisplayId;

    /// Largest frame, in pixels, the display accepts
    fn max_size(&self) -> (u32, u32);

    /// Release the display. Never called while a stream still references it.
    fn teardown(&mut self) -> Result<()>;
}

pub trait DeviceFactory: Send {
    fn create(&mut self, config: &DisplayConfig) -> Result<Box<dyn VirtualDevice>>;
}

/// A running frame subscription
pub trait DisplayStream: Send {
    /// Request the stream to stop. Calling it again is a no-op.
    fn stop(&mut self) -> Result<()>;
}

pub trait StreamFactory: Send {
    fn start(
        &mut self,
        device: &dyn VirtualDevice,
        params: RenderParams,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn DisplayStream>>;
}

/// An open window showing frames
pub trait Presentation: Send {
    fn present(&mut self, frame: &Frame);

    fn close(&mut self);
}

pub trait PresentationSink: Send {
    fn open(&mut self, title: &str, width: u32, height: u32) -> Result<Box<dyn Presentation>>;
}

/// The three capabilities bundled for the controller
pub struct Backend {
    pub devices: Box<dyn DeviceFactory>,
    pub streams: Box<dyn StreamFactory>,
    pub presenter: Box<dyn PresentationSink>,
}
