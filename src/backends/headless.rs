// SPDX-License-Identifier: GPL-3.0-only
//! Headless backend
//!
//! Virtual displays are plain in-process records, streams are tokio tasks
//! producing a test pattern at the configured rate, and presentation windows
//! only log what they would show.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;

use crate::config::{DisplayConfig, DisplayId};
use crate::display::{
    Backend, DeviceFactory, DisplayStream, Frame, FrameCallback, Presentation, PresentationSink,
    RenderParams, StreamFactory, VirtualDevice,
};

/// First id handed out; keeps headless ids clear of small physical ones
const FIRST_DISPLAY_ID: DisplayId = 0x1000;
/// Upper bound on the frame rate when no delay is configured
const MAX_REFRESH_HZ: f64 = 240.0;
/// Longest gap between two frames
const MAX_FRAME_PERIOD: Duration = Duration::from_secs(3600);
/// Checkerboard tile edge in pixels
const CHECKER_SIZE: u32 = 32;
/// How often a window logs its frame count
const LOG_EVERY_FRAMES: u64 = 600;

pub fn backend() -> Backend {
    Backend {
        devices: Box::new(HeadlessDevices::new()),
        streams: Box::new(HeadlessStreams),
        presenter: Box::new(LoggingPresenter),
    }
}

/// Allocates in-process virtual displays
pub struct HeadlessDevices {
    next_id: AtomicU32,
    live: Arc<AtomicUsize>,
}

impl HeadlessDevices {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(FIRST_DISPLAY_ID),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for HeadlessDevices {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(config: &DisplayConfig) -> Result<()> {
    if config.max_width_pixels == 0 || config.max_height_pixels == 0 {
        bail!("maximum resolution must be non-zero");
    }
    if config.display_modes.is_empty() {
        bail!("at least one display mode is required");
    }
    for mode in &config.display_modes {
        if mode.width_pixels == 0 || mode.height_pixels == 0 {
            bail!("display mode {}x{} is empty", mode.width_pixels, mode.height_pixels);
        }
        if mode.width_pixels > config.max_width_pixels
            || mode.height_pixels > config.max_height_pixels
        {
            bail!(
                "display mode {}x{} exceeds maximum resolution {}x{}",
                mode.width_pixels,
                mode.height_pixels,
                config.max_width_pixels,
                config.max_height_pixels
            );
        }
        if !(mode.refresh_rate_hz.is_finite() && mode.refresh_rate_hz > 0.0) {
            bail!("refresh rate {} Hz is invalid", mode.refresh_rate_hz);
        }
    }
    Ok(())
}

impl DeviceFactory for HeadlessDevices {
    fn create(&mut self, config: &DisplayConfig) -> Result<Box<dyn VirtualDevice>> {
        validate(config)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let refresh_rate_hz = config.display_modes[0].refresh_rate_hz;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            display_id = id,
            name = config.name.as_deref().unwrap_or_default(),
            modes = config.display_modes.len(),
            live,
            "Virtual display created (headless)"
        );

        Ok(Box::new(HeadlessDevice {
            id,
            refresh_rate_hz,
            max_size: (config.max_width_pixels, config.max_height_pixels),
            live: Arc::clone(&self.live),
            released: false,
        }))
    }
}

pub struct HeadlessDevice {
    id: DisplayId,
    refresh_rate_hz: f64,
    max_size: (u32, u32),
    live: Arc<AtomicUsize>,
    released: bool,
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeadlessDevice(id: {}, {} Hz)", self.id, self.refresh_rate_hz)
    }
}

impl VirtualDevice for HeadlessDevice {
    fn display_id(&self) -> DisplayId {
        self.id
    }

    fn max_size(&self) -> (u32, u32) {
        self.max_size
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            let live = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
            info!(display_id = self.id, live, "Virtual display removed (headless)");
        }
        Ok(())
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        if !self.released {
            warn!(display_id = self.id, "Virtual display dropped without teardown");
            let _ = self.teardown();
        }
    }
}

/// Per-display tints of the test pattern, BGR
const TINTS: [[u8; 3]; 4] = [[160, 80, 40], [40, 60, 160], [60, 140, 40], [40, 100, 140]];

/// BGRA checkerboard in the display's tint.
///
/// Only two distinct rows exist, so they are built once and repeated.
fn test_pattern(display_id: DisplayId, width: u32, height: u32) -> Result<Arc<[u8]>> {
    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(4))
        .with_context(|| format!("frame of {width}x{height} pixels is too large"))?;

    let light = TINTS[display_id as usize % TINTS.len()];
    let dark = light.map(|c| (u16::from(c) * 7 / 10) as u8);
    let row = |phase: u32| -> Vec<u8> {
        (0..width)
            .flat_map(|x| {
                let [b, g, r] = if (x / CHECKER_SIZE + phase) % 2 == 0 { light } else { dark };
                [b, g, r, 255]
            })
            .collect()
    };
    let rows = [row(0), row(1)];

    let mut data = Vec::with_capacity(len);
    for y in 0..height {
        data.extend_from_slice(&rows[(y / CHECKER_SIZE % 2) as usize]);
    }
    Ok(data.into())
}

/// Starts timer-driven streams for [`HeadlessDevice`]s
pub struct HeadlessStreams;

impl StreamFactory for HeadlessStreams {
    fn start(
        &mut self,
        device: &dyn VirtualDevice,
        params: RenderParams,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn DisplayStream>> {
        if params.output_width == 0 || params.output_height == 0 {
            bail!(
                "output size {}x{} is empty",
                params.output_width,
                params.output_height
            );
        }

        let (max_width, max_height) = device.max_size();
        if params.output_width > max_width || params.output_height > max_height {
            bail!(
                "output size {}x{} exceeds the display maximum {}x{}",
                params.output_width,
                params.output_height,
                max_width,
                max_height
            );
        }

        let display_id = device.display_id();
        let floor = Duration::from_secs_f64(1.0 / MAX_REFRESH_HZ);
        let period = params.frame_delay.clamp(floor, MAX_FRAME_PERIOD);
        let pattern = test_pattern(display_id, params.output_width, params.output_height)?;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                on_frame(Frame {
                    display_id,
                    width: params.output_width,
                    height: params.output_height,
                    sequence,
                    captured_at: Instant::now(),
                    data: Arc::clone(&pattern),
                });
                sequence += 1;
            }
        });

        info!(display_id, ?period, "Display stream started (headless)");
        Ok(Box::new(HeadlessStream {
            display_id,
            task: Some(task),
        }))
    }
}

pub struct HeadlessStream {
    display_id: DisplayId,
    task: Option<JoinHandle<()>>,
}

impl DisplayStream for HeadlessStream {
    fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(display_id = self.display_id, "Display stream stopped (headless)");
        }
        Ok(())
    }
}

impl Drop for HeadlessStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// "Opens" windows by logging them
pub struct LoggingPresenter;

impl PresentationSink for LoggingPresenter {
    fn open(&mut self, title: &str, width: u32, height: u32) -> Result<Box<dyn Presentation>> {
        if width == 0 || height == 0 {
            bail!("window size {}x{} is empty", width, height);
        }
        info!(title, width, height, "Presentation window opened");
        Ok(Box::new(LoggedWindow::new(title)))
    }
}

pub struct LoggedWindow {
    title: String,
    presented: u64,
    /// Size of the last frame shown
    frame_size: Option<(u32, u32)>,
    open: bool,
}

impl LoggedWindow {
    fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            presented: 0,
            frame_size: None,
            open: true,
        }
    }
}

impl Presentation for LoggedWindow {
    fn present(&mut self, frame: &Frame) {
        if !self.open {
            return;
        }
        self.presented += 1;
        let size = (frame.width, frame.height);
        if self.frame_size != Some(size) {
            debug!(
                title = %self.title,
                display_id = frame.display_id,
                width = frame.width,
                height = frame.height,
                bytes = frame.data.len(),
                "Frame size changed"
            );
            self.frame_size = Some(size);
        }
        if self.presented % LOG_EVERY_FRAMES == 0 {
            debug!(
                title = %self.title,
                presented = self.presented,
                sequence = frame.sequence,
                latency = ?frame.captured_at.elapsed(),
                "Presenting frames"
            );
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            info!(title = %self.title, presented = self.presented, "Presentation window closed");
        }
    }
}
