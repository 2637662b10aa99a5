// SPDX-License-Identifier: GPL-3.0-only
//! Recording fakes of the platform capabilities for tests

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};

use super::backend::{
    Backend, DeviceFactory, DisplayStream, Frame, FrameCallback, Presentation, PresentationSink,
    RenderParams, StreamFactory, VirtualDevice,
};
use crate::config::{DisplayConfig, DisplayId};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceCreated(DisplayId),
    DeviceTornDown(DisplayId),
    StreamStarted {
        display_id: DisplayId,
        params: RenderParams,
    },
    StreamStopped(DisplayId),
    WindowOpened {
        title: String,
        width: u32,
        height: u32,
    },
    WindowClosed(String),
    FramePresented {
        title: String,
        sequence: u64,
    },
}

#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub fail_create: bool,
    /// Refuse only displays with this name
    pub fail_create_named: Option<String>,
    pub fail_open: bool,
    pub fail_start: bool,
    pub fail_stop: bool,
}

#[derive(Default)]
struct RecorderState {
    events: Vec<Event>,
    faults: Faults,
    callbacks: Vec<Arc<FrameCallback>>,
    next_display_id: DisplayId,
}

/// Shared journal of everything the fakes were asked to do
#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    pub fn new() -> Self {
        let recorder = Self::default();
        recorder.state.lock().unwrap().next_display_id = 100;
        recorder
    }

    pub fn backend(&self) -> Backend {
        Backend {
            devices: Box::new(FakeDevices(self.clone())),
            streams: Box::new(FakeStreams(self.clone())),
            presenter: Box::new(FakeSink(self.clone())),
        }
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().unwrap().faults = faults;
    }

    fn faults(&self) -> Faults {
        self.state.lock().unwrap().faults.clone()
    }

    fn record(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(|e| pred(e))
    }

    /// Frame callbacks handed to started streams, oldest first
    pub fn callbacks(&self) -> Vec<Arc<FrameCallback>> {
        self.state.lock().unwrap().callbacks.clone()
    }
}

pub fn frame(display_id: DisplayId, sequence: u64) -> Frame {
    Frame {
        display_id,
        width: 4,
        height: 4,
        sequence,
        captured_at: Instant::now(),
        data: Arc::from(Vec::new()),
    }
}

struct FakeDevices(Recorder);

impl DeviceFactory for FakeDevices {
    fn create(&mut self, config: &DisplayConfig) -> Result<Box<dyn VirtualDevice>> {
        let faults = self.0.faults();
        let named_fault = faults.fail_create_named.is_some()
            && faults.fail_create_named.as_deref() == config.name.as_deref();
        if faults.fail_create || named_fault {
            return Err(anyhow!("virtual display refused"));
        }

        let id = {
            let mut state = self.0.state.lock().unwrap();
            state.next_display_id += 1;
            state.next_display_id
        };
        self.0.record(Event::DeviceCreated(id));
        Ok(Box::new(FakeDevice {
            id,
            max_size: (config.max_width_pixels, config.max_height_pixels),
            recorder: self.0.clone(),
        }))
    }
}

struct FakeDevice {
    id: DisplayId,
    max_size: (u32, u32),
    recorder: Recorder,
}

impl std::fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeDevice({})", self.id)
    }
}

impl VirtualDevice for FakeDevice {
    fn display_id(&self) -> DisplayId {
        self.id
    }

    fn max_size(&self) -> (u32, u32) {
        self.max_size
    }

    fn teardown(&mut self) -> Result<()> {
        self.recorder.record(Event::DeviceTornDown(self.id));
        Ok(())
    }
}

struct FakeStreams(Recorder);

impl StreamFactory for FakeStreams {
    fn start(
        &mut self,
        device: &dyn VirtualDevice,
        params: RenderParams,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn DisplayStream>> {
        if self.0.faults().fail_start {
            return Err(anyhow!("stream refused"));
        }
        let display_id = device.display_id();
        self.0.record(Event::StreamStarted { display_id, params });
        self.0.state.lock().unwrap().callbacks.push(Arc::new(on_frame));
        Ok(Box::new(FakeStream {
            display_id,
            recorder: self.0.clone(),
            stopped: false,
        }))
    }
}

struct FakeStream {
    display_id: DisplayId,
    recorder: Recorder,
    stopped: bool,
}

impl DisplayStream for FakeStream {
    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.recorder.record(Event::StreamStopped(self.display_id));
        if self.recorder.faults().fail_stop {
            return Err(anyhow!("stream did not acknowledge stop"));
        }
        Ok(())
    }
}

struct FakeSink(Recorder);

impl PresentationSink for FakeSink {
    fn open(&mut self, title: &str, width: u32, height: u32) -> Result<Box<dyn Presentation>> {
        if self.0.faults().fail_open {
            return Err(anyhow!("no window server"));
        }
        self.0.record(Event::WindowOpened {
            title: title.to_string(),
            width,
            height,
        });
        Ok(Box::new(FakePresentation {
            title: title.to_string(),
            recorder: self.0.clone(),
        }))
    }
}

struct FakePresentation {
    title: String,
    recorder: Recorder,
}

impl Presentation for FakePresentation {
    fn present(&mut self, frame: &Frame) {
        self.recorder.record(Event::FramePresented {
            title: self.title.clone(),
            sequence: frame.sequence,
        });
    }

    fn close(&mut self) {
        self.recorder.record(Event::WindowClosed(self.title.clone()));
    }
}
