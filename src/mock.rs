//! Mock devices for tests and harnesses.
//!
//! The mocks record the commands they receive; the test harness plays the
//! asynchronous half of each device contract by delivering
//! [`DeviceEvent`](crate::state::DeviceEvent)s itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::devices::{
    DeviceError, DeviceResult, GuideCamera, MountInfo, PulseCommand, PulseRelay, SensorGeometry,
    Subframe,
};
use crate::external::ControlChannel;
use crate::error::{GuideError, GuideResult};

/// Exposure request recorded by [`MockCamera`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    /// Requested duration
    pub exposure: Duration,
    /// Subframe in effect when the exposure was started
    pub subframe: Option<Subframe>,
}

/// Mock imaging device.
pub struct MockCamera {
    sensor: SensorGeometry,
    subframe: Option<Subframe>,
    requests: Arc<Mutex<Vec<ExposureRequest>>>,
    connected: bool,
    exposing: bool,
}

impl MockCamera {
    /// Create a connected mock with the given sensor dimensions.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            sensor: SensorGeometry { width, height },
            subframe: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            connected: true,
            exposing: false,
        }
    }

    /// Handle for inspecting recorded exposure requests.
    pub fn requests(&self) -> Arc<Mutex<Vec<ExposureRequest>>> {
        self.requests.clone()
    }

    /// Simulate the device going away.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Subframe currently configured.
    pub fn current_subframe(&self) -> Option<Subframe> {
        self.subframe
    }
}

impl GuideCamera for MockCamera {
    fn start_exposure(&mut self, exposure: Duration) -> DeviceResult<()> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.exposing = true;
        self.requests.lock().unwrap().push(ExposureRequest {
            exposure,
            subframe: self.subframe,
        });
        Ok(())
    }

    fn abort_exposure(&mut self) -> DeviceResult<()> {
        self.exposing = false;
        Ok(())
    }

    fn set_subframe(&mut self, region: Option<Subframe>) -> DeviceResult<()> {
        if let Some(subframe) = region {
            if !subframe.fits(self.sensor.width, self.sensor.height) {
                return Err(DeviceError::InvalidSubframe(format!(
                    "{subframe:?} does not fit {}x{}",
                    self.sensor.width, self.sensor.height
                )));
            }
        }
        self.subframe = region;
        Ok(())
    }

    fn sensor(&self) -> SensorGeometry {
        self.sensor
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Mock pulse relay recording every commanded pulse.
pub struct MockRelay {
    pulses: Arc<Mutex<Vec<PulseCommand>>>,
    independent_axes: bool,
    connected: bool,
}

impl MockRelay {
    /// Create a connected mock relay.
    pub fn new(independent_axes: bool) -> Self {
        Self {
            pulses: Arc::new(Mutex::new(Vec::new())),
            independent_axes,
            connected: true,
        }
    }

    /// Handle for inspecting recorded pulses.
    pub fn pulses(&self) -> Arc<Mutex<Vec<PulseCommand>>> {
        self.pulses.clone()
    }

    /// Simulate the device going away.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

impl PulseRelay for MockRelay {
    fn pulse(&mut self, command: PulseCommand) -> DeviceResult<()> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.pulses.lock().unwrap().push(command);
        Ok(())
    }

    fn independent_axes(&self) -> bool {
        self.independent_axes
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Fixed mount-information provider.
#[derive(Debug, Clone, Copy)]
pub struct FixedMount {
    /// Focal length in millimeters
    pub focal_length_mm: f64,
    /// Aperture in millimeters
    pub aperture_mm: f64,
    /// Pixel pitch in micrometers
    pub pixel_pitch_um: f64,
}

impl Default for FixedMount {
    fn default() -> Self {
        // 400 mm f/5 guide scope on 3.8 um pixels: ~1.96"/px
        Self {
            focal_length_mm: 400.0,
            aperture_mm: 80.0,
            pixel_pitch_um: 3.8,
        }
    }
}

impl MountInfo for FixedMount {
    fn focal_length_mm(&self) -> f64 {
        self.focal_length_mm
    }

    fn aperture_mm(&self) -> f64 {
        self.aperture_mm
    }

    fn pixel_pitch_um(&self) -> f64 {
        self.pixel_pitch_um
    }
}

/// In-memory control channel for exercising the external delegates.
///
/// Lines "sent" by a backend are collected for inspection; the test queues
/// the remote process's replies with [`MemoryChannel::push_incoming`].
/// Clones share the same buffers, so a clone kept outside the backend can
/// push replies or close the transport mid-run.
#[derive(Default, Clone)]
pub struct MemoryChannel {
    sent: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<VecDeque<String>>>,
    open: Arc<Mutex<bool>>,
}

impl MemoryChannel {
    /// Create an open channel.
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            incoming: Arc::new(Mutex::new(VecDeque::new())),
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Handle for inspecting lines sent by the backend.
    pub fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }

    /// Queue a line from the simulated remote process.
    pub fn push_incoming(&self, line: impl Into<String>) {
        self.incoming.lock().unwrap().push_back(line.into());
    }

    /// Simulate the remote process closing the connection.
    pub fn close(&self) {
        *self.open.lock().unwrap() = false;
    }
}

impl ControlChannel for MemoryChannel {
    fn send_line(&mut self, line: &str) -> GuideResult<()> {
        if !*self.open.lock().unwrap() {
            return Err(GuideError::ChannelClosed);
        }
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn poll_lines(&mut self) -> Vec<String> {
        self.incoming.lock().unwrap().drain(..).collect()
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }
}
