//! Device contracts consumed by the guiding core.
//!
//! Provides trait abstractions for the three external collaborators — an
//! imaging device, a pulse relay (ST4 port or adaptive-optics unit), and a
//! mount-information provider — so the core can be driven by real hardware
//! or by the mock devices in [`crate::mock`] using the same interface.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by device operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Device is not connected or has gone away.
    #[error("device not connected")]
    NotConnected,

    /// Hardware or driver-level failure.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Requested subframe is invalid for this sensor.
    #[error("invalid subframe: {0}")]
    InvalidSubframe(String),

    /// Frame capture failed.
    #[error("capture error: {0}")]
    Capture(String),

    /// Pulse command rejected by the relay.
    #[error("pulse error: {0}")]
    Pulse(String),
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Timestamp carried on frames and loop events.
///
/// Measured from an arbitrary session epoch; the core only ever compares
/// timestamps and computes differences, so wall-clock alignment is the
/// caller's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the session epoch
    pub seconds: u64,
    /// Nanoseconds component
    pub nanos: u32,
}

impl Timestamp {
    /// Create a timestamp from seconds and nanoseconds.
    pub fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Create a timestamp from a duration since the session epoch.
    pub fn from_duration(elapsed: Duration) -> Self {
        Self {
            seconds: elapsed.as_secs(),
            nanos: elapsed.subsec_nanos(),
        }
    }

    /// Convert back to a duration since the session epoch.
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.seconds, self.nanos)
    }

    /// Elapsed time since an earlier timestamp, zero if `earlier` is later.
    pub fn elapsed_since(&self, earlier: Timestamp) -> Duration {
        self.as_duration().saturating_sub(earlier.as_duration())
    }

    /// Timestamp advanced by `delta`.
    pub fn advanced_by(&self, delta: Duration) -> Timestamp {
        Timestamp::from_duration(self.as_duration() + delta)
    }
}

/// Mount axis addressed by a guide pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideAxis {
    /// Right ascension (east/west)
    Ra,
    /// Declination (north/south)
    Dec,
}

/// Cardinal guide direction for a timed mount correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideDirection {
    /// East: positive right ascension
    RaPlus,
    /// West: negative right ascension
    RaMinus,
    /// North: positive declination
    DecPlus,
    /// South: negative declination
    DecMinus,
}

impl GuideDirection {
    /// Axis this direction moves.
    pub fn axis(&self) -> GuideAxis {
        match self {
            GuideDirection::RaPlus | GuideDirection::RaMinus => GuideAxis::Ra,
            GuideDirection::DecPlus | GuideDirection::DecMinus => GuideAxis::Dec,
        }
    }

    /// Sign of the motion along its axis.
    pub fn sign(&self) -> f64 {
        match self {
            GuideDirection::RaPlus | GuideDirection::DecPlus => 1.0,
            GuideDirection::RaMinus | GuideDirection::DecMinus => -1.0,
        }
    }

    /// Opposite direction on the same axis.
    pub fn reversed(&self) -> GuideDirection {
        match self {
            GuideDirection::RaPlus => GuideDirection::RaMinus,
            GuideDirection::RaMinus => GuideDirection::RaPlus,
            GuideDirection::DecPlus => GuideDirection::DecMinus,
            GuideDirection::DecMinus => GuideDirection::DecPlus,
        }
    }
}

/// A timed directional correction sent to the pulse relay. Transient: built,
/// issued, and forgotten each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseCommand {
    /// Direction to assert
    pub direction: GuideDirection,
    /// Assertion duration in milliseconds
    pub duration_ms: u32,
}

impl PulseCommand {
    /// Create a new pulse command.
    pub fn new(direction: GuideDirection, duration_ms: u32) -> Self {
        Self {
            direction,
            duration_ms,
        }
    }
}

/// Rectangular readout region in full-sensor pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subframe {
    /// Left column of the region
    pub x: usize,
    /// Top row of the region
    pub y: usize,
    /// Region width in pixels
    pub width: usize,
    /// Region height in pixels
    pub height: usize,
}

impl Subframe {
    /// Square subframe of `size` pixels centered on `(cx, cy)`, clamped to
    /// the sensor bounds.
    pub fn centered(
        cx: f64,
        cy: f64,
        size: usize,
        sensor_width: usize,
        sensor_height: usize,
    ) -> Option<Subframe> {
        if size == 0 || size > sensor_width || size > sensor_height {
            return None;
        }
        let half = size as f64 / 2.0;
        let x = (cx - half).round().max(0.0) as usize;
        let y = (cy - half).round().max(0.0) as usize;
        let x = x.min(sensor_width - size);
        let y = y.min(sensor_height - size);
        Some(Subframe {
            x,
            y,
            width: size,
            height: size,
        })
    }

    /// Whether the region fits within a sensor of the given dimensions.
    pub fn fits(&self, sensor_width: usize, sensor_height: usize) -> bool {
        self.width > 0
            && self.height > 0
            && self.x + self.width <= sensor_width
            && self.y + self.height <= sensor_height
    }

    /// Extract this region from a full frame.
    pub fn extract(&self, frame: &ArrayView2<u16>) -> Array2<u16> {
        frame
            .slice(ndarray::s![
                self.y..self.y + self.height,
                self.x..self.x + self.width
            ])
            .to_owned()
    }
}

/// Metadata delivered alongside each captured frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Frame sequence number
    pub frame_number: u64,
    /// Exposure duration used for this frame
    pub exposure: Duration,
    /// Capture timestamp
    pub timestamp: Timestamp,
    /// Binning factor (1 = unbinned)
    pub binning: u32,
    /// Readout region if the frame is a subframe, `None` for full frame
    pub subframe: Option<Subframe>,
}

/// Sensor geometry reported by an imaging device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorGeometry {
    /// Sensor width in pixels
    pub width: usize,
    /// Sensor height in pixels
    pub height: usize,
}

/// Imaging device contract.
///
/// Exposure is asynchronous: `start_exposure` returns once the command is
/// accepted and the frame arrives later as a
/// [`DeviceEvent::FrameReady`](crate::state::DeviceEvent) delivered by the
/// host. Implementations must tolerate `abort_exposure` with no exposure in
/// flight.
pub trait GuideCamera: Send {
    /// Begin an exposure of the given duration.
    fn start_exposure(&mut self, exposure: Duration) -> DeviceResult<()>;

    /// Abort any in-flight exposure. Best effort; many devices cannot
    /// interrupt mid-exposure, in which case the frame is delivered and the
    /// core discards it.
    fn abort_exposure(&mut self) -> DeviceResult<()>;

    /// Restrict readout to a region, or restore full-frame readout.
    fn set_subframe(&mut self, region: Option<Subframe>) -> DeviceResult<()>;

    /// Sensor dimensions.
    fn sensor(&self) -> SensorGeometry;

    /// Whether the device is currently reachable.
    fn is_connected(&self) -> bool;
}

/// Pulse relay contract (ST4-equivalent or adaptive-optics equivalent).
///
/// `pulse` is fire-and-forget: completion arrives later as a
/// [`DeviceEvent::PulseComplete`](crate::state::DeviceEvent).
pub trait PulseRelay: Send {
    /// Assert a guide direction for the commanded duration.
    fn pulse(&mut self, command: PulseCommand) -> DeviceResult<()>;

    /// Whether RA and DEC pulses may be in flight simultaneously.
    fn independent_axes(&self) -> bool;

    /// Whether the device is currently reachable.
    fn is_connected(&self) -> bool;
}

/// Mount and optics information used to derive the pixel scale.
pub trait MountInfo: Send + Sync {
    /// Guide-scope focal length in millimeters.
    fn focal_length_mm(&self) -> f64;

    /// Aperture in millimeters.
    fn aperture_mm(&self) -> f64;

    /// Guide-camera pixel pitch in micrometers.
    fn pixel_pitch_um(&self) -> f64;
}

/// Unbinned image scale in arc-seconds per pixel.
pub fn arcsec_per_pixel(pixel_pitch_um: f64, focal_length_mm: f64) -> f64 {
    206.265 * pixel_pitch_um / focal_length_mm
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_arcsec_per_pixel() {
        // 3.8 um pixels behind 400 mm: a hair under 2"/px
        assert_relative_eq!(arcsec_per_pixel(3.8, 400.0), 1.9595, epsilon = 1e-3);
        // longer focal length shrinks the scale
        assert!(arcsec_per_pixel(3.8, 1000.0) < arcsec_per_pixel(3.8, 400.0));
    }

    #[test]
    fn test_direction_axis_and_reverse() {
        assert_eq!(GuideDirection::RaPlus.axis(), GuideAxis::Ra);
        assert_eq!(GuideDirection::DecMinus.axis(), GuideAxis::Dec);
        assert_eq!(GuideDirection::RaPlus.reversed(), GuideDirection::RaMinus);
        assert_eq!(GuideDirection::DecMinus.reversed(), GuideDirection::DecPlus);
        assert_eq!(GuideDirection::RaMinus.sign(), -1.0);
    }

    #[test]
    fn test_subframe_centered_clamps_to_sensor() {
        let sf = Subframe::centered(5.0, 5.0, 32, 256, 256).unwrap();
        assert_eq!((sf.x, sf.y), (0, 0));
        assert_eq!((sf.width, sf.height), (32, 32));

        let sf = Subframe::centered(250.0, 250.0, 32, 256, 256).unwrap();
        assert_eq!((sf.x, sf.y), (224, 224));
        assert!(sf.fits(256, 256));

        assert!(Subframe::centered(128.0, 128.0, 512, 256, 256).is_none());
    }

    #[test]
    fn test_subframe_extract() {
        let mut frame = Array2::<u16>::zeros((64, 64));
        frame[[10, 20]] = 500;
        let sf = Subframe {
            x: 16,
            y: 8,
            width: 8,
            height: 8,
        };
        let cut = sf.extract(&frame.view());
        assert_eq!(cut.dim(), (8, 8));
        assert_eq!(cut[[2, 4]], 500);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t0 = Timestamp::from_duration(Duration::from_millis(1500));
        let t1 = t0.advanced_by(Duration::from_millis(750));
        assert_eq!(t1.elapsed_since(t0), Duration::from_millis(750));
        assert_eq!(t0.elapsed_since(t1), Duration::ZERO);
        assert!(t1 > t0);
    }
}
