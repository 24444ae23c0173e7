//! Run configuration.
//!
//! [`GuideParameters`] is snapshotted by the backend when a run starts;
//! setter calls on the session during a run only affect the next run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GuideError, GuideResult};

/// Discrete tracking-box sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoxSize {
    Px8,
    Px16,
    Px32,
    Px64,
    Px128,
}

impl BoxSize {
    /// Side length in pixels.
    pub fn pixels(self) -> usize {
        match self {
            BoxSize::Px8 => 8,
            BoxSize::Px16 => 16,
            BoxSize::Px32 => 32,
            BoxSize::Px64 => 64,
            BoxSize::Px128 => 128,
        }
    }

    /// All sizes, smallest first.
    pub fn all() -> [BoxSize; 5] {
        [
            BoxSize::Px8,
            BoxSize::Px16,
            BoxSize::Px32,
            BoxSize::Px64,
            BoxSize::Px128,
        ]
    }

    /// Size by combo-box index (0..=4), if valid.
    pub fn from_index(index: usize) -> Option<BoxSize> {
        BoxSize::all().get(index).copied()
    }

    /// Smallest box that comfortably contains a star of the measured width:
    /// four widths of margin, floor of 16 px.
    pub fn for_star_width(width_px: f64) -> BoxSize {
        let wanted = (width_px * 4.0).max(16.0);
        for size in BoxSize::all() {
            if size.pixels() as f64 >= wanted {
                return size;
            }
        }
        BoxSize::Px128
    }
}

/// Correction algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideAlgorithm {
    /// Reduced gain with a generous dead zone; calm under poor seeing
    Smart,
    /// Unit gain with a small dead zone; crisp response
    Fast,
    /// Chooses between Smart and Fast from recent deviation variance
    Auto,
    /// Always issues a proportional pulse, no dead zone
    NoThreshold,
}

/// Dithering configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DitherParameters {
    /// Whether dithering is performed at all
    pub enabled: bool,
    /// Maximum reference offset per axis, in pixels
    pub amplitude_px: f64,
    /// Guide cycles between automatic dithers
    pub every_n_cycles: u32,
    /// Cycles after a dither during which tracker failures do not count
    /// toward the abort bound
    pub settle_cycles: u32,
    /// RNG seed for offset generation
    pub seed: u64,
}

impl Default for DitherParameters {
    fn default() -> Self {
        Self {
            enabled: false,
            amplitude_px: 3.0,
            every_n_cycles: 10,
            settle_cycles: 3,
            seed: 0,
        }
    }
}

/// Configuration snapshot for a calibration or guide run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideParameters {
    /// Guide exposure duration
    pub exposure: Duration,
    /// Tracking box side length
    pub box_size: BoxSize,
    /// Correction algorithm
    pub algorithm: GuideAlgorithm,
    /// Let the tracker pick the guide star from the full frame
    pub auto_star: bool,
    /// Let the tracker pick the box size from the measured star width
    /// (only meaningful with `auto_star`)
    pub auto_box_size: bool,
    /// Read out only the tracking box region between corrections
    pub subframe: bool,
    /// Calibrate DEC in addition to RA
    pub two_axis: bool,
    /// Subtract the session master dark before centroiding
    pub dark_subtraction: bool,
    /// Centroid is computed by the imaging device driver; frames are not
    /// delivered to the core
    pub rapid_guide: bool,
    /// Invert the DEC pulse sense (overrides the calibrated sense)
    pub dec_swap: bool,
    /// Dithering configuration
    pub dither: DitherParameters,
    /// Fixed pulse duration used for each calibration step, in milliseconds
    pub calibration_pulse_ms: u32,
    /// Corrections shorter than this are not issued, in milliseconds
    pub min_pulse_ms: u32,
    /// Corrections are clamped to this duration, in milliseconds
    pub max_pulse_ms: u32,
    /// How long to wait for a frame before declaring a capture timeout
    pub capture_timeout: Duration,
    /// How long to wait for a pulse acknowledgment
    pub pulse_timeout: Duration,
    /// Consecutive tracker failures tolerated during guiding before aborting
    pub max_consecutive_failures: u32,
}

impl Default for GuideParameters {
    fn default() -> Self {
        Self {
            exposure: Duration::from_secs(1),
            box_size: BoxSize::Px16,
            algorithm: GuideAlgorithm::Smart,
            auto_star: false,
            auto_box_size: false,
            subframe: false,
            two_axis: true,
            dark_subtraction: false,
            rapid_guide: false,
            dec_swap: false,
            dither: DitherParameters::default(),
            calibration_pulse_ms: 1000,
            min_pulse_ms: 10,
            max_pulse_ms: 2000,
            capture_timeout: Duration::from_secs(30),
            pulse_timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
        }
    }
}

impl GuideParameters {
    /// Check internal consistency. Called before any device command is
    /// issued; a failure here leaves all state untouched.
    pub fn validate(&self) -> GuideResult<()> {
        if self.exposure.is_zero() {
            return Err(GuideError::ConfigurationInvalid {
                reason: "exposure duration is zero".into(),
            });
        }
        if self.min_pulse_ms > self.max_pulse_ms {
            return Err(GuideError::ConfigurationInvalid {
                reason: format!(
                    "minimum pulse {} ms exceeds maximum {} ms",
                    self.min_pulse_ms, self.max_pulse_ms
                ),
            });
        }
        if self.calibration_pulse_ms == 0 {
            return Err(GuideError::ConfigurationInvalid {
                reason: "calibration pulse duration is zero".into(),
            });
        }
        if self.dither.enabled && self.dither.amplitude_px <= 0.0 {
            return Err(GuideError::ConfigurationInvalid {
                reason: "dither amplitude must be positive".into(),
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(GuideError::ConfigurationInvalid {
                reason: "failure bound must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Check consistency against the sensor the run will use.
    pub fn validate_for_sensor(&self, width: usize, height: usize) -> GuideResult<()> {
        self.validate()?;
        let box_px = self.box_size.pixels();
        if box_px >= width || box_px >= height {
            return Err(GuideError::ConfigurationInvalid {
                reason: format!(
                    "tracking box {box_px} px does not fit a {width}x{height} frame"
                ),
            });
        }
        Ok(())
    }
}
