use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::devices::{FrameMetadata, GuideAxis, Timestamp};

/// Guiding lifecycle states.
///
/// Transitions are driven exclusively by the guide loop controller (or by an
/// external delegate translating remote status); callers observe the state
/// but only influence it through start/stop/suspend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuideState {
    /// No run active, no calibration held
    #[default]
    Idle,
    /// Calibration pulses in progress
    Calibrating,
    /// Calibration data held, ready to guide
    Calibrated,
    /// Closed-loop correction cycle running
    Guiding,
    /// Reference offset applied, re-settling on the new lock position
    Dithering,
    /// Cycle paused; calibration and lock position retained
    Suspended,
    /// Run ended on failure; requires explicit restart
    Aborted,
}

impl GuideState {
    /// Whether a run (calibration or guiding) is currently active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            GuideState::Calibrating
                | GuideState::Guiding
                | GuideState::Dithering
                | GuideState::Suspended
        )
    }
}

/// Externally delivered device notifications driving the cooperative loop.
///
/// The core never blocks on devices; the host delivers these as they occur
/// plus periodic `Tick`s for timeout bookkeeping.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A requested exposure completed and its frame is available.
    FrameReady {
        /// Captured image data
        frame: Array2<u16>,
        /// Capture metadata
        metadata: FrameMetadata,
    },
    /// A requested exposure failed.
    CaptureFailed {
        /// Device-reported reason
        reason: String,
    },
    /// The pulse relay finished asserting a direction on this axis.
    PulseComplete {
        /// Axis whose pulse completed
        axis: GuideAxis,
    },
    /// The pulse relay reported a failure on this axis.
    PulseFailed {
        /// Axis whose pulse failed
        axis: GuideAxis,
        /// Device-reported reason
        reason: String,
    },
    /// Star centroid computed by the imaging device itself (rapid guide).
    RapidStarUpdate {
        /// Star x position in frame pixels
        x: f64,
        /// Star y position in frame pixels
        y: f64,
        /// Device-reported fit quality
        quality: f64,
    },
    /// Timer tick for timeout checks.
    Tick {
        /// Current session time
        now: Timestamp,
    },
}
