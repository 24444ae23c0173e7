use std::time::Duration;
use thiserror::Error;

use crate::devices::{DeviceError, GuideAxis};

/// Errors produced by the guiding subsystem.
#[derive(Error, Debug)]
pub enum GuideError {
    /// No imaging or pulse-relay device selected, or the device went away.
    /// The operation is refused with no state change.
    #[error("no {role} device available")]
    DeviceUnavailable {
        /// Which device role is missing ("camera", "pulse relay", "mount info").
        role: &'static str,
    },

    /// Tracker could not find or reacquire the guide star.
    #[error("guide star lost")]
    StarLost,

    /// Guiding was requested without a completed calibration.
    #[error("mount is not calibrated")]
    NotCalibrated,

    /// Calibration observed insufficient mount response and must be
    /// explicitly restarted.
    #[error("calibration failed: {reason}")]
    CalibrationFailed {
        /// What the calibration engine observed.
        reason: String,
    },

    /// A pulse command was not acknowledged within the configured timeout.
    #[error("pulse on {axis:?} axis timed out")]
    PulseTimeout {
        /// Axis whose pulse went unacknowledged.
        axis: GuideAxis,
    },

    /// An exposure did not complete within the configured timeout.
    #[error("capture timed out after {after:?}")]
    CaptureTimeout {
        /// How long the core waited.
        after: Duration,
    },

    /// Parameter set is internally inconsistent; rejected before any device
    /// command is issued.
    #[error("invalid configuration: {reason}")]
    ConfigurationInvalid {
        /// Which constraint was violated.
        reason: String,
    },

    /// Operation requires an idle backend (e.g. switching guider variants or
    /// replacing devices while a run is active).
    #[error("operation not permitted while a run is active")]
    BackendBusy,

    /// External guider control channel is closed.
    #[error("external guider channel closed")]
    ChannelClosed,

    /// Underlying device failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result type for guiding operations.
pub type GuideResult<T> = Result<T, GuideError>;
