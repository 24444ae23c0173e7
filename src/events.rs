//! Outward status and log events, and the callback registry that delivers
//! them to subscribers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::calibration::CalibrationData;
use crate::devices::{PulseCommand, Timestamp};
use crate::state::GuideState;
use crate::tracker::StarPosition;

/// Measured drift of the guide star from its locked reference position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviationSample {
    /// RA-axis deviation in arc-seconds
    pub ra_arcsec: f64,
    /// DEC-axis deviation in arc-seconds
    pub dec_arcsec: f64,
    /// Measurement timestamp
    pub timestamp: Timestamp,
}

impl DeviationSample {
    /// Total deviation magnitude in arc-seconds.
    pub fn magnitude(&self) -> f64 {
        (self.ra_arcsec * self.ra_arcsec + self.dec_arcsec * self.dec_arcsec).sqrt()
    }
}

/// Events emitted by a backend and republished by the session facade.
#[derive(Debug, Clone)]
pub enum GuideEvent {
    /// Lifecycle state changed.
    StateChanged {
        /// Previous state
        from: GuideState,
        /// New state
        to: GuideState,
    },
    /// Human-readable log line.
    Log(String),
    /// New deviation measurement for this cycle.
    Deviation(DeviationSample),
    /// Updated guide star position.
    StarUpdate(StarPosition),
    /// A corrective pulse was issued.
    PulseIssued(PulseCommand),
    /// Calibration finished and produced usable data.
    CalibrationComplete(CalibrationData),
    /// The dither offset applied to the reference position.
    DitherApplied {
        /// Reference shift along x in pixels
        dx: f64,
        /// Reference shift along y in pixels
        dy: f64,
    },
    /// The run ended on a failure.
    RunFailed {
        /// Failure description
        reason: String,
    },
}

/// Subscription handle returned by [`CallbackRegistry::register`].
pub type CallbackId = u64;

/// Subscriber callback type.
pub type GuideCallback = Arc<dyn Fn(&GuideEvent) + Send + Sync>;

/// Registry of event subscribers.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Mutex<HashMap<CallbackId, GuideCallback>>,
    next_id: Mutex<CallbackId>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback and return its handle.
    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&GuideEvent) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let id = *next_id;
        *next_id += 1;
        callbacks.insert(id, Arc::new(callback));
        id
    }

    /// Remove a callback; returns whether it was registered.
    pub fn deregister(&self, id: CallbackId) -> bool {
        self.callbacks.lock().unwrap().remove(&id).is_some()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    /// Whether no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every subscriber.
    pub fn emit(&self, event: &GuideEvent) {
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.values() {
            callback(event);
        }
    }
}
