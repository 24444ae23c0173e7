//! Guider backend abstraction.
//!
//! One trait, three variants: the internal guider below, and the two
//! external-process delegates in [`crate::external`]. The session facade
//! holds exactly one active implementation and is agnostic to which; the
//! variant may only be switched while no run is active.

use std::sync::{Arc, Mutex};

use crate::devices::{GuideCamera, PulseCommand, PulseRelay};
use crate::error::{GuideError, GuideResult};
use crate::events::{DeviationSample, GuideEvent};
use crate::guide_loop::{DeviceCommand, GuideLoop, LoopOutput};
use crate::state::{DeviceEvent, GuideState};
use crate::tracker::StarPosition;

/// Which guider implementation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuiderKind {
    /// The in-process guider built from the tracker, calibrator, and loop
    Internal,
    /// Delegation to an external PHD2 process
    Phd2,
    /// Delegation to an external lin_guider process
    LinGuider,
}

/// Operation set shared by every guider variant.
pub trait GuiderBackend: Send {
    /// Which variant this is.
    fn kind(&self) -> GuiderKind;

    /// Start a calibration run; with `then_guide` the backend proceeds into
    /// guiding once calibration completes.
    fn start_calibration(&mut self, then_guide: bool) -> GuideResult<Vec<GuideEvent>>;

    /// Stop a calibration in progress.
    fn stop_calibration(&mut self) -> GuideResult<Vec<GuideEvent>>;

    /// Start a guiding run.
    fn start_guiding(&mut self) -> GuideResult<Vec<GuideEvent>>;

    /// Stop guiding at the next cycle boundary.
    fn stop_guiding(&mut self) -> GuideResult<Vec<GuideEvent>>;

    /// Pause the cycle, retaining calibration and the lock position.
    fn suspend(&mut self) -> GuideResult<Vec<GuideEvent>>;

    /// Continue a suspended run.
    fn resume(&mut self) -> GuideResult<Vec<GuideEvent>>;

    /// Trigger a dither.
    fn dither(&mut self) -> GuideResult<Vec<GuideEvent>>;

    /// Issue a manual pulse, outside the correction cycle.
    fn send_pulse(&mut self, command: PulseCommand) -> GuideResult<Vec<GuideEvent>>;

    /// Feed an externally delivered device notification.
    fn handle_device_event(&mut self, event: DeviceEvent) -> GuideResult<Vec<GuideEvent>>;

    /// Current lifecycle state.
    fn state(&self) -> GuideState;

    /// Most recent deviation measurement.
    fn current_deviation(&self) -> Option<DeviationSample>;

    /// Most recent star measurement.
    fn star_position(&self) -> Option<StarPosition>;

    /// Whether a run is active (variant switching is refused while true).
    fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Push a fresh parameter snapshot before a run starts. Variants that
    /// manage their own configuration ignore this.
    fn apply_parameters(
        &mut self,
        _params: &crate::config::GuideParameters,
    ) -> GuideResult<()> {
        Ok(())
    }

    /// Install the session master dark. Only the internal guider uses it.
    fn set_dark(&mut self, _dark: Option<crate::dark::MasterDark>) {}

    /// Designate the guide star for the next run. Only the internal guider
    /// uses it; external processes select their own star.
    fn set_manual_star(&mut self, _position: Option<(f64, f64)>) {}
}

/// Shared camera handle. The session borrows device lifetime; a device may
/// disconnect between cycles and every use re-checks liveness.
pub type SharedCamera = Arc<Mutex<dyn GuideCamera>>;

/// Shared pulse relay handle.
pub type SharedRelay = Arc<Mutex<dyn PulseRelay>>;

/// The in-process guider: wraps the guide loop controller and applies its
/// device commands to the camera and pulse relay handles.
pub struct InternalGuider {
    control: GuideLoop,
    camera: SharedCamera,
    relay: SharedRelay,
}

impl InternalGuider {
    /// Build an internal guider around the given devices.
    pub fn new(
        params: crate::config::GuideParameters,
        camera: SharedCamera,
        relay: SharedRelay,
        arcsec_per_px: f64,
    ) -> GuideResult<Self> {
        let (sensor, independent_axes) = {
            let camera_guard = camera.lock().unwrap();
            if !camera_guard.is_connected() {
                return Err(GuideError::DeviceUnavailable { role: "camera" });
            }
            let relay_guard = relay.lock().unwrap();
            if !relay_guard.is_connected() {
                return Err(GuideError::DeviceUnavailable { role: "pulse relay" });
            }
            (camera_guard.sensor(), relay_guard.independent_axes())
        };

        let control = GuideLoop::new(params, sensor, arcsec_per_px, independent_axes)?;
        Ok(Self {
            control,
            camera,
            relay,
        })
    }

    /// Refuse an operation when a required device has gone away.
    fn check_devices(&self) -> GuideResult<()> {
        if !self.camera.lock().unwrap().is_connected() {
            return Err(GuideError::DeviceUnavailable { role: "camera" });
        }
        if !self.relay.lock().unwrap().is_connected() {
            return Err(GuideError::DeviceUnavailable { role: "pulse relay" });
        }
        Ok(())
    }

    /// Apply the controller's device commands, feeding any device failure
    /// straight back into the controller so its retry/abort policy runs.
    fn apply(&mut self, output: LoopOutput) -> GuideResult<Vec<GuideEvent>> {
        let mut events = output.events;
        let mut pending = std::collections::VecDeque::from(output.commands);

        while let Some(command) = pending.pop_front() {
            let feedback = match command {
                DeviceCommand::StartExposure { exposure, subframe } => {
                    let mut camera = self.camera.lock().unwrap();
                    if !camera.is_connected() {
                        Some(DeviceEvent::CaptureFailed {
                            reason: "camera disconnected".into(),
                        })
                    } else {
                        let result = camera
                            .set_subframe(subframe)
                            .and_then(|_| camera.start_exposure(exposure));
                        match result {
                            Ok(()) => None,
                            Err(err) => Some(DeviceEvent::CaptureFailed {
                                reason: err.to_string(),
                            }),
                        }
                    }
                }
                DeviceCommand::AbortExposure => {
                    if let Err(err) = self.camera.lock().unwrap().abort_exposure() {
                        log::warn!("failed to abort exposure: {err}");
                    }
                    None
                }
                DeviceCommand::Pulse(pulse) => {
                    let mut relay = self.relay.lock().unwrap();
                    if !relay.is_connected() {
                        Some(DeviceEvent::PulseFailed {
                            axis: pulse.direction.axis(),
                            reason: "pulse relay disconnected".into(),
                        })
                    } else {
                        match relay.pulse(pulse) {
                            Ok(()) => None,
                            Err(err) => Some(DeviceEvent::PulseFailed {
                                axis: pulse.direction.axis(),
                                reason: err.to_string(),
                            }),
                        }
                    }
                }
            };

            if let Some(event) = feedback {
                let follow_on = self.control.process_device_event(event)?;
                events.extend(follow_on.events);
                pending.extend(follow_on.commands);
            }
        }
        Ok(events)
    }
}

impl GuiderBackend for InternalGuider {
    fn kind(&self) -> GuiderKind {
        GuiderKind::Internal
    }

    fn start_calibration(&mut self, then_guide: bool) -> GuideResult<Vec<GuideEvent>> {
        self.check_devices()?;
        let output = self.control.start_calibration(then_guide)?;
        self.apply(output)
    }

    fn stop_calibration(&mut self) -> GuideResult<Vec<GuideEvent>> {
        let output = self.control.stop_calibration()?;
        self.apply(output)
    }

    fn start_guiding(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.check_devices()?;
        let output = self.control.start_guiding()?;
        self.apply(output)
    }

    fn stop_guiding(&mut self) -> GuideResult<Vec<GuideEvent>> {
        let output = self.control.stop_guiding()?;
        self.apply(output)
    }

    fn suspend(&mut self) -> GuideResult<Vec<GuideEvent>> {
        let output = self.control.suspend()?;
        self.apply(output)
    }

    fn resume(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.check_devices()?;
        let output = self.control.resume()?;
        self.apply(output)
    }

    fn dither(&mut self) -> GuideResult<Vec<GuideEvent>> {
        let output = self.control.dither_now()?;
        self.apply(output)
    }

    fn send_pulse(&mut self, command: PulseCommand) -> GuideResult<Vec<GuideEvent>> {
        let mut relay = self.relay.lock().unwrap();
        if !relay.is_connected() {
            return Err(GuideError::DeviceUnavailable { role: "pulse relay" });
        }
        relay.pulse(command)?;
        Ok(vec![GuideEvent::PulseIssued(command)])
    }

    fn handle_device_event(&mut self, event: DeviceEvent) -> GuideResult<Vec<GuideEvent>> {
        let output = self.control.process_device_event(event)?;
        self.apply(output)
    }

    fn state(&self) -> GuideState {
        self.control.state()
    }

    fn current_deviation(&self) -> Option<DeviationSample> {
        self.control.last_deviation()
    }

    fn star_position(&self) -> Option<StarPosition> {
        self.control.last_star()
    }

    fn apply_parameters(
        &mut self,
        params: &crate::config::GuideParameters,
    ) -> GuideResult<()> {
        self.control.set_params(params.clone())
    }

    fn set_dark(&mut self, dark: Option<crate::dark::MasterDark>) {
        self.control.set_dark(dark);
    }

    fn set_manual_star(&mut self, position: Option<(f64, f64)>) {
        self.control.set_manual_star(position);
    }
}
