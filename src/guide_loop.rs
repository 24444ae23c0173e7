//! Guide loop controller.
//!
//! A cooperative state machine driving the capture → measure → correct
//! cycle. It consumes externally delivered [`DeviceEvent`]s (frames, pulse
//! acknowledgments, timer ticks) and returns the outward [`GuideEvent`]s to
//! publish plus the [`DeviceCommand`]s the embedding backend must apply. The
//! controller itself never blocks and never touches a device, so a complete
//! run can be driven synchronously in tests.
//!
//! Concurrency contract: at most one capture cycle and one outstanding pulse
//! set is in flight; a new capture is refused while the previous cycle's
//! correction has not been applied. Stop and abort take effect at the next
//! cycle boundary; a frame from an exposure that outlived its run is
//! discarded on arrival.

use ndarray::ArrayView2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

use crate::calibration::{CalAction, CalibrationData, Calibrator};
use crate::config::{BoxSize, GuideParameters};
use crate::correction::{compute_correction, CorrectionState};
use crate::dark::MasterDark;
use crate::devices::{
    FrameMetadata, GuideAxis, PulseCommand, SensorGeometry, Subframe, Timestamp,
};
use crate::error::{GuideError, GuideResult};
use crate::events::{DeviationSample, GuideEvent};
use crate::state::{DeviceEvent, GuideState};
use crate::tracker::{StarPosition, StarTracker, TrackerConfig};

/// Device operations requested by the controller. The embedding backend
/// applies them; failures come back as [`DeviceEvent`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Begin an exposure, optionally restricted to a readout region.
    StartExposure {
        /// Exposure duration
        exposure: Duration,
        /// Readout region, `None` for full frame
        subframe: Option<Subframe>,
    },
    /// Abort an exposure that timed out.
    AbortExposure,
    /// Issue a guide pulse.
    Pulse(PulseCommand),
}

/// Events to publish and commands to apply after processing one input.
#[derive(Debug, Default)]
pub struct LoopOutput {
    /// Outward events, in emission order
    pub events: Vec<GuideEvent>,
    /// Device commands to apply, in order
    pub commands: Vec<DeviceCommand>,
}

/// Capture/pulse cycle phase. Enforces the one-cycle-in-flight rule.
#[derive(Debug, Clone, PartialEq)]
enum CyclePhase {
    /// Nothing outstanding
    Idle,
    /// Waiting for a frame
    Exposing { deadline: Timestamp },
    /// Waiting for pulse acknowledgments
    Pulsing {
        deadline: Timestamp,
        awaiting: Vec<GuideAxis>,
        /// DEC pulse held back until the RA ack when the relay cannot drive
        /// both axes at once
        queued: Option<PulseCommand>,
    },
}

/// The guide loop controller.
pub struct GuideLoop {
    state: GuideState,
    params: GuideParameters,
    tracker: StarTracker,
    calibrator: Option<Calibrator>,
    calibration: Option<CalibrationData>,
    correction_state: CorrectionState,
    /// Locked reference position in full-frame coordinates
    reference: Option<(f64, f64)>,
    /// Operator-designated star position for the next run
    manual_star: Option<(f64, f64)>,
    last_star: Option<StarPosition>,
    last_deviation: Option<DeviationSample>,
    sensor: SensorGeometry,
    /// Unbinned image scale
    arcsec_per_px: f64,
    /// Binning reported by the most recent frame
    binning: u32,
    relay_independent_axes: bool,
    cycle: CyclePhase,
    consecutive_failures: u32,
    cycles_since_dither: u32,
    settle_remaining: u32,
    pending_dither: bool,
    guide_after_calibration: bool,
    rng: ChaCha8Rng,
    now: Timestamp,
}

impl GuideLoop {
    /// Create a controller for one run configuration.
    pub fn new(
        params: GuideParameters,
        sensor: SensorGeometry,
        arcsec_per_px: f64,
        relay_independent_axes: bool,
    ) -> GuideResult<Self> {
        params.validate_for_sensor(sensor.width, sensor.height)?;
        let rng = ChaCha8Rng::seed_from_u64(params.dither.seed);
        Ok(Self {
            state: GuideState::Idle,
            tracker: StarTracker::new(TrackerConfig::default()),
            params,
            calibrator: None,
            calibration: None,
            correction_state: CorrectionState::new(),
            reference: None,
            manual_star: None,
            last_star: None,
            last_deviation: None,
            sensor,
            arcsec_per_px,
            binning: 1,
            relay_independent_axes,
            cycle: CyclePhase::Idle,
            consecutive_failures: 0,
            cycles_since_dither: 0,
            settle_remaining: 0,
            pending_dither: false,
            guide_after_calibration: false,
            rng,
            now: Timestamp::new(0, 0),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GuideState {
        self.state
    }

    /// Calibration data from the last completed calibration, if any.
    pub fn calibration(&self) -> Option<&CalibrationData> {
        self.calibration.as_ref()
    }

    /// Most recent deviation measurement.
    pub fn last_deviation(&self) -> Option<DeviationSample> {
        self.last_deviation
    }

    /// Most recent star measurement.
    pub fn last_star(&self) -> Option<StarPosition> {
        self.last_star
    }

    /// Locked reference position, if a run has locked one.
    pub fn reference(&self) -> Option<(f64, f64)> {
        self.reference
    }

    /// Install or clear the master dark used when subtraction is enabled.
    pub fn set_dark(&mut self, dark: Option<MasterDark>) {
        self.tracker.set_dark(dark);
    }

    /// Designate the guide star for the next run.
    pub fn set_manual_star(&mut self, position: Option<(f64, f64)>) {
        self.manual_star = position;
    }

    /// Replace the run configuration. Refused while a run is active, so a
    /// setter call mid-run only takes effect on the next run. Calibration
    /// data survives the swap.
    pub fn set_params(&mut self, params: GuideParameters) -> GuideResult<()> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        params.validate_for_sensor(self.sensor.width, self.sensor.height)?;
        self.rng = ChaCha8Rng::seed_from_u64(params.dither.seed);
        self.params = params;
        Ok(())
    }

    /// Start a calibration run. With `then_guide` the controller proceeds
    /// straight into guiding once calibration completes.
    pub fn start_calibration(&mut self, then_guide: bool) -> GuideResult<LoopOutput> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        self.params.validate_for_sensor(self.sensor.width, self.sensor.height)?;

        self.calibration = None;
        self.calibrator = None;
        self.reference = None;
        self.consecutive_failures = 0;
        self.guide_after_calibration = then_guide;

        let mut output = LoopOutput::default();
        self.transition(GuideState::Calibrating, &mut output);
        output
            .events
            .push(GuideEvent::Log("calibration run started".into()));
        self.begin_exposure(&mut output);
        Ok(output)
    }

    /// Stop a calibration in progress. Any partial measurements are
    /// discarded; an in-flight exposure completes and is ignored.
    pub fn stop_calibration(&mut self) -> GuideResult<LoopOutput> {
        if self.state != GuideState::Calibrating {
            return Ok(LoopOutput::default());
        }
        self.calibrator = None;
        self.cycle = CyclePhase::Idle;
        let mut output = LoopOutput::default();
        self.transition(GuideState::Idle, &mut output);
        output
            .events
            .push(GuideEvent::Log("calibration stopped".into()));
        Ok(output)
    }

    /// Start a guiding run. Requires a completed calibration and either an
    /// operator-designated star or automatic selection enabled.
    pub fn start_guiding(&mut self) -> GuideResult<LoopOutput> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        let usable = self.calibration.map_or(false, |c| c.is_usable());
        if !usable {
            return Err(GuideError::NotCalibrated);
        }
        self.params.validate_for_sensor(self.sensor.width, self.sensor.height)?;

        self.reference = self
            .manual_star
            .or(self.last_star.map(|star| (star.x, star.y)));
        if self.reference.is_none() && !self.params.auto_star {
            return Err(GuideError::ConfigurationInvalid {
                reason: "no guide star designated and auto-selection disabled".into(),
            });
        }

        self.consecutive_failures = 0;
        self.cycles_since_dither = 0;
        self.settle_remaining = 0;
        self.pending_dither = false;
        self.correction_state.reset();

        let mut output = LoopOutput::default();
        self.transition(GuideState::Guiding, &mut output);
        if let Some((x, y)) = self.reference {
            output.events.push(GuideEvent::Log(format!(
                "guiding started, reference locked at ({x:.2}, {y:.2})"
            )));
        } else {
            output.events.push(GuideEvent::Log(
                "guiding started, selecting guide star from first frame".into(),
            ));
        }
        self.begin_exposure(&mut output);
        Ok(output)
    }

    /// Stop guiding at the next cycle boundary. Calibration data and the
    /// lock position survive for the next run.
    pub fn stop_guiding(&mut self) -> GuideResult<LoopOutput> {
        if !matches!(
            self.state,
            GuideState::Guiding | GuideState::Dithering | GuideState::Suspended
        ) {
            return Ok(LoopOutput::default());
        }
        self.cycle = CyclePhase::Idle;
        let target = if self.calibration.is_some() {
            GuideState::Calibrated
        } else {
            GuideState::Idle
        };
        let mut output = LoopOutput::default();
        self.transition(target, &mut output);
        output.events.push(GuideEvent::Log("guiding stopped".into()));
        Ok(output)
    }

    /// Pause the cycle without discarding calibration or the lock position.
    pub fn suspend(&mut self) -> GuideResult<LoopOutput> {
        if !matches!(self.state, GuideState::Guiding | GuideState::Dithering) {
            return Ok(LoopOutput::default());
        }
        // An in-flight exposure completes on its own; the frame is discarded
        // because the cycle is no longer waiting for it.
        self.cycle = CyclePhase::Idle;
        let mut output = LoopOutput::default();
        self.transition(GuideState::Suspended, &mut output);
        Ok(output)
    }

    /// Resume a suspended run from the next scheduled exposure.
    pub fn resume(&mut self) -> GuideResult<LoopOutput> {
        if self.state != GuideState::Suspended {
            return Ok(LoopOutput::default());
        }
        let mut output = LoopOutput::default();
        self.transition(GuideState::Guiding, &mut output);
        self.begin_exposure(&mut output);
        Ok(output)
    }

    /// Request a dither at the next completed cycle.
    pub fn dither_now(&mut self) -> GuideResult<LoopOutput> {
        if !matches!(self.state, GuideState::Guiding) {
            return Ok(LoopOutput::default());
        }
        self.pending_dither = true;
        Ok(LoopOutput::default())
    }

    /// Process an externally delivered device event.
    pub fn process_device_event(&mut self, event: DeviceEvent) -> GuideResult<LoopOutput> {
        match event {
            DeviceEvent::FrameReady { frame, metadata } => {
                self.handle_frame(frame.view(), &metadata)
            }
            DeviceEvent::CaptureFailed { reason } => self.handle_capture_failed(reason),
            DeviceEvent::PulseComplete { axis } => self.handle_pulse_complete(axis),
            DeviceEvent::PulseFailed { axis, reason } => self.handle_pulse_failed(axis, reason),
            DeviceEvent::RapidStarUpdate { x, y, quality } => {
                self.handle_rapid_update(x, y, quality)
            }
            DeviceEvent::Tick { now } => self.handle_tick(now),
        }
    }

    fn handle_frame(
        &mut self,
        frame: ArrayView2<'_, u16>,
        metadata: &FrameMetadata,
    ) -> GuideResult<LoopOutput> {
        self.now = metadata.timestamp;
        let mut output = LoopOutput::default();

        if !matches!(self.cycle, CyclePhase::Exposing { .. }) {
            log::debug!("discarding frame {}: no exposure outstanding", metadata.frame_number);
            return Ok(output);
        }
        self.cycle = CyclePhase::Idle;
        self.binning = metadata.binning.max(1);

        match self.state {
            GuideState::Calibrating => self.handle_calibration_frame(frame, metadata, &mut output),
            GuideState::Guiding | GuideState::Dithering => {
                self.handle_guide_frame(frame, metadata, &mut output)
            }
            _ => {
                log::debug!("discarding frame delivered in state {:?}", self.state);
            }
        }
        Ok(output)
    }

    fn handle_calibration_frame(
        &mut self,
        frame: ArrayView2<'_, u16>,
        metadata: &FrameMetadata,
        output: &mut LoopOutput,
    ) {
        let use_dark = self.use_dark(metadata);

        if self.calibrator.is_none() {
            // First frame: acquire the star the run will calibrate against.
            let acquired = if self.params.auto_star {
                self.tracker.select_auto(&frame, use_dark)
            } else if let Some(center) = self.manual_star {
                self.tracker.track_in_box(
                    &frame,
                    center,
                    self.params.box_size.pixels(),
                    use_dark,
                    (0, 0),
                )
            } else {
                Err(crate::tracker::TrackError::NoStarFound)
            };

            let star = match acquired {
                Ok(star) => star,
                Err(err) => {
                    // No star before any pulse was issued: the run never
                    // really began, so fall back to Idle rather than Aborted.
                    log::warn!("calibration could not acquire a star: {err}");
                    self.calibrator = None;
                    self.cycle = CyclePhase::Idle;
                    output.events.push(GuideEvent::RunFailed {
                        reason: GuideError::StarLost.to_string(),
                    });
                    self.transition(GuideState::Idle, output);
                    return;
                }
            };

            if self.params.auto_star && self.params.auto_box_size {
                let chosen = BoxSize::for_star_width(star.width);
                log::info!(
                    "auto box size: star width {:.1} px selects {} px box",
                    star.width,
                    chosen.pixels()
                );
                self.params.box_size = chosen;
            }

            self.last_star = Some(star);
            output.events.push(GuideEvent::StarUpdate(star));

            let (calibrator, pulse) = Calibrator::begin(&self.params, &star);
            self.calibrator = Some(calibrator);
            self.issue_pulses(vec![pulse], output);
            return;
        }

        // Measure the response to the previous pulse. Calibration steps can
        // move the star farther than a small guide box, so search at least a
        // 32 px window.
        let previous = self
            .last_star
            .map(|star| (star.x, star.y))
            .unwrap_or((0.0, 0.0));
        let search = self.params.box_size.pixels().max(32);
        let measured = self
            .tracker
            .track_in_box(&frame, previous, search, use_dark, (0, 0));

        let star = match measured {
            Ok(star) => star,
            Err(err) => {
                log::warn!("star lost during calibration: {err}");
                self.abort_run(GuideError::StarLost.to_string(), output);
                return;
            }
        };
        self.last_star = Some(star);
        output.events.push(GuideEvent::StarUpdate(star));

        let action = self
            .calibrator
            .as_mut()
            .expect("calibrator exists on the measurement path")
            .advance(&star);
        match action {
            CalAction::Pulse(pulse) => self.issue_pulses(vec![pulse], output),
            CalAction::Complete(data) => {
                self.calibrator = None;
                self.calibration = Some(data);
                output.events.push(GuideEvent::CalibrationComplete(data));
                output
                    .events
                    .push(GuideEvent::Log("calibration complete".into()));
                self.transition(GuideState::Calibrated, output);

                if self.guide_after_calibration {
                    self.guide_after_calibration = false;
                    match self.start_guiding() {
                        Ok(follow_on) => {
                            output.events.extend(follow_on.events);
                            output.commands.extend(follow_on.commands);
                        }
                        Err(err) => {
                            output.events.push(GuideEvent::RunFailed {
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
            CalAction::Failed { reason } => {
                let error = GuideError::CalibrationFailed { reason };
                self.abort_run(error.to_string(), output);
            }
        }
    }

    fn handle_guide_frame(
        &mut self,
        frame: ArrayView2<'_, u16>,
        metadata: &FrameMetadata,
        output: &mut LoopOutput,
    ) {
        let use_dark = self.use_dark(metadata);
        let origin = metadata
            .subframe
            .map(|sf| (sf.x, sf.y))
            .unwrap_or((0, 0));

        if self.reference.is_none() {
            // Lock the reference from this first frame.
            let acquired = if self.params.auto_star {
                self.tracker.select_auto(&frame, use_dark)
            } else {
                // start_guiding guarantees a manual star exists here
                let center = self.manual_star.unwrap_or((0.0, 0.0));
                self.tracker.track_in_box(
                    &frame,
                    center,
                    self.params.box_size.pixels(),
                    use_dark,
                    origin,
                )
            };
            match acquired {
                Ok(star) => {
                    let full = (star.x + origin.0 as f64, star.y + origin.1 as f64);
                    self.reference = Some(full);
                    self.last_star = Some(StarPosition {
                        x: full.0,
                        y: full.1,
                        ..star
                    });
                    output.events.push(GuideEvent::StarUpdate(
                        self.last_star.expect("just set"),
                    ));
                    output.events.push(GuideEvent::Log(format!(
                        "guide star locked at ({:.2}, {:.2})",
                        full.0, full.1
                    )));
                    self.begin_exposure(output);
                }
                Err(err) => {
                    log::warn!("could not lock guide star: {err}");
                    self.handle_transient_failure(output);
                }
            }
            return;
        }

        let reference = self.reference.expect("checked above");
        let expected = (
            reference.0 - origin.0 as f64,
            reference.1 - origin.1 as f64,
        );
        let measured = self.tracker.track_in_box(
            &frame,
            expected,
            self.params.box_size.pixels(),
            use_dark,
            origin,
        );

        match measured {
            Ok(local) => {
                let star = StarPosition {
                    x: local.x + origin.0 as f64,
                    y: local.y + origin.1 as f64,
                    ..local
                };
                self.process_guide_measurement(star, metadata.timestamp, output);
            }
            Err(err) => {
                log::warn!("tracker failure during guiding: {err}");
                self.handle_transient_failure(output);
            }
        }
    }

    /// Shared measurement path for frame-based and rapid-guide tracking.
    fn process_guide_measurement(
        &mut self,
        star: StarPosition,
        timestamp: Timestamp,
        output: &mut LoopOutput,
    ) {
        self.consecutive_failures = 0;
        self.last_star = Some(star);
        output.events.push(GuideEvent::StarUpdate(star));

        // Dither before computing the correction so the very next pulse
        // already steers toward the displaced reference.
        if self.state == GuideState::Guiding && self.params.dither.enabled {
            self.cycles_since_dither += 1;
            if self.pending_dither || self.cycles_since_dither >= self.params.dither.every_n_cycles
            {
                self.apply_dither(output);
            }
        }

        let reference = self.reference.expect("reference locked during guiding");
        let deviation_px = (star.x - reference.0, star.y - reference.1);
        let calibration = self
            .calibration
            .expect("guiding requires completed calibration");
        let scale = self.arcsec_per_px * self.binning as f64;

        let (ra_px, dec_px) = calibration.frame_to_mount(deviation_px.0, deviation_px.1);
        let sample = DeviationSample {
            ra_arcsec: ra_px * scale,
            dec_arcsec: dec_px * scale,
            timestamp,
        };
        self.last_deviation = Some(sample);
        output.events.push(GuideEvent::Deviation(sample));

        let pulses = compute_correction(
            deviation_px,
            &calibration,
            &self.params,
            scale,
            &self.correction_state,
        );
        self.correction_state.record(&sample);

        // Settle bookkeeping after a dither
        if self.state == GuideState::Dithering {
            self.settle_remaining = self.settle_remaining.saturating_sub(1);
            if self.settle_remaining == 0 {
                self.cycles_since_dither = 0;
                self.transition(GuideState::Guiding, output);
            }
        }

        let mut commands = Vec::new();
        if let Some(ra) = pulses.ra {
            commands.push(ra);
        }
        if let Some(dec) = pulses.dec {
            commands.push(dec);
        }
        if commands.is_empty() {
            self.begin_exposure(output);
        } else {
            self.issue_pulses(commands, output);
        }
    }

    fn apply_dither(&mut self, output: &mut LoopOutput) {
        let amplitude = self.params.dither.amplitude_px;
        // Random direction with magnitude in [amplitude/2, amplitude]:
        // bounded above by the configured amplitude, bounded below so the
        // displacement always provokes a corrective pulse.
        let magnitude = self.rng.gen_range(amplitude / 2.0..=amplitude);
        let angle = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let dx = magnitude * angle.cos();
        let dy = magnitude * angle.sin();

        if let Some(reference) = self.reference.as_mut() {
            reference.0 += dx;
            reference.1 += dy;
        }
        self.pending_dither = false;
        self.cycles_since_dither = 0;
        self.settle_remaining = self.params.dither.settle_cycles.max(1);
        self.correction_state.reset();

        log::info!("dither applied: reference shifted by ({dx:.2}, {dy:.2}) px");
        output.events.push(GuideEvent::DitherApplied { dx, dy });
        self.transition(GuideState::Dithering, output);
    }

    fn handle_capture_failed(&mut self, reason: String) -> GuideResult<LoopOutput> {
        let mut output = LoopOutput::default();
        if !matches!(self.cycle, CyclePhase::Exposing { .. }) {
            return Ok(output);
        }
        self.cycle = CyclePhase::Idle;
        match self.state {
            GuideState::Calibrating => {
                self.abort_run(format!("capture failed during calibration: {reason}"), &mut output);
            }
            GuideState::Guiding | GuideState::Dithering => {
                log::warn!("capture failed during guiding: {reason}");
                self.handle_transient_failure(&mut output);
            }
            _ => {}
        }
        Ok(output)
    }

    fn handle_pulse_complete(&mut self, axis: GuideAxis) -> GuideResult<LoopOutput> {
        let mut output = LoopOutput::default();
        let CyclePhase::Pulsing {
            deadline,
            mut awaiting,
            mut queued,
        } = self.cycle.clone()
        else {
            return Ok(output);
        };

        awaiting.retain(|&waiting| waiting != axis);

        if awaiting.is_empty() {
            if let Some(pulse) = queued.take() {
                // Sequenced DEC pulse for relays without independent axes
                awaiting.push(pulse.direction.axis());
                let deadline = self
                    .now
                    .advanced_by(Duration::from_millis(pulse.duration_ms as u64))
                    .advanced_by(self.params.pulse_timeout);
                output.events.push(GuideEvent::PulseIssued(pulse));
                output.commands.push(DeviceCommand::Pulse(pulse));
                self.cycle = CyclePhase::Pulsing {
                    deadline,
                    awaiting,
                    queued: None,
                };
                return Ok(output);
            }

            self.cycle = CyclePhase::Idle;
            match self.state {
                GuideState::Calibrating | GuideState::Guiding | GuideState::Dithering => {
                    self.begin_exposure(&mut output);
                }
                _ => {}
            }
        } else {
            self.cycle = CyclePhase::Pulsing {
                deadline,
                awaiting,
                queued,
            };
        }
        Ok(output)
    }

    fn handle_pulse_failed(&mut self, axis: GuideAxis, reason: String) -> GuideResult<LoopOutput> {
        let mut output = LoopOutput::default();
        if !matches!(self.cycle, CyclePhase::Pulsing { .. }) {
            return Ok(output);
        }
        self.cycle = CyclePhase::Idle;
        match self.state {
            GuideState::Calibrating => {
                self.abort_run(
                    format!("pulse failed on {axis:?} during calibration: {reason}"),
                    &mut output,
                );
            }
            GuideState::Guiding | GuideState::Dithering => {
                log::warn!("pulse failed on {axis:?} during guiding: {reason}");
                self.handle_transient_failure(&mut output);
            }
            _ => {}
        }
        Ok(output)
    }

    fn handle_rapid_update(&mut self, x: f64, y: f64, quality: f64) -> GuideResult<LoopOutput> {
        let mut output = LoopOutput::default();
        if !self.params.rapid_guide
            || !matches!(self.state, GuideState::Guiding | GuideState::Dithering)
            || !matches!(self.cycle, CyclePhase::Exposing { .. })
        {
            return Ok(output);
        }
        self.cycle = CyclePhase::Idle;

        if quality <= 0.0 {
            log::warn!("rapid guide reported a failed fit");
            self.handle_transient_failure(&mut output);
            return Ok(output);
        }

        let star = StarPosition {
            x,
            y,
            flux: quality,
            snr: quality,
            width: 2.0,
        };
        if self.reference.is_none() {
            self.reference = Some((x, y));
            self.last_star = Some(star);
            output.events.push(GuideEvent::StarUpdate(star));
            output.events.push(GuideEvent::Log(format!(
                "guide star locked at ({x:.2}, {y:.2})"
            )));
            self.begin_exposure(&mut output);
            return Ok(output);
        }
        self.process_guide_measurement(star, self.now, &mut output);
        Ok(output)
    }

    fn handle_tick(&mut self, now: Timestamp) -> GuideResult<LoopOutput> {
        self.now = now;
        let mut output = LoopOutput::default();

        match self.cycle.clone() {
            CyclePhase::Exposing { deadline } if now > deadline => {
                self.cycle = CyclePhase::Idle;
                output.commands.push(DeviceCommand::AbortExposure);
                let error = GuideError::CaptureTimeout {
                    after: self.params.capture_timeout,
                };
                match self.state {
                    GuideState::Calibrating => {
                        self.abort_run(error.to_string(), &mut output);
                    }
                    GuideState::Guiding | GuideState::Dithering => {
                        log::warn!("{error}");
                        self.handle_transient_failure(&mut output);
                    }
                    _ => {}
                }
            }
            CyclePhase::Pulsing { deadline, awaiting, .. } if now > deadline => {
                self.cycle = CyclePhase::Idle;
                let axis = awaiting.first().copied().unwrap_or(GuideAxis::Ra);
                let error = GuideError::PulseTimeout { axis };
                match self.state {
                    GuideState::Calibrating => {
                        self.abort_run(error.to_string(), &mut output);
                    }
                    GuideState::Guiding | GuideState::Dithering => {
                        log::warn!("{error}");
                        self.handle_transient_failure(&mut output);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(output)
    }

    /// Bounded-retry policy for transient failures during guiding: count the
    /// miss, abort past the bound, otherwise retry with a fresh capture.
    /// Failures inside a dither settle window are not counted.
    fn handle_transient_failure(&mut self, output: &mut LoopOutput) {
        if self.state == GuideState::Dithering && self.settle_remaining > 0 {
            log::debug!("failure inside dither settle window, not counted");
            self.settle_remaining = self.settle_remaining.saturating_sub(1);
            if self.settle_remaining == 0 {
                self.cycles_since_dither = 0;
                self.transition(GuideState::Guiding, output);
            }
            self.begin_exposure(output);
            return;
        }

        self.consecutive_failures += 1;
        output.events.push(GuideEvent::Log(format!(
            "cycle failed ({} of {} tolerated)",
            self.consecutive_failures, self.params.max_consecutive_failures
        )));
        if self.consecutive_failures > self.params.max_consecutive_failures {
            self.abort_run(GuideError::StarLost.to_string(), output);
        } else {
            self.begin_exposure(output);
        }
    }

    fn abort_run(&mut self, reason: String, output: &mut LoopOutput) {
        log::warn!("run aborted: {reason}");
        self.calibrator = None;
        self.cycle = CyclePhase::Idle;
        self.guide_after_calibration = false;
        output.events.push(GuideEvent::RunFailed { reason });
        self.transition(GuideState::Aborted, output);
    }

    fn transition(&mut self, to: GuideState, output: &mut LoopOutput) {
        if self.state == to {
            return;
        }
        log::info!("guide state {:?} -> {to:?}", self.state);
        output.events.push(GuideEvent::StateChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    /// Request the next exposure. Refuses to double-book the cycle.
    fn begin_exposure(&mut self, output: &mut LoopOutput) {
        if self.cycle != CyclePhase::Idle {
            log::debug!("exposure request refused: cycle already in flight");
            return;
        }
        let subframe = if self.params.subframe
            && matches!(self.state, GuideState::Guiding | GuideState::Dithering)
        {
            self.reference.and_then(|(x, y)| {
                Subframe::centered(
                    x,
                    y,
                    self.params.box_size.pixels() * 2,
                    self.sensor.width,
                    self.sensor.height,
                )
            })
        } else {
            None
        };
        let deadline = self
            .now
            .advanced_by(self.params.exposure)
            .advanced_by(self.params.capture_timeout);
        self.cycle = CyclePhase::Exposing { deadline };
        output.commands.push(DeviceCommand::StartExposure {
            exposure: self.params.exposure,
            subframe,
        });
    }

    /// Issue one or two pulses, sequencing DEC behind RA when the relay
    /// cannot drive both axes at once.
    fn issue_pulses(&mut self, pulses: Vec<PulseCommand>, output: &mut LoopOutput) {
        debug_assert!(!pulses.is_empty() && pulses.len() <= 2);

        let mut awaiting = Vec::new();
        let mut queued = None;
        let mut longest_ms = 0u32;

        if self.relay_independent_axes || pulses.len() == 1 {
            for pulse in &pulses {
                awaiting.push(pulse.direction.axis());
                longest_ms = longest_ms.max(pulse.duration_ms);
                output.events.push(GuideEvent::PulseIssued(*pulse));
                output.commands.push(DeviceCommand::Pulse(*pulse));
            }
        } else {
            let first = pulses[0];
            awaiting.push(first.direction.axis());
            longest_ms = first.duration_ms;
            output.events.push(GuideEvent::PulseIssued(first));
            output.commands.push(DeviceCommand::Pulse(first));
            queued = Some(pulses[1]);
        }

        let deadline = self
            .now
            .advanced_by(Duration::from_millis(longest_ms as u64))
            .advanced_by(self.params.pulse_timeout);
        self.cycle = CyclePhase::Pulsing {
            deadline,
            awaiting,
            queued,
        };
    }

    fn use_dark(&self, metadata: &FrameMetadata) -> bool {
        if !self.params.dark_subtraction {
            return false;
        }
        match self.tracker.dark() {
            Some(dark) if dark.matches_exposure(metadata.exposure) => true,
            Some(_) => {
                log::warn!("master dark exposure does not match, skipping subtraction");
                false
            }
            None => false,
        }
    }
}
