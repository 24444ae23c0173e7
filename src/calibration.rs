//! Mount calibration: measuring the pixel response to timed pulses.
//!
//! The calibrator walks +RA / -RA and optionally +DEC / -DEC, issuing
//! fixed-duration pulses and watching the star displacement after each one.
//! It is a step-driven pure state machine: the guide loop performs the
//! captures and issues the pulses, feeding each measured position back in
//! through [`Calibrator::advance`]. The engine itself never touches a
//! device, which keeps it testable against synthetic mount responses.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::config::GuideParameters;
use crate::devices::{GuideDirection, PulseCommand};
use crate::tracker::StarPosition;

/// Minimum star travel (pixels) a phase must observe before its rate is
/// trusted.
const MIN_TRAVEL_PX: f64 = 8.0;

/// Pulse budget per forward phase before declaring the mount unresponsive.
const MAX_STEPS: u32 = 10;

/// Per-axis step response derived from a calibration run.
///
/// Immutable once produced; owned by the active backend and discarded when a
/// new calibration starts or devices change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Star displacement per second of RA pulse, in pixels
    pub ra_rate_px_per_sec: f64,
    /// Star displacement per second of DEC pulse; `None` after a single-axis
    /// calibration
    pub dec_rate_px_per_sec: Option<f64>,
    /// Rotation between frame axes and mount axes, measured from the RA step
    /// response
    pub angle_rad: f64,
    /// Departure of the measured RA/DEC axis angle from perpendicular;
    /// zero after a single-axis calibration
    pub orthogonality_error_rad: f64,
    /// Whether the measured DEC response was inverted relative to the
    /// commanded sense
    pub dec_swap: bool,
}

impl CalibrationData {
    /// Rotate a frame-space displacement into mount axes (RA, DEC).
    pub fn frame_to_mount(&self, dx: f64, dy: f64) -> (f64, f64) {
        let (sin, cos) = self.angle_rad.sin_cos();
        (dx * cos + dy * sin, -dx * sin + dy * cos)
    }

    /// Whether the data can drive corrections on every calibrated axis.
    pub fn is_usable(&self) -> bool {
        self.ra_rate_px_per_sec > f64::EPSILON
            && self
                .dec_rate_px_per_sec
                .map_or(true, |rate| rate > f64::EPSILON)
    }
}

/// Calibration phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    /// Pulsing east, accumulating displacement
    RaPlus,
    /// Driving back west
    RaMinus,
    /// Pulsing north, accumulating displacement
    DecPlus,
    /// Driving back south
    DecMinus,
}

/// Next action requested by the calibrator.
#[derive(Debug, Clone, PartialEq)]
pub enum CalAction {
    /// Issue this pulse, then capture and feed the new position back in.
    Pulse(PulseCommand),
    /// Calibration finished; data is ready.
    Complete(CalibrationData),
    /// Insufficient mount response within the step budget.
    Failed {
        /// What was observed
        reason: String,
    },
}

/// Step-driven calibration engine.
#[derive(Debug)]
pub struct Calibrator {
    pulse_ms: u32,
    two_axis: bool,
    phase: CalibrationPhase,
    /// Star position when the current phase began
    origin: Vector2<f64>,
    /// Star position when calibration began
    start: Vector2<f64>,
    /// Pulses issued in the current phase
    steps: u32,
    ra_vector: Vector2<f64>,
    ra_pulse_ms_total: u32,
    /// Forward step count the current minus phase must mirror
    return_steps: u32,
    dec_vector: Vector2<f64>,
    dec_pulse_ms_total: u32,
}

impl Calibrator {
    /// Start a calibration from the measured star position. Returns the
    /// engine and the first +RA pulse to issue.
    pub fn begin(params: &GuideParameters, star: &StarPosition) -> (Calibrator, PulseCommand) {
        let start = Vector2::new(star.x, star.y);
        let calibrator = Calibrator {
            pulse_ms: params.calibration_pulse_ms,
            two_axis: params.two_axis,
            phase: CalibrationPhase::RaPlus,
            origin: start,
            start,
            steps: 1,
            ra_vector: Vector2::zeros(),
            ra_pulse_ms_total: 0,
            return_steps: 0,
            dec_vector: Vector2::zeros(),
            dec_pulse_ms_total: 0,
        };
        log::info!(
            "calibration started at ({:.2}, {:.2}), {} ms steps, two_axis={}",
            star.x,
            star.y,
            params.calibration_pulse_ms,
            params.two_axis
        );
        let pulse = PulseCommand::new(GuideDirection::RaPlus, params.calibration_pulse_ms);
        (calibrator, pulse)
    }

    /// Current phase.
    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    /// Feed the star position measured after the last pulse and get the next
    /// action.
    pub fn advance(&mut self, measured: &StarPosition) -> CalAction {
        let position = Vector2::new(measured.x, measured.y);
        let displacement = position - self.origin;

        match self.phase {
            CalibrationPhase::RaPlus => {
                if displacement.norm() >= MIN_TRAVEL_PX {
                    self.ra_vector = displacement;
                    self.ra_pulse_ms_total = self.steps * self.pulse_ms;
                    self.return_steps = self.steps;
                    log::info!(
                        "RA response: {:.2} px over {} ms",
                        displacement.norm(),
                        self.ra_pulse_ms_total
                    );
                    self.enter_phase(CalibrationPhase::RaMinus, position);
                    CalAction::Pulse(PulseCommand::new(GuideDirection::RaMinus, self.pulse_ms))
                } else if self.steps >= MAX_STEPS {
                    CalAction::Failed {
                        reason: format!(
                            "RA axis moved only {:.2} px after {} pulses",
                            displacement.norm(),
                            self.steps
                        ),
                    }
                } else {
                    self.steps += 1;
                    CalAction::Pulse(PulseCommand::new(GuideDirection::RaPlus, self.pulse_ms))
                }
            }

            CalibrationPhase::RaMinus => {
                if self.steps >= self.return_steps {
                    let residual = (position - self.start).norm();
                    log::info!("RA return residual {residual:.2} px");
                    if self.two_axis {
                        self.enter_phase(CalibrationPhase::DecPlus, position);
                        CalAction::Pulse(PulseCommand::new(GuideDirection::DecPlus, self.pulse_ms))
                    } else {
                        CalAction::Complete(self.compute())
                    }
                } else {
                    self.steps += 1;
                    CalAction::Pulse(PulseCommand::new(GuideDirection::RaMinus, self.pulse_ms))
                }
            }

            CalibrationPhase::DecPlus => {
                if displacement.norm() >= MIN_TRAVEL_PX {
                    self.dec_vector = displacement;
                    self.dec_pulse_ms_total = self.steps * self.pulse_ms;
                    self.return_steps = self.steps;
                    log::info!(
                        "DEC response: {:.2} px over {} ms",
                        displacement.norm(),
                        self.dec_pulse_ms_total
                    );
                    self.enter_phase(CalibrationPhase::DecMinus, position);
                    CalAction::Pulse(PulseCommand::new(GuideDirection::DecMinus, self.pulse_ms))
                } else if self.steps >= MAX_STEPS {
                    CalAction::Failed {
                        reason: format!(
                            "DEC axis moved only {:.2} px after {} pulses",
                            displacement.norm(),
                            self.steps
                        ),
                    }
                } else {
                    self.steps += 1;
                    CalAction::Pulse(PulseCommand::new(GuideDirection::DecPlus, self.pulse_ms))
                }
            }

            CalibrationPhase::DecMinus => {
                if self.steps >= self.return_steps {
                    let residual = (position - self.start).norm();
                    log::info!("DEC return residual {residual:.2} px");
                    CalAction::Complete(self.compute())
                } else {
                    self.steps += 1;
                    CalAction::Pulse(PulseCommand::new(GuideDirection::DecMinus, self.pulse_ms))
                }
            }
        }
    }

    fn enter_phase(&mut self, phase: CalibrationPhase, position: Vector2<f64>) {
        self.phase = phase;
        self.origin = position;
        self.steps = 1;
    }

    fn compute(&self) -> CalibrationData {
        let ra_seconds = self.ra_pulse_ms_total as f64 / 1000.0;
        let ra_rate = self.ra_vector.norm() / ra_seconds;
        let angle = self.ra_vector.y.atan2(self.ra_vector.x);

        let (dec_rate, dec_swap, orthogonality_error) = if self.two_axis {
            let dec_seconds = self.dec_pulse_ms_total as f64 / 1000.0;
            let dec_rate = self.dec_vector.norm() / dec_seconds;

            // DEC vector in mount coordinates fixes the commanded sense
            let (sin, cos) = angle.sin_cos();
            let dec_mount_y = -self.dec_vector.x * sin + self.dec_vector.y * cos;
            let dec_swap = dec_mount_y < 0.0;

            let cross = self.ra_vector.x * self.dec_vector.y - self.ra_vector.y * self.dec_vector.x;
            let dot = self.ra_vector.dot(&self.dec_vector);
            let between = cross.abs().atan2(dot);
            let orthogonality_error = between - std::f64::consts::FRAC_PI_2;

            (Some(dec_rate), dec_swap, orthogonality_error)
        } else {
            (None, false, 0.0)
        };

        log::info!(
            "calibration computed: RA {ra_rate:.3} px/s, DEC {:?} px/s, angle {:.2} deg, \
             orthogonality error {:.2} deg, dec_swap={dec_swap}",
            dec_rate,
            angle.to_degrees(),
            orthogonality_error.to_degrees()
        );

        CalibrationData {
            ra_rate_px_per_sec: ra_rate,
            dec_rate_px_per_sec: dec_rate,
            angle_rad: angle,
            orthogonality_error_rad: orthogonality_error,
            dec_swap,
        }
    }
}
