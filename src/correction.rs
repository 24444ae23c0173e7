//! Correction algorithms: deviation in, pulse commands out.
//!
//! All four selectable algorithms share one proportional controller and
//! differ only in their gain/dead-zone profile. `Auto` picks a profile from
//! the RMS of a caller-owned window of recent deviations; that window is the
//! only carried state and it is explicit, so identical inputs always produce
//! identical output.

use std::collections::VecDeque;

use crate::calibration::CalibrationData;
use crate::config::{GuideAlgorithm, GuideParameters};
use crate::devices::{GuideDirection, PulseCommand};
use crate::events::DeviationSample;

/// Gain and dead zone applied by the proportional controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionProfile {
    /// Fraction of the computed proportional pulse actually commanded
    pub gain: f64,
    /// Deviations below this magnitude (arc-seconds) are ignored
    pub dead_zone_arcsec: f64,
}

/// Seeing-noise RMS (arc-seconds) above which `Auto` prefers the calmer
/// Smart profile over Fast.
const AUTO_RMS_THRESHOLD_ARCSEC: f64 = 1.0;

/// Number of recent deviations retained for the `Auto` variance window.
const HISTORY_WINDOW: usize = 10;

impl CorrectionProfile {
    /// Smart: reduced gain, generous dead zone. Calm under poor seeing.
    pub const SMART: CorrectionProfile = CorrectionProfile {
        gain: 0.75,
        dead_zone_arcsec: 0.5,
    };

    /// Fast: unit gain, small dead zone. Crisp response in steady air.
    pub const FAST: CorrectionProfile = CorrectionProfile {
        gain: 1.0,
        dead_zone_arcsec: 0.25,
    };

    /// No threshold: always issues the full proportional pulse.
    pub const NO_THRESHOLD: CorrectionProfile = CorrectionProfile {
        gain: 1.0,
        dead_zone_arcsec: 0.0,
    };

    /// Resolve an algorithm selection against the recent-deviation window.
    pub fn resolve(algorithm: GuideAlgorithm, history: &CorrectionState) -> CorrectionProfile {
        match algorithm {
            GuideAlgorithm::Smart => CorrectionProfile::SMART,
            GuideAlgorithm::Fast => CorrectionProfile::FAST,
            GuideAlgorithm::NoThreshold => CorrectionProfile::NO_THRESHOLD,
            GuideAlgorithm::Auto => {
                if history.rms_arcsec() > AUTO_RMS_THRESHOLD_ARCSEC {
                    CorrectionProfile::SMART
                } else {
                    CorrectionProfile::FAST
                }
            }
        }
    }
}

/// Explicit smoothing state for the `Auto` algorithm: a bounded window of
/// recent deviation magnitudes. Owned by the guide loop and updated once per
/// cycle after the correction is computed.
#[derive(Debug, Clone, Default)]
pub struct CorrectionState {
    recent: VecDeque<f64>,
}

impl CorrectionState {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deviation magnitude, dropping the oldest beyond the window.
    pub fn record(&mut self, sample: &DeviationSample) {
        if self.recent.len() == HISTORY_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(sample.magnitude());
    }

    /// Forget all history (run start, dither).
    pub fn reset(&mut self) {
        self.recent.clear();
    }

    /// RMS of the recorded magnitudes, zero when empty.
    pub fn rms_arcsec(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self.recent.iter().map(|m| m * m).sum();
        (sum_sq / self.recent.len() as f64).sqrt()
    }
}

/// Per-axis pulse commands for one correction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisPulses {
    /// RA correction, if any
    pub ra: Option<PulseCommand>,
    /// DEC correction, if any
    pub dec: Option<PulseCommand>,
}

impl AxisPulses {
    /// Whether no correction is commanded.
    pub fn is_empty(&self) -> bool {
        self.ra.is_none() && self.dec.is_none()
    }
}

/// Compute the correction for one cycle.
///
/// `deviation_px` is the star displacement from the reference position in
/// frame coordinates (star minus reference); it is rotated through the
/// calibrated orthogonality angle into mount axes and converted to pulse
/// durations via the per-axis rates. Durations below the configured minimum
/// yield no pulse; above the maximum they are clamped.
pub fn compute_correction(
    deviation_px: (f64, f64),
    calibration: &CalibrationData,
    params: &GuideParameters,
    arcsec_per_px: f64,
    history: &CorrectionState,
) -> AxisPulses {
    let profile = CorrectionProfile::resolve(params.algorithm, history);
    let (ra_px, dec_px) = calibration.frame_to_mount(deviation_px.0, deviation_px.1);

    let ra = axis_pulse(
        ra_px,
        calibration.ra_rate_px_per_sec,
        GuideDirection::RaPlus,
        false,
        profile,
        params,
        arcsec_per_px,
    );

    let dec = calibration.dec_rate_px_per_sec.and_then(|rate| {
        let swap = calibration.dec_swap ^ params.dec_swap;
        axis_pulse(
            dec_px,
            rate,
            GuideDirection::DecPlus,
            swap,
            profile,
            params,
            arcsec_per_px,
        )
    });

    AxisPulses { ra, dec }
}

/// Proportional pulse for one axis, or `None` inside the dead zone or below
/// the minimum pulse duration.
fn axis_pulse(
    deviation_px: f64,
    rate_px_per_sec: f64,
    positive: GuideDirection,
    swap: bool,
    profile: CorrectionProfile,
    params: &GuideParameters,
    arcsec_per_px: f64,
) -> Option<PulseCommand> {
    if rate_px_per_sec <= f64::EPSILON {
        return None;
    }

    let deviation_arcsec = deviation_px.abs() * arcsec_per_px;
    if deviation_arcsec <= profile.dead_zone_arcsec {
        return None;
    }

    let duration_s = deviation_px.abs() / rate_px_per_sec * profile.gain;
    let duration_ms = (duration_s * 1000.0).round();
    if duration_ms < params.min_pulse_ms as f64 {
        return None;
    }
    let duration_ms = (duration_ms as u32).min(params.max_pulse_ms);

    // Pulse opposes the measured drift; swap inverts the DEC sense when the
    // calibrated response (or the operator) says the axis is mirrored.
    let drift_positive = deviation_px > 0.0;
    let direction = match (drift_positive, swap) {
        (true, false) | (false, true) => positive.reversed(),
        (false, false) | (true, true) => positive,
    };

    Some(PulseCommand::new(direction, duration_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Timestamp;

    fn test_calibration() -> CalibrationData {
        CalibrationData {
            ra_rate_px_per_sec: 2.0,
            dec_rate_px_per_sec: Some(2.0),
            angle_rad: 0.0,
            orthogonality_error_rad: 0.0,
            dec_swap: false,
        }
    }

    fn test_params(algorithm: GuideAlgorithm) -> GuideParameters {
        GuideParameters {
            algorithm,
            min_pulse_ms: 10,
            max_pulse_ms: 2000,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_deviation_yields_no_pulse() {
        let state = CorrectionState::new();
        for algorithm in [
            GuideAlgorithm::Smart,
            GuideAlgorithm::Fast,
            GuideAlgorithm::Auto,
            GuideAlgorithm::NoThreshold,
        ] {
            let pulses = compute_correction(
                (0.0, 0.0),
                &test_calibration(),
                &test_params(algorithm),
                2.0,
                &state,
            );
            assert!(pulses.is_empty(), "{algorithm:?} pulsed on zero deviation");
        }
    }

    #[test]
    fn test_durations_clamped_to_bounds() {
        let state = CorrectionState::new();
        let params = test_params(GuideAlgorithm::NoThreshold);

        // enormous deviation clamps at max
        let pulses = compute_correction((1e6, -1e6), &test_calibration(), &params, 2.0, &state);
        assert_eq!(pulses.ra.unwrap().duration_ms, params.max_pulse_ms);
        assert_eq!(pulses.dec.unwrap().duration_ms, params.max_pulse_ms);

        // deviation worth less than min_pulse_ms is dropped:
        // 0.01 px / 2 px/s = 5 ms < 10 ms minimum
        let pulses = compute_correction((0.01, 0.0), &test_calibration(), &params, 2.0, &state);
        assert!(pulses.is_empty());
    }

    #[test]
    fn test_proportional_ra_only_correction() {
        // star drifted +2 px in RA, none in DEC
        let state = CorrectionState::new();
        let pulses = compute_correction(
            (2.0, 0.0),
            &test_calibration(),
            &test_params(GuideAlgorithm::Smart),
            2.0,
            &state,
        );
        let ra = pulses.ra.expect("RA pulse expected");
        // 2 px / 2 px/s * 0.75 gain = 750 ms, pushing back west
        assert_eq!(ra.duration_ms, 750);
        assert_eq!(ra.direction, GuideDirection::RaMinus);
        assert!(pulses.dec.is_none());
    }

    #[test]
    fn test_dead_zone_swallows_jitter() {
        let state = CorrectionState::new();
        // 0.2 px at 2"/px = 0.4" — inside Smart's 0.5" dead zone
        let pulses = compute_correction(
            (0.2, 0.0),
            &test_calibration(),
            &test_params(GuideAlgorithm::Smart),
            2.0,
            &state,
        );
        assert!(pulses.is_empty());

        // NoThreshold still corrects the same deviation
        let pulses = compute_correction(
            (0.2, 0.0),
            &test_calibration(),
            &test_params(GuideAlgorithm::NoThreshold),
            2.0,
            &state,
        );
        assert!(pulses.ra.is_some());
    }

    #[test]
    fn test_dec_swap_inverts_direction() {
        let state = CorrectionState::new();
        let params = test_params(GuideAlgorithm::NoThreshold);

        let pulses = compute_correction((0.0, 1.0), &test_calibration(), &params, 2.0, &state);
        assert_eq!(pulses.dec.unwrap().direction, GuideDirection::DecMinus);

        let mut swapped = test_calibration();
        swapped.dec_swap = true;
        let pulses = compute_correction((0.0, 1.0), &swapped, &params, 2.0, &state);
        assert_eq!(pulses.dec.unwrap().direction, GuideDirection::DecPlus);

        // operator override on top of the calibrated swap cancels it
        let mut params_swapped = params.clone();
        params_swapped.dec_swap = true;
        let pulses = compute_correction((0.0, 1.0), &swapped, &params_swapped, 2.0, &state);
        assert_eq!(pulses.dec.unwrap().direction, GuideDirection::DecMinus);
    }

    #[test]
    fn test_single_axis_calibration_never_pulses_dec() {
        let state = CorrectionState::new();
        let calibration = CalibrationData {
            dec_rate_px_per_sec: None,
            ..test_calibration()
        };
        let pulses = compute_correction(
            (0.0, 5.0),
            &calibration,
            &test_params(GuideAlgorithm::NoThreshold),
            2.0,
            &state,
        );
        assert!(pulses.dec.is_none());
    }

    #[test]
    fn test_orthogonality_rotation() {
        // camera rotated 90 degrees: frame +y is mount +RA
        let state = CorrectionState::new();
        let calibration = CalibrationData {
            ra_rate_px_per_sec: 2.0,
            dec_rate_px_per_sec: Some(2.0),
            angle_rad: std::f64::consts::FRAC_PI_2,
            orthogonality_error_rad: 0.0,
            dec_swap: false,
        };
        let pulses = compute_correction(
            (0.0, 2.0),
            &calibration,
            &test_params(GuideAlgorithm::NoThreshold),
            2.0,
            &state,
        );
        assert!(pulses.ra.is_some());
        assert!(pulses.dec.is_none());
        assert_eq!(pulses.ra.unwrap().direction, GuideDirection::RaMinus);
    }

    #[test]
    fn test_auto_switches_profile_on_variance() {
        let mut noisy = CorrectionState::new();
        for _ in 0..HISTORY_WINDOW {
            noisy.record(&DeviationSample {
                ra_arcsec: 2.0,
                dec_arcsec: 0.0,
                timestamp: Timestamp::new(0, 0),
            });
        }
        assert_eq!(
            CorrectionProfile::resolve(GuideAlgorithm::Auto, &noisy),
            CorrectionProfile::SMART
        );

        let calm = CorrectionState::new();
        assert_eq!(
            CorrectionProfile::resolve(GuideAlgorithm::Auto, &calm),
            CorrectionProfile::FAST
        );
    }

    #[test]
    fn test_determinism_for_identical_inputs() {
        let mut state = CorrectionState::new();
        state.record(&DeviationSample {
            ra_arcsec: 0.8,
            dec_arcsec: 0.1,
            timestamp: Timestamp::new(0, 0),
        });

        let first = compute_correction(
            (1.5, -0.7),
            &test_calibration(),
            &test_params(GuideAlgorithm::Auto),
            2.0,
            &state,
        );
        let second = compute_correction(
            (1.5, -0.7),
            &test_calibration(),
            &test_params(GuideAlgorithm::Auto),
            2.0,
            &state,
        );
        assert_eq!(first, second);
    }
}
