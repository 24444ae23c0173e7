//! Shared test harness: synthetic star frames and a simulated guiding rig.
//!
//! The rig plays the asynchronous half of the device contracts: it watches
//! the mock camera and relay for commands, renders frames with the simulated
//! star, applies pulses to the simulated mount, and delivers the resulting
//! device events back into the session.

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reticle::mock::{ExposureRequest, FixedMount, MockCamera, MockRelay};
use reticle::{
    FrameMetadata, GuideAxis, GuideSession, PulseCommand, Timestamp,
};

/// Render a frame with Gaussian stars on a noisy pedestal.
///
/// Deliberately crude: just enough signal structure for the tracker to have
/// something real to centroid, with seeded noise so runs are repeatable.
pub fn render_frame(
    width: usize,
    height: usize,
    stars: &[(f64, f64, f64)],
    fwhm: f64,
    noise_std: f64,
    seed: u64,
) -> Array2<u16> {
    let mut image = Array2::<f64>::from_elem((height, width), 100.0);
    let sigma = fwhm / 2.355;
    let sigma2 = sigma * sigma;
    let radius = (4.0 * sigma).ceil() as i64;

    for &(x, y, peak) in stars {
        let col_min = ((x as i64) - radius).max(0) as usize;
        let col_max = (((x as i64) + radius + 1).min(width as i64)) as usize;
        let row_min = ((y as i64) - radius).max(0) as usize;
        let row_max = (((y as i64) + radius + 1).min(height as i64)) as usize;
        for row in row_min..row_max {
            for col in col_min..col_max {
                let dx = col as f64 - x;
                let dy = row as f64 - y;
                image[[row, col]] += peak * (-(dx * dx + dy * dy) / (2.0 * sigma2)).exp();
            }
        }
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for pixel in image.iter_mut() {
        *pixel += rng.gen_range(-3.0..3.0) * noise_std / 3.0;
        if *pixel < 0.0 {
            *pixel = 0.0;
        }
    }
    image.mapv(|v| v.round().min(65535.0) as u16)
}

/// Simulated guiding rig around a [`GuideSession`] with mock devices.
pub struct GuideRig {
    pub session: GuideSession,
    requests: Arc<Mutex<Vec<ExposureRequest>>>,
    pulses: Arc<Mutex<Vec<PulseCommand>>>,
    served_requests: usize,
    served_pulses: usize,
    /// True star position on the sensor
    pub star: (f64, f64),
    /// Whether frames contain the star at all
    pub star_visible: bool,
    /// Star motion per second of RA pulse (frame px)
    pub ra_axis: (f64, f64),
    /// Star motion per second of DEC pulse (frame px)
    pub dec_axis: (f64, f64),
    pub width: usize,
    pub height: usize,
    frame_number: u64,
    now: Duration,
    frame_seed: u64,
}

impl GuideRig {
    /// Rig with a 256x256 sensor, a star at center, and a well-behaved
    /// mount responding 2 px/s on each axis, perpendicular.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Same rig with a relay that can only drive one axis at a time.
    pub fn new_with_single_channel_relay() -> Self {
        Self::build(false)
    }

    fn build(independent_axes: bool) -> Self {
        let camera = MockCamera::new(256, 256);
        let requests = camera.requests();
        let relay = MockRelay::new(independent_axes);
        let pulses = relay.pulses();

        let mut session = GuideSession::new();
        session
            .set_camera(Arc::new(Mutex::new(camera)))
            .expect("idle session accepts devices");
        session
            .set_pulse_relay(Arc::new(Mutex::new(relay)))
            .expect("idle session accepts devices");
        session
            .set_mount_info(Arc::new(FixedMount::default()))
            .expect("idle session accepts devices");

        Self {
            session,
            requests,
            pulses,
            served_requests: 0,
            served_pulses: 0,
            star: (128.0, 128.0),
            star_visible: true,
            ra_axis: (2.0, 0.0),
            dec_axis: (0.0, 2.0),
            width: 256,
            height: 256,
            frame_number: 0,
            now: Duration::ZERO,
            frame_seed: 7,
        }
    }

    /// Serve one pending device interaction. Pulses are served before
    /// frames, mirroring the cycle order. Returns false when nothing is
    /// pending.
    pub fn step(&mut self) -> bool {
        let pending_pulse = {
            let pulses = self.pulses.lock().unwrap();
            pulses.get(self.served_pulses).copied()
        };
        if let Some(pulse) = pending_pulse {
            self.served_pulses += 1;
            let axis = match pulse.direction.axis() {
                GuideAxis::Ra => self.ra_axis,
                GuideAxis::Dec => self.dec_axis,
            };
            let seconds = pulse.duration_ms as f64 / 1000.0 * pulse.direction.sign();
            self.star.0 += axis.0 * seconds;
            self.star.1 += axis.1 * seconds;
            self.now += Duration::from_millis(pulse.duration_ms as u64);
            self.session.pulse_complete(pulse.direction.axis());
            return true;
        }

        let pending_request = {
            let requests = self.requests.lock().unwrap();
            requests.get(self.served_requests).cloned()
        };
        if let Some(request) = pending_request {
            self.served_requests += 1;
            self.now += request.exposure;
            self.frame_seed += 1;

            let stars = if self.star_visible {
                vec![(self.star.0, self.star.1, 4000.0)]
            } else {
                Vec::new()
            };
            let full = render_frame(self.width, self.height, &stars, 3.5, 2.0, self.frame_seed);
            let frame = match request.subframe {
                Some(subframe) => subframe.extract(&full.view()),
                None => full,
            };

            self.frame_number += 1;
            let metadata = FrameMetadata {
                frame_number: self.frame_number,
                exposure: request.exposure,
                timestamp: Timestamp::from_duration(self.now),
                binning: 1,
                subframe: request.subframe,
            };
            self.session.deliver_frame(frame, metadata);
            return true;
        }
        false
    }

    /// Serve pending interactions until quiet or the step budget runs out.
    /// Returns the number of steps taken.
    pub fn run(&mut self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && self.step() {
            steps += 1;
        }
        steps
    }

    /// Every pulse commanded so far.
    pub fn pulses_issued(&self) -> Vec<PulseCommand> {
        self.pulses.lock().unwrap().clone()
    }

    /// Number of frames the rig has delivered so far.
    pub fn frames_served(&self) -> usize {
        self.served_requests
    }

    /// Number of exposures requested so far.
    pub fn exposures_requested(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}
