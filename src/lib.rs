//! RETICLE - closed-loop telescope autoguiding.
//!
//! Keeps a mount pointed at a target by repeatedly imaging a guide star,
//! measuring its drift from a locked reference position, and issuing timed
//! corrective pulses. The crate is organized leaves-first: a star centroid
//! [`tracker`], a step-driven [`calibration`] engine, a pure [`correction`]
//! algorithm family, the cooperative [`guide_loop`] controller, and a
//! pluggable [`backend`] abstraction with an in-process guider plus two
//! [`external`] process delegates. [`GuideSession`] is the externally
//! visible coordinator: it wires devices to the active backend, exposes the
//! control surface, and republishes status and log events.

use ndarray::{Array2, ArrayView2};
use std::sync::Arc;
use std::time::Duration;

pub mod backend;
pub mod calibration;
pub mod config;
pub mod correction;
pub mod dark;
pub mod devices;
pub mod error;
pub mod events;
pub mod external;
pub mod guide_loop;
pub mod mock;
pub mod state;
pub mod tracker;

pub use crate::backend::{GuiderBackend, GuiderKind, InternalGuider, SharedCamera, SharedRelay};
pub use crate::calibration::CalibrationData;
pub use crate::config::{BoxSize, DitherParameters, GuideAlgorithm, GuideParameters};
pub use crate::dark::MasterDark;
pub use crate::devices::{
    arcsec_per_pixel, FrameMetadata, GuideAxis, GuideCamera, GuideDirection, MountInfo,
    PulseCommand, PulseRelay, Timestamp,
};
pub use crate::error::{GuideError, GuideResult};
pub use crate::events::{CallbackId, DeviationSample, GuideEvent};
pub use crate::external::{ControlChannel, LinGuiderBackend, Phd2Backend};
pub use crate::state::{DeviceEvent, GuideState};
pub use crate::tracker::{StarPosition, StarTracker, TrackerConfig};

use crate::events::CallbackRegistry;

/// The guide session facade.
///
/// Owns the run configuration and borrowed device handles, holds exactly one
/// active guider backend, and fans backend events out to subscribers. Device
/// lifetime is managed by the caller; a handle going away between cycles
/// surfaces as [`GuideError::DeviceUnavailable`] rather than being assumed
/// alive.
pub struct GuideSession {
    params: GuideParameters,
    backend: Option<Box<dyn GuiderBackend>>,
    camera: Option<SharedCamera>,
    relay: Option<SharedRelay>,
    mount: Option<Arc<dyn MountInfo>>,
    callbacks: CallbackRegistry,
    log_lines: Vec<String>,
    dark: Option<MasterDark>,
    lock_position: Option<(f64, f64)>,
}

impl Default for GuideSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GuideSession {
    /// Create a session with default parameters and no devices.
    pub fn new() -> Self {
        Self {
            params: GuideParameters::default(),
            backend: None,
            camera: None,
            relay: None,
            mount: None,
            callbacks: CallbackRegistry::new(),
            log_lines: Vec::new(),
            dark: None,
            lock_position: None,
        }
    }

    // ---- devices ---------------------------------------------------------

    /// Select the imaging device. Refused while a run is active; discards
    /// any held calibration since it was measured through the old device.
    pub fn set_camera(&mut self, camera: SharedCamera) -> GuideResult<()> {
        self.ensure_idle()?;
        self.camera = Some(camera);
        self.backend = None;
        Ok(())
    }

    /// Select the pulse relay. Same restrictions as [`Self::set_camera`].
    pub fn set_pulse_relay(&mut self, relay: SharedRelay) -> GuideResult<()> {
        self.ensure_idle()?;
        self.relay = Some(relay);
        self.backend = None;
        Ok(())
    }

    /// Select the mount-information provider used to derive the pixel scale.
    pub fn set_mount_info(&mut self, mount: Arc<dyn MountInfo>) -> GuideResult<()> {
        self.ensure_idle()?;
        self.mount = Some(mount);
        self.backend = None;
        Ok(())
    }

    /// Unbinned image scale in arc-seconds per pixel, from the mount info.
    pub fn arcsec_per_pixel(&self) -> GuideResult<f64> {
        let mount = self
            .mount
            .as_ref()
            .ok_or(GuideError::DeviceUnavailable { role: "mount info" })?;
        Ok(arcsec_per_pixel(
            mount.pixel_pitch_um(),
            mount.focal_length_mm(),
        ))
    }

    // ---- guider selection ------------------------------------------------

    /// Activate the in-process guider. Requires all three devices.
    pub fn use_internal_guider(&mut self) -> GuideResult<()> {
        self.ensure_idle()?;
        let camera = self
            .camera
            .clone()
            .ok_or(GuideError::DeviceUnavailable { role: "camera" })?;
        let relay = self
            .relay
            .clone()
            .ok_or(GuideError::DeviceUnavailable { role: "pulse relay" })?;
        let scale = self.arcsec_per_pixel()?;
        let guider = InternalGuider::new(self.params.clone(), camera, relay, scale)?;
        self.backend = Some(Box::new(guider));
        Ok(())
    }

    /// Delegate to an external PHD2 process over the given channel.
    pub fn use_phd2_guider<C>(&mut self, channel: C) -> GuideResult<()>
    where
        C: ControlChannel + 'static,
    {
        self.ensure_idle()?;
        self.backend = Some(Box::new(Phd2Backend::new(channel, self.params.clone())));
        Ok(())
    }

    /// Delegate to an external lin_guider process over the given channel.
    pub fn use_linguider<C>(&mut self, channel: C) -> GuideResult<()>
    where
        C: ControlChannel + 'static,
    {
        self.ensure_idle()?;
        self.backend = Some(Box::new(LinGuiderBackend::new(channel)));
        Ok(())
    }

    /// Which guider variant is active, if one is selected.
    pub fn guider_kind(&self) -> Option<GuiderKind> {
        self.backend.as_ref().map(|backend| backend.kind())
    }

    // ---- parameters ------------------------------------------------------
    //
    // Setters mutate the session's configuration only; a running backend
    // keeps the snapshot it took at run start, so changes apply from the
    // next run.

    /// Guide exposure duration.
    pub fn set_exposure(&mut self, exposure: Duration) {
        self.params.exposure = exposure;
    }

    /// Tracking box size.
    pub fn set_box_size(&mut self, box_size: BoxSize) {
        self.params.box_size = box_size;
    }

    /// Tracking box size by combo index (0..=4 for 8..128 px).
    pub fn set_box_size_index(&mut self, index: usize) -> GuideResult<()> {
        self.params.box_size =
            BoxSize::from_index(index).ok_or(GuideError::ConfigurationInvalid {
                reason: format!("box size index {index} out of range"),
            })?;
        Ok(())
    }

    /// Correction algorithm.
    pub fn set_algorithm(&mut self, algorithm: GuideAlgorithm) {
        self.params.algorithm = algorithm;
    }

    /// Calibrate DEC in addition to RA.
    pub fn set_two_axis(&mut self, enabled: bool) {
        self.params.two_axis = enabled;
    }

    /// Automatic guide star selection.
    pub fn set_auto_star(&mut self, enabled: bool) {
        self.params.auto_star = enabled;
    }

    /// Automatic box sizing from the measured star width.
    pub fn set_auto_box_size(&mut self, enabled: bool) {
        self.params.auto_box_size = enabled;
    }

    /// Subframed readout around the tracking box.
    pub fn set_subframe_enabled(&mut self, enabled: bool) {
        self.params.subframe = enabled;
    }

    /// Dark-frame subtraction before centroiding.
    pub fn set_dark_subtraction(&mut self, enabled: bool) {
        self.params.dark_subtraction = enabled;
    }

    /// Rapid guiding: the device driver computes the centroid itself.
    pub fn set_rapid_guide(&mut self, enabled: bool) {
        self.params.rapid_guide = enabled;
    }

    /// Invert the DEC pulse sense.
    pub fn set_dec_swap(&mut self, enabled: bool) {
        self.params.dec_swap = enabled;
    }

    /// Enable dithering with the given amplitude in pixels.
    pub fn set_dither(&mut self, enabled: bool, amplitude_px: f64) {
        self.params.dither.enabled = enabled;
        self.params.dither.amplitude_px = amplitude_px;
    }

    /// Pulse duration used for each calibration step.
    pub fn set_calibration_pulse(&mut self, duration_ms: u32) {
        self.params.calibration_pulse_ms = duration_ms;
    }

    /// Minimum and maximum correction pulse durations.
    pub fn set_pulse_bounds(&mut self, min_ms: u32, max_ms: u32) {
        self.params.min_pulse_ms = min_ms;
        self.params.max_pulse_ms = max_ms;
    }

    /// Current configuration.
    pub fn parameters(&self) -> &GuideParameters {
        &self.params
    }

    /// Build the session master dark from captured dark exposures.
    pub fn set_dark_frames(
        &mut self,
        frames: &[Array2<u16>],
        exposure: Duration,
    ) -> GuideResult<()> {
        self.dark = Some(MasterDark::from_frames(frames, exposure).ok_or(
            GuideError::ConfigurationInvalid {
                reason: "dark frames are empty or mismatched".into(),
            },
        )?);
        Ok(())
    }

    /// Designate the guide star for the next run.
    pub fn set_lock_position(&mut self, position: Option<(f64, f64)>) {
        self.lock_position = position;
    }

    /// Pick a guide star from a delivered frame and designate it as the
    /// lock position for the next run.
    pub fn select_auto_star(&mut self, frame: &ArrayView2<u16>) -> GuideResult<StarPosition> {
        let mut tracker = StarTracker::new(TrackerConfig::default());
        tracker.set_dark(self.dark.clone());
        let star = tracker
            .select_auto(frame, self.params.dark_subtraction)
            .map_err(|_| GuideError::StarLost)?;
        self.lock_position = Some((star.x, star.y));
        self.append_log(format!(
            "auto-selected guide star at ({:.2}, {:.2})",
            star.x, star.y
        ));
        Ok(star)
    }

    // ---- control surface -------------------------------------------------

    /// Start a calibration run.
    pub fn start_calibration(&mut self) -> GuideResult<()> {
        self.start_calibration_inner(false)
    }

    /// Calibrate, then immediately start guiding once calibration completes.
    pub fn calibrate_and_guide(&mut self) -> GuideResult<()> {
        self.start_calibration_inner(true)
    }

    fn start_calibration_inner(&mut self, then_guide: bool) -> GuideResult<()> {
        self.params.validate()?;
        self.prepare_backend()?;
        let backend = self.backend.as_mut().expect("prepared above");
        let events = backend.start_calibration(then_guide)?;
        self.publish(events);
        Ok(())
    }

    /// Stop a calibration in progress.
    pub fn stop_calibration(&mut self) -> GuideResult<()> {
        let events = self.require_backend()?.stop_calibration()?;
        self.publish(events);
        Ok(())
    }

    /// Start a guiding run against the held calibration.
    pub fn start_guiding(&mut self) -> GuideResult<()> {
        self.params.validate()?;
        self.prepare_backend()?;
        let backend = self.backend.as_mut().expect("prepared above");
        let events = backend.start_guiding()?;
        self.publish(events);
        Ok(())
    }

    /// Stop guiding at the next cycle boundary.
    pub fn stop_guiding(&mut self) -> GuideResult<()> {
        let events = self.require_backend()?.stop_guiding()?;
        self.publish(events);
        Ok(())
    }

    /// Pause or resume the guide cycle.
    pub fn set_suspended(&mut self, suspended: bool) -> GuideResult<()> {
        let backend = self.require_backend()?;
        let events = if suspended {
            backend.suspend()?
        } else {
            backend.resume()?
        };
        self.publish(events);
        Ok(())
    }

    /// Trigger a dither now.
    pub fn dither(&mut self) -> GuideResult<()> {
        let events = self.require_backend()?.dither()?;
        self.publish(events);
        Ok(())
    }

    /// Issue a manual pulse outside the correction cycle.
    pub fn send_pulse(&mut self, command: PulseCommand) -> GuideResult<()> {
        let events = self.require_backend()?.send_pulse(command)?;
        self.publish(events);
        Ok(())
    }

    /// Request a single frame outside any run (focus checks, star
    /// selection). The frame arrives through [`Self::deliver_frame`] and is
    /// ignored by the backend when no cycle is waiting for it.
    pub fn capture(&mut self) -> GuideResult<()> {
        let camera = self
            .camera
            .as_ref()
            .ok_or(GuideError::DeviceUnavailable { role: "camera" })?;
        let mut camera = camera.lock().unwrap();
        if !camera.is_connected() {
            return Err(GuideError::DeviceUnavailable { role: "camera" });
        }
        camera.set_subframe(None)?;
        camera.start_exposure(self.params.exposure)?;
        Ok(())
    }

    // ---- device notifications --------------------------------------------

    /// Deliver a captured frame.
    pub fn deliver_frame(&mut self, frame: Array2<u16>, metadata: FrameMetadata) {
        self.forward(DeviceEvent::FrameReady { frame, metadata });
    }

    /// Report a failed capture.
    pub fn capture_failed(&mut self, reason: impl Into<String>) {
        self.forward(DeviceEvent::CaptureFailed {
            reason: reason.into(),
        });
    }

    /// Report a completed pulse.
    pub fn pulse_complete(&mut self, axis: GuideAxis) {
        self.forward(DeviceEvent::PulseComplete { axis });
    }

    /// Report a failed pulse.
    pub fn pulse_failed(&mut self, axis: GuideAxis, reason: impl Into<String>) {
        self.forward(DeviceEvent::PulseFailed {
            axis,
            reason: reason.into(),
        });
    }

    /// Deliver a driver-computed star centroid (rapid guiding).
    pub fn rapid_star_update(&mut self, x: f64, y: f64, quality: f64) {
        self.forward(DeviceEvent::RapidStarUpdate { x, y, quality });
    }

    /// Advance session time for timeout checks and external-channel polling.
    pub fn tick(&mut self, now: Timestamp) {
        self.forward(DeviceEvent::Tick { now });
    }

    fn forward(&mut self, event: DeviceEvent) {
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        match backend.handle_device_event(event) {
            Ok(events) => self.publish(events),
            Err(err) => {
                log::warn!("backend rejected device event: {err}");
                self.publish(vec![GuideEvent::Log(format!("device event error: {err}"))]);
            }
        }
    }

    // ---- queries and subscriptions ---------------------------------------

    /// Current lifecycle state.
    pub fn state(&self) -> GuideState {
        self.backend
            .as_ref()
            .map(|backend| backend.state())
            .unwrap_or(GuideState::Idle)
    }

    /// Most recent RA/DEC deviation in arc-seconds.
    pub fn current_deviation(&self) -> Option<DeviationSample> {
        self.backend
            .as_ref()
            .and_then(|backend| backend.current_deviation())
    }

    /// Most recent guide star position in frame pixels.
    pub fn star_position(&self) -> Option<StarPosition> {
        self.backend
            .as_ref()
            .and_then(|backend| backend.star_position())
    }

    /// Subscribe to status and log events.
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&GuideEvent) + Send + Sync + 'static,
    {
        self.callbacks.register(callback)
    }

    /// Remove a subscription.
    pub fn deregister_callback(&self, id: CallbackId) -> bool {
        self.callbacks.deregister(id)
    }

    /// Accumulated log text.
    pub fn log_text(&self) -> String {
        self.log_lines.join("\n")
    }

    /// Discard the accumulated log.
    pub fn clear_log(&mut self) {
        self.log_lines.clear();
    }

    // ---- internals -------------------------------------------------------

    fn ensure_idle(&self) -> GuideResult<()> {
        if self
            .backend
            .as_ref()
            .map_or(false, |backend| backend.is_active())
        {
            return Err(GuideError::BackendBusy);
        }
        Ok(())
    }

    fn require_backend(&mut self) -> GuideResult<&mut Box<dyn GuiderBackend>> {
        self.backend
            .as_mut()
            .ok_or(GuideError::DeviceUnavailable { role: "guider" })
    }

    /// Snapshot parameters, dark, and lock position into the backend before
    /// a run starts.
    fn prepare_backend(&mut self) -> GuideResult<()> {
        let params = self.params.clone();
        let dark = self.dark.clone();
        let lock = self.lock_position;
        let backend = self.require_backend()?;
        backend.apply_parameters(&params)?;
        backend.set_dark(dark);
        backend.set_manual_star(lock);
        Ok(())
    }

    fn append_log(&mut self, line: String) {
        log::info!("{line}");
        self.log_lines.push(line);
    }

    fn publish(&mut self, events: Vec<GuideEvent>) {
        for event in events {
            if let GuideEvent::Log(line) = &event {
                self.log_lines.push(line.clone());
            }
            self.callbacks.emit(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FixedMount, MockCamera, MockRelay};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn session_with_devices() -> GuideSession {
        let mut session = GuideSession::new();
        session
            .set_camera(Arc::new(Mutex::new(MockCamera::new(256, 256))))
            .unwrap();
        session
            .set_pulse_relay(Arc::new(Mutex::new(MockRelay::new(true))))
            .unwrap();
        session
            .set_mount_info(Arc::new(FixedMount::default()))
            .unwrap();
        session
    }

    #[test]
    fn test_operations_refused_without_guider() {
        let mut session = GuideSession::new();
        assert!(matches!(
            session.start_guiding(),
            Err(GuideError::DeviceUnavailable { .. })
        ));
        assert!(matches!(
            session.start_calibration(),
            Err(GuideError::DeviceUnavailable { .. })
        ));
        assert_eq!(session.state(), GuideState::Idle);
    }

    #[test]
    fn test_internal_guider_requires_all_devices() {
        let mut session = GuideSession::new();
        assert!(matches!(
            session.use_internal_guider(),
            Err(GuideError::DeviceUnavailable { role: "camera" })
        ));

        session
            .set_camera(Arc::new(Mutex::new(MockCamera::new(256, 256))))
            .unwrap();
        assert!(matches!(
            session.use_internal_guider(),
            Err(GuideError::DeviceUnavailable { role: "pulse relay" })
        ));

        session
            .set_pulse_relay(Arc::new(Mutex::new(MockRelay::new(true))))
            .unwrap();
        assert!(matches!(
            session.use_internal_guider(),
            Err(GuideError::DeviceUnavailable { role: "mount info" })
        ));

        session
            .set_mount_info(Arc::new(FixedMount::default()))
            .unwrap();
        session.use_internal_guider().unwrap();
        assert_eq!(session.guider_kind(), Some(GuiderKind::Internal));
    }

    #[test]
    fn test_device_change_drops_backend() {
        let mut session = session_with_devices();
        session.use_internal_guider().unwrap();
        assert!(session.guider_kind().is_some());

        session
            .set_camera(Arc::new(Mutex::new(MockCamera::new(512, 512))))
            .unwrap();
        assert!(session.guider_kind().is_none());
    }

    #[test]
    fn test_log_events_accumulate_and_clear() {
        let mut session = session_with_devices();
        session.use_internal_guider().unwrap();
        session.set_auto_star(true);
        session.start_calibration().unwrap();

        assert!(session.log_text().contains("calibration run started"));
        session.clear_log();
        assert!(session.log_text().is_empty());
    }

    #[test]
    fn test_callbacks_receive_state_changes() {
        let mut session = session_with_devices();
        session.use_internal_guider().unwrap();
        session.set_auto_star(true);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        session.register_callback(move |event| {
            if matches!(event, GuideEvent::StateChanged { .. }) {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        session.start_calibration().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), GuideState::Calibrating);
    }

    #[test]
    fn test_select_auto_star_sets_lock_position() {
        let mut session = GuideSession::new();
        let mut frame = Array2::<u16>::from_elem((128, 128), 100);
        // small synthetic star
        for row in 60..67 {
            for col in 60..67 {
                let dr = row as f64 - 63.0;
                let dc = col as f64 - 63.0;
                let value = 4000.0 * (-(dr * dr + dc * dc) / 4.0).exp();
                frame[[row, col]] = 100 + value as u16;
            }
        }
        let star = session.select_auto_star(&frame.view()).unwrap();
        assert!((star.x - 63.0).abs() < 0.5);
        assert!((star.y - 63.0).abs() < 0.5);
        assert_eq!(
            session.lock_position.map(|(x, _)| x.round() as i64),
            Some(63)
        );
    }

    #[test]
    fn test_capture_requests_exposure() {
        let mut session = session_with_devices();
        let camera = Arc::new(Mutex::new(MockCamera::new(256, 256)));
        let requests = camera.lock().unwrap().requests();
        session.set_camera(camera).unwrap();

        session.capture().unwrap();
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parameter_setters_touch_next_run_only() {
        let mut session = session_with_devices();
        session.use_internal_guider().unwrap();
        session.set_auto_star(true);
        session.start_calibration().unwrap();

        // mid-run setter mutates the session config but the backend keeps
        // its snapshot; a new start is refused while the run is active
        session.set_exposure(Duration::from_secs(5));
        assert_eq!(session.parameters().exposure, Duration::from_secs(5));
        assert!(matches!(
            session.start_calibration(),
            Err(GuideError::BackendBusy)
        ));
    }
}
