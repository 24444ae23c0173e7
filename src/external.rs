//! External guiding process delegates.
//!
//! Two [`GuiderBackend`] variants that own no devices: they forward
//! calibrate/guide/stop/pulse operations over a control channel to an
//! external guiding process and translate its status and log reports back
//! into [`GuideState`] transitions and [`GuideEvent`]s. The channel itself
//! is a trait so the delegates can be exercised against in-memory transports.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::{GuiderBackend, GuiderKind};
use crate::config::GuideParameters;
use crate::devices::{GuideDirection, PulseCommand, Timestamp};
use crate::error::{GuideError, GuideResult};
use crate::events::{DeviationSample, GuideEvent};
use crate::state::{DeviceEvent, GuideState};
use crate::tracker::StarPosition;

/// Line-oriented transport to an external guiding process.
pub trait ControlChannel: Send {
    /// Send one line.
    fn send_line(&mut self, line: &str) -> GuideResult<()>;

    /// Drain any pending lines from the remote process.
    fn poll_lines(&mut self) -> Vec<String>;

    /// Whether the transport is still usable.
    fn is_open(&self) -> bool;
}

fn transition(state: &mut GuideState, to: GuideState, events: &mut Vec<GuideEvent>) {
    if *state == to {
        return;
    }
    log::info!("external guider state {state:?} -> {to:?}");
    events.push(GuideEvent::StateChanged { from: *state, to });
    *state = to;
}

/// JSON-RPC request sent to a PHD2-style process.
#[derive(Debug, Serialize)]
struct RpcRequest {
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
    id: u64,
}

/// Status event received from a PHD2-style process. Unknown fields are
/// ignored; RPC responses carry no `Event` key and fail to parse, which is
/// how they are filtered out.
#[derive(Debug, Deserialize)]
struct RemoteEvent {
    #[serde(rename = "Event")]
    event: String,
    #[serde(rename = "RADistanceRaw", default)]
    ra_distance: Option<f64>,
    #[serde(rename = "DECDistanceRaw", default)]
    dec_distance: Option<f64>,
    #[serde(rename = "Reason", default)]
    reason: Option<String>,
}

/// Delegate to an external PHD2 process over its JSON event socket.
pub struct Phd2Backend<C: ControlChannel> {
    channel: C,
    params: GuideParameters,
    state: GuideState,
    calibrated: bool,
    last_deviation: Option<DeviationSample>,
    next_id: u64,
    now: Timestamp,
}

impl<C: ControlChannel> Phd2Backend<C> {
    /// Wrap an established channel to a PHD2 process.
    pub fn new(channel: C, params: GuideParameters) -> Self {
        Self {
            channel,
            params,
            state: GuideState::Idle,
            calibrated: false,
            last_deviation: None,
            next_id: 1,
            now: Timestamp::new(0, 0),
        }
    }

    fn call(&mut self, method: &str, params: Option<serde_json::Value>) -> GuideResult<()> {
        if !self.channel.is_open() {
            return Err(GuideError::ChannelClosed);
        }
        let request = RpcRequest {
            method: method.to_string(),
            params,
            id: self.next_id,
        };
        self.next_id += 1;
        let line = serde_json::to_string(&request)
            .expect("request serialization cannot fail");
        self.channel.send_line(&line)
    }

    fn settle_params(&self) -> serde_json::Value {
        json!({
            "pixels": 1.5,
            "time": 8,
            "timeout": 40,
        })
    }

    /// Translate one received line into events. Non-event lines (RPC
    /// responses) are ignored.
    fn translate(&mut self, line: &str, events: &mut Vec<GuideEvent>) {
        let Ok(remote) = serde_json::from_str::<RemoteEvent>(line) else {
            log::debug!("ignoring non-event line from PHD2: {line}");
            return;
        };

        match remote.event.as_str() {
            "StartCalibration" | "Calibrating" => {
                transition(&mut self.state, GuideState::Calibrating, events);
            }
            "CalibrationComplete" => {
                self.calibrated = true;
                events.push(GuideEvent::Log("PHD2 calibration complete".into()));
                transition(&mut self.state, GuideState::Calibrated, events);
            }
            "CalibrationFailed" => {
                let reason = remote.reason.unwrap_or_else(|| "unreported".into());
                events.push(GuideEvent::RunFailed {
                    reason: format!("PHD2 calibration failed: {reason}"),
                });
                transition(&mut self.state, GuideState::Aborted, events);
            }
            "StartGuiding" | "Resumed" => {
                transition(&mut self.state, GuideState::Guiding, events);
            }
            "GuideStep" => {
                let sample = DeviationSample {
                    ra_arcsec: remote.ra_distance.unwrap_or(0.0),
                    dec_arcsec: remote.dec_distance.unwrap_or(0.0),
                    timestamp: self.now,
                };
                self.last_deviation = Some(sample);
                events.push(GuideEvent::Deviation(sample));
            }
            "GuidingDithered" => {
                transition(&mut self.state, GuideState::Dithering, events);
            }
            "SettleDone" => {
                if self.state == GuideState::Dithering {
                    transition(&mut self.state, GuideState::Guiding, events);
                }
            }
            "Paused" => {
                transition(&mut self.state, GuideState::Suspended, events);
            }
            "StarLost" => {
                events.push(GuideEvent::Log("PHD2 reports guide star lost".into()));
            }
            "GuidingStopped" | "LoopingExposures" => {
                let target = if self.calibrated {
                    GuideState::Calibrated
                } else {
                    GuideState::Idle
                };
                transition(&mut self.state, target, events);
            }
            other => {
                log::debug!("unhandled PHD2 event: {other}");
            }
        }
    }
}

impl<C: ControlChannel> GuiderBackend for Phd2Backend<C> {
    fn kind(&self) -> GuiderKind {
        GuiderKind::Phd2
    }

    fn start_calibration(&mut self, _then_guide: bool) -> GuideResult<Vec<GuideEvent>> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        // PHD2 calibrates as part of a guide command
        self.call(
            "guide",
            Some(json!({
                "settle": self.settle_params(),
                "recalibrate": true,
            })),
        )?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Calibrating, &mut events);
        Ok(events)
    }

    fn stop_calibration(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.call("stop_capture", None)?;
        let mut events = Vec::new();
        if self.state == GuideState::Calibrating {
            transition(&mut self.state, GuideState::Idle, &mut events);
        }
        Ok(events)
    }

    fn start_guiding(&mut self) -> GuideResult<Vec<GuideEvent>> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        self.call(
            "guide",
            Some(json!({
                "settle": self.settle_params(),
                "recalibrate": false,
            })),
        )?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Guiding, &mut events);
        Ok(events)
    }

    fn stop_guiding(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.call("stop_capture", None)?;
        let mut events = Vec::new();
        let target = if self.calibrated {
            GuideState::Calibrated
        } else {
            GuideState::Idle
        };
        transition(&mut self.state, target, &mut events);
        Ok(events)
    }

    fn suspend(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.call("set_paused", Some(json!([true])))?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Suspended, &mut events);
        Ok(events)
    }

    fn resume(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.call("set_paused", Some(json!([false])))?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Guiding, &mut events);
        Ok(events)
    }

    fn dither(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.call(
            "dither",
            Some(json!({
                "amount": self.params.dither.amplitude_px,
                "raOnly": false,
                "settle": self.settle_params(),
            })),
        )?;
        Ok(Vec::new())
    }

    fn send_pulse(&mut self, command: PulseCommand) -> GuideResult<Vec<GuideEvent>> {
        let direction = match command.direction {
            GuideDirection::RaPlus => "E",
            GuideDirection::RaMinus => "W",
            GuideDirection::DecPlus => "N",
            GuideDirection::DecMinus => "S",
        };
        self.call(
            "guide_pulse",
            Some(json!([command.duration_ms, direction])),
        )?;
        Ok(vec![GuideEvent::PulseIssued(command)])
    }

    fn handle_device_event(&mut self, event: DeviceEvent) -> GuideResult<Vec<GuideEvent>> {
        let mut events = Vec::new();
        if let DeviceEvent::Tick { now } = event {
            self.now = now;
            if !self.channel.is_open() {
                if self.state.is_active() {
                    events.push(GuideEvent::RunFailed {
                        reason: GuideError::ChannelClosed.to_string(),
                    });
                    transition(&mut self.state, GuideState::Aborted, &mut events);
                }
                return Ok(events);
            }
            for line in self.channel.poll_lines() {
                self.translate(&line, &mut events);
            }
        }
        Ok(events)
    }

    fn state(&self) -> GuideState {
        self.state
    }

    fn current_deviation(&self) -> Option<DeviationSample> {
        self.last_deviation
    }

    fn star_position(&self) -> Option<StarPosition> {
        // PHD2 owns the star; it reports deviations only
        None
    }

    fn apply_parameters(&mut self, params: &GuideParameters) -> GuideResult<()> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        self.params = params.clone();
        Ok(())
    }
}

/// Delegate to an external lin_guider process over its text command socket.
pub struct LinGuiderBackend<C: ControlChannel> {
    channel: C,
    state: GuideState,
    calibrated: bool,
    last_deviation: Option<DeviationSample>,
    now: Timestamp,
}

impl<C: ControlChannel> LinGuiderBackend<C> {
    /// Wrap an established channel to a lin_guider process.
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            state: GuideState::Idle,
            calibrated: false,
            last_deviation: None,
            now: Timestamp::new(0, 0),
        }
    }

    fn send(&mut self, command: &str) -> GuideResult<()> {
        if !self.channel.is_open() {
            return Err(GuideError::ChannelClosed);
        }
        self.channel.send_line(command)
    }

    /// Translate one status line. The protocol is line-oriented:
    /// `state <name>`, `drift <ra> <dec>`, `log <text>`, `error <text>`.
    fn translate(&mut self, line: &str, events: &mut Vec<GuideEvent>) {
        let mut parts = line.splitn(2, ' ');
        let keyword = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");

        match keyword {
            "state" => {
                let target = match rest.trim() {
                    "calibrating" => Some(GuideState::Calibrating),
                    "calibrated" => {
                        self.calibrated = true;
                        Some(GuideState::Calibrated)
                    }
                    "guiding" => Some(GuideState::Guiding),
                    "dithering" => Some(GuideState::Dithering),
                    "suspended" => Some(GuideState::Suspended),
                    "aborted" => Some(GuideState::Aborted),
                    "idle" => Some(GuideState::Idle),
                    other => {
                        log::warn!("unknown lin_guider state: {other}");
                        None
                    }
                };
                if let Some(target) = target {
                    transition(&mut self.state, target, events);
                }
            }
            "drift" => {
                let mut values = rest.split_whitespace();
                let ra = values.next().and_then(|v| v.parse::<f64>().ok());
                let dec = values.next().and_then(|v| v.parse::<f64>().ok());
                if let (Some(ra_arcsec), Some(dec_arcsec)) = (ra, dec) {
                    let sample = DeviationSample {
                        ra_arcsec,
                        dec_arcsec,
                        timestamp: self.now,
                    };
                    self.last_deviation = Some(sample);
                    events.push(GuideEvent::Deviation(sample));
                }
            }
            "log" => {
                events.push(GuideEvent::Log(format!("lin_guider: {rest}")));
            }
            "error" => {
                events.push(GuideEvent::RunFailed {
                    reason: format!("lin_guider: {rest}"),
                });
                transition(&mut self.state, GuideState::Aborted, events);
            }
            other => {
                log::debug!("unhandled lin_guider line: {other}");
            }
        }
    }
}

impl<C: ControlChannel> GuiderBackend for LinGuiderBackend<C> {
    fn kind(&self) -> GuiderKind {
        GuiderKind::LinGuider
    }

    fn start_calibration(&mut self, _then_guide: bool) -> GuideResult<Vec<GuideEvent>> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        self.send("calibrate start")?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Calibrating, &mut events);
        Ok(events)
    }

    fn stop_calibration(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.send("calibrate stop")?;
        let mut events = Vec::new();
        if self.state == GuideState::Calibrating {
            transition(&mut self.state, GuideState::Idle, &mut events);
        }
        Ok(events)
    }

    fn start_guiding(&mut self) -> GuideResult<Vec<GuideEvent>> {
        if self.state.is_active() {
            return Err(GuideError::BackendBusy);
        }
        self.send("guide start")?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Guiding, &mut events);
        Ok(events)
    }

    fn stop_guiding(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.send("guide stop")?;
        let mut events = Vec::new();
        let target = if self.calibrated {
            GuideState::Calibrated
        } else {
            GuideState::Idle
        };
        transition(&mut self.state, target, &mut events);
        Ok(events)
    }

    fn suspend(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.send("pause on")?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Suspended, &mut events);
        Ok(events)
    }

    fn resume(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.send("pause off")?;
        let mut events = Vec::new();
        transition(&mut self.state, GuideState::Guiding, &mut events);
        Ok(events)
    }

    fn dither(&mut self) -> GuideResult<Vec<GuideEvent>> {
        self.send("dither")?;
        Ok(Vec::new())
    }

    fn send_pulse(&mut self, command: PulseCommand) -> GuideResult<Vec<GuideEvent>> {
        let direction = match command.direction {
            GuideDirection::RaPlus => "ra+",
            GuideDirection::RaMinus => "ra-",
            GuideDirection::DecPlus => "dec+",
            GuideDirection::DecMinus => "dec-",
        };
        self.send(&format!("pulse {direction} {}", command.duration_ms))?;
        Ok(vec![GuideEvent::PulseIssued(command)])
    }

    fn handle_device_event(&mut self, event: DeviceEvent) -> GuideResult<Vec<GuideEvent>> {
        let mut events = Vec::new();
        if let DeviceEvent::Tick { now } = event {
            self.now = now;
            if !self.channel.is_open() {
                if self.state.is_active() {
                    events.push(GuideEvent::RunFailed {
                        reason: GuideError::ChannelClosed.to_string(),
                    });
                    transition(&mut self.state, GuideState::Aborted, &mut events);
                }
                return Ok(events);
            }
            for line in self.channel.poll_lines() {
                self.translate(&line, &mut events);
            }
        }
        Ok(events)
    }

    fn state(&self) -> GuideState {
        self.state
    }

    fn current_deviation(&self) -> Option<DeviationSample> {
        self.last_deviation
    }

    fn star_position(&self) -> Option<StarPosition> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryChannel;

    fn tick(seconds: u64) -> DeviceEvent {
        DeviceEvent::Tick {
            now: Timestamp::new(seconds, 0),
        }
    }

    #[test]
    fn test_phd2_guide_command_and_events() {
        let channel = MemoryChannel::new();
        let sent = channel.sent();

        let mut backend = Phd2Backend::new(channel, GuideParameters::default());
        backend.start_guiding().unwrap();
        assert_eq!(backend.state(), GuideState::Guiding);

        let first = sent.lock().unwrap()[0].clone();
        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["method"], "guide");
        assert_eq!(parsed["params"]["recalibrate"], false);
    }

    #[test]
    fn test_phd2_translates_remote_status() {
        let channel = MemoryChannel::new();
        channel.push_incoming(r#"{"Event":"StartCalibration"}"#);
        channel.push_incoming(r#"{"Event":"CalibrationComplete"}"#);
        channel.push_incoming(r#"{"Event":"StartGuiding"}"#);
        channel.push_incoming(r#"{"Event":"GuideStep","RADistanceRaw":0.5,"DECDistanceRaw":-0.3}"#);

        let mut backend = Phd2Backend::new(channel, GuideParameters::default());
        let events = backend.handle_device_event(tick(1)).unwrap();

        assert_eq!(backend.state(), GuideState::Guiding);
        let deviation = backend.current_deviation().unwrap();
        assert_eq!(deviation.ra_arcsec, 0.5);
        assert_eq!(deviation.dec_arcsec, -0.3);

        let transitions: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                GuideEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                GuideState::Calibrating,
                GuideState::Calibrated,
                GuideState::Guiding
            ]
        );
    }

    #[test]
    fn test_phd2_calibration_failure_aborts() {
        let channel = MemoryChannel::new();
        channel.push_incoming(r#"{"Event":"CalibrationFailed","Reason":"star faded"}"#);
        let mut backend = Phd2Backend::new(channel, GuideParameters::default());
        backend.start_calibration(false).unwrap();
        let events = backend.handle_device_event(tick(1)).unwrap();
        assert_eq!(backend.state(), GuideState::Aborted);
        assert!(events
            .iter()
            .any(|e| matches!(e, GuideEvent::RunFailed { reason } if reason.contains("star faded"))));
    }

    #[test]
    fn test_phd2_closed_channel_refuses_commands() {
        let channel = MemoryChannel::new();
        channel.close();
        let mut backend = Phd2Backend::new(channel, GuideParameters::default());
        assert!(matches!(
            backend.start_guiding(),
            Err(GuideError::ChannelClosed)
        ));
    }

    #[test]
    fn test_phd2_channel_loss_mid_run_aborts() {
        let channel = MemoryChannel::new();
        let closer = channel.clone();
        let mut backend = Phd2Backend::new(channel, GuideParameters::default());
        backend.start_guiding().unwrap();
        closer.close();
        let events = backend.handle_device_event(tick(5)).unwrap();
        assert_eq!(backend.state(), GuideState::Aborted);
        assert!(events
            .iter()
            .any(|e| matches!(e, GuideEvent::RunFailed { .. })));
    }

    #[test]
    fn test_linguider_command_lines() {
        let channel = MemoryChannel::new();
        let sent = channel.sent();
        let mut backend = LinGuiderBackend::new(channel);

        backend.start_calibration(false).unwrap();
        backend.stop_calibration().unwrap();
        backend.start_guiding().unwrap();
        backend
            .send_pulse(PulseCommand::new(GuideDirection::RaMinus, 250))
            .unwrap();

        let lines = sent.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec![
                "calibrate start",
                "calibrate stop",
                "guide start",
                "pulse ra- 250"
            ]
        );
    }

    #[test]
    fn test_linguider_translates_status() {
        let channel = MemoryChannel::new();
        channel.push_incoming("state calibrating");
        channel.push_incoming("state calibrated");
        channel.push_incoming("state guiding");
        channel.push_incoming("drift 1.25 -0.75");
        channel.push_incoming("log settling after dither");

        let mut backend = LinGuiderBackend::new(channel);
        let events = backend.handle_device_event(tick(1)).unwrap();

        assert_eq!(backend.state(), GuideState::Guiding);
        let deviation = backend.current_deviation().unwrap();
        assert_eq!(deviation.ra_arcsec, 1.25);
        assert_eq!(deviation.dec_arcsec, -0.75);
        assert!(events
            .iter()
            .any(|e| matches!(e, GuideEvent::Log(line) if line.contains("settling"))));
    }

    #[test]
    fn test_linguider_error_aborts() {
        let channel = MemoryChannel::new();
        channel.push_incoming("state guiding");
        channel.push_incoming("error guide star lost");
        let mut backend = LinGuiderBackend::new(channel);
        backend.start_guiding().unwrap();
        backend.handle_device_event(tick(1)).unwrap();
        assert_eq!(backend.state(), GuideState::Aborted);
    }
}
