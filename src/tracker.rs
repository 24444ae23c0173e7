//! Guide star location and tracking.
//!
//! Two selection modes share one centroiding core: **manual** mode refines a
//! caller-supplied position inside the tracking box, **automatic** mode scans
//! the full frame for the best candidate, rejecting stars too close to the
//! frame edge or containing saturated pixels. When a master dark is loaded
//! and enabled it is subtracted before centroiding. The tracker never
//! mutates its inputs and carries no per-cycle state.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dark::MasterDark;

/// Errors produced while locating a star.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    /// No pixel cluster exceeded the quality threshold.
    #[error("no star found above quality threshold")]
    NoStarFound,

    /// The tracking box does not fit inside the frame.
    #[error("tracking box extends outside the frame")]
    BoxOutOfFrame,
}

/// A located guide star in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StarPosition {
    /// Sub-pixel x position (column)
    pub x: f64,
    /// Sub-pixel y position (row)
    pub y: f64,
    /// Background-subtracted flux
    pub flux: f64,
    /// Signal-to-noise quality metric
    pub snr: f64,
    /// RMS star width in pixels
    pub width: f64,
}

/// Tracker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Detection threshold in noise sigmas above background
    pub detection_sigma: f64,
    /// Minimum SNR for a usable star
    pub min_snr: f64,
    /// Pixel value treated as saturated (DN)
    pub saturation: f64,
    /// Minimum distance from the frame edge for automatic candidates
    pub min_edge_distance: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            detection_sigma: 5.0,
            min_snr: 3.0,
            saturation: 65535.0 * 0.95,
            min_edge_distance: 10.0,
        }
    }
}

/// Star centroid tracker.
#[derive(Debug, Default)]
pub struct StarTracker {
    config: TrackerConfig,
    dark: Option<MasterDark>,
}

impl StarTracker {
    /// Create a tracker with the given thresholds.
    pub fn new(config: TrackerConfig) -> Self {
        Self { config, dark: None }
    }

    /// Install or clear the master dark used when subtraction is enabled.
    pub fn set_dark(&mut self, dark: Option<MasterDark>) {
        self.dark = dark;
    }

    /// Currently installed master dark.
    pub fn dark(&self) -> Option<&MasterDark> {
        self.dark.as_ref()
    }

    /// Refine a star position by centroiding inside a box around `center`.
    ///
    /// `center` and the returned position are in the delivered frame's
    /// coordinates; `dark_origin` maps the delivered frame into the master
    /// dark when the frame is a subframe readout.
    pub fn track_in_box(
        &self,
        frame: &ArrayView2<u16>,
        center: (f64, f64),
        box_px: usize,
        use_dark: bool,
        dark_origin: (usize, usize),
    ) -> Result<StarPosition, TrackError> {
        let (height, width) = frame.dim();
        if box_px == 0 || box_px > width || box_px > height {
            return Err(TrackError::BoxOutOfFrame);
        }

        let data = self.prepare(frame, use_dark, dark_origin);

        // Two passes: the second recenters the box on the first centroid so
        // a star near the box edge is still measured symmetrically.
        let mut position = self.centroid_box(&data, center, box_px)?;
        position = self.centroid_box(&data, (position.x, position.y), box_px)?;

        if position.snr < self.config.min_snr {
            return Err(TrackError::NoStarFound);
        }
        Ok(position)
    }

    /// Scan the full frame for the best guide star candidate.
    ///
    /// Candidates are local maxima above the detection threshold, centroided
    /// and then filtered: too close to the frame edge, containing saturated
    /// pixels, or below the SNR floor. The brightest survivor wins.
    pub fn select_auto(
        &self,
        frame: &ArrayView2<u16>,
        use_dark: bool,
    ) -> Result<StarPosition, TrackError> {
        let (height, width) = frame.dim();
        let data = self.prepare(frame, use_dark, (0, 0));
        let (background, noise) = background_and_noise(&data.view());
        let threshold = background + self.config.detection_sigma * noise.max(1e-6);

        let candidates = local_maxima(&data.view(), threshold, 8);
        log::debug!(
            "auto-select: background {background:.1}, noise {noise:.1}, {} candidates",
            candidates.len()
        );

        let mut best: Option<StarPosition> = None;
        for &(row, col) in candidates.iter().take(64) {
            let seed = (col as f64, row as f64);
            let star = match self.centroid_box(&data, seed, 32.min(width).min(height)) {
                Ok(star) => star,
                Err(_) => continue,
            };

            let edge = self.config.min_edge_distance;
            if star.x < edge
                || star.y < edge
                || star.x > width as f64 - edge
                || star.y > height as f64 - edge
            {
                log::debug!(
                    "candidate at ({:.1}, {:.1}) rejected: too close to edge",
                    star.x,
                    star.y
                );
                continue;
            }
            if self.has_saturated_pixels(frame, (star.x, star.y), star.width.max(2.0) * 2.0) {
                log::debug!(
                    "candidate at ({:.1}, {:.1}) rejected: saturated pixels",
                    star.x,
                    star.y
                );
                continue;
            }
            if star.snr < self.config.min_snr {
                continue;
            }

            match &best {
                Some(current) if current.flux >= star.flux => {}
                _ => best = Some(star),
            }
        }

        best.ok_or(TrackError::NoStarFound)
    }

    /// Convert the frame to f64, subtracting the master dark when requested
    /// and available for this geometry.
    fn prepare(
        &self,
        frame: &ArrayView2<u16>,
        use_dark: bool,
        dark_origin: (usize, usize),
    ) -> Array2<f64> {
        if use_dark {
            if let Some(dark) = &self.dark {
                let (rows, cols) = frame.dim();
                let (dark_rows, dark_cols) = dark.dim();
                if dark_origin.1 + rows <= dark_rows && dark_origin.0 + cols <= dark_cols {
                    return dark.subtract(frame, dark_origin);
                }
                log::warn!("master dark does not cover the delivered frame, skipping subtraction");
            }
        }
        frame.mapv(|v| v as f64)
    }

    /// Weighted centroid over above-threshold pixels in a box.
    fn centroid_box(
        &self,
        data: &Array2<f64>,
        center: (f64, f64),
        box_px: usize,
    ) -> Result<StarPosition, TrackError> {
        let (height, width) = data.dim();
        let half = box_px as f64 / 2.0;
        let x_min = (center.0 - half).floor().max(0.0) as usize;
        let y_min = (center.1 - half).floor().max(0.0) as usize;
        let x_max = ((center.0 + half).ceil() as usize).min(width);
        let y_max = ((center.1 + half).ceil() as usize).min(height);
        if x_min >= x_max || y_min >= y_max {
            return Err(TrackError::BoxOutOfFrame);
        }

        let region = data.slice(ndarray::s![y_min..y_max, x_min..x_max]);
        let (background, noise) = perimeter_stats(&region);
        let threshold = background + self.config.detection_sigma * noise.max(1e-6);

        let mut flux = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut count = 0usize;
        for ((row, col), &value) in region.indexed_iter() {
            if value > threshold {
                let weight = value - background;
                flux += weight;
                sum_x += weight * (x_min + col) as f64;
                sum_y += weight * (y_min + row) as f64;
                count += 1;
            }
        }
        if count == 0 || flux <= 0.0 {
            return Err(TrackError::NoStarFound);
        }

        let cx = sum_x / flux;
        let cy = sum_y / flux;

        // Second central moments for the width estimate
        let mut m_xx = 0.0;
        let mut m_yy = 0.0;
        for ((row, col), &value) in region.indexed_iter() {
            if value > threshold {
                let weight = value - background;
                let dx = (x_min + col) as f64 - cx;
                let dy = (y_min + row) as f64 - cy;
                m_xx += weight * dx * dx;
                m_yy += weight * dy * dy;
            }
        }
        let width_rms = (((m_xx + m_yy) / flux) / 2.0).max(0.0).sqrt() * 2.0;

        let snr = flux / (noise.max(1e-6) * (count as f64).sqrt());

        Ok(StarPosition {
            x: cx,
            y: cy,
            flux,
            snr,
            width: width_rms.max(1.0),
        })
    }

    /// Whether any raw pixel within `radius` of the position is saturated.
    fn has_saturated_pixels(
        &self,
        frame: &ArrayView2<u16>,
        center: (f64, f64),
        radius: f64,
    ) -> bool {
        let (height, width) = frame.dim();
        let r = radius.ceil() as i64;
        let cx = center.0.round() as i64;
        let cy = center.1.round() as i64;
        for row in (cy - r).max(0)..(cy + r + 1).min(height as i64) {
            for col in (cx - r).max(0)..(cx + r + 1).min(width as i64) {
                if frame[[row as usize, col as usize]] as f64 >= self.config.saturation {
                    return true;
                }
            }
        }
        false
    }
}

/// Background and noise from a sparse sample grid over the frame.
fn background_and_noise(data: &ArrayView2<f64>) -> (f64, f64) {
    let (height, width) = data.dim();
    let total = (height * width) as f64;
    // Aim for ~256 samples regardless of frame size
    let stride = ((total / 256.0).sqrt() as usize).max(1);

    let mut samples = Vec::new();
    let mut row = 0;
    while row < height {
        let mut col = 0;
        while col < width {
            samples.push(data[[row, col]]);
            col += stride;
        }
        row += stride;
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Mean and standard deviation of a region's perimeter pixels, used as the
/// local background estimate for box centroiding.
fn perimeter_stats(region: &ArrayView2<f64>) -> (f64, f64) {
    let (height, width) = region.dim();
    let mut samples = Vec::with_capacity(2 * (height + width));
    for col in 0..width {
        samples.push(region[[0, col]]);
        samples.push(region[[height - 1, col]]);
    }
    for row in 1..height.saturating_sub(1) {
        samples.push(region[[row, 0]]);
        samples.push(region[[row, width - 1]]);
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Positions of local maxima above `threshold`, at least `separation` pixels
/// apart, brightest first.
fn local_maxima(data: &ArrayView2<f64>, threshold: f64, separation: usize) -> Vec<(usize, usize)> {
    let (height, width) = data.dim();
    let mut peaks: Vec<(usize, usize, f64)> = Vec::new();

    for row in 1..height.saturating_sub(1) {
        for col in 1..width.saturating_sub(1) {
            let value = data[[row, col]];
            if value <= threshold {
                continue;
            }
            let mut is_max = true;
            'neighbors: for dr in -1i64..=1 {
                for dc in -1i64..=1 {
                    if dr == 0 && dc == 0 {
                        continue;
                    }
                    let neighbor =
                        data[[(row as i64 + dr) as usize, (col as i64 + dc) as usize]];
                    if neighbor > value {
                        is_max = false;
                        break 'neighbors;
                    }
                }
            }
            if is_max {
                peaks.push((row, col, value));
            }
        }
    }

    peaks.sort_by(|a, b| b.2.partial_cmp(&a.2).expect("pixel values are finite"));

    let min_dist2 = (separation * separation) as f64;
    let mut kept: Vec<(usize, usize)> = Vec::new();
    for (row, col, _) in peaks {
        let far_enough = kept.iter().all(|&(kr, kc)| {
            let dr = row as f64 - kr as f64;
            let dc = col as f64 - kc as f64;
            dr * dr + dc * dc >= min_dist2
        });
        if far_enough {
            kept.push((row, col));
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    /// Noise-free Gaussian star on a flat pedestal.
    fn star_frame(
        shape: (usize, usize),
        stars: &[(f64, f64, f64)],
        pedestal: f64,
        sigma: f64,
    ) -> Array2<u16> {
        let mut image = Array2::<f64>::from_elem(shape, pedestal);
        for &(x, y, peak) in stars {
            for ((row, col), value) in image.indexed_iter_mut() {
                let dx = col as f64 - x;
                let dy = row as f64 - y;
                *value += peak * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
        }
        image.mapv(|v| v.round().min(65535.0) as u16)
    }

    #[test]
    fn test_manual_centroid_accuracy() {
        let frame = star_frame((64, 64), &[(30.4, 33.7, 4000.0)], 100.0, 1.8);
        let tracker = StarTracker::default();
        let star = tracker
            .track_in_box(&frame.view(), (30.0, 34.0), 16, false, (0, 0))
            .unwrap();
        assert_relative_eq!(star.x, 30.4, epsilon = 0.15);
        assert_relative_eq!(star.y, 33.7, epsilon = 0.15);
        assert!(star.snr > 3.0);
        assert!(star.flux > 0.0);
    }

    #[test]
    fn test_no_star_in_flat_frame() {
        let frame = Array2::<u16>::from_elem((64, 64), 100);
        let tracker = StarTracker::default();
        assert_eq!(
            tracker.track_in_box(&frame.view(), (32.0, 32.0), 16, false, (0, 0)),
            Err(TrackError::NoStarFound)
        );
        assert_eq!(
            tracker.select_auto(&frame.view(), false),
            Err(TrackError::NoStarFound)
        );
    }

    #[test]
    fn test_box_out_of_frame() {
        let frame = Array2::<u16>::zeros((16, 16));
        let tracker = StarTracker::default();
        assert_eq!(
            tracker.track_in_box(&frame.view(), (8.0, 8.0), 32, false, (0, 0)),
            Err(TrackError::BoxOutOfFrame)
        );
    }

    #[test]
    fn test_tracking_follows_moved_star() {
        let tracker = StarTracker::default();
        let first = star_frame((64, 64), &[(32.0, 32.0, 3000.0)], 50.0, 1.8);
        let star = tracker
            .track_in_box(&first.view(), (32.0, 32.0), 16, false, (0, 0))
            .unwrap();

        // star drifts 3 px; box recentering keeps the lock
        let moved = star_frame((64, 64), &[(35.0, 32.5, 3000.0)], 50.0, 1.8);
        let tracked = tracker
            .track_in_box(&moved.view(), (star.x, star.y), 16, false, (0, 0))
            .unwrap();
        assert_relative_eq!(tracked.x, 35.0, epsilon = 0.2);
        assert_relative_eq!(tracked.y, 32.5, epsilon = 0.2);
    }

    #[test]
    fn test_auto_select_prefers_brightest() {
        let frame = star_frame(
            (128, 128),
            &[(40.0, 40.0, 2000.0), (90.0, 85.0, 6000.0)],
            80.0,
            1.8,
        );
        let tracker = StarTracker::default();
        let star = tracker.select_auto(&frame.view(), false).unwrap();
        assert_relative_eq!(star.x, 90.0, epsilon = 0.5);
        assert_relative_eq!(star.y, 85.0, epsilon = 0.5);
    }

    #[test]
    fn test_auto_select_rejects_edge_and_saturated() {
        // brightest candidate sits on the edge, second is saturated;
        // the modest clean star must win
        let mut frame = star_frame(
            (128, 128),
            &[(3.0, 64.0, 8000.0), (64.0, 64.0, 2000.0)],
            80.0,
            1.8,
        );
        // saturate a cluster near (100, 100)
        for row in 98..103 {
            for col in 98..103 {
                frame[[row, col]] = 65535;
            }
        }
        let tracker = StarTracker::default();
        let star = tracker.select_auto(&frame.view(), false).unwrap();
        assert_relative_eq!(star.x, 64.0, epsilon = 0.5);
        assert_relative_eq!(star.y, 64.0, epsilon = 0.5);
    }

    #[test]
    fn test_dark_subtraction_removes_hot_pixel() {
        // a hot pixel brighter than the star, present in the dark as well
        let mut light = star_frame((64, 64), &[(20.0, 20.0, 3000.0)], 50.0, 1.8);
        light[[48, 48]] = 20000;
        let mut dark_frame = Array2::<u16>::from_elem((64, 64), 50);
        dark_frame[[48, 48]] = 20000;

        let mut tracker = StarTracker::default();
        tracker.set_dark(MasterDark::from_frames(
            &[dark_frame],
            Duration::from_secs(1),
        ));

        let star = tracker.select_auto(&light.view(), true).unwrap();
        assert_relative_eq!(star.x, 20.0, epsilon = 0.5);
        assert_relative_eq!(star.y, 20.0, epsilon = 0.5);

        // without subtraction the hot pixel is the brightest "star"
        let wrong = tracker.select_auto(&light.view(), false).unwrap();
        assert!((wrong.x - 48.0).abs() < 2.0);
    }

    #[test]
    fn test_width_drives_box_choice() {
        use crate::config::BoxSize;
        let narrow = star_frame((64, 64), &[(32.0, 32.0, 4000.0)], 50.0, 1.2);
        let wide = star_frame((64, 64), &[(32.0, 32.0, 4000.0)], 50.0, 4.0);
        let tracker = StarTracker::default();
        let narrow_star = tracker
            .track_in_box(&narrow.view(), (32.0, 32.0), 32, false, (0, 0))
            .unwrap();
        let wide_star = tracker
            .track_in_box(&wide.view(), (32.0, 32.0), 32, false, (0, 0))
            .unwrap();
        assert!(wide_star.width > narrow_star.width);
        assert!(
            BoxSize::for_star_width(wide_star.width).pixels()
                >= BoxSize::for_star_width(narrow_star.width).pixels()
        );
    }
}
