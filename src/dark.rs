//! Master dark construction and subtraction.
//!
//! A master dark is the per-pixel mean of several zero-light exposures taken
//! at the guide exposure duration. Subtracting it before centroiding removes
//! hot pixels and the thermal pedestal that would otherwise bias the
//! centroid or masquerade as a guide star.

use ndarray::{Array2, ArrayView2};
use std::time::Duration;

/// Per-pixel mean of a set of matching dark exposures.
#[derive(Debug, Clone)]
pub struct MasterDark {
    data: Array2<f64>,
    exposure: Duration,
}

impl MasterDark {
    /// Build a master dark from one or more frames of identical dimensions.
    ///
    /// Returns `None` for an empty slice or mismatched dimensions.
    pub fn from_frames(frames: &[Array2<u16>], exposure: Duration) -> Option<Self> {
        let first = frames.first()?;
        let shape = first.dim();
        if frames.iter().any(|f| f.dim() != shape) {
            return None;
        }

        let mut sum = Array2::<f64>::zeros(shape);
        for frame in frames {
            for ((i, j), value) in frame.indexed_iter() {
                sum[[i, j]] += *value as f64;
            }
        }
        sum /= frames.len() as f64;

        Some(Self {
            data: sum,
            exposure,
        })
    }

    /// Exposure the dark was captured at.
    pub fn exposure(&self) -> Duration {
        self.exposure
    }

    /// Whether the dark is usable for a light frame of the given exposure.
    /// Dark current scales with time, so only a close match (within 10%) is
    /// accepted.
    pub fn matches_exposure(&self, exposure: Duration) -> bool {
        let dark_s = self.exposure.as_secs_f64();
        let light_s = exposure.as_secs_f64();
        if dark_s <= 0.0 || light_s <= 0.0 {
            return false;
        }
        (dark_s - light_s).abs() / light_s <= 0.10
    }

    /// Dark dimensions (rows, cols).
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Subtract the dark from a light frame, clamping at zero.
    ///
    /// For subframed light frames the caller passes the dark region matching
    /// the readout window via `origin` (column, row of the window's corner).
    pub fn subtract(&self, frame: &ArrayView2<u16>, origin: (usize, usize)) -> Array2<f64> {
        let (ox, oy) = origin;
        Array2::from_shape_fn(frame.dim(), |(row, col)| {
            let dark_value = self
                .data
                .get([row + oy, col + ox])
                .copied()
                .unwrap_or(0.0);
            (frame[[row, col]] as f64 - dark_value).max(0.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_master_dark_is_per_pixel_mean() {
        let d1 = Array2::<u16>::from_elem((4, 4), 100);
        let d2 = Array2::<u16>::from_elem((4, 4), 200);
        let dark = MasterDark::from_frames(&[d1, d2], Duration::from_secs(1)).unwrap();
        assert_relative_eq!(dark.data[[0, 0]], 150.0);
        assert_relative_eq!(dark.data[[3, 3]], 150.0);
    }

    #[test]
    fn test_from_frames_rejects_mismatched_shapes() {
        let d1 = Array2::<u16>::zeros((4, 4));
        let d2 = Array2::<u16>::zeros((8, 8));
        assert!(MasterDark::from_frames(&[d1, d2], Duration::from_secs(1)).is_none());
        assert!(MasterDark::from_frames(&[], Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_subtract_removes_pedestal_and_clamps() {
        let dark = MasterDark::from_frames(
            &[Array2::<u16>::from_elem((4, 4), 50)],
            Duration::from_secs(1),
        )
        .unwrap();

        let mut light = Array2::<u16>::from_elem((4, 4), 60);
        light[[1, 1]] = 20; // below the pedestal
        let cleaned = dark.subtract(&light.view(), (0, 0));
        assert_relative_eq!(cleaned[[0, 0]], 10.0);
        assert_relative_eq!(cleaned[[1, 1]], 0.0);
    }

    #[test]
    fn test_subtract_with_subframe_origin() {
        let mut full_dark = Array2::<u16>::zeros((8, 8));
        full_dark[[5, 6]] = 40;
        let dark = MasterDark::from_frames(&[full_dark], Duration::from_secs(1)).unwrap();

        // 2x2 window whose corner sits at column 6, row 5
        let light = Array2::<u16>::from_elem((2, 2), 100);
        let cleaned = dark.subtract(&light.view(), (6, 5));
        assert_relative_eq!(cleaned[[0, 0]], 60.0);
        assert_relative_eq!(cleaned[[1, 1]], 100.0);
    }

    #[test]
    fn test_exposure_matching_window() {
        let dark = MasterDark::from_frames(
            &[Array2::<u16>::zeros((2, 2))],
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(dark.matches_exposure(Duration::from_secs(2)));
        assert!(dark.matches_exposure(Duration::from_millis(2100)));
        assert!(!dark.matches_exposure(Duration::from_secs(1)));
    }
}
