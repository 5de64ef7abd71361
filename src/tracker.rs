//! Patch-based point tracking between consecutive frames
//!
//! Each point is tracked independently: a square window around it is cut
//! from both frames, the translation aligning the current patch onto the
//! previous one is estimated per channel, and the channel average is
//! subtracted from the point position.

use std::sync::Arc;

use nalgebra::{Point2, Vector2};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::raster::Raster;

/// Tracker tuning, loaded from the `[tracker]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Side of the square patch cut around each point
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    /// Minimum correlation peak accepted as a match
    #[serde(default = "default_min_peak")]
    pub min_peak: f32,
    /// Apply a Hann window before correlating
    #[serde(default = "default_windowing")]
    pub windowing: bool,
    /// Gradient refinement steps after the integer correlation peak
    #[serde(default = "default_refine_iterations")]
    pub refine_iterations: usize,
}

fn default_patch_size() -> usize {
    32
}

fn default_min_peak() -> f32 {
    0.02
}

fn default_windowing() -> bool {
    true
}

fn default_refine_iterations() -> usize {
    20
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            patch_size: default_patch_size(),
            min_peak: default_min_peak(),
            windowing: default_windowing(),
            refine_iterations: default_refine_iterations(),
        }
    }
}

/// Estimates the rigid shift that aligns `target` onto `reference`.
///
/// Both patches are `size * size` row-major samples. The returned vector
/// `t` satisfies `target(p - t) ~= reference(p)`.
pub trait PatchTranslation {
    fn translation(&self, reference: &[f32], target: &[f32], size: usize) -> Option<Vector2<f64>>;
}

/// Spectrum bins weaker than this fraction of the strongest bin carry no
/// reliable phase and are dropped instead of whitened.
const SPECTRUM_FLOOR: f32 = 1e-3;

/// Refinement stops once a step is shorter than this, in pixels
const REFINE_EPSILON: f64 = 1e-4;

/// FFT phase correlation for the integer shift, then Lucas-Kanade style
/// gradient refinement for the sub-pixel part.
pub struct PhaseCorrelator {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    min_peak: f32,
    refine_iterations: usize,
}

impl PhaseCorrelator {
    pub fn new(size: usize, config: &TrackerConfig) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);

        let window = if config.windowing {
            hann_window(size)
        } else {
            vec![1.0; size]
        };

        Self {
            size,
            forward,
            inverse,
            window,
            min_peak: config.min_peak,
            refine_iterations: config.refine_iterations,
        }
    }

    /// Windowed spectrum of the zero-mean patch
    fn fft_2d(&self, patch: &[f32]) -> Vec<Complex<f32>> {
        let n = self.size;
        let mean = patch.iter().sum::<f32>() / patch.len() as f32;
        let mut data: Vec<Complex<f32>> = patch
            .iter()
            .enumerate()
            .map(|(i, &v)| Complex::new((v - mean) * self.window[i % n] * self.window[i / n], 0.0))
            .collect();

        for row in data.chunks_exact_mut(n) {
            self.forward.process(row);
        }
        transpose_inplace(&mut data, n);
        for row in data.chunks_exact_mut(n) {
            self.forward.process(row);
        }
        transpose_inplace(&mut data, n);

        data
    }

    fn ifft_2d(&self, mut data: Vec<Complex<f32>>) -> Vec<f32> {
        let n = self.size;

        for row in data.chunks_exact_mut(n) {
            self.inverse.process(row);
        }
        transpose_inplace(&mut data, n);
        for row in data.chunks_exact_mut(n) {
            self.inverse.process(row);
        }
        transpose_inplace(&mut data, n);

        let norm = 1.0 / (n * n) as f32;
        data.iter().map(|c| c.re * norm).collect()
    }

    /// Refine the displacement `d` with `target(p + d) ~= reference(p)` by
    /// Gauss-Newton steps on the windowed squared difference.
    ///
    /// Returns `None` when the patch has no gradient structure or the
    /// refinement wanders more than a pixel away from the starting estimate.
    fn refine(&self, reference: &[f32], target: &[f32], start: Vector2<f64>) -> Option<Vector2<f64>> {
        let n = self.size;
        let at = |x: usize, y: usize| reference[y * n + x] as f64;

        let mut d = start;
        for _ in 0..self.refine_iterations {
            let (mut gxx, mut gxy, mut gyy, mut bx, mut by) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for y in 1..n - 1 {
                for x in 1..n - 1 {
                    let w = (self.window[x] * self.window[y]) as f64;
                    if w <= 0.0 {
                        continue;
                    }
                    let Some(sample) = sample_patch(target, n, x as f64 + d.x, y as f64 + d.y) else {
                        continue;
                    };
                    let ix = 0.5 * (at(x + 1, y) - at(x - 1, y));
                    let iy = 0.5 * (at(x, y + 1) - at(x, y - 1));
                    let e = sample - at(x, y);

                    gxx += w * ix * ix;
                    gxy += w * ix * iy;
                    gyy += w * iy * iy;
                    bx += w * ix * e;
                    by += w * iy * e;
                }
            }

            // Solve [gxx gxy; gxy gyy] * step = -[bx; by]
            let det = gxx * gyy - gxy * gxy;
            if det.abs() < 1e-12 {
                return None;
            }
            let step = Vector2::new(-(gyy * bx - gxy * by) / det, -(gxx * by - gxy * bx) / det);
            d += step;

            if (d - start).norm() > 1.0 {
                return None;
            }
            if step.norm() < REFINE_EPSILON {
                break;
            }
        }

        Some(d)
    }
}

/// Bilinear sample inside a square patch, `None` outside it
fn sample_patch(patch: &[f32], n: usize, x: f64, y: f64) -> Option<f64> {
    let max = (n - 1) as f64;
    if !(0.0..=max).contains(&x) || !(0.0..=max).contains(&y) {
        return None;
    }
    let x0 = (x.floor() as usize).min(n - 2);
    let y0 = (y.floor() as usize).min(n - 2);
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);
    let p = |xx: usize, yy: usize| patch[yy * n + xx] as f64;

    Some(
        p(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + p(x0 + 1, y0) * fx * (1.0 - fy)
            + p(x0, y0 + 1) * (1.0 - fx) * fy
            + p(x0 + 1, y0 + 1) * fx * fy,
    )
}

impl PatchTranslation for PhaseCorrelator {
    fn translation(&self, reference: &[f32], target: &[f32], size: usize) -> Option<Vector2<f64>> {
        if size != self.size || reference.len() != size * size || target.len() != size * size {
            return None;
        }

        let ref_fft = self.fft_2d(reference);
        let tar_fft = self.fft_2d(target);

        let products: Vec<Complex<f32>> = ref_fft.iter().zip(&tar_fft).map(|(&r, &t)| r * t.conj()).collect();
        let strongest = products.iter().map(|c| c.norm()).fold(0.0f32, f32::max);
        if strongest <= 0.0 {
            return None;
        }

        // Normalized cross-power spectrum R * conj(T) / |R * conj(T)| over
        // the bins that carry energy
        let floor = strongest * SPECTRUM_FLOOR;
        let cross: Vec<Complex<f32>> = products
            .into_iter()
            .map(|product| {
                let magnitude = product.norm();
                if magnitude > floor {
                    product / magnitude
                } else {
                    Complex::new(0.0, 0.0)
                }
            })
            .collect();

        let surface = self.ifft_2d(cross);

        let (peak_idx, &peak_val) = surface
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        if peak_val < self.min_peak {
            return None;
        }

        let n = size;
        let (px, py) = (peak_idx % n, peak_idx / n);
        let wrap = |p: usize| if p > n / 2 { p as f64 - n as f64 } else { p as f64 };

        // The peak sits at -d for content displaced by d
        let coarse = Vector2::new(-wrap(px), -wrap(py));
        let displacement = if self.refine_iterations == 0 {
            coarse
        } else {
            self.refine(reference, target, coarse).unwrap_or(coarse)
        };

        Some(-displacement)
    }
}

/// Tracks a fixed-size point set from one frame to the next
pub struct PointTracker {
    patch_size: usize,
    estimator: Box<dyn PatchTranslation + Send + Sync>,
}

impl PointTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        let patch_size = config.patch_size.max(4);
        Self {
            patch_size,
            estimator: Box::new(PhaseCorrelator::new(patch_size, config)),
        }
    }

    /// Use a custom translation primitive
    pub fn with_estimator(
        patch_size: usize,
        estimator: Box<dyn PatchTranslation + Send + Sync>,
    ) -> Self {
        Self {
            patch_size,
            estimator,
        }
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Update `points` in place; never reorders or resizes the slice.
    ///
    /// Returns the number of points that were actually moved.
    pub fn track(&self, prev: &Raster, curr: &Raster, points: &mut [Point2<f64>]) -> usize {
        let channels = prev.channels().min(curr.channels());
        let prev_planes: Vec<Vec<f32>> = (0..channels).map(|c| prev.channel_f32(c)).collect();
        let curr_planes: Vec<Vec<f32>> = (0..channels).map(|c| curr.channel_f32(c)).collect();

        let mut tracked = 0;
        for (index, point) in points.iter_mut().enumerate() {
            let (Some(origin_prev), Some(origin_curr)) = (
                self.window_origin(prev, *point),
                self.window_origin(curr, *point),
            ) else {
                debug!("Point {} at ({:.1}, {:.1}) too close to the border, not tracked", index, point.x, point.y);
                continue;
            };

            let mut sum = Vector2::zeros();
            let mut count = 0usize;
            for c in 0..channels {
                let a = extract_patch(&prev_planes[c], prev.width(), origin_prev, self.patch_size);
                let b = extract_patch(&curr_planes[c], curr.width(), origin_curr, self.patch_size);
                if let Some(t) = self.estimator.translation(&a, &b, self.patch_size) {
                    sum += t;
                    count += 1;
                }
            }

            if count == 0 {
                debug!("Point {}: no channel produced a correlation peak", index);
                continue;
            }

            let shift = sum / count as f64;
            *point -= shift;
            tracked += 1;
        }

        tracked
    }

    /// Top-left corner of the patch around `p`, if it fits in the frame
    fn window_origin(&self, frame: &Raster, p: Point2<f64>) -> Option<(usize, usize)> {
        if !p.x.is_finite() || !p.y.is_finite() {
            return None;
        }
        let half = (self.patch_size / 2) as isize;
        let x0 = p.x.round() as isize - half;
        let y0 = p.y.round() as isize - half;
        let size = self.patch_size as isize;
        if x0 < 0 || y0 < 0 || x0 + size > frame.width() as isize || y0 + size > frame.height() as isize {
            return None;
        }
        Some((x0 as usize, y0 as usize))
    }
}

fn extract_patch(plane: &[f32], width: usize, (x0, y0): (usize, usize), size: usize) -> Vec<f32> {
    let mut patch = Vec::with_capacity(size * size);
    for y in y0..y0 + size {
        let start = y * width + x0;
        patch.extend_from_slice(&plane[start..start + size]);
    }
    patch
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let t = std::f32::consts::PI * 2.0 * i as f32 / size as f32;
            0.5 * (1.0 - t.cos())
        })
        .collect()
}

fn transpose_inplace(data: &mut [Complex<f32>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::PixelData;

    /// Smooth blob field so correlation has a single clear peak
    fn blob_frame(width: usize, height: usize, centers: &[(f64, f64)]) -> Raster {
        let mut data = vec![0.0f32; width * height];
        for y in 0..height {
            for x in 0..width {
                let mut v = 0.0;
                for &(cx, cy) in centers {
                    let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                    v += 200.0 * (-d2 / 18.0).exp();
                }
                data[y * width + x] = v as f32;
            }
        }
        Raster::new(width, height, 1, PixelData::F32(data)).unwrap()
    }

    #[test]
    fn test_identical_frames_do_not_move_points() {
        let frame = blob_frame(96, 96, &[(44.0, 47.0), (52.0, 41.0), (40.0, 55.0)]);
        let tracker = PointTracker::new(&TrackerConfig::default());
        let mut points = vec![Point2::new(48.0, 48.0)];
        let moved = tracker.track(&frame, &frame, &mut points);
        assert_eq!(moved, 1);
        assert!((points[0].x - 48.0).abs() < 1e-3);
        assert!((points[0].y - 48.0).abs() < 1e-3);
    }

    const CENTERS: [(f64, f64); 3] = [(44.0, 47.0), (52.0, 41.0), (40.0, 55.0)];

    /// Where the tracker puts a point at (47, 48) after the blobs move by `(dx, dy)`
    fn track_shift(config: &TrackerConfig, dx: f64, dy: f64) -> Point2<f64> {
        let prev = blob_frame(96, 96, &CENTERS);
        let moved: Vec<_> = CENTERS.iter().map(|&(x, y)| (x + dx, y + dy)).collect();
        let curr = blob_frame(96, 96, &moved);

        let tracker = PointTracker::new(config);
        let mut points = vec![Point2::new(47.0, 48.0)];
        assert_eq!(tracker.track(&prev, &curr, &mut points), 1);
        points[0]
    }

    #[test]
    fn test_follows_integer_shifts() {
        let config = TrackerConfig::default();
        for (dx, dy) in [(1.0, 0.0), (0.0, 1.0), (0.0, -1.0), (2.0, 1.0), (3.0, -2.0)] {
            let p = track_shift(&config, dx, dy);
            assert!((p.x - (47.0 + dx)).abs() < 0.1, "shift ({}, {}): x = {}", dx, dy, p.x);
            assert!((p.y - (48.0 + dy)).abs() < 0.1, "shift ({}, {}): y = {}", dx, dy, p.y);
        }
    }

    #[test]
    fn test_follows_subpixel_shifts() {
        let config = TrackerConfig::default();
        for (dx, dy) in [(0.4, -0.3), (-0.5, 0.5), (1.25, 0.75)] {
            let p = track_shift(&config, dx, dy);
            assert!((p.x - (47.0 + dx)).abs() < 0.1, "shift ({}, {}): x = {}", dx, dy, p.x);
            assert!((p.y - (48.0 + dy)).abs() < 0.1, "shift ({}, {}): y = {}", dx, dy, p.y);
        }
    }

    #[test]
    fn test_integer_peak_without_refinement() {
        let config = TrackerConfig {
            refine_iterations: 0,
            ..TrackerConfig::default()
        };
        let p = track_shift(&config, 2.0, 1.0);
        assert_eq!(p, Point2::new(49.0, 49.0));
    }

    #[test]
    fn test_sample_patch() {
        let patch: Vec<f32> = (0..16).map(|i| i as f32).collect();
        assert_eq!(sample_patch(&patch, 4, 1.0, 2.0), Some(9.0));
        assert_eq!(sample_patch(&patch, 4, 3.0, 3.0), Some(15.0));
        assert!((sample_patch(&patch, 4, 0.5, 0.5).unwrap() - 2.5).abs() < 1e-12);
        assert_eq!(sample_patch(&patch, 4, -0.1, 0.0), None);
        assert_eq!(sample_patch(&patch, 4, 0.0, 3.1), None);
    }

    #[test]
    fn test_border_points_untouched() {
        let frame = blob_frame(64, 64, &[(32.0, 32.0)]);
        let tracker = PointTracker::new(&TrackerConfig::default());
        let mut points = vec![Point2::new(5.0, 5.0), Point2::new(60.0, 32.0), Point2::new(32.0, 32.0)];
        let moved = tracker.track(&frame, &frame, &mut points);
        assert_eq!(moved, 1);
        assert_eq!(points[0], Point2::new(5.0, 5.0));
        assert_eq!(points[1], Point2::new(60.0, 32.0));
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn test_flat_patch_leaves_point() {
        let frame = Raster::zeros(64, 64, 1, crate::raster::SampleType::U8);
        let tracker = PointTracker::new(&TrackerConfig::default());
        let mut points = vec![Point2::new(32.0, 32.0)];
        assert_eq!(tracker.track(&frame, &frame, &mut points), 0);
        assert_eq!(points[0], Point2::new(32.0, 32.0));
    }

    struct FixedShift(Vector2<f64>);

    impl PatchTranslation for FixedShift {
        fn translation(&self, _: &[f32], _: &[f32], _: usize) -> Option<Vector2<f64>> {
            Some(self.0)
        }
    }

    #[test]
    fn test_update_subtracts_translation() {
        let frame = Raster::zeros(64, 64, 2, crate::raster::SampleType::U16);
        let tracker = PointTracker::with_estimator(32, Box::new(FixedShift(Vector2::new(1.5, -2.0))));
        let mut points = vec![Point2::new(32.0, 32.0)];
        tracker.track(&frame, &frame, &mut points);
        assert_eq!(points[0], Point2::new(30.5, 34.0));
    }

    #[test]
    fn test_hann_window() {
        let w = hann_window(8);
        assert_eq!(w.len(), 8);
        assert!(w[0].abs() < 1e-6);
        assert!((w[4] - 1.0).abs() < 1e-6);
    }
}
