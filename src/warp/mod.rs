//! Image resampling under a sampling transform
//!
//! The warper walks destination pixels, maps each through the *sampling*
//! transform (reference -> current, the inverse of what estimation returns)
//! and bilinearly interpolates the source. The per-pixel math lives behind
//! [`TransformKernel`] so the CPU and wgpu paths stay interchangeable.

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::raster::Raster;
use crate::transform::Transform;

pub use cpu::CpuKernel;
#[cfg(feature = "gpu")]
pub use gpu::GpuKernel;

/// Slack allowed outside `[0, extent - 1]` before a sample counts as outside
/// the source, absorbing round-off in near-identity transforms.
pub const SAMPLE_EPSILON: f64 = 1e-4;

/// Execution strategy for the warp kernels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Accelerator when available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Gpu,
}

/// Warp configuration, loaded from the `[warp]` config section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarpConfig {
    #[serde(default)]
    pub backend: Backend,
    /// External WGSL file replacing the packaged kernels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_source: Option<PathBuf>,
}

/// One resampling strategy over a single `f32` plane
pub trait TransformKernel {
    fn name(&self) -> &'static str;

    /// Resample `input` (`width * height`, row-major) through `sampling`,
    /// which maps destination pixel coordinates to source coordinates.
    fn warp_plane(
        &self,
        input: &[f32],
        width: usize,
        height: usize,
        sampling: &Transform,
    ) -> Result<Vec<f32>>;
}

/// Frame warper with strategy selection done once at construction
pub struct Warper {
    kernel: Box<dyn TransformKernel>,
    fallback: CpuKernel,
}

impl Warper {
    pub fn new(config: &WarpConfig) -> Self {
        let kernel: Box<dyn TransformKernel> = match config.backend {
            Backend::Cpu => Box::new(CpuKernel),
            Backend::Auto | Backend::Gpu => accelerated_or_cpu(config),
        };
        info!("Warp backend: {}", kernel.name());

        Self {
            kernel,
            fallback: CpuKernel,
        }
    }

    pub fn cpu() -> Self {
        Self {
            kernel: Box::new(CpuKernel),
            fallback: CpuKernel,
        }
    }

    pub fn with_kernel(kernel: Box<dyn TransformKernel>) -> Self {
        Self {
            kernel,
            fallback: CpuKernel,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Resample every channel of `source`; the output has the same size,
    /// channel count and element type.
    pub fn warp(&self, source: &Raster, sampling: &Transform) -> Result<Raster> {
        let (width, height) = (source.width(), source.height());
        let mut output = Raster::zeros(width, height, source.channels(), source.sample_type());

        for c in 0..source.channels() {
            let plane = source.channel_f32(c);
            let warped = match self.kernel.warp_plane(&plane, width, height, sampling) {
                Ok(warped) => warped,
                Err(e) => {
                    warn!("{} kernel failed ({}), resampling channel {} on the CPU", self.kernel.name(), e, c);
                    self.fallback.warp_plane(&plane, width, height, sampling)?
                }
            };
            output.set_channel_f32(c, &warped);
        }

        debug!("Warped {}x{}x{} frame", width, height, source.channels());
        Ok(output)
    }
}

#[cfg(feature = "gpu")]
fn accelerated_or_cpu(config: &WarpConfig) -> Box<dyn TransformKernel> {
    match GpuKernel::new(config.kernel_source.as_deref()) {
        Ok(kernel) => Box::new(kernel),
        Err(e) => {
            warn!("GPU warp unavailable ({}), using CPU", e);
            Box::new(CpuKernel)
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn accelerated_or_cpu(_config: &WarpConfig) -> Box<dyn TransformKernel> {
    warn!("Built without the `gpu` feature, using CPU warp");
    Box::new(CpuKernel)
}

/// Bilinear sample at `(u, v)`, or 0 outside the source
#[inline]
pub(crate) fn sample_bilinear(plane: &[f32], width: usize, height: usize, u: f64, v: f64) -> f32 {
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    if !(u >= -SAMPLE_EPSILON && u <= max_x + SAMPLE_EPSILON && v >= -SAMPLE_EPSILON && v <= max_y + SAMPLE_EPSILON) {
        return 0.0;
    }

    let u = u.clamp(0.0, max_x);
    let v = v.clamp(0.0, max_y);
    let x0 = u.floor() as usize;
    let y0 = v.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = (u - x0 as f64) as f32;
    let fy = (v - y0 as f64) as f32;

    let p00 = plane[y0 * width + x0];
    let p10 = plane[y0 * width + x1];
    let p01 = plane[y1 * width + x0];
    let p11 = plane[y1 * width + x1];

    p00 * (1.0 - fx) * (1.0 - fy) + p10 * fx * (1.0 - fy) + p01 * (1.0 - fx) * fy + p11 * fx * fy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{PixelData, SampleType};
    use crate::transform::{Affine, Homography};

    fn gradient_u16(width: usize, height: usize, channels: usize) -> Raster {
        let data = (0..width * height * channels)
            .map(|i| ((i * 37) % 65521) as u16)
            .collect();
        Raster::new(width, height, channels, PixelData::U16(data)).unwrap()
    }

    #[test]
    fn test_identity_is_exact_for_integers() {
        let src = gradient_u16(23, 17, 3);
        let out = Warper::cpu().warp(&src, &Transform::identity()).unwrap();
        assert_eq!(out, src);

        let perspective = Transform::Perspective(Homography::from_params([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]));
        let out = Warper::cpu().warp(&src, &perspective).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_identity_float() {
        let data: Vec<f32> = (0..64).map(|i| i as f32 * 0.37 - 5.0).collect();
        let src = Raster::new(8, 8, 1, PixelData::F32(data)).unwrap();
        let out = Warper::cpu().warp(&src, &Transform::identity()).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_translation_fills_black() {
        let src = Raster::new(4, 1, 1, PixelData::U8(vec![10, 20, 30, 40])).unwrap();
        // Sample one pixel to the left: out(x) = src(x - 1)
        let sampling = Transform::Affine(Affine::new([1.0, 0.0, -1.0, 0.0, 1.0, 0.0]));
        let out = Warper::cpu().warp(&src, &sampling).unwrap();
        assert_eq!(out.data(), &PixelData::U8(vec![0, 10, 20, 30]));
        assert_eq!(out.sample_type(), SampleType::U8);
    }

    #[test]
    fn test_half_pixel_interpolates() {
        let src = Raster::new(3, 1, 1, PixelData::F32(vec![0.0, 10.0, 20.0])).unwrap();
        let sampling = Transform::Affine(Affine::new([1.0, 0.0, 0.5, 0.0, 1.0, 0.0]));
        let out = Warper::cpu().warp(&src, &sampling).unwrap();
        assert_eq!(out.data(), &PixelData::F32(vec![5.0, 15.0, 0.0]));
    }

    #[test]
    fn test_sample_bilinear_bounds() {
        let plane = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(sample_bilinear(&plane, 2, 2, -0.5, 0.0), 0.0);
        assert_eq!(sample_bilinear(&plane, 2, 2, 1.0, 1.0), 4.0);
        assert_eq!(sample_bilinear(&plane, 2, 2, 1.00001, -0.00001), 2.0);
        assert_eq!(sample_bilinear(&plane, 2, 2, 0.5, 0.5), 2.5);
    }

    struct FailingKernel;

    impl TransformKernel for FailingKernel {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn warp_plane(&self, _: &[f32], _: usize, _: usize, _: &Transform) -> Result<Vec<f32>> {
            Err(crate::error::RegistrationError::Accelerator("device lost".into()))
        }
    }

    #[test]
    fn test_kernel_failure_falls_back_to_cpu() {
        let src = gradient_u16(9, 5, 2);
        let warper = Warper::with_kernel(Box::new(FailingKernel));
        assert_eq!(warper.backend_name(), "failing");
        let out = warper.warp(&src, &Transform::identity()).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_cpu_backend_selection() {
        let warper = Warper::new(&WarpConfig {
            backend: Backend::Cpu,
            kernel_source: None,
        });
        assert_eq!(warper.backend_name(), "cpu");
    }
}
