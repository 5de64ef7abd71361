//! Software warp kernel

use rayon::prelude::*;

use super::{sample_bilinear, TransformKernel};
use crate::error::Result;
use crate::transform::Transform;

/// Row-parallel destination walk on the CPU
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernel;

impl TransformKernel for CpuKernel {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn warp_plane(
        &self,
        input: &[f32],
        width: usize,
        height: usize,
        sampling: &Transform,
    ) -> Result<Vec<f32>> {
        let mut output = vec![0.0f32; width * height];
        if output.is_empty() {
            return Ok(output);
        }

        output
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    // Map destination pixel to source coordinates
                    let (u, v) = sampling.apply_xy(x as f64, y as f64);
                    *out = sample_bilinear(input, width, height, u, v);
                }
            });

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{Affine, Homography};

    #[test]
    fn test_affine_and_perspective_agree() {
        let (w, h) = (31, 19);
        let input: Vec<f32> = (0..w * h).map(|i| ((i * 7919) % 251) as f32).collect();

        let coeffs = [0.98, 0.05, 1.7, -0.04, 1.02, -0.6];
        let affine = Transform::Affine(Affine::new(coeffs));
        let perspective = Transform::Perspective(Homography::from_params([
            coeffs[0], coeffs[1], coeffs[2], coeffs[3], coeffs[4], coeffs[5], 0.0, 0.0,
        ]));

        let a = CpuKernel.warp_plane(&input, w, h, &affine).unwrap();
        let p = CpuKernel.warp_plane(&input, w, h, &perspective).unwrap();
        for (x, y) in a.iter().zip(&p) {
            assert!((x - y).abs() < 1e-3);
        }
    }

    #[test]
    fn test_empty_plane() {
        let out = CpuKernel.warp_plane(&[], 0, 0, &Transform::identity()).unwrap();
        assert!(out.is_empty());
    }
}
