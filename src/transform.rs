//! Geometric transforms between frame coordinates
//!
//! A transform is either an 8-DOF homography (exactly four correspondences)
//! or a 6-parameter affine map. Both are stored as a row-major 3x3 matrix so
//! inversion and kernel upload share one representation.

use nalgebra::{Matrix3, Point2};
use serde::Serialize;

use crate::linalg::invert3;

/// Homogeneous weight below which a point is left where it is.
const W_EPSILON: f64 = 1e-10;

/// Perspective transformation matrix (3x3 homography), normalized so h[8] = 1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    /// Build from the eight DLT unknowns, fixing h8 to 1
    pub fn from_params(h: [f64; 8]) -> Self {
        Self {
            matrix: Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0),
        }
    }

    /// Wrap an arbitrary matrix, rescaling so the bottom-right entry is 1
    /// whenever it is not vanishingly small.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        let h8 = matrix[(2, 2)];
        let matrix = if h8.abs() > W_EPSILON {
            matrix / h8
        } else {
            matrix
        };
        Self { matrix }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }
}

/// Affine transform `u = a*x + b*y + c`, `v = d*x + e*y + f`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    /// Row-major 2x3 coefficients `[a, b, c, d, e, f]`
    pub coeffs: [f64; 6],
}

impl Affine {
    pub const IDENTITY: Affine = Affine {
        coeffs: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    };

    pub fn new(coeffs: [f64; 6]) -> Self {
        Self { coeffs }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        let c = &self.coeffs;
        Matrix3::new(c[0], c[1], c[2], c[3], c[4], c[5], 0.0, 0.0, 1.0)
    }
}

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Kind tag used in run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Perspective,
    Affine,
}

/// A planar transform, selected structurally by correspondence count
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Perspective(Homography),
    Affine(Affine),
}

impl Transform {
    pub fn identity() -> Self {
        Transform::Affine(Affine::IDENTITY)
    }

    pub fn kind(&self) -> TransformKind {
        match self {
            Transform::Perspective(_) => TransformKind::Perspective,
            Transform::Affine(_) => TransformKind::Affine,
        }
    }

    /// Row-major 3x3 matrix; affine transforms have a `[0, 0, 1]` last row
    pub fn matrix(&self) -> Matrix3<f64> {
        match self {
            Transform::Perspective(h) => *h.matrix(),
            Transform::Affine(a) => a.matrix(),
        }
    }

    /// Row-major coefficients, the layout handed to warp kernels
    pub fn coefficients(&self) -> [f64; 9] {
        let m = self.matrix();
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    /// Map a point through the transform
    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        let (x, y) = self.apply_xy(p.x, p.y);
        Point2::new(x, y)
    }

    #[inline]
    pub fn apply_xy(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Transform::Perspective(h) => apply_homography(h.matrix(), x, y),
            Transform::Affine(a) => {
                let c = &a.coeffs;
                (c[0] * x + c[1] * y + c[2], c[3] * x + c[4] * y + c[5])
            }
        }
    }

    /// Inverse transform, `None` if the matrix is not invertible.
    ///
    /// Estimation yields a current -> reference map; warping iterates
    /// reference pixels and needs reference -> current, i.e. this inverse.
    pub fn inverse(&self) -> Option<Transform> {
        let inv = invert3(&self.matrix())?;
        Some(match self {
            Transform::Perspective(_) => Transform::Perspective(Homography::from_matrix(inv)),
            Transform::Affine(_) => Transform::Affine(Affine::new([
                inv[(0, 0)],
                inv[(0, 1)],
                inv[(0, 2)],
                inv[(1, 0)],
                inv[(1, 1)],
                inv[(1, 2)],
            ])),
        })
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        let m = self.matrix();
        (m - Matrix3::identity()).iter().all(|v| v.abs() <= tolerance)
    }
}

/// Apply a homography matrix to a point
#[inline]
fn apply_homography(h: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
    if w.abs() < W_EPSILON {
        return (x, y); // Avoid division by zero
    }
    let xp = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w;
    let yp = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w;
    (xp, yp)
}
