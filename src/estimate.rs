//! Transform estimation from point correspondences
//!
//! Exactly four correspondences yield a homography through the Direct Linear
//! Transform; any other count falls back to a least-squares affine fit.
//! Callers pass `src = current points`, `dst = reference points`.

use nalgebra::Point2;

use crate::linalg::{determinant3, solve, DET_EPSILON};
use crate::transform::{Affine, Homography, Transform};

/// Estimate a transform mapping `src[i]` onto `dst[i]`.
///
/// Returns `None` only for a degenerate four-point configuration; the affine
/// path always produces a transform (identity when it cannot fit).
pub fn estimate(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Transform> {
    if src.len() == 4 && dst.len() == 4 {
        compute_homography(src, dst).map(Transform::Perspective)
    } else {
        Some(Transform::Affine(compute_affine(src, dst)))
    }
}

/// Compute a 3x3 homography matrix from 4 point correspondences
/// using the Direct Linear Transform (DLT) algorithm
///
/// `None` when the system is singular or the assembled matrix has
/// `|det| <= DET_EPSILON`.
pub fn compute_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Homography> {
    if src.len() != 4 || dst.len() != 4 {
        return None;
    }

    // For each correspondence (x,y) -> (u,v), with h8 fixed to 1:
    //   x*h0 + y*h1 + h2 - u*x*h6 - u*y*h7 = u
    //   x*h3 + y*h4 + h5 - v*x*h6 - v*y*h7 = v
    let mut a = [[0.0f64; 8]; 8];
    let mut b = [0.0f64; 8];

    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let (x, y) = (s.x, s.y);
        let (u, v) = (d.x, d.y);

        let row1 = i * 2;
        let row2 = i * 2 + 1;

        a[row1] = [x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u];
        b[row1] = u;

        a[row2] = [0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v];
        b[row2] = v;
    }

    let h = Homography::from_params(solve(&mut a, &mut b)?);
    if determinant3(h.matrix()).abs() <= DET_EPSILON {
        return None;
    }
    Some(h)
}

/// Accumulated moments for the affine normal equations
#[derive(Debug, Default)]
struct Moments {
    n: f64,
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
    su: f64,
    sv: f64,
    sux: f64,
    suy: f64,
    svx: f64,
    svy: f64,
}

impl Moments {
    fn accumulate(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Self {
        let mut m = Moments::default();
        for (s, d) in src.iter().zip(dst) {
            let (x, y, u, v) = (s.x, s.y, d.x, d.y);
            m.n += 1.0;
            m.sx += x;
            m.sy += y;
            m.sxx += x * x;
            m.syy += y * y;
            m.sxy += x * y;
            m.su += u;
            m.sv += v;
            m.sux += u * x;
            m.suy += u * y;
            m.svx += v * x;
            m.svy += v * y;
        }
        m
    }

    fn normal_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.sxx, self.sxy, self.sx],
            [self.sxy, self.syy, self.sy],
            [self.sx, self.sy, self.n],
        ]
    }
}

/// Least-squares affine fit over all correspondences.
///
/// Falls back to the identity with fewer than three pairs or a singular
/// normal-equation system (collinear or coincident points).
pub fn compute_affine(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Affine {
    let count = src.len().min(dst.len());
    if count < 3 {
        return Affine::IDENTITY;
    }

    let m = Moments::accumulate(&src[..count], &dst[..count]);

    let mut a = m.normal_matrix();
    let mut b = [m.sux, m.suy, m.su];
    let Some([p0, p1, p2]) = solve(&mut a, &mut b) else {
        return Affine::IDENTITY;
    };

    let mut a = m.normal_matrix();
    let mut b = [m.svx, m.svy, m.sv];
    let Some([q0, q1, q2]) = solve(&mut a, &mut b) else {
        return Affine::IDENTITY;
    };

    Affine::new([p0, p1, p2, q0, q1, q2])
}
