//! Small dense linear algebra
//!
//! Gaussian elimination with partial pivoting for the 8x8 homography system
//! and the 3x3 affine normal equations, plus closed-form 3x3 determinant and
//! inverse used to flip an estimated transform into a sampling map.

use nalgebra::Matrix3;

/// Pivot magnitude below which a system is reported singular.
pub const PIVOT_EPSILON: f64 = 1e-10;

/// Determinant magnitude below which a 3x3 matrix is not inverted.
pub const DET_EPSILON: f64 = 1e-9;

/// Solve `a * x = b` in place.
///
/// Returns `None` if any pivot (after row swapping) falls below
/// [`PIVOT_EPSILON`]. `a` and `b` are left in their eliminated state.
pub fn solve<const N: usize>(a: &mut [[f64; N]; N], b: &mut [f64; N]) -> Option<[f64; N]> {
    // Forward elimination with partial pivoting
    for col in 0..N {
        let mut max_row = col;
        let mut max_val = a[col][col].abs();
        for row in (col + 1)..N {
            if a[row][col].abs() > max_val {
                max_val = a[row][col].abs();
                max_row = row;
            }
        }

        if max_row != col {
            a.swap(col, max_row);
            b.swap(col, max_row);
        }

        let pivot = a[col][col];
        if pivot.abs() < PIVOT_EPSILON {
            return None;
        }

        for row in (col + 1)..N {
            let factor = a[row][col] / pivot;
            for j in col..N {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    // Back substitution
    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        let mut sum = b[i];
        for j in (i + 1)..N {
            sum -= a[i][j] * x[j];
        }
        x[i] = sum / a[i][i];
    }

    Some(x)
}

/// Determinant by cofactor expansion along the first row.
pub fn determinant3(m: &Matrix3<f64>) -> f64 {
    m[(0, 0)] * (m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)])
        - m[(0, 1)] * (m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)])
        + m[(0, 2)] * (m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)])
}

/// Inverse via adjugate / determinant, `None` when `|det| < DET_EPSILON`.
pub fn invert3(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let det = determinant3(m);
    if det.abs() < DET_EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;

    // Transposed cofactor matrix
    let adj = Matrix3::new(
        m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)],
        m[(0, 2)] * m[(2, 1)] - m[(0, 1)] * m[(2, 2)],
        m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)],
        m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)],
        m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)],
        m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)],
        m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)],
        m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)],
        m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
    );

    Some(adj * inv_det)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol * b.abs().max(1.0), "{} != {}", a, b);
    }

    #[test]
    fn test_solve_diagonal() {
        let mut a = [[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, -0.5]];
        let mut b = [4.0, 2.0, 1.0];
        let x = solve(&mut a, &mut b).unwrap();
        assert_close(x[0], 2.0, 1e-12);
        assert_close(x[1], 0.5, 1e-12);
        assert_close(x[2], -2.0, 1e-12);
    }

    #[test]
    fn test_solve_upper_triangular() {
        // x + 2y + 3z = 14, 4y + 5z = 23, 6z = 18  ->  (1, 2, 3)
        let mut a = [[1.0, 2.0, 3.0], [0.0, 4.0, 5.0], [0.0, 0.0, 6.0]];
        let mut b = [14.0, 23.0, 18.0];
        let x = solve(&mut a, &mut b).unwrap();
        assert_close(x[0], 1.0, 1e-12);
        assert_close(x[1], 2.0, 1e-12);
        assert_close(x[2], 3.0, 1e-12);
    }

    #[test]
    fn test_solve_needs_pivoting() {
        // Zero on the leading diagonal forces a row swap
        let mut a = [[0.0, 1.0], [1.0, 0.0]];
        let mut b = [3.0, 7.0];
        let x = solve(&mut a, &mut b).unwrap();
        assert_close(x[0], 7.0, 1e-12);
        assert_close(x[1], 3.0, 1e-12);
    }

    #[test]
    fn test_solve_singular() {
        let mut a = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [1.0, 0.0, 1.0]];
        let mut b = [1.0, 2.0, 3.0];
        assert!(solve(&mut a, &mut b).is_none());
    }

    #[test]
    fn test_determinant() {
        let m = Matrix3::new(2.0, 0.0, 1.0, 1.0, 3.0, 2.0, 1.0, 1.0, 1.0);
        // 2*(3-2) - 0 + 1*(1-3) = 0
        assert_close(determinant3(&m), 0.0, 1e-12);

        let m = Matrix3::new(1.0, 2.0, 3.0, 0.0, 1.0, 4.0, 5.0, 6.0, 0.0);
        assert_close(determinant3(&m), 1.0, 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let m = Matrix3::new(1.2, -0.3, 14.0, 0.25, 0.9, -7.5, 1e-4, -2e-4, 1.0);
        let inv = invert3(&m).unwrap();
        let back = invert3(&inv).unwrap();
        for i in 0..9 {
            assert_close(back[i], m[i], 1e-6);
        }

        let product = m * inv;
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((product[(r, c)] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_inverse_singular() {
        let m = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 0.0, 0.0, 1.0);
        assert!(invert3(&m).is_none());
    }
}
