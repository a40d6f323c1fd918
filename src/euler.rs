//! Euler angle conversions for segment rotations
//!
//! Angles are in degrees. A [`RotationOrder`] names the fixed axes in the
//! order the rotations are applied: `Xyz` rotates about X first, then Y, then
//! Z, so the matrix is `Rz · Ry · Rx` acting on column vectors. Segment
//! rotations in frames use [`RotationOrder::Zyx`].
//!
//! ```rust
//! use cortex_stream::euler::{RotationOrder, construct_rotation_matrix, extract_euler_angles};
//!
//! let m = construct_rotation_matrix([10.0, 20.0, 30.0], RotationOrder::Zyx);
//! let angles = extract_euler_angles(&m, RotationOrder::Zyx);
//! assert!((angles[1] - 20.0).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};

use crate::{CortexError, Result};

pub type Matrix3 = [[f64; 3]; 3];

const GIMBAL_EPSILON: f64 = 1e-9;

/// Axis sequences, numbered by their legacy codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RotationOrder {
    Zyx = 1,
    Xyz = 2,
    Yxz = 3,
    Yzx = 4,
    Zxy = 5,
    Xzy = 6,
    Xyx = 7,
    Xzx = 8,
    Yzy = 9,
    Yxy = 10,
    Zxz = 11,
    Zyz = 12,
}

impl RotationOrder {
    pub const ALL: [RotationOrder; 12] = [
        RotationOrder::Zyx,
        RotationOrder::Xyz,
        RotationOrder::Yxz,
        RotationOrder::Yzx,
        RotationOrder::Zxy,
        RotationOrder::Xzy,
        RotationOrder::Xyx,
        RotationOrder::Xzx,
        RotationOrder::Yzy,
        RotationOrder::Yxy,
        RotationOrder::Zxz,
        RotationOrder::Zyz,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code).checked_sub(1)?).copied()
    }

    /// Axis indices (0 = X) in application order.
    pub fn axes(self) -> [usize; 3] {
        const X: usize = 0;
        const Y: usize = 1;
        const Z: usize = 2;
        match self {
            RotationOrder::Zyx => [Z, Y, X],
            RotationOrder::Xyz => [X, Y, Z],
            RotationOrder::Yxz => [Y, X, Z],
            RotationOrder::Yzx => [Y, Z, X],
            RotationOrder::Zxy => [Z, X, Y],
            RotationOrder::Xzy => [X, Z, Y],
            RotationOrder::Xyx => [X, Y, X],
            RotationOrder::Xzx => [X, Z, X],
            RotationOrder::Yzy => [Y, Z, Y],
            RotationOrder::Yxy => [Y, X, Y],
            RotationOrder::Zxz => [Z, X, Z],
            RotationOrder::Zyz => [Z, Y, Z],
        }
    }

    /// First and last axis are the same.
    pub fn is_proper_euler(self) -> bool {
        let [first, _, last] = self.axes();
        first == last
    }
}

impl TryFrom<i32> for RotationOrder {
    type Error = CortexError;

    fn try_from(code: i32) -> Result<Self> {
        u8::try_from(code)
            .ok()
            .and_then(Self::from_code)
            .ok_or_else(|| CortexError::api_misuse(format!("unknown rotation order code {}", code)))
    }
}

fn axis_rotation(axis: usize, degrees: f64) -> Matrix3 {
    let (s, c) = degrees.to_radians().sin_cos();
    match axis {
        0 => [[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]],
        1 => [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]],
        _ => [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]],
    }
}

fn multiply(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[r][k] * b[k][c]).sum();
        }
    }
    out
}

/// Rotation matrix for `angles` (degrees) applied in `order`.
pub fn construct_rotation_matrix(angles: [f64; 3], order: RotationOrder) -> Matrix3 {
    let [a, b, c] = order.axes();
    let first = axis_rotation(a, angles[0]);
    let second = axis_rotation(b, angles[1]);
    let third = axis_rotation(c, angles[2]);
    multiply(&third, &multiply(&second, &first))
}

/// Angles (degrees) that rebuild `matrix` in `order`.
///
/// The middle angle lies in `[-90, 90]` for three-axis orders and in
/// `[0, 180]` for repeated-axis orders. At gimbal lock the third angle is
/// zero and the first absorbs the combined rotation.
pub fn extract_euler_angles(matrix: &Matrix3, order: RotationOrder) -> [f64; 3] {
    let m = matrix;
    let [i, j, _] = order.axes();
    let k = 3 - i - j;
    // +1 when (i, j, k) is a cyclic permutation of (x, y, z)
    let s = if j == (i + 1) % 3 { 1.0 } else { -1.0 };

    let (alpha, beta, gamma) = if order.is_proper_euler() {
        let beta = m[i][i].clamp(-1.0, 1.0).acos();
        let sin_beta = m[i][j].hypot(m[i][k]);
        if sin_beta > GIMBAL_EPSILON {
            let alpha = m[i][j].atan2(s * m[i][k]);
            let gamma = m[j][i].atan2(-s * m[k][i]);
            (alpha, beta, gamma)
        } else {
            ((-s * m[j][k]).atan2(m[j][j]), beta, 0.0)
        }
    } else {
        let beta = (-s * m[k][i]).clamp(-1.0, 1.0).asin();
        let cos_beta = m[i][i].hypot(m[j][i]);
        if cos_beta > GIMBAL_EPSILON {
            let alpha = (s * m[k][j]).atan2(m[k][k]);
            let gamma = (s * m[j][i]).atan2(m[i][i]);
            (alpha, beta, gamma)
        } else {
            ((-s * m[j][k]).atan2(m[j][j]), beta, 0.0)
        }
    };

    [alpha.to_degrees(), beta.to_degrees(), gamma.to_degrees()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_close(a: &Matrix3, b: &Matrix3) {
        for r in 0..3 {
            for c in 0..3 {
                assert!((a[r][c] - b[r][c]).abs() < 1e-9, "{:?} != {:?}", a, b);
            }
        }
    }

    fn assert_angles(actual: [f64; 3], expected: [f64; 3]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-7, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn legacy_codes_map_both_ways() {
        for order in RotationOrder::ALL {
            assert_eq!(RotationOrder::from_code(order.code()), Some(order));
        }
        assert_eq!(RotationOrder::Zyx.code(), 1);
        assert_eq!(RotationOrder::Zyz.code(), 12);
        assert_eq!(RotationOrder::from_code(0), None);
        assert!(RotationOrder::try_from(13).is_err());
        assert_eq!(RotationOrder::try_from(5).unwrap(), RotationOrder::Zxy);
    }

    #[test]
    fn single_axis_rotation() {
        let m = construct_rotation_matrix([90.0, 0.0, 0.0], RotationOrder::Xyz);
        assert_close(&m, &[[1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]]);
    }

    #[test]
    fn first_axis_is_applied_first() {
        // X then Z: the Y axis goes to Z, then stays there
        let m = construct_rotation_matrix([90.0, 0.0, 90.0], RotationOrder::Xyz);
        let y = [m[0][1], m[1][1], m[2][1]];
        assert_angles(y, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn three_axis_angles_round_trip() {
        for order in RotationOrder::ALL.into_iter().filter(|o| !o.is_proper_euler()) {
            let angles = [25.0, -40.0, 130.0];
            let m = construct_rotation_matrix(angles, order);
            assert_angles(extract_euler_angles(&m, order), angles);
        }
    }

    #[test]
    fn repeated_axis_angles_round_trip() {
        for order in RotationOrder::ALL.into_iter().filter(|o| o.is_proper_euler()) {
            let angles = [-60.0, 35.0, 110.0];
            let m = construct_rotation_matrix(angles, order);
            assert_angles(extract_euler_angles(&m, order), angles);
        }
    }

    #[test]
    fn gimbal_lock_pins_third_angle() {
        let m = construct_rotation_matrix([30.0, 90.0, 0.0], RotationOrder::Zyx);
        assert_angles(extract_euler_angles(&m, RotationOrder::Zyx), [30.0, 90.0, 0.0]);

        let m = construct_rotation_matrix([20.0, 0.0, 15.0], RotationOrder::Zxz);
        assert_angles(extract_euler_angles(&m, RotationOrder::Zxz), [35.0, 0.0, 0.0]);
    }

    proptest! {
        #[test]
        fn matrices_are_orthonormal(
            a in -180.0f64..180.0, b in -180.0f64..180.0, c in -180.0f64..180.0,
            code in 1u8..=12,
        ) {
            let order = RotationOrder::from_code(code).unwrap();
            let m = construct_rotation_matrix([a, b, c], order);
            for r in 0..3 {
                for s in 0..3 {
                    let dot: f64 = (0..3).map(|k| m[r][k] * m[s][k]).sum();
                    let expected = if r == s { 1.0 } else { 0.0 };
                    prop_assert!((dot - expected).abs() < 1e-9);
                }
            }
        }

        #[test]
        fn extraction_rebuilds_the_matrix(
            a in -180.0f64..180.0, b in -180.0f64..180.0, c in -180.0f64..180.0,
            code in 1u8..=12,
        ) {
            let order = RotationOrder::from_code(code).unwrap();
            let m = construct_rotation_matrix([a, b, c], order);
            let rebuilt = construct_rotation_matrix(extract_euler_angles(&m, order), order);
            for r in 0..3 {
                for s in 0..3 {
                    prop_assert!((m[r][s] - rebuilt[r][s]).abs() < 1e-6);
                }
            }
        }
    }
}
