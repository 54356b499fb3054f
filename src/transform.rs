use crate::volume::Volume;

use serde::Serialize;

pub type Matrix3 = [[f64; 3]; 3];

/// Rigid transform mapping fixed-space points into moving space:
/// `p' = R (p - center) + center + translation`, with
/// `R = Rz * Rx * Ry` built from `angles` (radians, about x, y and z).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RigidTransform {
    pub angles: [f64; 3],
    pub translation: [f64; 3],
    pub center: [f64; 3],
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self {
            angles: [0.0; 3],
            translation: [0.0; 3],
            center: [0.0; 3],
        }
    }
}

impl RigidTransform {
    pub const PARAMETERS: usize = 6;

    /// Rotate about the fixed volume's geometric centre and translate so
    /// that it lands on the moving volume's geometric centre.
    pub fn centered(fixed: &Volume, moving: &Volume) -> Self {
        let fixed_center = fixed.center();
        let moving_center = moving.center();
        Self {
            angles: [0.0; 3],
            translation: [
                moving_center[0] - fixed_center[0],
                moving_center[1] - fixed_center[1],
                moving_center[2] - fixed_center[2],
            ],
            center: fixed_center,
        }
    }

    /// `[angle_x, angle_y, angle_z, tx, ty, tz]`
    pub fn parameters(&self) -> [f64; Self::PARAMETERS] {
        let [ax, ay, az] = self.angles;
        let [tx, ty, tz] = self.translation;
        [ax, ay, az, tx, ty, tz]
    }

    pub fn with_parameters(&self, parameters: &[f64; Self::PARAMETERS]) -> Self {
        Self {
            angles: [parameters[0], parameters[1], parameters[2]],
            translation: [parameters[3], parameters[4], parameters[5]],
            center: self.center,
        }
    }

    pub fn matrix(&self) -> Matrix3 {
        let [ax, ay, az] = self.angles;
        let (sx, cx) = ax.sin_cos();
        let (sy, cy) = ay.sin_cos();
        let (sz, cz) = az.sin_cos();

        let rx = [[1.0, 0.0, 0.0], [0.0, cx, -sx], [0.0, sx, cx]];
        let ry = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
        let rz = [[cz, -sz, 0.0], [sz, cz, 0.0], [0.0, 0.0, 1.0]];
        multiply(&multiply(&rz, &rx), &ry)
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        Self::apply_with(&self.matrix(), self.center, self.translation, point)
    }

    /// Same as [`RigidTransform::apply`] with a precomputed rotation, for
    /// hot loops.
    #[inline]
    pub fn apply_with(
        rotation: &Matrix3,
        center: [f64; 3],
        translation: [f64; 3],
        point: [f64; 3],
    ) -> [f64; 3] {
        let d = [
            point[0] - center[0],
            point[1] - center[1],
            point[2] - center[2],
        ];
        let mut out = [0.0; 3];
        for (row, value) in out.iter_mut().enumerate() {
            *value = rotation[row][0] * d[0]
                + rotation[row][1] * d[1]
                + rotation[row][2] * d[2]
                + center[row]
                + translation[row];
        }
        out
    }

    /// Maps moving-space points back into fixed space
    pub fn inverse_apply(&self, point: [f64; 3]) -> [f64; 3] {
        let rotation = self.matrix();
        let d = [
            point[0] - self.center[0] - self.translation[0],
            point[1] - self.center[1] - self.translation[1],
            point[2] - self.center[2] - self.translation[2],
        ];
        let mut out = [0.0; 3];
        for (col, value) in out.iter_mut().enumerate() {
            *value = rotation[0][col] * d[0]
                + rotation[1][col] * d[1]
                + rotation[2][col] * d[2]
                + self.center[col];
        }
        out
    }
}

fn multiply(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}
