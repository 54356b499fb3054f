use crate::enums::Interpolation;

use ndarray::Array3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Sample `data` at a continuous index in `(x, y, z)` order.
    ///
    /// Returns `None` outside the buffer, which extends half a voxel past
    /// the first and last voxel centres on every axis.
    #[inline]
    pub(crate) fn sample(
        data: &Array3<f32>,
        index: [f64; 3],
        interpolation: Interpolation,
    ) -> Option<f32> {
        let (depth, height, width) = data.dim();
        let size = [width, height, depth];
        for axis in 0..3 {
            if !(index[axis] >= -0.5 && index[axis] < size[axis] as f64 - 0.5) {
                return None;
            }
        }

        match interpolation {
            Interpolation::NearestNeighbor => {
                let x = (index[0].round().max(0.0) as usize).min(width - 1);
                let y = (index[1].round().max(0.0) as usize).min(height - 1);
                let z = (index[2].round().max(0.0) as usize).min(depth - 1);
                Some(data[[z, y, x]])
            }
            Interpolation::Linear => Some(Self::trilinear_interpolate(
                data,
                index[2].clamp(0.0, (depth - 1) as f64) as f32,
                index[1].clamp(0.0, (height - 1) as f64) as f32,
                index[0].clamp(0.0, (width - 1) as f64) as f32,
            )),
        }
    }

    #[inline]
    pub(crate) fn trilinear_interpolate(data: &Array3<f32>, z: f32, y: f32, x: f32) -> f32 {
        let (depth, height, width) = data.dim();

        let z0 = z.floor() as usize;
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let z1 = (z0 + 1).min(depth - 1);
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dz = z - z0 as f32;
        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;
        let one_minus_dz = 1.0 - dz;

        let plane = |zi: usize| {
            let v00 = data[[zi, y0, x0]];
            let v01 = data[[zi, y0, x1]];
            let v10 = data[[zi, y1, x0]];
            let v11 = data[[zi, y1, x1]];

            let v0 = v00.mul_add(one_minus_dx, v01 * dx);
            let v1 = v10.mul_add(one_minus_dx, v11 * dx);
            v0.mul_add(one_minus_dy, v1 * dy)
        };

        plane(z0).mul_add(one_minus_dz, plane(z1) * dz)
    }
}
