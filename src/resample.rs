use crate::enums::Interpolation;
use crate::interpolator::Interpolator;
use crate::transform::RigidTransform;
use crate::volume::Volume;

use ndarray::{Array3, Zip};

/// Resample `moving` onto the voxel grid of `reference`.
///
/// Every reference voxel centre is mapped through `transform` into moving
/// space and sampled there; points falling outside the moving volume take
/// `fill`. The result keeps the moving volume's header.
pub fn resample(
    moving: &Volume,
    reference: &Volume,
    transform: &RigidTransform,
    interpolation: Interpolation,
    fill: f32,
) -> Volume {
    let rotation = transform.matrix();
    let mut data = Array3::from_elem(reference.dim(), fill);

    Zip::indexed(&mut data).par_for_each(|(z, y, x), value| {
        let point = reference
            .geometry
            .index_to_physical([x as f64, y as f64, z as f64]);
        let mapped =
            RigidTransform::apply_with(&rotation, transform.center, transform.translation, point);
        let index = moving.geometry.physical_to_index(mapped);
        if let Some(sample) = Interpolator::sample(moving.data(), index, interpolation) {
            *value = sample;
        }
    });

    Volume::new(data, reference.geometry.clone(), moving.header.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{Geometry, VolumeHeader};

    fn ramp() -> Volume {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (100 * z + 10 * y + x) as f32);
        Volume::new(data, Geometry::default(), VolumeHeader::default())
    }

    #[test]
    fn identity_reproduces_the_moving_volume() {
        let moving = ramp();
        let result = resample(
            &moving,
            &moving,
            &RigidTransform::default(),
            Interpolation::Linear,
            -1.0,
        );
        assert_eq!(result.data, moving.data);
        assert_eq!(result.geometry, moving.geometry);
    }

    #[test]
    fn translation_shifts_and_fills() {
        let moving = ramp();
        let transform = RigidTransform {
            translation: [1.0, 0.0, 0.0],
            ..RigidTransform::default()
        };
        let result = resample(
            &moving,
            &moving,
            &transform,
            Interpolation::NearestNeighbor,
            -1.0,
        );
        // Output x samples moving x + 1; the last column has no source
        assert_eq!(result.data[[1, 2, 0]], 121.0);
        assert_eq!(result.data[[1, 2, 3]], 124.0);
        assert_eq!(result.data[[1, 2, 4]], -1.0);
    }

    #[test]
    fn output_takes_the_reference_grid() {
        let moving = ramp();
        let reference = Volume::new(
            Array3::zeros((2, 2, 2)),
            Geometry {
                origin: [1.0, 1.0, 1.0],
                spacing: [2.0, 2.0, 1.0],
                ..Geometry::default()
            },
            VolumeHeader::default(),
        );
        let result = resample(
            &moving,
            &reference,
            &RigidTransform::default(),
            Interpolation::Linear,
            0.0,
        );
        assert_eq!(result.dim(), (2, 2, 2));
        assert_eq!(result.data[[0, 0, 0]], 111.0);
        assert_eq!(result.data[[1, 1, 1]], 233.0);
    }
}
