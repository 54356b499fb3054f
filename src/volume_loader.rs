use crate::enums::{ElementType, SortBy};
use crate::volume::{Geometry, Volume, VolumeHeader};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::{fs, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// One decoded slice with the attributes needed to place it
struct Slice {
    order: Option<f64>,
    position: Option<[f64; 3]>,
    pixels: Array2<f32>,
}

/// Assembles a single-frame DICOM series into a [`Volume`].
///
/// Pixel values are rescaled to modality units (e.g. Hounsfield) and the
/// geometry is taken from Image Position/Orientation (Patient), Pixel
/// Spacing and the distance between consecutive slices.
pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from DICOM objects
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found, dimensions are inconsistent
    /// or no pixel spacing is present
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let orientation = dicom_objects.iter().find_map(Self::get_orientation);
        let direction = Self::direction(orientation);
        let normal = [direction[0][2], direction[1][2], direction[2][2]];

        let mut slices: Vec<Slice> = dicom_objects
            .par_iter()
            .filter_map(|dicom_object| Self::extract_slice(dicom_object, sort_by, normal))
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::sort_slices(&mut slices, sort_by);
        Self::validate_dimensions(&slices)?;

        let (row_spacing, column_spacing, thickness) =
            Self::get_spacing(dicom_objects).ok_or(VolumeLoaderError::MissingSpacing)?;
        let slice_spacing = Self::slice_spacing(&slices).unwrap_or(thickness);

        let geometry = Geometry {
            origin: slices[0].position.unwrap_or([0.0; 3]),
            spacing: [column_spacing, row_spacing, slice_spacing],
            direction,
        };
        let data = Self::build_volume_array(&slices);
        let header = VolumeHeader {
            element_type: Self::element_type(&data),
            ..VolumeHeader::default()
        };

        Ok(Volume::new(data, geometry, header))
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path>],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> =
            paths.iter().map(|path| open_file(path.as_ref())).collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let mut paths = Self::dicom_files(path.as_ref())?;
        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        paths.sort();

        Self::load_from_file_paths(&paths, sort_by)
    }

    /// `.dcm` files directly inside `path`
    pub fn dicom_files(path: &Path) -> Result<Vec<std::path::PathBuf>, VolumeLoaderError> {
        Ok(fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect())
    }

    fn extract_slice(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
        normal: [f64; 3],
    ) -> Option<Slice> {
        let position = Self::get_position(dicom_object);
        let order = match sort_by {
            SortBy::ImagePositionPatient => position.map(|p| dot(p, normal)),
            SortBy::InstanceNumber => dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(f64::from),
            SortBy::None => None,
        };
        let pixels = Self::decode_image(dicom_object)?;
        Some(Slice {
            order,
            position,
            pixels,
        })
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<[f64; 3]> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float32()
            .ok()?;
        (pos.len() == 3).then(|| [pos[0] as f64, pos[1] as f64, pos[2] as f64])
    }

    fn get_orientation(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<[f64; 6]> {
        let cosines = dicom_object
            .element(tags::IMAGE_ORIENTATION_PATIENT)
            .ok()?
            .to_multi_float32()
            .ok()?;
        if cosines.len() != 6 {
            return None;
        }
        let mut out = [0.0; 6];
        for (o, c) in out.iter_mut().zip(&cosines) {
            *o = *c as f64;
        }
        Some(out)
    }

    /// Columns are the row direction, the column direction and their cross
    /// product
    fn direction(orientation: Option<[f64; 6]>) -> [[f64; 3]; 3] {
        let Some(cosines) = orientation else {
            return Geometry::default().direction;
        };
        let row = [cosines[0], cosines[1], cosines[2]];
        let column = [cosines[3], cosines[4], cosines[5]];
        let normal = [
            row[1] * column[2] - row[2] * column[1],
            row[2] * column[0] - row[0] * column[2],
            row[0] * column[1] - row[1] * column[0],
        ];
        let mut direction = [[0.0; 3]; 3];
        for (axis, vector) in [row, column, normal].iter().enumerate() {
            for (component, value) in vector.iter().enumerate() {
                direction[component][axis] = *value;
            }
        }
        direction
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| {
                a.order
                    .partial_cmp(&b.order)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].pixels.dim();
        if slices.iter().any(|slice| slice.pixels.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(slices: &[Slice]) -> Array3<f32> {
        let (height, width) = slices[0].pixels.dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }

        volume
    }

    /// Distance between the first two slice positions
    fn slice_spacing(slices: &[Slice]) -> Option<f64> {
        let first = slices.first()?.position?;
        let second = slices.get(1)?.position?;
        let distance = ((second[0] - first[0]).powi(2)
            + (second[1] - first[1]).powi(2)
            + (second[2] - first[2]).powi(2))
        .sqrt();
        (distance > 0.0).then_some(distance)
    }

    /// `(row spacing, column spacing, slice thickness)`; thickness falls
    /// back to 1 when absent
    fn get_spacing(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<(f64, f64, f64)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;
            if pixel_spacing.len() < 2 {
                return None;
            }

            let slice_thickness = dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()
                .and_then(|e| e.to_float32().ok())
                .unwrap_or(1.0);

            Some((
                pixel_spacing[0] as f64,
                pixel_spacing[1] as f64,
                slice_thickness as f64,
            ))
        })
    }

    /// 16-bit signed storage when every value fits, float otherwise
    fn element_type(data: &Array3<f32>) -> ElementType {
        let fits = data
            .iter()
            .all(|v| v.fract() == 0.0 && (i16::MIN as f32..=i16::MAX as f32).contains(v));
        if fits {
            ElementType::Short
        } else {
            ElementType::Float
        }
    }
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}
