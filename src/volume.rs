use crate::enums::ElementType;
use crate::enums::Orientation;

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::Zip;
use ndarray::s;
use rayon::prelude::*;

/// Placement of a voxel grid in world coordinates.
///
/// Vectors are in `(x, y, z)` order. A continuous voxel index `i` maps to
/// `origin + direction * (spacing * i)`, `direction` being row-major with
/// orthonormal columns.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
    pub direction: [[f64; 3]; 3],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            spacing: [1.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }
}

impl Geometry {
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let scaled = [
            index[0] * self.spacing[0],
            index[1] * self.spacing[1],
            index[2] * self.spacing[2],
        ];
        let mut point = self.origin;
        for (row, value) in point.iter_mut().enumerate() {
            *value += self.direction[row][0] * scaled[0]
                + self.direction[row][1] * scaled[1]
                + self.direction[row][2] * scaled[2];
        }
        point
    }

    pub fn physical_to_index(&self, point: [f64; 3]) -> [f64; 3] {
        let offset = [
            point[0] - self.origin[0],
            point[1] - self.origin[1],
            point[2] - self.origin[2],
        ];
        // Transpose is the inverse for orthonormal directions
        let mut index = [0.0; 3];
        for (col, value) in index.iter_mut().enumerate() {
            let projected = self.direction[0][col] * offset[0]
                + self.direction[1][col] * offset[1]
                + self.direction[2][col] * offset[2];
            *value = projected / self.spacing[col];
        }
        index
    }

    /// Physical centre of a grid with `size` voxels in `(x, y, z)` order
    pub fn center(&self, size: [usize; 3]) -> [f64; 3] {
        self.index_to_physical([
            (size[0] as f64 - 1.0) / 2.0,
            (size[1] as f64 - 1.0) / 2.0,
            (size[2] as f64 - 1.0) / 2.0,
        ])
    }
}

/// Format details carried along so a decoded volume can be re-encoded
/// without losing anything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeHeader {
    pub element_type: ElementType,
    pub byte_order_msb: bool,
    pub compressed: bool,
    /// Every header field in file order, including the ones derived from
    /// the volume itself (those are rewritten on encode).
    pub fields: Vec<(String, String)>,
}

impl VolumeHeader {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Volume {
    pub data: Array3<f32>,
    pub geometry: Geometry,
    pub header: VolumeHeader,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: Geometry, header: VolumeHeader) -> Self {
        Self {
            data,
            geometry,
            header,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Grid size in `(x, y, z)` order, matching [`Geometry`]
    pub fn size(&self) -> [usize; 3] {
        let (depth, height, width) = self.data.dim();
        [width, height, depth]
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn min_value(&self) -> f32 {
        self.data
            .as_slice()
            .map(|values| {
                values
                    .par_iter()
                    .copied()
                    .reduce(|| f32::INFINITY, f32::min)
            })
            .unwrap_or_else(|| self.data.iter().copied().fold(f32::INFINITY, f32::min))
    }

    pub fn max_value(&self) -> f32 {
        self.data
            .as_slice()
            .map(|values| {
                values
                    .par_iter()
                    .copied()
                    .reduce(|| f32::NEG_INFINITY, f32::max)
            })
            .unwrap_or_else(|| {
                self.data
                    .iter()
                    .copied()
                    .fold(f32::NEG_INFINITY, f32::max)
            })
    }

    /// Physical centre of the voxel grid
    pub fn center(&self) -> [f64; 3] {
        self.geometry.center(self.size())
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    /// Round and clamp every voxel into the range of `element_type` and
    /// record it as the storage type.
    pub fn cast_to(&mut self, element_type: ElementType) {
        if let Some((low, high)) = element_type.integer_range() {
            let (low, high) = (low as f32, high as f32);
            Zip::from(&mut self.data).par_for_each(|v| *v = v.round().clamp(low, high));
        }
        self.header.element_type = element_type;
    }

    /// Render one slice as an 8-bit greyscale image, windowed to the
    /// volume's intensity range.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        let window = (self.min_value(), self.max_value());
        Self::slice_to_image(&slice, window)
    }

    #[inline]
    fn normalize_to_u8(value: f32, (low, high): (f32, f32)) -> u8 {
        if high <= low {
            return 0;
        }
        (((value - low) / (high - low)) * 255.0).clamp(0.0, 255.0) as u8
    }

    fn slice_to_image(
        slice: &ArrayView2<'_, f32>,
        window: (f32, f32),
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice
            .iter()
            .map(|&v| Self::normalize_to_u8(v, window))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }
}
