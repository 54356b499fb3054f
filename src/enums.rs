use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Rule used when a volume is sampled between voxel centres.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    #[default]
    Linear,
    NearestNeighbor,
}

/// What to do when two files resolve to the same subject and modality.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicatePolicy {
    #[default]
    Fail,
    KeepFirst,
}

/// Storage type of the voxels in an encoded volume.
///
/// Every type converts to `f32` exactly. 32-bit integer types would not
/// and are not supported.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    UChar,
    Char,
    UShort,
    #[default]
    Short,
    Float,
}

impl ElementType {
    pub fn from_meta_name(name: &str) -> Option<Self> {
        match name {
            "MET_UCHAR" => Some(Self::UChar),
            "MET_CHAR" => Some(Self::Char),
            "MET_USHORT" => Some(Self::UShort),
            "MET_SHORT" => Some(Self::Short),
            "MET_FLOAT" => Some(Self::Float),
            _ => None,
        }
    }

    pub fn meta_name(self) -> &'static str {
        match self {
            Self::UChar => "MET_UCHAR",
            Self::Char => "MET_CHAR",
            Self::UShort => "MET_USHORT",
            Self::Short => "MET_SHORT",
            Self::Float => "MET_FLOAT",
        }
    }

    /// Size of one stored element in bytes
    pub fn size(self) -> usize {
        match self {
            Self::UChar | Self::Char => 1,
            Self::UShort | Self::Short => 2,
            Self::Float => 4,
        }
    }

    /// Representable range, `None` for floating point
    pub fn integer_range(self) -> Option<(f64, f64)> {
        match self {
            Self::UChar => Some((u8::MIN as f64, u8::MAX as f64)),
            Self::Char => Some((i8::MIN as f64, i8::MAX as f64)),
            Self::UShort => Some((u16::MIN as f64, u16::MAX as f64)),
            Self::Short => Some((i16::MIN as f64, i16::MAX as f64)),
            Self::Float => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Convert,
    Mask,
    Register,
}

impl StageKind {
    /// Verb used in progress lines, e.g. `-> masked ct`
    pub fn verb(self) -> &'static str {
        match self {
            Self::Convert => "converted",
            Self::Mask => "masked",
            Self::Register => "registered",
        }
    }
}

/// Slice ordering used when assembling a DICOM series
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortBy {
    /// Position along the slice normal, from Image Position (Patient)
    #[default]
    ImagePositionPatient,
    InstanceNumber,
    /// Keep file name order
    None,
}
