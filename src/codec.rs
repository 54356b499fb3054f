//! Reading and writing volumes on disk.
//!
//! The pipeline only talks to [`VolumeCodec`]. [`MetaImageCodec`] is the
//! default implementation and handles MetaImage files: single-file `.mha`
//! (voxel data embedded after the header) and `.mhd` headers pointing at a
//! separate raw file.

use crate::enums::ElementType;
use crate::volume::{Geometry, Volume, VolumeHeader};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use ndarray::Array3;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Missing header field {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidField { key: String, value: String },

    #[error("Unsupported element type {0}")]
    UnsupportedElementType(String),

    #[error("Only 3-dimensional images are supported, got NDims = {0}")]
    UnsupportedDimensions(String),

    #[error("Expected {expected} bytes of voxel data, found {found}")]
    DataSize { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Cannot decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    #[error("Cannot encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
}

pub trait VolumeCodec: Send + Sync {
    /// File extension (without the dot) this codec writes
    fn extension(&self) -> &str;

    fn decode(&self, path: &Path) -> Result<Volume, CodecError>;

    /// Write `volume` to `path`; geometry, header and voxel values must
    /// survive a later [`VolumeCodec::decode`] unchanged.
    fn encode(&self, volume: &Volume, path: &Path) -> Result<(), CodecError>;
}

const ELEMENT_DATA_FILE: &str = "ElementDataFile";
const LOCAL: &str = "LOCAL";

#[derive(Clone, Debug, Default)]
pub struct MetaImageCodec;

impl VolumeCodec for MetaImageCodec {
    fn extension(&self) -> &str {
        "mha"
    }

    fn decode(&self, path: &Path) -> Result<Volume, CodecError> {
        Self::read(path).map_err(|source| CodecError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    fn encode(&self, volume: &Volume, path: &Path) -> Result<(), CodecError> {
        Self::write(volume, path).map_err(|source| CodecError::Encode {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl MetaImageCodec {
    fn read(path: &Path) -> Result<Volume, FormatError> {
        let bytes = fs::read(path)?;
        let (fields, data_offset) = Self::parse_header(&bytes)?;

        let field = |key: &'static str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let first_of = |keys: &[&'static str]| keys.iter().find_map(|key| field(*key));

        let ndims = field("NDims").ok_or(FormatError::MissingField("NDims"))?;
        if ndims != "3" {
            return Err(FormatError::UnsupportedDimensions(ndims.to_string()));
        }

        let size: [usize; 3] = Self::parse_triple(
            "DimSize",
            field("DimSize").ok_or(FormatError::MissingField("DimSize"))?,
        )?;
        if size.contains(&0) {
            return Err(FormatError::InvalidField {
                key: "DimSize".to_string(),
                value: format!("{size:?}"),
            });
        }

        let element_name = field("ElementType").ok_or(FormatError::MissingField("ElementType"))?;
        let element_type = ElementType::from_meta_name(element_name)
            .ok_or_else(|| FormatError::UnsupportedElementType(element_name.to_string()))?;

        let spacing = match first_of(&["ElementSpacing", "ElementSize"]) {
            Some(value) => Self::parse_triple("ElementSpacing", value)?,
            None => [1.0; 3],
        };
        let origin = match first_of(&["Offset", "Origin", "Position"]) {
            Some(value) => Self::parse_triple("Offset", value)?,
            None => [0.0; 3],
        };
        let direction = match first_of(&["TransformMatrix", "Rotation", "Orientation"]) {
            Some(value) => Self::parse_direction(value)?,
            None => Geometry::default().direction,
        };

        let byte_order_msb = match first_of(&["BinaryDataByteOrderMSB", "ElementByteOrderMSB"]) {
            Some(value) => Self::parse_bool("BinaryDataByteOrderMSB", value)?,
            None => false,
        };
        let compressed = match field("CompressedData") {
            Some(value) => Self::parse_bool("CompressedData", value)?,
            None => false,
        };

        let data_file =
            field(ELEMENT_DATA_FILE).ok_or(FormatError::MissingField(ELEMENT_DATA_FILE))?;
        let raw = if data_file == LOCAL {
            bytes[data_offset..].to_vec()
        } else {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            fs::read(base.join(data_file))?
        };

        let raw = if compressed {
            let mut inflated = Vec::new();
            ZlibDecoder::new(raw.as_slice()).read_to_end(&mut inflated)?;
            inflated
        } else {
            raw
        };

        let expected = size
            .iter()
            .try_fold(element_type.size(), |bytes, &n| bytes.checked_mul(n))
            .ok_or_else(|| FormatError::InvalidField {
                key: "DimSize".to_string(),
                value: format!("{size:?}"),
            })?;
        if raw.len() < expected {
            return Err(FormatError::DataSize {
                expected,
                found: raw.len(),
            });
        }

        let values = Self::decode_elements(&raw[..expected], element_type, byte_order_msb);
        let data = Array3::from_shape_vec((size[2], size[1], size[0]), values).map_err(|_| {
            FormatError::DataSize {
                expected,
                found: raw.len(),
            }
        })?;

        Ok(Volume::new(
            data,
            Geometry {
                origin,
                spacing,
                direction,
            },
            VolumeHeader {
                element_type,
                byte_order_msb,
                compressed,
                fields,
            },
        ))
    }

    fn write(volume: &Volume, path: &Path) -> Result<(), FormatError> {
        let header = &volume.header;
        let mut payload = Self::encode_elements(volume, header.element_type, header.byte_order_msb);
        if header.compressed {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&payload)?;
            payload = encoder.finish()?;
        }

        // A `.mhd` header gets its voxels in a sibling file
        let detached = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mhd"));
        let data_file = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if detached => {
                format!("{stem}.{}", if header.compressed { "zraw" } else { "raw" })
            }
            _ => LOCAL.to_string(),
        };

        let fields = Self::merge_fields(volume, payload.len(), &data_file);
        let mut text = String::new();
        for (key, value) in &fields {
            text.push_str(key);
            text.push_str(" = ");
            text.push_str(value);
            text.push('\n');
        }

        let mut file = io::BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        if data_file == LOCAL {
            file.write_all(&payload)?;
        } else {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            fs::write(base.join(&data_file), &payload)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Header lines up to and including `ElementDataFile`, plus the byte
    /// offset where voxel data starts.
    fn parse_header(bytes: &[u8]) -> Result<(Vec<(String, String)>, usize), FormatError> {
        let mut fields = Vec::new();
        let mut start = 0;

        while start < bytes.len() {
            let end = bytes[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |p| start + p);
            let line = String::from_utf8_lossy(&bytes[start..end]);
            let line = line.trim();
            start = end + 1;

            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(FormatError::InvalidField {
                    key: line.to_string(),
                    value: String::new(),
                });
            };
            let (key, value) = (key.trim().to_string(), value.trim().to_string());
            let is_last = key == ELEMENT_DATA_FILE;
            fields.push((key, value));
            if is_last {
                return Ok((fields, start.min(bytes.len())));
            }
        }

        Err(FormatError::MissingField(ELEMENT_DATA_FILE))
    }

    /// Header fields of `volume` with every derived value refreshed, in the
    /// original order. Fields the volume never had are added before
    /// `ElementDataFile`, which always comes last.
    fn merge_fields(volume: &Volume, payload_len: usize, data_file: &str) -> Vec<(String, String)> {
        let header = &volume.header;
        let geometry = &volume.geometry;
        let size = volume.size();
        let bool_text = |b: bool| (if b { "True" } else { "False" }).to_string();

        let derived = vec![
            derived_field("ObjectType", &[], "Image".to_string()),
            derived_field("NDims", &[], "3".to_string()),
            derived_field("BinaryData", &[], "True".to_string()),
            derived_field(
                "BinaryDataByteOrderMSB",
                &["ElementByteOrderMSB"],
                bool_text(header.byte_order_msb),
            ),
            derived_field("CompressedData", &[], bool_text(header.compressed)),
            derived_field(
                "TransformMatrix",
                &["Rotation", "Orientation"],
                join(geometry.direction.iter().flatten()),
            ),
            derived_field(
                "Offset",
                &["Origin", "Position"],
                join(geometry.origin.iter()),
            ),
            derived_field("ElementSpacing", &[], join(geometry.spacing.iter())),
            derived_field("DimSize", &[], join(size.iter())),
            derived_field(
                "ElementType",
                &[],
                header.element_type.meta_name().to_string(),
            ),
        ];

        let mut merged: Vec<(String, String)> = Vec::with_capacity(header.fields.len() + 2);
        let mut seen = vec![false; derived.len()];
        for (key, value) in &header.fields {
            if key == ELEMENT_DATA_FILE || key == "CompressedDataSize" {
                continue;
            }
            let position = derived.iter().position(|(name, aliases, _)| {
                name == key || aliases.iter().any(|alias| alias == key)
            });
            match position {
                Some(i) => {
                    if !seen[i] {
                        seen[i] = true;
                        merged.push((key.clone(), derived[i].2.clone()));
                    }
                }
                None => merged.push((key.clone(), value.clone())),
            }
        }
        for (i, (name, _, value)) in derived.iter().enumerate() {
            if !seen[i] {
                merged.push((name.to_string(), value.clone()));
            }
        }
        if header.compressed {
            merged.push(("CompressedDataSize".to_string(), payload_len.to_string()));
        }
        merged.push((ELEMENT_DATA_FILE.to_string(), data_file.to_string()));
        merged
    }

    fn decode_elements(raw: &[u8], element_type: ElementType, msb: bool) -> Vec<f32> {
        macro_rules! convert {
            ($t:ty) => {
                raw.chunks_exact(std::mem::size_of::<$t>())
                    .map(|chunk| {
                        let bytes = chunk.try_into().unwrap_or_default();
                        let value = if msb {
                            <$t>::from_be_bytes(bytes)
                        } else {
                            <$t>::from_le_bytes(bytes)
                        };
                        value as f32
                    })
                    .collect()
            };
        }

        match element_type {
            ElementType::UChar => raw.iter().map(|&b| b as f32).collect(),
            ElementType::Char => raw.iter().map(|&b| b as i8 as f32).collect(),
            ElementType::UShort => convert!(u16),
            ElementType::Short => convert!(i16),
            ElementType::Float => convert!(f32),
        }
    }

    fn encode_elements(volume: &Volume, element_type: ElementType, msb: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(volume.data.len() * element_type.size());

        macro_rules! push {
            ($t:ty) => {
                for &value in volume.data.iter() {
                    let value = value.round().clamp(<$t>::MIN as f32, <$t>::MAX as f32) as $t;
                    if msb {
                        out.extend_from_slice(&value.to_be_bytes());
                    } else {
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
            };
        }

        match element_type {
            ElementType::UChar => push!(u8),
            ElementType::Char => push!(i8),
            ElementType::UShort => push!(u16),
            ElementType::Short => push!(i16),
            ElementType::Float => {
                for &value in volume.data.iter() {
                    if msb {
                        out.extend_from_slice(&value.to_be_bytes());
                    } else {
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
            }
        }
        out
    }

    fn parse_triple<T: std::str::FromStr>(key: &str, value: &str) -> Result<[T; 3], FormatError> {
        let invalid = || FormatError::InvalidField {
            key: key.to_string(),
            value: value.to_string(),
        };
        let parts: Vec<T> = value
            .split_whitespace()
            .map(|part| part.parse::<T>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        parts.try_into().map_err(|_| invalid())
    }

    fn parse_direction(value: &str) -> Result<[[f64; 3]; 3], FormatError> {
        let invalid = || FormatError::InvalidField {
            key: "TransformMatrix".to_string(),
            value: value.to_string(),
        };
        let parts: Vec<f64> = value
            .split_whitespace()
            .map(|part| part.parse::<f64>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        if parts.len() != 9 {
            return Err(invalid());
        }
        Ok([
            [parts[0], parts[1], parts[2]],
            [parts[3], parts[4], parts[5]],
            [parts[6], parts[7], parts[8]],
        ])
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, FormatError> {
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(FormatError::InvalidField {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

type DerivedField = (&'static str, &'static [&'static str], String);

fn derived_field(
    name: &'static str,
    aliases: &'static [&'static str],
    value: String,
) -> DerivedField {
    (name, aliases, value)
}

fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
    values
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_volume(element_type: ElementType) -> Volume {
        let data = Array3::from_shape_fn((2, 4, 4), |(z, y, x)| {
            (z as f32 * 100.0) - (y as f32 * 7.0) + x as f32
        });
        Volume::new(
            data,
            Geometry {
                origin: [-12.25, 3.5, 100.125],
                spacing: [0.9765625, 0.9765625, 3.0],
                direction: [[0.0, 1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            },
            VolumeHeader {
                element_type,
                ..Default::default()
            },
        )
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p_001_ct.mha");
        let codec = MetaImageCodec;
        let original = sample_volume(ElementType::Short);

        codec.encode(&original, &path).unwrap();
        let decoded = codec.decode(&path).unwrap();
        assert_eq!(decoded.data, original.data);
        assert_eq!(decoded.geometry, original.geometry);
        assert_eq!(decoded.header.element_type, ElementType::Short);

        let again = dir.path().join("again.mha");
        codec.encode(&decoded, &again).unwrap();
        assert_eq!(fs::read(&path).unwrap(), fs::read(&again).unwrap());
    }

    #[test]
    fn compressed_big_endian_float_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("volume.mha");
        let codec = MetaImageCodec;
        let mut original = sample_volume(ElementType::Float);
        original.data.mapv_inplace(|v| v / 3.0);
        original.header.byte_order_msb = true;
        original.header.compressed = true;

        codec.encode(&original, &path).unwrap();
        let decoded = codec.decode(&path).unwrap();
        assert_eq!(decoded.data, original.data);
        assert!(decoded.header.compressed);
        assert!(decoded.header.byte_order_msb);
        assert!(decoded.header.field("CompressedDataSize").is_some());
    }

    #[test]
    fn reads_detached_header_and_keeps_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let header = "ObjectType = Image\n\
                      NDims = 3\n\
                      AnatomicalOrientation = RAI\n\
                      DimSize = 2 1 1\n\
                      ElementType = MET_USHORT\n\
                      ElementDataFile = image.bin\n";
        fs::write(dir.path().join("ct.mhd"), header).unwrap();
        fs::write(dir.path().join("image.bin"), [1u8, 0, 2, 1]).unwrap();

        let volume = MetaImageCodec.decode(&dir.path().join("ct.mhd")).unwrap();
        assert_eq!(volume.data.as_slice().unwrap(), &[1.0, 258.0]);
        assert_eq!(volume.geometry, Geometry::default());
        assert_eq!(volume.header.field("AnatomicalOrientation"), Some("RAI"));

        let out = dir.path().join("ct.mha");
        MetaImageCodec.encode(&volume, &out).unwrap();
        let text = String::from_utf8_lossy(&fs::read(&out).unwrap()).to_string();
        assert!(text.contains("AnatomicalOrientation = RAI\n"));
        assert!(text.contains("ElementDataFile = LOCAL\n"));
    }

    #[test]
    fn mhd_output_writes_a_sibling_data_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p_001_mr_t1.mhd");
        let original = sample_volume(ElementType::Short);

        MetaImageCodec.encode(&original, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("ElementDataFile = p_001_mr_t1.raw\n"));
        assert_eq!(
            fs::metadata(dir.path().join("p_001_mr_t1.raw")).unwrap().len(),
            (original.data.len() * 2) as u64
        );
        assert_eq!(MetaImageCodec.decode(&path).unwrap().data, original.data);
    }

    #[test]
    fn truncated_data_is_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.mha");
        fs::write(
            &path,
            b"NDims = 3\nDimSize = 2 2 2\nElementType = MET_SHORT\n\
              ElementDataFile = LOCAL\n\x01\x02",
        )
        .unwrap();

        let err = MetaImageCodec.decode(&path).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Decode {
                source: FormatError::DataSize {
                    expected: 16,
                    found: 2
                },
                ..
            }
        ));
    }

    #[test]
    fn oversized_dimensions_are_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.mha");
        fs::write(
            &path,
            b"NDims = 3\nDimSize = 4294967296 4294967296 4294967296\n\
              ElementType = MET_SHORT\nElementDataFile = LOCAL\n\x01\x02",
        )
        .unwrap();

        let err = MetaImageCodec.decode(&path).unwrap_err();
        match err {
            CodecError::Decode {
                source: FormatError::InvalidField { key, .. },
                ..
            } => assert_eq!(key, "DimSize"),
            other => panic!("expected an invalid DimSize, got {other:?}"),
        }
    }

    #[test]
    fn int32_elements_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.mha");
        let mut bytes = b"NDims = 3\nDimSize = 2 1 1\nElementType = MET_INT\n\
                          ElementDataFile = LOCAL\n"
            .to_vec();
        bytes.extend_from_slice(&16_777_217i32.to_le_bytes());
        bytes.extend_from_slice(&2_000_000_001i32.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let err = MetaImageCodec.decode(&path).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Decode {
                source: FormatError::UnsupportedElementType(ref name),
                ..
            } if name == "MET_INT"
        ));
    }

    #[test]
    fn missing_file_is_a_decode_error() {
        let err = MetaImageCodec
            .decode(Path::new("/nonexistent/p_001_ct.mha"))
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }
}
