//! MetaImage (`.mhd` + `.raw`) reading and writing.
//!
//! Only uncompressed, little-endian, three-dimensional scalar images are
//! supported. `TransformMatrix` lists the direction matrix column by column,
//! so the first three numbers are the physical direction of the x index axis.

use crate::enums::PixelType;
use crate::geometry::ImageGeometry;
use crate::volume::{Volume, VolumeError};

use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::Array3;
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaImageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Missing header field {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("Unsupported MetaImage feature: {0}")]
    Unsupported(String),

    #[error("Data file holds {actual} bytes, expected {expected}")]
    TruncatedData { expected: usize, actual: usize },

    #[error(transparent)]
    Volume(#[from] VolumeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ElementType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    Double,
}

impl ElementType {
    fn parse(value: &str) -> Result<Self, MetaImageError> {
        Ok(match value {
            "MET_CHAR" => ElementType::Char,
            "MET_UCHAR" => ElementType::UChar,
            "MET_SHORT" => ElementType::Short,
            "MET_USHORT" => ElementType::UShort,
            "MET_INT" => ElementType::Int,
            "MET_UINT" => ElementType::UInt,
            "MET_FLOAT" => ElementType::Float,
            "MET_DOUBLE" => ElementType::Double,
            other => return Err(MetaImageError::Unsupported(format!("ElementType {other}"))),
        })
    }

    fn name(self) -> &'static str {
        match self {
            ElementType::Char => "MET_CHAR",
            ElementType::UChar => "MET_UCHAR",
            ElementType::Short => "MET_SHORT",
            ElementType::UShort => "MET_USHORT",
            ElementType::Int => "MET_INT",
            ElementType::UInt => "MET_UINT",
            ElementType::Float => "MET_FLOAT",
            ElementType::Double => "MET_DOUBLE",
        }
    }

    fn byte_size(self) -> usize {
        match self {
            ElementType::Char | ElementType::UChar => 1,
            ElementType::Short | ElementType::UShort => 2,
            ElementType::Int | ElementType::UInt | ElementType::Float => 4,
            ElementType::Double => 8,
        }
    }

    fn decode(self, bytes: &[u8]) -> Vec<f32> {
        let width = self.byte_size();
        bytes
            .chunks_exact(width)
            .map(|b| match self {
                ElementType::Char => b[0] as i8 as f32,
                ElementType::UChar => b[0] as f32,
                ElementType::Short => i16::from_le_bytes([b[0], b[1]]) as f32,
                ElementType::UShort => u16::from_le_bytes([b[0], b[1]]) as f32,
                ElementType::Int => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
                ElementType::UInt => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
                ElementType::Float => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                ElementType::Double => {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                }
            })
            .collect()
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MetaImageError + '_ {
    move |source| MetaImageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parse_numbers<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    field: &'static str,
    count: usize,
) -> Result<Option<Vec<T>>, MetaImageError> {
    let Some(value) = fields.get(field) else {
        return Ok(None);
    };
    let invalid = || MetaImageError::InvalidField {
        field,
        value: value.clone(),
    };
    let numbers = value
        .split_whitespace()
        .map(|token| token.parse::<T>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    if numbers.len() != count {
        return Err(invalid());
    }
    Ok(Some(numbers))
}

fn is_true(fields: &HashMap<String, String>, field: &str) -> bool {
    fields
        .get(field)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Read a MetaImage header and its voxel data.
pub fn read(path: &Path) -> Result<Volume, MetaImageError> {
    let bytes = fs::read(path).map_err(io_error(path))?;

    // Header lines run up to and including ElementDataFile.
    let mut fields = HashMap::new();
    let mut offset = 0;
    let mut data_file = None;
    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |p| offset + p + 1);
        let line = String::from_utf8_lossy(&bytes[offset..end]);
        offset = end;
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim().to_string(), value.trim().to_string());
        if key == "ElementDataFile" {
            data_file = Some(value);
            break;
        }
        fields.insert(key, value);
    }
    let data_file = data_file.ok_or(MetaImageError::MissingField("ElementDataFile"))?;

    if let Some(ndims) = fields.get("NDims") {
        if ndims != "3" {
            return Err(MetaImageError::Unsupported(format!("NDims = {ndims}")));
        }
    }
    if is_true(&fields, "CompressedData") {
        return Err(MetaImageError::Unsupported("compressed data".to_string()));
    }
    if is_true(&fields, "BinaryDataByteOrderMSB") || is_true(&fields, "ElementByteOrderMSB") {
        return Err(MetaImageError::Unsupported("big-endian data".to_string()));
    }
    if let Some(channels) = fields.get("ElementNumberOfChannels") {
        if channels != "1" {
            return Err(MetaImageError::Unsupported(format!("{channels} channels")));
        }
    }

    let size: Vec<usize> =
        parse_numbers(&fields, "DimSize", 3)?.ok_or(MetaImageError::MissingField("DimSize"))?;
    let spacing: Vec<f64> = match parse_numbers(&fields, "ElementSpacing", 3)? {
        Some(spacing) => spacing,
        None => vec![1.0; 3],
    };
    let origin: Vec<f64> = match parse_numbers(&fields, "Offset", 3)? {
        Some(origin) => origin,
        None => parse_numbers(&fields, "Origin", 3)?.unwrap_or_else(|| vec![0.0; 3]),
    };
    let direction = match parse_numbers::<f64>(&fields, "TransformMatrix", 9)? {
        Some(m) => Matrix3::from_column_slice(&m),
        None => Matrix3::identity(),
    };
    let element_type = ElementType::parse(
        fields
            .get("ElementType")
            .ok_or(MetaImageError::MissingField("ElementType"))?,
    )?;

    let raw = if data_file == "LOCAL" {
        bytes[offset..].to_vec()
    } else {
        let data_path = path
            .parent()
            .map_or_else(|| PathBuf::from(&data_file), |dir| dir.join(&data_file));
        fs::read(&data_path).map_err(io_error(&data_path))?
    };

    let expected = size
        .iter()
        .try_fold(element_type.byte_size(), |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| MetaImageError::InvalidField {
            field: "DimSize",
            value: format!("{size:?}"),
        })?;
    if raw.len() < expected {
        return Err(MetaImageError::TruncatedData {
            expected,
            actual: raw.len(),
        });
    }

    let values = element_type.decode(&raw[..expected]);
    let data = Array3::from_shape_vec((size[2], size[1], size[0]), values).map_err(|_| {
        MetaImageError::InvalidField {
            field: "DimSize",
            value: format!("{size:?}"),
        }
    })?;

    let geometry = ImageGeometry::new(
        [size[0], size[1], size[2]],
        Vector3::from_column_slice(&spacing),
        Point3::from_slice(&origin),
        direction,
    );
    Ok(Volume::new(data, geometry)?)
}

fn join(values: impl IntoIterator<Item = f64>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The `.raw` file that [`write`] puts next to the header at `path`.
pub fn data_file_path(path: &Path) -> PathBuf {
    path.with_extension("raw")
}

/// Write `volume` as `<path>` (header) and `<path>` with a `.raw` extension (data).
pub fn write(volume: &Volume, path: &Path, pixel_type: PixelType) -> Result<(), MetaImageError> {
    let data_path = data_file_path(path);
    let data_name = data_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| MetaImageError::InvalidField {
            field: "ElementDataFile",
            value: data_path.display().to_string(),
        })?
        .to_string();

    let geometry = volume.geometry();
    let element_type = match pixel_type {
        PixelType::U8 => ElementType::UChar,
        PixelType::F32 => ElementType::Float,
    };

    let header = [
        "ObjectType = Image".to_string(),
        "NDims = 3".to_string(),
        "BinaryData = True".to_string(),
        "BinaryDataByteOrderMSB = False".to_string(),
        "CompressedData = False".to_string(),
        format!("TransformMatrix = {}", join(geometry.direction.iter().copied())),
        format!("Offset = {}", join(geometry.origin.iter().copied())),
        "CenterOfRotation = 0 0 0".to_string(),
        format!("ElementSpacing = {}", join(geometry.spacing.iter().copied())),
        format!(
            "DimSize = {} {} {}",
            geometry.size[0], geometry.size[1], geometry.size[2]
        ),
        format!("ElementType = {}", element_type.name()),
        format!("ElementDataFile = {data_name}"),
    ]
    .join("\n");

    let file = fs::File::create(&data_path).map_err(io_error(&data_path))?;
    let mut buf = BufWriter::new(file);
    for &value in volume.data().iter() {
        let result = match element_type {
            ElementType::UChar => buf.write_all(&[value.round().clamp(0.0, 255.0) as u8]),
            _ => buf.write_all(&value.to_le_bytes()),
        };
        result.map_err(io_error(&data_path))?;
    }
    buf.flush().map_err(io_error(&data_path))?;

    fs::write(path, header + "\n").map_err(io_error(path))
}
