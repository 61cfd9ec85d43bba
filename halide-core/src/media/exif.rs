//! EXIF extraction for scanned media.
//!
//! Missing or unparsable EXIF is normal (videos, RAW previews, stripped
//! exports), so every failure collapses to `None` instead of an error.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Reader, Tag, Value};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifSummary {
    pub taken_at: Option<DateTime<Utc>>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub iso: Option<u32>,
    pub aperture: Option<f32>,
    pub shutter_speed: Option<String>,
}

impl ExifSummary {
    pub fn is_empty(&self) -> bool {
        self == &ExifSummary::default()
    }
}

/// Read the EXIF fields the catalog cares about. Returns `None` when the
/// file cannot be opened or carries no usable EXIF block.
pub fn read_exif(path: &Path) -> Option<ExifSummary> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = Reader::new().read_from_container(&mut reader).ok()?;

    let mut summary = ExifSummary::default();

    for tag in [Tag::DateTimeOriginal, Tag::DateTime] {
        if summary.taken_at.is_none() {
            if let Some(field) = exif.get_field(tag, In::PRIMARY) {
                summary.taken_at = field_string(&field.value)
                    .as_deref()
                    .and_then(parse_exif_datetime);
            }
        }
    }

    if let Some(field) = exif.get_field(Tag::Make, In::PRIMARY) {
        summary.camera_make = field_string(&field.value).map(|s| s.trim().to_string());
    }
    if let Some(field) = exif.get_field(Tag::Model, In::PRIMARY) {
        summary.camera_model = field_string(&field.value).map(|s| s.trim().to_string());
    }

    for tag in [Tag::LensModel, Tag::LensMake] {
        if summary.lens.is_none() {
            if let Some(field) = exif.get_field(tag, In::PRIMARY) {
                summary.lens = field_string(&field.value);
            }
        }
    }

    for tag in [Tag::PhotographicSensitivity, Tag::ISOSpeed] {
        if summary.iso.is_none() {
            if let Some(field) = exif.get_field(tag, In::PRIMARY) {
                summary.iso = field_u32(&field.value);
            }
        }
    }

    if let Some(field) = exif.get_field(Tag::FNumber, In::PRIMARY) {
        summary.aperture = field_f32(&field.value);
    }
    if let Some(field) = exif.get_field(Tag::ExposureTime, In::PRIMARY) {
        summary.shutter_speed = field_string(&field.value);
    }

    if summary.is_empty() {
        None
    } else {
        Some(summary)
    }
}

fn field_string(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()),
        Value::Undefined(data, _) => {
            Some(String::from_utf8_lossy(data).trim_end_matches('\0').to_string())
        }
        other => Some(format!("{}", other.display_as(Tag::DateTime))),
    }
}

fn field_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Short(vec) => vec.first().map(|&v| u32::from(v)),
        Value::Long(vec) => vec.first().copied(),
        Value::Ascii(vec) => vec
            .first()
            .and_then(|bytes| String::from_utf8_lossy(bytes).trim_end_matches('\0').parse().ok()),
        _ => None,
    }
}

fn field_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Rational(vec) => vec
            .first()
            .filter(|r| r.denom != 0)
            .map(|r| r.num as f32 / r.denom as f32),
        Value::SRational(vec) => vec
            .first()
            .filter(|r| r.denom != 0)
            .map(|r| r.num as f32 / r.denom as f32),
        _ => None,
    }
}

/// EXIF datetime format is `YYYY:MM:DD HH:MM:SS`, assumed UTC.
fn parse_exif_datetime(raw: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(raw, "%Y:%m:%d %H:%M:%S") {
        Ok(dt) => Some(dt.and_utc()),
        Err(_) => {
            debug!("unparsable EXIF datetime: {raw}");
            None
        }
    }
}
