//! ENVI header parsing and rendering

use crate::types::{Dn, HsiError, HsiResult, RawCube};
use ndarray::Array3;

/// ENVI `data type` codes handled by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnviDataType {
    U8,
    F32,
    U16,
}

impl EnviDataType {
    pub fn from_code(code: u32) -> HsiResult<Self> {
        match code {
            1 => Ok(EnviDataType::U8),
            4 => Ok(EnviDataType::F32),
            12 => Ok(EnviDataType::U16),
            other => Err(HsiError::InvalidFormat(format!("Unsupported ENVI data type {}", other))),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            EnviDataType::U8 => 1,
            EnviDataType::F32 => 4,
            EnviDataType::U16 => 12,
        }
    }

    pub fn size(self) -> usize {
        match self {
            EnviDataType::U8 => 1,
            EnviDataType::U16 => 2,
            EnviDataType::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interleave {
    Bsq,
    Bil,
    Bip,
}

impl Interleave {
    pub fn parse(value: &str) -> HsiResult<Self> {
        match value.trim().to_lowercase().as_str() {
            "bsq" => Ok(Interleave::Bsq),
            "bil" => Ok(Interleave::Bil),
            "bip" => Ok(Interleave::Bip),
            other => Err(HsiError::InvalidFormat(format!("Unknown ENVI interleave '{}'", other))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interleave::Bsq => "bsq",
            Interleave::Bil => "bil",
            Interleave::Bip => "bip",
        }
    }
}

/// Raster geometry and encoding described by a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterLayout {
    pub samples: usize,
    pub lines: usize,
    pub bands: usize,
    pub header_offset: usize,
    pub data_type: EnviDataType,
    pub interleave: Interleave,
    pub big_endian: bool,
}

impl RasterLayout {
    /// Bytes of raster payload, `InvalidFormat` if the dimensions overflow
    pub fn data_len(&self) -> HsiResult<usize> {
        self.samples
            .checked_mul(self.lines)
            .and_then(|n| n.checked_mul(self.bands))
            .and_then(|n| n.checked_mul(self.data_type.size()))
            .ok_or_else(|| {
                HsiError::InvalidFormat(format!(
                    "ENVI raster of {} samples x {} lines x {} bands is too large",
                    self.samples, self.lines, self.bands
                ))
            })
    }

    /// Header offset plus payload
    pub fn file_len(&self) -> HsiResult<usize> {
        self.header_offset.checked_add(self.data_len()?).ok_or_else(|| {
            HsiError::InvalidFormat(format!("ENVI header offset {} is too large", self.header_offset))
        })
    }
}

/// Ordered `key = value` fields of an ENVI header
///
/// Keys are stored lower case. Brace-delimited values keep their braces so
/// list values can be told apart from scalars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnviHeader {
    fields: Vec<(String, String)>,
}

impl EnviHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> HsiResult<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        match lines.next() {
            Some(magic) if magic.eq_ignore_ascii_case("ENVI") => {}
            _ => return Err(HsiError::InvalidFormat("Missing ENVI header magic".to_string())),
        }

        let mut header = EnviHeader::new();
        let mut pending: Option<(String, String)> = None;

        for line in lines {
            if let Some((key, mut value)) = pending.take() {
                value.push(' ');
                value.push_str(line);
                if line.contains('}') {
                    header.set(&key, value);
                } else {
                    pending = Some((key, value));
                }
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                HsiError::InvalidFormat(format!("Malformed ENVI header line '{}'", line))
            })?;
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();
            if value.starts_with('{') && !value.contains('}') {
                pending = Some((key, value));
            } else {
                header.set(&key, value);
            }
        }

        if let Some((key, _)) = pending {
            return Err(HsiError::InvalidFormat(format!("Unterminated ENVI header value for '{}'", key)));
        }
        Ok(header)
    }

    /// Insert or replace a field
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = key.trim().to_lowercase();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(field) => field.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.fields.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    /// Field value with surrounding braces removed
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| strip_braces(v).trim().to_string())
    }

    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            strip_braces(v)
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
    }

    pub fn get_f64_list(&self, key: &str) -> HsiResult<Option<Vec<f64>>> {
        match self.get_list(key) {
            None => Ok(None),
            Some(items) => items
                .iter()
                .map(|item| {
                    item.parse::<f64>().map_err(|e| {
                        HsiError::InvalidFormat(format!("Bad value '{}' in ENVI field '{}': {}", item, key, e))
                    })
                })
                .collect::<HsiResult<Vec<f64>>>()
                .map(Some),
        }
    }

    fn required_usize(&self, key: &str) -> HsiResult<usize> {
        let value = self
            .get(key)
            .ok_or_else(|| HsiError::InvalidFormat(format!("ENVI header lacks '{}'", key)))?;
        value
            .trim()
            .parse::<usize>()
            .map_err(|e| HsiError::InvalidFormat(format!("ENVI field '{}' = '{}': {}", key, value, e)))
    }

    fn optional_usize(&self, key: &str, default: usize) -> HsiResult<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.required_usize(key),
        }
    }

    pub fn layout(&self) -> HsiResult<RasterLayout> {
        let data_type = EnviDataType::from_code(self.required_usize("data type")? as u32)?;
        let interleave = Interleave::parse(self.get("interleave").unwrap_or("bsq"))?;
        let big_endian = match self.optional_usize("byte order", 0)? {
            0 => false,
            1 => true,
            other => return Err(HsiError::InvalidFormat(format!("Invalid ENVI byte order {}", other))),
        };

        Ok(RasterLayout {
            samples: self.required_usize("samples")?,
            lines: self.required_usize("lines")?,
            bands: self.required_usize("bands")?,
            header_offset: self.optional_usize("header offset", 0)?,
            data_type,
            interleave,
            big_endian,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("ENVI\n");
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

fn strip_braces(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or(value)
}

/// Wrap a value in braces, dropping braces it contains
pub fn braced(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| *c != '{' && *c != '}').collect();
    format!("{{{}}}", cleaned)
}

/// Decode raw ENVI samples into a (lines, samples, bands) DN cube
pub fn decode_raw_cube(bytes: &[u8], layout: &RasterLayout) -> HsiResult<RawCube> {
    if layout.samples == 0 || layout.lines == 0 || layout.bands == 0 {
        return Err(HsiError::InvalidFormat(format!(
            "ENVI raster has an empty dimension ({} samples, {} lines, {} bands)",
            layout.samples, layout.lines, layout.bands
        )));
    }

    let start = layout.header_offset;
    let end = layout.file_len()?;
    if bytes.len() < end {
        return Err(HsiError::InvalidFormat(format!(
            "ENVI data holds {} bytes, header describes {}",
            bytes.len(),
            end
        )));
    }
    let payload = &bytes[start..end];

    let values: Vec<Dn> = match layout.data_type {
        EnviDataType::U8 => payload.iter().map(|&b| Dn::from(b)).collect(),
        EnviDataType::U16 => payload
            .chunks_exact(2)
            .map(|pair| {
                let raw = [pair[0], pair[1]];
                if layout.big_endian {
                    u16::from_be_bytes(raw)
                } else {
                    u16::from_le_bytes(raw)
                }
            })
            .collect(),
        EnviDataType::F32 => {
            return Err(HsiError::InvalidFormat(
                "Raw scans must be integer DN (data type 1 or 12)".to_string(),
            ))
        }
    };

    let (l, s, b) = (layout.lines, layout.samples, layout.bands);
    let shape_error = |e: ndarray::ShapeError| HsiError::InvalidFormat(format!("ENVI raster shape: {}", e));
    let cube = match layout.interleave {
        Interleave::Bip => Array3::from_shape_vec((l, s, b), values).map_err(shape_error)?,
        Interleave::Bil => Array3::from_shape_vec((l, b, s), values)
            .map_err(shape_error)?
            .permuted_axes([0, 2, 1])
            .as_standard_layout()
            .into_owned(),
        Interleave::Bsq => Array3::from_shape_vec((b, l, s), values)
            .map_err(shape_error)?
            .permuted_axes([1, 2, 0])
            .as_standard_layout()
            .into_owned(),
    };
    Ok(cube)
}
