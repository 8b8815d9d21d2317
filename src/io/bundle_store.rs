//! Calibration bundles stored as folders on disk
//!
//! ```text
//! <root>/vnir_20170101_20170601/
//!     bundle.xml
//!     dark.txt[.gz]
//!     gain.txt[.gz]
//!     wavelengths.txt[.gz]     (lookup mapping only)
//! ```

use crate::core::bundle::{BandReindex, CalibrationBundle, WavelengthMapping};
use crate::core::repository::BundleSource;
use crate::types::{Dn, HsiError, HsiResult, SensorVariant};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use flate2::read::GzDecoder;
use ndarray::Array1;
use num_traits::Float;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

pub const MANIFEST_FILE: &str = "bundle.xml";
pub const DARK_FILE: &str = "dark.txt";
pub const GAIN_FILE: &str = "gain.txt";

/// `bundle.xml`
#[derive(Debug, Default, Deserialize)]
pub struct BundleManifest {
    #[serde(rename = "sensorVariant")]
    pub sensor_variant: Option<String>,
    #[serde(rename = "validFrom")]
    pub valid_from: Option<String>,
    #[serde(rename = "validUntil")]
    pub valid_until: Option<String>,
    #[serde(rename = "saturationValue")]
    pub saturation_value: Option<Dn>,
    #[serde(rename = "wavelengthMapping")]
    pub wavelength_mapping: Option<MappingElement>,
    #[serde(rename = "bandReindex")]
    pub band_reindex: Option<ReindexElement>,
}

#[derive(Debug, Deserialize)]
pub struct MappingElement {
    pub kind: String,
    pub coefficients: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReindexElement {
    pub kind: String,
    pub start: Option<usize>,
    pub indices: Option<String>,
}

impl BundleManifest {
    pub fn parse(xml_content: &str) -> HsiResult<Self> {
        from_str::<BundleManifest>(xml_content)
            .map_err(|e| HsiError::Xml(format!("Failed to parse bundle manifest: {}", e)))
    }
}

/// A bundle folder that could not be loaded
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedBundle {
    pub path: PathBuf,
    pub reason: String,
}

/// Variant and validity window parsed from a folder name
#[derive(Debug, Clone, PartialEq)]
pub struct FolderIdentity {
    pub sensor_variant: SensorVariant,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Parse `<variant>_<YYYYMMDD>_<YYYYMMDD|open>`
pub fn parse_folder_name(name: &str) -> Option<FolderIdentity> {
    let pattern = Regex::new(r"^(?P<variant>[A-Za-z0-9]+)_(?P<from>\d{8})_(?P<until>\d{8}|open)$").ok()?;
    let caps = pattern.captures(name)?;
    let day = |text: &str| {
        NaiveDate::parse_from_str(text, "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt))
    };

    let valid_from = day(&caps["from"])?;
    let valid_until = match &caps["until"] {
        "open" => None,
        text => Some(day(text)?),
    };
    Some(FolderIdentity {
        sensor_variant: SensorVariant::new(&caps["variant"]),
        valid_from,
        valid_until,
    })
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC)
fn parse_timestamp(text: &str) -> HsiResult<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| HsiError::CalibrationLoad(format!("Unrecognised timestamp '{}'", text)))
}

/// Whitespace or comma separated numbers
pub fn parse_numbers<T>(text: &str, source: &str) -> HsiResult<Vec<T>>
where
    T: Float + FromStr,
    T::Err: std::fmt::Display,
{
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            let value = token
                .parse::<T>()
                .map_err(|e| HsiError::CalibrationLoad(format!("{}: bad number '{}': {}", source, token, e)))?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(HsiError::CalibrationLoad(format!("{}: non-finite value '{}'", source, token)))
            }
        })
        .collect()
}

/// Read `name` from `dir`, falling back to a gzip-compressed `name.gz`
fn read_text(dir: &Path, name: &str) -> HsiResult<String> {
    let plain = dir.join(name);
    if plain.is_file() {
        return Ok(fs::read_to_string(plain)?);
    }

    let compressed = dir.join(format!("{}.gz", name));
    if compressed.is_file() {
        let mut decoder = GzDecoder::new(File::open(&compressed)?);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| HsiError::CalibrationLoad(format!("{}: {}", compressed.display(), e)))?;
        return Ok(text);
    }

    Err(HsiError::CalibrationLoad(format!("{} is missing {}", dir.display(), name)))
}

fn read_coefficients(dir: &Path, name: &str) -> HsiResult<Array1<f32>> {
    let text = read_text(dir, name)?;
    Ok(Array1::from(parse_numbers::<f32>(&text, name)?))
}

/// Load a single bundle folder
pub fn load_bundle(dir: &Path) -> HsiResult<CalibrationBundle> {
    let id = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| HsiError::CalibrationLoad(format!("{} has no folder name", dir.display())))?;
    let manifest = read_manifest(dir)?;
    let identity = resolve_identity(&id, &manifest)?;

    let mapping = match &manifest.wavelength_mapping {
        None => {
            return Err(HsiError::CalibrationLoad(format!(
                "Bundle {} declares no wavelength mapping",
                id
            )))
        }
        Some(element) => match element.kind.trim().to_lowercase().as_str() {
            "polynomial" => {
                let text = element.coefficients.as_deref().unwrap_or("");
                WavelengthMapping::Polynomial {
                    coefficients: parse_numbers::<f64>(text, "wavelengthMapping/coefficients")?,
                }
            }
            "lookup" => {
                let file = element.file.as_deref().unwrap_or("wavelengths.txt");
                WavelengthMapping::LookupTable {
                    wavelengths: parse_numbers::<f64>(&read_text(dir, file)?, file)?,
                }
            }
            other => {
                return Err(HsiError::CalibrationLoad(format!(
                    "Bundle {}: unknown wavelength mapping kind '{}'",
                    id, other
                )))
            }
        },
    };

    let mut bundle = CalibrationBundle::new(
        id.clone(),
        identity.sensor_variant,
        identity.valid_from,
        identity.valid_until,
        read_coefficients(dir, DARK_FILE)?,
        read_coefficients(dir, GAIN_FILE)?,
        mapping,
    )?;

    if let Some(element) = &manifest.band_reindex {
        let rule = match element.kind.trim().to_lowercase().as_str() {
            "offset" => BandReindex::Offset {
                start: element.start.ok_or_else(|| {
                    HsiError::CalibrationLoad(format!("Bundle {}: offset reindex without start", id))
                })?,
            },
            "explicit" => BandReindex::Explicit {
                indices: element
                    .indices
                    .as_deref()
                    .unwrap_or("")
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|t| !t.is_empty())
                    .map(|t| {
                        t.parse::<usize>().map_err(|e| {
                            HsiError::CalibrationLoad(format!("Bundle {}: bad reindex index '{}': {}", id, t, e))
                        })
                    })
                    .collect::<HsiResult<Vec<usize>>>()?,
            },
            other => {
                return Err(HsiError::CalibrationLoad(format!(
                    "Bundle {}: unknown band reindex kind '{}'",
                    id, other
                )))
            }
        };
        bundle = bundle.with_band_reindex(rule)?;
    }
    if let Some(saturation) = manifest.saturation_value {
        bundle = bundle.with_saturation_value(saturation);
    }

    log::debug!("Loaded bundle {} ({} bands)", bundle.id(), bundle.band_count());
    Ok(bundle)
}

fn read_manifest(dir: &Path) -> HsiResult<BundleManifest> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Ok(BundleManifest::default());
    }
    BundleManifest::parse(&fs::read_to_string(path)?)
}

/// Manifest fields override what the folder name says
fn resolve_identity(id: &str, manifest: &BundleManifest) -> HsiResult<FolderIdentity> {
    let from_name = parse_folder_name(id);

    let sensor_variant = match (&manifest.sensor_variant, &from_name) {
        (Some(tag), _) => SensorVariant::new(tag),
        (None, Some(identity)) => identity.sensor_variant.clone(),
        (None, None) => {
            return Err(HsiError::CalibrationLoad(format!(
                "Bundle {}: sensor variant neither in folder name nor manifest",
                id
            )))
        }
    };
    let valid_from = match (&manifest.valid_from, &from_name) {
        (Some(text), _) => parse_timestamp(text)?,
        (None, Some(identity)) => identity.valid_from,
        (None, None) => {
            return Err(HsiError::CalibrationLoad(format!("Bundle {}: no validity start", id)))
        }
    };
    let valid_until = match (&manifest.valid_until, &from_name) {
        (Some(text), _) if text.trim().is_empty() || text.trim().eq_ignore_ascii_case("open") => None,
        (Some(text), _) => Some(parse_timestamp(text)?),
        (None, Some(identity)) => identity.valid_until,
        (None, None) => None,
    };

    Ok(FolderIdentity {
        sensor_variant,
        valid_from,
        valid_until,
    })
}

/// Bundle folders under one calibration root
pub struct FsBundleStore {
    root: PathBuf,
    strict: bool,
    rejected: Mutex<Vec<RejectedBundle>>,
}

impl FsBundleStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            strict: false,
            rejected: Mutex::new(Vec::new()),
        }
    }

    /// Fail the variant load on the first malformed bundle instead of skipping it
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bundles skipped so far
    pub fn rejected(&self) -> Vec<RejectedBundle> {
        self.rejected.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn reject(&self, path: &Path, error: &HsiError) {
        log::warn!("Skipping malformed calibration bundle {}: {}", path.display(), error);
        let mut rejected = self.rejected.lock().unwrap_or_else(|p| p.into_inner());
        let entry = RejectedBundle {
            path: path.to_path_buf(),
            reason: error.to_string(),
        };
        if !rejected.contains(&entry) {
            rejected.push(entry);
        }
    }

    fn bundle_dirs(&self) -> HsiResult<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(HsiError::CalibrationLoad(format!(
                "Calibration root {} does not exist",
                self.root.display()
            )));
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if entry.file_type()?.is_dir() && !hidden {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Cheap variant check from manifest or folder name, before reading arrays
    fn belongs_to(&self, dir: &Path, variant: &SensorVariant) -> HsiResult<bool> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !dir.join(MANIFEST_FILE).is_file() && parse_folder_name(&name).is_none() {
            log::debug!("Ignoring {}: not a calibration bundle folder", dir.display());
            return Ok(false);
        }
        let manifest = read_manifest(dir)?;
        Ok(resolve_identity(&name, &manifest)?.sensor_variant == *variant)
    }
}

impl BundleSource for FsBundleStore {
    fn load_variant(&self, variant: &SensorVariant) -> HsiResult<Vec<CalibrationBundle>> {
        let mut bundles = Vec::new();
        for dir in self.bundle_dirs()? {
            let outcome = self
                .belongs_to(&dir, variant)
                .and_then(|matches| if matches { load_bundle(&dir).map(Some) } else { Ok(None) });
            match outcome {
                Ok(Some(bundle)) => bundles.push(bundle),
                Ok(None) => {}
                Err(e) if self.strict => {
                    return Err(HsiError::CalibrationLoad(format!("{}: {}", dir.display(), e)));
                }
                Err(e) => self.reject(&dir, &e),
            }
        }
        Ok(bundles)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}
