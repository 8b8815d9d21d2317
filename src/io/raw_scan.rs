//! Raw push-broom scan reader
//!
//! A scan is an ENVI pair (`<name>_raw` + `<name>_raw.hdr`) with an optional
//! `settings.txt`, found in a directory, a zip archive, or a zip archive
//! behind an http(s) URL. A gantry upload is complete once the pair, the
//! preview `image.jpg`, `frameIndex.txt` and `settings.txt` are all present.

use crate::core::orchestrator::{JobDescriptor, RawScanSource};
use crate::io::envi::{decode_raw_cube, EnviDataType, EnviHeader};
use crate::types::{Dn, HsiError, HsiResult, InstrumentMetadata, RawScan, SensorVariant};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zip::ZipArchive;

const RAW_SUFFIX: &str = "_raw";
const HEADER_SUFFIX: &str = "_raw.hdr";
const SETTINGS_FILE: &str = "settings.txt";

/// Name suffixes that must all be present before a scan is admitted
pub const UPLOAD_FILES: [&str; 5] = [RAW_SUFFIX, HEADER_SUFFIX, "image.jpg", "frameIndex.txt", SETTINGS_FILE];

/// Upper bound for header and settings entries read from archives
const MAX_TEXT_ENTRY: u64 = 1 << 20;

/// Where a raw scan lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLocation {
    Directory(PathBuf),
    Zip(PathBuf),
    Remote(String),
}

impl RawLocation {
    pub fn parse(location: &str) -> Self {
        let trimmed = location.trim();
        let lower = trimmed.to_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            RawLocation::Remote(trimmed.to_string())
        } else if lower.ends_with(".zip") {
            RawLocation::Zip(PathBuf::from(trimmed))
        } else {
            RawLocation::Directory(PathBuf::from(trimmed))
        }
    }
}

/// Files of one scan, loaded into memory
#[derive(Debug, Clone)]
pub struct RawFiles {
    pub name: String,
    pub header: String,
    pub data: Vec<u8>,
    pub settings: Option<String>,
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Pick the data and header entries out of a file listing
fn find_pair<'a>(names: impl Iterator<Item = &'a str>) -> (Option<String>, Option<String>, Option<String>) {
    let mut names: Vec<&str> = names.collect();
    names.sort_unstable();

    let mut raw = None;
    let mut header = None;
    let mut settings = None;
    for name in names {
        let base = file_name(name);
        if base.ends_with(HEADER_SUFFIX) && header.is_none() {
            header = Some(name.to_string());
        } else if base.ends_with(RAW_SUFFIX) && raw.is_none() {
            raw = Some(name.to_string());
        } else if base == SETTINGS_FILE && settings.is_none() {
            settings = Some(name.to_string());
        }
    }
    (raw, header, settings)
}

/// Upload files absent from a listing, in [`UPLOAD_FILES`] order
pub fn missing_upload_files<'a>(names: impl Iterator<Item = &'a str>) -> Vec<&'static str> {
    let bases: Vec<&str> = names.map(file_name).collect();
    UPLOAD_FILES
        .iter()
        .copied()
        .filter(|suffix| !bases.iter().any(|base| base.ends_with(suffix)))
        .collect()
}

fn missing_pair(location: &str) -> HsiError {
    HsiError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("No '*{}' / '*{}' pair at {}", RAW_SUFFIX, HEADER_SUFFIX, location),
    ))
}

/// Reads ENVI raw scans from local or remote locations
#[derive(Debug, Clone)]
pub struct EnviRawSource {
    http_timeout: Duration,
}

impl EnviRawSource {
    pub fn new(http_timeout: Duration) -> Self {
        Self { http_timeout }
    }

    /// Read and decode the scan at `location`
    pub fn read(
        &self,
        location: &str,
        sensor_variant: &SensorVariant,
        acquisition_time: DateTime<Utc>,
    ) -> HsiResult<RawScan> {
        log::info!("Reading raw scan from {}", location);
        let start = std::time::Instant::now();

        let files = self.load_files(location)?;
        let header = EnviHeader::parse(&files.header)?;
        let layout = header.layout()?;
        let cube = decode_raw_cube(&files.data, &layout)?;

        let mut instrument = match &files.settings {
            Some(text) => parse_settings(text),
            None => InstrumentMetadata::default(),
        };
        let type_max = match layout.data_type {
            EnviDataType::U8 => Dn::from(u8::MAX),
            _ => Dn::MAX,
        };
        instrument.saturation_value = instrument.saturation_value.min(type_max);

        log::info!(
            "Read {} ({} lines x {} samples x {} bands, {}) in {:.3}s",
            files.name,
            layout.lines,
            layout.samples,
            layout.bands,
            layout.interleave.as_str(),
            start.elapsed().as_secs_f64()
        );

        Ok(RawScan {
            cube,
            sensor_variant: sensor_variant.clone(),
            acquisition_time,
            instrument,
        })
    }

    pub fn load_files(&self, location: &str) -> HsiResult<RawFiles> {
        match RawLocation::parse(location) {
            RawLocation::Directory(dir) => load_from_directory(&dir),
            RawLocation::Zip(path) => {
                let file = File::open(&path)?;
                load_from_archive(file, &path.display().to_string())
            }
            RawLocation::Remote(url) => {
                let bytes = self.download(&url)?;
                load_from_archive(Cursor::new(bytes), &url)
            }
        }
    }

    /// Whether the upload at `location` is complete
    ///
    /// Remote archives cannot be listed without downloading them, so only
    /// their reachability is checked.
    pub fn has_required_files(&self, location: &str) -> bool {
        let missing = match RawLocation::parse(location) {
            RawLocation::Directory(dir) => match list_directory(&dir) {
                Ok(names) => missing_upload_files(names.iter().map(String::as_str)),
                Err(_) => return false,
            },
            RawLocation::Zip(path) => match File::open(&path).ok().and_then(|f| ZipArchive::new(f).ok()) {
                Some(archive) => missing_upload_files(archive.file_names()),
                None => return false,
            },
            RawLocation::Remote(url) => return self.is_reachable(&url),
        };
        if !missing.is_empty() {
            log::debug!("Upload at {} is incomplete, missing {:?}", location, missing);
        }
        missing.is_empty()
    }

    fn is_reachable(&self, url: &str) -> bool {
        self.client()
            .and_then(|client| {
                client
                    .head(url)
                    .send()
                    .map_err(|e| HsiError::TransientIo(e.to_string()))
            })
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    fn client(&self) -> HsiResult<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(self.http_timeout)
            .user_agent(concat!("hypercal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HsiError::Config(format!("Failed to create HTTP client: {}", e)))
    }

    fn download(&self, url: &str) -> HsiResult<Vec<u8>> {
        log::info!("Downloading raw scan archive from {}", url);
        let response = self.client()?.get(url).send().map_err(|e| {
            HsiError::TransientIo(format!("HTTP request to {} failed: {}", url, e))
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(HsiError::TransientIo(format!("HTTP {} from {}", status.as_u16(), url)));
        }
        if !status.is_success() {
            return Err(HsiError::InvalidFormat(format!("HTTP {} from {}", status.as_u16(), url)));
        }

        let bytes = response
            .bytes()
            .map_err(|e| HsiError::TransientIo(format!("Failed to read response body from {}: {}", url, e)))?;
        log::debug!("Downloaded {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }
}

impl RawScanSource for EnviRawSource {
    fn read_scan(&self, descriptor: &JobDescriptor) -> HsiResult<RawScan> {
        self.read(
            &descriptor.raw_data_location,
            &descriptor.sensor_variant,
            descriptor.acquisition_timestamp,
        )
    }

    fn has_required_files(&self, location: &str) -> bool {
        EnviRawSource::has_required_files(self, location)
    }
}

fn list_directory(dir: &Path) -> HsiResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn load_from_directory(dir: &Path) -> HsiResult<RawFiles> {
    let names = list_directory(dir)?;
    let (raw, header, settings) = find_pair(names.iter().map(String::as_str));
    let (raw, header) = match (raw, header) {
        (Some(raw), Some(header)) => (raw, header),
        _ => return Err(missing_pair(&dir.display().to_string())),
    };

    Ok(RawFiles {
        name: raw.clone(),
        header: fs::read_to_string(dir.join(&header))?,
        data: fs::read(dir.join(&raw))?,
        settings: settings.map(|s| fs::read_to_string(dir.join(s))).transpose()?,
    })
}

fn load_from_archive<R: Read + Seek>(reader: R, location: &str) -> HsiResult<RawFiles> {
    let mut archive = ZipArchive::new(reader)
        .map_err(|e| HsiError::InvalidFormat(format!("Failed to open ZIP {}: {}", location, e)))?;
    let (raw, header, settings) = find_pair(archive.file_names());
    let (raw, header) = match (raw, header) {
        (Some(raw), Some(header)) => (raw, header),
        _ => return Err(missing_pair(location)),
    };

    let header_text = String::from_utf8(read_entry(&mut archive, &header, MAX_TEXT_ENTRY)?)
        .map_err(|e| HsiError::InvalidFormat(format!("{} is not UTF-8: {}", header, e)))?;
    // The header bounds how much of the data entry is worth reading
    let expected = EnviHeader::parse(&header_text)?.layout()?.file_len()?;
    let data = read_entry(&mut archive, &raw, expected as u64)?;
    let settings = match settings {
        Some(name) => {
            let bytes = read_entry(&mut archive, &name, MAX_TEXT_ENTRY)?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => None,
    };

    Ok(RawFiles {
        name: file_name(&raw).to_string(),
        header: header_text,
        data,
        settings,
    })
}

/// Read an archive entry of at most `limit` bytes
///
/// The declared size is not trusted: reading stops one byte past `limit`.
fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str, limit: u64) -> HsiResult<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| HsiError::InvalidFormat(format!("Failed to read {}: {}", name, e)))?;
    let too_large = |size: u64| {
        HsiError::InvalidFormat(format!("{} holds {} bytes, at most {} expected", name, size, limit))
    };
    if entry.size() > limit {
        return Err(too_large(entry.size()));
    }

    let mut buffer = Vec::new();
    entry.take(limit.saturating_add(1)).read_to_end(&mut buffer)?;
    if buffer.len() as u64 > limit {
        return Err(too_large(buffer.len() as u64));
    }
    Ok(buffer)
}

/// Parse camera `settings.txt` lines (`key = value` or `key: value`)
pub fn parse_settings(text: &str) -> InstrumentMetadata {
    let mut settings = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let split = line.split_once('=').or_else(|| line.split_once(':'));
        if let Some((key, value)) = split {
            let key = key.trim().to_lowercase().replace(' ', "_");
            settings.insert(key, value.trim().to_string());
        }
    }

    let mut instrument = InstrumentMetadata::default();
    instrument.integration_time_ms = ["integration_time_ms", "integration_time", "exposure"]
        .iter()
        .find_map(|key| settings.get(*key))
        .and_then(|v| v.parse::<f64>().ok());
    if let Some(value) = settings.get("saturation_value") {
        match value.parse::<Dn>() {
            Ok(dn) => instrument.saturation_value = dn,
            Err(e) => log::warn!("Ignoring saturation_value '{}' in settings: {}", value, e),
        }
    }
    instrument.settings = settings;
    instrument
}
