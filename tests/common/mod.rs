#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use hypercal::config::{PipelineConfig, RetryPolicy};
use hypercal::core::{
    ArtifactSink, ArtifactTarget, CalibratedCube, CalibrationBundle, CancellationToken, JobDescriptor,
    RawScanSource, StagedArtifact, WavelengthMapping,
};
use hypercal::io::EnviCubeWriter;
use hypercal::types::{Dn, HsiError, HsiResult, InstrumentMetadata, RawScan, SensorVariant};
use ndarray::{Array1, Array3};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn test_config(output_root: &Path) -> PipelineConfig {
    PipelineConfig {
        output_root: output_root.to_path_buf(),
        worker_count: 4,
        io_timeout_secs: 5,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..PipelineConfig::default()
    }
}

/// Linear-wavelength bundle with dark = 10 and gain = 0.5 on every band
pub fn bundle(
    id: &str,
    variant: &str,
    from: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
    bands: usize,
) -> CalibrationBundle {
    CalibrationBundle::new(
        id,
        SensorVariant::new(variant),
        from,
        until,
        Array1::from_elem(bands, 10.0),
        Array1::from_elem(bands, 0.5),
        WavelengthMapping::Polynomial {
            coefficients: vec![400.0, 2.5],
        },
    )
    .unwrap()
}

/// Deterministic DN cube, value = 100 + line + 2 * sample + 3 * band
pub fn synthetic_cube(lines: usize, samples: usize, bands: usize) -> Array3<Dn> {
    Array3::from_shape_fn((lines, samples, bands), |(l, s, b)| (100 + l + 2 * s + 3 * b) as Dn)
}

pub fn descriptor(name: &str, variant: &str, at: DateTime<Utc>) -> JobDescriptor {
    JobDescriptor::new(name, SensorVariant::new(variant), at, format!("memory://{}", name))
}

/// Raw scans held in memory, one shape for every job
pub struct MemorySource {
    pub lines: usize,
    pub samples: usize,
    pub bands: usize,
}

impl RawScanSource for MemorySource {
    fn read_scan(&self, descriptor: &JobDescriptor) -> HsiResult<RawScan> {
        Ok(RawScan {
            cube: synthetic_cube(self.lines, self.samples, self.bands),
            sensor_variant: descriptor.sensor_variant.clone(),
            acquisition_time: descriptor.acquisition_timestamp,
            instrument: InstrumentMetadata {
                saturation_value: 4095,
                integration_time_ms: Some(20.0),
                ..InstrumentMetadata::default()
            },
        })
    }

    fn has_required_files(&self, location: &str) -> bool {
        location.starts_with("memory://")
    }
}

/// Memory source that stalls before every read
pub struct SlowSource {
    pub inner: MemorySource,
    pub delay: Duration,
    pub calls: AtomicU32,
}

impl RawScanSource for SlowSource {
    fn read_scan(&self, descriptor: &JobDescriptor) -> HsiResult<RawScan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.read_scan(descriptor)
    }

    fn has_required_files(&self, location: &str) -> bool {
        self.inner.has_required_files(location)
    }
}

/// Memory source whose first `failures` reads fail with `kind`
pub struct FlakySource {
    pub inner: MemorySource,
    pub failures: u32,
    pub kind: std::io::ErrorKind,
    pub calls: AtomicU32,
}

impl FlakySource {
    pub fn new(inner: MemorySource, failures: u32, kind: std::io::ErrorKind) -> Self {
        Self {
            inner,
            failures,
            kind,
            calls: AtomicU32::new(0),
        }
    }
}

impl RawScanSource for FlakySource {
    fn read_scan(&self, descriptor: &JobDescriptor) -> HsiResult<RawScan> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HsiError::Io(std::io::Error::new(self.kind, "raw share hiccup")));
        }
        self.inner.read_scan(descriptor)
    }

    fn has_required_files(&self, location: &str) -> bool {
        self.inner.has_required_files(location)
    }
}

/// Memory source that cancels `token` once the scan has been read
pub struct CancellingSource {
    pub inner: MemorySource,
    pub token: CancellationToken,
}

impl RawScanSource for CancellingSource {
    fn read_scan(&self, descriptor: &JobDescriptor) -> HsiResult<RawScan> {
        let scan = self.inner.read_scan(descriptor)?;
        self.token.cancel();
        Ok(scan)
    }

    fn has_required_files(&self, location: &str) -> bool {
        self.inner.has_required_files(location)
    }
}

/// Sink that writes part of an artifact and then fails with an I/O error
pub struct FlakySink {
    pub output_root: PathBuf,
    pub calls: AtomicU32,
}

impl FlakySink {
    pub fn new(output_root: &Path) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
            calls: AtomicU32::new(0),
        }
    }
}

impl ArtifactSink for FlakySink {
    fn stage(&self, _cube: &CalibratedCube, target: &ArtifactTarget) -> HsiResult<StagedArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(&self.output_root)?;
        let staging = tempfile::Builder::new().prefix(".flaky-").tempdir_in(&self.output_root)?;
        fs::write(staging.path().join(format!("{}.img", target.name)), b"partial")?;
        Err(HsiError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "storage volume went away",
        )))
    }

    fn artifact_location(&self, target: &ArtifactTarget) -> PathBuf {
        self.output_root.join(target.relative_dir())
    }

    fn format_name(&self) -> &'static str {
        "flaky"
    }
}

/// ENVI sink that stalls before staging
pub struct SlowSink {
    pub inner: EnviCubeWriter,
    pub delay: Duration,
}

impl ArtifactSink for SlowSink {
    fn stage(&self, cube: &CalibratedCube, target: &ArtifactTarget) -> HsiResult<StagedArtifact> {
        std::thread::sleep(self.delay);
        self.inner.stage(cube, target)
    }

    fn artifact_location(&self, target: &ArtifactTarget) -> PathBuf {
        self.inner.artifact_location(target)
    }

    fn format_name(&self) -> &'static str {
        "slow"
    }
}

/// Every file below `root`, hidden staging entries included
pub fn all_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(all_files(&path));
            } else {
                files.push(path);
            }
        }
    }
    files
}

/// Complete gantry upload in `dir`: ENVI raw pair, settings, preview and frame index
pub fn write_raw_scan(dir: &Path, name: &str, cube: &Array3<Dn>) {
    fs::create_dir_all(dir).unwrap();
    let (lines, samples, bands) = cube.dim();

    // BIL: for each line, every band's row of samples
    let mut bytes = Vec::with_capacity(lines * samples * bands * 2);
    for l in 0..lines {
        for b in 0..bands {
            for s in 0..samples {
                bytes.extend_from_slice(&cube[[l, s, b]].to_le_bytes());
            }
        }
    }
    fs::write(dir.join(format!("{}_raw", name)), bytes).unwrap();
    fs::write(
        dir.join(format!("{}_raw.hdr", name)),
        format!(
            "ENVI\ndescription = {{gantry scan}}\nsamples = {}\nlines = {}\nbands = {}\n\
             header offset = 0\ndata type = 12\ninterleave = bil\nbyte order = 0\n",
            samples, lines, bands
        ),
    )
    .unwrap();
    fs::write(dir.join("settings.txt"), "integration_time = 20\nsaturation_value = 4095\n").unwrap();
    fs::write(dir.join(format!("{}_image.jpg", name)), [0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
    fs::write(dir.join("frameIndex.txt"), "Frame\tTime\n1\t10:55:16.417\n").unwrap();
}

/// Bundle folder with a polynomial mapping, dark = 10, gain = 0.5
pub fn write_bundle_folder(root: &Path, name: &str, bands: usize) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("bundle.xml"),
        "<bundle><wavelengthMapping><kind>polynomial</kind>\
         <coefficients>400 2.5</coefficients></wavelengthMapping></bundle>",
    )
    .unwrap();
    fs::write(dir.join("dark.txt"), vec!["10"; bands].join("\n")).unwrap();
    fs::write(dir.join("gain.txt"), vec!["0.5"; bands].join("\n")).unwrap();
}
