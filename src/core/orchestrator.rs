//! Pipeline orchestration: job intake, the job state machine, bounded I/O and
//! batch execution on a worker pool.

use crate::config::{OutputFormat, PipelineConfig, RetryPolicy};
use crate::core::assembler::{CalibratedCube, CubeMetadata, OutputAssembler};
use crate::core::job::{FailureCause, JobState, ProcessingJob, StateTransition};
use crate::core::radiometric::RadiometricCorrector;
use crate::core::repository::CalibrationRepository;
use crate::core::selector::CalibrationSelector;
use crate::core::wavelength::WavelengthMapper;
use crate::types::{HsiError, HsiResult, RawScan, SensorVariant};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Job intake record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub dataset_id: String,
    pub sensor_variant: SensorVariant,
    pub acquisition_timestamp: DateTime<Utc>,
    /// Directory, `.zip` archive or `http(s)://` URL holding the raw pair
    pub raw_data_location: String,
}

impl JobDescriptor {
    pub fn new(
        dataset_id: impl Into<String>,
        sensor_variant: SensorVariant,
        acquisition_timestamp: DateTime<Utc>,
        raw_data_location: impl Into<String>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            sensor_variant,
            acquisition_timestamp,
            raw_data_location: raw_data_location.into(),
        }
    }

    /// Build a descriptor from a gantry dataset name like `"VNIR - 2017-04-27__10-55-16-417"`
    pub fn from_dataset_name(name: &str, raw_data_location: impl Into<String>) -> HsiResult<Self> {
        let pattern = Regex::new(concat!(
            r"^\s*(?P<sensor>[A-Za-z]+)\s*-\s*",
            r"(?P<y>\d{4})-(?P<mo>\d{2})-(?P<d>\d{2})__",
            r"(?P<h>\d{2})-(?P<mi>\d{2})-(?P<s>\d{2})-(?P<ms>\d{3})\s*$",
        ))
        .map_err(|e| HsiError::InvalidFormat(format!("dataset name pattern: {}", e)))?;

        let caps = pattern
            .captures(name)
            .ok_or_else(|| HsiError::InvalidFormat(format!("Unrecognised dataset name '{}'", name)))?;
        let field = |key: &str| -> HsiResult<u32> {
            caps[key]
                .parse::<u32>()
                .map_err(|e| HsiError::InvalidFormat(format!("{} in dataset name '{}': {}", key, name, e)))
        };

        let invalid = || HsiError::InvalidFormat(format!("Invalid acquisition time in dataset name '{}'", name));
        let date = NaiveDate::from_ymd_opt(field("y")? as i32, field("mo")?, field("d")?).ok_or_else(invalid)?;
        let timestamp = date
            .and_hms_milli_opt(field("h")?, field("mi")?, field("s")?, field("ms")?)
            .ok_or_else(invalid)?;

        Ok(Self {
            dataset_id: name.trim().to_string(),
            sensor_variant: SensorVariant::from_dataset_name(&caps["sensor"]),
            acquisition_timestamp: Utc.from_utc_datetime(&timestamp),
            raw_data_location: raw_data_location.into(),
        })
    }
}

/// Where a job's artifact lands, relative to the sink's output root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactTarget {
    pub sensor_variant: SensorVariant,
    pub date: NaiveDate,
    pub name: String,
}

impl ArtifactTarget {
    pub fn for_job(descriptor: &JobDescriptor) -> Self {
        let name: String = descriptor
            .dataset_id
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            sensor_variant: descriptor.sensor_variant.clone(),
            date: descriptor.acquisition_timestamp.date_naive(),
            name,
        }
    }

    /// `<variant>/<YYYY-MM-DD>/<name>`
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(self.sensor_variant.as_str())
            .join(self.date.format("%Y-%m-%d").to_string())
            .join(&self.name)
    }
}

/// A fully written artifact that is not yet visible at its destination
///
/// Dropping it without `commit` removes the staging directory.
#[derive(Debug)]
pub struct StagedArtifact {
    staging: tempfile::TempDir,
    destination: PathBuf,
}

impl StagedArtifact {
    pub fn new(staging: tempfile::TempDir, destination: PathBuf) -> Self {
        Self { staging, destination }
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Atomically move the staging directory to its destination
    pub fn commit(self, overwrite: bool) -> HsiResult<PathBuf> {
        let destination = self.destination;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if destination.exists() {
            if !overwrite {
                return Err(HsiError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("artifact {} already exists", destination.display()),
                )));
            }
            log::warn!("Replacing existing artifact {}", destination.display());
            fs::remove_dir_all(&destination)?;
        }

        let staged = self.staging.into_path();
        if let Err(e) = fs::rename(&staged, &destination) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }
        log::info!("Committed artifact {}", destination.display());
        Ok(destination)
    }
}

/// Reads raw scans for jobs
pub trait RawScanSource: Send + Sync {
    fn read_scan(&self, descriptor: &JobDescriptor) -> HsiResult<RawScan>;

    /// Whether `location` carries the raw data pair
    fn has_required_files(&self, location: &str) -> bool;
}

/// Writes calibrated cubes
pub trait ArtifactSink: Send + Sync {
    /// Write the complete artifact into a private staging area
    fn stage(&self, cube: &CalibratedCube, target: &ArtifactTarget) -> HsiResult<StagedArtifact>;

    /// Final location of the artifact for `target`
    fn artifact_location(&self, target: &ArtifactTarget) -> PathBuf;

    fn format_name(&self) -> &'static str;
}

/// Cooperative cancellation flag
///
/// One token per job cancels that job only; the orchestrator's shutdown
/// token is checked by every job it runs.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Completed-artifact reference handed to the registration component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub location: PathBuf,
    pub format: String,
    pub dataset_id: String,
    pub sensor_variant: SensorVariant,
    pub acquisition_time: DateTime<Utc>,
    pub bundle_id: String,
    pub fallback: bool,
    pub pipeline_version: String,
    pub attributes: BTreeMap<String, String>,
}

/// Terminal outcome of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: u64,
    pub dataset_id: String,
    pub state: JobState,
    pub cause: Option<FailureCause>,
    pub artifact: Option<ArtifactReference>,
    /// Sink write attempts made for this job
    pub attempts: u32,
    /// Raw source read attempts made for this job
    pub read_attempts: u32,
    pub transitions: Vec<StateTransition>,
}

impl JobReport {
    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    MissingRawData,
    OutputExists(PathBuf),
}

/// Admission decision taken before a job enters the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Process,
    Skip(SkipReason),
}

/// Runs jobs through selection, correction, validation and writing
pub struct Orchestrator {
    selector: CalibrationSelector,
    source: Arc<dyn RawScanSource>,
    sink: Arc<dyn ArtifactSink>,
    retry: RetryPolicy,
    io_timeout: Duration,
    overwrite: bool,
    worker_count: usize,
    pipeline_version: String,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<CalibrationRepository>,
        source: Arc<dyn RawScanSource>,
        sink: Arc<dyn ArtifactSink>,
        config: &PipelineConfig,
    ) -> HsiResult<Self> {
        config.validate()?;
        Ok(Self {
            selector: CalibrationSelector::new(repository),
            source,
            sink,
            retry: config.retry,
            io_timeout: config.io_timeout(),
            overwrite: config.overwrite,
            worker_count: config.worker_count,
            pipeline_version: config.pipeline_version.clone(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Wire the filesystem bundle store, ENVI raw reader and the configured sink
    pub fn from_config(config: &PipelineConfig) -> HsiResult<Self> {
        use crate::io::bundle_store::FsBundleStore;
        use crate::io::cube_writer::EnviCubeWriter;
        use crate::io::raw_scan::EnviRawSource;

        let store = FsBundleStore::new(&config.calibration_root).strict(config.strict_bundle_loading);
        let repository = Arc::new(CalibrationRepository::new(store));
        let source: Arc<dyn RawScanSource> = Arc::new(EnviRawSource::new(config.io_timeout()));
        let sink: Arc<dyn ArtifactSink> = match config.output_format {
            OutputFormat::Envi => Arc::new(EnviCubeWriter::new(&config.output_root)),
            #[cfg(feature = "gdal")]
            OutputFormat::Geotiff => {
                Arc::new(crate::io::cube_writer::GeoTiffCubeWriter::new(&config.output_root))
            }
            #[cfg(not(feature = "gdal"))]
            OutputFormat::Geotiff => {
                return Err(HsiError::Config(
                    "output_format geotiff requires the 'gdal' feature".to_string(),
                ))
            }
        };
        Self::new(repository, source, sink, config)
    }

    /// Token that cancels every running and future job of this orchestrator
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Decide whether a job should run at all
    pub fn admit(&self, descriptor: &JobDescriptor) -> Admission {
        if !self.source.has_required_files(&descriptor.raw_data_location) {
            log::warn!(
                "Skipping {}: upload at {} is incomplete",
                descriptor.dataset_id,
                descriptor.raw_data_location
            );
            return Admission::Skip(SkipReason::MissingRawData);
        }
        let location = self.sink.artifact_location(&ArtifactTarget::for_job(descriptor));
        if location.exists() && !self.overwrite {
            log::info!("Skipping {}: output {} exists", descriptor.dataset_id, location.display());
            return Admission::Skip(SkipReason::OutputExists(location));
        }
        Admission::Process
    }

    /// Run one job to a terminal state
    pub fn run_job(&self, descriptor: &JobDescriptor) -> JobReport {
        self.run_job_with(descriptor, &CancellationToken::new())
    }

    /// Run one job that can be cancelled through `cancel`
    pub fn run_job_with(&self, descriptor: &JobDescriptor, cancel: &CancellationToken) -> JobReport {
        let mut job = ProcessingJob::new(descriptor.dataset_id.clone());
        let mut counts = AttemptCounts::default();
        let start = std::time::Instant::now();

        let run = JobRun {
            cancel,
            shutdown: &self.shutdown,
        };
        let artifact = match self.drive(&run, &mut job, descriptor, &mut counts) {
            Ok(reference) => {
                log::info!(
                    "Job {} ({}) completed in {:.3}s -> {}",
                    job.id(),
                    descriptor.dataset_id,
                    start.elapsed().as_secs_f64(),
                    reference.location.display()
                );
                Some(reference)
            }
            Err(error) => {
                if let Err(transition) = job.fail(&error) {
                    log::error!("Job {} could not record failure '{}': {}", job.id(), error, transition);
                }
                None
            }
        };

        JobReport {
            job_id: job.id(),
            dataset_id: descriptor.dataset_id.clone(),
            state: job.state(),
            cause: job.cause().cloned(),
            artifact,
            attempts: counts.write,
            read_attempts: counts.read,
            transitions: job.history().to_vec(),
        }
    }

    /// Run many jobs on `worker_count` workers; reports keep input order
    pub fn run_batch(&self, descriptors: &[JobDescriptor]) -> HsiResult<Vec<JobReport>> {
        let jobs: Vec<(JobDescriptor, CancellationToken)> = descriptors
            .iter()
            .map(|d| (d.clone(), CancellationToken::new()))
            .collect();
        self.run_batch_with(&jobs)
    }

    /// Like [`Orchestrator::run_batch`], each job paired with its own cancellation token
    pub fn run_batch_with(&self, jobs: &[(JobDescriptor, CancellationToken)]) -> HsiResult<Vec<JobReport>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_count)
            .thread_name(|i| format!("hypercal-worker-{}", i))
            .build()
            .map_err(|e| HsiError::Config(format!("building worker pool: {}", e)))?;

        log::info!("Running {} jobs on {} workers", jobs.len(), self.worker_count);
        let reports: Vec<JobReport> = pool.install(|| {
            jobs.par_iter()
                .map(|(descriptor, cancel)| self.run_job_with(descriptor, cancel))
                .collect()
        });

        let completed = reports.iter().filter(|r| r.is_completed()).count();
        log::info!("Batch finished: {} completed, {} failed", completed, reports.len() - completed);
        Ok(reports)
    }

    fn drive(
        &self,
        run: &JobRun<'_>,
        job: &mut ProcessingJob,
        descriptor: &JobDescriptor,
        counts: &mut AttemptCounts,
    ) -> HsiResult<ArtifactReference> {
        run.checkpoint()?;
        job.start_calibrating()?;

        let selection = self
            .selector
            .select(&descriptor.sensor_variant, descriptor.acquisition_timestamp)?;

        let scan = self.with_retry(run, &descriptor.dataset_id, "read", &mut counts.read, || {
            let source = Arc::clone(&self.source);
            let job_descriptor = descriptor.clone();
            bounded(self.io_timeout, move || source.read_scan(&job_descriptor))
        })?;
        if scan.sensor_variant != descriptor.sensor_variant {
            log::warn!(
                "Raw scan of {} reports variant '{}', job says '{}'",
                descriptor.dataset_id,
                scan.sensor_variant,
                descriptor.sensor_variant
            );
        }
        run.checkpoint()?;

        let spectral = WavelengthMapper::map(scan.band_count(), &selection.bundle)?;
        let correction =
            RadiometricCorrector::correct_aligned(&scan, &selection.bundle, &spectral.alignment)?;
        run.checkpoint()?;

        job.start_validating()?;
        let metadata = CubeMetadata {
            dataset_id: descriptor.dataset_id.clone(),
            sensor_variant: descriptor.sensor_variant.clone(),
            acquisition_time: descriptor.acquisition_timestamp,
            instrument: scan.instrument.clone(),
            pipeline_version: self.pipeline_version.clone(),
        };
        drop(scan);
        let cube = Arc::new(OutputAssembler::assemble(correction, spectral, &selection, metadata)?);
        run.checkpoint()?;

        job.start_writing()?;
        let target = ArtifactTarget::for_job(descriptor);
        let staged = self.with_retry(run, &descriptor.dataset_id, "write", &mut counts.write, || {
            let sink = Arc::clone(&self.sink);
            let cube = Arc::clone(&cube);
            let target = target.clone();
            bounded(self.io_timeout, move || sink.stage(&cube, &target).map_err(sink_error))
        })?;
        // Cancellation after staging drops the staged copy unpublished
        run.checkpoint()?;
        let location = staged.commit(self.overwrite)?;

        job.complete()?;
        Ok(ArtifactReference {
            location,
            format: self.sink.format_name().to_string(),
            dataset_id: descriptor.dataset_id.clone(),
            sensor_variant: descriptor.sensor_variant.clone(),
            acquisition_time: descriptor.acquisition_timestamp,
            bundle_id: selection.bundle.id().to_string(),
            fallback: selection.fallback,
            pipeline_version: self.pipeline_version.clone(),
            attributes: cube.attributes().clone(),
        })
    }

    fn with_retry<T>(
        &self,
        run: &JobRun<'_>,
        dataset_id: &str,
        what: &str,
        attempts: &mut u32,
        mut op: impl FnMut() -> HsiResult<T>,
    ) -> HsiResult<T> {
        let max_attempts = self.retry.max_attempts.max(1);
        loop {
            run.checkpoint()?;
            *attempts += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && *attempts < max_attempts => {
                    let delay = self.retry.backoff(*attempts);
                    log::warn!(
                        "{} {} attempt {}/{} failed: {}; retrying in {:?}",
                        dataset_id,
                        what,
                        attempts,
                        max_attempts,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    if e.is_retryable() {
                        log::error!("{} {} gave up after {} attempts: {}", dataset_id, what, attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct AttemptCounts {
    read: u32,
    write: u32,
}

/// Cancellation signals observed by one running job
struct JobRun<'a> {
    cancel: &'a CancellationToken,
    shutdown: &'a CancellationToken,
}

impl JobRun<'_> {
    fn checkpoint(&self) -> HsiResult<()> {
        if self.cancel.is_cancelled() || self.shutdown.is_cancelled() {
            Err(HsiError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Storage failures while writing are treated as transient
fn sink_error(error: HsiError) -> HsiError {
    match error {
        HsiError::Io(e) => HsiError::TransientIo(e.to_string()),
        other => other,
    }
}

/// Run `op` on its own thread and give up waiting after `timeout`
///
/// A timed-out operation keeps running detached; its result is dropped.
fn bounded<T, F>(timeout: Duration, op: F) -> HsiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> HsiResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    std::thread::Builder::new()
        .name("hypercal-io".to_string())
        .spawn(move || {
            let _ = tx.send(op());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(HsiError::Timeout(timeout)),
        // The worker panicked; the same input would panic again
        Err(RecvTimeoutError::Disconnected) => Err(HsiError::Internal(
            "I/O worker exited without a result".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_descriptor_from_dataset_name() {
        let d = JobDescriptor::from_dataset_name("SWIR - 2017-04-27__10-55-16-417", "/raw/x").unwrap();
        assert_eq!(d.sensor_variant, SensorVariant::new("swir"));
        assert_eq!(d.acquisition_timestamp.date_naive(), NaiveDate::from_ymd_opt(2017, 4, 27).unwrap());
        assert_eq!(d.acquisition_timestamp.hour(), 10);
        assert_eq!(d.acquisition_timestamp.timestamp_subsec_millis(), 417);

        assert!(JobDescriptor::from_dataset_name("VNIR 2017-04-27", "/raw/x").is_err());
        assert!(JobDescriptor::from_dataset_name("VNIR - 2017-13-27__10-55-16-417", "/raw/x").is_err());
    }

    #[test]
    fn test_artifact_target_layout() {
        let d = JobDescriptor::from_dataset_name("VNIR - 2017-04-27__10-55-16-417", "/raw/x").unwrap();
        let target = ArtifactTarget::for_job(&d);
        assert_eq!(
            target.relative_dir(),
            PathBuf::from("vnir/2017-04-27/VNIR_-_2017-04-27__10-55-16-417")
        );
    }

    #[test]
    fn test_bounded_times_out() {
        let err = bounded(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, HsiError::Timeout(_)));
        assert!(err.is_retryable());

        assert_eq!(bounded(Duration::from_secs(5), || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_bounded_worker_panic_is_not_retryable() {
        let err = bounded::<(), _>(Duration::from_secs(5), || panic!("decoder blew up")).unwrap_err();
        assert_eq!(err.kind_name(), "InternalError");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_staged_artifact_dropped_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::Builder::new().prefix(".staging-").tempdir_in(root.path()).unwrap();
        fs::write(staging.path().join("cube.img"), b"partial").unwrap();
        let staged = StagedArtifact::new(staging, root.path().join("v1/out"));
        drop(staged);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_staged_artifact_commit_moves_directory() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::Builder::new().prefix(".staging-").tempdir_in(root.path()).unwrap();
        fs::write(staging.path().join("cube.img"), b"data").unwrap();
        let destination = root.path().join("v1/2017-04-27/out");

        let location = StagedArtifact::new(staging, destination.clone()).commit(false).unwrap();
        assert_eq!(location, destination);
        assert_eq!(fs::read(destination.join("cube.img")).unwrap(), b"data");
    }
}
