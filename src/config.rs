use crate::types::{HsiError, HsiResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Artifact container written by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Envi,
    Geotiff,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Envi
    }
}

/// Bounded retry with exponential backoff for transient I/O failures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the calibration bundle folders
    pub calibration_root: PathBuf,
    pub output_root: PathBuf,
    pub worker_count: usize,
    /// Upper bound for any single raw-source read or sink write
    pub io_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Replace artifacts that already exist instead of skipping the job
    pub overwrite: bool,
    /// Fail the whole variant when one bundle folder is malformed
    pub strict_bundle_loading: bool,
    pub output_format: OutputFormat,
    pub pipeline_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            calibration_root: default_calibration_root(),
            output_root: PathBuf::from("hypercal_output"),
            worker_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            io_timeout_secs: 120,
            retry: RetryPolicy::default(),
            overwrite: false,
            strict_bundle_loading: false,
            output_format: OutputFormat::default(),
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `<data dir>/hypercal/calibration`, or a relative `calibration` directory when
/// the platform reports no data dir
pub fn default_calibration_root() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("hypercal").join("calibration"))
        .unwrap_or_else(|| PathBuf::from("calibration"))
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> HsiResult<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .map_err(|e| HsiError::Config(format!("reading pipeline config {}: {}", path_ref.display(), e)))?;
        let config = Self::from_yaml(&contents)
            .map_err(|e| HsiError::Config(format!("{} ({})", e, path_ref.display())))?;
        log::info!("Loaded pipeline config from {}", path_ref.display());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> HsiResult<Self> {
        let config: PipelineConfig = serde_yaml::from_str(contents)
            .map_err(|e| HsiError::Config(format!("parsing pipeline config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HsiResult<()> {
        if self.worker_count == 0 {
            return Err(HsiError::Config("worker_count must be at least 1".to_string()));
        }
        if self.io_timeout_secs == 0 {
            return Err(HsiError::Config("io_timeout_secs must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(HsiError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(HsiError::Config(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.pipeline_version.trim().is_empty() {
            return Err(HsiError::Config("pipeline_version must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_reads_yaml_with_defaults() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"calibration_root: /data/calibration\n\
              output_root: /data/out\n\
              worker_count: 4\n\
              retry:\n  max_attempts: 5\n\
              output_format: envi\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = PipelineConfig::load(&path).unwrap();

        assert_eq!(cfg.calibration_root, PathBuf::from("/data/calibration"));
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.initial_backoff_ms, 200);
        assert_eq!(cfg.io_timeout_secs, 120);
        assert!(!cfg.overwrite);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(PipelineConfig::from_yaml("worker_count: 0\n").is_err());
        assert!(PipelineConfig::from_yaml("io_timeout_secs: 0\n").is_err());
        assert!(matches!(
            PipelineConfig::from_yaml("retry:\n  max_attempts: 0\n"),
            Err(HsiError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_output_format_rejected() {
        assert!(PipelineConfig::from_yaml("output_format: netcdf\n").is_err());
        let cfg = PipelineConfig::from_yaml("output_format: geotiff\n").unwrap();
        assert_eq!(cfg.output_format, OutputFormat::Geotiff);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(9), Duration::from_millis(1_000));
    }
}
