use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw digital number as delivered by the camera
pub type Dn = u16;

/// Raw DN cube (lines x samples x bands)
pub type RawCube = Array3<Dn>;

/// Calibrated radiance cube (lines x samples x bands)
pub type RadianceCube = Array3<f32>;

/// Per-pixel quality flags (lines x samples)
pub type QualityMask = Array2<u8>;

/// Wavelength coordinate in nanometers, one entry per output band
pub type WavelengthAxis = Array1<f64>;

/// Quality mask value for a pixel with no recorded condition
pub const QA_VALID: u8 = 0;
/// At least one band of the pixel reached the sensor saturation DN
pub const QA_SATURATED: u8 = 0b0000_0001;
/// At least one band of the pixel was negative after dark subtraction and clamped to zero
pub const QA_CLAMPED: u8 = 0b0000_0010;

/// Sensor variant tag (e.g. `vnir`, `swir`)
///
/// Tags are normalised to lower case so `VNIR` and `vnir` address the same
/// calibration bundles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorVariant(String);

impl SensorVariant {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    /// Derive the variant from a gantry dataset name such as `"SWIR - 2017-04-27__10-55-16-417"`
    pub fn from_dataset_name(name: &str) -> Self {
        if name.contains("SWIR") {
            Self::new("swir")
        } else {
            Self::new("vnir")
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SensorVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SensorVariant {
    type Err = HsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(HsiError::InvalidFormat("Empty sensor variant tag".to_string()));
        }
        Ok(Self::new(s))
    }
}

/// Instrument settings recorded alongside a raw scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    /// Integration (exposure) time in milliseconds
    pub integration_time_ms: Option<f64>,
    /// DN at which the detector saturates
    pub saturation_value: Dn,
    /// Every other `key = value` setting, verbatim
    pub settings: BTreeMap<String, String>,
}

impl Default for InstrumentMetadata {
    fn default() -> Self {
        Self {
            integration_time_ms: None,
            saturation_value: Dn::MAX,
            settings: BTreeMap::new(),
        }
    }
}

/// Raw push-broom acquisition, read-only input to the pipeline
#[derive(Debug, Clone)]
pub struct RawScan {
    pub cube: RawCube,
    pub sensor_variant: SensorVariant,
    pub acquisition_time: DateTime<Utc>,
    pub instrument: InstrumentMetadata,
}

impl RawScan {
    /// (lines, samples, bands)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.cube.dim()
    }

    pub fn band_count(&self) -> usize {
        self.cube.dim().2
    }
}

/// Coarse classification used for the failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Malformed input or missing calibration; retrying will not help
    Input,
    /// Bad calibration data or inconsistent dimensions; needs bundle review
    Integrity,
    /// I/O timeouts and storage hiccups; retried with backoff
    Transient,
    /// Job was cancelled cooperatively
    Cancelled,
    /// Programming errors such as illegal state transitions
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Input => write!(f, "input"),
            ErrorClass::Integrity => write!(f, "integrity"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Cancelled => write!(f, "cancelled"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

/// Error types for hyperspectral calibration
#[derive(Debug, thiserror::Error)]
pub enum HsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Calibration bundle load error: {0}")]
    CalibrationLoad(String),

    #[error("No calibration available for sensor variant '{0}'")]
    NoCalibrationAvailable(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Band reconciliation error: {0}")]
    BandReconciliation(String),

    #[error("Calibration integrity error: {0}")]
    CalibrationIntegrity(String),

    #[error("Output validation error: {0}")]
    OutputValidation(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("XML parsing error: {0}")]
    Xml(String),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl HsiError {
    /// Classify the error for the job failure policy
    pub fn class(&self) -> ErrorClass {
        match self {
            HsiError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => ErrorClass::Transient,
                _ => ErrorClass::Input,
            },
            HsiError::InvalidFormat(_)
            | HsiError::CalibrationLoad(_)
            | HsiError::NoCalibrationAvailable(_)
            | HsiError::Config(_)
            | HsiError::Xml(_) => ErrorClass::Input,
            HsiError::DimensionMismatch(_)
            | HsiError::BandReconciliation(_)
            | HsiError::CalibrationIntegrity(_)
            | HsiError::OutputValidation(_) => ErrorClass::Integrity,
            HsiError::TransientIo(_) | HsiError::Timeout(_) => ErrorClass::Transient,
            HsiError::Cancelled => ErrorClass::Cancelled,
            HsiError::InvalidTransition { .. } | HsiError::Internal(_) => ErrorClass::Internal,
            #[cfg(feature = "gdal")]
            HsiError::Gdal(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable short name of the variant, carried in job failure causes
    pub fn kind_name(&self) -> &'static str {
        match self {
            HsiError::Io(_) => "Io",
            HsiError::InvalidFormat(_) => "InvalidFormat",
            HsiError::CalibrationLoad(_) => "CalibrationLoadError",
            HsiError::NoCalibrationAvailable(_) => "NoCalibrationAvailable",
            HsiError::DimensionMismatch(_) => "DimensionMismatchError",
            HsiError::BandReconciliation(_) => "BandReconciliationError",
            HsiError::CalibrationIntegrity(_) => "CalibrationIntegrityError",
            HsiError::OutputValidation(_) => "OutputValidationError",
            HsiError::TransientIo(_) => "TransientIoError",
            HsiError::Timeout(_) => "Timeout",
            HsiError::Cancelled => "Cancelled",
            HsiError::InvalidTransition { .. } => "InvalidTransition",
            HsiError::Config(_) => "ConfigError",
            HsiError::Internal(_) => "InternalError",
            HsiError::Xml(_) => "XmlError",
            #[cfg(feature = "gdal")]
            HsiError::Gdal(_) => "GdalError",
        }
    }
}

/// Result type for hyperspectral operations
pub type HsiResult<T> = Result<T, HsiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_from_dataset_name() {
        assert_eq!(
            SensorVariant::from_dataset_name("SWIR - 2017-04-27__10-55-16-417"),
            SensorVariant::new("swir")
        );
        assert_eq!(
            SensorVariant::from_dataset_name("VNIR - 2017-04-27__10-55-16-417"),
            SensorVariant::new("vnir")
        );
        assert_eq!(SensorVariant::new(" VNIR ").as_str(), "vnir");
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(HsiError::NoCalibrationAvailable("v1".into()).class(), ErrorClass::Input);
        assert_eq!(HsiError::CalibrationIntegrity("x".into()).class(), ErrorClass::Integrity);
        assert!(HsiError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(HsiError::TransientIo("disk busy".into()).is_retryable());
        assert!(!HsiError::BandReconciliation("x".into()).is_retryable());
        assert_eq!(HsiError::Internal("worker lost".into()).class(), ErrorClass::Internal);

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow nfs");
        assert!(HsiError::from(timed_out).is_retryable());
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(HsiError::from(missing).class(), ErrorClass::Input);
    }
}
