//! hypercal: calibration-aware extraction of radiance cubes from raw
//! push-broom hyperspectral scans
//!
//! Raw VNIR/SWIR scans are matched to the calibration bundle valid at their
//! acquisition time, dark-subtracted and gain-normalised, given a wavelength
//! axis, validated and written as self-describing artifacts.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use config::{OutputFormat, PipelineConfig, RetryPolicy};
pub use types::{
    Dn, ErrorClass, HsiError, HsiResult, InstrumentMetadata, QualityMask, RadianceCube, RawCube, RawScan,
    SensorVariant, WavelengthAxis, QA_CLAMPED, QA_SATURATED, QA_VALID,
};

pub use crate::core::{
    CalibratedCube, CalibrationBundle, CalibrationRepository, CalibrationSelector, JobDescriptor, JobReport,
    JobState, Orchestrator, OutputAssembler, RadiometricCorrector, WavelengthMapper,
};
pub use io::{EnviCubeWriter, EnviRawSource, FsBundleStore};
