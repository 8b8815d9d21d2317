//! Core calibration modules

pub mod assembler;
pub mod bundle;
pub mod indices;
pub mod job;
pub mod orchestrator;
pub mod radiometric;
pub mod repository;
pub mod selector;
pub mod wavelength;

// Re-export main types
pub use assembler::{CalibratedCube, CubeMetadata, OutputAssembler, Provenance};
pub use bundle::{BandReindex, CalibrationBundle, WavelengthMapping};
pub use job::{FailureCause, JobState, ProcessingJob, StateTransition};
pub use orchestrator::{
    Admission, ArtifactReference, ArtifactSink, ArtifactTarget, CancellationToken, JobDescriptor, JobReport,
    Orchestrator, RawScanSource, SkipReason, StagedArtifact,
};
pub use radiometric::{CorrectionOutput, CorrectionStats, RadiometricCorrector};
pub use repository::{BundleList, BundleSource, CalibrationRepository, StaticBundles};
pub use selector::{CalibrationSelection, CalibrationSelector};
pub use wavelength::{BandAlignment, SpectralAxis, WavelengthMapper};
