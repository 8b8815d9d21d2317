//! Input/output modules for raw scans, calibration bundles and artifacts

pub mod bundle_store;
pub mod cube_writer;
pub mod envi;
pub mod raw_scan;

pub use bundle_store::{load_bundle, BundleManifest, FsBundleStore, RejectedBundle};
pub use cube_writer::{read_artifact, read_artifact_header, ArtifactContents, EnviCubeWriter};
#[cfg(feature = "gdal")]
pub use cube_writer::GeoTiffCubeWriter;
pub use envi::{EnviDataType, EnviHeader, Interleave, RasterLayout};
pub use raw_scan::{EnviRawSource, RawFiles, RawLocation};
