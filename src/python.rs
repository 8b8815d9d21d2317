//! Python bindings

use crate::config::PipelineConfig;
use crate::core::bundle::{CalibrationBundle, WavelengthMapping};
use crate::core::orchestrator::{Admission, JobDescriptor, Orchestrator, SkipReason};
use crate::core::radiometric::RadiometricCorrector;
use crate::types::{HsiError, InstrumentMetadata, RawScan, SensorVariant};
use chrono::Utc;
use numpy::{PyReadonlyArray1, PyReadonlyArray3, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

fn to_py_err(error: HsiError) -> PyErr {
    match error.class() {
        crate::types::ErrorClass::Input | crate::types::ErrorClass::Integrity => {
            PyValueError::new_err(error.to_string())
        }
        _ => PyRuntimeError::new_err(error.to_string()),
    }
}

/// Dark/gain correction of a (lines, samples, bands) uint16 cube
#[pyfunction]
fn correct_cube(
    py: Python,
    cube: PyReadonlyArray3<u16>,
    dark: PyReadonlyArray1<f32>,
    gain: PyReadonlyArray1<f32>,
    saturation_value: Option<u16>,
) -> PyResult<PyObject> {
    let bundle = CalibrationBundle::new(
        "python",
        SensorVariant::new("python"),
        Utc::now(),
        None,
        dark.as_array().to_owned(),
        gain.as_array().to_owned(),
        WavelengthMapping::Polynomial {
            coefficients: vec![0.0, 1.0],
        },
    )
    .map_err(to_py_err)?;

    let scan = RawScan {
        cube: cube.as_array().to_owned(),
        sensor_variant: SensorVariant::new("python"),
        acquisition_time: Utc::now(),
        instrument: InstrumentMetadata {
            saturation_value: saturation_value.unwrap_or(u16::MAX),
            ..InstrumentMetadata::default()
        },
    };

    let output = py
        .allow_threads(|| RadiometricCorrector::correct(&scan, &bundle))
        .map_err(to_py_err)?;

    let result = PyDict::new(py);
    result.set_item("radiance", output.radiance.to_pyarray(py))?;
    result.set_item("quality_mask", output.quality_mask.to_pyarray(py))?;
    result.set_item("saturated_pixels", output.stats.saturated_pixels)?;
    result.set_item("clamped_pixels", output.stats.clamped_pixels)?;
    Ok(result.into())
}

/// Run one gantry dataset (e.g. `"VNIR - 2017-04-27__10-55-16-417"`) through the pipeline
#[pyfunction]
fn process_dataset(
    py: Python,
    config_path: String,
    dataset_name: String,
    raw_data_location: String,
) -> PyResult<PyObject> {
    let config = PipelineConfig::load(&config_path).map_err(to_py_err)?;
    let orchestrator = Orchestrator::from_config(&config).map_err(to_py_err)?;
    let descriptor = JobDescriptor::from_dataset_name(&dataset_name, raw_data_location).map_err(to_py_err)?;

    let result = PyDict::new(py);
    result.set_item("dataset_id", &descriptor.dataset_id)?;

    match orchestrator.admit(&descriptor) {
        Admission::Skip(reason) => {
            let reason = match reason {
                SkipReason::MissingRawData => "missing raw data".to_string(),
                SkipReason::OutputExists(path) => format!("output exists at {}", path.display()),
            };
            result.set_item("state", "skipped")?;
            result.set_item("reason", reason)?;
        }
        Admission::Process => {
            let report = py.allow_threads(|| orchestrator.run_job(&descriptor));
            result.set_item("state", report.state.to_string())?;
            result.set_item("attempts", report.attempts)?;
            result.set_item("read_attempts", report.read_attempts)?;
            if let Some(cause) = &report.cause {
                result.set_item("error_kind", &cause.kind)?;
                result.set_item("error", cause.to_string())?;
                result.set_item("retryable", cause.is_retryable())?;
            }
            if let Some(artifact) = &report.artifact {
                result.set_item("location", artifact.location.display().to_string())?;
                result.set_item("bundle_id", &artifact.bundle_id)?;
                result.set_item("fallback", artifact.fallback)?;
                if let Some(index) = artifact.attributes.get("normalized_difference_chlorophyll_index_750_705") {
                    result.set_item("ndci_750_705", index)?;
                }
            }
        }
    }
    Ok(result.into())
}

#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(correct_cube, m)?)?;
    m.add_function(wrap_pyfunction!(process_dataset, m)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
