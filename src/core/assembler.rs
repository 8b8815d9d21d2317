//! Output cube assembly and validation
//!
//! The assembler is the last step before anything touches the output sink:
//! a `CalibratedCube` only exists if every dimension and attribute check
//! passed, so sinks never see a partial product.

use crate::core::indices::{chlorophyll_index_750_705, ATTR_NDCI_750_705};
use crate::core::radiometric::CorrectionOutput;
use crate::core::selector::CalibrationSelection;
use crate::core::wavelength::SpectralAxis;
use crate::types::{
    Dn, HsiError, HsiResult, InstrumentMetadata, QualityMask, RadianceCube, SensorVariant, WavelengthAxis,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ATTR_ACQUISITION_TIME: &str = "acquisition_time";
pub const ATTR_CALIBRATION_BUNDLE: &str = "calibration_bundle";
pub const ATTR_CALIBRATION_FALLBACK: &str = "calibration_fallback";
pub const ATTR_SENSOR_VARIANT: &str = "sensor_variant";
pub const ATTR_PIPELINE_VERSION: &str = "pipeline_version";
pub const ATTR_DATASET_ID: &str = "dataset_id";
pub const ATTR_HISTORY: &str = "history";

/// Global attributes every artifact must carry
pub const REQUIRED_ATTRIBUTES: [&str; 7] = [
    ATTR_ACQUISITION_TIME,
    ATTR_CALIBRATION_BUNDLE,
    ATTR_CALIBRATION_FALLBACK,
    ATTR_SENSOR_VARIANT,
    ATTR_PIPELINE_VERSION,
    ATTR_DATASET_ID,
    ATTR_HISTORY,
];

/// Calibration provenance recorded with every cube
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub bundle_id: String,
    pub fallback: bool,
    pub bundle_valid_from: DateTime<Utc>,
    pub bundle_valid_until: Option<DateTime<Utc>>,
    pub wavelength_mapping: String,
    pub band_reindex: Option<String>,
    pub saturation_value: Dn,
    pub saturated_pixels: usize,
    pub clamped_pixels: usize,
    pub valid_fraction: f64,
    /// Red-edge chlorophyll index, when the axis spans 705 and 750 nm
    #[serde(default)]
    pub ndci_750_705: Option<f64>,
}

/// Acquisition-side metadata merged into the artifact
#[derive(Debug, Clone)]
pub struct CubeMetadata {
    pub dataset_id: String,
    pub sensor_variant: SensorVariant,
    pub acquisition_time: DateTime<Utc>,
    pub instrument: InstrumentMetadata,
    pub pipeline_version: String,
}

/// Validated, immutable calibrated product
#[derive(Debug, Clone)]
pub struct CalibratedCube {
    radiance: RadianceCube,
    quality_mask: QualityMask,
    wavelengths: WavelengthAxis,
    provenance: Provenance,
    attributes: BTreeMap<String, String>,
}

impl CalibratedCube {
    pub fn radiance(&self) -> &RadianceCube {
        &self.radiance
    }

    pub fn quality_mask(&self) -> &QualityMask {
        &self.quality_mask
    }

    pub fn wavelengths(&self) -> &WavelengthAxis {
        &self.wavelengths
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// (lines, samples, bands)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.radiance.dim()
    }
}

/// Merges corrector and mapper output with job metadata
pub struct OutputAssembler;

impl OutputAssembler {
    pub fn assemble(
        correction: CorrectionOutput,
        spectral: SpectralAxis,
        selection: &CalibrationSelection,
        metadata: CubeMetadata,
    ) -> HsiResult<CalibratedCube> {
        let bundle = &selection.bundle;
        log::info!("Assembling output cube for {} ({})", metadata.dataset_id, bundle.id());

        let provenance = Provenance {
            bundle_id: bundle.id().to_string(),
            fallback: selection.fallback,
            bundle_valid_from: bundle.valid_from(),
            bundle_valid_until: bundle.valid_until(),
            wavelength_mapping: bundle.wavelength_mapping().kind().to_string(),
            band_reindex: spectral.alignment.rule().map(str::to_string),
            saturation_value: correction.stats.saturation_value,
            saturated_pixels: correction.stats.saturated_pixels,
            clamped_pixels: correction.stats.clamped_pixels,
            valid_fraction: correction.stats.valid_fraction(&correction.quality_mask),
            ndci_750_705: chlorophyll_index_750_705(
                &correction.radiance,
                &correction.quality_mask,
                &spectral.wavelengths,
            ),
        };

        let attributes = build_attributes(&metadata, &provenance);

        let cube = CalibratedCube {
            radiance: correction.radiance,
            quality_mask: correction.quality_mask,
            wavelengths: spectral.wavelengths,
            provenance,
            attributes,
        };

        validate(&cube)?;
        Ok(cube)
    }

    /// Assemble from already separated parts, still subject to full validation
    pub fn from_parts(
        radiance: RadianceCube,
        quality_mask: QualityMask,
        wavelengths: WavelengthAxis,
        provenance: Provenance,
        attributes: BTreeMap<String, String>,
    ) -> HsiResult<CalibratedCube> {
        let cube = CalibratedCube {
            radiance,
            quality_mask,
            wavelengths,
            provenance,
            attributes,
        };
        validate(&cube)?;
        Ok(cube)
    }
}

fn build_attributes(metadata: &CubeMetadata, provenance: &Provenance) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    attributes.insert(
        ATTR_ACQUISITION_TIME.to_string(),
        metadata.acquisition_time.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    attributes.insert(ATTR_CALIBRATION_BUNDLE.to_string(), provenance.bundle_id.clone());
    attributes.insert(ATTR_CALIBRATION_FALLBACK.to_string(), provenance.fallback.to_string());
    attributes.insert(ATTR_SENSOR_VARIANT.to_string(), metadata.sensor_variant.to_string());
    attributes.insert(ATTR_PIPELINE_VERSION.to_string(), metadata.pipeline_version.clone());
    attributes.insert(ATTR_DATASET_ID.to_string(), metadata.dataset_id.clone());
    attributes.insert(
        ATTR_HISTORY.to_string(),
        format!(
            "{}: hypercal {} calibrated {} with {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            metadata.pipeline_version,
            metadata.dataset_id,
            provenance.bundle_id
        ),
    );

    attributes.insert("wavelength_units".to_string(), "nm".to_string());
    attributes.insert("wavelength_mapping".to_string(), provenance.wavelength_mapping.clone());
    if let Some(rule) = &provenance.band_reindex {
        attributes.insert("band_reindex".to_string(), rule.clone());
    }
    attributes.insert("saturation_value".to_string(), provenance.saturation_value.to_string());
    attributes.insert("saturated_pixels".to_string(), provenance.saturated_pixels.to_string());
    attributes.insert("clamped_pixels".to_string(), provenance.clamped_pixels.to_string());
    if let Some(index) = provenance.ndci_750_705 {
        attributes.insert(ATTR_NDCI_750_705.to_string(), format!("{:.6}", index));
    }
    if let Some(ms) = metadata.instrument.integration_time_ms {
        attributes.insert("integration_time_ms".to_string(), ms.to_string());
    }
    for (key, value) in &metadata.instrument.settings {
        attributes.insert(format!("instrument_{}", key), value.clone());
    }
    attributes
}

/// Check a cube for dimensional consistency and metadata completeness
pub fn validate(cube: &CalibratedCube) -> HsiResult<()> {
    let (lines, samples, bands) = cube.radiance.dim();

    if lines == 0 || samples == 0 || bands == 0 {
        return Err(HsiError::OutputValidation(format!(
            "Radiance cube is empty ({} x {} x {})",
            lines, samples, bands
        )));
    }
    if cube.quality_mask.dim() != (lines, samples) {
        return Err(HsiError::OutputValidation(format!(
            "Quality mask is {:?}, radiance spatial dimensions are {:?}",
            cube.quality_mask.dim(),
            (lines, samples)
        )));
    }
    if cube.wavelengths.len() != bands {
        return Err(HsiError::OutputValidation(format!(
            "Wavelength axis has {} entries for {} bands",
            cube.wavelengths.len(),
            bands
        )));
    }
    if cube.radiance.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(HsiError::OutputValidation(
            "Radiance cube contains negative or non-finite values".to_string(),
        ));
    }

    let missing: Vec<&str> = REQUIRED_ATTRIBUTES
        .iter()
        .copied()
        .filter(|key| cube.attributes.get(*key).map_or(true, |v| v.trim().is_empty()))
        .collect();
    if !missing.is_empty() {
        return Err(HsiError::OutputValidation(format!(
            "Missing required attributes: {}",
            missing.join(", ")
        )));
    }

    log::debug!("Output cube validated: {} x {} x {}", lines, samples, bands);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bundle::{CalibrationBundle, WavelengthMapping};
    use crate::core::radiometric::CorrectionStats;
    use crate::core::wavelength::BandAlignment;
    use crate::types::QA_SATURATED;
    use chrono::TimeZone;
    use ndarray::{arr1, Array1, Array2, Array3};
    use std::sync::Arc;

    fn selection(fallback: bool) -> CalibrationSelection {
        let bundle = CalibrationBundle::new(
            "v1_20170101_20170601",
            SensorVariant::new("v1"),
            Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
            Some(Utc.with_ymd_and_hms(2017, 6, 1, 0, 0, 0).unwrap()),
            arr1(&[0.0, 0.0, 0.0]),
            arr1(&[1.0, 1.0, 1.0]),
            WavelengthMapping::Polynomial { coefficients: vec![400.0, 1.0] },
        )
        .unwrap();
        CalibrationSelection {
            bundle: Arc::new(bundle),
            fallback,
        }
    }

    fn metadata() -> CubeMetadata {
        let mut instrument = InstrumentMetadata::default();
        instrument.integration_time_ms = Some(35.0);
        instrument.settings.insert("gain".to_string(), "2".to_string());
        CubeMetadata {
            dataset_id: "VNIR - 2017-04-27__10-55-16-417".to_string(),
            sensor_variant: SensorVariant::new("v1"),
            acquisition_time: Utc.with_ymd_and_hms(2017, 4, 27, 10, 55, 16).unwrap(),
            instrument,
            pipeline_version: "0.3.0".to_string(),
        }
    }

    fn correction(mask_dim: (usize, usize)) -> CorrectionOutput {
        let mut quality_mask = Array2::zeros(mask_dim);
        quality_mask[[0, 0]] = QA_SATURATED;
        CorrectionOutput {
            radiance: Array3::from_elem((2, 2, 3), 1.5),
            quality_mask,
            stats: CorrectionStats {
                total_pixels: 4,
                saturated_pixels: 1,
                clamped_pixels: 0,
                saturation_value: 4095,
            },
        }
    }

    fn spectral(len: usize) -> SpectralAxis {
        SpectralAxis {
            alignment: BandAlignment::identity(len),
            wavelengths: Array1::from_iter((0..len).map(|i| 400.0 + i as f64)),
        }
    }

    #[test]
    fn test_assemble_carries_provenance_and_attributes() {
        let cube = OutputAssembler::assemble(correction((2, 2)), spectral(3), &selection(true), metadata()).unwrap();

        assert_eq!(cube.dim(), (2, 2, 3));
        assert_eq!(cube.attribute(ATTR_CALIBRATION_BUNDLE), Some("v1_20170101_20170601"));
        assert_eq!(cube.attribute(ATTR_CALIBRATION_FALLBACK), Some("true"));
        assert_eq!(cube.attribute(ATTR_SENSOR_VARIANT), Some("v1"));
        assert_eq!(cube.attribute(ATTR_ACQUISITION_TIME), Some("2017-04-27T10:55:16.000Z"));
        assert_eq!(cube.attribute("instrument_gain"), Some("2"));
        assert!(cube.attribute(ATTR_HISTORY).unwrap().contains("hypercal 0.3.0"));
        assert!(cube.provenance().fallback);
        assert!((cube.provenance().valid_fraction - 0.75).abs() < 1e-12);
        // 400..402 nm axis has no red edge
        assert!(cube.provenance().ndci_750_705.is_none());
        assert!(cube.attribute(ATTR_NDCI_750_705).is_none());
    }

    #[test]
    fn test_red_edge_axis_records_chlorophyll_index() {
        let mut output = correction((2, 2));
        output.radiance.index_axis_mut(ndarray::Axis(2), 2).fill(4.5);
        let red_edge = SpectralAxis {
            alignment: BandAlignment::identity(3),
            wavelengths: arr1(&[705.0, 727.5, 750.0]),
        };

        let cube = OutputAssembler::assemble(output, red_edge, &selection(false), metadata()).unwrap();
        // (4.5 - 1.5) / (4.5 + 1.5)
        assert_eq!(cube.provenance().ndci_750_705, Some(0.5));
        assert_eq!(cube.attribute(ATTR_NDCI_750_705), Some("0.500000"));
    }

    #[test]
    fn test_mask_dimension_mismatch_rejected() {
        let err = OutputAssembler::assemble(correction((2, 3)), spectral(3), &selection(false), metadata())
            .unwrap_err();
        assert!(matches!(err, HsiError::OutputValidation(_)));
    }

    #[test]
    fn test_wavelength_length_mismatch_rejected() {
        let err = OutputAssembler::assemble(correction((2, 2)), spectral(2), &selection(false), metadata())
            .unwrap_err();
        assert!(matches!(err, HsiError::OutputValidation(_)));
    }

    #[test]
    fn test_missing_attribute_rejected() {
        let cube =
            OutputAssembler::assemble(correction((2, 2)), spectral(3), &selection(false), metadata()).unwrap();
        let mut attributes = cube.attributes().clone();
        attributes.remove(ATTR_PIPELINE_VERSION);

        let err = OutputAssembler::from_parts(
            cube.radiance().clone(),
            cube.quality_mask().clone(),
            cube.wavelengths().clone(),
            cube.provenance().clone(),
            attributes,
        )
        .unwrap_err();
        assert!(err.to_string().contains(ATTR_PIPELINE_VERSION));
    }
}
