//! Calibration bundle model: time-versioned dark, gain and spectral coefficients

use crate::types::{Dn, HsiError, HsiResult, SensorVariant};
use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// How a bundle turns a band index into a wavelength (nm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WavelengthMapping {
    /// `λ(i) = c0 + c1·i + c2·i² + ...`
    Polynomial { coefficients: Vec<f64> },
    /// `λ(i) = table[i]`
    LookupTable { wavelengths: Vec<f64> },
}

impl WavelengthMapping {
    /// Evaluate the mapping at a bundle band index
    pub fn evaluate(&self, band: usize) -> HsiResult<f64> {
        match self {
            WavelengthMapping::Polynomial { coefficients } => {
                let x = band as f64;
                // Horner
                Ok(coefficients.iter().rev().fold(0.0, |acc, &c| acc * x + c))
            }
            WavelengthMapping::LookupTable { wavelengths } => {
                wavelengths.get(band).copied().ok_or_else(|| {
                    HsiError::CalibrationIntegrity(format!(
                        "Band {} outside wavelength lookup table of {} entries",
                        band,
                        wavelengths.len()
                    ))
                })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WavelengthMapping::Polynomial { .. } => "polynomial",
            WavelengthMapping::LookupTable { .. } => "lookup",
        }
    }
}

/// Rule aligning raw band indices with a bundle whose band count differs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BandReindex {
    /// Raw band `i` is bundle band `start + i`
    Offset { start: usize },
    /// Raw band `i` is bundle band `indices[i]`
    Explicit { indices: Vec<usize> },
}

impl BandReindex {
    /// Resolve the raw → bundle index table for a cube with `raw_bands` bands
    pub fn resolve(&self, raw_bands: usize, bundle_bands: usize) -> HsiResult<Vec<usize>> {
        match self {
            BandReindex::Offset { start } => {
                if start + raw_bands > bundle_bands {
                    return Err(HsiError::BandReconciliation(format!(
                        "Offset rule start={} cannot place {} raw bands inside {} bundle bands",
                        start, raw_bands, bundle_bands
                    )));
                }
                Ok((0..raw_bands).map(|i| start + i).collect())
            }
            BandReindex::Explicit { indices } => {
                if indices.len() != raw_bands {
                    return Err(HsiError::BandReconciliation(format!(
                        "Explicit rule maps {} bands but the raw cube has {}",
                        indices.len(),
                        raw_bands
                    )));
                }
                if let Some(&bad) = indices.iter().find(|&&idx| idx >= bundle_bands) {
                    return Err(HsiError::BandReconciliation(format!(
                        "Explicit rule references bundle band {} of {}",
                        bad, bundle_bands
                    )));
                }
                Ok(indices.clone())
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BandReindex::Offset { start } => format!("offset:{}", start),
            BandReindex::Explicit { indices } => format!("explicit:{}", indices.len()),
        }
    }
}

/// A versioned set of correction coefficients valid for one sensor variant over a time window
///
/// Bundles are validated on construction and never mutated afterwards; the
/// repository hands them out behind `Arc`.
#[derive(Debug, Clone)]
pub struct CalibrationBundle {
    id: String,
    sensor_variant: SensorVariant,
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
    dark: Array1<f32>,
    gain: Array1<f32>,
    wavelength_mapping: WavelengthMapping,
    band_reindex: Option<BandReindex>,
    saturation_value: Option<Dn>,
}

impl CalibrationBundle {
    /// Build a bundle, rejecting inconsistent coefficient arrays with `CalibrationLoad`
    pub fn new(
        id: impl Into<String>,
        sensor_variant: SensorVariant,
        valid_from: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
        dark: Array1<f32>,
        gain: Array1<f32>,
        wavelength_mapping: WavelengthMapping,
    ) -> HsiResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(HsiError::CalibrationLoad("Bundle identifier is empty".to_string()));
        }
        if dark.is_empty() || gain.is_empty() {
            return Err(HsiError::CalibrationLoad(format!(
                "Bundle {}: dark or gain array is empty",
                id
            )));
        }
        if dark.len() != gain.len() {
            return Err(HsiError::CalibrationLoad(format!(
                "Bundle {}: dark has {} bands but gain has {}",
                id,
                dark.len(),
                gain.len()
            )));
        }
        if let Some(until) = valid_until {
            if until <= valid_from {
                return Err(HsiError::CalibrationLoad(format!(
                    "Bundle {}: validity ends ({}) before it starts ({})",
                    id, until, valid_from
                )));
            }
        }
        if dark.iter().any(|v| !v.is_finite()) {
            return Err(HsiError::CalibrationLoad(format!("Bundle {}: non-finite dark value", id)));
        }
        if gain.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(HsiError::CalibrationLoad(format!(
                "Bundle {}: gain values must be finite and non-negative",
                id
            )));
        }
        match &wavelength_mapping {
            WavelengthMapping::Polynomial { coefficients } => {
                if coefficients.is_empty() || coefficients.iter().any(|c| !c.is_finite()) {
                    return Err(HsiError::CalibrationLoad(format!(
                        "Bundle {}: polynomial wavelength coefficients missing or non-finite",
                        id
                    )));
                }
            }
            WavelengthMapping::LookupTable { wavelengths } => {
                if wavelengths.len() != dark.len() {
                    return Err(HsiError::CalibrationLoad(format!(
                        "Bundle {}: wavelength table has {} entries for {} bands",
                        id,
                        wavelengths.len(),
                        dark.len()
                    )));
                }
            }
        }

        Ok(Self {
            id,
            sensor_variant,
            valid_from,
            valid_until,
            dark,
            gain,
            wavelength_mapping,
            band_reindex: None,
            saturation_value: None,
        })
    }

    /// Attach the band-reindexing rule used when a raw cube has a different band count
    pub fn with_band_reindex(mut self, rule: BandReindex) -> HsiResult<Self> {
        let bands = self.band_count();
        let in_range = match &rule {
            BandReindex::Offset { start } => *start < bands,
            BandReindex::Explicit { indices } => !indices.is_empty() && indices.iter().all(|&i| i < bands),
        };
        if !in_range {
            return Err(HsiError::CalibrationLoad(format!(
                "Bundle {}: band reindex rule {} does not fit {} bands",
                self.id,
                rule.describe(),
                bands
            )));
        }
        self.band_reindex = Some(rule);
        Ok(self)
    }

    /// Override the detector saturation DN for scans calibrated with this bundle
    pub fn with_saturation_value(mut self, value: Dn) -> Self {
        self.saturation_value = Some(value);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sensor_variant(&self) -> &SensorVariant {
        &self.sensor_variant
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.valid_until
    }

    pub fn dark(&self) -> &Array1<f32> {
        &self.dark
    }

    pub fn gain(&self) -> &Array1<f32> {
        &self.gain
    }

    pub fn wavelength_mapping(&self) -> &WavelengthMapping {
        &self.wavelength_mapping
    }

    pub fn band_reindex(&self) -> Option<&BandReindex> {
        self.band_reindex.as_ref()
    }

    pub fn saturation_value(&self) -> Option<Dn> {
        self.saturation_value
    }

    pub fn band_count(&self) -> usize {
        self.dark.len()
    }

    /// Validity windows are half-open: `[valid_from, valid_until)`
    pub fn covers(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.valid_from && self.valid_until.map_or(true, |until| timestamp < until)
    }

    /// True when the two windows share at least one instant
    pub fn overlaps(&self, other: &CalibrationBundle) -> bool {
        let self_ends_after = other.valid_until.map_or(true, |u| self.valid_from < u);
        let other_ends_after = self.valid_until.map_or(true, |u| other.valid_from < u);
        self_ends_after && other_ends_after
    }
}
