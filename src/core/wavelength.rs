//! Band index -> wavelength mapping and band-count reconciliation

use crate::core::bundle::CalibrationBundle;
use crate::types::{HsiError, HsiResult, WavelengthAxis};
use ndarray::Array1;

/// Raw band -> bundle band lookup shared by the corrector and the mapper
#[derive(Debug, Clone, PartialEq)]
pub struct BandAlignment {
    indices: Vec<usize>,
    rule: Option<String>,
}

impl BandAlignment {
    pub fn identity(bands: usize) -> Self {
        Self {
            indices: (0..bands).collect(),
            rule: None,
        }
    }

    /// Align a cube with `raw_bands` bands to `bundle`
    ///
    /// Equal band counts align one-to-one. Different counts need the bundle's
    /// declared reindex rule, otherwise `BandReconciliation`.
    pub fn resolve(raw_bands: usize, bundle: &CalibrationBundle) -> HsiResult<Self> {
        if raw_bands == 0 {
            return Err(HsiError::InvalidFormat("Raw cube has no bands".to_string()));
        }

        let bundle_bands = bundle.band_count();
        if raw_bands == bundle_bands {
            return Ok(Self::identity(raw_bands));
        }

        let rule = bundle.band_reindex().ok_or_else(|| {
            HsiError::BandReconciliation(format!(
                "Raw cube has {} bands, bundle {} has {} and declares no reindex rule",
                raw_bands,
                bundle.id(),
                bundle_bands
            ))
        })?;

        let indices = rule.resolve(raw_bands, bundle_bands)?;
        log::info!(
            "Reconciled {} raw bands onto {} bundle bands of {} via {}",
            raw_bands,
            bundle_bands,
            bundle.id(),
            rule.describe()
        );
        Ok(Self {
            indices,
            rule: Some(rule.describe()),
        })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Description of the applied reindex rule, `None` for one-to-one alignment
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref()
    }
}

/// Wavelength axis together with the alignment that produced it
#[derive(Debug, Clone)]
pub struct SpectralAxis {
    pub alignment: BandAlignment,
    pub wavelengths: WavelengthAxis,
}

/// Converts raw band indices to calibrated wavelengths
pub struct WavelengthMapper;

impl WavelengthMapper {
    /// Map every raw band of a `raw_bands` cube to its wavelength under `bundle`
    pub fn map(raw_bands: usize, bundle: &CalibrationBundle) -> HsiResult<SpectralAxis> {
        let alignment = BandAlignment::resolve(raw_bands, bundle)?;
        let wavelengths = Self::map_aligned(&alignment, bundle)?;
        Ok(SpectralAxis { alignment, wavelengths })
    }

    /// Evaluate the bundle's mapping through an existing alignment
    pub fn map_aligned(alignment: &BandAlignment, bundle: &CalibrationBundle) -> HsiResult<WavelengthAxis> {
        log::debug!(
            "Mapping {} bands with {} wavelength mapping of {}",
            alignment.len(),
            bundle.wavelength_mapping().kind(),
            bundle.id()
        );

        let mapping = bundle.wavelength_mapping();
        let values = alignment
            .indices()
            .iter()
            .map(|&idx| mapping.evaluate(idx))
            .collect::<HsiResult<Vec<f64>>>()?;
        let axis = Array1::from(values);

        check_strictly_increasing(&axis, bundle.id())?;

        if let (Some(first), Some(last)) = (axis.first(), axis.last()) {
            log::info!("Wavelength axis {:.2} nm .. {:.2} nm over {} bands", first, last, axis.len());
        }
        Ok(axis)
    }
}

/// A wavelength axis that is not strictly increasing means the bundle is broken
pub fn check_strictly_increasing(axis: &WavelengthAxis, bundle_id: &str) -> HsiResult<()> {
    if let Some(i) = axis.iter().position(|w| !w.is_finite()) {
        return Err(HsiError::CalibrationIntegrity(format!(
            "Bundle {} yields a non-finite wavelength at band {}",
            bundle_id, i
        )));
    }
    for i in 1..axis.len() {
        if axis[i] <= axis[i - 1] {
            return Err(HsiError::CalibrationIntegrity(format!(
                "Bundle {} wavelength axis not strictly increasing at band {} ({:.4} nm after {:.4} nm)",
                bundle_id,
                i,
                axis[i],
                axis[i - 1]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bundle::{BandReindex, WavelengthMapping};
    use crate::types::SensorVariant;
    use chrono::{TimeZone, Utc};
    use ndarray::Array1;

    fn bundle(bands: usize, mapping: WavelengthMapping) -> CalibrationBundle {
        CalibrationBundle::new(
            "b1",
            SensorVariant::new("v1"),
            Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
            None,
            Array1::zeros(bands),
            Array1::ones(bands),
            mapping,
        )
        .unwrap()
    }

    #[test]
    fn test_polynomial_axis() {
        let b = bundle(4, WavelengthMapping::Polynomial { coefficients: vec![400.0, 2.5] });
        let axis = WavelengthMapper::map(4, &b).unwrap();
        assert_eq!(axis.wavelengths.to_vec(), vec![400.0, 402.5, 405.0, 407.5]);
        assert!(axis.alignment.rule().is_none());
    }

    #[test]
    fn test_lookup_axis_with_offset_reindex() {
        let b = bundle(
            5,
            WavelengthMapping::LookupTable { wavelengths: vec![400.0, 410.0, 420.0, 430.0, 440.0] },
        )
        .with_band_reindex(BandReindex::Offset { start: 1 })
        .unwrap();
        let axis = WavelengthMapper::map(3, &b).unwrap();
        assert_eq!(axis.wavelengths.to_vec(), vec![410.0, 420.0, 430.0]);
        assert_eq!(axis.alignment.indices(), &[1, 2, 3]);
        assert_eq!(axis.alignment.rule(), Some("offset:1"));
    }

    #[test]
    fn test_band_count_mismatch_without_rule() {
        let b = bundle(5, WavelengthMapping::Polynomial { coefficients: vec![400.0, 1.0] });
        let err = WavelengthMapper::map(3, &b).unwrap_err();
        assert!(matches!(err, HsiError::BandReconciliation(_)));
    }

    #[test]
    fn test_non_monotonic_axis_is_integrity_error() {
        // Downward-opening parabola peaks at band 5
        let b = bundle(8, WavelengthMapping::Polynomial { coefficients: vec![400.0, 10.0, -1.0] });
        let err = WavelengthMapper::map(8, &b).unwrap_err();
        assert!(matches!(err, HsiError::CalibrationIntegrity(_)));

        let flat = bundle(3, WavelengthMapping::LookupTable { wavelengths: vec![400.0, 400.0, 410.0] });
        assert!(matches!(WavelengthMapper::map(3, &flat), Err(HsiError::CalibrationIntegrity(_))));
    }
}
