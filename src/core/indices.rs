//! Scene-level spectral indices computed from a calibrated cube

use crate::types::{QualityMask, RadianceCube, WavelengthAxis, QA_VALID};
use ndarray::Axis;

/// Attribute key for the red-edge chlorophyll index
pub const ATTR_NDCI_750_705: &str = "normalized_difference_chlorophyll_index_750_705";

/// `(R750 - R705) / (R750 + R705)` over the unflagged pixels of a cube
pub fn chlorophyll_index_750_705(
    radiance: &RadianceCube,
    quality_mask: &QualityMask,
    wavelengths: &WavelengthAxis,
) -> Option<f64> {
    normalized_difference(radiance, quality_mask, wavelengths, 750.0, 705.0)
}

/// Normalized difference of the scene-mean radiance at two wavelengths (nm)
///
/// Each wavelength resolves to the nearest band and must lie inside the
/// axis range. `None` when a band is out of range, every pixel is flagged,
/// or the two means sum to zero.
pub fn normalized_difference(
    radiance: &RadianceCube,
    quality_mask: &QualityMask,
    wavelengths: &WavelengthAxis,
    first_nm: f64,
    second_nm: f64,
) -> Option<f64> {
    let first = nearest_band(wavelengths, first_nm)?;
    let second = nearest_band(wavelengths, second_nm)?;
    let a = mean_unflagged(radiance, quality_mask, first)?;
    let b = mean_unflagged(radiance, quality_mask, second)?;

    let sum = a + b;
    if sum <= 0.0 {
        return None;
    }
    Some((a - b) / sum)
}

fn nearest_band(wavelengths: &WavelengthAxis, target_nm: f64) -> Option<usize> {
    if wavelengths.is_empty() {
        return None;
    }
    let lo = wavelengths.fold(f64::INFINITY, |acc, &w| acc.min(w));
    let hi = wavelengths.fold(f64::NEG_INFINITY, |acc, &w| acc.max(w));
    if target_nm < lo || target_nm > hi {
        return None;
    }
    wavelengths
        .iter()
        .enumerate()
        .min_by(|(_, x), (_, y)| (*x - target_nm).abs().total_cmp(&(*y - target_nm).abs()))
        .map(|(i, _)| i)
}

fn mean_unflagged(radiance: &RadianceCube, quality_mask: &QualityMask, band: usize) -> Option<f64> {
    let plane = radiance.index_axis(Axis(2), band);
    let (sum, count) = plane
        .iter()
        .zip(quality_mask.iter())
        .filter(|(_, flag)| **flag == QA_VALID)
        .fold((0.0f64, 0usize), |(sum, count), (&value, _)| (sum + f64::from(value), count + 1));
    (count > 0).then(|| sum / count as f64)
}
