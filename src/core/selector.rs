//! Calibration set selection: (sensor variant, acquisition time) -> bundle

use crate::core::bundle::CalibrationBundle;
use crate::core::repository::CalibrationRepository;
use crate::types::{HsiError, HsiResult, SensorVariant};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Outcome of a selection
#[derive(Debug, Clone)]
pub struct CalibrationSelection {
    pub bundle: Arc<CalibrationBundle>,
    /// True when no validity window covered the acquisition time
    pub fallback: bool,
}

/// Resolves the calibration bundle for an acquisition
pub struct CalibrationSelector {
    repository: Arc<CalibrationRepository>,
}

impl CalibrationSelector {
    pub fn new(repository: Arc<CalibrationRepository>) -> Self {
        Self { repository }
    }

    /// Select the bundle for `variant` at `timestamp`
    ///
    /// Covering windows win, and among several covering windows the latest
    /// start wins. Without a covering window the most recent bundle that had
    /// already started is used and the selection is marked as a fallback.
    pub fn select(&self, variant: &SensorVariant, timestamp: DateTime<Utc>) -> HsiResult<CalibrationSelection> {
        let bundles = self.repository.list_bundles(variant)?;
        let selection = select_from(&bundles, variant, timestamp)?;

        if selection.fallback {
            log::warn!(
                "No calibration window for '{}' covers {}; falling back to {} (valid from {})",
                variant,
                timestamp,
                selection.bundle.id(),
                selection.bundle.valid_from()
            );
        } else {
            log::info!("Selected calibration bundle {} for '{}' at {}", selection.bundle.id(), variant, timestamp);
        }
        Ok(selection)
    }
}

/// Selection over a list sorted by validity start ascending
pub fn select_from(
    bundles: &[Arc<CalibrationBundle>],
    variant: &SensorVariant,
    timestamp: DateTime<Utc>,
) -> HsiResult<CalibrationSelection> {
    if bundles.is_empty() {
        return Err(HsiError::NoCalibrationAvailable(variant.to_string()));
    }

    // Sorted ascending, so the last started bundle is the latest start; scanning
    // from the back makes the later-issued bundle win both cases.
    let started = bundles.iter().rev().filter(|b| b.valid_from() <= timestamp);

    let mut latest_started = None;
    for bundle in started {
        if bundle.covers(timestamp) {
            return Ok(CalibrationSelection {
                bundle: Arc::clone(bundle),
                fallback: false,
            });
        }
        if latest_started.is_none() {
            latest_started = Some(bundle);
        }
    }

    match latest_started {
        Some(bundle) => Ok(CalibrationSelection {
            bundle: Arc::clone(bundle),
            fallback: true,
        }),
        None => Err(HsiError::NoCalibrationAvailable(format!(
            "{} (acquisition {} precedes every bundle)",
            variant, timestamp
        ))),
    }
}
