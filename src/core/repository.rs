//! Read-only calibration repository with a lazily populated, per-variant cache

use crate::core::bundle::CalibrationBundle;
use crate::types::{HsiResult, SensorVariant};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Ordered, shared snapshot of one variant's bundles
pub type BundleList = Arc<[Arc<CalibrationBundle>]>;

/// Where bundles come from (a bundle directory on disk, or a fixed set in memory)
pub trait BundleSource: Send + Sync {
    /// Load every bundle for `variant`; an unknown variant yields an empty list
    fn load_variant(&self, variant: &SensorVariant) -> HsiResult<Vec<CalibrationBundle>>;

    /// Human-readable origin, used in log lines
    fn describe(&self) -> String;
}

impl<S: BundleSource + ?Sized> BundleSource for Arc<S> {
    fn load_variant(&self, variant: &SensorVariant) -> HsiResult<Vec<CalibrationBundle>> {
        (**self).load_variant(variant)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Bundles already held in memory
pub struct StaticBundles {
    bundles: Vec<CalibrationBundle>,
}

impl StaticBundles {
    pub fn new(bundles: Vec<CalibrationBundle>) -> Self {
        Self { bundles }
    }
}

impl BundleSource for StaticBundles {
    fn load_variant(&self, variant: &SensorVariant) -> HsiResult<Vec<CalibrationBundle>> {
        Ok(self
            .bundles
            .iter()
            .filter(|b| b.sensor_variant() == variant)
            .cloned()
            .collect())
    }

    fn describe(&self) -> String {
        format!("in-memory ({} bundles)", self.bundles.len())
    }
}

#[derive(Default)]
struct VariantSlot {
    bundles: OnceLock<BundleList>,
    claim: Mutex<()>,
}

/// Shared calibration store
///
/// Reads take the outer map's read lock only; the first reader of a variant
/// claims that variant's slot and performs the single load while later
/// readers of the same variant wait on the claim. Failed loads are not
/// memoised so a later job can retry them.
pub struct CalibrationRepository {
    source: Box<dyn BundleSource>,
    slots: RwLock<HashMap<SensorVariant, Arc<VariantSlot>>>,
    loads: AtomicUsize,
}

impl CalibrationRepository {
    pub fn new<S: BundleSource + 'static>(source: S) -> Self {
        Self {
            source: Box::new(source),
            slots: RwLock::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Repository over a fixed set of bundles
    pub fn from_bundles(bundles: Vec<CalibrationBundle>) -> Self {
        Self::new(StaticBundles::new(bundles))
    }

    /// All bundles of `variant`, ordered by validity start ascending (ties by identifier)
    pub fn list_bundles(&self, variant: &SensorVariant) -> HsiResult<BundleList> {
        let slot = self.slot(variant);

        if let Some(bundles) = slot.bundles.get() {
            return Ok(Arc::clone(bundles));
        }

        let _claim = slot.claim.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(bundles) = slot.bundles.get() {
            return Ok(Arc::clone(bundles));
        }

        log::info!("Loading calibration bundles for '{}' from {}", variant, self.source.describe());
        self.loads.fetch_add(1, Ordering::SeqCst);

        let mut loaded = self.source.load_variant(variant)?;
        loaded.sort_by(|a, b| {
            a.valid_from()
                .cmp(&b.valid_from())
                .then_with(|| a.id().cmp(b.id()))
        });
        warn_on_overlaps(&loaded);

        let list: BundleList = loaded.into_iter().map(Arc::new).collect::<Vec<_>>().into();
        log::info!("Cached {} calibration bundle(s) for '{}'", list.len(), variant);

        Ok(Arc::clone(slot.bundles.get_or_init(|| list)))
    }

    /// Number of variant loads performed so far
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn slot(&self, variant: &SensorVariant) -> Arc<VariantSlot> {
        {
            let slots = self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(slot) = slots.get(variant) {
                return Arc::clone(slot);
            }
        }
        let mut slots = self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(variant.clone()).or_default())
    }
}

/// Overlapping windows are tolerated (the later start wins at selection) but always reported
fn warn_on_overlaps(sorted: &[CalibrationBundle]) {
    for (i, earlier) in sorted.iter().enumerate() {
        for later in &sorted[i + 1..] {
            if earlier.overlaps(later) {
                log::warn!(
                    "Calibration bundles {} and {} have overlapping validity windows; {} takes precedence",
                    earlier.id(),
                    later.id(),
                    later.id()
                );
            }
        }
    }
}
