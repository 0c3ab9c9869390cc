//! The shared-memory store: a dual-role interface the engine both publishes
//! emitted metrics into and periodically pulls raw samples from (spec §6).
//!
//! The pull side's type pattern carries a negative look-ahead excluding the
//! engine's own published types, so a store that mixes raw and aggregated
//! metrics in one namespace doesn't feed the engine its own output back.
//! `regex` doesn't support look-around, so the exclusion is applied as a
//! second pass over what the inclusion half matches (see `TYPE_PATTERN`
//! and `matches_type`).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;

use crate::error::Result;
use crate::sample::RawSample;

/// The asset pattern the puller always subscribes with.
pub const ASSET_PATTERN: &str = ".*";

/// Matches quantities the engine pulls and aggregates from shared memory.
const TYPE_INCLUDE: &str = r"^realpower\.default|^power\.default|current\.(output|input)\.L(1|2|3)|voltage\.(output|input)\.L(1|2|3)-N|voltage\.input\.(1|2)|.*temperature|.*humidity";

/// Matches the engine's own published output, to be excluded from the pull
/// (the distilled spec's pattern expresses this as a negative look-ahead;
/// `regex` has none, so it's applied as a second, excluding match).
const TYPE_EXCLUDE: &str = r"_arithmetic_mean|_max_|_min_|_consumption_";

/// Compiled form of the pull-side type pattern described in spec §6.
pub struct TypePattern {
    include: Regex,
    exclude: Regex,
}

impl TypePattern {
    /// Build the engine's standard pull pattern. `expect()` here is safe:
    /// the pattern is a compile-time constant validated by its own test.
    pub fn standard() -> Self {
        TypePattern {
            include: Regex::new(TYPE_INCLUDE).expect("TYPE_INCLUDE is a valid static regex"),
            exclude: Regex::new(TYPE_EXCLUDE).expect("TYPE_EXCLUDE is a valid static regex"),
        }
    }

    /// Whether `quantity_type` should be pulled and aggregated.
    pub fn matches(&self, quantity_type: &str) -> bool {
        self.include.is_match(quantity_type) && !self.exclude.is_match(quantity_type)
    }
}

/// A single record as read back out of shared memory by the puller.
#[derive(Debug, Clone, PartialEq)]
pub struct ShmRecord {
    /// Asset the record belongs to.
    pub asset: String,
    /// Measurement type/quantity.
    pub quantity: String,
    /// Formatted numeric value, as stored.
    pub value: String,
    /// Reported unit.
    pub unit: String,
    /// Seconds since the epoch the record was last written.
    pub timestamp_s: u64,
    /// Declared time-to-live in seconds.
    pub ttl_s: u32,
}

/// The shared-memory side of the engine (spec §6): a publish sink for
/// emitted metrics, and a pull source the puller task scans periodically.
#[async_trait]
pub trait SharedMemoryStore: Send + Sync {
    /// Publish one emitted metric.
    async fn write_metric(
        &self,
        asset: &str,
        quantity: &str,
        value: &str,
        unit: &str,
        ttl_s: u32,
    ) -> Result<()>;

    /// Read every record whose asset matches `asset_pattern` and whose
    /// quantity matches `type_pattern`.
    async fn read_metrics(&self, asset_pattern: &str, type_pattern: &TypePattern) -> Vec<ShmRecord>;
}

/// A process-local, in-memory `SharedMemoryStore` for standalone operation
/// and tests.
#[derive(Default)]
pub struct LocalShm {
    records: Mutex<HashMap<(String, String), ShmRecord>>,
}

impl LocalShm {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw record directly, as a test fixture or an external writer
    /// would.
    pub fn seed(&self, record: ShmRecord) {
        let mut guard = self.records.lock().expect("LocalShm mutex poisoned");
        guard.insert((record.asset.clone(), record.quantity.clone()), record);
    }
}

#[async_trait]
impl SharedMemoryStore for LocalShm {
    async fn write_metric(
        &self,
        asset: &str,
        quantity: &str,
        value: &str,
        unit: &str,
        ttl_s: u32,
    ) -> Result<()> {
        self.seed(ShmRecord {
            asset: asset.to_owned(),
            quantity: quantity.to_owned(),
            value: value.to_owned(),
            unit: unit.to_owned(),
            timestamp_s: 0,
            ttl_s,
        });
        Ok(())
    }

    async fn read_metrics(&self, asset_pattern: &str, type_pattern: &TypePattern) -> Vec<ShmRecord> {
        let asset_re = match Regex::new(asset_pattern) {
            Ok(re) => re,
            Err(err) => {
                log::warn!("bad asset pattern {asset_pattern:?}: {err}");
                return Vec::new();
            }
        };
        let guard = self.records.lock().expect("LocalShm mutex poisoned");
        guard
            .values()
            .filter(|r| asset_re.is_match(&r.asset) && type_pattern.matches(&r.quantity))
            .cloned()
            .collect()
    }
}

/// Convert a pulled shared-memory record into a `RawSample`, as the puller
/// task's bridge to `Engine::handle_sample`.
pub fn record_to_sample(record: &ShmRecord) -> Option<RawSample> {
    RawSample::parse(
        record.quantity.clone(),
        record.asset.clone(),
        &record.value,
        record.unit.clone(),
        record.timestamp_s,
        record.ttl_s,
    )
}
