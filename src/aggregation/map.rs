//! The table of live accumulators, keyed by `accumulator_key()`.

use std::collections::HashMap;

use crate::aggregation::accumulator::{accumulator_key, Accumulator, EmittedMetric, Function};
use crate::sample::RawSample;
use crate::time_source::TimeSource;

/// Owns every live accumulator and drives them from incoming samples or the
/// periodic tick. One process owns exactly one `AggregationMap`; callers are
/// expected to serialize access to it themselves (see `engine::Engine`).
#[derive(Debug, Default)]
pub struct AggregationMap {
    accumulators: HashMap<String, Accumulator>,
}

impl AggregationMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `sample` into the accumulator for `(sample.quantity, function,
    /// step_label, sample.asset)`, creating it if this is the first sample
    /// seen for that key. Returns an emitted metric if folding the sample
    /// closed out an interval.
    pub fn update(
        &mut self,
        function: Function,
        step_label: &str,
        step_s: u32,
        sample: &RawSample,
        time: &TimeSource,
    ) -> Option<EmittedMetric> {
        let key = accumulator_key(&sample.quantity, function, step_label, &sample.asset);
        let now_s = time.now_s();
        match self.accumulators.get_mut(&key) {
            Some(acc) => acc.update(sample, now_s),
            None => {
                self.accumulators
                    .insert(key, Accumulator::first(function, step_label, step_s, sample, now_s));
                None
            }
        }
    }

    /// Drive every accumulator's clock forward, emitting closed-out intervals
    /// for any that have crossed their boundary. Called by the server loop's
    /// tick, spaced at the GCD of all configured steps.
    pub fn poll(&mut self, now_s: u64) -> Vec<EmittedMetric> {
        self.accumulators
            .values_mut()
            .filter_map(|acc| acc.poll(now_s))
            .collect()
    }

    /// Drop every accumulator belonging to `asset`. Called when the asset is
    /// deleted, retired, or otherwise goes non-active.
    pub fn delete_asset(&mut self, asset: &str) -> usize {
        let before = self.accumulators.len();
        self.accumulators.retain(|_, acc| acc.asset != asset);
        before - self.accumulators.len()
    }

    /// Number of live accumulators.
    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    /// Whether the map holds no accumulators.
    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &Accumulator)> {
        self.accumulators.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn insert_restored(&mut self, key: String, accumulator: Accumulator) {
        self.accumulators.insert(key, accumulator);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn sample(quantity: &str, asset: &str, value: f64, ts: u64) -> RawSample {
        RawSample {
            quantity: quantity.to_owned(),
            asset: asset.to_owned(),
            value,
            unit: "W".to_owned(),
            timestamp_s: ts,
            ttl_s: 60,
        }
    }

    #[test]
    fn first_sample_creates_accumulator_without_emitting() {
        let mut map = AggregationMap::new();
        let time = TimeSource::Dynamic(Box::new(|| 0));
        let emitted = map.update(Function::Min, "5s", 5, &sample("q", "A", 1.0, 0), &time);
        assert!(emitted.is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn distinct_functions_and_assets_create_distinct_accumulators() {
        let mut map = AggregationMap::new();
        let time = TimeSource::Dynamic(Box::new(|| 0));
        map.update(Function::Min, "5s", 5, &sample("q", "A", 1.0, 0), &time);
        map.update(Function::Max, "5s", 5, &sample("q", "A", 1.0, 0), &time);
        map.update(Function::Min, "5s", 5, &sample("q", "B", 1.0, 0), &time);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn delete_asset_removes_only_its_accumulators() {
        let mut map = AggregationMap::new();
        let time = TimeSource::Dynamic(Box::new(|| 0));
        map.update(Function::Min, "5s", 5, &sample("q", "A", 1.0, 0), &time);
        map.update(Function::Max, "5s", 5, &sample("q", "A", 1.0, 0), &time);
        map.update(Function::Min, "5s", 5, &sample("q", "B", 1.0, 0), &time);

        let removed = map.delete_asset("A");
        assert_eq!(removed, 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn poll_emits_only_for_closed_intervals() {
        let mut map = AggregationMap::new();
        let time = TimeSource::Dynamic(Box::new(|| 0));
        map.update(Function::Min, "5s", 5, &sample("q", "A", 1.0, 0), &time);
        map.update(Function::Min, "100s", 100, &sample("q", "B", 1.0, 0), &time);

        let emitted = map.poll(5);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].asset, "A");
    }
}
