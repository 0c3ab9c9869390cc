//! The engine: step table, aggregation map, and time source bound together
//! behind the single process-wide lock described in spec §5. Both the
//! server loop and the shared-memory puller task share one `Engine` wrapped
//! in a `tokio::sync::Mutex`, generalized from the teacher's
//! `SerializingSink` wrapper-around-a-mutex idiom to guard the whole engine
//! rather than a single downstream sink.

use std::path::PathBuf;

use crate::aggregation::{AggregationMap, EmittedMetric, Function};
use crate::sample::RawSample;
use crate::state;
use crate::step::StepTable;
use crate::time_source::TimeSource;

/// Bundles the configured functions, steps, aggregation state, and time
/// source that together define one running aggregator.
pub struct Engine {
    map: AggregationMap,
    steps: StepTable,
    functions: Vec<Function>,
    time: TimeSource,
    state_path: PathBuf,
}

impl Engine {
    /// Build a new engine over `steps`/`functions`, checkpointing to
    /// `state_path`. Attempts to restore prior state from `state_path`
    /// immediately; a missing file is not an error.
    pub fn new(steps: StepTable, functions: Vec<Function>, time: TimeSource, state_path: PathBuf) -> Self {
        let mut map = AggregationMap::new();
        match state::load(&mut map, &state_path) {
            Ok(n) => log::info!("restored {n} accumulators from {}", state_path.display()),
            Err(err) => log::warn!("failed to load state from {}: {err}", state_path.display()),
        }
        Engine { map, steps, functions, time, state_path }
    }

    /// GCD of all configured step lengths, `0` if none are configured.
    pub fn gcd(&self) -> u32 {
        self.steps.gcd()
    }

    /// Current wall-clock time in whole seconds.
    pub fn now_s(&self) -> u64 {
        self.time.now_s()
    }

    /// Fold one sample into every `(function, step)` accumulator it's
    /// eligible for (spec §4.3). Applies the sensor carve-out and the
    /// consumption-quantity filter before routing.
    pub fn handle_sample(&mut self, sample: &RawSample) -> Vec<EmittedMetric> {
        if sample.is_sensor_carve_out() {
            log::trace!("{sample}: sensor carve-out, dropped");
            return Vec::new();
        }

        let mut emitted = Vec::new();
        for &function in &self.functions {
            if function == Function::Consumption && !sample.is_consumption_eligible() {
                continue;
            }
            for (step_label, step_s) in self.steps.iter() {
                if let Some(metric) = self.map.update(function, step_label, step_s, sample, &self.time) {
                    emitted.push(metric);
                }
            }
        }
        emitted
    }

    /// Drive every accumulator forward to `now`, emitting any closed-out
    /// intervals. Called by the server loop on its scheduling tick.
    pub fn poll(&mut self) -> Vec<EmittedMetric> {
        let now_s = self.time.now_s();
        self.map.poll(now_s)
    }

    /// Remove every accumulator belonging to `asset` (spec §4.2.3).
    pub fn delete_asset(&mut self, asset: &str) -> usize {
        self.map.delete_asset(asset)
    }

    /// Checkpoint the aggregation map to `state_path`. Failure is logged
    /// and retried on the next tick (spec §7).
    pub fn checkpoint(&self) {
        if let Err(err) = state::save(&self.map, &self.state_path) {
            log::error!("failed to save state to {}: {err}", self.state_path.display());
        }
    }

    /// Number of live accumulators, for diagnostics.
    pub fn accumulator_count(&self) -> usize {
        self.map.len()
    }
}
