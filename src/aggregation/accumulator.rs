use crate::sample::RawSample;
use crate::time_source::aligned_start;

/// One of the four supported aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    /// Minimum observed value in the window.
    Min,
    /// Maximum observed value in the window.
    Max,
    /// Arithmetic mean of observed values in the window.
    ArithmeticMean,
    /// Time-integrated power, in watt-seconds.
    Consumption,
}

/// Build the accumulator key / future publish subject: `"<quantity>_<function>_<step_label>@<asset>"`.
pub fn accumulator_key(quantity: &str, function: Function, step_label: &str, asset: &str) -> String {
    format!("{quantity}_{function}_{step_label}@{asset}")
}

fn published_type(quantity: &str, function: Function, step_label: &str) -> String {
    format!("{quantity}_{function}_{step_label}")
}

/// A completed aggregation, ready for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedMetric {
    /// `"<published_type>@<asset>"`.
    pub key: String,
    /// `"<quantity>_<function>_<step_label>"`, published as the metric type.
    pub quantity_out: String,
    /// Asset the metric belongs to.
    pub asset: String,
    /// Unit, or `"Ws"` for consumption.
    pub unit: String,
    /// Formatted numeric value (2 decimals, or 1 for consumption).
    pub value: String,
    /// `2 * step_s`.
    pub ttl_s: u32,
    /// `x-cm-count` aux field.
    pub count: u64,
    /// `x-cm-sum` aux field.
    pub sum: f64,
    /// `x-cm-type` aux field.
    pub function: Function,
    /// `x-cm-step` aux field, in seconds.
    pub step_s: u32,
    /// `x-cm-last-ts` aux field.
    pub last_sample_ts_s: u64,
    /// Whether the caller should actually publish this metric. `false` for a
    /// zero-filled min/max/mean emitted with no samples in the interval.
    pub should_publish: bool,
}

/// Per-key mutable aggregation state (§3 "Accumulator").
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub(crate) quantity_out: String,
    pub(crate) asset: String,
    pub(crate) unit: String,
    pub(crate) value: f64,
    pub(crate) interval_start_s: u64,
    pub(crate) count: u64,
    pub(crate) sum: f64,
    pub(crate) last_sample_ts_s: u64,
    pub(crate) step_s: u32,
    pub(crate) function: Function,
    pub(crate) ttl_s: u32,
}

impl Accumulator {
    /// Create the accumulator for a brand-new key, from its first sample.
    pub(crate) fn first(
        function: Function,
        step_label: &str,
        step_s: u32,
        sample: &RawSample,
        now_s: u64,
    ) -> Self {
        let interval_start_s = aligned_start(now_s, step_s);
        let quantity_out = published_type(&sample.quantity, function, step_label);
        match function {
            Function::Consumption => Accumulator {
                quantity_out,
                asset: sample.asset.clone(),
                unit: "Ws".to_owned(),
                value: 0.0,
                interval_start_s,
                count: 1,
                sum: sample.value,
                last_sample_ts_s: now_s,
                step_s,
                function,
                ttl_s: 2 * step_s,
            },
            _ => Accumulator {
                quantity_out,
                asset: sample.asset.clone(),
                unit: sample.unit.clone(),
                value: sample.value,
                interval_start_s,
                count: 1,
                sum: sample.value,
                last_sample_ts_s: sample.timestamp_s,
                step_s,
                function,
                ttl_s: 2 * step_s,
            },
        }
    }

    fn interval_ended(&self, now_s: u64) -> bool {
        now_s.saturating_sub(self.interval_start_s) >= self.step_s as u64
    }

    fn to_emitted(&self) -> EmittedMetric {
        let should_publish = match self.function {
            Function::Consumption => true,
            _ => self.count > 0,
        };
        EmittedMetric {
            key: format!("{}@{}", self.quantity_out, self.asset),
            quantity_out: self.quantity_out.clone(),
            asset: self.asset.clone(),
            unit: self.unit.clone(),
            value: format_value(self.function, self.value),
            ttl_s: self.ttl_s,
            count: self.count,
            sum: self.sum,
            function: self.function,
            step_s: self.step_s,
            last_sample_ts_s: self.last_sample_ts_s,
            should_publish,
        }
    }

    /// Fold `sample` into this accumulator. Returns `Some(emitted)` when doing
    /// so closed out the interval this accumulator was tracking.
    pub(crate) fn update(&mut self, sample: &RawSample, now_s: u64) -> Option<EmittedMetric> {
        if sample.timestamp_s <= self.last_sample_ts_s {
            log::debug!(
                "{}: dropping out-of-order sample (t={} <= last_ts={})",
                self.quantity_out,
                sample.timestamp_s,
                self.last_sample_ts_s
            );
            return None;
        }

        if self.interval_ended(now_s) {
            return Some(self.roll_over(sample, now_s));
        }

        self.update_in_interval(sample, now_s);
        None
    }

    fn roll_over(&mut self, sample: &RawSample, now_s: u64) -> EmittedMetric {
        let new_start = aligned_start(now_s, self.step_s);

        if self.function == Function::Consumption {
            let last_power = self.sum;
            let delta_tail = tail_delta(new_start, self.last_sample_ts_s, self.step_s);
            let mut emitted = self.to_emitted();
            emitted.value = format_value(self.function, self.value + last_power * delta_tail as f64);

            let delta_head = now_s.saturating_sub(new_start);
            self.value = sample.value * delta_head as f64;
            self.sum = sample.value;
            self.last_sample_ts_s = now_s;
            self.count = 1;
            self.interval_start_s = new_start;
            emitted
        } else {
            let emitted = self.to_emitted();
            self.interval_start_s = new_start;
            self.count = 1;
            self.sum = sample.value;
            self.value = sample.value;
            self.last_sample_ts_s = sample.timestamp_s;
            emitted
        }
    }

    fn update_in_interval(&mut self, sample: &RawSample, now_s: u64) {
        match self.function {
            Function::Min => {
                if self.count == 0 || sample.value < self.value {
                    self.value = sample.value;
                }
                self.count += 1;
                self.last_sample_ts_s = sample.timestamp_s;
            }
            Function::Max => {
                if self.count == 0 || sample.value > self.value {
                    self.value = sample.value;
                }
                self.count += 1;
                self.last_sample_ts_s = sample.timestamp_s;
            }
            Function::ArithmeticMean => {
                let new_sum = self.sum + sample.value;
                let new_avg = new_sum / (self.count + 1) as f64;
                if new_sum.is_nan() || new_avg.is_nan() {
                    log::warn!(
                        "{}: NaN in arithmetic_mean update (sum={new_sum}, avg={new_avg}), skipping",
                        self.quantity_out
                    );
                    return;
                }
                self.sum = new_sum;
                self.value = new_avg;
                self.count += 1;
                self.last_sample_ts_s = sample.timestamp_s;
            }
            Function::Consumption => {
                let last_power = self.sum;
                let last_ts = self.last_sample_ts_s;
                self.sum = sample.value;
                let inc = last_power * now_s.saturating_sub(last_ts) as f64;
                if inc > 0.0 {
                    self.value += inc;
                }
                self.last_sample_ts_s = now_s;
                self.count += 1;
            }
        }
    }

    /// Called by the tick poller: if the interval has ended, produce an
    /// emitted metric and reset state for the new interval without a new
    /// sample to seed it.
    pub(crate) fn poll(&mut self, now_s: u64) -> Option<EmittedMetric> {
        if !self.interval_ended(now_s) {
            return None;
        }
        let new_start = aligned_start(now_s, self.step_s);

        if self.function == Function::Consumption {
            let last_power = self.sum;
            let delta_tail = tail_delta(new_start, self.last_sample_ts_s, self.step_s);
            let mut emitted = self.to_emitted();
            emitted.value = format_value(self.function, self.value + last_power * delta_tail as f64);

            let delta_head = now_s.saturating_sub(new_start);
            self.value = last_power * delta_head as f64;
            self.last_sample_ts_s = now_s;
            self.count = 1;
            self.interval_start_s = new_start;
            Some(emitted)
        } else {
            let emitted = self.to_emitted();
            self.interval_start_s = new_start;
            self.sum = 0.0;
            self.value = 0.0;
            self.count = 0;
            Some(emitted)
        }
    }
}

/// `min(step_s, max(0, new_interval_start - last_sample_ts))`: the elapsed
/// time the last accepted power sample prevailed until the closing interval
/// ended, capped at one full step.
fn tail_delta(new_interval_start: u64, last_sample_ts_s: u64, step_s: u32) -> u64 {
    let raw = new_interval_start.saturating_sub(last_sample_ts_s);
    raw.min(step_s as u64)
}

fn format_value(function: Function, value: f64) -> String {
    match function {
        Function::Consumption => format!("{value:.1}"),
        _ => format!("{value:.2}"),
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
    fn first_min_max_mean_seeds_value_and_sum() {
        let s = sample("realpower.default", "DEV1", 42.0, 100);
        let acc = Accumulator::first(Function::Min, "5s", 5, &s, 100);
        assert_eq!(acc.value, 42.0);
        assert_eq!(acc.sum, 42.0);
        assert_eq!(acc.count, 1);
        assert_eq!(acc.interval_start_s, 100);
        assert_eq!(acc.last_sample_ts_s, 100);
        assert_eq!(acc.ttl_s, 10);
    }

    #[test]
    fn first_consumption_starts_at_zero_with_ws_unit() {
        let s = sample("realpower.default", "DEV1", 100.0, 100);
        let acc = Accumulator::first(Function::Consumption, "30s", 30, &s, 100);
        assert_eq!(acc.value, 0.0);
        assert_eq!(acc.sum, 100.0);
        assert_eq!(acc.unit, "Ws");
        assert_eq!(acc.last_sample_ts_s, 100);
    }

    #[test]
    fn s1_min_max_mean_of_four_samples_in_one_window() {
        // step 5s, T aligned; samples at T, T, T+3, T+3 with values 100,50,42,242
        let t = 100u64;
        let values = [100.0, 50.0, 42.0, 242.0];
        let mut min_acc = Accumulator::first(Function::Min, "5s", 5, &sample("q", "A", values[0], t), t);
        let mut max_acc = Accumulator::first(Function::Max, "5s", 5, &sample("q", "A", values[0], t), t);
        let mut mean_acc =
            Accumulator::first(Function::ArithmeticMean, "5s", 5, &sample("q", "A", values[0], t), t);

        for (i, v) in values.iter().enumerate().skip(1) {
            let ts = if i < 2 { t } else { t + 3 };
            assert!(min_acc.update(&sample("q", "A", *v, ts), t).is_none());
            assert!(max_acc.update(&sample("q", "A", *v, ts), t).is_none());
            assert!(mean_acc.update(&sample("q", "A", *v, ts), t).is_none());
        }

        let emitted_min = min_acc.poll(t + 5).unwrap();
        let emitted_max = max_acc.poll(t + 5).unwrap();
        let emitted_mean = mean_acc.poll(t + 5).unwrap();

        assert_eq!(emitted_min.value, "42.00");
        assert_eq!(emitted_max.value, "242.00");
        assert_eq!(emitted_mean.value, "108.50");
    }

    #[test]
    fn s2_two_successive_windows() {
        let t = 0u64;
        let mut min_acc = Accumulator::first(Function::Min, "1s", 1, &sample("q", "A", 100.0, t), t);
        let mut max_acc = Accumulator::first(Function::Max, "1s", 1, &sample("q", "A", 100.0, t), t);
        min_acc.update(&sample("q", "A", 50.0, t), t);
        max_acc.update(&sample("q", "A", 50.0, t), t);

        let e1_min = min_acc.update(&sample("q", "A", 142.0, t + 1), t + 1).unwrap();
        let e1_max = max_acc.update(&sample("q", "A", 142.0, t + 1), t + 1).unwrap();
        assert_eq!(e1_min.value, "50.00");
        assert_eq!(e1_max.value, "100.00");

        min_acc.update(&sample("q", "A", 242.0, t + 1), t + 1);
        max_acc.update(&sample("q", "A", 242.0, t + 1), t + 1);

        let e2_min = min_acc.poll(t + 2).unwrap();
        let e2_max = max_acc.poll(t + 2).unwrap();
        assert_eq!(e2_min.value, "142.00");
        assert_eq!(e2_max.value, "242.00");
    }

    #[test]
    fn s5_consumption_across_one_boundary_30s() {
        let t = 0u64;
        let mut acc = Accumulator::first(
            Function::Consumption,
            "30s",
            30,
            &sample("realpower.default", "A", 100.0, t),
            t,
        );
        // at t+15, power=150
        acc.update(&sample("realpower.default", "A", 150.0, t + 15), t + 15);
        // at t+25, power=200
        acc.update(&sample("realpower.default", "A", 200.0, t + 25), t + 25);
        // at t+30, interval ends
        let emitted = acc.poll(t + 30).unwrap();
        // 100*15 + 150*10 + 200*5 = 1500+1500+1000 = 4000.0
        assert_eq!(emitted.value, "4000.0");
    }

    #[test]
    fn s5_consumption_10s_parallel_step() {
        let t = 0u64;
        let mut acc = Accumulator::first(
            Function::Consumption,
            "10s",
            10,
            &sample("realpower.default", "A", 100.0, t),
            t,
        );
        let e1 = acc.poll(t + 10).unwrap();
        assert_eq!(e1.value, "1000.0");

        acc.update(&sample("realpower.default", "A", 150.0, t + 15), t + 15);
        let e2 = acc.poll(t + 20).unwrap();
        assert_eq!(e2.value, "1250.0");

        acc.update(&sample("realpower.default", "A", 200.0, t + 25), t + 25);
        let e3 = acc.poll(t + 30).unwrap();
        assert_eq!(e3.value, "1750.0");
    }

    #[test]
    fn late_sample_is_dropped() {
        let mut acc = Accumulator::first(Function::Min, "5s", 5, &sample("q", "A", 1.0, 10), 10);
        assert!(acc.update(&sample("q", "A", 99.0, 10), 10).is_none());
        assert_eq!(acc.value, 1.0, "late/equal-timestamp sample must not mutate value");
        assert_eq!(acc.count, 1);
    }

    #[test]
    fn exact_boundary_triggers_rollover_not_inplace_update() {
        let mut acc = Accumulator::first(Function::Min, "5s", 5, &sample("q", "A", 1.0, 0), 0);
        let emitted = acc.update(&sample("q", "A", 2.0, 5), 5);
        assert!(emitted.is_some(), "now_s - interval_start == step_s must roll over");
    }

    #[test]
    fn poll_on_unfinished_interval_is_none() {
        let mut acc = Accumulator::first(Function::Min, "5s", 5, &sample("q", "A", 1.0, 0), 0);
        assert!(acc.poll(3).is_none());
    }

    #[test]
    fn poll_zero_count_min_max_mean_not_published() {
        let mut acc = Accumulator::first(Function::Min, "5s", 5, &sample("q", "A", 1.0, 0), 0);
        let first_emit = acc.poll(5).unwrap();
        assert!(first_emit.should_publish);
        // No samples arrived during [5, 10) before the next poll.
        let second = acc.poll(10).unwrap();
        assert!(!second.should_publish);
        assert_eq!(second.value, "0.00");
    }

    #[test]
    fn poll_consumption_always_published() {
        let mut acc = Accumulator::first(
            Function::Consumption,
            "5s",
            5,
            &sample("realpower.default", "A", 10.0, 0),
            0,
        );
        let e1 = acc.poll(5).unwrap();
        assert!(e1.should_publish);
        let e2 = acc.poll(10).unwrap();
        assert!(e2.should_publish, "consumption always emits even with no new samples");
    }

    #[test]
    fn arithmetic_mean_nan_guard_leaves_accumulator_unchanged() {
        let mut acc = Accumulator::first(Function::ArithmeticMean, "5s", 5, &sample("q", "A", 1.0, 0), 0);
        acc.sum = f64::NAN;
        acc.update(&sample("q", "A", 2.0, 1), 1);
        assert!(acc.sum.is_nan());
        assert_eq!(acc.count, 1, "NaN-aborted update must not increment count");
    }
}
