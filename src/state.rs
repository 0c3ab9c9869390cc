//! Persistence for the aggregation map: a line-oriented, ordinal-keyed
//! key/value text format, modeled on the zpl-style state file the original
//! agent wrote to disk (`examples/original_source/src/cmstats.cc`,
//! `cmstats_save`/`cmstats_load`).
//!
//! Each accumulator is serialized as a numbered block:
//!
//! ```text
//! 0/key = realpower.default_consumption_30s@DEV1
//! 0/x-cm-count = 12
//! 0/x-cm-sum = 150.000000
//! 0/x-cm-type = consumption
//! 0/x-cm-step = 30
//! 0/x-cm-last-ts = 1700000000
//! 0/value = 4000.000000
//! 0/asset = DEV1
//! 0/unit = Ws
//! 0/quantity_out = realpower.default_consumption_30s
//! 0/interval_start = 1700000000
//! 1/key = ...
//! ```
//!
//! A record whose `value` fails to parse as a finite float is dropped on
//! load rather than aborting the whole file; a record whose `x-cm-sum`
//! alone is corrupt keeps its other fields and has `sum` reset to `0`,
//! mirroring `cmstats_load`'s handling of a corrupt sum aux field.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::aggregation::{Accumulator, AggregationMap, Function};
use crate::error::{ComputeError, Result};

const FIELD_COUNT: &str = "x-cm-count";
const FIELD_SUM: &str = "x-cm-sum";
const FIELD_TYPE: &str = "x-cm-type";
const FIELD_STEP: &str = "x-cm-step";
const FIELD_LAST_TS: &str = "x-cm-last-ts";

/// Write every accumulator in `map` to `path`, via a temp file and atomic
/// rename so a crash mid-write never leaves a half-written state file behind
/// (§10 REDESIGN FLAGS: the original wrote the zpl file in place).
pub fn save(map: &AggregationMap, path: &Path) -> Result<()> {
    let mut body = String::new();
    for (ordinal, (key, acc)) in map.iter().enumerate() {
        write_record(&mut body, ordinal, key, acc);
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp_path).map_err(|source| ComputeError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    file.write_all(body.as_bytes())
        .map_err(|source| ComputeError::Io { path: tmp_path.clone(), source })?;
    file.sync_all()
        .map_err(|source| ComputeError::Io { path: tmp_path.clone(), source })?;
    std::fs::rename(&tmp_path, path).map_err(|source| ComputeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn write_record(out: &mut String, ordinal: usize, key: &str, acc: &Accumulator) {
    out.push_str(&format!("{ordinal}/key = {key}\n"));
    out.push_str(&format!("{ordinal}/{FIELD_COUNT} = {}\n", acc.count));
    out.push_str(&format!("{ordinal}/{FIELD_SUM} = {:.6}\n", acc.sum));
    out.push_str(&format!("{ordinal}/{FIELD_TYPE} = {}\n", acc.function));
    out.push_str(&format!("{ordinal}/{FIELD_STEP} = {}\n", acc.step_s));
    out.push_str(&format!("{ordinal}/{FIELD_LAST_TS} = {}\n", acc.last_sample_ts_s));
    out.push_str(&format!("{ordinal}/value = {:.6}\n", acc.value));
    out.push_str(&format!("{ordinal}/asset = {}\n", acc.asset));
    out.push_str(&format!("{ordinal}/unit = {}\n", acc.unit));
    out.push_str(&format!("{ordinal}/quantity_out = {}\n", acc.quantity_out));
    out.push_str(&format!("{ordinal}/interval_start = {}\n", acc.interval_start_s));
}

/// Load accumulators from `path` into `map`, skipping any record with a
/// non-finite `value` or `x-cm-sum` and logging a warning for it. Missing
/// `path` is not an error: it means a fresh start.
pub fn load(map: &mut AggregationMap, path: &Path) -> Result<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            log::info!("no state file at {}, starting empty", path.display());
            return Ok(0);
        }
        Err(source) => return Err(ComputeError::Io { path: path.to_path_buf(), source }),
    };

    let mut records: HashMap<usize, HashMap<String, String>> = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (path_part, value) = line
            .split_once('=')
            .ok_or_else(|| ComputeError::Parse(format!("line {}: missing '='", lineno + 1)))?;
        let (ordinal_str, field) = path_part
            .trim()
            .split_once('/')
            .ok_or_else(|| ComputeError::Parse(format!("line {}: missing '/'", lineno + 1)))?;
        let ordinal: usize = ordinal_str
            .parse()
            .map_err(|_| ComputeError::Parse(format!("line {}: bad ordinal '{ordinal_str}'", lineno + 1)))?;
        records
            .entry(ordinal)
            .or_default()
            .insert(field.to_owned(), value.trim().to_owned());
    }

    let mut restored = 0;
    let mut ordinals: Vec<_> = records.keys().copied().collect();
    ordinals.sort_unstable();
    for ordinal in ordinals {
        let fields = &records[&ordinal];
        match restore_one(fields) {
            Some((key, acc)) => {
                map.insert_restored(key, acc);
                restored += 1;
            }
            None => log::warn!("skipping corrupt state record {ordinal} in {}", path.display()),
        }
    }
    Ok(restored)
}

fn restore_one(fields: &HashMap<String, String>) -> Option<(String, Accumulator)> {
    let key = fields.get("key")?.clone();
    let count: u64 = fields.get(FIELD_COUNT)?.parse().ok()?;
    // A non-finite sum is reset to 0 rather than dropping the whole record,
    // mirroring cmstats_load's handling of a corrupt x-cm-sum aux field.
    let sum: f64 = fields.get(FIELD_SUM)?.parse().ok().filter(|s: &f64| s.is_finite()).unwrap_or(0.0);
    let function = Function::parse(fields.get(FIELD_TYPE)?)?;
    let step_s: u32 = fields.get(FIELD_STEP)?.parse().ok()?;
    let last_sample_ts_s: u64 = fields.get(FIELD_LAST_TS)?.parse().ok()?;
    let value: f64 = fields.get("value")?.parse().ok()?;
    let asset = fields.get("asset")?.clone();
    let unit = fields.get("unit")?.clone();
    let quantity_out = fields.get("quantity_out")?.clone();
    let interval_start_s: u64 = fields.get("interval_start")?.parse().ok()?;

    if !value.is_finite() {
        return None;
    }

    Some((
        key,
        Accumulator {
            quantity_out,
            asset,
            unit,
            value,
            interval_start_s,
            count,
            sum,
            last_sample_ts_s,
            step_s,
            function,
            ttl_s: 2 * step_s,
        },
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::sample::RawSample;
    use crate::time_source::TimeSource;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("metric-compute-test-{name}-{}", std::process::id()));
        p
    }

    #[test]
    fn save_then_load_round_trips_accumulator_state() {
        let time = TimeSource::Dynamic(Box::new(|| 0));
        let mut map = AggregationMap::new();
        let sample = RawSample {
            quantity: "realpower.default".to_owned(),
            asset: "DEV1".to_owned(),
            value: 100.0,
            unit: "W".to_owned(),
            timestamp_s: 0,
            ttl_s: 60,
        };
        map.update(Function::Consumption, "30s", 30, &sample, &time);

        let path = tmp_path("roundtrip");
        save(&map, &path).unwrap();

        let mut restored = AggregationMap::new();
        let n = load(&mut restored, &path).unwrap();
        assert_eq!(n, 1);
        assert_eq!(restored.len(), 1);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_loads_as_empty_without_error() {
        let mut map = AggregationMap::new();
        let path = tmp_path("does-not-exist");
        std::fs::remove_file(&path).ok();
        let n = load(&mut map, &path).unwrap();
        assert_eq!(n, 0);
        assert!(map.is_empty());
    }

    #[test]
    fn corrupt_sum_field_is_reset_to_zero_not_dropped() {
        let body = "0/key = q_min_5s@A\n\
                     0/x-cm-count = 1\n\
                     0/x-cm-sum = not-a-number\n\
                     0/x-cm-type = min\n\
                     0/x-cm-step = 5\n\
                     0/x-cm-last-ts = 0\n\
                     0/value = 1.0\n\
                     0/asset = A\n\
                     0/unit = W\n\
                     0/quantity_out = q_min_5s\n\
                     0/interval_start = 0\n";
        let path = tmp_path("corrupt");
        std::fs::write(&path, body).unwrap();

        let mut map = AggregationMap::new();
        let n = load(&mut map, &path).unwrap();
        assert_eq!(n, 1);
        let (_, acc) = map.iter().next().unwrap();
        assert_eq!(acc.sum, 0.0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn nan_sum_field_is_reset_to_zero_not_dropped() {
        let body = "0/key = q_min_5s@A\n\
                     0/x-cm-count = 1\n\
                     0/x-cm-sum = NaN\n\
                     0/x-cm-type = min\n\
                     0/x-cm-step = 5\n\
                     0/x-cm-last-ts = 0\n\
                     0/value = 1.0\n\
                     0/asset = A\n\
                     0/unit = W\n\
                     0/quantity_out = q_min_5s\n\
                     0/interval_start = 0\n";
        let path = tmp_path("nan-sum");
        std::fs::write(&path, body).unwrap();

        let mut map = AggregationMap::new();
        let n = load(&mut map, &path).unwrap();
        assert_eq!(n, 1);
        let (_, acc) = map.iter().next().unwrap();
        assert_eq!(acc.sum, 0.0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn nan_value_record_is_skipped_on_load() {
        let body = "0/key = q_min_5s@A\n\
                     0/x-cm-count = 1\n\
                     0/x-cm-sum = 0.0\n\
                     0/x-cm-type = min\n\
                     0/x-cm-step = 5\n\
                     0/x-cm-last-ts = 0\n\
                     0/value = NaN\n\
                     0/asset = A\n\
                     0/unit = W\n\
                     0/quantity_out = q_min_5s\n\
                     0/interval_start = 0\n";
        let path = tmp_path("nan");
        std::fs::write(&path, body).unwrap();

        let mut map = AggregationMap::new();
        let n = load(&mut map, &path).unwrap();
        assert_eq!(n, 0);
        assert!(map.is_empty());

        std::fs::remove_file(&path).ok();
    }
}
