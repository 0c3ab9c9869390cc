//! Raw measurements as they arrive from the bus or the shared-memory store.

use std::fmt::Display;

/// A single scalar measurement for one `(quantity, asset)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Measurement family, e.g. `realpower.default`.
    pub quantity: String,
    /// Measured entity, e.g. `DEV1`.
    pub asset: String,
    /// Parsed numeric value.
    pub value: f64,
    /// Unit as reported by the source, e.g. `W`.
    pub unit: String,
    /// Seconds since the epoch.
    pub timestamp_s: u64,
    /// Source-declared time-to-live in seconds (not used by the engine itself).
    pub ttl_s: u32,
}

impl Display for RawSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} = {} {} (t={})",
            self.quantity, self.asset, self.value, self.unit, self.timestamp_s
        )
    }
}

impl RawSample {
    /// Parse a sample from its wire-level fields, validating per §3/§7 of the spec.
    ///
    /// Returns `None` (and the caller should log a warning) for an empty asset
    /// name, empty quantity, or a value string that doesn't parse to a finite
    /// float.
    pub fn parse(
        quantity: impl Into<String>,
        asset: impl Into<String>,
        value: &str,
        unit: impl Into<String>,
        timestamp_s: u64,
        ttl_s: u32,
    ) -> Option<Self> {
        let quantity = quantity.into();
        let asset = asset.into();
        if quantity.is_empty() || asset.is_empty() {
            return None;
        }
        let value: f64 = value.trim().parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        Some(Self {
            quantity,
            asset,
            value,
            unit: unit.into(),
            timestamp_s,
            ttl_s,
        })
    }

    /// Whether this sample is excluded from aggregation by the sensor carve-out:
    /// asset names starting with `sensor-` combined with quantity
    /// `temperature.default` or `humidity.default`.
    pub fn is_sensor_carve_out(&self) -> bool {
        self.asset.starts_with("sensor-")
            && matches!(
                self.quantity.as_str(),
                "temperature.default" | "humidity.default"
            )
    }

    /// Whether `consumption` aggregation should even be attempted for this
    /// sample. Only `realpower.default` is integrated; every other quantity
    /// is exempt (grounded in `original_source/src/fty_mc_server.cc`, which
    /// filters `type == "consumption" && quantity != "realpower.default"`
    /// before calling into the stats map).
    pub fn is_consumption_eligible(&self) -> bool {
        self.quantity == "realpower.default"
    }
}
