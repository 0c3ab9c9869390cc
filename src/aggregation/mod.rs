//! Component B: accumulators and the aggregation map that owns them.

mod accumulator;
mod map;

pub use accumulator::{Accumulator, EmittedMetric, Function};
pub use map::AggregationMap;

use std::fmt::Display;

impl Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Function {
    /// The string form used in the accumulator key and published type, e.g. `"arithmetic_mean"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::ArithmeticMean => "arithmetic_mean",
            Function::Consumption => "consumption",
        }
    }

    /// Parse from the wire-level name. `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "arithmetic_mean" => Some(Function::ArithmeticMean),
            "consumption" => Some(Function::Consumption),
            _ => None,
        }
    }
}
