//! A streaming metric aggregator: folds a telemetry bus's raw per-asset
//! samples into tumbling-window min/max/arithmetic-mean/consumption
//! metrics and republishes them.
//!
//! The engine (`engine::Engine`) binds together the step table
//! (`step::StepTable`), the live aggregation state (`aggregation`), and an
//! injectable clock (`time_source::TimeSource`). The server loop
//! (`server`) drives it from a `BusClient` and an optional
//! `SharedMemoryStore` puller task.

pub mod aggregation;
pub mod config;
pub mod engine;
pub mod error;
pub mod sample;
pub mod server;
pub mod state;
pub mod step;
pub mod time_source;
