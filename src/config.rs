//! Configuration: built-in defaults, an optional TOML file, and CLI
//! overrides layered on top, per spec §6.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::aggregation::Function;
use crate::error::{ComputeError, Result};
use crate::step::StepTable;

const DEFAULT_ENDPOINT: &str = "ipc://@/malamute";
const DEFAULT_STATE_DIR: &str = "/var/lib/fty/fty-metric-compute";
const DEFAULT_IDENTITY: &str = "fty-metric-compute";
const DEFAULT_POLLING_INTERVAL_S: u64 = 30;

const BUILTIN_FUNCTIONS: &[&str] = &["min", "max", "arithmetic_mean", "consumption"];
const BUILTIN_STEPS: &[&str] = &["15m", "30m", "1h", "8h", "24h", "7d", "30d"];

/// Command-line surface (spec §6).
#[derive(Debug, Parser)]
#[command(name = "metric-compute", about = "Streaming tumbling-window metric aggregator")]
pub struct Cli {
    /// Bus endpoint to connect to.
    #[arg(short = 'e', long)]
    pub endpoint: Option<String>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Optional TOML config file overriding the built-in defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory the engine checkpoints its aggregation state into.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

/// The on-disk TOML shape, every field optional so a partial file only
/// overrides what it names.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    endpoint: Option<String>,
    identity: Option<String>,
    state_dir: Option<PathBuf>,
    polling_interval_s: Option<u64>,
    functions: Option<Vec<String>>,
    steps: Option<Vec<String>>,
}

/// Fully resolved configuration, after merging built-in defaults, an
/// optional config file, and CLI overrides (in that precedence order).
#[derive(Debug, Clone)]
pub struct Config {
    /// Bus endpoint, e.g. `ipc://@/malamute`.
    pub endpoint: String,
    /// Identity to connect to the bus with.
    pub identity: String,
    /// Directory the state file (`state.zpl`) lives under.
    pub state_dir: PathBuf,
    /// How often the shared-memory puller task scans for new samples.
    pub polling_interval_s: u64,
    /// Aggregation functions to run.
    pub functions: Vec<Function>,
    /// Configured tumbling-window steps.
    pub steps: StepTable,
}

impl Config {
    /// Path of the state file itself, under `state_dir`.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.zpl")
    }

    /// Resolve a `Config` from CLI args, an optional config file, and the
    /// built-in defaults described in spec §6.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };

        let endpoint = cli
            .endpoint
            .clone()
            .or(file.endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());
        let identity = file.identity.unwrap_or_else(|| DEFAULT_IDENTITY.to_owned());
        let state_dir = cli
            .state_dir
            .clone()
            .or(file.state_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let polling_interval_s = file.polling_interval_s.unwrap_or(DEFAULT_POLLING_INTERVAL_S);

        let function_names = file.functions.unwrap_or_else(|| {
            BUILTIN_FUNCTIONS.iter().map(|s| s.to_string()).collect()
        });
        let mut functions = Vec::with_capacity(function_names.len());
        for name in &function_names {
            match Function::parse(name) {
                Some(f) => functions.push(f),
                None => return Err(ComputeError::Config(format!("unknown function {name:?}"))),
            }
        }

        let step_labels = file
            .steps
            .unwrap_or_else(|| BUILTIN_STEPS.iter().map(|s| s.to_string()).collect());
        let mut steps = StepTable::new();
        for label in &step_labels {
            if !steps.put(label) {
                log::info!("ignoring unparseable step label {label:?}");
            }
        }

        Ok(Config {
            endpoint,
            identity,
            state_dir,
            polling_interval_s,
            functions,
            steps,
        })
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ComputeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|err| ComputeError::Config(format!("{}: {err}", path.display())))
}
