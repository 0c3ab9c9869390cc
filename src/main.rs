use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use metric_compute::config::{Cli, Config};
use metric_compute::engine::Engine;
use metric_compute::server::bus::LocalBus;
use metric_compute::server::shm::LocalShm;
use metric_compute::server::{run_shm_puller, Command, ServerLoop};
use metric_compute::time_source::TimeSource;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match Config::resolve(&cli) {
        Ok(config) => config,
        Err(err) => {
            log::error!("fatal: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = std::fs::create_dir_all(&config.state_dir) {
        log::error!("fatal: failed to create state dir {}: {err}", config.state_dir.display());
        return ExitCode::FAILURE;
    }

    let engine = Arc::new(Mutex::new(Engine::new(
        config.steps.clone(),
        config.functions.clone(),
        TimeSource::SystemTime,
        config.state_path(),
    )));

    // LocalBus has no wire protocol of its own: `_inbound_feed`/`_outbound_watch`
    // are the hooks an external producer or observer would hold. Kept alive here
    // so the channels stay open for the lifetime of the process.
    let (bus, _inbound_feed, _outbound_watch) = LocalBus::new_pair();
    let shm = Arc::new(LocalShm::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    let (puller_shutdown_tx, puller_shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    let (puller_emitted_tx, puller_emitted_rx) = tokio::sync::mpsc::unbounded_channel();

    let puller = tokio::spawn(run_shm_puller(
        engine.clone(),
        shm.clone(),
        config.polling_interval_s,
        puller_emitted_tx,
        puller_shutdown_rx,
    ));

    let mut server = ServerLoop::new(engine, bus, shm, shutdown_rx, puller_emitted_rx);
    if let Err(err) = server.start(&config.endpoint, &config.identity).await {
        log::error!("fatal: failed to start bus client: {err}");
        return ExitCode::FAILURE;
    }

    log::info!("metric-compute running against {} (state dir {})", config.endpoint, config.state_dir.display());

    let mut server_task = tokio::spawn(async move {
        server.run().await;
    });

    tokio::select! {
        result = &mut server_task => {
            if let Err(err) = result {
                log::error!("server loop task panicked: {err}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, shutting down");
            shutdown_tx.send(Command::Shutdown).ok();
            server_task.await.ok();
        }
    }

    puller_shutdown_tx.send(Command::Shutdown).ok();
    puller.abort();

    ExitCode::SUCCESS
}
