//! Component C: the server loop and its shared-memory puller sub-task.
//!
//! Two cooperative tasks share one `Engine` behind a `tokio::sync::Mutex`
//! (spec §5): the main loop, driven by bus messages and a scheduling timer,
//! and the puller, driven by its own timer. Both funnel samples through
//! `Engine::handle_sample` under the same lock. Every metric either one
//! emits is published the same way: to the bus and to the shared-memory
//! store (spec §6). The puller itself holds no bus handle — sharing one
//! `BusClient`'s blocking `recv` across two tasks behind the same lock as
//! `send` would deadlock the sender — so it forwards its emitted metrics to
//! the server loop over an mpsc channel, and the server loop publishes them
//! from its own task alongside whatever it emits itself.

pub mod bus;
pub mod shm;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::aggregation::EmittedMetric;
use crate::engine::Engine;
use crate::server::bus::{AssetEvent, BusClient, BusMessage, OutboundMetric};
use crate::server::shm::{record_to_sample, SharedMemoryStore, TypePattern, ASSET_PATTERN};

/// A command sent to the running server loop from its owning task.
#[derive(Debug)]
pub enum Command {
    /// Shut the loop down cleanly: final checkpoint, then return.
    Shutdown,
}

/// Drives the main loop: ingest, schedule, publish, checkpoint.
pub struct ServerLoop<B: BusClient, S: SharedMemoryStore> {
    engine: Arc<Mutex<Engine>>,
    bus: B,
    shm: Arc<S>,
    commands: UnboundedReceiver<Command>,
    puller_emitted: UnboundedReceiver<Vec<EmittedMetric>>,
    last_poll_ms: u64,
}

impl<B: BusClient, S: SharedMemoryStore> ServerLoop<B, S> {
    /// Build a server loop over an already-shared `Engine`, a connected
    /// `BusClient`, and the shared-memory store metrics are also published
    /// into. `puller_emitted` receives batches of metrics the shared-memory
    /// puller task folded into the engine but has no bus handle to publish
    /// itself.
    pub fn new(
        engine: Arc<Mutex<Engine>>,
        bus: B,
        shm: Arc<S>,
        commands: UnboundedReceiver<Command>,
        puller_emitted: UnboundedReceiver<Vec<EmittedMetric>>,
    ) -> Self {
        ServerLoop { engine, bus, shm, commands, puller_emitted, last_poll_ms: 0 }
    }

    /// Connect and subscribe the bus client under `identity`.
    pub async fn start(&mut self, endpoint: &str, identity: &str) -> crate::error::Result<()> {
        self.bus.connect(endpoint, identity).await?;
        self.bus.subscribe(".*").await?;
        Ok(())
    }

    /// Run until a `Command::Shutdown` arrives or the bus stream closes.
    /// Mirrors spec §4.3's scheduling: wait for the next step boundary (or
    /// indefinitely if no steps are configured), tick on timeout or on
    /// poll starvation, otherwise handle whatever arrived first.
    pub async fn run(&mut self) {
        loop {
            let gcd = self.engine.lock().await.gcd();
            let wait = next_wait(gcd, self.engine.lock().await.now_s());

            tokio::select! {
                _ = sleep_or_forever(wait) => {
                    self.tick().await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                message = self.bus.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            log::warn!("bus stream closed, shutting down");
                            self.shutdown().await;
                            return;
                        }
                    }
                    if self.poll_starved(gcd) {
                        self.tick().await;
                    }
                }
                batch = self.puller_emitted.recv() => {
                    if let Some(metrics) = batch {
                        for metric in metrics {
                            self.publish(metric).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: BusMessage) {
        match message {
            BusMessage::Metric(sample) => {
                let emitted = self.engine.lock().await.handle_sample(&sample);
                for metric in emitted {
                    self.publish(metric).await;
                }
            }
            BusMessage::AssetEvent(event) => self.handle_asset_event(&event).await,
        }
    }

    async fn handle_asset_event(&mut self, event: &AssetEvent) {
        if event.should_purge() {
            let removed = self.engine.lock().await.delete_asset(&event.asset);
            log::info!("asset {} {}: removed {removed} accumulators", event.asset, event.operation);
        }
    }

    async fn tick(&mut self) {
        let emitted = self.engine.lock().await.poll();
        for metric in emitted {
            self.publish(metric).await;
        }
        self.engine.lock().await.checkpoint();
        self.last_poll_ms = now_ms();
    }

    fn poll_starved(&self, gcd: u32) -> bool {
        gcd != 0 && now_ms().saturating_sub(self.last_poll_ms) > gcd as u64 * 1000
    }

    /// Publish one emitted metric to both the bus and the shared-memory
    /// store (spec §6: `write_metric(asset, quantity, value_string, unit,
    /// ttl_s)` for every emitted metric).
    async fn publish(&mut self, metric: EmittedMetric) {
        if !metric.should_publish {
            return;
        }
        let outbound = OutboundMetric {
            subject: metric.key.clone(),
            value: metric.value.clone(),
            unit: metric.unit.clone(),
            ttl_s: metric.ttl_s,
            aux: vec![
                ("x-cm-count".to_owned(), metric.count.to_string()),
                ("x-cm-sum".to_owned(), format!("{:.6}", metric.sum)),
                ("x-cm-type".to_owned(), metric.function.to_string()),
                ("x-cm-step".to_owned(), metric.step_s.to_string()),
                ("x-cm-last-ts".to_owned(), metric.last_sample_ts_s.to_string()),
            ],
        };
        if let Err(err) = self.bus.send(outbound).await {
            log::error!("failed to publish {} to bus: {err}", metric.key);
        }
        if let Err(err) = self
            .shm
            .write_metric(&metric.asset, &metric.quantity_out, &metric.value, &metric.unit, metric.ttl_s)
            .await
        {
            log::error!("failed to publish {} to shared memory: {err}", metric.key);
        }
    }

    async fn shutdown(&mut self) {
        self.engine.lock().await.checkpoint();
        log::info!("server loop shut down, final checkpoint written");
    }
}

/// Cooperative task that wakes every `polling_interval_s` and folds every
/// shared-memory record matching the engine's pull pattern into the shared
/// `Engine`, under the same lock the main loop uses. Any metrics that
/// folding closes out are forwarded to the server loop over `emitted_tx`
/// for publishing — the puller invokes the same `Engine::handle_sample`
/// routine a bus metric does (spec §4.3) and its results get the same
/// publish treatment.
pub async fn run_shm_puller<S: SharedMemoryStore>(
    engine: Arc<Mutex<Engine>>,
    store: Arc<S>,
    polling_interval_s: u64,
    emitted_tx: UnboundedSender<Vec<EmittedMetric>>,
    mut shutdown: UnboundedReceiver<Command>,
) {
    let pattern = TypePattern::standard();
    let mut interval = tokio::time::interval(Duration::from_secs(polling_interval_s.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let records = store.read_metrics(ASSET_PATTERN, &pattern).await;
                let mut emitted = Vec::new();
                {
                    let mut engine = engine.lock().await;
                    for record in &records {
                        match record_to_sample(record) {
                            Some(sample) => emitted.extend(engine.handle_sample(&sample)),
                            None => log::warn!("dropping unparseable shared-memory record for {}", record.asset),
                        }
                    }
                }
                if !emitted.is_empty() && emitted_tx.send(emitted).is_err() {
                    log::warn!("server loop gone, dropping shared-memory-sourced metrics");
                }
            }
            _ = shutdown.recv() => {
                log::info!("shared-memory puller stopped");
                return;
            }
        }
    }
}

fn next_wait(gcd: u32, now_s: u64) -> Option<Duration> {
    if gcd == 0 {
        return None;
    }
    let gcd = gcd as u64;
    let remainder = now_s % gcd;
    let wait_s = if remainder == 0 { gcd } else { gcd - remainder };
    Some(Duration::from_secs(wait_s))
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}
