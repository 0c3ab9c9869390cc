//! The telemetry bus client: an abstraction over whatever pub/sub transport
//! carries samples and asset lifecycle events in a real deployment, plus a
//! process-local reference implementation for standalone operation and tests.
//!
//! Wire framing is explicitly out of scope (see spec §6); only the shapes
//! the engine needs to move across the boundary are modeled here.

use async_trait::async_trait;

use crate::error::Result;
use crate::sample::RawSample;

/// An inbound message on the asset stream: either a measurement or a
/// lifecycle event for an asset.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// A single scalar sample.
    Metric(RawSample),
    /// An asset lifecycle transition.
    AssetEvent(AssetEvent),
}

/// One of the operations or status changes that can retire an asset's
/// accumulators (spec §4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEvent {
    /// The asset this event concerns.
    pub asset: String,
    /// `"delete"`, `"retire"`, `"create"`, `"update"`, ...
    pub operation: String,
    /// `"active"`, `"nonactive"`, ... absent for pure delete operations.
    pub status: Option<String>,
}

impl AssetEvent {
    /// Whether this event should purge the asset's accumulators (§4.3: `op
    /// in {delete, retire}` or `status != active`).
    pub fn should_purge(&self) -> bool {
        matches!(self.operation.as_str(), "delete" | "retire")
            || self.status.as_deref().is_some_and(|s| s != "active")
    }
}

/// An outbound aggregated metric, ready to publish on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMetric {
    /// `"<published_type>@<asset>"`.
    pub subject: String,
    /// Formatted numeric value.
    pub value: String,
    /// Unit, or `"Ws"` for consumption.
    pub unit: String,
    /// `2 * step_s`.
    pub ttl_s: u32,
    /// `x-cm-count`, `x-cm-sum`, `x-cm-type`, `x-cm-step`, `x-cm-last-ts`.
    pub aux: Vec<(String, String)>,
}

/// The bus-facing side of the engine (spec §6). Implementors own the
/// transport connection; the engine only ever sees this trait.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Establish a connection under `identity`, e.g. `"fty-metric-compute"`.
    async fn connect(&mut self, endpoint: &str, identity: &str) -> Result<()>;

    /// Subscribe (consume) the asset stream with `pattern` (always `.*`
    /// in practice).
    async fn subscribe(&mut self, pattern: &str) -> Result<()>;

    /// Wait for and return the next inbound message. `None` means the
    /// stream has closed.
    async fn recv(&mut self) -> Option<BusMessage>;

    /// Publish an aggregated metric. Failure is logged by the caller and
    /// does not roll back the accumulator state (spec §7).
    async fn send(&mut self, message: OutboundMetric) -> Result<()>;
}

/// A process-local, channel-backed `BusClient` for standalone operation and
/// tests. Implements no wire protocol; messages never leave the process.
pub struct LocalBus {
    identity: String,
    inbound: tokio::sync::mpsc::UnboundedReceiver<BusMessage>,
    outbound: tokio::sync::mpsc::UnboundedSender<OutboundMetric>,
}

impl LocalBus {
    /// Build a `LocalBus` paired with handles the test harness or a local
    /// producer can use to feed it messages and observe its publications.
    pub fn new_pair() -> (
        Self,
        tokio::sync::mpsc::UnboundedSender<BusMessage>,
        tokio::sync::mpsc::UnboundedReceiver<OutboundMetric>,
    ) {
        let (in_tx, in_rx) = tokio::sync::mpsc::unbounded_channel();
        let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            LocalBus {
                identity: String::new(),
                inbound: in_rx,
                outbound: out_tx,
            },
            in_tx,
            out_rx,
        )
    }
}

#[async_trait]
impl BusClient for LocalBus {
    async fn connect(&mut self, endpoint: &str, identity: &str) -> Result<()> {
        log::info!("local bus \"connected\" to {endpoint} as {identity}");
        self.identity = identity.to_owned();
        Ok(())
    }

    async fn subscribe(&mut self, pattern: &str) -> Result<()> {
        log::debug!("local bus subscribed with pattern {pattern}");
        Ok(())
    }

    async fn recv(&mut self) -> Option<BusMessage> {
        self.inbound.recv().await
    }

    async fn send(&mut self, message: OutboundMetric) -> Result<()> {
        if self.outbound.send(message).is_err() {
            log::warn!("local bus: no receiver listening, metric dropped");
        }
        Ok(())
    }
}
