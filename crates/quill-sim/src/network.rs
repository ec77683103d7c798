use serde::{Deserialize, Serialize};
use tracing::trace;

use quill_core::event::EventBatch;
use quill_core::store::EventStore;
use quill_core::upload::{Transport, TransportError};

use crate::rng::SimRng;

/// Fault injection rates for simulated uploads, all in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Request never reaches the server.
    pub drop_rate_percent: u8,
    /// Server answers 503 without storing anything.
    pub server_error_rate_percent: u8,
    /// Server stores the batch but the response is lost.
    pub lost_ack_rate_percent: u8,
    /// Server receives the same request twice.
    pub duplicate_rate_percent: u8,
    /// Per-step chance that the client goes offline.
    pub offline_rate_percent: u8,
    /// Steps an offline window lasts.
    pub offline_duration_steps: u16,
    /// Unload beacons that never arrive.
    pub beacon_drop_rate_percent: u8,
}

impl FaultConfig {
    /// No faults at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            drop_rate_percent: 0,
            server_error_rate_percent: 0,
            lost_ack_rate_percent: 0,
            duplicate_rate_percent: 0,
            offline_rate_percent: 0,
            offline_duration_steps: 0,
            beacon_drop_rate_percent: 0,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            drop_rate_percent: 10,
            server_error_rate_percent: 5,
            lost_ack_rate_percent: 5,
            duplicate_rate_percent: 5,
            offline_rate_percent: 2,
            offline_duration_steps: 25,
            beacon_drop_rate_percent: 30,
        }
    }
}

/// What happened to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// Stored twice; the second copy must be absorbed as a duplicate.
    Duplicated,
    Dropped,
    ServerError,
    /// Stored, but the client saw a network error.
    LostAck,
    BeaconDelivered,
    BeaconDropped,
}

impl DeliveryOutcome {
    /// Whether the server ingested the request at least once.
    #[must_use]
    pub const fn reached_server(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Duplicated | Self::LostAck | Self::BeaconDelivered
        )
    }
}

/// One request as seen by the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub first_seq: u64,
    pub last_seq: u64,
    pub outcome: DeliveryOutcome,
}

/// Running totals per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub requests: u64,
    pub delivered: u64,
    pub duplicated: u64,
    pub dropped: u64,
    pub server_errors: u64,
    pub lost_acks: u64,
    pub beacons_delivered: u64,
    pub beacons_dropped: u64,
}

impl DeliveryStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        self.requests += 1;
        let counter = match outcome {
            DeliveryOutcome::Delivered => &mut self.delivered,
            DeliveryOutcome::Duplicated => &mut self.duplicated,
            DeliveryOutcome::Dropped => &mut self.dropped,
            DeliveryOutcome::ServerError => &mut self.server_errors,
            DeliveryOutcome::LostAck => &mut self.lost_acks,
            DeliveryOutcome::BeaconDelivered => &mut self.beacons_delivered,
            DeliveryOutcome::BeaconDropped => &mut self.beacons_dropped,
        };
        *counter += 1;
    }
}

/// A [`Transport`] that ingests into a real store but injects faults
/// according to a [`FaultConfig`].
#[derive(Debug)]
pub struct FaultyTransport<'a> {
    store: &'a EventStore,
    fault: FaultConfig,
    rng: SimRng,
    stats: DeliveryStats,
    log: Vec<Delivery>,
}

impl<'a> FaultyTransport<'a> {
    #[must_use]
    pub fn new(store: &'a EventStore, fault: FaultConfig, rng: SimRng) -> Self {
        Self {
            store,
            fault,
            rng,
            stats: DeliveryStats::default(),
            log: Vec::new(),
        }
    }

    /// Stop injecting faults, e.g. for the final drain.
    pub const fn calm(&mut self) {
        self.fault = FaultConfig::none();
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    #[must_use]
    pub const fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// Deliveries since the last call.
    pub fn take_log(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.log)
    }

    fn note(&mut self, batch: &EventBatch, outcome: DeliveryOutcome) {
        let (first_seq, last_seq) = batch.sequence_range().unwrap_or((0, 0));
        trace!(first_seq, last_seq, ?outcome, "simulated request");
        self.stats.record(outcome);
        self.log.push(Delivery {
            first_seq,
            last_seq,
            outcome,
        });
    }
}

impl Transport for FaultyTransport<'_> {
    fn send_batch(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
        if self.rng.chance(self.fault.drop_rate_percent) {
            self.note(batch, DeliveryOutcome::Dropped);
            return Err(TransportError::Network("connection reset by peer".into()));
        }
        if self.rng.chance(self.fault.server_error_rate_percent) {
            self.note(batch, DeliveryOutcome::ServerError);
            return Err(TransportError::Server { status: 503 });
        }

        self.store.ingest(batch)?;

        if self.rng.chance(self.fault.duplicate_rate_percent) {
            self.store.ingest(batch)?;
            self.note(batch, DeliveryOutcome::Duplicated);
            return Ok(());
        }
        if self.rng.chance(self.fault.lost_ack_rate_percent) {
            self.note(batch, DeliveryOutcome::LostAck);
            return Err(TransportError::Network("response lost".into()));
        }
        self.note(batch, DeliveryOutcome::Delivered);
        Ok(())
    }

    fn send_beacon(&mut self, batch: &EventBatch) -> bool {
        if self.rng.chance(self.fault.beacon_drop_rate_percent) {
            self.note(batch, DeliveryOutcome::BeaconDropped);
            return false;
        }
        let stored = self.store.ingest(batch).is_ok();
        self.note(
            batch,
            if stored {
                DeliveryOutcome::BeaconDelivered
            } else {
                DeliveryOutcome::BeaconDropped
            },
        );
        stored
    }
}
