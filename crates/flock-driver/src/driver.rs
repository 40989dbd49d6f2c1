//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! The fleet driver: inbound packet handling and outbound commands.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use flock_common::{make_valid_vehicle_id, AppConfig, DriverConfig};
use flock_msg::{CommandResponseChunk, GpsCoordinate, Packet, Source};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::address::AddressRegistry;
use crate::commands::{CommandFutureMap, CommandOutcome};
use crate::device_tree::DeviceTree;
use crate::dispatch::{DispatchOutcome, PacketDispatchTable, Route};
use crate::error::{DriverError, Result};
use crate::metrics::DriverMetrics;
use crate::reassembly::{AssembledBody, ChunkAssembler};
use crate::sensors::AlgorithmRegistry;
use crate::telemetry::StatusNotice;
use crate::transport::PacketSink;
use crate::vehicle::{Vehicle, VehicleRegistry};

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Services the driver talks to but does not own.
#[derive(Clone)]
pub struct DriverCollaborators {
    pub vehicles: Arc<dyn VehicleRegistry>,
    pub device_tree: Arc<dyn DeviceTree>,
    pub sink: Arc<dyn PacketSink>,
}

/// Driver for a fleet of vehicles sharing one packet protocol.
///
/// All state sits behind short-lived locks; the driver is shared as
/// `Arc<FleetDriver>` between the inbound loop and command callers.
pub struct FleetDriver {
    config: DriverConfig,
    vehicles: Arc<dyn VehicleRegistry>,
    device_tree: Arc<dyn DeviceTree>,
    sink: Arc<dyn PacketSink>,
    addresses: AddressRegistry,
    commands: CommandFutureMap,
    assembler: Mutex<ChunkAssembler>,
    algorithms: AlgorithmRegistry,
    dispatch_table: PacketDispatchTable,
    id_cache: Mutex<HashMap<u32, String>>,
    status_tx: broadcast::Sender<StatusNotice>,
    metrics: Option<DriverMetrics>,
}

impl FleetDriver {
    pub fn new(config: &AppConfig, collaborators: DriverCollaborators) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            addresses: AddressRegistry::new(config.driver.preferred_media.clone()),
            assembler: Mutex::new(ChunkAssembler::from_config(&config.reassembly)),
            config: config.driver.clone(),
            vehicles: collaborators.vehicles,
            device_tree: collaborators.device_tree,
            sink: collaborators.sink,
            commands: CommandFutureMap::new(),
            algorithms: AlgorithmRegistry::with_defaults(),
            dispatch_table: PacketDispatchTable::new(),
            id_cache: Mutex::new(HashMap::new()),
            status_tx,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DriverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_algorithms(mut self, algorithms: AlgorithmRegistry) -> Self {
        self.algorithms = algorithms;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn addresses(&self) -> &AddressRegistry {
        &self.addresses
    }

    pub fn commands(&self) -> &CommandFutureMap {
        &self.commands
    }

    pub fn algorithms(&self) -> &AlgorithmRegistry {
        &self.algorithms
    }

    pub fn device_tree(&self) -> &dyn DeviceTree {
        self.device_tree.as_ref()
    }

    /// Receiver for status change notices.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusNotice> {
        self.status_tx.subscribe()
    }

    pub(crate) fn publish_status(&self, notice: StatusNotice) -> Option<usize> {
        self.status_tx.send(notice).ok()
    }

    pub(crate) fn observe(&self, f: impl FnOnce(&DriverMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    /// Display id of the vehicle with the given fleet index.
    ///
    /// Computed once per index and cached for the driver's lifetime.
    pub fn vehicle_id_for(&self, index: u32) -> String {
        let mut cache = self.id_cache.lock();
        self.cached_id(&mut cache, index)
    }

    fn cached_id(&self, cache: &mut HashMap<u32, String>, index: u32) -> String {
        if let Some(id) = cache.get(&index) {
            return id.clone();
        }
        let id = make_valid_vehicle_id(&self.config.id_format.format(index));
        cache.insert(index, id.clone());
        self.observe(|m| m.set_vehicle_count(cache.len()));
        id
    }

    /// Vehicle with the given fleet index, registered on first sight.
    pub fn get_or_create_vehicle(&self, index: u32) -> Arc<Vehicle> {
        let mut cache = self.id_cache.lock();
        let id = self.cached_id(&mut cache, index);
        if let Some(vehicle) = self.vehicles.find(&id) {
            return vehicle;
        }
        let vehicle = self.vehicles.create(&id);
        for (path, unit) in vehicle.channels().declarations() {
            self.device_tree.declare_channel(path, unit);
        }
        info!(vehicle_id = %id, index, "vehicle registered");
        vehicle
    }

    /// Route one inbound packet. Handler errors are returned.
    pub fn dispatch(&self, packet: &Packet, source: &Source) -> Result<DispatchOutcome> {
        let kind = packet.kind();
        self.observe(|m| m.observe_packet(kind.as_ref()));
        match self.dispatch_table.route(kind) {
            Some(Route::Handler(handler)) => {
                handler(self, packet, source)?;
                Ok(DispatchOutcome::Handled)
            }
            Some(Route::Ignore) => Ok(DispatchOutcome::Ignored),
            None => {
                warn!(kind = %kind, source = %source, "no packet handler defined for packet kind");
                self.observe(|m| m.observe_drop("unhandled_kind"));
                Ok(DispatchOutcome::Unhandled)
            }
        }
    }

    /// Entry point for the link layer. Errors are logged, never raised.
    pub fn handle_inbound_packet(&self, packet: &Packet, source: &Source) -> DispatchOutcome {
        match self.dispatch(packet, source) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(kind = %packet.kind(), source = %source, error = %err, "inbound packet rejected");
                self.observe(|m| m.observe_drop("handler_error"));
                DispatchOutcome::Rejected
            }
        }
    }

    pub(crate) fn route_command_response(&self, packet: &Packet, source: &Source) -> Result<()> {
        match packet {
            Packet::CommandResponse(chunk) => self.handle_command_response(chunk, source, false),
            Packet::CompressedCommandResponse(chunk) => {
                self.handle_command_response(chunk, source, true)
            }
            _ => Ok(()),
        }
    }

    /// Feed a response chunk to the reassembler; completes the pending
    /// command once the whole body has arrived.
    pub fn handle_command_response(
        &self,
        chunk: &CommandResponseChunk,
        source: &Source,
        compressed: bool,
    ) -> Result<()> {
        let assembled = self.assembler.lock().add_chunk(chunk, source, compressed)?;
        if let Some(body) = assembled {
            self.on_response_assembled(body);
        }
        Ok(())
    }

    /// Resolve the pending command of whichever vehicle owns the source.
    pub fn on_response_assembled(&self, body: AssembledBody) -> bool {
        let Some(vehicle_id) = self.addresses.resolve_by_source(&body.source) else {
            warn!(source = %body.source, "reassembled response from a source with no vehicle");
            self.observe(|m| m.observe_drop("unknown_source"));
            return false;
        };
        let fulfilled = self.commands.fulfill(&vehicle_id, body.decode_text());
        if !fulfilled {
            self.observe(|m| m.observe_stale_response());
        }
        fulfilled
    }

    /// Send a command line and wait for the response text.
    ///
    /// Resolves to [`crate::EXECUTION_CANCELLED`] when a newer command
    /// preempts this one.
    #[instrument(skip_all, fields(vehicle_id = %vehicle_id))]
    pub async fn send_command(&self, vehicle_id: &str, command: &str) -> Result<String> {
        if !self.vehicles.exists(vehicle_id) {
            return Err(DriverError::UnknownVehicle(vehicle_id.to_owned()));
        }
        let destination = self.addresses.preferred_address(vehicle_id)?;

        let slot = match self.commands.begin(vehicle_id, self.config.strict_commands()) {
            Ok(slot) => slot,
            Err(err) => {
                self.observe(|m| m.observe_command("rejected"));
                return Err(err);
            }
        };

        if let Err(err) = self
            .sink
            .send(Packet::command_request(command), &destination)
            .await
        {
            warn!(sink = self.sink.name(), error = %err, "command could not be sent");
            self.observe(|m| m.observe_command("send_failed"));
            return Err(err);
        }
        debug!(command, destination = %destination, "command sent");

        let outcome = slot.wait().await;
        match &outcome {
            CommandOutcome::Completed(_) => self.observe(|m| m.observe_command("completed")),
            CommandOutcome::Cancelled => self.observe(|m| m.observe_command("cancelled")),
        }
        Ok(outcome.into_text())
    }

    /// [`Self::send_command`] bounded by the configured command timeout.
    pub async fn execute_command(&self, vehicle_id: &str, command: &str) -> Result<String> {
        let timeout = self.config.command_timeout;
        match tokio::time::timeout(timeout, self.send_command(vehicle_id, command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(vehicle_id, command, ?timeout, "command timed out");
                self.observe(|m| m.observe_command("timeout"));
                Err(DriverError::CommandTimeout {
                    vehicle: vehicle_id.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Check a generic command before it is sent.
    pub fn validate_command(
        &self,
        command: &str,
        args: &[String],
        kwargs: &BTreeMap<String, String>,
    ) -> Result<()> {
        if command.trim().is_empty() {
            return Err(DriverError::InvalidCommand("Empty command".into()));
        }
        if !kwargs.is_empty() {
            return Err(DriverError::InvalidCommand(
                "Keyword arguments not supported".into(),
            ));
        }
        if args.iter().any(|arg| arg.chars().any(char::is_whitespace)) {
            return Err(DriverError::InvalidCommand(
                "Arguments must not contain whitespace".into(),
            ));
        }
        Ok(())
    }

    /// Send `command` followed by its arguments, space separated.
    pub async fn handle_generic_command(
        &self,
        vehicle_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<String> {
        let line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.execute_command(vehicle_id, &line).await
    }

    pub async fn takeoff(&self, vehicle_id: &str) -> Result<String> {
        self.execute_command(vehicle_id, "motoron").await
    }

    pub async fn land(&self, vehicle_id: &str) -> Result<String> {
        self.execute_command(vehicle_id, "land").await
    }

    pub async fn return_to_home(&self, vehicle_id: &str) -> Result<String> {
        self.execute_command(vehicle_id, "rth").await
    }

    pub async fn shutdown(&self, vehicle_id: &str) -> Result<String> {
        self.execute_command(vehicle_id, "halt").await
    }

    pub async fn fly_to(&self, vehicle_id: &str, target: &GpsCoordinate) -> Result<String> {
        self.execute_command(vehicle_id, &fly_to_command(target)).await
    }

    /// Drop everything the driver knows about a vehicle's link state.
    pub fn forget_vehicle(&self, vehicle_id: &str) {
        self.commands.cancel(vehicle_id);
        let removed = self.addresses.forget(vehicle_id);
        info!(vehicle_id, removed, "vehicle link state forgotten");
    }
}

/// Command line for flying to `target`, with the altitude above ground
/// appended when known.
pub fn fly_to_command(target: &GpsCoordinate) -> String {
    let mut command = format!("go N{:.7} E{:.7}", target.lat, target.lon);
    if let Some(agl) = target.agl {
        command.push_str(&format!(" {agl}"));
    }
    command
}

impl std::fmt::Debug for FleetDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetDriver")
            .field("config", &self.config)
            .field("pending_commands", &self.commands.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fly_to_formats_seven_decimals() {
        let target = GpsCoordinate::new(47.4733, 19.06);
        assert_eq!(fly_to_command(&target), "go N47.4733000 E19.0600000");
        assert_eq!(
            fly_to_command(&target.with_agl(25.5)),
            "go N47.4733000 E19.0600000 25.5"
        );
    }
}
