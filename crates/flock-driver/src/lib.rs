//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Protocol driver for a fleet of unmanned vehicles.
//!
//! Inbound packets enter through [`FleetDriver::handle_inbound_packet`];
//! commands leave through [`FleetDriver::send_command`] and resolve when the
//! (possibly chunked and compressed) response arrives from the same address.

pub mod address;
pub mod commands;
pub mod device_tree;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod reassembly;
pub mod sensors;
pub mod telemetry;
pub mod transport;
pub mod vehicle;

pub use address::{AddressRegistry, AddressUpdate};
pub use commands::{CommandFutureMap, CommandOutcome, CommandSlot, EXECUTION_CANCELLED};
pub use device_tree::{
    ChannelPath, ChannelUpdate, DeviceTree, DeviceTreeError, DeviceTreeMutator,
    InMemoryDeviceTree, Measurement,
};
pub use dispatch::{DispatchOutcome, PacketDispatchTable};
pub use driver::{fly_to_command, DriverCollaborators, FleetDriver};
pub use error::{DriverError, Result};
pub use metrics::DriverMetrics;
pub use reassembly::{AssembledBody, ChunkAssembler, ReassemblyError};
pub use sensors::{counter_rates, Algorithm, AlgorithmRegistry};
pub use telemetry::StatusNotice;
pub use transport::{InMemoryPacketSink, PacketSink, SentPacket};
pub use vehicle::{
    GeigerSample, InMemoryVehicleRegistry, SensorChannels, Vehicle, VehicleRegistry,
    VehicleStatus,
};
