//! ---
//! flk_section: "02-messaging-ipc-data-model"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Packet records and protocol lookup tables."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Decoded packet records exchanged between the ground station and vehicles.
//!
//! Packets reach this crate already decoded from the wire; the only encoding
//! performed here is turning a command line into a request payload.

pub mod errors;
pub mod packets;

pub use errors::{map_error_code, ErrorClass};
pub use packets::{
    Address, AlgorithmDataPacket, AlgorithmPayload, CameraFeatureData, CommandRequestPacket,
    CommandResponseChunk, GeigerCounterData, GpsCoordinate, MissionInfoPacket, Packet,
    PacketKind, PrearmStatusPacket, Source, StatusPacket, VelocityNed,
};
