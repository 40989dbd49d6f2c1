//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use std::time::Duration;

use flock_msg::Address;

use crate::device_tree::DeviceTreeError;
use crate::reassembly::ReassemblyError;

/// Shared result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Hard failures surfaced to the caller of a driver operation.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The vehicle already has a different address on this medium.
    #[error("vehicle {vehicle} already has address {existing} on {medium}; refusing {incoming}")]
    AddressConflict {
        vehicle: String,
        medium: String,
        existing: Address,
        incoming: Address,
    },
    /// The source address is already bound to another vehicle.
    #[error("address {address} on {medium} belongs to vehicle {owner}; refusing claim by {claimant}")]
    AddressInUse {
        medium: String,
        address: Address,
        owner: String,
        claimant: String,
    },
    /// Strict mode refused a second command for a busy vehicle.
    #[error("a command is already in progress for vehicle {0}")]
    CommandAlreadyInProgress(String),
    /// No address has been recorded for the vehicle on any preferred medium.
    #[error("address of vehicle {0} is not known yet")]
    NoKnownAddress(String),
    #[error("no such vehicle: {0}")]
    UnknownVehicle(String),
    #[error("command for vehicle {vehicle} timed out after {timeout:?}")]
    CommandTimeout { vehicle: String, timeout: Duration },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error(transparent)]
    DeviceTree(#[from] DeviceTreeError),
}
