//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use flock_msg::{map_error_code, ErrorClass, Packet, Source, StatusPacket};
use serde::Serialize;
use tracing::{debug, trace};

use crate::driver::FleetDriver;
use crate::error::{DriverError, Result};
use crate::vehicle::StatusUpdate;

/// Published whenever a vehicle's status changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusNotice {
    pub vehicle_id: String,
    pub error: ErrorClass,
    pub at: DateTime<Utc>,
}

pub(crate) fn route_status(driver: &FleetDriver, packet: &Packet, source: &Source) -> Result<()> {
    match packet {
        Packet::Status(status) => handle_status_packet(driver, status, source),
        _ => Ok(()),
    }
}

/// Record the sender address and apply the reported status.
///
/// An address conflict aborts before the status is touched.
pub fn handle_status_packet(
    driver: &FleetDriver,
    packet: &StatusPacket,
    source: &Source,
) -> Result<()> {
    let vehicle = driver.get_or_create_vehicle(packet.id);

    if let Err(err) = driver
        .addresses()
        .record_or_verify(vehicle.id(), &source.medium, &source.address)
    {
        match &err {
            DriverError::AddressConflict { .. } => driver.observe(|m| m.observe_address_conflict()),
            DriverError::AddressInUse { .. } => driver.observe(|m| m.observe_address_in_use()),
            _ => {}
        }
        return Err(err);
    }

    let error = map_error_code(packet.error);
    vehicle.update_status(StatusUpdate {
        position: packet.location,
        velocity: packet.velocity,
        heading: packet.heading,
        algorithm: packet.algorithm_name.clone(),
        error,
    });
    trace!(vehicle_id = vehicle.id(), error = ?error, "status applied");

    let notice = StatusNotice {
        vehicle_id: vehicle.id().to_owned(),
        error,
        at: Utc::now(),
    };
    if driver.publish_status(notice).is_none() {
        debug!(vehicle_id = vehicle.id(), "no status subscribers");
    }
    Ok(())
}
