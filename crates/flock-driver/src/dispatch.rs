//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Static routing of inbound packets to their handlers.

use std::collections::HashMap;

use flock_msg::{Packet, PacketKind, Source};

use crate::driver::FleetDriver;
use crate::error::Result;
use crate::{sensors, telemetry};

/// Synchronous packet handler.
pub type PacketHandler = fn(&FleetDriver, &Packet, &Source) -> Result<()>;

#[derive(Clone, Copy)]
pub enum Route {
    Handler(PacketHandler),
    /// Accepted and deliberately ignored.
    Ignore,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Handler(_) => f.write_str("Handler"),
            Route::Ignore => f.write_str("Ignore"),
        }
    }
}

/// What happened to an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Ignored,
    /// No route for this kind; the packet was dropped.
    Unhandled,
    /// The handler failed; the error was logged and the packet dropped.
    Rejected,
}

/// Routes by [`PacketKind`]. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct PacketDispatchTable {
    routes: HashMap<PacketKind, Route>,
}

impl PacketDispatchTable {
    pub fn new() -> Self {
        let mut routes = HashMap::new();
        routes.insert(PacketKind::Status, Route::Handler(telemetry::route_status as PacketHandler));
        routes.insert(PacketKind::PrearmStatus, Route::Ignore);
        routes.insert(
            PacketKind::CommandResponse,
            Route::Handler(FleetDriver::route_command_response as PacketHandler),
        );
        routes.insert(
            PacketKind::CompressedCommandResponse,
            Route::Handler(FleetDriver::route_command_response as PacketHandler),
        );
        routes.insert(
            PacketKind::AlgorithmData,
            Route::Handler(sensors::route_algorithm_data as PacketHandler),
        );
        routes.insert(PacketKind::MissionInfo, Route::Ignore);
        Self { routes }
    }

    pub fn route(&self, kind: PacketKind) -> Option<Route> {
        self.routes.get(&kind).copied()
    }

    pub fn handles(&self, kind: PacketKind) -> bool {
        self.routes.contains_key(&kind)
    }
}

impl Default for PacketDispatchTable {
    fn default() -> Self {
        Self::new()
    }
}
