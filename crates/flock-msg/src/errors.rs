//! ---
//! flk_section: "02-messaging-ipc-data-model"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Packet records and protocol lookup tables."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Mapping of protocol-level error codes to abstract vehicle error classes.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Abstract error classification published for every vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Vehicle reports nominal operation.
    #[default]
    NoError,
    /// Battery is below the warning threshold.
    LowBattery,
    /// Battery is below the critical threshold.
    BatteryCritical,
    /// GNSS fix was lost.
    GpsSignalLost,
    /// Remote control link was lost.
    RcSignalLost,
    /// Vehicle left its permitted area.
    GeofenceViolation,
    /// Onboard sensor failure.
    SensorFailure,
    /// Motor or ESC failure.
    MotorFailure,
    /// Autopilot entered a failsafe mode.
    FailsafeActive,
    /// The vehicle reported a code this table does not know.
    Unknown,
}

/// Map a protocol error code to its abstract classification.
///
/// Codes outside the table map to [`ErrorClass::Unknown`].
pub fn map_error_code(code: u8) -> ErrorClass {
    match code {
        0 => ErrorClass::NoError,
        1 => ErrorClass::LowBattery,
        2 => ErrorClass::BatteryCritical,
        3 => ErrorClass::GpsSignalLost,
        4 => ErrorClass::RcSignalLost,
        5 => ErrorClass::GeofenceViolation,
        6 => ErrorClass::SensorFailure,
        7 => ErrorClass::MotorFailure,
        8 => ErrorClass::FailsafeActive,
        _ => ErrorClass::Unknown,
    }
}
