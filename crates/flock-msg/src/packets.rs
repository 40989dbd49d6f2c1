//! ---
//! flk_section: "02-messaging-ipc-data-model"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Packet records and protocol lookup tables."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter};

/// Opaque network address of a vehicle on one communication medium.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Wrap a medium-specific address value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw address value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Medium and address a packet was received from or should be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    /// Communication medium, e.g. `wireless`.
    pub medium: String,
    /// Address of the peer on that medium.
    pub address: Address,
}

impl Source {
    /// Construct a source from its parts.
    pub fn new(medium: impl Into<String>, address: impl Into<Address>) -> Self {
        Self {
            medium: medium.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.medium, self.address)
    }
}

/// Geodetic position reported by a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinate {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Altitude above mean sea level, metres.
    #[serde(default)]
    pub amsl: Option<f64>,
    /// Altitude above ground level, metres.
    #[serde(default)]
    pub agl: Option<f64>,
}

impl GpsCoordinate {
    /// Coordinate without altitude information.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            amsl: None,
            agl: None,
        }
    }

    /// Attach an altitude above ground level.
    pub fn with_agl(mut self, agl: f64) -> Self {
        self.agl = Some(agl);
        self
    }

    /// Attach an altitude above mean sea level.
    pub fn with_amsl(mut self, amsl: f64) -> Self {
        self.amsl = Some(amsl);
        self
    }
}

/// Velocity in the local north-east-down frame, metres per second.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VelocityNed {
    /// Northward component.
    pub north: f64,
    /// Eastward component.
    pub east: f64,
    /// Downward component.
    pub down: f64,
}

/// Periodic status report of a vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPacket {
    /// Numeric index of the vehicle within the fleet.
    pub id: u32,
    /// Current position.
    pub location: GpsCoordinate,
    /// Current velocity.
    #[serde(default)]
    pub velocity: VelocityNed,
    /// Heading in degrees.
    #[serde(default)]
    pub heading: f64,
    /// Name of the onboard algorithm currently running.
    #[serde(default)]
    pub algorithm_name: String,
    /// Protocol error code, see [`crate::errors`].
    #[serde(default)]
    pub error: u8,
}

/// Pre-arm check report. Accepted and ignored by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrearmStatusPacket {
    /// Numeric index of the vehicle.
    pub id: u32,
    /// Bit field of passed checks.
    #[serde(default)]
    pub flags: u32,
}

/// Mission description broadcast by a vehicle. Accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionInfoPacket {
    /// Numeric index of the vehicle.
    pub id: u32,
    /// Mission name.
    #[serde(default)]
    pub name: String,
}

/// Command line sent to a vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequestPacket {
    /// UTF-8 encoded command line.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl CommandRequestPacket {
    /// Encode a command line as a request payload.
    pub fn from_command(command: &str) -> Self {
        Self {
            body: command.as_bytes().to_vec(),
        }
    }
}

/// One part of a multi-chunk command response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponseChunk {
    /// Identifier shared by all chunks of one response.
    pub sequence_id: u8,
    /// Zero-based position of this chunk.
    pub chunk_index: u8,
    /// Number of chunks making up the response.
    pub total_chunks: u8,
    /// Chunk payload.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Readings of the Geiger-Müller counter tubes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeigerCounterData {
    /// GPS time of week of the measurement, milliseconds.
    pub itow: u32,
    /// Dose rate in mGy/h; `None` when the counter is disabled.
    #[serde(default)]
    pub dose_rate: Option<f64>,
    /// Cumulative raw counts per tube; `None` when the counter is disabled.
    #[serde(default)]
    pub raw_counts: Option<Vec<u32>>,
}

/// Visual features detected by the onboard camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFeatureData {
    /// GPS time of week of the detection, milliseconds.
    pub itow: u32,
    /// Positions of the detected features.
    #[serde(default)]
    pub features: Vec<GpsCoordinate>,
}

/// Algorithm-specific payload of an [`AlgorithmDataPacket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmPayload {
    /// Radiation measurement.
    GeigerCounter(GeigerCounterData),
    /// Camera feature detections.
    CameraFeatures(CameraFeatureData),
    /// Payload of an algorithm this crate has no record type for.
    Raw {
        /// Undecoded payload bytes.
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

/// Data produced by a named onboard algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmDataPacket {
    /// Numeric index of the vehicle.
    pub uav_id: u32,
    /// Name of the algorithm that produced the data.
    pub algorithm: String,
    /// Decoded payload.
    pub payload: AlgorithmPayload,
}

/// Discriminant of a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum PacketKind {
    /// [`Packet::Status`]
    Status,
    /// [`Packet::PrearmStatus`]
    PrearmStatus,
    /// [`Packet::CommandRequest`]
    CommandRequest,
    /// [`Packet::CommandResponse`]
    CommandResponse,
    /// [`Packet::CompressedCommandResponse`]
    CompressedCommandResponse,
    /// [`Packet::AlgorithmData`]
    AlgorithmData,
    /// [`Packet::MissionInfo`]
    MissionInfo,
    /// [`Packet::Other`]
    Other,
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Packet {
    /// Vehicle status report.
    Status(StatusPacket),
    /// Pre-arm check report.
    PrearmStatus(PrearmStatusPacket),
    /// Command line addressed to a vehicle.
    CommandRequest(CommandRequestPacket),
    /// Plain command response chunk.
    CommandResponse(CommandResponseChunk),
    /// zlib-compressed command response chunk.
    CompressedCommandResponse(CommandResponseChunk),
    /// Algorithm-specific data.
    AlgorithmData(AlgorithmDataPacket),
    /// Mission description.
    MissionInfo(MissionInfoPacket),
    /// Packet type the decoder recognised only by its numeric code.
    Other {
        /// Numeric packet type on the wire.
        type_code: u8,
        /// Undecoded payload.
        #[serde(with = "base64_bytes", default)]
        payload: Vec<u8>,
    },
}

impl Packet {
    /// Discriminant of this packet.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Status(_) => PacketKind::Status,
            Packet::PrearmStatus(_) => PacketKind::PrearmStatus,
            Packet::CommandRequest(_) => PacketKind::CommandRequest,
            Packet::CommandResponse(_) => PacketKind::CommandResponse,
            Packet::CompressedCommandResponse(_) => PacketKind::CompressedCommandResponse,
            Packet::AlgorithmData(_) => PacketKind::AlgorithmData,
            Packet::MissionInfo(_) => PacketKind::MissionInfo,
            Packet::Other { .. } => PacketKind::Other,
        }
    }

    /// Build a command request packet from a command line.
    pub fn command_request(command: &str) -> Self {
        Packet::CommandRequest(CommandRequestPacket::from_command(command))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
