//! Remote ID data types

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Open Drone ID message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    BasicId = 0x0,
    Location = 0x1,
    Authentication = 0x2,
    SelfId = 0x3,
    System = 0x4,
    OperatorId = 0x5,
    MessagePack = 0xF,
    Unknown = 0xFF,
}

impl From<u8> for MessageType {
    fn from(mtype: u8) -> Self {
        match mtype {
            0x0 => Self::BasicId,
            0x1 => Self::Location,
            0x2 => Self::Authentication,
            0x3 => Self::SelfId,
            0x4 => Self::System,
            0x5 => Self::OperatorId,
            0xF => Self::MessagePack,
            _ => Self::Unknown,
        }
    }
}

/// Airframe class broadcast in the Basic ID message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum UaType {
    Undeclared = 0,
    Aeroplane = 1,
    Rotorcraft = 2,
    Gyroplane = 3,
    HybridLift = 4,
    Ornithopter = 5,
    Glider = 6,
    Kite = 7,
    FreeBalloon = 8,
    CaptiveBalloon = 9,
    Airship = 10,
    FreeFallParachute = 11,
    Rocket = 12,
    TetheredPowered = 13,
    GroundObstacle = 14,
    Other = 15,
}

impl From<u8> for UaType {
    fn from(ua: u8) -> Self {
        match ua {
            1 => Self::Aeroplane,
            2 => Self::Rotorcraft,
            3 => Self::Gyroplane,
            4 => Self::HybridLift,
            5 => Self::Ornithopter,
            6 => Self::Glider,
            7 => Self::Kite,
            8 => Self::FreeBalloon,
            9 => Self::CaptiveBalloon,
            10 => Self::Airship,
            11 => Self::FreeFallParachute,
            12 => Self::Rocket,
            13 => Self::TetheredPowered,
            14 => Self::GroundObstacle,
            15 => Self::Other,
            _ => Self::Undeclared,
        }
    }
}

/// One decoded drone sighting, assembled from the messages of a single frame
#[derive(Debug, Clone, Serialize)]
pub struct DroneObservation {
    /// UAS identifier: broadcast serial number, or the source MAC when the
    /// frame carried no Basic ID message
    pub drone_id: String,

    /// Latitude in degrees (-90 to 90)
    pub latitude: Option<f64>,

    /// Longitude in degrees (-180 to 180)
    pub longitude: Option<f64>,

    /// Geodetic altitude in meters
    pub altitude_m: Option<f64>,

    /// Horizontal ground speed in m/s
    pub speed_mps: Option<f64>,

    /// Track direction in degrees (0-360)
    pub heading_deg: Option<f64>,

    /// Operator registration identifier
    pub operator_id: Option<String>,

    /// Airframe class, if a Basic ID message was present
    pub ua_type: Option<UaType>,

    /// Receive signal strength from the Radiotap header
    pub rssi_dbm: Option<i8>,

    /// Capture timestamp of the frame this observation came from
    pub observed_at: DateTime<Utc>,

    /// Interface or file that produced the frame
    pub source_id: String,
}

impl DroneObservation {
    /// True if any position component was broadcast.
    pub fn has_position(&self) -> bool {
        self.latitude.is_some() || self.longitude.is_some() || self.altitude_m.is_some()
    }

    /// True if any velocity component was broadcast.
    pub fn has_velocity(&self) -> bool {
        self.speed_mps.is_some() || self.heading_deg.is_some()
    }

    /// An observation with no position, velocity, or operator field carries
    /// nothing worth tracking; the decoder rejects it.
    pub fn has_telemetry(&self) -> bool {
        self.has_position() || self.has_velocity() || self.operator_id.is_some()
    }
}
