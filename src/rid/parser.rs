//! Open Drone ID payload decoding
//!
//! Turns one captured management frame into at most one observation. Two
//! carriage variants are tried in priority order: the vendor-specific
//! element of a WiFi beacon, then the NAN service discovery attribute of a
//! public action frame. Both wrap the same fixed 25-byte message format.

use thiserror::Error;

use crate::capture::{LinkType, RawFrame};

use super::dot11::{self, Dot11Error, MgmtFrame, SUBTYPE_ACTION, SUBTYPE_BEACON};
use super::types::{DroneObservation, MessageType, UaType};

/// Every Open Drone ID message is exactly this long.
pub const ODID_MESSAGE_LEN: usize = 25;

/// A message pack carries at most this many messages.
const MAX_PACK_MESSAGES: usize = 9;

/// Beacon body: timestamp + interval + capabilities before the elements.
const BEACON_FIXED_LEN: usize = 12;

const VENDOR_ELEMENT_TAG: u8 = 0xDD;

/// ASD-STAN OUI and type marking a Remote ID vendor element.
const ODID_OUI: [u8; 3] = [0xFA, 0x0B, 0xBC];
const ODID_OUI_TYPE: u8 = 0x0D;

/// Wi-Fi Alliance OUI and type marking a NAN action frame.
const WFA_OUI: [u8; 3] = [0x50, 0x6F, 0x9A];
const NAN_OUI_TYPE: u8 = 0x13;
const NAN_ATTR_SERVICE_DESCRIPTOR: u8 = 0x03;

/// Service ID hash reserved for Remote ID over NAN.
const NAN_RID_SERVICE_ID: [u8; 6] = [0x88, 0x69, 0x19, 0x9D, 0x92, 0x09];

/// Decode failure for a single frame. Never fatal to a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Headers too short or structurally invalid, or a structurally valid
    /// frame that carries no usable telemetry.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// A matched Remote ID carriage whose declared sizes are inconsistent.
    #[error("corrupt payload: {0}")]
    Corrupt(&'static str),

    /// Valid 802.11, but no supported Remote ID carriage.
    #[error("unsupported frame variant")]
    UnsupportedVariant,
}

/// Telemetry accumulated while walking the messages of one frame.
#[derive(Debug, Default)]
struct OdidFields {
    serial: Option<String>,
    ua_type: Option<UaType>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude_m: Option<f64>,
    speed_mps: Option<f64>,
    heading_deg: Option<f64>,
    operator_id: Option<String>,
}

/// Decode one raw frame into an observation.
///
/// Pure and side-effect free; safe to call from any number of capture
/// workers concurrently.
pub fn decode(frame: &RawFrame) -> Result<DroneObservation, DecodeError> {
    let (dot11_bytes, rssi_dbm) = match frame.link {
        LinkType::Radiotap => {
            let rt = dot11::parse_radiotap(&frame.payload)
                .ok_or(DecodeError::Malformed("radiotap header"))?;
            (&frame.payload[rt.header_len..], rt.signal_dbm)
        }
        LinkType::Ieee80211 => (frame.payload.as_slice(), None),
        LinkType::Other(_) => return Err(DecodeError::UnsupportedVariant),
    };

    let mgmt = dot11::parse_mgmt_frame(dot11_bytes).map_err(|e| match e {
        Dot11Error::Short => DecodeError::Malformed("802.11 header"),
        Dot11Error::NotManagement => DecodeError::UnsupportedVariant,
    })?;

    // Carriage variants in priority order; first match wins.
    let rid = match beacon_rid_payload(&mgmt)? {
        Some(payload) => payload,
        None => match nan_rid_payload(&mgmt)? {
            Some(payload) => payload,
            None => return Err(DecodeError::UnsupportedVariant),
        },
    };

    let fields = parse_odid(rid)?;

    let observation = DroneObservation {
        drone_id: fields
            .serial
            .unwrap_or_else(|| format!("mac:{}", dot11::format_mac(&mgmt.source))),
        latitude: fields.latitude,
        longitude: fields.longitude,
        altitude_m: fields.altitude_m,
        speed_mps: fields.speed_mps,
        heading_deg: fields.heading_deg,
        operator_id: fields.operator_id,
        ua_type: fields.ua_type,
        rssi_dbm,
        observed_at: frame.captured_at,
        source_id: frame.source_id.clone(),
    };

    if !observation.has_telemetry() {
        return Err(DecodeError::Malformed("no telemetry fields"));
    }
    Ok(observation)
}

/// Locate the Remote ID payload in a beacon's vendor-specific element.
///
/// `Ok(None)` means the frame is simply not this variant.
fn beacon_rid_payload<'a>(mgmt: &MgmtFrame<'a>) -> Result<Option<&'a [u8]>, DecodeError> {
    if mgmt.subtype != SUBTYPE_BEACON {
        return Ok(None);
    }
    if mgmt.body.len() < BEACON_FIXED_LEN {
        return Err(DecodeError::Malformed("beacon fixed fields"));
    }
    let elements = &mgmt.body[BEACON_FIXED_LEN..];
    let mut i = 0;
    while i + 2 <= elements.len() {
        let tag = elements[i];
        let len = elements[i + 1] as usize;
        let start = i + 2;
        if start + len > elements.len() {
            // truncated element tail; stop scanning
            break;
        }
        if tag == VENDOR_ELEMENT_TAG {
            let content = &elements[start..start + len];
            if content.len() >= 4 && content[..3] == ODID_OUI && content[3] == ODID_OUI_TYPE {
                if content.len() < 5 {
                    return Err(DecodeError::Corrupt("vendor element too short"));
                }
                // message counter + messages
                return Ok(Some(&content[4..]));
            }
        }
        i = start + len;
    }
    Ok(None)
}

/// Locate the Remote ID payload in a NAN service discovery frame.
fn nan_rid_payload<'a>(mgmt: &MgmtFrame<'a>) -> Result<Option<&'a [u8]>, DecodeError> {
    if mgmt.subtype != SUBTYPE_ACTION {
        return Ok(None);
    }
    let body = mgmt.body;
    // category 4 (public) + action 9 (vendor specific) + OUI + type
    if body.len() < 6
        || body[0] != 0x04
        || body[1] != 0x09
        || body[2..5] != WFA_OUI
        || body[5] != NAN_OUI_TYPE
    {
        return Ok(None);
    }
    let attrs = &body[6..];
    let mut i = 0;
    while i + 3 <= attrs.len() {
        let id = attrs[i];
        let alen = u16::from_le_bytes([attrs[i + 1], attrs[i + 2]]) as usize;
        let start = i + 3;
        if start + alen > attrs.len() {
            return Err(DecodeError::Corrupt("nan attribute overruns frame"));
        }
        if id == NAN_ATTR_SERVICE_DESCRIPTOR {
            let attr = &attrs[start..start + alen];
            // service id + instance + requestor + control + info length
            if attr.len() < 10 {
                return Err(DecodeError::Corrupt("service descriptor too short"));
            }
            if attr[..6] != NAN_RID_SERVICE_ID {
                return Ok(None);
            }
            let info_len = attr[9] as usize;
            if 10 + info_len > attr.len() {
                return Err(DecodeError::Corrupt("service info overruns attribute"));
            }
            return Ok(Some(&attr[10..10 + info_len]));
        }
        i = start + alen;
    }
    Ok(None)
}

/// Walk the message counter + message/pack area shared by both carriages.
fn parse_odid(rid: &[u8]) -> Result<OdidFields, DecodeError> {
    if rid.len() < 1 + ODID_MESSAGE_LEN {
        return Err(DecodeError::Corrupt("shorter than one message"));
    }
    // first byte is the per-sender message counter
    let body = &rid[1..];
    let mut fields = OdidFields::default();

    match MessageType::from(body[0] >> 4) {
        MessageType::MessagePack => {
            if body.len() < 3 {
                return Err(DecodeError::Corrupt("pack header"));
            }
            let msg_len = body[1] as usize;
            let count = body[2] as usize;
            if msg_len != ODID_MESSAGE_LEN {
                return Err(DecodeError::Corrupt("pack message size"));
            }
            if count == 0 || count > MAX_PACK_MESSAGES {
                return Err(DecodeError::Corrupt("pack message count"));
            }
            if 3 + msg_len * count > body.len() {
                return Err(DecodeError::Corrupt("pack overruns element"));
            }
            for k in 0..count {
                let start = 3 + k * msg_len;
                apply_message(&body[start..start + msg_len], &mut fields);
            }
        }
        MessageType::Unknown => return Err(DecodeError::UnsupportedVariant),
        _ => apply_message(&body[..ODID_MESSAGE_LEN], &mut fields),
    }
    Ok(fields)
}

/// Fold one 25-byte message into the accumulated fields. Message types
/// without tracked telemetry (Auth, Self-ID, System) are skipped.
fn apply_message(msg: &[u8], fields: &mut OdidFields) {
    match MessageType::from(msg[0] >> 4) {
        MessageType::BasicId => {
            let id_type = msg[1] >> 4;
            fields.ua_type = Some(UaType::from(msg[1] & 0x0F));
            // 1 = serial number, 2 = CAA registration, 3 = UTM UUID
            if (1..=3).contains(&id_type) {
                if let Some(id) = decode_id_string(&msg[2..22]) {
                    fields.serial = Some(id);
                }
            }
        }
        MessageType::Location => {
            let status = msg[1];
            let east_segment = status & 0x02 != 0;
            let speed_multiplier = status & 0x01;

            // track direction: 0-179 plus the E/W segment flag
            let track = msg[2];
            if track <= 179 {
                let dir = track as f64 + if east_segment { 180.0 } else { 0.0 };
                fields.heading_deg = Some(dir);
            }

            // 255 is the protocol's "unknown" speed
            let raw_speed = msg[3];
            if raw_speed != 255 {
                fields.speed_mps = Some(if speed_multiplier == 0 {
                    raw_speed as f64 * 0.25
                } else {
                    raw_speed as f64 * 0.75 + 63.75
                });
            }

            let raw_lat = i32::from_le_bytes([msg[5], msg[6], msg[7], msg[8]]);
            let raw_lon = i32::from_le_bytes([msg[9], msg[10], msg[11], msg[12]]);
            // (0, 0) is the protocol's "no fix"; implausible values decode
            // as absent for that field only
            if raw_lat != 0 || raw_lon != 0 {
                let lat = raw_lat as f64 * 1e-7;
                let lon = raw_lon as f64 * 1e-7;
                if lat.abs() <= 90.0 {
                    fields.latitude = Some(lat);
                }
                if lon.abs() <= 180.0 {
                    fields.longitude = Some(lon);
                }
            }

            let geodetic = u16::from_le_bytes([msg[15], msg[16]]);
            let pressure = u16::from_le_bytes([msg[13], msg[14]]);
            fields.altitude_m = decode_altitude(geodetic).or_else(|| decode_altitude(pressure));
        }
        MessageType::OperatorId => {
            if let Some(op) = decode_id_string(&msg[2..22]) {
                fields.operator_id = Some(op);
            }
        }
        _ => {}
    }
}

/// Altitude is (value * 0.5) - 1000 m; encoded 0 means unknown.
fn decode_altitude(raw: u16) -> Option<f64> {
    if raw == 0 {
        return None;
    }
    Some(raw as f64 * 0.5 - 1000.0)
}

/// Null-padded printable-ASCII identifier fields (serial, operator id).
fn decode_id_string(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let raw = &bytes[..end];
    if raw.is_empty() || !raw.iter().all(|&b| b.is_ascii_graphic() || b == b' ') {
        return None;
    }
    let id = String::from_utf8_lossy(raw).trim().to_string();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
