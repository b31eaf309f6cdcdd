//! Remote ID protocol decoding
//!
//! Pure frame-to-observation decoding:
//! 1. Strip the Radiotap header, if the capture carried one
//! 2. Split the 802.11 management frame
//! 3. Locate the Remote ID carriage (beacon vendor element or NAN)
//! 4. Walk the 25-byte message pack into one observation

mod dot11;
pub mod parser;
mod types;

pub use parser::{decode, DecodeError};
pub use types::{DroneObservation, MessageType, UaType};
