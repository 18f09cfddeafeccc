//! SwitchBot advertisement payload decoder.
//!
//! Pure functions over raw advertisement contents. An advertisement is first
//! gated on the SwitchBot service UUID; each service-data entry is then
//! dispatched on its first byte:
//!
//! | type | device  | min len | layout |
//! |------|---------|---------|--------|
//! | 0x54 | Meter   | 6 | `[type, _, battery, temp_frac, temp_int, humidity]` |
//! | 0x63 | Curtain | 5 | `[type, _, battery, position, light << 4]` |
//!
//! Bit 7 of the battery, integer-degree, humidity and position bytes is a
//! firmware status flag and is always masked off. The fractional temperature
//! byte is used as-is.
//!
//! See: <https://github.com/OpenWonderLabs/SwitchBotAPI-BLE>

use crate::reading::{CurtainReading, MeterReading, Reading};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

/// Service UUID advertised by every SwitchBot product.
pub const SWITCHBOT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xcba2_0d00_224d_11e6_9fb8_0002_a5d5_c51b);

pub const METER_TYPE: u8 = 0x54;
pub const CURTAIN_TYPE: u8 = 0x63;

const METER_MIN_LEN: usize = 6;
const CURTAIN_MIN_LEN: usize = 5;

/// Mask clearing the firmware status bit.
const VALUE_MASK: u8 = 0x7F;

/// One service-data entry of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: Uuid,
    pub data: Vec<u8>,
}

impl ServiceData {
    pub fn new(uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            data: data.into(),
        }
    }
}

/// Why an advertisement or a payload produced no reading.
///
/// None of these are failures; they are logged in verbose mode and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Unrecognized {
    /// The advertisement does not carry the SwitchBot service UUID.
    #[error("not a SwitchBot advertisement")]
    ForeignService,
    #[error("empty service data")]
    Empty,
    /// A device type this decoder does not know about.
    #[error("unknown device type 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated {device} payload: expected at least {expected} bytes, got {actual}")]
    Truncated {
        device: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Outcome of decoding a single service-data entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Recognized(Reading),
    Ignored(Unrecognized),
}

/// Decode every service-data entry of an advertisement.
///
/// Advertisements without [`SWITCHBOT_SERVICE_UUID`] yield a single
/// [`Unrecognized::ForeignService`] outcome without looking at the payloads.
/// Otherwise each entry yields its own outcome, in order.
pub fn decode(services: &HashSet<Uuid>, service_data: &[ServiceData]) -> Vec<Decoded> {
    if !services.contains(&SWITCHBOT_SERVICE_UUID) {
        return vec![Decoded::Ignored(Unrecognized::ForeignService)];
    }

    service_data
        .iter()
        .map(|entry| decode_payload(&entry.data))
        .collect()
}

/// Decode one service-data payload.
pub fn decode_payload(data: &[u8]) -> Decoded {
    let result = match data.first() {
        None => Err(Unrecognized::Empty),
        Some(&METER_TYPE) => decode_meter(data).map(Reading::Meter),
        Some(&CURTAIN_TYPE) => decode_curtain(data).map(Reading::Curtain),
        Some(&other) => Err(Unrecognized::UnknownType(other)),
    };

    match result {
        Ok(reading) => Decoded::Recognized(reading),
        Err(reason) => Decoded::Ignored(reason),
    }
}

fn check_len(device: &'static str, data: &[u8], expected: usize) -> Result<(), Unrecognized> {
    if data.len() < expected {
        return Err(Unrecognized::Truncated {
            device,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn decode_meter(data: &[u8]) -> Result<MeterReading, Unrecognized> {
    check_len("meter", data, METER_MIN_LEN)?;

    let battery = data[2] & VALUE_MASK;
    let fraction = data[3];
    let integer = data[4] & VALUE_MASK;
    let humidity = data[5] & VALUE_MASK;

    Ok(MeterReading {
        temperature_celsius: f64::from(integer) + f64::from(fraction) / 10.0,
        humidity_percent: f64::from(humidity),
        battery_percent: f64::from(battery),
    })
}

fn decode_curtain(data: &[u8]) -> Result<CurtainReading, Unrecognized> {
    check_len("curtain", data, CURTAIN_MIN_LEN)?;

    let battery = data[2] & VALUE_MASK;
    let position = data[3] & VALUE_MASK;
    let brightness = data[4] >> 4;

    Ok(CurtainReading {
        position_percent: f64::from(position),
        brightness_level: f64::from(brightness),
        battery_percent: f64::from(battery),
    })
}
