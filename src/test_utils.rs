use crate::decoder::{SWITCHBOT_SERVICE_UUID, ServiceData};
use crate::mac_address::MacAddress;
use crate::reading::{MeterReading, Reading};
use crate::scanner::Advertisement;
use std::collections::HashSet;
use uuid::Uuid;

/// A stable device address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// The 16-bit service-data UUID (0x0D00) SwitchBot devices attach their payload to.
pub const SERVICE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_0d00_0000_1000_8000_0080_5f9b_34fb);

/// Meter: battery 100 %, 22.5 C, humidity 50 %.
pub fn meter_payload() -> Vec<u8> {
    vec![0x54, 0x00, 0x64, 0x05, 0x16, 0x32]
}

/// Curtain: battery 50 %, position 75 %, brightness 10.
pub fn curtain_payload() -> Vec<u8> {
    vec![0x63, 0x00, 0x32, 0x4B, 0xA0]
}

pub fn switchbot_services() -> HashSet<Uuid> {
    HashSet::from([SWITCHBOT_SERVICE_UUID])
}

/// A SwitchBot advertisement carrying a single service-data payload.
pub fn advertisement(address: MacAddress, payload: Vec<u8>) -> Advertisement {
    Advertisement {
        address,
        services: switchbot_services(),
        service_data: vec![ServiceData::new(SERVICE_DATA_UUID, payload)],
    }
}

/// A meter reading whose every field equals `value`.
pub fn uniform_meter(value: f64) -> Reading {
    Reading::Meter(MeterReading {
        temperature_celsius: value,
        humidity_percent: value,
        battery_percent: value,
    })
}
