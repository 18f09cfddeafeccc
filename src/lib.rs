//! `switchbot-exporter` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The decode-and-state core lives in
//! [`crate::decoder`] and [`crate::store`]; [`crate::app`] wires them to an
//! injected scanner and to the metrics endpoint.

pub mod alias;
pub mod app;
pub mod decoder;
pub mod duration;
pub mod http;
pub mod mac_address;
pub mod output;
pub mod reading;
pub mod scanner;
pub mod store;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use alias::{Alias, AliasMap, parse_alias};
pub use decoder::{
    Decoded, SWITCHBOT_SERVICE_UUID, ServiceData, Unrecognized, decode, decode_payload,
};
pub use mac_address::MacAddress;
pub use output::MetricSample;
pub use reading::{CurtainReading, MeterReading, Quantity, Reading};
pub use scanner::{Advertisement, Backend, ScanError, ScanSchedule};
pub use store::{DEFAULT_STALE_AFTER, DeviceRecord, DeviceStateStore};
