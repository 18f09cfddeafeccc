//! BLE scanner backends delivering raw SwitchBot advertisements.
//!
//! Backends only collect what the radio saw: the advertiser's address, its
//! advertised service UUIDs and its service-data entries. Recognizing and
//! decoding SwitchBot payloads is left to [`crate::decoder`].

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::decoder::ServiceData;
use crate::mac_address::MacAddress;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One observed advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: MacAddress,
    pub services: HashSet<Uuid>,
    pub service_data: Vec<ServiceData>,
}

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Channel buffer size for raw advertisements.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Base UUID used to expand 16-bit Bluetooth SIG UUIDs to 128 bits.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit Bluetooth UUID to its 128-bit form.
pub fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

/// Alternating scan and idle periods.
///
/// The radio scans for `window`, then rests for `idle`, forever. An `idle`
/// of zero scans continuously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSchedule {
    pub window: Duration,
    pub idle: Duration,
}

impl ScanSchedule {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(11);
    pub const DEFAULT_IDLE: Duration = Duration::from_secs(49);

    pub fn is_continuous(&self) -> bool {
        self.idle.is_zero()
    }
}

impl Default for ScanSchedule {
    fn default() -> Self {
        Self {
            window: Self::DEFAULT_WINDOW,
            idle: Self::DEFAULT_IDLE,
        }
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
        }
    }
}

/// Start scanning with the given backend.
///
/// Bluetooth initialization happens before this returns, so adapter errors
/// surface here; afterwards the scan runs in a background task following
/// `schedule` until the receiver is dropped.
pub async fn start_scan(
    backend: Backend,
    schedule: ScanSchedule,
) -> Result<mpsc::Receiver<Advertisement>, ScanError> {
    tracing::info!(
        %backend,
        window = ?schedule.window,
        idle = ?schedule.idle,
        "starting BLE scan"
    );
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(schedule).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(schedule).await,
    }
}
