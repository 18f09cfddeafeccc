//! Metric rows derived from store snapshots.
//!
//! A snapshot is flattened into one [`MetricSample`] per measured quantity.
//! The Prometheus collector lives in [`collector`].

pub mod collector;

use crate::alias::{self, AliasMap};
use crate::mac_address::MacAddress;
use crate::reading::Quantity;
use crate::store::DeviceRecord;

/// One exported value: a quantity of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub quantity: Quantity,
    pub device: MacAddress,
    /// Alias of the device, empty when none is configured
    pub name: String,
    pub value: f64,
}

/// Flatten records into metric rows.
///
/// Each record contributes only the quantities its device class measures.
pub fn samples(records: &[DeviceRecord], aliases: &AliasMap) -> Vec<MetricSample> {
    records
        .iter()
        .flat_map(|record| {
            let name = alias::resolve_name(&record.device, aliases);
            record
                .reading
                .quantities()
                .into_iter()
                .map(move |(quantity, value)| MetricSample {
                    quantity,
                    device: record.device,
                    name: name.to_string(),
                    value,
                })
        })
        .collect()
}
