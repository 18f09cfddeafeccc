//! Prometheus collector over the device state store.
//!
//! Every scrape takes a fresh snapshot, so a device that stopped advertising
//! disappears from the exposition once it goes stale instead of repeating its
//! last value forever.

use crate::alias::AliasMap;
use crate::output::{MetricSample, samples};
use crate::reading::Quantity;
use crate::store::DeviceStateStore;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metric name prefix.
pub const NAMESPACE: &str = "switchbot";

/// Label carrying the device address.
pub const ADDRESS_LABEL: &str = "hw";

/// Label carrying the configured alias.
pub const NAME_LABEL: &str = "name";

fn opts(quantity: Quantity) -> Opts {
    Opts::new(quantity.name(), quantity.help()).namespace(NAMESPACE)
}

fn gauge_vec(quantity: Quantity) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(opts(quantity), &[ADDRESS_LABEL, NAME_LABEL])
}

/// Exposes the latest reading of every live device as gauges.
pub struct SwitchBotCollector {
    store: Arc<DeviceStateStore>,
    stale_after: Duration,
    aliases: AliasMap,
    // Only used to describe the metric families.
    descriptors: Vec<GaugeVec>,
}

impl SwitchBotCollector {
    pub fn new(
        store: Arc<DeviceStateStore>,
        stale_after: Duration,
        aliases: AliasMap,
    ) -> prometheus::Result<Self> {
        let descriptors = Quantity::ALL
            .into_iter()
            .map(gauge_vec)
            .collect::<prometheus::Result<_>>()?;

        Ok(Self {
            store,
            stale_after,
            aliases,
            descriptors,
        })
    }

    /// Metric rows for devices seen within the staleness threshold of `now`.
    pub fn samples_at(&self, now: Instant) -> Vec<MetricSample> {
        let records = self.store.snapshot(now, self.stale_after);
        samples(&records, &self.aliases)
    }
}

impl Collector for SwitchBotCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descriptors.iter().flat_map(Collector::desc).collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families: BTreeMap<Quantity, GaugeVec> = BTreeMap::new();

        for sample in self.samples_at(Instant::now()) {
            let gauges = match families.entry(sample.quantity) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match gauge_vec(sample.quantity) {
                    Ok(gauges) => entry.insert(gauges),
                    Err(e) => {
                        tracing::warn!(quantity = %sample.quantity, error = %e, "cannot build gauge");
                        continue;
                    }
                },
            };
            let address = sample.device.to_string();
            gauges
                .with_label_values(&[address.as_str(), sample.name.as_str()])
                .set(sample.value);
        }

        families.values().flat_map(Collector::collect).collect()
    }
}

/// Register a collector for `store` on a fresh registry.
pub fn registry(
    store: Arc<DeviceStateStore>,
    stale_after: Duration,
    aliases: AliasMap,
) -> prometheus::Result<Registry> {
    let registry = Registry::new();
    registry.register(Box::new(SwitchBotCollector::new(
        store,
        stale_after,
        aliases,
    )?))?;
    Ok(registry)
}

/// Render every metric of `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> prometheus::Result<String> {
    let mut buffer = String::new();
    TextEncoder::new().encode_utf8(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::{parse_alias, to_map};
    use crate::reading::{CurtainReading, Reading};
    use crate::mac_address::MacAddress;
    use crate::store::DEFAULT_STALE_AFTER;
    use crate::test_utils::{TEST_MAC, uniform_meter};

    const CURTAIN_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    fn curtain() -> Reading {
        Reading::Curtain(CurtainReading {
            position_percent: 75.0,
            brightness_level: 10.0,
            battery_percent: 50.0,
        })
    }

    #[test]
    fn test_render_meter_and_curtain() {
        let store = Arc::new(DeviceStateStore::new());
        store.upsert(TEST_MAC, uniform_meter(22.5), Instant::now());
        store.upsert(CURTAIN_MAC, curtain(), Instant::now());
        let aliases = to_map(&[parse_alias("AA:BB:CC:DD:EE:FF=Bedroom").unwrap()]);

        let registry = registry(store, DEFAULT_STALE_AFTER, aliases).unwrap();
        let text = render(&registry).unwrap();

        assert!(text.contains("# TYPE switchbot_temperature gauge"));
        assert!(text.contains(r#"switchbot_temperature{hw="AA:BB:CC:DD:EE:FF",name="Bedroom"} 22.5"#));
        assert!(text.contains(r#"switchbot_position{hw="11:22:33:44:55:66",name=""} 75"#));
        assert!(text.contains(r#"switchbot_brightness{hw="11:22:33:44:55:66",name=""} 10"#));
        assert!(text.contains(r#"switchbot_battery{hw="11:22:33:44:55:66",name=""} 50"#));
        assert!(!text.contains(r#"switchbot_humidity{hw="11:22:33:44:55:66""#));
        assert!(!text.contains(r#"switchbot_position{hw="AA:BB:CC:DD:EE:FF""#));
    }

    #[test]
    fn test_stale_devices_are_not_exported() {
        let store = Arc::new(DeviceStateStore::new());
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap_or_else(Instant::now);
        store.upsert(TEST_MAC, uniform_meter(20.0), long_ago);
        store.upsert(CURTAIN_MAC, curtain(), Instant::now());

        let collector =
            SwitchBotCollector::new(Arc::clone(&store), Duration::from_secs(60), AliasMap::new())
                .unwrap();
        let rows = collector.samples_at(Instant::now());
        assert!(rows.iter().all(|s| s.device == CURTAIN_MAC));
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_empty_store_renders_nothing() {
        let store = Arc::new(DeviceStateStore::new());
        let registry = registry(store, DEFAULT_STALE_AFTER, AliasMap::new()).unwrap();
        assert!(render(&registry).unwrap().is_empty());
    }

    #[test]
    fn test_collector_describes_every_quantity() {
        let store = Arc::new(DeviceStateStore::new());
        let collector = SwitchBotCollector::new(store, DEFAULT_STALE_AFTER, AliasMap::new()).unwrap();
        let names: Vec<_> = collector.desc().iter().map(|d| d.fq_name.clone()).collect();
        assert_eq!(
            names,
            [
                "switchbot_temperature",
                "switchbot_humidity",
                "switchbot_battery",
                "switchbot_position",
                "switchbot_brightness",
            ]
        );
    }
}
