//! Typed readings decoded from SwitchBot advertisements.

use std::fmt;

/// A reading from a SwitchBot Meter (thermo-hygrometer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    /// Temperature in Celsius, 0.1 degree resolution
    pub temperature_celsius: f64,
    /// Relative humidity in percent (0-100)
    pub humidity_percent: f64,
    /// Remaining battery in percent
    pub battery_percent: f64,
}

/// A reading from a SwitchBot Curtain motor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurtainReading {
    /// Curtain position in percent (0 = open, 100 = closed)
    pub position_percent: f64,
    /// Ambient light level reported by the built-in sensor (0-15)
    pub brightness_level: f64,
    /// Remaining battery in percent
    pub battery_percent: f64,
}

/// Latest state reported by one device, tagged by device class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Meter(MeterReading),
    Curtain(CurtainReading),
}

/// A single measured quantity, used as the exported metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quantity {
    Temperature,
    Humidity,
    Battery,
    Position,
    Brightness,
}

impl Quantity {
    /// Every quantity, in exposition order.
    pub const ALL: [Quantity; 5] = [
        Quantity::Temperature,
        Quantity::Humidity,
        Quantity::Battery,
        Quantity::Position,
        Quantity::Brightness,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
            Quantity::Battery => "battery",
            Quantity::Position => "position",
            Quantity::Brightness => "brightness",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Quantity::Temperature => "Temperature in degrees Celsius",
            Quantity::Humidity => "Relative humidity in percent",
            Quantity::Battery => "Remaining battery in percent",
            Quantity::Position => "Curtain position in percent",
            Quantity::Brightness => "Ambient light level (0-15)",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Reading {
    /// The quantities this reading carries, paired with their values.
    ///
    /// Only quantities applicable to the device class are returned: a Meter
    /// never reports position or brightness, a Curtain never reports
    /// temperature or humidity.
    pub fn quantities(&self) -> Vec<(Quantity, f64)> {
        match self {
            Reading::Meter(m) => vec![
                (Quantity::Temperature, m.temperature_celsius),
                (Quantity::Humidity, m.humidity_percent),
                (Quantity::Battery, m.battery_percent),
            ],
            Reading::Curtain(c) => vec![
                (Quantity::Position, c.position_percent),
                (Quantity::Brightness, c.brightness_level),
                (Quantity::Battery, c.battery_percent),
            ],
        }
    }
}
