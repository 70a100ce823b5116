//! Sensor drivers built on the sequencing engine.

pub mod dht;
pub mod max6675;
pub mod ring;

pub use dht::{Dht, DhtKind};
pub use max6675::Max6675;
pub use ring::{Reading, ReadingRing};

use serde::Serialize;

/// Invoked once a forced reading has been committed (or has failed).
pub type ReadingCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    RelativeHumidity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TempScale {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TempScale {
    pub fn from_celsius(self, celsius: f32) -> f32 {
        match self {
            TempScale::Celsius => celsius,
            TempScale::Fahrenheit => celsius * 1.8 + 32.0,
        }
    }
}

/// Static description of a sensor channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorInfo {
    pub name: &'static str,
    pub sensor_id: i32,
    #[serde(rename = "type")]
    pub kind: SensorType,
    pub max_value: f32,
    pub min_value: f32,
    pub resolution: f32,
    /// Minimum delay between readings, microseconds.
    pub min_delay: u32,
}

/// One reading of one channel, in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorEvent {
    pub sensor_id: i32,
    #[serde(rename = "type")]
    pub kind: SensorType,
    pub timestamp: u32,
    pub invalid: bool,
    pub value: f32,
}
