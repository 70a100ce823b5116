//! MAX6675 K-type thermocouple converter, bit-banged.
//!
//! CS is pulled low, then a 5 ms periodic timer produces 32 half clock
//! ticks: on even ticks SCK goes high and SO is sampled MSB first, on odd
//! ticks SCK goes low. The 16-bit word carries the temperature in quarter
//! degrees in bits 3..=14 and an open-thermocouple flag in bit 2.

use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info};

use crate::dio::Dio;
use crate::error::Result;
use crate::gpio::{InputLine, Level, OutputLine, PinId, Platform};
use crate::sensors::ring::{Reading, ReadingRing};
use crate::sensors::{ReadingCallback, SensorEvent, SensorInfo, SensorType, TempScale};
use crate::timer::{SeqTimer, TimeUnit};

pub const MAX6675_TICK_MS: u32 = 5;
pub const MAX6675_TICKS: u32 = 32;

const OPEN_THERMOCOUPLE: u16 = 0x0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Max6675Error {
    Disconnected,
}

impl fmt::Display for Max6675Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "thermocouple disconnected"),
        }
    }
}

impl std::error::Error for Max6675Error {}

/// Temperature in quarter degrees Celsius.
pub fn decode(raw: u16) -> core::result::Result<u16, Max6675Error> {
    if raw & OPEN_THERMOCOUPLE != 0 {
        return Err(Max6675Error::Disconnected);
    }
    Ok((raw >> 3) & 0x0FFF)
}

struct Lines {
    cs: Box<dyn OutputLine>,
    sck: Box<dyn OutputLine>,
    so: Box<dyn InputLine>,
}

struct State {
    lines: Lines,
    ring: ReadingRing<u16>,
    data: u16,
    tick: u32,
    reading: bool,
    on_forced: Option<ReadingCallback>,
}

struct Inner {
    cs: PinId,
    sck: PinId,
    so: PinId,
    id: i32,
    poll_interval_ms: u32,
    platform: Arc<dyn Platform>,
    clock: Box<dyn SeqTimer>,
    poll: Box<dyn SeqTimer>,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Max6675(Arc<Inner>);

impl Max6675 {
    pub fn new(
        dio: &Dio,
        cs: PinId,
        sck: PinId,
        so: PinId,
        poll_interval_ms: u32,
        buffer_len: usize,
    ) -> Result<Self> {
        Self::with_id(dio, cs, sck, so, poll_interval_ms, buffer_len, 2)
    }

    pub fn with_id(
        dio: &Dio,
        cs: PinId,
        sck: PinId,
        so: PinId,
        poll_interval_ms: u32,
        buffer_len: usize,
        id: i32,
    ) -> Result<Self> {
        let platform = dio.platform();
        let ring = ReadingRing::new(buffer_len)?;
        let mut lines = Lines {
            cs: platform.output_line(cs)?,
            sck: platform.output_line(sck)?,
            so: platform.input_line(so)?,
        };
        lines.cs.set_level(Level::High);
        let clock = platform.timer("max6675_clock")?;
        let poll = platform.timer("max6675_poll")?;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_tick = weak.clone();
            clock.set_callback(Box::new(move || {
                if let Some(inner) = on_tick.upgrade() {
                    Max6675(inner).on_tick();
                }
            }));
            let on_poll = weak.clone();
            poll.set_callback(Box::new(move || {
                if let Some(inner) = on_poll.upgrade() {
                    Max6675(inner).read();
                }
            }));
            Inner {
                cs,
                sck,
                so,
                id,
                poll_interval_ms,
                platform: platform.clone(),
                clock,
                poll,
                state: Mutex::new(State {
                    lines,
                    ring,
                    data: 0,
                    tick: 0,
                    reading: false,
                    on_forced: None,
                }),
            }
        });
        let sensor = Max6675(inner);
        sensor.arm_polling();
        info!(
            "MAX6675 [CS-GPIO{}] [SCK-GPIO{}] [SO-GPIO{}] polling every {} ms",
            cs, sck, so, poll_interval_ms
        );
        Ok(sensor)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_polling(&self) {
        self.0.poll.disarm();
        if self.0.poll_interval_ms > 0 {
            self.0.poll.arm(self.0.poll_interval_ms, TimeUnit::Millis, true);
        }
    }

    /// Read now instead of waiting for the next poll. If a reading is already
    /// under way `callback` runs when that one completes.
    pub fn force_reading<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let idle = {
            let mut state = self.state();
            state.on_forced = Some(Box::new(callback));
            !state.reading
        };
        if idle {
            self.0.poll.disarm();
            self.read();
        }
    }

    pub fn is_reading(&self) -> bool {
        self.state().reading
    }

    fn read(&self) {
        let mut state = self.state();
        if state.reading {
            debug!("MAX6675 [SO-GPIO{}] poll skipped, reading under way", self.0.so);
            return;
        }
        state.reading = true;
        state.lines.cs.set_level(Level::Low);
        state.lines.sck.set_level(Level::Low);
        state.lines.so.configure();
        state.data = 0;
        state.tick = 0;
        self.0.clock.arm(MAX6675_TICK_MS, TimeUnit::Millis, true);
    }

    fn on_tick(&self) {
        let raw = {
            let mut state = self.state();
            if !state.reading {
                return;
            }
            if state.tick < MAX6675_TICKS {
                if state.tick % 2 == 0 {
                    state.lines.sck.set_level(Level::High);
                    if state.lines.so.level().is_high() {
                        let bit = 15 - state.tick / 2;
                        state.data |= 1 << bit;
                    }
                } else {
                    state.lines.sck.set_level(Level::Low);
                }
                state.tick += 1;
                return;
            }
            self.0.clock.disarm();
            state.lines.sck.set_level(Level::Low);
            state.lines.cs.set_level(Level::High);
            state.data
        };
        self.read_completed(raw);
    }

    fn read_completed(&self, raw: u16) {
        let timestamp = self.0.platform.timestamp();
        let forced = {
            let mut state = self.state();
            match decode(raw) {
                Ok(quarters) => state.ring.push(Reading::valid(quarters, timestamp)),
                Err(err) => error!(
                    "MAX6675 [CS-GPIO{}] [SCK-GPIO{}] [SO-GPIO{}] {}",
                    self.0.cs, self.0.sck, self.0.so, err
                ),
            }
            state.reading = false;
            state.on_forced.take()
        };
        if let Some(callback) = forced {
            self.arm_polling();
            callback();
        }
    }

    pub fn reading(&self, age: usize) -> Reading<u16> {
        self.state().ring.get(age)
    }

    pub fn temperature(&self, age: usize) -> SensorEvent {
        self.temperature_in(TempScale::Celsius, age)
    }

    pub fn temperature_in(&self, scale: TempScale, age: usize) -> SensorEvent {
        let reading = self.reading(age);
        SensorEvent {
            sensor_id: self.0.id,
            kind: SensorType::Temperature,
            timestamp: reading.timestamp,
            invalid: reading.invalid,
            value: scale.from_celsius(f32::from(reading.value) / 4.0),
        }
    }

    pub fn is_invalid(&self, age: usize) -> bool {
        self.reading(age).invalid
    }

    pub fn timestamp(&self, age: usize) -> u32 {
        self.reading(age).timestamp
    }

    pub fn max_events_count(&self) -> usize {
        self.state().ring.len()
    }

    pub fn info(&self) -> SensorInfo {
        SensorInfo {
            name: "MAX6675",
            sensor_id: self.0.id,
            kind: SensorType::Temperature,
            max_value: 1024.0,
            min_value: 0.0,
            resolution: 0.25,
            min_delay: 85_000,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.poll.disarm();
        self.clock.disarm();
    }
}
