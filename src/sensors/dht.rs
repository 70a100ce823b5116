//! DHT11 / DHT21 / DHT22 temperature and humidity sensor.
//!
//! The data line is pulled low for 1.5 ms by an output sequence; its direct
//! completion turns the pin around and arms an 82-pulse input capture whose
//! task-mode completion decodes the frame into the reading ring.
//!
//! Frame on the wire after the start pulse: ~80 us ready pulse, then for
//! each of the 40 bits a ~50 us low followed by a high of ~26 us (0) or
//! ~70 us (1). Bits are read from the high pulses at capture indices
//! 2, 4, .., 80.

use core::fmt;
use core::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, trace, warn};

use crate::di_seq::DiSeq;
use crate::dio::Dio;
use crate::dio_task::DispatchMode;
use crate::do_seq::{DoSeq, Pulse};
use crate::error::Result;
use crate::gpio::{Level, PinId, Platform};
use crate::sensors::ring::{Reading, ReadingRing};
use crate::sensors::{ReadingCallback, SensorEvent, SensorInfo, SensorType, TempScale};
use crate::timer::{SeqTimer, TimeUnit};

pub const DHT_START_LOW_US: u32 = 1_500;
pub const DHT_START_RELEASE_US: u32 = 10;
pub const DHT_PULSES: usize = 82;
pub const DHT_TIMEOUT_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtKind {
    Dht11,
    Dht21,
    Dht22,
}

impl DhtKind {
    pub fn name(self) -> &'static str {
        match self {
            DhtKind::Dht11 => "DHT11",
            DhtKind::Dht21 => "DHT21",
            DhtKind::Dht22 => "DHT22",
        }
    }

    /// Engineering value of one raw count.
    fn scale(self) -> f32 {
        match self {
            DhtKind::Dht11 => 1.0,
            DhtKind::Dht21 | DhtKind::Dht22 => 0.1,
        }
    }
}

impl fmt::Display for DhtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DhtKind {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().trim_start_matches("DHT") {
            "11" => Ok(DhtKind::Dht11),
            "21" => Ok(DhtKind::Dht21),
            "22" => Ok(DhtKind::Dht22),
            _ => Err(format!("unknown DHT kind {s:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtError {
    /// The capture timed out with `samples` pulses recorded.
    Timeout { samples: usize },
    Checksum { expected: u8, received: u8 },
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { samples } => {
                write!(f, "reading timeout, {samples} samples acquired")
            }
            Self::Checksum { expected, received } => {
                write!(f, "checksum error (expected 0x{expected:02X}, got 0x{received:02X})")
            }
        }
    }
}

impl std::error::Error for DhtError {}

/// Raw values in sensor counts: whole units for DHT11, tenths otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DhtValues {
    pub temperature: i32,
    pub humidity: i32,
}

/// The five bytes of a DHT frame: humidity hi/lo, temperature hi/lo,
/// checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DhtFrame(pub [u8; 5]);

impl DhtFrame {
    pub fn from_pulses(pulses: &[Pulse]) -> Self {
        let mut data = [0u8; 5];
        for bit in 0..40 {
            let Some(pulse) = pulses.get(2 + bit * 2) else {
                break;
            };
            if bit_value(pulse.duration) {
                data[bit / 8] |= 0x80 >> (bit % 8);
            }
        }
        DhtFrame(data)
    }

    pub fn checksum(&self) -> u8 {
        self.0[..4].iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
    }

    pub fn verify(&self) -> core::result::Result<(), DhtError> {
        let expected = self.checksum();
        if expected == self.0[4] {
            Ok(())
        } else {
            Err(DhtError::Checksum {
                expected,
                received: self.0[4],
            })
        }
    }

    pub fn values(&self, kind: DhtKind) -> DhtValues {
        let [h_hi, h_lo, t_hi, t_lo, _] = self.0;
        match kind {
            DhtKind::Dht11 => DhtValues {
                temperature: i32::from(t_hi),
                humidity: i32::from(h_hi),
            },
            DhtKind::Dht21 | DhtKind::Dht22 => {
                let magnitude = i32::from(t_hi & 0x7F) << 8 | i32::from(t_lo);
                DhtValues {
                    temperature: if t_hi & 0x80 != 0 { -magnitude } else { magnitude },
                    humidity: i32::from(h_hi) << 8 | i32::from(h_lo),
                }
            }
        }
    }
}

/// High pulse length to bit. Out-of-band lengths are guessed and left for
/// the checksum to judge.
fn bit_value(duration: u32) -> bool {
    match duration {
        16..=37 => false,
        61..=83 => true,
        d => d > 49,
    }
}

/// Decode a complete capture.
pub fn decode(kind: DhtKind, pulses: &[Pulse]) -> core::result::Result<DhtValues, DhtError> {
    let frame = DhtFrame::from_pulses(pulses);
    frame.verify()?;
    Ok(frame.values(kind))
}

struct DhtState {
    ring: ReadingRing<DhtValues>,
    reading: bool,
    on_forced: Option<ReadingCallback>,
}

struct Inner {
    pin: PinId,
    kind: DhtKind,
    poll_interval_ms: u32,
    temperature_id: i32,
    humidity_id: i32,
    platform: Arc<dyn Platform>,
    start: DoSeq,
    capture: DiSeq,
    poll: Box<dyn SeqTimer>,
    state: Mutex<DhtState>,
}

/// Handle to a DHT sensor. Clones share the same sensor.
#[derive(Clone)]
pub struct Dht(Arc<Inner>);

impl Dht {
    /// Sensor on `pin`, polled every `poll_interval_ms` (0 disables polling)
    /// and keeping the last `buffer_len` readings.
    pub fn new(
        dio: &Dio,
        pin: PinId,
        kind: DhtKind,
        poll_interval_ms: u32,
        buffer_len: usize,
    ) -> Result<Self> {
        Self::with_ids(dio, pin, kind, poll_interval_ms, buffer_len, 0, 1)
    }

    pub fn with_ids(
        dio: &Dio,
        pin: PinId,
        kind: DhtKind,
        poll_interval_ms: u32,
        buffer_len: usize,
        temperature_id: i32,
        humidity_id: i32,
    ) -> Result<Self> {
        let ring = ReadingRing::new(buffer_len)?;
        let start = DoSeq::new(dio, pin, 2)?;
        start.add(Level::Low, DHT_START_LOW_US)?;
        start.add(Level::High, DHT_START_RELEASE_US)?;
        let capture = DiSeq::new(dio, pin, DHT_PULSES, DHT_TIMEOUT_MS, TimeUnit::Millis)?;
        let poll = dio.platform().timer("dht_poll")?;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_start = weak.clone();
            start.set_callback(
                move |_: &DoSeq| {
                    if let Some(inner) = on_start.upgrade() {
                        Dht(inner).start_completed();
                    }
                },
                DispatchMode::Direct,
            );
            let on_capture = weak.clone();
            capture.set_callback(
                move |seq: &DiSeq| {
                    if let Some(inner) = on_capture.upgrade() {
                        Dht(inner).reading_completed(seq);
                    }
                },
                DispatchMode::Task,
            );
            let on_poll = weak.clone();
            poll.set_callback(Box::new(move || {
                if let Some(inner) = on_poll.upgrade() {
                    Dht(inner).read();
                }
            }));
            Inner {
                pin,
                kind,
                poll_interval_ms,
                temperature_id,
                humidity_id,
                platform: dio.platform().clone(),
                start,
                capture,
                poll,
                state: Mutex::new(DhtState {
                    ring,
                    reading: false,
                    on_forced: None,
                }),
            }
        });
        let dht = Dht(inner);
        dht.arm_polling();
        info!("{} on GPIO{}, polling every {} ms", kind, pin, poll_interval_ms);
        Ok(dht)
    }

    fn state(&self) -> MutexGuard<'_, DhtState> {
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
        {
            let mut state = self.state();
            if state.reading {
                debug!("DHT [GPIO{}] poll skipped, reading under way", self.0.pin);
                return;
            }
            state.reading = true;
        }
        if let Err(err) = self.0.start.start_us() {
            warn!("DHT [GPIO{}] cannot send start pulse: {}", self.0.pin, err);
            self.finish_reading();
        }
    }

    fn start_completed(&self) {
        if let Err(err) = self.0.capture.start() {
            warn!("DHT [GPIO{}] cannot arm capture: {}", self.0.pin, err);
            self.finish_reading();
        }
    }

    fn reading_completed(&self, seq: &DiSeq) {
        let timestamp = self.0.platform.timestamp();
        let reading = if seq.ended_by_timeout() {
            let err = DhtError::Timeout {
                samples: seq.pulse_count(),
            };
            error!("DHT [GPIO{}] {}", self.0.pin, err);
            Reading::invalid(DhtValues::default(), timestamp)
        } else {
            let pulses = seq.pulses();
            let ready = pulses.first().map(|p| p.duration);
            if !ready.is_some_and(|d| (70..=90).contains(&d)) {
                trace!("DHT [GPIO{}] reading: missing preparation to send data", self.0.pin);
            }
            let frame = DhtFrame::from_pulses(&pulses);
            let values = frame.values(self.0.kind);
            match frame.verify() {
                Ok(()) => Reading::valid(values, timestamp),
                Err(err) => {
                    error!("DHT [GPIO{}] reading: {}", self.0.pin, err);
                    Reading::invalid(values, timestamp)
                }
            }
        };
        if let Err(err) = seq.clear() {
            warn!("DHT [GPIO{}] capture not cleared: {}", self.0.pin, err);
        }
        self.state().ring.push(reading);
        self.finish_reading();
    }

    fn finish_reading(&self) {
        let forced = {
            let mut state = self.state();
            state.reading = false;
            state.on_forced.take()
        };
        if let Some(callback) = forced {
            self.arm_polling();
            callback();
        }
    }

    pub fn pin(&self) -> PinId {
        self.0.pin
    }

    pub fn kind(&self) -> DhtKind {
        self.0.kind
    }

    /// Raw reading `age` steps before the newest one.
    pub fn reading(&self, age: usize) -> Reading<DhtValues> {
        self.state().ring.get(age)
    }

    pub fn readings(&self) -> Vec<Reading<DhtValues>> {
        self.state().ring.iter().collect()
    }

    pub fn temperature(&self, age: usize) -> SensorEvent {
        self.temperature_in(TempScale::Celsius, age)
    }

    pub fn temperature_in(&self, scale: TempScale, age: usize) -> SensorEvent {
        let reading = self.reading(age);
        SensorEvent {
            sensor_id: self.0.temperature_id,
            kind: SensorType::Temperature,
            timestamp: reading.timestamp,
            invalid: reading.invalid,
            value: scale.from_celsius(reading.value.temperature as f32 * self.0.kind.scale()),
        }
    }

    pub fn humidity(&self, age: usize) -> SensorEvent {
        let reading = self.reading(age);
        SensorEvent {
            sensor_id: self.0.humidity_id,
            kind: SensorType::RelativeHumidity,
            timestamp: reading.timestamp,
            invalid: reading.invalid,
            value: reading.value.humidity as f32 * self.0.kind.scale(),
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

    pub fn temperature_info(&self) -> SensorInfo {
        let (max_value, min_value, resolution, min_delay) = match self.0.kind {
            DhtKind::Dht11 => (50.0, 0.0, 2.0, 1_000_000),
            DhtKind::Dht21 => (80.0, -40.0, 0.1, 2_000_000),
            DhtKind::Dht22 => (125.0, -40.0, 0.1, 2_000_000),
        };
        SensorInfo {
            name: self.0.kind.name(),
            sensor_id: self.0.temperature_id,
            kind: SensorType::Temperature,
            max_value,
            min_value,
            resolution,
            min_delay,
        }
    }

    pub fn humidity_info(&self) -> SensorInfo {
        let (resolution, min_delay) = match self.0.kind {
            DhtKind::Dht11 => (2.0, 1_000_000),
            DhtKind::Dht21 | DhtKind::Dht22 => (0.1, 2_000_000),
        };
        SensorInfo {
            name: self.0.kind.name(),
            sensor_id: self.0.humidity_id,
            kind: SensorType::RelativeHumidity,
            max_value: 100.0,
            min_value: 0.0,
            resolution,
            min_delay,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.poll.disarm();
        self.start.abort();
        self.capture.abort();
    }
}
