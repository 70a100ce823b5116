//! Hardware test scenarios triggered through `POST /api/test`.
//!
//! Scenarios 1-9 drive the loopback pins: the output pin is meant to be
//! jumpered to the input pin, which doubles as a second output in scenario 3.
//! Scenario 10 talks to a DHT sensor directly through the engine, 11 and 12
//! dump what the DHT driver has stored.

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};

use crate::di_seq::DiSeq;
use crate::dio::Dio;
use crate::dio_task::DispatchMode;
use crate::do_seq::{DoSeq, Pulse};
use crate::error::Result;
use crate::gpio::{Level, PinId};
use crate::sensors::{Dht, SensorEvent};
use crate::timer::TimeUnit;

const STAIRS_MS: [u32; 9] = [1000, 1500, 2000, 2500, 3000, 3500, 4000, 4500, 5000];
const SQUARE_MS: [u32; 8] = [2000, 3000, 2000, 3000, 2000, 3000, 2000, 3000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchPins {
    pub out: PinId,
    pub input: PinId,
    pub dht: PinId,
}

/// What a scenario produced, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchReport {
    OutputDone {
        pin: PinId,
    },
    InputDone {
        pin: PinId,
        ended_by_timeout: bool,
        pulses: Vec<Pulse>,
    },
    DhtRaw {
        /// Microseconds between the start pulse and the capture being armed.
        start_to_capture_us: u64,
        ended_by_timeout: bool,
        pulses: Vec<Pulse>,
    },
    DhtReading {
        age: usize,
        temperature: SensorEvent,
        humidity: SensorEvent,
    },
}

#[derive(Clone)]
pub struct TestBench {
    dio: Dio,
    pins: BenchPins,
    dht: Option<Dht>,
    reports: Arc<Mutex<Vec<BenchReport>>>,
}

/// Alternating LOW/HIGH steps starting LOW.
fn alternating(durations: &[u32]) -> Vec<(Level, u32)> {
    durations
        .iter()
        .enumerate()
        .map(|(i, d)| (Level::from(i % 2 == 1), *d))
        .collect()
}

fn log_pulses(title: &str, pulses: &[Pulse]) {
    info!("{title}");
    for (idx, pulse) in pulses.iter().enumerate() {
        info!("pulse {}: level {} - duration {}", idx, pulse.level, pulse.duration);
    }
    info!("Sequence end.");
}

impl TestBench {
    pub fn new(dio: Dio, pins: BenchPins) -> Self {
        Self {
            dio,
            pins,
            dht: None,
            reports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_dht(mut self, dht: Dht) -> Self {
        self.dht = Some(dht);
        self
    }

    pub fn reports(&self) -> Vec<BenchReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn report(reports: &Mutex<Vec<BenchReport>>, report: BenchReport) {
        reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }

    /// Start scenario `number`. Returns `false` for numbers with no scenario.
    pub fn run_test(&self, number: i64) -> Result<bool> {
        let (out, input) = (self.pins.out, self.pins.input);
        match number {
            1 => self.output(out, 1, &[(Level::Low, 1000)])?.start_ms()?,
            2 => self.output(out, 9, &alternating(&STAIRS_MS))?.start_ms()?,
            3 => {
                let first = self.output(out, 9, &alternating(&STAIRS_MS))?;
                let second = self.output(input, 8, &alternating(&SQUARE_MS))?;
                first.start_ms()?;
                second.start_ms()?;
            }
            4 => self.output(out, 9, &alternating(&[150; 9]))?.start_ms()?,
            5 => self.output(out, 9, &alternating(&[150_000; 9]))?.start_us()?,
            6 => {
                self.input(input, 9, 20, TimeUnit::Millis)?.start()?;
                self.output(out, 9, &alternating(&[1000; 9]))?.start_us()?;
            }
            7 => {
                let capture = self.input(input, 9, 750_000, TimeUnit::Micros)?;
                let seq = self.output(out, 9, &alternating(&[5; 9]))?;
                capture.start()?;
                seq.start_ms()?;
            }
            8 => {
                self.input(input, 9, 20, TimeUnit::Millis)?.start()?;
                self.output(out, 7, &alternating(&[1000; 9]))?.start_us()?;
            }
            9 => {
                let capture = self.input(input, 9, 50_000, TimeUnit::Micros)?;
                let seq = self.output(out, 7, &alternating(&[5; 9]))?;
                capture.start()?;
                seq.start_ms()?;
            }
            10 => self.dht_raw()?,
            11 => self.dht_dump(true),
            12 => self.dht_dump(false),
            _ => {
                debug!("test {number}: no such scenario");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Output sequence on `pin`, idling high. Steps past `capacity` are
    /// dropped.
    fn output(&self, pin: PinId, capacity: usize, steps: &[(Level, u32)]) -> Result<DoSeq> {
        self.dio.platform().output_line(pin)?.set_level(Level::High);
        let seq = DoSeq::new(&self.dio, pin, capacity)?;
        for (idx, (level, duration)) in steps.iter().enumerate() {
            if let Err(err) = seq.add(*level, *duration) {
                debug!("GPIO{pin} step {idx} dropped: {err}");
            }
        }
        log_pulses("Sequence defined as:", &seq.pulses());
        let reports = self.reports.clone();
        seq.set_callback(
            move |seq: &DoSeq| {
                info!("Test completed");
                Self::report(&reports, BenchReport::OutputDone { pin: seq.pin() });
            },
            DispatchMode::Task,
        );
        Ok(seq)
    }

    fn input(&self, pin: PinId, target: usize, timeout: u32, unit: TimeUnit) -> Result<DiSeq> {
        let seq = DiSeq::new(&self.dio, pin, target, timeout, unit)?;
        let reports = self.reports.clone();
        seq.set_callback(
            move |seq: &DiSeq| {
                if seq.ended_by_timeout() {
                    info!("Input sequence reading ended by timeout timer");
                } else {
                    info!("Input sequence reading completed");
                }
                let pulses = seq.pulses();
                log_pulses("Sequence acquired:", &pulses);
                Self::report(
                    &reports,
                    BenchReport::InputDone {
                        pin: seq.pin(),
                        ended_by_timeout: seq.ended_by_timeout(),
                        pulses,
                    },
                );
            },
            DispatchMode::Task,
        );
        Ok(seq)
    }

    fn dht_raw(&self) -> Result<()> {
        let pin = self.pins.dht;
        let platform = self.dio.platform().clone();
        let started_at = platform.now_us();
        let capture = DiSeq::new(&self.dio, pin, 82, 1000, TimeUnit::Millis)?;
        let armed_at = Arc::new(Mutex::new(started_at));

        let reports = self.reports.clone();
        let armed = armed_at.clone();
        capture.set_callback(
            move |seq: &DiSeq| {
                let armed = *armed.lock().unwrap_or_else(PoisonError::into_inner);
                let start_to_capture_us = armed.saturating_sub(started_at);
                info!("start DHT -> start reading = {start_to_capture_us}");
                if seq.ended_by_timeout() {
                    info!("DHT reading ended by timeout timer");
                } else {
                    info!("DHT reading completed");
                }
                let pulses = seq.pulses();
                log_pulses("DHT sequence acquired:", &pulses);
                Self::report(
                    &reports,
                    BenchReport::DhtRaw {
                        start_to_capture_us,
                        ended_by_timeout: seq.ended_by_timeout(),
                        pulses,
                    },
                );
            },
            DispatchMode::Task,
        );

        self.dio.platform().output_line(pin)?.set_level(Level::High);
        let start = DoSeq::new(&self.dio, pin, 1)?;
        start.add(Level::Low, 1500)?;
        start.set_callback(
            move |_: &DoSeq| {
                *armed_at.lock().unwrap_or_else(PoisonError::into_inner) = platform.now_us();
                if let Err(err) = capture.start() {
                    info!("DHT capture not armed: {err}");
                }
            },
            DispatchMode::Task,
        );
        start.start_us()
    }

    fn dht_dump(&self, all: bool) {
        let Some(dht) = &self.dht else {
            info!("no DHT sensor configured");
            return;
        };
        let ages = if all { dht.max_events_count() } else { 1 };
        for age in 0..ages {
            let temperature = dht.temperature(age);
            let humidity = dht.humidity(age);
            if temperature.invalid {
                info!("DHT reading {age}: invalid");
            } else {
                info!(
                    "DHT reading {}: temperature {:.1} C, humidity {:.1} %, timestamp {}",
                    age, temperature.value, humidity.value, temperature.timestamp
                );
            }
            Self::report(
                &self.reports,
                BenchReport::DhtReading {
                    age,
                    temperature,
                    humidity,
                },
            );
        }
    }
}
