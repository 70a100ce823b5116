//! Output sequences: a GPIO driven through a programmed list of
//! `(level, duration)` steps, paced by a one-shot timer.
//!
//! Each timer expiry advances the cursor, drives the next level and re-arms
//! the timer for that step's duration. When the cursor reaches the end the
//! pin is left at the last programmed level and the completion is raised.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use critical_section::Mutex;
use log::{debug, error};

use crate::dio::Dio;
use crate::dio_task::{
    completion_mode, fire_completion, set_completion, Completion, CompletionSlot, DioEvent,
    DioQueue, DispatchMode,
};
use crate::error::{DioError, Result};
use crate::gpio::{Level, OutputLine, PinId};
use crate::timer::{SeqTimer, TimeUnit};

/// One step of an output sequence, or one captured pulse of an input
/// sequence (captured durations are always microseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub level: Level,
    pub duration: u32,
}

impl Pulse {
    pub fn new(level: Level, duration: u32) -> Self {
        Self { level, duration }
    }
}

/// Handle to an output sequence. Clones share the same sequence.
#[derive(Clone)]
pub struct DoSeq(Arc<Inner>);

struct Inner {
    pin: PinId,
    queue: Arc<DioQueue>,
    timer: Box<dyn SeqTimer>,
    state: Mutex<RefCell<State>>,
    completion: CompletionSlot<DoSeq>,
}

struct State {
    line: Box<dyn OutputLine>,
    steps: Vec<Pulse>,
    capacity: usize,
    cursor: usize,
    unit: TimeUnit,
    // Strong self-handle while running, released on completion or abort.
    running: Option<DoSeq>,
}

impl DoSeq {
    /// Sequence on `pin` with room for `len` steps.
    pub fn new(dio: &Dio, pin: PinId, len: usize) -> Result<Self> {
        let mut steps = Vec::new();
        if steps.try_reserve_exact(len).is_err() {
            let requested = len.saturating_mul(core::mem::size_of::<Pulse>());
            error!("do_seq: GPIO{pin} cannot allocate {len} steps ({requested} bytes)");
            return Err(DioError::OutOfMemory { requested });
        }
        let line = dio.platform().output_line(pin)?;
        let timer = dio.platform().timer("do_seq")?;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            timer.set_callback(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    DoSeq(inner).on_timer();
                }
            }));
            Inner {
                pin,
                queue: dio.queue().clone(),
                timer,
                state: Mutex::new(RefCell::new(State {
                    line,
                    steps,
                    capacity: len,
                    cursor: 0,
                    unit: TimeUnit::default(),
                    running: None,
                })),
                completion: Mutex::new(RefCell::new(Completion::new())),
            }
        });
        Ok(DoSeq(inner))
    }

    /// Append a step. Durations are interpreted in the unit chosen at start.
    pub fn add(&self, level: Level, duration: u32) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_some() {
                return Err(DioError::Busy);
            }
            if state.steps.len() >= state.capacity {
                return Err(DioError::CapacityExceeded {
                    capacity: state.capacity,
                });
            }
            state.steps.push(Pulse::new(level, duration));
            Ok(())
        })
    }

    /// Forget every step, keeping the allocation.
    pub fn clear(&self) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_some() {
                return Err(DioError::Busy);
            }
            state.steps.clear();
            state.cursor = 0;
            Ok(())
        })
    }

    /// Register the completion callback and where it runs.
    pub fn set_callback<F>(&self, callback: F, mode: DispatchMode)
    where
        F: FnMut(&DoSeq) + Send + 'static,
    {
        set_completion(&self.0.completion, Box::new(callback), mode);
    }

    pub fn start_ms(&self) -> Result<()> {
        self.start(TimeUnit::Millis)
    }

    pub fn start_us(&self) -> Result<()> {
        self.start(TimeUnit::Micros)
    }

    fn start(&self, unit: TimeUnit) -> Result<()> {
        let len = critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_some() {
                return Err(DioError::Busy);
            }
            state.unit = unit;
            state.cursor = 0;
            // An empty sequence still completes through one zero-length timer cycle.
            let interval = match state.steps.first().copied() {
                Some(step) => {
                    state.line.set_level(step.level);
                    step.duration
                }
                None => 0,
            };
            state.running = Some(self.clone());
            self.0.timer.arm(interval, unit, false);
            Ok(state.steps.len())
        })?;
        debug!("do_seq: GPIO{} started, {} steps in {}", self.0.pin, len, unit);
        Ok(())
    }

    /// Stop pacing and drop the sequence without raising its completion.
    pub fn abort(&self) {
        let keepalive = critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            self.0.timer.disarm();
            state.running.take()
        });
        if keepalive.is_some() {
            debug!("do_seq: GPIO{} aborted", self.0.pin);
        }
    }

    pub fn pin(&self) -> PinId {
        self.0.pin
    }

    /// Number of programmed steps.
    pub fn len(&self) -> usize {
        self.with_state(|state| state.steps.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.with_state(|state| state.capacity)
    }

    /// Index of the step being played; equals `len()` once finished.
    pub fn cursor(&self) -> usize {
        self.with_state(|state| state.cursor)
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|state| state.running.is_some())
    }

    /// Unit of the most recent start.
    pub fn unit(&self) -> TimeUnit {
        self.with_state(|state| state.unit)
    }

    pub fn pulse(&self, index: usize) -> Option<Pulse> {
        self.with_state(|state| state.steps.get(index).copied())
    }

    pub fn pulse_level(&self, index: usize) -> Option<Level> {
        self.pulse(index).map(|p| p.level)
    }

    pub fn pulse_duration(&self, index: usize) -> Option<u32> {
        self.pulse(index).map(|p| p.duration)
    }

    pub fn pulses(&self) -> Vec<Pulse> {
        self.with_state(|state| state.steps.clone())
    }

    pub(crate) fn fire_callback(&self) {
        fire_completion(&self.0.completion, self);
    }

    fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        critical_section::with(|cs| f(&self.0.state.borrow_ref(cs)))
    }

    fn on_timer(&self) {
        let finished = critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_none() {
                return None;
            }
            let next = state.cursor + 1;
            if next >= state.steps.len() {
                state.cursor = state.steps.len();
                self.0.timer.disarm();
                return state.running.take();
            }
            state.cursor = next;
            let step = state.steps[next];
            state.line.set_level(step.level);
            let unit = state.unit;
            self.0.timer.arm(step.duration, unit, false);
            None
        });
        if let Some(keepalive) = finished {
            self.complete(keepalive);
        }
    }

    fn complete(&self, keepalive: DoSeq) {
        match completion_mode(&self.0.completion) {
            DispatchMode::Direct => {
                self.fire_callback();
                drop(keepalive);
            }
            DispatchMode::Task => self.0.queue.enqueue(DioEvent::OutputDone(keepalive)),
        }
    }
}

impl core::fmt::Debug for DoSeq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.with_state(|state| {
            f.debug_struct("DoSeq")
                .field("pin", &self.0.pin)
                .field("len", &state.steps.len())
                .field("cursor", &state.cursor)
                .field("running", &state.running.is_some())
                .finish()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (SimBoard, Dio) {
        let board = SimBoard::new();
        let dio = Dio::new(Arc::new(board.clone())).unwrap();
        (board, dio)
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&DoSeq) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        (count, move |_: &DoSeq| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn plays_steps_on_the_millisecond_timeline() {
        let (board, dio) = setup();
        let seq = DoSeq::new(&dio, 5, 3).unwrap();
        seq.add(Level::Low, 1000).unwrap();
        seq.add(Level::High, 1500).unwrap();
        seq.add(Level::Low, 2000).unwrap();
        let (count, cb) = counter();
        seq.set_callback(cb, DispatchMode::Direct);

        seq.start_ms().unwrap();
        assert_eq!(board.level(5), Level::Low);
        board.advance_ms(999);
        assert_eq!(board.level(5), Level::Low);
        board.advance_ms(1);
        assert_eq!(board.level(5), Level::High);
        assert_eq!(seq.cursor(), 1);
        board.advance_ms(1499);
        assert_eq!(board.level(5), Level::High);
        board.advance_ms(1);
        assert_eq!(board.level(5), Level::Low);
        board.advance_ms(1999);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        board.advance_ms(1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seq.cursor(), 3);
        assert!(!seq.is_running());
        assert_eq!(board.timer_fires("do_seq"), 3);
        assert_eq!(
            board.trace_of(5),
            vec![(0, Level::Low), (1_000_000, Level::High), (2_500_000, Level::Low)]
        );
    }

    #[test]
    fn single_microsecond_step_completes_once() {
        let (board, dio) = setup();
        let seq = DoSeq::new(&dio, 4, 1).unwrap();
        seq.add(Level::Low, 5).unwrap();
        let (count, cb) = counter();
        seq.set_callback(cb, DispatchMode::Direct);

        seq.start_us().unwrap();
        assert_eq!(seq.unit(), TimeUnit::Micros);
        board.advance_us(4);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        board.advance_us(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        board.advance_ms(10);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(board.level(4), Level::Low);
    }

    #[test]
    fn empty_sequence_completes_without_touching_the_pin() {
        let (board, dio) = setup();
        let seq = DoSeq::new(&dio, 4, 0).unwrap();
        let (count, cb) = counter();
        seq.set_callback(cb, DispatchMode::Direct);

        seq.start_ms().unwrap();
        board.advance_us(1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seq.cursor(), 0);
        assert!(board.trace_of(4).is_empty());
    }

    #[test]
    fn add_rejects_overflow_and_running_sequences() {
        let (_board, dio) = setup();
        let seq = DoSeq::new(&dio, 4, 1).unwrap();
        seq.add(Level::High, 10).unwrap();
        assert_eq!(
            seq.add(Level::Low, 10),
            Err(DioError::CapacityExceeded { capacity: 1 })
        );

        seq.start_ms().unwrap();
        assert_eq!(seq.start_ms(), Err(DioError::Busy));
        assert_eq!(seq.clear(), Err(DioError::Busy));
    }

    #[test]
    fn abort_is_silent() {
        let (board, dio) = setup();
        let seq = DoSeq::new(&dio, 4, 2).unwrap();
        seq.add(Level::Low, 10).unwrap();
        seq.add(Level::High, 10).unwrap();
        let (count, cb) = counter();
        seq.set_callback(cb, DispatchMode::Direct);

        seq.start_ms().unwrap();
        board.advance_ms(5);
        seq.abort();
        board.advance_ms(50);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!seq.is_running());
        assert_eq!(board.level(4), Level::Low);
    }

    #[test]
    fn restart_after_completion_replays_the_steps() {
        let (board, dio) = setup();
        let seq = DoSeq::new(&dio, 4, 2).unwrap();
        seq.add(Level::Low, 3).unwrap();
        seq.add(Level::High, 3).unwrap();
        let (count, cb) = counter();
        seq.set_callback(cb, DispatchMode::Task);

        seq.start_ms().unwrap();
        board.advance_ms(6);
        assert_eq!(dio.run_pending(), 1);
        seq.start_ms().unwrap();
        board.advance_ms(6);
        assert_eq!(dio.run_pending(), 1);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(board.timer_fires("do_seq"), 4);
    }

    #[test]
    fn dropped_handle_still_completes() {
        let (board, dio) = setup();
        let (count, cb) = counter();
        {
            let seq = DoSeq::new(&dio, 4, 1).unwrap();
            seq.add(Level::High, 2).unwrap();
            seq.set_callback(cb, DispatchMode::Task);
            seq.start_ms().unwrap();
        }
        board.advance_ms(2);
        dio.run_pending();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn direct_callback_may_restart_its_own_sequence() {
        let (board, dio) = setup();
        let seq = DoSeq::new(&dio, 4, 1).unwrap();
        seq.add(Level::Low, 1).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();
        seq.set_callback(
            move |s: &DoSeq| {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    s.start_ms().unwrap();
                }
            },
            DispatchMode::Direct,
        );

        seq.start_ms().unwrap();
        board.advance_ms(10);

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(!seq.is_running());
    }

    #[test]
    fn accessors_report_programmed_steps() {
        let (_board, dio) = setup();
        let seq = DoSeq::new(&dio, 7, 4).unwrap();
        seq.add(Level::High, 20).unwrap();
        seq.add(Level::Low, 30).unwrap();

        assert_eq!(seq.len(), 2);
        assert_eq!(seq.capacity(), 4);
        assert_eq!(seq.pulse(1), Some(Pulse::new(Level::Low, 30)));
        assert_eq!(seq.pulse_level(0), Some(Level::High));
        assert_eq!(seq.pulse_duration(0), Some(20));
        assert_eq!(seq.pulse(2), None);
        seq.clear().unwrap();
        assert!(seq.is_empty());
    }
}
