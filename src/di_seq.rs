//! Input sequences: timestamped level transitions captured on a GPIO.
//!
//! A capture runs until `target_len` pulses are recorded or the timeout
//! timer fires, whichever enters the critical section first. Each pulse is
//! the level the line held and how long it held it, in microseconds, measured
//! from the previous edge (or from `start` for the first one).

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use critical_section::Mutex;
use log::{debug, error};

use crate::dio::Dio;
use crate::dio_task::{
    completion_mode, fire_completion, set_completion, Completion, CompletionSlot, DioEvent,
    DioQueue, DispatchMode,
};
use crate::do_seq::Pulse;
use crate::error::{DioError, Result};
use crate::gpio::{InputLine, Level, PinId, Platform};
use crate::timer::{SeqTimer, TimeUnit};

/// Handle to an input sequence. Clones share the same capture.
#[derive(Clone)]
pub struct DiSeq(Arc<Inner>);

struct Inner {
    pin: PinId,
    timeout: u32,
    unit: TimeUnit,
    platform: Arc<dyn Platform>,
    queue: Arc<DioQueue>,
    timer: Box<dyn SeqTimer>,
    state: Mutex<RefCell<State>>,
    completion: CompletionSlot<DiSeq>,
}

struct State {
    line: Box<dyn InputLine>,
    // Capacity is `target` and never grows; pushes from the edge handler
    // do not allocate.
    pulses: Vec<Pulse>,
    target: usize,
    level: Level,
    last_edge_us: u64,
    ended_by_timeout: bool,
    running: Option<DiSeq>,
}

impl DiSeq {
    /// Capture of `target_len` pulses on `pin`, abandoned after `timeout`
    /// (in `unit`) if the sensor goes quiet.
    pub fn new(
        dio: &Dio,
        pin: PinId,
        target_len: usize,
        timeout: u32,
        unit: TimeUnit,
    ) -> Result<Self> {
        if target_len == 0 {
            return Err(DioError::InvalidLength);
        }
        let mut pulses = Vec::new();
        if pulses.try_reserve_exact(target_len).is_err() {
            let requested = target_len.saturating_mul(core::mem::size_of::<Pulse>());
            error!("di_seq: GPIO{pin} cannot allocate {target_len} pulses ({requested} bytes)");
            return Err(DioError::OutOfMemory { requested });
        }
        let mut line = dio.platform().input_line(pin)?;
        let timer = dio.platform().timer("di_seq")?;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_edge = weak.clone();
            line.set_edge_callback(Box::new(move || {
                if let Some(inner) = on_edge.upgrade() {
                    DiSeq(inner).on_edge();
                }
            }));
            let on_timeout = weak.clone();
            timer.set_callback(Box::new(move || {
                if let Some(inner) = on_timeout.upgrade() {
                    DiSeq(inner).on_timeout();
                }
            }));
            Inner {
                pin,
                timeout,
                unit,
                platform: dio.platform().clone(),
                queue: dio.queue().clone(),
                timer,
                state: Mutex::new(RefCell::new(State {
                    line,
                    pulses,
                    target: target_len,
                    level: Level::High,
                    last_edge_us: 0,
                    ended_by_timeout: false,
                    running: None,
                })),
                completion: Mutex::new(RefCell::new(Completion::new())),
            }
        });
        Ok(DiSeq(inner))
    }

    pub fn set_callback<F>(&self, callback: F, mode: DispatchMode)
    where
        F: FnMut(&DiSeq) + Send + 'static,
    {
        set_completion(&self.0.completion, Box::new(callback), mode);
    }

    /// Arm the capture: pin to input with pull-up, edges on, timeout armed.
    pub fn start(&self) -> Result<()> {
        let now = self.0.platform.now_us();
        critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_some() {
                return Err(DioError::Busy);
            }
            state.line.configure();
            state.level = state.line.level();
            state.last_edge_us = now;
            state.pulses.clear();
            state.ended_by_timeout = false;
            state.running = Some(self.clone());
            state.line.enable_edges();
            self.0.timer.arm(self.0.timeout, self.0.unit, false);
            Ok(())
        })?;
        debug!(
            "di_seq: GPIO{} capturing {} pulses, timeout {}{}",
            self.0.pin,
            self.target_len(),
            self.0.timeout,
            self.0.unit
        );
        Ok(())
    }

    /// Drop captured pulses, keeping the buffer.
    pub fn clear(&self) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_some() {
                return Err(DioError::Busy);
            }
            state.pulses.clear();
            state.ended_by_timeout = false;
            Ok(())
        })
    }

    /// Disarm the timeout timer. Idempotent.
    pub fn stop_timeout(&self) {
        self.0.timer.disarm();
    }

    /// Stop capturing without raising the completion.
    pub fn abort(&self) {
        let keepalive = critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            self.0.timer.disarm();
            state.line.disable_edges();
            state.running.take()
        });
        if keepalive.is_some() {
            debug!("di_seq: GPIO{} aborted", self.0.pin);
        }
    }

    pub fn pin(&self) -> PinId {
        self.0.pin
    }

    /// Pulses captured so far.
    pub fn pulse_count(&self) -> usize {
        self.with_state(|state| state.pulses.len())
    }

    pub fn target_len(&self) -> usize {
        self.with_state(|state| state.target)
    }

    /// Timeout and the unit it is expressed in.
    pub fn timeout(&self) -> (u32, TimeUnit) {
        (self.0.timeout, self.0.unit)
    }

    pub fn ended_by_timeout(&self) -> bool {
        self.with_state(|state| state.ended_by_timeout)
    }

    pub fn is_capturing(&self) -> bool {
        self.with_state(|state| state.running.is_some())
    }

    pub fn pulse(&self, index: usize) -> Option<Pulse> {
        self.with_state(|state| state.pulses.get(index).copied())
    }

    pub fn pulse_level(&self, index: usize) -> Option<Level> {
        self.pulse(index).map(|p| p.level)
    }

    /// Microseconds.
    pub fn pulse_duration(&self, index: usize) -> Option<u32> {
        self.pulse(index).map(|p| p.duration)
    }

    pub fn pulses(&self) -> Vec<Pulse> {
        self.with_state(|state| state.pulses.clone())
    }

    pub(crate) fn fire_callback(&self) {
        fire_completion(&self.0.completion, self);
    }

    fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        critical_section::with(|cs| f(&self.0.state.borrow_ref(cs)))
    }

    fn on_edge(&self) {
        let now = self.0.platform.now_us();
        let finished = critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_none() {
                return None;
            }
            let last = state.pulses.len() + 1 >= state.target;
            if last {
                self.0.timer.disarm();
                state.line.disable_edges();
            }
            let elapsed = now.saturating_sub(state.last_edge_us);
            let pulse = Pulse::new(state.level, u32::try_from(elapsed).unwrap_or(u32::MAX));
            state.pulses.push(pulse);
            state.last_edge_us = now;
            state.level = state.line.level();
            if last {
                state.ended_by_timeout = false;
                state.running.take()
            } else {
                None
            }
        });
        if let Some(keepalive) = finished {
            self.complete(keepalive);
        }
    }

    fn on_timeout(&self) {
        let finished = critical_section::with(|cs| {
            let mut state = self.0.state.borrow_ref_mut(cs);
            if state.running.is_none() {
                return None;
            }
            state.line.disable_edges();
            state.ended_by_timeout = true;
            state.running.take()
        });
        if let Some(keepalive) = finished {
            debug!(
                "di_seq: GPIO{} timed out after {} of {} pulses",
                self.0.pin,
                self.pulse_count(),
                self.target_len()
            );
            self.complete(keepalive);
        }
    }

    fn complete(&self, keepalive: DiSeq) {
        match completion_mode(&self.0.completion) {
            DispatchMode::Direct => {
                self.fire_callback();
                drop(keepalive);
            }
            DispatchMode::Task => self.0.queue.enqueue(DioEvent::InputDone(keepalive)),
        }
    }
}

impl core::fmt::Debug for DiSeq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.with_state(|state| {
            f.debug_struct("DiSeq")
                .field("pin", &self.0.pin)
                .field("pulses", &state.pulses.len())
                .field("target", &state.target)
                .field("ended_by_timeout", &state.ended_by_timeout)
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

    fn counting(seq: &DiSeq, mode: DispatchMode) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        seq.set_callback(
            move |_: &DiSeq| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            mode,
        );
        count
    }

    #[test]
    fn zero_target_is_rejected() {
        let (_board, dio) = setup();
        assert_eq!(
            DiSeq::new(&dio, 6, 0, 10, TimeUnit::Millis).unwrap_err(),
            DioError::InvalidLength
        );
    }

    #[test]
    fn captures_levels_and_microsecond_durations() {
        let (board, dio) = setup();
        let seq = DiSeq::new(&dio, 6, 3, 20, TimeUnit::Millis).unwrap();
        let count = counting(&seq, DispatchMode::Direct);

        seq.start().unwrap();
        board.drive_at(6, Level::Low, 100);
        board.drive_at(6, Level::High, 150);
        board.drive_at(6, Level::Low, 400);
        board.advance_ms(1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!seq.ended_by_timeout());
        assert_eq!(
            seq.pulses(),
            vec![
                Pulse::new(Level::High, 100),
                Pulse::new(Level::Low, 50),
                Pulse::new(Level::High, 250),
            ]
        );
        assert!(!board.edge_enabled(6));
        board.advance_ms(50);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(board.timer_fires("di_seq"), 0);
    }

    #[test]
    fn timeout_keeps_partial_capture() {
        let (board, dio) = setup();
        let seq = DiSeq::new(&dio, 6, 9, 20, TimeUnit::Millis).unwrap();
        let count = counting(&seq, DispatchMode::Task);

        seq.start().unwrap();
        board.drive_at(6, Level::Low, 1_000);
        board.drive_at(6, Level::High, 2_000);
        board.advance_ms(19);
        assert!(seq.is_capturing());
        board.advance_ms(1);

        assert!(!seq.is_capturing());
        assert!(seq.ended_by_timeout());
        assert_eq!(seq.pulse_count(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(dio.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seq.pulse(2), None);
    }

    #[test]
    fn edge_at_the_timeout_instant_completes_once() {
        let (board, dio) = setup();
        let seq = DiSeq::new(&dio, 6, 1, 500, TimeUnit::Micros).unwrap();
        let count = counting(&seq, DispatchMode::Direct);

        // Latched before the timeout is armed, so the edge is serviced first.
        board.drive_at(6, Level::Low, 500);
        seq.start().unwrap();
        board.advance_ms(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!seq.ended_by_timeout());
        assert_eq!(seq.pulse_count(), seq.target_len());
    }

    #[test]
    fn timeout_at_the_edge_instant_completes_once() {
        let (board, dio) = setup();
        let seq = DiSeq::new(&dio, 6, 1, 500, TimeUnit::Micros).unwrap();
        let count = counting(&seq, DispatchMode::Task);

        // Timeout armed first, so it is serviced before the edge.
        seq.start().unwrap();
        board.drive_at(6, Level::Low, 500);
        board.advance_ms(2);

        assert_eq!(dio.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(seq.ended_by_timeout());
        assert_eq!(seq.pulse_count(), 0);
        assert!(!board.edge_enabled(6));
    }

    #[test]
    fn dropping_a_second_capture_on_the_pin_keeps_the_first_wired() {
        let (board, dio) = setup();
        let first = DiSeq::new(&dio, 6, 2, 20, TimeUnit::Millis).unwrap();
        let count = counting(&first, DispatchMode::Direct);
        drop(DiSeq::new(&dio, 6, 2, 20, TimeUnit::Millis).unwrap());
        assert!(board.edge_handler_installed(6));

        first.start().unwrap();
        board.drive_at(6, Level::Low, 100);
        board.drive_at(6, Level::High, 300);
        board.advance_ms(1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!first.ended_by_timeout());
        assert_eq!(
            first.pulses(),
            vec![Pulse::new(Level::High, 100), Pulse::new(Level::Low, 200)]
        );

        drop(first);
        assert!(!board.edge_handler_installed(6));
    }

    #[test]
    fn two_captures_on_one_pin_both_see_edges() {
        let (board, dio) = setup();
        let long = DiSeq::new(&dio, 6, 3, 20, TimeUnit::Millis).unwrap();
        let short = DiSeq::new(&dio, 6, 1, 20, TimeUnit::Millis).unwrap();
        let long_done = counting(&long, DispatchMode::Direct);
        let short_done = counting(&short, DispatchMode::Direct);

        long.start().unwrap();
        short.start().unwrap();
        board.drive_at(6, Level::Low, 100);
        board.drive_at(6, Level::High, 200);
        board.drive_at(6, Level::Low, 300);
        board.advance_ms(1);

        assert_eq!(short_done.load(Ordering::SeqCst), 1);
        assert_eq!(short.pulse_count(), 1);
        assert_eq!(long_done.load(Ordering::SeqCst), 1);
        assert_eq!(long.pulse_count(), 3);
        assert!(!board.edge_enabled(6));
    }

    #[test]
    fn restart_gives_a_fresh_capture() {
        let (board, dio) = setup();
        let seq = DiSeq::new(&dio, 6, 2, 5, TimeUnit::Millis).unwrap();
        let count = counting(&seq, DispatchMode::Direct);

        seq.start().unwrap();
        assert_eq!(seq.start(), Err(DioError::Busy));
        board.drive_at(6, Level::Low, 100);
        board.advance_ms(5);
        assert!(seq.ended_by_timeout());
        assert_eq!(seq.pulse_count(), 1);

        seq.clear().unwrap();
        assert_eq!(seq.pulse_count(), 0);
        let t0 = board.now_us();
        seq.start().unwrap();
        board.drive_at(6, Level::High, t0 + 30);
        board.drive_at(6, Level::Low, t0 + 60);
        board.advance_ms(1);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!seq.ended_by_timeout());
        assert_eq!(
            seq.pulses(),
            vec![Pulse::new(Level::Low, 30), Pulse::new(Level::High, 30)]
        );
    }

    #[test]
    fn abort_disables_edges_silently() {
        let (board, dio) = setup();
        let seq = DiSeq::new(&dio, 6, 4, 10, TimeUnit::Millis).unwrap();
        let count = counting(&seq, DispatchMode::Direct);

        seq.start().unwrap();
        assert!(board.edge_enabled(6));
        seq.abort();
        assert!(!board.edge_enabled(6));
        board.drive_at(6, Level::Low, board.now_us() + 10);
        board.advance_ms(20);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(seq.pulse_count(), 0);
    }

    #[test]
    fn looped_back_output_is_captured() {
        use crate::do_seq::DoSeq;

        let (board, dio) = setup();
        board.wire(5, 6);
        let input = DiSeq::new(&dio, 6, 3, 20, TimeUnit::Millis).unwrap();
        let count = counting(&input, DispatchMode::Direct);
        let output = DoSeq::new(&dio, 5, 3).unwrap();
        output.add(Level::Low, 1000).unwrap();
        output.add(Level::High, 2000).unwrap();
        output.add(Level::Low, 3000).unwrap();

        input.start().unwrap();
        output.start_us().unwrap();
        board.advance_ms(10);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let durations: Vec<u32> = input.pulses().iter().map(|p| p.duration).collect();
        assert_eq!(durations, vec![0, 1000, 2000]);
        assert_eq!(input.pulse_level(1), Some(Level::Low));
    }
}
