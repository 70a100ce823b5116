//! One-shot / periodic timer used to pace sequences.
//!
//! Two resolutions are exposed. Millisecond pacing is for human-scale
//! pulse trains and expires in task context. Microsecond pacing is for
//! protocol pulses well below a millisecond; on the target it expires
//! straight from the timer interrupt, so callbacks armed in microseconds
//! (and Direct completions of microsecond sequences) run in interrupt
//! context and must not block.

use core::fmt;

/// Invoked on timer expiry, in timer context.
pub type TimerCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    #[default]
    Millis,
    Micros,
}

impl TimeUnit {
    pub fn to_micros(self, interval: u32) -> u64 {
        match self {
            TimeUnit::Millis => u64::from(interval) * 1_000,
            TimeUnit::Micros => u64::from(interval),
        }
    }

    /// Whether expiries at this resolution are delivered from the timer
    /// interrupt rather than from a timer task.
    pub fn interrupt_dispatch(self) -> bool {
        self == TimeUnit::Micros
    }

    pub fn suffix(self) -> &'static str {
        match self {
            TimeUnit::Millis => "ms",
            TimeUnit::Micros => "us",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Control plane of a hardware timer owned by exactly one user.
///
/// `arm` replaces any pending expiry and `disarm` is idempotent; neither
/// reports errors.
pub trait SeqTimer: Send + Sync {
    fn arm(&self, interval: u32, unit: TimeUnit, repeat: bool);
    fn disarm(&self);
    fn set_callback(&self, callback: TimerCallback);
}
