//! Pin-level seam between the sequencing engine and the board.
//!
//! The engine never touches registers itself: it drives [`OutputLine`]s,
//! listens on [`InputLine`]s and paces itself with timers, all handed out by
//! a [`Platform`]. The ESP-IDF backend lives in `esp`, the host test board in
//! `sim`.

use core::fmt;
use core::ops::Not;

use crate::dio_task::{CondvarDoorbell, Doorbell};
use crate::error::Result;
use crate::timer::SeqTimer;

/// GPIO number, as used by the ESP-IDF `gpio_*` calls.
pub type PinId = i32;

/// Invoked from the edge interrupt of an [`InputLine`].
pub type EdgeCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, " LOW"),
            Level::High => write!(f, "HIGH"),
        }
    }
}

/// A pin the engine drives. Setting a level also (re)configures the pin as
/// an output, so a pin shared with an [`InputLine`] can be turned around.
pub trait OutputLine: Send {
    fn set_level(&mut self, level: Level);
}

/// A pin the engine samples, with a both-edges interrupt.
///
/// The edge callback runs in interrupt context and must stay short.
pub trait InputLine: Send {
    /// Switch the pin to input with pull-up.
    fn configure(&mut self);
    fn level(&self) -> Level;
    fn set_edge_callback(&mut self, on_edge: EdgeCallback);
    fn enable_edges(&mut self);
    /// Idempotent.
    fn disable_edges(&mut self);
}

/// Everything the engine needs from the hardware.
pub trait Platform: Send + Sync {
    /// Free-running microsecond clock.
    fn now_us(&self) -> u64;

    /// Seconds timestamp stored with sensor readings.
    fn timestamp(&self) -> u32 {
        (self.now_us() / 1_000_000) as u32
    }

    fn output_line(&self, pin: PinId) -> Result<Box<dyn OutputLine>>;

    fn input_line(&self, pin: PinId) -> Result<Box<dyn InputLine>>;

    fn timer(&self, name: &'static str) -> Result<Box<dyn SeqTimer>>;

    /// Wake-up primitive for the deferred dispatch worker. Must be safe to
    /// ring from interrupt context on the target.
    fn doorbell(&self) -> Result<Box<dyn Doorbell>> {
        Ok(Box::new(CondvarDoorbell::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_flips_and_converts() {
        assert_eq!(!Level::Low, Level::High);
        assert_eq!(!Level::High, Level::Low);
        assert_eq!(Level::from(true), Level::High);
        assert!(!Level::from(false).is_high());
    }

    #[test]
    fn level_display_is_aligned() {
        assert_eq!(format!("'{}'", Level::Low), "' LOW'");
        assert_eq!(format!("'{}'", Level::High), "'HIGH'");
    }
}
