//! Software-timed digital I/O sequencing for ESP-IDF boards.
//!
//! [`DoSeq`] drives a pin through programmed `(level, duration)` steps,
//! [`DiSeq`] records timestamped transitions on a pin, and completions are
//! handed to a worker task through the [`dio_task`] queue. The DHT and
//! MAX6675 drivers in [`sensors`] are built on those two primitives.
//!
//! Everything above [`gpio::Platform`] is hardware independent; the host
//! test-suite runs it on the simulated board behind the `sim` feature.

pub mod bench;
pub mod config;
pub mod di_seq;
pub mod dio;
pub mod dio_task;
pub mod do_seq;
#[cfg(any(test, feature = "sim", target_os = "espidf"))]
mod edge;
pub mod error;
pub mod gpio;
pub mod http;
pub mod sensors;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod timer;

#[cfg(target_os = "espidf")]
pub mod board;
#[cfg(target_os = "espidf")]
pub mod esp;

pub use di_seq::DiSeq;
pub use dio::Dio;
pub use dio_task::{DioEvent, DispatchMode};
pub use do_seq::{DoSeq, Pulse};
pub use error::{DioError, Result};
pub use gpio::{Level, PinId, Platform};
pub use timer::TimeUnit;
