use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DioError {
    /// Buffer allocation for a sequence failed.
    OutOfMemory { requested: usize },
    /// `add` on an output sequence that already holds `capacity` steps.
    CapacityExceeded { capacity: usize },
    /// The sequence is executing; stop it or wait for completion first.
    Busy,
    /// An input sequence needs at least one pulse to capture.
    InvalidLength,
    /// The platform could not provide a pin, timer or doorbell.
    Platform(String),
}

impl fmt::Display for DioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => write!(f, "heap exhausted ({requested} bytes)"),
            Self::CapacityExceeded { capacity } => {
                write!(f, "sequence full ({capacity} steps)")
            }
            Self::Busy => write!(f, "sequence is running"),
            Self::InvalidLength => write!(f, "sequence length must be at least 1"),
            Self::Platform(msg) => write!(f, "platform error: {msg}"),
        }
    }
}

impl std::error::Error for DioError {}

pub type Result<T> = core::result::Result<T, DioError>;
