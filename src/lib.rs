//! `heartband-relay` library.
//!
//! The binaries (`src/main.rs`, `src/bin/heartband-export.rs`) are responsible for
//! CLI parsing and process exit codes. The relay pipeline lives in [`crate::app`]
//! where it can be tested deterministically with an injected scanner and forwarder.

pub mod advertisement;
pub mod app;
pub mod decoder;
pub mod duration;
pub mod export;
pub mod filter;
pub mod forwarder;
pub mod logging;
pub mod scanner;
pub mod shutdown;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{Advertisement, SourceId};
pub use app::{Options, RealScanner, RelayStats, RunError, ScanController, Scanner, SessionState};
pub use decoder::{DecodeError, HeartRateSample, decode_heart_rate};
pub use duration::parse_duration;
pub use filter::ArrivalFilter;
pub use forwarder::{ForwardError, Forwarder, HttpForwarder};
pub use scanner::{Backend, ScanError};
pub use shutdown::Shutdown;
