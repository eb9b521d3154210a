//! Logging initialization.
//!
//! The library itself only uses the `log` facade — including for GPU
//! debug/validation output, which backends route through the same channel
//! tagged with the originating call. Applications that want output on
//! stderr call [`init_logging`] early in `main`.

mod init;

pub use init::{LoggingConfig, init_logging};
