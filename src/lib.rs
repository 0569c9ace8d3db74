// Library interface for the tape-server daemon
// The binary, tests and benchmarks all go through these modules

pub mod daemon;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod signal;
