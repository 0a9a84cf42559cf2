//! Engine process management.

pub mod process;

pub use process::{EngineError, EngineProcess, EngineSettings};
