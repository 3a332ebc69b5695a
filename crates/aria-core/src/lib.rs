//! aria-core: Shared types for the aria audio engine
//!
//! Foundational types used across all aria crates: the audio sample type,
//! wall-clock time helpers and the engine error type with its stable
//! protocol codes.

mod error;
mod sample;
mod time;

pub use error::*;
pub use sample::*;
pub use time::*;
