//! aria-plugin: Plugin ABI for the aria audio engine
//!
//! The contract between the engine and synth plugins is a C-style
//! descriptor of plain function pointers plus two opaque handles:
//! [`World`] on the audio side and [`Host`] on the worker side. There is
//! no trait-object dispatch across the boundary; the [`adapter`] module
//! provides a typed layer for writing plugins as ordinary Rust types.

mod adapter;
mod builtin;
mod def;
mod host;

pub use adapter::*;
pub use builtin::*;
pub use def::*;
pub use host::*;
