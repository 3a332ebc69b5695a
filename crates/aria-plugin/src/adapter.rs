//! Typed adapter over the raw descriptor
//!
//! Lets a plugin be written as a plain Rust type; `synth_def` derives the
//! raw fn-pointer descriptor from monomorphized shims. Instances are
//! placement-constructed into engine-provided arena memory and destroyed
//! on the worker thread, hence the `Send` bound.

use std::mem;
use std::ptr;

use aria_core::Sample;
use rosc::OscType;

use crate::{PortDescriptor, SynthDef, World};

/// Construction parameters decoded from the `/synth/new` argument stream
///
/// Options are copied into a raw buffer owned by the engine, so they must
/// be `Copy` (nothing to drop).
pub trait SynthOptions: Copy + 'static {
    fn from_args(args: &[OscType]) -> Self;
}

impl SynthOptions for () {
    fn from_args(_args: &[OscType]) -> Self {}
}

/// A synth plugin written as a plain Rust type
pub trait SynthPlugin: Send + Sized + 'static {
    type Options: SynthOptions;

    /// Describe port `index`, `None` past the end
    fn port(options: &Self::Options, index: usize) -> Option<PortDescriptor>;

    /// Construct an instance
    fn new(world: &mut World, options: &Self::Options) -> Self;

    /// Bind a port to a sample buffer
    fn connect(&mut self, port: usize, data: *mut Sample);

    /// Produce audio / advance state for `num_frames`
    fn process(&mut self, world: &mut World, num_frames: usize);
}

/// Derive the raw descriptor for a plugin type
pub fn synth_def<P: SynthPlugin>(uri: &'static str) -> SynthDef {
    SynthDef {
        uri,
        instance_size: mem::size_of::<P>(),
        instance_align: mem::align_of::<P>(),
        options_size: mem::size_of::<P::Options>(),
        options_align: mem::align_of::<P::Options>(),
        configure: configure_shim::<P>,
        port_descriptor: port_shim::<P>,
        construct: construct_shim::<P>,
        connect: connect_shim::<P>,
        process: process_shim::<P>,
        destroy: Some(destroy_shim::<P>),
    }
}

fn configure_shim<P: SynthPlugin>(args: &[OscType], options: *mut ()) {
    // SAFETY: the engine provides a buffer of at least `options_size`
    // bytes with `options_align` alignment.
    unsafe { (options as *mut P::Options).write(P::Options::from_args(args)) }
}

fn port_shim<P: SynthPlugin>(options: *const (), index: usize) -> Option<PortDescriptor> {
    // SAFETY: `options` was written by `configure_shim` for this type.
    let options = unsafe { &*(options as *const P::Options) };
    P::port(options, index)
}

fn construct_shim<P: SynthPlugin>(world: &mut World, options: *const (), instance: *mut ()) {
    // SAFETY: `instance` points to `instance_size` bytes with
    // `instance_align` alignment; `options` as in `port_shim`.
    unsafe {
        let options = &*(options as *const P::Options);
        (instance as *mut P).write(P::new(world, options));
    }
}

fn connect_shim<P: SynthPlugin>(instance: *mut (), port: usize, data: *mut Sample) {
    // SAFETY: `instance` was initialized by `construct_shim`.
    unsafe { (*(instance as *mut P)).connect(port, data) }
}

fn process_shim<P: SynthPlugin>(world: &mut World, instance: *mut (), num_frames: usize) {
    // SAFETY: as in `connect_shim`.
    unsafe { (*(instance as *mut P)).process(world, num_frames) }
}

fn destroy_shim<P: SynthPlugin>(instance: *mut ()) {
    // SAFETY: called exactly once, after the instance is unreachable from
    // the audio thread.
    unsafe { ptr::drop_in_place(instance as *mut P) }
}
