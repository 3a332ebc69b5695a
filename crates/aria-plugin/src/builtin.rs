//! Bundled plugins
//!
//! A small set of synths registered by [`builtin_library`], used by the
//! engine's own tests and useful as reference implementations of the
//! plugin contract.

use aria_core::Sample;
use rosc::OscType;

use crate::{
    synth_def, Host, Library, PortDescriptor, SynthOptions, SynthPlugin, World,
};

/// Sine oscillator: 1 audio output, control inputs {0: freq Hz, 1: amp}
pub const SINE_URI: &str = "aria.sine";
/// Writes silence to its single audio output
pub const SILENCE_URI: &str = "aria.silence";
/// No ports; flags itself done after a configured number of seconds
pub const DONE_AFTER_URI: &str = "aria.done-after";

/// Library entry registering all bundled plugins
pub fn builtin_library(host: &mut Host) -> Library {
    host.register_synth_def(synth_def::<Sine>(SINE_URI));
    host.register_synth_def(synth_def::<Silence>(SILENCE_URI));
    host.register_synth_def(synth_def::<DoneAfter>(DONE_AFTER_URI));
    Library::default()
}

// ---------------------------------------------------------------------------
// Sine
// ---------------------------------------------------------------------------

struct Sine {
    phase: f64,
    out: *mut Sample,
    freq: *mut Sample,
    amp: *mut Sample,
}

// SAFETY: port pointers reference engine-owned buffers that outlive the
// instance; the instance itself is only dropped on the worker after the
// audio thread has unlinked it.
unsafe impl Send for Sine {}

impl SynthPlugin for Sine {
    type Options = ();

    fn port(_options: &(), index: usize) -> Option<PortDescriptor> {
        match index {
            0 => Some(PortDescriptor::audio_out()),
            1 | 2 => Some(PortDescriptor::control_in()),
            _ => None,
        }
    }

    fn new(_world: &mut World, _options: &()) -> Self {
        Self {
            phase: 0.0,
            out: std::ptr::null_mut(),
            freq: std::ptr::null_mut(),
            amp: std::ptr::null_mut(),
        }
    }

    fn connect(&mut self, port: usize, data: *mut Sample) {
        match port {
            0 => self.out = data,
            1 => self.freq = data,
            2 => self.amp = data,
            _ => {}
        }
    }

    fn process(&mut self, world: &mut World, num_frames: usize) {
        // SAFETY: the engine connects every port before the first process
        // call and the buffers are valid for `num_frames` frames.
        let (freq, amp, out) = unsafe {
            (
                *self.freq as f64,
                *self.amp,
                std::slice::from_raw_parts_mut(self.out, num_frames),
            )
        };
        let step = std::f64::consts::TAU * freq / world.sample_rate();
        for sample in out {
            *sample = self.phase.sin() as Sample * amp;
            self.phase += step;
            if self.phase >= std::f64::consts::TAU {
                self.phase -= std::f64::consts::TAU;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Silence
// ---------------------------------------------------------------------------

struct Silence {
    out: *mut Sample,
}

// SAFETY: see `Sine`.
unsafe impl Send for Silence {}

impl SynthPlugin for Silence {
    type Options = ();

    fn port(_options: &(), index: usize) -> Option<PortDescriptor> {
        (index == 0).then(PortDescriptor::audio_out)
    }

    fn new(_world: &mut World, _options: &()) -> Self {
        Self {
            out: std::ptr::null_mut(),
        }
    }

    fn connect(&mut self, port: usize, data: *mut Sample) {
        if port == 0 {
            self.out = data;
        }
    }

    fn process(&mut self, _world: &mut World, num_frames: usize) {
        // SAFETY: see `Sine::process`.
        unsafe { std::slice::from_raw_parts_mut(self.out, num_frames) }.fill(0.0);
    }
}

// ---------------------------------------------------------------------------
// DoneAfter
// ---------------------------------------------------------------------------

/// Seconds until the synth reports completion
#[derive(Clone, Copy)]
pub struct DoneAfterOptions {
    pub seconds: f32,
}

impl SynthOptions for DoneAfterOptions {
    fn from_args(args: &[OscType]) -> Self {
        let seconds = match args.first() {
            Some(OscType::Float(s)) => *s,
            _ => 0.0,
        };
        Self { seconds }
    }
}

struct DoneAfter {
    frames_left: f64,
    done: bool,
}

impl SynthPlugin for DoneAfter {
    type Options = DoneAfterOptions;

    fn port(_options: &DoneAfterOptions, _index: usize) -> Option<PortDescriptor> {
        None
    }

    fn new(world: &mut World, options: &DoneAfterOptions) -> Self {
        Self {
            frames_left: options.seconds as f64 * world.sample_rate(),
            done: false,
        }
    }

    fn connect(&mut self, _port: usize, _data: *mut Sample) {}

    fn process(&mut self, world: &mut World, num_frames: usize) {
        if !self.done {
            self.frames_left -= num_frames as f64;
            if self.frames_left <= 0.0 {
                self.done = true;
                world.synth_done(self as *mut Self as *mut ());
            }
        }
    }
}
