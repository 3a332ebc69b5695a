//! Synth definition descriptor and port metadata

use aria_core::Sample;
use rosc::OscType;

use crate::{Host, World};

/// Upper bound on the options buffer a `configure` call may fill
pub const MAX_OPTIONS_SIZE: usize = 256;
/// Upper bound on options alignment
pub const MAX_OPTIONS_ALIGN: usize = 16;
/// Upper bound on declared ports per synth definition
pub const MAX_PORTS: usize = 64;

/// Port direction and signal kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    AudioIn,
    AudioOut,
    ControlIn,
    ControlOut,
}

/// Port flag bits
pub type PortFlags = u32;

pub const PORT_FLAG_NONE: PortFlags = 0;
/// Control input resets to zero after every processed block
pub const PORT_FLAG_TRIGGER: PortFlags = 1;

/// Metadata for one declared port
#[derive(Debug, Clone, Copy)]
pub struct PortDescriptor {
    pub kind: PortKind,
    pub flags: PortFlags,
}

impl PortDescriptor {
    pub const fn audio_in() -> Self {
        Self {
            kind: PortKind::AudioIn,
            flags: PORT_FLAG_NONE,
        }
    }

    pub const fn audio_out() -> Self {
        Self {
            kind: PortKind::AudioOut,
            flags: PORT_FLAG_NONE,
        }
    }

    pub const fn control_in() -> Self {
        Self {
            kind: PortKind::ControlIn,
            flags: PORT_FLAG_NONE,
        }
    }

    pub const fn control_out() -> Self {
        Self {
            kind: PortKind::ControlOut,
            flags: PORT_FLAG_NONE,
        }
    }

    pub const fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Decode construction parameters from an OSC argument stream into the
/// caller-provided options buffer
pub type ConfigureFn = fn(args: &[OscType], options: *mut ());

/// Describe port `index`, or `None` past the last port
pub type PortDescriptorFn = fn(options: *const (), index: usize) -> Option<PortDescriptor>;

/// Placement-construct the synth instance
pub type ConstructFn = fn(world: &mut World, options: *const (), instance: *mut ());

/// Bind a port to a sample buffer
pub type ConnectFn = fn(instance: *mut (), port: usize, data: *mut Sample);

/// Produce `num_frames` frames of audio and/or advance internal state
pub type ProcessFn = fn(world: &mut World, instance: *mut (), num_frames: usize);

/// Optional in-place destructor, invoked on the worker thread
pub type DestroyFn = fn(instance: *mut ());

/// Worker-side continuation posted from the audio thread
pub type HostPerformFn = fn(host: &mut Host, data: *mut ());

/// Audio-side continuation posted from the worker thread
pub type WorldPerformFn = fn(world: &mut World, data: *mut ());

/// Registered plugin descriptor
///
/// Registered once per plugin load through [`Host::register_synth_def`]
/// and immutable thereafter. Ports may depend on the decoded options, so
/// port counts are established per instance, not at registration.
#[derive(Clone)]
pub struct SynthDef {
    pub uri: &'static str,
    pub instance_size: usize,
    pub instance_align: usize,
    pub options_size: usize,
    pub options_align: usize,
    pub configure: ConfigureFn,
    pub port_descriptor: PortDescriptorFn,
    pub construct: ConstructFn,
    pub connect: ConnectFn,
    pub process: ProcessFn,
    pub destroy: Option<DestroyFn>,
}

impl SynthDef {
    /// Count ports of each kind for the given decoded options
    ///
    /// Returns `(audio_in, audio_out, control_in, control_out)`.
    pub fn count_ports(&self, options: *const ()) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for index in 0..MAX_PORTS {
            match (self.port_descriptor)(options, index) {
                Some(port) => match port.kind {
                    PortKind::AudioIn => counts.0 += 1,
                    PortKind::AudioOut => counts.1 += 1,
                    PortKind::ControlIn => counts.2 += 1,
                    PortKind::ControlOut => counts.3 += 1,
                },
                None => break,
            }
        }
        counts
    }
}

impl std::fmt::Debug for SynthDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthDef")
            .field("uri", &self.uri)
            .field("instance_size", &self.instance_size)
            .field("instance_align", &self.instance_align)
            .field("options_size", &self.options_size)
            .finish_non_exhaustive()
    }
}
