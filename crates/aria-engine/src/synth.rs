//! Synth instances: per-node plugin state, connections and processing
//!
//! Everything a synth owns at runtime lives in a single chunk carved from
//! the real-time arena: the plugin instance payload, the port metadata,
//! the control value array, the connection arrays and the per-port scratch
//! buffers. The `SynthState` header in the node slot only holds pointers
//! into that chunk, so moving the node between slots is cheap and safe.

use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use aria_core::{silence, EngineError, EngineResult, Sample};
use aria_plugin::{
    DestroyFn, PortDescriptor, PortKind, SynthDef, MAX_OPTIONS_ALIGN, MAX_OPTIONS_SIZE,
    PORT_FLAG_TRIGGER,
};
use rosc::OscType;

use crate::bus::BusBinding;
use crate::environment::RtContext;

/// Bus mapping wire flag: bus id addresses the external bus space
pub const BUS_MAPPING_EXTERNAL: i32 = 1;
/// Bus mapping wire flag: input reads the previous block (feedback)
pub const BUS_MAPPING_FEEDBACK: i32 = 2;
/// Bus mapping wire flag: output overwrites instead of accumulating
pub const BUS_MAPPING_REPLACE: i32 = 4;

const FLAG_AUDIO_IN_CHANGED: u32 = 1 << 0;
const FLAG_AUDIO_OUT_CHANGED: u32 = 1 << 1;
const FLAG_CONTROL_IN_CHANGED: u32 = 1 << 2;
const FLAG_CONTROL_OUT_CHANGED: u32 = 1 << 3;
const FLAG_CHANGED_MASK: u32 = FLAG_AUDIO_IN_CHANGED
    | FLAG_AUDIO_OUT_CHANGED
    | FLAG_CONTROL_IN_CHANGED
    | FLAG_CONTROL_OUT_CHANGED;
const FLAG_HAS_TRIGGER: u32 = 1 << 4;
const FLAG_ACTIVE: u32 = 1 << 5;

/// How an input connection interprets bus freshness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputType {
    In,
    InFeedback,
}

/// How an output connection writes to its bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputType {
    Out,
    ReplaceOut,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AudioInputConnection {
    pub port: usize,
    pub bus: Option<BusBinding>,
    pub kind: InputType,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AudioOutputConnection {
    pub port: usize,
    pub bus: Option<BusBinding>,
    pub kind: OutputType,
}

/// Scratch space for decoding synth options
#[repr(align(16))]
struct OptionsBuffer([u8; MAX_OPTIONS_SIZE]);

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Runtime state of one synth node
pub(crate) struct SynthState {
    def: Arc<SynthDef>,
    chunk: NonNull<u8>,
    instance: *mut (),
    ports: NonNull<PortDescriptor>,
    num_ports: usize,
    controls: NonNull<Sample>,
    num_control_inputs: usize,
    num_control_outputs: usize,
    inputs: NonNull<AudioInputConnection>,
    num_audio_inputs: usize,
    outputs: NonNull<AudioOutputConnection>,
    num_audio_outputs: usize,
    scratch: NonNull<Sample>,
    block_size: usize,
    flags: u32,
    sample_offset: usize,
}

// SAFETY: all pointers target the synth's own arena chunk; the state is
// only used on the audio thread and the chunk is reclaimed there after
// the worker has destroyed the instance.
unsafe impl Send for SynthState {}

impl SynthState {
    /// Decode options, size the arena chunk and placement-construct the
    /// plugin instance. The synth starts inactive.
    pub fn construct(
        ctx: &mut RtContext,
        def: Arc<SynthDef>,
        control_inits: &[OscType],
        synth_args: &[OscType],
    ) -> EngineResult<Self> {
        debug_assert!(def.options_size <= MAX_OPTIONS_SIZE);
        debug_assert!(def.options_align <= MAX_OPTIONS_ALIGN);

        let mut options_buf = OptionsBuffer([0; MAX_OPTIONS_SIZE]);
        let options_ptr = options_buf.0.as_mut_ptr() as *mut ();
        (def.configure)(synth_args, options_ptr);
        let options = options_ptr as *const ();

        let (na_in, na_out, nc_in, nc_out) = def.count_ports(options);
        let num_ports = na_in + na_out + nc_in + nc_out;
        let num_controls = nc_in + nc_out;
        let scratch_len = (na_in + na_out) * ctx.block_size;

        let off_ports = align_up(
            def.instance_size.max(1),
            mem::align_of::<PortDescriptor>(),
        );
        let off_controls = align_up(
            off_ports + num_ports * mem::size_of::<PortDescriptor>(),
            mem::align_of::<Sample>(),
        );
        let off_inputs = align_up(
            off_controls + num_controls * mem::size_of::<Sample>(),
            mem::align_of::<AudioInputConnection>(),
        );
        let off_outputs = align_up(
            off_inputs + na_in * mem::size_of::<AudioInputConnection>(),
            mem::align_of::<AudioOutputConnection>(),
        );
        let off_scratch = align_up(
            off_outputs + na_out * mem::size_of::<AudioOutputConnection>(),
            mem::align_of::<Sample>(),
        );
        let total = off_scratch + scratch_len * mem::size_of::<Sample>();

        let chunk = ctx
            .rt_mem
            .alloc_aligned(def.instance_align.max(16), total)?;
        let base = chunk.as_ptr();

        // SAFETY: every write below stays inside the freshly allocated
        // chunk, at offsets aligned for the type being written.
        let mut state = unsafe {
            let ports = base.add(off_ports) as *mut PortDescriptor;
            for index in 0..num_ports {
                let port = (def.port_descriptor)(options, index)
                    .expect("port list shrank during construction");
                ports.add(index).write(port);
            }

            let controls = base.add(off_controls) as *mut Sample;
            for i in 0..num_controls {
                controls.add(i).write(0.0);
            }
            for (i, init) in control_inits.iter().take(nc_in).enumerate() {
                if let OscType::Float(value) = init {
                    *controls.add(i) = *value;
                }
            }

            let inputs = base.add(off_inputs) as *mut AudioInputConnection;
            let outputs = base.add(off_outputs) as *mut AudioOutputConnection;
            let mut next_in = 0;
            let mut next_out = 0;
            let mut has_trigger = false;
            for index in 0..num_ports {
                let port = *ports.add(index);
                match port.kind {
                    PortKind::AudioIn => {
                        inputs.add(next_in).write(AudioInputConnection {
                            port: index,
                            bus: None,
                            kind: InputType::In,
                        });
                        next_in += 1;
                    }
                    PortKind::AudioOut => {
                        outputs.add(next_out).write(AudioOutputConnection {
                            port: index,
                            bus: None,
                            kind: OutputType::Out,
                        });
                        next_out += 1;
                    }
                    PortKind::ControlIn => {
                        has_trigger |= port.flags & PORT_FLAG_TRIGGER != 0;
                    }
                    PortKind::ControlOut => {}
                }
            }

            let scratch = base.add(off_scratch) as *mut Sample;
            for i in 0..scratch_len {
                scratch.add(i).write(0.0);
            }

            let mut flags = FLAG_CHANGED_MASK;
            if has_trigger {
                flags |= FLAG_HAS_TRIGGER;
            }

            SynthState {
                def: def.clone(),
                chunk,
                instance: base as *mut (),
                ports: NonNull::new_unchecked(ports),
                num_ports,
                controls: NonNull::new_unchecked(controls),
                num_control_inputs: nc_in,
                num_control_outputs: nc_out,
                inputs: NonNull::new_unchecked(inputs),
                num_audio_inputs: na_in,
                outputs: NonNull::new_unchecked(outputs),
                num_audio_outputs: na_out,
                scratch: NonNull::new_unchecked(scratch),
                block_size: ctx.block_size,
                flags,
                sample_offset: 0,
            }
        };

        let mut world = ctx.world();
        (def.construct)(&mut world, options, state.instance);
        // Bind every port before the first process call.
        state.connect_changed();
        Ok(state)
    }

    pub fn instance(&self) -> *mut () {
        self.instance
    }

    /// Pieces the worker needs to destroy the instance, plus the chunk the
    /// audio thread reclaims afterwards
    pub fn destroy_parts(&self) -> (Option<DestroyFn>, *mut (), *mut u8) {
        (self.def.destroy, self.instance, self.chunk.as_ptr())
    }

    pub fn is_active(&self) -> bool {
        self.flags & FLAG_ACTIVE != 0
    }

    /// Start processing, offset by `sample_offset` frames into the
    /// activation block
    pub fn activate(&mut self, sample_offset: usize) {
        self.flags |= FLAG_ACTIVE;
        self.sample_offset = sample_offset;
    }

    fn controls(&self) -> &[Sample] {
        // SAFETY: `controls` points at `num_control_inputs +
        // num_control_outputs` samples inside the chunk.
        unsafe {
            std::slice::from_raw_parts(
                self.controls.as_ptr(),
                self.num_control_inputs + self.num_control_outputs,
            )
        }
    }

    fn controls_mut(&mut self) -> &mut [Sample] {
        // SAFETY: as `controls`, with exclusive access through &mut self.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.controls.as_ptr(),
                self.num_control_inputs + self.num_control_outputs,
            )
        }
    }

    pub fn control_input(&self, index: usize) -> EngineResult<Sample> {
        if index >= self.num_control_inputs {
            return Err(EngineError::PortIndexOutOfRange(index as u32));
        }
        Ok(self.controls()[index])
    }

    pub fn set_control_input(&mut self, index: usize, value: Sample) -> EngineResult<()> {
        if index >= self.num_control_inputs {
            return Err(EngineError::PortIndexOutOfRange(index as u32));
        }
        self.controls_mut()[index] = value;
        Ok(())
    }

    fn input_connections(&self) -> &[AudioInputConnection] {
        // SAFETY: `inputs` points at `num_audio_inputs` connections.
        unsafe { std::slice::from_raw_parts(self.inputs.as_ptr(), self.num_audio_inputs) }
    }

    fn output_connections(&self) -> &[AudioOutputConnection] {
        // SAFETY: `outputs` points at `num_audio_outputs` connections.
        unsafe { std::slice::from_raw_parts(self.outputs.as_ptr(), self.num_audio_outputs) }
    }

    /// Map audio input `index` to a bus (or unmap with `None`)
    pub fn map_input(
        &mut self,
        index: usize,
        bus: Option<BusBinding>,
        kind: InputType,
    ) -> EngineResult<()> {
        if index >= self.num_audio_inputs {
            return Err(EngineError::PortIndexOutOfRange(index as u32));
        }
        // SAFETY: index checked against the connection count.
        let conn = unsafe { &mut *self.inputs.as_ptr().add(index) };
        conn.bus = bus;
        conn.kind = kind;
        self.flags |= FLAG_AUDIO_IN_CHANGED;
        Ok(())
    }

    /// Map audio output `index` to a bus (or unmap with `None`)
    pub fn map_output(
        &mut self,
        index: usize,
        bus: Option<BusBinding>,
        kind: OutputType,
    ) -> EngineResult<()> {
        if index >= self.num_audio_outputs {
            return Err(EngineError::PortIndexOutOfRange(index as u32));
        }
        // SAFETY: index checked against the connection count.
        let conn = unsafe { &mut *self.outputs.as_ptr().add(index) };
        conn.bus = bus;
        conn.kind = kind;
        self.flags |= FLAG_AUDIO_OUT_CHANGED;
        Ok(())
    }

    fn scratch_in_ptr(&self, index: usize) -> *mut Sample {
        debug_assert!(index < self.num_audio_inputs);
        // SAFETY: input scratch buffers occupy the first `num_audio_inputs
        // * block_size` samples of the scratch area.
        unsafe { self.scratch.as_ptr().add(index * self.block_size) }
    }

    fn scratch_out_ptr(&self, index: usize) -> *mut Sample {
        debug_assert!(index < self.num_audio_outputs);
        // SAFETY: output scratch buffers follow the input buffers.
        unsafe {
            self.scratch
                .as_ptr()
                .add((self.num_audio_inputs + index) * self.block_size)
        }
    }

    fn port(&self, index: usize) -> PortDescriptor {
        debug_assert!(index < self.num_ports);
        // SAFETY: `ports` holds `num_ports` descriptors.
        unsafe { *self.ports.as_ptr().add(index) }
    }

    /// Re-bind ports whose connections changed since the last block, then
    /// clear the change flags
    fn connect_changed(&mut self) {
        let changed = self.flags & FLAG_CHANGED_MASK;
        if changed == 0 {
            return;
        }
        let mut audio_in = 0;
        let mut audio_out = 0;
        let mut control_in = 0;
        let mut control_out = 0;
        for index in 0..self.num_ports {
            let port = self.port(index);
            let (flag, data) = match port.kind {
                PortKind::AudioIn => {
                    let data = self.scratch_in_ptr(audio_in);
                    audio_in += 1;
                    (FLAG_AUDIO_IN_CHANGED, data)
                }
                PortKind::AudioOut => {
                    let data = self.scratch_out_ptr(audio_out);
                    audio_out += 1;
                    (FLAG_AUDIO_OUT_CHANGED, data)
                }
                PortKind::ControlIn => {
                    // SAFETY: control-in slots precede control-out slots.
                    let data = unsafe { self.controls.as_ptr().add(control_in) };
                    control_in += 1;
                    (FLAG_CONTROL_IN_CHANGED, data)
                }
                PortKind::ControlOut => {
                    // SAFETY: as above.
                    let data = unsafe {
                        self.controls
                            .as_ptr()
                            .add(self.num_control_inputs + control_out)
                    };
                    control_out += 1;
                    (FLAG_CONTROL_OUT_CHANGED, data)
                }
            };
            if changed & flag != 0 {
                (self.def.connect)(self.instance, index, data);
            }
        }
        self.flags &= !FLAG_CHANGED_MASK;
    }

    /// Run one block: read inputs, re-bind changed ports, invoke the
    /// plugin, write outputs. Returns true when the plugin requested
    /// completion via `synth_done`.
    pub fn process(&mut self, ctx: &mut RtContext, num_frames: usize) -> bool {
        if !self.is_active() {
            return false;
        }
        debug_assert!(num_frames <= self.block_size);

        for index in 0..self.num_audio_inputs {
            let conn = self.input_connections()[index];
            // SAFETY: each input scratch buffer holds `block_size` frames.
            let dst = unsafe {
                std::slice::from_raw_parts_mut(self.scratch_in_ptr(index), num_frames)
            };
            match conn.bus.and_then(|b| ctx.buses.get(b)) {
                Some(bus) => bus.read_into(dst, ctx.epoch, conn.kind == InputType::InFeedback),
                None => silence(dst),
            }
        }

        self.connect_changed();

        ctx.current_synth = self.instance;
        ctx.current_done = false;
        {
            let mut world = ctx.world();
            (self.def.process)(&mut world, self.instance, num_frames);
        }
        let done = ctx.current_done;
        ctx.current_synth = std::ptr::null_mut();
        ctx.current_done = false;

        // Sample-accurate activation: silence the part of the first block
        // that precedes the scheduled start.
        if self.sample_offset > 0 {
            let offset = self.sample_offset.min(num_frames);
            for index in 0..self.num_audio_outputs {
                // SAFETY: offset <= num_frames <= block_size.
                let head = unsafe {
                    std::slice::from_raw_parts_mut(self.scratch_out_ptr(index), offset)
                };
                silence(head);
            }
            self.sample_offset = 0;
        }

        for index in 0..self.num_audio_outputs {
            let conn = self.output_connections()[index];
            if let Some(bus) = conn.bus.and_then(|b| ctx.buses.get_mut(b)) {
                // SAFETY: each output scratch buffer holds `block_size`
                // frames.
                let src = unsafe {
                    std::slice::from_raw_parts(self.scratch_out_ptr(index), num_frames)
                };
                bus.write_from(src, ctx.epoch, conn.kind == OutputType::ReplaceOut);
            }
        }

        if self.flags & FLAG_HAS_TRIGGER != 0 {
            let mut control_in = 0;
            for index in 0..self.num_ports {
                let port = self.port(index);
                if port.kind == PortKind::ControlIn {
                    if port.flags & PORT_FLAG_TRIGGER != 0 {
                        self.controls_mut()[control_in] = 0.0;
                    }
                    control_in += 1;
                }
            }
        }

        done
    }
}
