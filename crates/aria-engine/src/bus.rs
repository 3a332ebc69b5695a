//! Audio buses with epoch-based freshness
//!
//! Instead of clearing every bus at the start of a block, each bus carries
//! the epoch of its last write. A reader that observes an older epoch
//! treats the contents as silence; a writer either accumulates (bus
//! already written this block) or overwrites and stamps the epoch. The
//! engine clears all buses at once by incrementing its epoch.

use aria_core::{silence, Sample};
use aria_rt::BusGuard;

/// Identifies a bus a synth port can be mapped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBinding {
    /// Engine-owned routing bus
    Internal(u32),
    /// Hardware input channel, patched in by the driver each block
    ExternalInput(u32),
    /// Hardware output channel, patched in by the driver each block
    ExternalOutput(u32),
}

enum BusData {
    /// Owned block-sized buffer
    Internal(Box<[Sample]>),
    /// Driver-owned buffer, valid for the duration of one callback
    External(*mut Sample),
}

/// A single audio bus: sample storage plus its publication epoch
pub struct AudioBus {
    data: BusData,
    epoch: u64,
    guard: BusGuard,
}

// SAFETY: buses are owned by the engine and only touched on the audio
// thread; the external data pointer never outlives the callback that
// patched it in.
unsafe impl Send for AudioBus {}

impl AudioBus {
    /// Internal bus with an owned buffer of `block_size` samples
    pub fn internal(block_size: usize, epoch: u64) -> Self {
        Self {
            data: BusData::Internal(vec![0.0; block_size].into_boxed_slice()),
            epoch,
            guard: BusGuard::new(),
        }
    }

    /// External bus; the driver patches the data pointer each block
    pub fn external(epoch: u64) -> Self {
        Self {
            data: BusData::External(std::ptr::null_mut()),
            epoch,
            guard: BusGuard::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Patch the driver buffer for this block (external buses only)
    pub(crate) fn set_external_data(&mut self, ptr: *mut Sample) {
        if let BusData::External(data) = &mut self.data {
            *data = ptr;
        }
    }

    fn slice(&self, num_frames: usize) -> Option<&[Sample]> {
        match &self.data {
            BusData::Internal(buf) => Some(&buf[..num_frames]),
            BusData::External(ptr) if !ptr.is_null() => {
                // SAFETY: the driver guarantees the pointer is valid for
                // `num_frames` samples for the duration of the callback.
                Some(unsafe { std::slice::from_raw_parts(*ptr, num_frames) })
            }
            BusData::External(_) => None,
        }
    }

    /// Copy the bus into `dst`, or silence when the bus is stale
    ///
    /// `feedback` readers additionally accept the previous epoch, which is
    /// how a connection reads last block's output of a later node.
    pub(crate) fn read_into(&self, dst: &mut [Sample], engine_epoch: u64, feedback: bool) {
        let _shared = self.guard.read();
        let fresh = self.epoch == engine_epoch
            || (feedback && self.epoch.wrapping_add(1) == engine_epoch);
        match self.slice(dst.len()) {
            Some(src) if fresh => dst.copy_from_slice(src),
            _ => silence(dst),
        }
    }

    /// Write `src` to the bus: accumulate when fresh this epoch,
    /// overwrite and stamp otherwise; `replace` always overwrites
    pub(crate) fn write_from(&mut self, src: &[Sample], engine_epoch: u64, replace: bool) {
        let _exclusive = self.guard.write();
        let fresh = self.epoch == engine_epoch;
        let num_frames = src.len();
        let dst = match &mut self.data {
            BusData::Internal(buf) => Some(&mut buf[..num_frames]),
            BusData::External(ptr) if !ptr.is_null() => {
                // SAFETY: as in `slice`, with exclusive access through
                // &mut self and the write guard.
                Some(unsafe { std::slice::from_raw_parts_mut(*ptr, num_frames) })
            }
            BusData::External(_) => None,
        };
        let Some(dst) = dst else {
            return;
        };
        if fresh && !replace {
            aria_core::accumulate(dst, src);
        } else {
            dst.copy_from_slice(src);
            self.epoch = engine_epoch;
        }
    }
}

/// All buses of an engine instance
pub(crate) struct Buses {
    pub internal: Vec<AudioBus>,
    pub external_inputs: Vec<AudioBus>,
    pub external_outputs: Vec<AudioBus>,
}

impl Buses {
    pub fn new(options: &crate::EngineOptions) -> Self {
        // One epoch behind the engine, so nothing reads as fresh before
        // the first write.
        let epoch = 0u64.wrapping_sub(1);
        Self {
            internal: (0..options.max_num_audio_buses)
                .map(|_| AudioBus::internal(options.block_size, epoch))
                .collect(),
            external_inputs: (0..options.num_hardware_input_channels)
                .map(|_| AudioBus::external(epoch))
                .collect(),
            external_outputs: (0..options.num_hardware_output_channels)
                .map(|_| AudioBus::external(epoch))
                .collect(),
        }
    }

    pub fn get(&self, binding: BusBinding) -> Option<&AudioBus> {
        match binding {
            BusBinding::Internal(i) => self.internal.get(i as usize),
            BusBinding::ExternalInput(i) => self.external_inputs.get(i as usize),
            BusBinding::ExternalOutput(i) => self.external_outputs.get(i as usize),
        }
    }

    pub fn get_mut(&mut self, binding: BusBinding) -> Option<&mut AudioBus> {
        match binding {
            BusBinding::Internal(i) => self.internal.get_mut(i as usize),
            BusBinding::ExternalInput(i) => self.external_inputs.get_mut(i as usize),
            BusBinding::ExternalOutput(i) => self.external_outputs.get_mut(i as usize),
        }
    }

    pub fn contains(&self, binding: BusBinding) -> bool {
        self.get(binding).is_some()
    }
}
