//! aria-engine: Real-time audio engine core
//!
//! A sample-accurate scheduler and DSP graph processor. Synth nodes are
//! organized in groups and walked once per audio block; control arrives as
//! time-stamped OSC packets from non-real-time threads and is executed at
//! the right sample frame. Replies travel back through a worker thread
//! pool, which also absorbs every deallocation the audio thread must not
//! perform itself.

mod bus;
mod environment;
mod node;
mod request;
mod scheduler;
mod synth;
mod synthdef;
mod worker;

pub use bus::{AudioBus, BusBinding};
pub use environment::{EngineHandle, Environment};
pub use node::{AddAction, NodeId};
pub use request::Request;
pub use synth::{BUS_MAPPING_EXTERNAL, BUS_MAPPING_FEEDBACK, BUS_MAPPING_REPLACE};
pub use worker::PacketHandler;

/// Capacity of the request queue, the scheduler and the worker queues
pub const QUEUE_SIZE: usize = 8192;

/// Request id denoting a notification: no `/ack` is sent, errors are
/// reported with this id
pub const NOTIFICATION_ID: i32 = 0;

/// Engine configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Sample rate in Hz, as reported by the driver
    pub sample_rate: f64,
    /// Maximum frames per callback
    pub block_size: usize,
    /// Bytes reserved for the real-time arena
    pub realtime_memory_size: usize,
    /// Node map capacity
    pub max_num_nodes: usize,
    /// Internal audio bus count
    pub max_num_audio_buses: usize,
    /// External input bus count
    pub num_hardware_input_channels: usize,
    /// External output bus count
    pub num_hardware_output_channels: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 64,
            realtime_memory_size: 1024 * 1024,
            max_num_nodes: 1024,
            max_num_audio_buses: 128,
            num_hardware_input_channels: 2,
            num_hardware_output_channels: 2,
        }
    }
}
