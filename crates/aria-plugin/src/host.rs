//! Opaque `World` and `Host` handles
//!
//! Each handle is an erased pointer into engine state plus a table of
//! plain function pointers, mirroring a C plugin ABI. The engine fills in
//! the tables; plugin code only sees the method wrappers.

use crate::{HostPerformFn, SynthDef, WorldPerformFn};

/// Function table backing [`World`]
pub struct WorldVt {
    pub sample_rate: fn(handle: *mut ()) -> f64,
    pub block_size: fn(handle: *mut ()) -> usize,
    pub alloc: fn(handle: *mut (), size: usize) -> *mut u8,
    pub alloc_aligned: fn(handle: *mut (), align: usize, size: usize) -> *mut u8,
    pub free: fn(handle: *mut (), ptr: *mut u8),
    pub synth_retain: fn(handle: *mut (), synth: *mut ()),
    pub synth_release: fn(handle: *mut (), synth: *mut ()),
    pub synth_done: fn(handle: *mut (), synth: *mut ()),
    pub perform_command: fn(handle: *mut (), f: HostPerformFn, data: *mut ()) -> bool,
}

/// Audio-thread view of the engine, passed to plugin `construct` and
/// `process` callbacks
pub struct World<'a> {
    handle: *mut (),
    vt: &'a WorldVt,
}

impl<'a> World<'a> {
    /// Engine-internal constructor
    pub fn from_raw(handle: *mut (), vt: &'a WorldVt) -> Self {
        Self { handle, vt }
    }

    pub fn sample_rate(&self) -> f64 {
        (self.vt.sample_rate)(self.handle)
    }

    pub fn block_size(&self) -> usize {
        (self.vt.block_size)(self.handle)
    }

    /// Allocate from the real-time arena; null on exhaustion
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        (self.vt.alloc)(self.handle, size)
    }

    /// Aligned allocation from the real-time arena; null on exhaustion
    pub fn alloc_aligned(&mut self, align: usize, size: usize) -> *mut u8 {
        (self.vt.alloc_aligned)(self.handle, align, size)
    }

    /// Return memory to the real-time arena
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`World::alloc`] or [`World::alloc_aligned`]
    /// on this engine and must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        (self.vt.free)(self.handle, ptr)
    }

    /// Keep a synth alive across an asynchronous command
    pub fn synth_retain(&mut self, synth: *mut ()) {
        (self.vt.synth_retain)(self.handle, synth)
    }

    /// Drop a reference taken with [`World::synth_retain`]
    pub fn synth_release(&mut self, synth: *mut ()) {
        (self.vt.synth_release)(self.handle, synth)
    }

    /// Mark a synth as finished; the engine removes it at the next safe
    /// point and defers instance destruction to the worker
    pub fn synth_done(&mut self, synth: *mut ()) {
        (self.vt.synth_done)(self.handle, synth)
    }

    /// Hand a unit of work to the worker thread
    ///
    /// Returns false when the worker queue is full.
    pub fn perform_command(&mut self, f: HostPerformFn, data: *mut ()) -> bool {
        (self.vt.perform_command)(self.handle, f, data)
    }
}

/// Function table backing [`Host`]
pub struct HostVt {
    pub register_synth_def: fn(handle: *mut (), def: SynthDef),
    pub sound_file_api: fn(handle: *mut (), mime_type: &str) -> Option<&'static SoundFileApi>,
    pub register_sound_file_api:
        fn(handle: *mut (), mime_type: &'static str, api: &'static SoundFileApi),
    pub perform_command: fn(handle: *mut (), f: WorldPerformFn, data: *mut ()) -> bool,
}

/// Worker-side view of the engine, passed to plugin library entries and
/// worker continuations
pub struct Host<'a> {
    handle: *mut (),
    vt: &'a HostVt,
}

impl<'a> Host<'a> {
    /// Engine-internal constructor
    pub fn from_raw(handle: *mut (), vt: &'a HostVt) -> Self {
        Self { handle, vt }
    }

    /// Register a synth definition under its URI
    pub fn register_synth_def(&mut self, def: SynthDef) {
        (self.vt.register_synth_def)(self.handle, def)
    }

    /// Look up a registered sound file backend by mime type
    pub fn sound_file_api(&self, mime_type: &str) -> Option<&'static SoundFileApi> {
        (self.vt.sound_file_api)(self.handle, mime_type)
    }

    /// Register a sound file backend
    pub fn register_sound_file_api(&mut self, mime_type: &'static str, api: &'static SoundFileApi) {
        (self.vt.register_sound_file_api)(self.handle, mime_type, api)
    }

    /// Post a unit of work back onto the audio thread
    ///
    /// Returns false when the queue toward the audio thread is full.
    pub fn perform_command(&mut self, f: WorldPerformFn, data: *mut ()) -> bool {
        (self.vt.perform_command)(self.handle, f, data)
    }
}

/// Sound file backend descriptor
///
/// The engine only routes lookups by mime type; the backend itself is an
/// external collaborator.
pub struct SoundFileApi {
    pub handle: *mut (),
    pub open: fn(handle: *mut (), path: &str, mode: SoundFileMode) -> *mut (),
    pub close: fn(handle: *mut (), file: *mut ()),
}

// SAFETY: the descriptor is immutable; backends are required to be
// callable from any thread.
unsafe impl Send for SoundFileApi {}
unsafe impl Sync for SoundFileApi {}

/// Open mode for sound file backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundFileMode {
    Read,
    Write,
}

/// Returned by a plugin library entry after registering its synthdefs
pub struct Library {
    pub handle: *mut (),
    pub destroy: Option<fn(handle: *mut ())>,
}

impl Default for Library {
    fn default() -> Self {
        Self {
            handle: std::ptr::null_mut(),
            destroy: None,
        }
    }
}

// SAFETY: library handles are only touched at load and teardown, both
// serialized by the engine owner.
unsafe impl Send for Library {}

/// Plugin library entry point
pub type LibraryFn = fn(host: &mut Host) -> Library;
