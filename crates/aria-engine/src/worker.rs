//! Worker thread pool and cross-thread commands
//!
//! Two background threads sleep on the to-worker queue and absorb
//! everything the audio thread must not do itself: dropping request
//! references, destroying plugin instances, building OSC replies and
//! running plugin-posted continuations. Results travel back through the
//! from-worker queue, drained once per audio block.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rosc::{encoder, OscMessage, OscPacket, OscType};
use smallvec::SmallVec;

use aria_core::EngineError;
use aria_plugin::{
    DestroyFn, Host, HostPerformFn, HostVt, SoundFileApi, SynthDef, WorldPerformFn,
};

use crate::synthdef::SynthDefRegistry;

/// Receives reply packets on a worker thread
pub type PacketHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Opaque pointer that may cross the thread boundary
///
/// Ownership is part of the command contract: whoever receives the
/// command owns the pointee until it is handed back.
pub(crate) struct SendPtr(pub *mut ());

// SAFETY: transfers exclusive ownership; the sender stops using the
// pointer once the command is queued.
unsafe impl Send for SendPtr {}

/// Commands from the audio thread to the workers
pub(crate) enum ToWorker {
    /// Run a plugin continuation with the host handle
    Perform { f: HostPerformFn, data: SendPtr },
    /// Destroy a synth instance, then hand its chunk back for arena
    /// reclamation
    FreeSynth {
        destroy: Option<DestroyFn>,
        instance: SendPtr,
        chunk: SendPtr,
    },
    /// Drop a request reference off the audio thread
    DropRequest(crate::request::Request),
    /// Reply `/ack requestId extra...`
    Ack {
        request_id: i32,
        extra: SmallVec<[i32; 2]>,
    },
    /// Reply `/error requestId code message`
    Error {
        request_id: i32,
        error: EngineError,
    },
    /// Reply `/ack requestId busId...` for a bus query
    QueryReply { request_id: i32, count: usize },
}

/// Commands from the workers back to the audio thread
pub(crate) enum FromWorker {
    /// Run a plugin continuation with the world handle
    Perform { f: WorldPerformFn, data: SendPtr },
    /// Return a destroyed synth's chunk to the real-time arena
    ReclaimChunk(SendPtr),
}

/// State shared between the workers, the loading thread and the audio
/// thread (registry reads only)
pub(crate) struct HostShared {
    pub registry: SynthDefRegistry,
    pub sound_file_apis: Mutex<Vec<(&'static str, &'static SoundFileApi)>>,
    pub from_worker_tx: Sender<FromWorker>,
    pub packet_handler: Mutex<PacketHandler>,
}

impl HostShared {
    pub fn new(from_worker_tx: Sender<FromWorker>, packet_handler: PacketHandler) -> Self {
        Self {
            registry: SynthDefRegistry::new(),
            sound_file_apis: Mutex::new(Vec::new()),
            from_worker_tx,
            packet_handler: Mutex::new(packet_handler),
        }
    }

    /// Host handle over this shared state
    pub fn host(self: &Arc<Self>) -> Host<'_> {
        Host::from_raw(Arc::as_ptr(self) as *mut (), &HOST_VT)
    }
}

fn shared<'a>(handle: *mut ()) -> &'a HostShared {
    // SAFETY: host handles are only constructed from a live
    // `Arc<HostShared>` by `HostShared::host`.
    unsafe { &*(handle as *const HostShared) }
}

fn host_register_synth_def(handle: *mut (), def: SynthDef) {
    let uri = def.uri;
    if let Err(e) = shared(handle).registry.register(def) {
        log::warn!("rejected synthdef {uri}: {e}");
    }
}

fn host_sound_file_api(handle: *mut (), mime_type: &str) -> Option<&'static SoundFileApi> {
    shared(handle)
        .sound_file_apis
        .lock()
        .iter()
        .find(|(mime, _)| *mime == mime_type)
        .map(|(_, api)| *api)
}

fn host_register_sound_file_api(
    handle: *mut (),
    mime_type: &'static str,
    api: &'static SoundFileApi,
) {
    shared(handle).sound_file_apis.lock().push((mime_type, api));
}

fn host_perform_command(handle: *mut (), f: WorldPerformFn, data: *mut ()) -> bool {
    shared(handle)
        .from_worker_tx
        .try_send(FromWorker::Perform {
            f,
            data: SendPtr(data),
        })
        .is_ok()
}

pub(crate) static HOST_VT: HostVt = HostVt {
    register_synth_def: host_register_synth_def,
    sound_file_api: host_sound_file_api,
    register_sound_file_api: host_register_sound_file_api,
    perform_command: host_perform_command,
};

/// Worker pool size
pub(crate) const NUM_WORKER_THREADS: usize = 2;

pub(crate) fn spawn_workers(
    rx: Receiver<ToWorker>,
    shared: Arc<HostShared>,
) -> Vec<JoinHandle<()>> {
    (0..NUM_WORKER_THREADS)
        .map(|i| {
            let rx = rx.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("aria-worker-{i}"))
                .spawn(move || worker_loop(rx, shared))
                .expect("failed to spawn worker thread")
        })
        .collect()
}

fn worker_loop(rx: Receiver<ToWorker>, shared: Arc<HostShared>) {
    while let Ok(item) = rx.recv() {
        match item {
            ToWorker::Perform { f, data } => {
                let mut host = shared.host();
                f(&mut host, data.0);
            }
            ToWorker::FreeSynth {
                destroy,
                instance,
                chunk,
            } => {
                if let Some(destroy) = destroy {
                    destroy(instance.0);
                }
                if shared
                    .from_worker_tx
                    .try_send(FromWorker::ReclaimChunk(chunk))
                    .is_err()
                {
                    log::error!("from-worker queue full, leaking synth chunk");
                }
            }
            ToWorker::DropRequest(request) => drop(request),
            ToWorker::Ack { request_id, extra } => {
                let mut args = vec![OscType::Int(request_id)];
                args.extend(extra.into_iter().map(OscType::Int));
                send_reply(&shared, "/ack", args);
            }
            ToWorker::Error { request_id, error } => {
                send_reply(
                    &shared,
                    "/error",
                    vec![
                        OscType::Int(request_id),
                        OscType::Int(error.code()),
                        OscType::String(error.to_string()),
                    ],
                );
            }
            ToWorker::QueryReply { request_id, count } => {
                let mut args = vec![OscType::Int(request_id)];
                args.extend((0..count as i32).map(OscType::Int));
                send_reply(&shared, "/ack", args);
            }
        }
    }
    // The queue disconnects when the engine drops its sender.
    log::debug!("worker thread exiting");
}

/// Encode a reply and hand it to the user packet handler; called only
/// from worker threads
fn send_reply(shared: &HostShared, addr: &str, args: Vec<OscType>) {
    let packet = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    match encoder::encode(&packet) {
        Ok(bytes) => {
            let mut handler = shared.packet_handler.lock();
            (*handler)(&bytes);
        }
        Err(e) => log::error!("failed to encode reply {addr}: {e:?}"),
    }
}
