//! Engine environment: the audio callback and the request pipeline
//!
//! `Environment` is the audio-side half of the engine; it is moved into
//! the driver callback and owns the node tree, the buses, the scheduler
//! and the real-time arena. `EngineHandle` is the client-side half:
//! cloneable, sendable, and only able to enqueue packets.
//!
//! Message handling is two-phase, so a scheduled `/synth/new` constructs
//! its instance the moment the request is seen but only starts processing
//! at its deadline, with a sample-accurate offset into that block.

use std::ptr::null_mut;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use rosc::{OscBundle, OscMessage, OscPacket};
use smallvec::{smallvec, SmallVec};

use aria_core::{
    silence, timetag_is_immediate, timetag_to_seconds, EngineError, EngineResult, Sample, Time,
};
use aria_plugin::{HostPerformFn, Library, LibraryFn, World, WorldVt};
use aria_rt::RtArena;

use crate::bus::{BusBinding, Buses};
use crate::node::{AddAction, Node, NodeArena, NodeBody, NodeId, Slot};
use crate::request::{Args, Request};
use crate::scheduler::Scheduler;
use crate::synth::{
    InputType, OutputType, SynthState, BUS_MAPPING_EXTERNAL, BUS_MAPPING_FEEDBACK,
    BUS_MAPPING_REPLACE,
};
use crate::worker::{spawn_workers, FromWorker, HostShared, PacketHandler, SendPtr, ToWorker};
use crate::{EngineOptions, NOTIFICATION_ID, QUEUE_SIZE};

// ---------------------------------------------------------------------------
// Audio-side context and the plugin world vtable
// ---------------------------------------------------------------------------

/// Everything synth processing needs besides the node tree itself
///
/// Split from `Environment` so a synth borrowed out of the node arena can
/// still reach buses, the arena and the worker queue.
pub(crate) struct RtContext {
    pub sample_rate: f64,
    pub block_size: usize,
    pub epoch: u64,
    pub buses: Buses,
    pub rt_mem: RtArena,
    pub to_worker: Sender<ToWorker>,
    /// Instance of the synth currently being processed
    pub current_synth: *mut (),
    /// Set when that synth calls `synth_done` on itself
    pub current_done: bool,
    /// `synth_done` targets other than the current synth
    pub pending_done: Vec<*mut ()>,
    /// Deferred retain/release deltas, applied after the tree walk
    pub pending_refs: Vec<(*mut (), i32)>,
}

impl RtContext {
    /// Plugin-facing view of this context
    pub fn world(&mut self) -> World<'static> {
        World::from_raw(self as *mut RtContext as *mut (), &WORLD_VT)
    }
}

fn rt_ctx<'a>(handle: *mut ()) -> &'a mut RtContext {
    // SAFETY: world handles are only constructed from a live &mut
    // RtContext by `RtContext::world`, and never escape the audio thread.
    unsafe { &mut *(handle as *mut RtContext) }
}

fn world_sample_rate(handle: *mut ()) -> f64 {
    rt_ctx(handle).sample_rate
}

fn world_block_size(handle: *mut ()) -> usize {
    rt_ctx(handle).block_size
}

fn world_alloc(handle: *mut (), size: usize) -> *mut u8 {
    rt_ctx(handle)
        .rt_mem
        .alloc(size)
        .map(|p| p.as_ptr())
        .unwrap_or(null_mut())
}

fn world_alloc_aligned(handle: *mut (), align: usize, size: usize) -> *mut u8 {
    rt_ctx(handle)
        .rt_mem
        .alloc_aligned(align, size)
        .map(|p| p.as_ptr())
        .unwrap_or(null_mut())
}

fn world_free(handle: *mut (), ptr: *mut u8) {
    if !ptr.is_null() {
        // SAFETY: the plugin contract requires `ptr` to come from
        // world_alloc/world_alloc_aligned on this engine.
        unsafe { rt_ctx(handle).rt_mem.free(ptr) };
    }
}

fn push_ref_delta(ctx: &mut RtContext, synth: *mut (), delta: i32) {
    if ctx.pending_refs.len() < ctx.pending_refs.capacity() {
        ctx.pending_refs.push((synth, delta));
    }
}

fn world_synth_retain(handle: *mut (), synth: *mut ()) {
    push_ref_delta(rt_ctx(handle), synth, 1);
}

fn world_synth_release(handle: *mut (), synth: *mut ()) {
    push_ref_delta(rt_ctx(handle), synth, -1);
}

fn world_synth_done(handle: *mut (), synth: *mut ()) {
    let ctx = rt_ctx(handle);
    if synth == ctx.current_synth {
        ctx.current_done = true;
    } else if ctx.pending_done.len() < ctx.pending_done.capacity() {
        ctx.pending_done.push(synth);
    }
}

fn world_perform_command(handle: *mut (), f: HostPerformFn, data: *mut ()) -> bool {
    rt_ctx(handle)
        .to_worker
        .try_send(ToWorker::Perform {
            f,
            data: SendPtr(data),
        })
        .is_ok()
}

static WORLD_VT: WorldVt = WorldVt {
    sample_rate: world_sample_rate,
    block_size: world_block_size,
    alloc: world_alloc,
    alloc_aligned: world_alloc_aligned,
    free: world_free,
    synth_retain: world_synth_retain,
    synth_release: world_synth_release,
    synth_done: world_synth_done,
    perform_command: world_perform_command,
};

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// Client-side handle: submit packets from any thread
#[derive(Clone)]
pub struct EngineHandle {
    requests_tx: Sender<Request>,
}

impl EngineHandle {
    /// Decode and enqueue a wire packet
    pub fn send(&self, bytes: &[u8]) -> EngineResult<()> {
        self.send_request(Request::parse(bytes)?)
    }

    /// Enqueue an already-decoded packet
    pub fn send_packet(&self, packet: OscPacket) -> EngineResult<()> {
        self.send_request(Request::from_packet(packet))
    }

    fn send_request(&self, request: Request) -> EngineResult<()> {
        self.requests_tx
            .try_send(request)
            .map_err(|_| EngineError::QueueOverflow)
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// How a request leaves the dispatch path
enum Disposition {
    Done,
    Schedule(Time),
}

/// Audio-side engine state, driven by the platform callback
pub struct Environment {
    nodes: NodeArena,
    ctx: RtContext,
    scheduler: Scheduler,
    requests_rx: Receiver<Request>,
    from_worker_rx: Receiver<FromWorker>,
    host: Arc<HostShared>,
    workers: Vec<JoinHandle<()>>,
    libraries: Vec<Library>,
    /// Requests that could not be released to a full worker queue
    pending_releases: Vec<Request>,
    /// Synth slots flagged done during the current tree walk
    done_slots: Vec<Slot>,
    root: Slot,
}

// SAFETY: the environment moves to the audio thread as a whole; the raw
// pointers inside (current synth, pending done lists) never alias state
// owned by another thread.
unsafe impl Send for Environment {}

impl Environment {
    /// Build an engine; replies go to `packet_handler` on a worker thread
    pub fn new(packet_handler: PacketHandler, options: EngineOptions) -> (Self, EngineHandle) {
        let (requests_tx, requests_rx) = bounded(QUEUE_SIZE);
        let (to_worker_tx, to_worker_rx) = bounded(QUEUE_SIZE);
        let (from_worker_tx, from_worker_rx) = bounded(QUEUE_SIZE);

        let host = Arc::new(HostShared::new(from_worker_tx, packet_handler));
        let workers = spawn_workers(to_worker_rx, host.clone());

        let mut nodes = NodeArena::new(options.max_num_nodes);
        let root = nodes
            .insert(Node::group(NodeId::ROOT))
            .expect("node arena must fit the root group");

        log::info!(
            "starting aria engine: sample_rate={} block_size={} inputs={} outputs={}",
            options.sample_rate,
            options.block_size,
            options.num_hardware_input_channels,
            options.num_hardware_output_channels,
        );

        let environment = Self {
            nodes,
            ctx: RtContext {
                sample_rate: options.sample_rate,
                block_size: options.block_size,
                epoch: 0,
                buses: Buses::new(&options),
                rt_mem: RtArena::new(options.realtime_memory_size),
                to_worker: to_worker_tx,
                current_synth: null_mut(),
                current_done: false,
                pending_done: Vec::with_capacity(options.max_num_nodes),
                pending_refs: Vec::with_capacity(2 * options.max_num_nodes),
            },
            scheduler: Scheduler::new(QUEUE_SIZE),
            requests_rx,
            from_worker_rx,
            host,
            workers,
            libraries: Vec::new(),
            pending_releases: Vec::with_capacity(QUEUE_SIZE),
            done_slots: Vec::with_capacity(options.max_num_nodes),
            root,
        };
        (environment, EngineHandle { requests_tx })
    }

    /// Run plugin library entries, letting them register synthdefs
    pub fn load_plugins(&mut self, libraries: &[LibraryFn]) {
        for entry in libraries {
            let mut host = self.host.host();
            self.libraries.push(entry(&mut host));
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.ctx.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.ctx.block_size
    }

    /// Block counter; increments exactly once per `process` call
    pub fn epoch(&self) -> u64 {
        self.ctx.epoch
    }

    pub fn num_external_inputs(&self) -> usize {
        self.ctx.buses.external_inputs.len()
    }

    pub fn num_external_outputs(&self) -> usize {
        self.ctx.buses.external_outputs.len()
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Whether a synth node has been activated; `None` for groups and
    /// unknown ids
    pub fn node_is_active(&self, id: NodeId) -> Option<bool> {
        let slot = self.nodes.lookup(id)?;
        match &self.nodes.node(slot).body {
            NodeBody::Synth(synth) => Some(synth.is_active()),
            NodeBody::Group(_) => None,
        }
    }

    /// Current value of a synth's control input
    pub fn control_input(&self, id: NodeId, index: usize) -> Option<Sample> {
        let slot = self.nodes.lookup(id)?;
        match &self.nodes.node(slot).body {
            NodeBody::Synth(synth) => synth.control_input(index).ok(),
            NodeBody::Group(_) => None,
        }
    }

    /// Raw contents of an internal bus (regardless of freshness)
    pub fn read_internal_bus(&self, bus: u32, dst: &mut [Sample]) -> bool {
        match self.ctx.buses.internal.get(bus as usize) {
            Some(b) => {
                b.read_into(dst, b.epoch(), false);
                true
            }
            None => false,
        }
    }

    pub fn internal_bus_epoch(&self, bus: u32) -> Option<u64> {
        self.ctx.buses.internal.get(bus as usize).map(|b| b.epoch())
    }

    // -----------------------------------------------------------------------
    // Audio callback
    // -----------------------------------------------------------------------

    /// Produce one block of audio
    ///
    /// Called by the platform driver. `inputs` and `outputs` must match
    /// the configured hardware channel counts and be valid for
    /// `num_frames` frames.
    pub fn process(
        &mut self,
        current_time: Time,
        num_frames: usize,
        inputs: &[&[Sample]],
        outputs: &mut [&mut [Sample]],
    ) {
        assert!(
            num_frames <= self.ctx.block_size,
            "num_frames exceeds block_size"
        );
        assert_eq!(inputs.len(), self.ctx.buses.external_inputs.len());
        assert_eq!(outputs.len(), self.ctx.buses.external_outputs.len());

        self.flush_pending_releases();
        self.process_requests(current_time);
        let next_time = current_time + num_frames as f64 / self.ctx.sample_rate;
        self.process_scheduler(current_time, next_time);
        self.run_rt_commands();

        let epoch = self.ctx.epoch;
        for (bus, input) in self.ctx.buses.external_inputs.iter_mut().zip(inputs) {
            debug_assert!(input.len() >= num_frames);
            bus.set_external_data(input.as_ptr() as *mut Sample);
            bus.set_epoch(epoch);
        }
        for (bus, output) in self
            .ctx
            .buses
            .external_outputs
            .iter_mut()
            .zip(outputs.iter_mut())
        {
            debug_assert!(output.len() >= num_frames);
            bus.set_external_data(output.as_mut_ptr());
        }

        self.done_slots.clear();
        Self::process_group(
            &mut self.nodes,
            &mut self.ctx,
            &mut self.done_slots,
            self.root,
            num_frames,
        );
        self.finish_done_synths();
        self.apply_pending_refs();

        for (bus, output) in self
            .ctx
            .buses
            .external_outputs
            .iter_mut()
            .zip(outputs.iter_mut())
        {
            if bus.epoch() != epoch {
                silence(&mut output[..num_frames]);
            }
            bus.set_external_data(null_mut());
        }
        for bus in self.ctx.buses.external_inputs.iter_mut() {
            bus.set_external_data(null_mut());
        }

        self.ctx.epoch += 1;
    }

    fn process_group(
        nodes: &mut NodeArena,
        ctx: &mut RtContext,
        done: &mut Vec<Slot>,
        slot: Slot,
        num_frames: usize,
    ) {
        let mut cur = nodes.first_child(slot);
        while let Some(child) = cur {
            // Read the link before processing: a done synth must not be
            // able to invalidate the cursor.
            let next = nodes.next_sibling(child);
            if nodes.node(child).is_group() {
                Self::process_group(nodes, ctx, done, child, num_frames);
            } else if let NodeBody::Synth(synth) = &mut nodes.node_mut(child).body {
                if synth.process(ctx, num_frames) && done.len() < done.capacity() {
                    done.push(child);
                }
            }
            cur = next;
        }
    }

    /// Free synths that reported completion during the walk
    fn finish_done_synths(&mut self) {
        while let Some(slot) = self.done_slots.pop() {
            self.free_slot(slot);
        }
        while let Some(instance) = self.ctx.pending_done.pop() {
            if let Some(slot) = self.nodes.find_by_instance(instance) {
                self.free_slot(slot);
            }
        }
    }

    /// Apply deferred retain/release deltas
    fn apply_pending_refs(&mut self) {
        while let Some((instance, delta)) = self.ctx.pending_refs.pop() {
            let Some(slot) = self.nodes.find_by_instance(instance) else {
                continue;
            };
            if delta > 0 {
                self.nodes.node_mut(slot).header.refs += delta as u32;
            } else {
                for _ in 0..-delta {
                    self.release_node(slot);
                }
            }
        }
    }

    /// Remove a node (and, for groups, its whole subtree) from the tree
    /// and the id map, then drop its liveness reference
    fn free_slot(&mut self, slot: Slot) {
        if slot == self.root {
            return;
        }
        while let Some(child) = self.nodes.first_child(slot) {
            self.free_slot(child);
        }
        self.nodes.unlink(slot);
        let id = self.nodes.node(slot).header.id;
        if self.nodes.lookup(id) == Some(slot) {
            self.nodes.remove_mapping(id);
        }
        self.release_node(slot);
    }

    /// Drop one liveness reference; at zero, destruction of the plugin
    /// instance goes to the worker and the chunk comes back to the arena
    fn release_node(&mut self, slot: Slot) {
        let header = &mut self.nodes.node_mut(slot).header;
        header.refs = header.refs.saturating_sub(1);
        if header.refs > 0 {
            return;
        }
        self.nodes.unlink(slot);
        let id = self.nodes.node(slot).header.id;
        if self.nodes.lookup(id) == Some(slot) {
            self.nodes.remove_mapping(id);
        }
        let node = self.nodes.take(slot);
        if let NodeBody::Synth(synth) = node.body {
            let (destroy, instance, chunk) = synth.destroy_parts();
            let command = ToWorker::FreeSynth {
                destroy,
                instance: SendPtr(instance),
                chunk: SendPtr(chunk as *mut ()),
            };
            if self.ctx.to_worker.try_send(command).is_err() {
                // Worker queue full: reclaim the memory at least; the
                // plugin destructor is skipped.
                unsafe { self.ctx.rt_mem.free(chunk) };
            }
        }
    }

    // -----------------------------------------------------------------------
    // Request pipeline
    // -----------------------------------------------------------------------

    fn process_requests(&mut self, current_time: Time) {
        while let Ok(request) = self.requests_rx.try_recv() {
            let disposition = match request.packet() {
                OscPacket::Bundle(bundle) => {
                    if self.process_bundle_phase1(bundle) {
                        let tag = bundle.timetag;
                        let immediate = timetag_is_immediate(tag.seconds, tag.fractional);
                        let time = timetag_to_seconds(tag.seconds, tag.fractional);
                        if immediate || time <= current_time {
                            self.process_bundle_phase2(bundle, current_time, current_time);
                            Disposition::Done
                        } else {
                            Disposition::Schedule(time)
                        }
                    } else {
                        Disposition::Done
                    }
                }
                OscPacket::Message(message) => {
                    if self.process_message_phase1(message) {
                        self.process_message_phase2(message, current_time, current_time);
                    }
                    Disposition::Done
                }
            };
            if let Disposition::Schedule(time) = disposition {
                // On overflow the clone is dropped here, which is safe:
                // `request` still holds a reference, so this drop is a
                // plain counter decrement.
                if let Err(e) = self.scheduler.push(time, request.clone()) {
                    self.reply_error(NOTIFICATION_ID, e);
                }
            }
            self.release_request(request);
        }
    }

    fn process_scheduler(&mut self, current_time: Time, next_time: Time) {
        while !self.scheduler.is_empty() && self.scheduler.time() <= next_time {
            let item = self.scheduler.pop();
            let schedule_time = item.time();
            match item.request.packet() {
                OscPacket::Bundle(bundle) => {
                    self.process_bundle_phase2(bundle, schedule_time, current_time)
                }
                OscPacket::Message(message) => {
                    self.process_message_phase2(message, schedule_time, current_time)
                }
            }
            self.release_request(item.request);
        }
    }

    /// Phase 1 of a bundle: run the immediate part of every contained
    /// message. Returns true when any of them needs a phase 2.
    fn process_bundle_phase1(&mut self, bundle: &OscBundle) -> bool {
        let mut needs_scheduling = false;
        for packet in &bundle.content {
            needs_scheduling |= match packet {
                OscPacket::Bundle(inner) => self.process_bundle_phase1(inner),
                OscPacket::Message(message) => self.process_message_phase1(message),
            };
        }
        needs_scheduling
    }

    /// Phase 2 of a bundle; nested bundles are flattened onto the outer
    /// deadline
    fn process_bundle_phase2(&mut self, bundle: &OscBundle, schedule_time: Time, current_time: Time) {
        for packet in &bundle.content {
            match packet {
                OscPacket::Bundle(inner) => {
                    self.process_bundle_phase2(inner, schedule_time, current_time)
                }
                OscPacket::Message(message) => {
                    self.process_message_phase2(message, schedule_time, current_time)
                }
            }
        }
    }

    fn process_message_phase1(&mut self, message: &OscMessage) -> bool {
        let mut args = Args::new(&message.args);
        let request_id = args.int32().unwrap_or(NOTIFICATION_ID);
        match self.dispatch_phase1(message.addr.as_str(), request_id, args) {
            Ok(needs_scheduling) => needs_scheduling,
            Err(error) => {
                self.reply_error(request_id, error);
                false
            }
        }
    }

    fn process_message_phase2(
        &mut self,
        message: &OscMessage,
        schedule_time: Time,
        current_time: Time,
    ) {
        let mut args = Args::new(&message.args);
        let request_id = args.int32().unwrap_or(NOTIFICATION_ID);
        if let Err(error) = self.dispatch_phase2(
            message.addr.as_str(),
            request_id,
            args,
            schedule_time,
            current_time,
        ) {
            self.reply_error(request_id, error);
        }
    }

    /// Immediate part of a message. Returns true when the message has a
    /// deadline part that phase 2 must execute.
    fn dispatch_phase1(
        &mut self,
        addr: &str,
        request_id: i32,
        mut args: Args,
    ) -> EngineResult<bool> {
        match addr {
            "/group/new" => {
                let node_id = NodeId(args.int32()? as u32);
                let target_id = NodeId(args.int32()? as u32);
                let action = AddAction::from_i32(args.int32()?)?;
                let target = self
                    .nodes
                    .lookup(target_id)
                    .ok_or(EngineError::NodeId(target_id.0))?;
                self.validate_link(target, action)?;
                let slot = self.nodes.insert(Node::group(node_id))?;
                self.nodes
                    .link(slot, target, action)
                    .expect("link was validated");
                self.reply_ack_node(request_id, node_id);
                Ok(false)
            }
            "/synth/new" => {
                let uri = args.string()?;
                let node_id = NodeId(args.int32()? as u32);
                let target_id = NodeId(args.int32()? as u32);
                let action = AddAction::from_i32(args.int32()?)?;
                let control_inits = args.array()?;
                let synth_args = args.array()?;

                let target = self
                    .nodes
                    .lookup(target_id)
                    .ok_or(EngineError::NodeId(target_id.0))?;
                self.validate_link(target, action)?;
                if self.nodes.contains(node_id) {
                    return Err(EngineError::NodeId(node_id.0));
                }
                if !self.nodes.has_free() {
                    return Err(EngineError::OutOfMemory);
                }
                let def = self
                    .host
                    .registry
                    .lookup(uri)
                    .ok_or(EngineError::SynthDefNotFound)?;

                let state =
                    SynthState::construct(&mut self.ctx, def, control_inits, synth_args)?;
                let slot = self
                    .nodes
                    .insert(Node::synth(node_id, state))
                    .expect("capacity and id were checked");
                self.nodes
                    .link(slot, target, action)
                    .expect("link was validated");
                // Activation (and the ack) happen in phase 2, at the
                // schedule deadline.
                Ok(true)
            }
            "/query/external_inputs" => {
                self.post(ToWorker::QueryReply {
                    request_id,
                    count: self.ctx.buses.external_inputs.len(),
                });
                Ok(false)
            }
            "/query/external_outputs" => {
                self.post(ToWorker::QueryReply {
                    request_id,
                    count: self.ctx.buses.external_outputs.len(),
                });
                Ok(false)
            }
            // Everything else executes at the deadline.
            _ => Ok(true),
        }
    }

    /// Deadline part of a message
    fn dispatch_phase2(
        &mut self,
        addr: &str,
        request_id: i32,
        mut args: Args,
        schedule_time: Time,
        current_time: Time,
    ) -> EngineResult<()> {
        match addr {
            "/synth/new" => {
                let _uri = args.string()?;
                let node_id = NodeId(args.int32()? as u32);
                let slot = self
                    .nodes
                    .lookup(node_id)
                    .ok_or(EngineError::NodeId(node_id.0))?;
                let sample_rate = self.ctx.sample_rate;
                let NodeBody::Synth(synth) = &mut self.nodes.node_mut(slot).body else {
                    return Err(EngineError::NodeType(node_id.0));
                };
                let offset = ((schedule_time - current_time) * sample_rate)
                    .round()
                    .max(0.0) as usize;
                synth.activate(offset);
                self.reply_ack_node(request_id, node_id);
                Ok(())
            }
            "/node/free" => {
                let node_id = NodeId(args.int32()? as u32);
                let slot = self
                    .nodes
                    .lookup(node_id)
                    .ok_or(EngineError::NodeId(node_id.0))?;
                if node_id == NodeId::ROOT {
                    return Err(EngineError::NodeId(node_id.0));
                }
                self.free_slot(slot);
                self.reply_ack(request_id);
                Ok(())
            }
            "/node/set" => {
                let node_id = NodeId(args.int32()? as u32);
                let index = args.int32()?;
                let value = args.float32()?;
                let slot = self
                    .nodes
                    .lookup(node_id)
                    .ok_or(EngineError::NodeId(node_id.0))?;
                let NodeBody::Synth(synth) = &mut self.nodes.node_mut(slot).body else {
                    return Err(EngineError::NodeType(node_id.0));
                };
                let index = usize::try_from(index)
                    .map_err(|_| EngineError::PortIndexOutOfRange(index as u32))?;
                synth.set_control_input(index, value)?;
                self.reply_ack(request_id);
                Ok(())
            }
            "/synth/map/input" => {
                let (synth, index, bus, flags) = self.map_target(&mut args)?;
                let kind = if flags & BUS_MAPPING_FEEDBACK != 0 {
                    InputType::InFeedback
                } else {
                    InputType::In
                };
                let binding = if flags & BUS_MAPPING_EXTERNAL != 0 {
                    BusBinding::ExternalInput(bus)
                } else {
                    BusBinding::Internal(bus)
                };
                if !self.ctx.buses.contains(binding) {
                    return Err(EngineError::InvalidArgument);
                }
                let NodeBody::Synth(state) = &mut self.nodes.node_mut(synth).body else {
                    unreachable!("map_target only returns synth slots");
                };
                state.map_input(index, Some(binding), kind)?;
                self.reply_ack(request_id);
                Ok(())
            }
            "/synth/map/output" => {
                let (synth, index, bus, flags) = self.map_target(&mut args)?;
                let kind = if flags & BUS_MAPPING_REPLACE != 0 {
                    OutputType::ReplaceOut
                } else {
                    OutputType::Out
                };
                let binding = if flags & BUS_MAPPING_EXTERNAL != 0 {
                    BusBinding::ExternalOutput(bus)
                } else {
                    BusBinding::Internal(bus)
                };
                if !self.ctx.buses.contains(binding) {
                    return Err(EngineError::InvalidArgument);
                }
                let NodeBody::Synth(state) = &mut self.nodes.node_mut(synth).body else {
                    unreachable!("map_target only returns synth slots");
                };
                state.map_output(index, Some(binding), kind)?;
                self.reply_ack(request_id);
                Ok(())
            }
            // Unrecognized addresses are ignored, matching the tolerance
            // of the wire protocol toward newer clients.
            _ => Ok(()),
        }
    }

    /// Common argument handling for the map messages: resolves the synth
    /// slot and parses (index, busId, flags)
    fn map_target(&mut self, args: &mut Args) -> EngineResult<(Slot, usize, u32, i32)> {
        let node_id = NodeId(args.int32()? as u32);
        let index = args.int32()?;
        let bus = args.int32()?;
        let flags = args.int32()?;
        let slot = self
            .nodes
            .lookup(node_id)
            .ok_or(EngineError::NodeId(node_id.0))?;
        if self.nodes.node(slot).is_group() {
            return Err(EngineError::NodeType(node_id.0));
        }
        let index = usize::try_from(index)
            .map_err(|_| EngineError::PortIndexOutOfRange(index as u32))?;
        let bus = u32::try_from(bus).map_err(|_| EngineError::InvalidArgument)?;
        Ok((slot, index, bus, flags))
    }

    /// Nodes linked with Before/After need a target that has a parent
    fn validate_link(&self, target: Slot, action: AddAction) -> EngineResult<()> {
        if matches!(action, AddAction::Before | AddAction::After)
            && self.nodes.node(target).header.parent.is_none()
        {
            return Err(EngineError::NodeId(self.nodes.node(target).header.id.0));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker plumbing
    // -----------------------------------------------------------------------

    /// Run continuations the workers posted for the audio thread
    fn run_rt_commands(&mut self) {
        while let Ok(command) = self.from_worker_rx.try_recv() {
            match command {
                FromWorker::Perform { f, data } => {
                    let mut world = self.ctx.world();
                    f(&mut world, data.0);
                }
                FromWorker::ReclaimChunk(chunk) => {
                    // SAFETY: the chunk was allocated from this arena by
                    // SynthState::construct and the worker has destroyed
                    // the instance it held.
                    unsafe { self.ctx.rt_mem.free(chunk.0 as *mut u8) };
                }
            }
        }
    }

    /// Route a request release to the worker; the audio thread must not
    /// perform the final drop itself
    fn release_request(&mut self, request: Request) {
        if let Err(TrySendError::Full(ToWorker::DropRequest(request))) = self
            .ctx
            .to_worker
            .try_send(ToWorker::DropRequest(request))
        {
            if self.pending_releases.len() < self.pending_releases.capacity() {
                self.pending_releases.push(request);
            }
        }
    }

    fn flush_pending_releases(&mut self) {
        while let Some(request) = self.pending_releases.pop() {
            if let Err(TrySendError::Full(ToWorker::DropRequest(request))) = self
                .ctx
                .to_worker
                .try_send(ToWorker::DropRequest(request))
            {
                self.pending_releases.push(request);
                break;
            }
        }
    }

    fn post(&self, command: ToWorker) {
        // A full queue drops the reply; the request itself already
        // executed.
        let _ = self.ctx.to_worker.try_send(command);
    }

    fn reply_ack(&self, request_id: i32) {
        if request_id != NOTIFICATION_ID {
            self.post(ToWorker::Ack {
                request_id,
                extra: SmallVec::new(),
            });
        }
    }

    fn reply_ack_node(&self, request_id: i32, node: NodeId) {
        if request_id != NOTIFICATION_ID {
            self.post(ToWorker::Ack {
                request_id,
                extra: smallvec![node.0 as i32],
            });
        }
    }

    fn reply_error(&self, request_id: i32, error: EngineError) {
        self.post(ToWorker::Error { request_id, error });
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        for library in self.libraries.drain(..) {
            if let Some(destroy) = library.destroy {
                destroy(library.handle);
            }
        }
        // Replacing the sender disconnects the worker inbox; the pool
        // drains whatever is queued and exits.
        let (detached, _) = bounded(1);
        drop(std::mem::replace(&mut self.ctx.to_worker, detached));
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        log::info!("aria engine stopped");
    }
}
