//! End-to-end engine tests
//!
//! Drives `Environment::process` directly, the way the platform driver
//! would, and observes replies through a channel-backed packet handler.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use rosc::{decoder, OscArray, OscBundle, OscMessage, OscPacket, OscTime, OscType};

use aria_core::{seconds_to_timetag, Sample};
use aria_engine::{
    EngineHandle, EngineOptions, Environment, NodeId, BUS_MAPPING_EXTERNAL, QUEUE_SIZE,
};
use aria_plugin::{
    builtin_library, synth_def, Host, Library, PortDescriptor, SynthPlugin, World, DONE_AFTER_URI,
    SILENCE_URI, SINE_URI,
};

const SAMPLE_RATE: f64 = 48_000.0;
const BLOCK_SIZE: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════
// TEST PLUGIN: DC source (control 0 sets the output level)
// ═══════════════════════════════════════════════════════════════════════════

const DC_URI: &str = "test.dc";

struct Dc {
    out: *mut Sample,
    value: *mut Sample,
}

// SAFETY: port pointers reference engine-owned buffers; instances never
// leave the engine's threads.
unsafe impl Send for Dc {}

impl SynthPlugin for Dc {
    type Options = ();

    fn port(_options: &(), index: usize) -> Option<PortDescriptor> {
        match index {
            0 => Some(PortDescriptor::audio_out()),
            1 => Some(PortDescriptor::control_in()),
            _ => None,
        }
    }

    fn new(_world: &mut World, _options: &()) -> Self {
        Self {
            out: std::ptr::null_mut(),
            value: std::ptr::null_mut(),
        }
    }

    fn connect(&mut self, port: usize, data: *mut Sample) {
        match port {
            0 => self.out = data,
            1 => self.value = data,
            _ => {}
        }
    }

    fn process(&mut self, _world: &mut World, num_frames: usize) {
        // SAFETY: ports are connected before the first process call.
        unsafe {
            let value = *self.value;
            std::slice::from_raw_parts_mut(self.out, num_frames).fill(value);
        }
    }
}

fn test_library(host: &mut Host) -> Library {
    host.register_synth_def(synth_def::<Dc>(DC_URI));
    Library::default()
}

// ═══════════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════════

struct TestEngine {
    env: Environment,
    handle: EngineHandle,
    replies: Receiver<OscMessage>,
    outputs: Vec<Vec<Sample>>,
    block: u64,
}

impl TestEngine {
    fn new() -> Self {
        Self::with_options(EngineOptions {
            sample_rate: SAMPLE_RATE,
            block_size: BLOCK_SIZE,
            num_hardware_input_channels: 0,
            num_hardware_output_channels: 2,
            ..EngineOptions::default()
        })
    }

    fn with_options(options: EngineOptions) -> Self {
        let (tx, replies) = unbounded();
        let handler = Box::new(move |bytes: &[u8]| {
            if let Ok((_, OscPacket::Message(message))) = decoder::decode_udp(bytes) {
                let _ = tx.send(message);
            }
        });
        let outputs = vec![vec![0.0; options.block_size]; options.num_hardware_output_channels];
        let (mut env, handle) = Environment::new(handler, options);
        env.load_plugins(&[builtin_library, test_library]);
        Self {
            env,
            handle,
            replies,
            outputs,
            block: 0,
        }
    }

    fn block_start(&self) -> f64 {
        (self.block * BLOCK_SIZE as u64) as f64 / SAMPLE_RATE
    }

    /// Run one block; outputs are pre-filled with a marker value so
    /// "zeroed" is distinguishable from "untouched"
    fn process_block(&mut self) {
        let time = self.block_start();
        for channel in &mut self.outputs {
            channel.fill(123.0);
        }
        let mut outputs: Vec<&mut [Sample]> =
            self.outputs.iter_mut().map(|c| c.as_mut_slice()).collect();
        self.env.process(time, BLOCK_SIZE, &[], &mut outputs);
        self.block += 1;
    }

    fn output(&self, channel: usize) -> &[Sample] {
        &self.outputs[channel]
    }

    fn reply(&self) -> OscMessage {
        self.replies
            .recv_timeout(Duration::from_secs(2))
            .expect("expected a reply")
    }

    /// Wait for an `/error` reply, skipping acks
    fn error_reply(&self) -> (i32, i32, String) {
        loop {
            let message = self.reply();
            if message.addr == "/error" {
                let id = match message.args[0] {
                    OscType::Int(v) => v,
                    _ => panic!("bad /error reply"),
                };
                let code = match message.args[1] {
                    OscType::Int(v) => v,
                    _ => panic!("bad /error reply"),
                };
                let text = match &message.args[2] {
                    OscType::String(s) => s.clone(),
                    _ => panic!("bad /error reply"),
                };
                return (id, code, text);
            }
        }
    }

    /// Collect `count` acks; the worker pool may deliver them in any
    /// order, so callers match on request ids
    fn recv_acks(&self, count: usize) -> Vec<(i32, Vec<i32>)> {
        let mut acks = Vec::new();
        while acks.len() < count {
            let message = self.reply();
            assert_ne!(message.addr, "/error", "unexpected error: {message:?}");
            if message.addr != "/ack" {
                continue;
            }
            let mut ints = message.args.iter().map(|a| match a {
                OscType::Int(v) => *v,
                other => panic!("non-int ack arg: {other:?}"),
            });
            let request_id = ints.next().expect("empty ack");
            acks.push((request_id, ints.collect()));
        }
        acks.sort();
        acks
    }

    /// Wait for the `/ack` of a given request id
    fn ack_reply(&self, request_id: i32) -> Vec<i32> {
        loop {
            let message = self.reply();
            assert_ne!(message.addr, "/error", "unexpected error: {message:?}");
            if message.addr == "/ack" && message.args.first() == Some(&OscType::Int(request_id)) {
                return message.args[1..]
                    .iter()
                    .map(|a| match a {
                        OscType::Int(v) => *v,
                        other => panic!("non-int ack arg: {other:?}"),
                    })
                    .collect();
            }
        }
    }

    fn assert_no_replies(&self) {
        if let Ok(message) = self.replies.recv_timeout(Duration::from_millis(200)) {
            panic!("unexpected reply: {message:?}");
        }
    }
}

fn message(addr: &str, args: Vec<OscType>) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: addr.into(),
        args,
    })
}

fn bundle(timetag: OscTime, content: Vec<OscPacket>) -> OscPacket {
    OscPacket::Bundle(OscBundle { timetag, content })
}

fn immediately() -> OscTime {
    OscTime {
        seconds: 0,
        fractional: 1,
    }
}

fn at(seconds: f64) -> OscTime {
    let (secs, frac) = seconds_to_timetag(seconds);
    OscTime {
        seconds: secs,
        fractional: frac,
    }
}

fn floats(values: &[f32]) -> OscType {
    OscType::Array(OscArray {
        content: values.iter().map(|v| OscType::Float(*v)).collect(),
    })
}

/// `/synth/new requestId uri nodeId targetId addAction [controls] [args]`
fn synth_new(request_id: i32, uri: &str, node: u32, target: u32, controls: &[f32]) -> OscPacket {
    message(
        "/synth/new",
        vec![
            OscType::Int(request_id),
            OscType::String(uri.into()),
            OscType::Int(node as i32),
            OscType::Int(target as i32),
            OscType::Int(1), // add to tail
            floats(controls),
        ],
    )
}

/// `/synth/map/output requestId nodeId index busId flags`
fn map_output(request_id: i32, node: u32, index: i32, bus: i32, flags: i32) -> OscPacket {
    message(
        "/synth/map/output",
        vec![
            OscType::Int(request_id),
            OscType::Int(node as i32),
            OscType::Int(index),
            OscType::Int(bus),
            OscType::Int(flags),
        ],
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_empty_engine_outputs_silence() {
    let mut engine = TestEngine::new();
    assert_eq!(engine.env.epoch(), 0);

    engine.process_block();

    assert_eq!(engine.output(0), &[0.0; BLOCK_SIZE][..]);
    assert_eq!(engine.output(1), &[0.0; BLOCK_SIZE][..]);
    assert_eq!(engine.env.epoch(), 1);
}

#[test]
fn test_epoch_advances_once_per_block() {
    let mut engine = TestEngine::new();
    for expected in 1..=10 {
        engine.process_block();
        assert_eq!(engine.env.epoch(), expected);
    }
}

#[test]
fn test_immediate_synth_in_bundle() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(bundle(
            immediately(),
            vec![
                message(
                    "/group/new",
                    vec![OscType::Int(1), OscType::Int(1), OscType::Int(0), OscType::Int(1)],
                ),
                synth_new(2, SILENCE_URI, 2, 1, &[]),
                map_output(3, 2, 0, 0, BUS_MAPPING_EXTERNAL),
            ],
        ))
        .unwrap();

    engine.process_block();

    assert!(engine.env.contains_node(NodeId(1)));
    assert!(engine.env.contains_node(NodeId(2)));
    assert_eq!(engine.env.node_is_active(NodeId(2)), Some(true));
    assert_eq!(engine.output(0), &[0.0; BLOCK_SIZE][..]);

    assert_eq!(
        engine.recv_acks(3),
        vec![(1, vec![1]), (2, vec![2]), (3, vec![])]
    );
}

#[test]
fn test_deferred_activation() {
    let mut engine = TestEngine::new();

    // Deadline 16 samples into block 375 (t = 0.5s at 48kHz / 64 frames).
    let deadline = (375.0 * BLOCK_SIZE as f64 + 16.0) / SAMPLE_RATE;
    engine
        .handle
        .send_packet(bundle(
            at(deadline),
            vec![
                synth_new(0, DC_URI, 10, 0, &[0.5]),
                map_output(0, 10, 0, 0, BUS_MAPPING_EXTERNAL),
            ],
        ))
        .unwrap();

    // The synth is constructed as soon as the request is seen...
    engine.process_block();
    assert!(engine.env.contains_node(NodeId(10)));
    assert_eq!(engine.env.node_is_active(NodeId(10)), Some(false));
    assert_eq!(engine.output(0), &[0.0; BLOCK_SIZE][..]);

    // ...but does not run before its deadline.
    for _ in 1..375 {
        engine.process_block();
        assert_eq!(engine.env.node_is_active(NodeId(10)), Some(false));
        assert_eq!(engine.output(0), &[0.0; BLOCK_SIZE][..]);
    }

    // Activation block: silent up to the sample offset, signal after.
    engine.process_block();
    assert_eq!(engine.env.node_is_active(NodeId(10)), Some(true));
    let out = engine.output(0);
    // ±1 sample of timetag rounding slack around the expected offset.
    assert!(out[..15].iter().all(|&s| s == 0.0), "expected silent prefix");
    assert!(out[17..].iter().all(|&s| s == 0.5), "expected signal tail");

    // Subsequent blocks carry the full signal.
    engine.process_block();
    assert_eq!(engine.output(0), &[0.5; BLOCK_SIZE][..]);
}

#[test]
fn test_accumulation_on_shared_bus() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(bundle(
            immediately(),
            vec![
                synth_new(0, DC_URI, 1, 0, &[0.25]),
                synth_new(0, DC_URI, 2, 0, &[0.5]),
                map_output(0, 1, 0, 3, 0),
                map_output(0, 2, 0, 3, 0),
            ],
        ))
        .unwrap();

    engine.process_block();

    let mut bus = [0.0; BLOCK_SIZE];
    assert!(engine.env.read_internal_bus(3, &mut bus));
    assert_eq!(bus, [0.75; BLOCK_SIZE]);
    // The bus was stamped with the epoch of the block just processed.
    assert_eq!(engine.env.internal_bus_epoch(3), Some(engine.env.epoch() - 1));
}

#[test]
fn test_scheduler_overflow_reports_error() {
    let mut engine = TestEngine::new();

    // Fill the scheduler to capacity with far-future bundles: the request
    // queue holds exactly one scheduler's worth, drained in one block.
    let far = at(1_000.0);
    for _ in 0..QUEUE_SIZE {
        engine
            .handle
            .send_packet(bundle(
                far,
                vec![message(
                    "/node/set",
                    vec![
                        OscType::Int(0),
                        OscType::Int(999),
                        OscType::Int(0),
                        OscType::Float(0.0),
                    ],
                )],
            ))
            .unwrap();
    }
    engine.process_block();

    // One more timetagged bundle overflows the scheduler.
    engine
        .handle
        .send_packet(bundle(
            far,
            vec![message(
                "/node/set",
                vec![
                    OscType::Int(0),
                    OscType::Int(999),
                    OscType::Int(0),
                    OscType::Float(0.0),
                ],
            )],
        ))
        .unwrap();
    engine.process_block();

    let (_, code, text) = engine.error_reply();
    assert_eq!(code, 5);
    assert!(text.contains("queue overflow"));

    // The engine keeps serving requests afterwards.
    engine
        .handle
        .send_packet(message(
            "/group/new",
            vec![OscType::Int(9), OscType::Int(42), OscType::Int(0), OscType::Int(1)],
        ))
        .unwrap();
    engine.process_block();
    assert!(engine.env.contains_node(NodeId(42)));
}

#[test]
fn test_request_queue_overflow_at_send() {
    let engine = TestEngine::new();
    let packet = message("/node/free", vec![OscType::Int(0), OscType::Int(1)]);

    for _ in 0..QUEUE_SIZE {
        engine.handle.send_packet(packet.clone()).unwrap();
    }
    assert!(engine.handle.send_packet(packet).is_err());
}

#[test]
fn test_free_unknown_node() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(message(
            "/node/free",
            vec![OscType::Int(7), OscType::Int(9999)],
        ))
        .unwrap();

    engine.process_block();

    let (request_id, code, text) = engine.error_reply();
    assert_eq!(request_id, 7);
    assert_eq!(code, 1);
    assert!(text.contains("9999"));
    assert_eq!(engine.env.num_nodes(), 1); // just the root

    // Subsequent requests are still processed.
    engine
        .handle
        .send_packet(message(
            "/group/new",
            vec![OscType::Int(8), OscType::Int(5), OscType::Int(0), OscType::Int(1)],
        ))
        .unwrap();
    engine.process_block();
    assert!(engine.env.contains_node(NodeId(5)));
}

// ═══════════════════════════════════════════════════════════════════════════
// PROTOCOL DETAILS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_free_root_is_rejected() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(message(
            "/node/free",
            vec![OscType::Int(3), OscType::Int(0)],
        ))
        .unwrap();

    engine.process_block();

    let (request_id, code, _) = engine.error_reply();
    assert_eq!(request_id, 3);
    assert_eq!(code, 1);
    assert!(engine.env.contains_node(NodeId::ROOT));
}

#[test]
fn test_node_set_roundtrip() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(bundle(
            immediately(),
            vec![
                synth_new(0, DC_URI, 1, 0, &[0.1]),
                map_output(0, 1, 0, 0, BUS_MAPPING_EXTERNAL),
            ],
        ))
        .unwrap();
    engine.process_block();
    assert_eq!(engine.env.control_input(NodeId(1), 0), Some(0.1));

    engine
        .handle
        .send_packet(message(
            "/node/set",
            vec![
                OscType::Int(0),
                OscType::Int(1),
                OscType::Int(0),
                OscType::Float(0.25),
            ],
        ))
        .unwrap();
    engine.process_block();

    // The plugin observes the exact value on its control port.
    assert_eq!(engine.env.control_input(NodeId(1), 0), Some(0.25));
    assert_eq!(engine.output(0), &[0.25; BLOCK_SIZE][..]);
}

#[test]
fn test_node_set_out_of_range_index() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(bundle(immediately(), vec![synth_new(0, DC_URI, 1, 0, &[])]))
        .unwrap();
    engine.process_block();

    engine
        .handle
        .send_packet(message(
            "/node/set",
            vec![
                OscType::Int(4),
                OscType::Int(1),
                OscType::Int(13),
                OscType::Float(0.0),
            ],
        ))
        .unwrap();
    engine.process_block();

    let (request_id, code, _) = engine.error_reply();
    assert_eq!(request_id, 4);
    assert_eq!(code, 4);
}

#[test]
fn test_unknown_synthdef() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(bundle(
            immediately(),
            vec![synth_new(11, "aria.nonexistent", 1, 0, &[])],
        ))
        .unwrap();
    engine.process_block();

    let (request_id, code, _) = engine.error_reply();
    assert_eq!(request_id, 11);
    assert_eq!(code, 3);
    assert!(!engine.env.contains_node(NodeId(1)));
}

#[test]
fn test_group_free_is_recursive() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(bundle(
            immediately(),
            vec![
                message(
                    "/group/new",
                    vec![OscType::Int(0), OscType::Int(1), OscType::Int(0), OscType::Int(1)],
                ),
                synth_new(0, SILENCE_URI, 2, 1, &[]),
                synth_new(0, SILENCE_URI, 3, 1, &[]),
            ],
        ))
        .unwrap();
    engine.process_block();
    assert_eq!(engine.env.num_nodes(), 4);

    engine
        .handle
        .send_packet(message(
            "/node/free",
            vec![OscType::Int(0), OscType::Int(1)],
        ))
        .unwrap();
    engine.process_block();

    assert!(!engine.env.contains_node(NodeId(1)));
    assert!(!engine.env.contains_node(NodeId(2)));
    assert!(!engine.env.contains_node(NodeId(3)));
    assert_eq!(engine.env.num_nodes(), 1);
}

#[test]
fn test_done_after_removes_synth() {
    let mut engine = TestEngine::new();
    // 0.001s = 48 frames; done within the first block.
    engine
        .handle
        .send_packet(message(
            "/synth/new",
            vec![
                OscType::Int(0),
                OscType::String(DONE_AFTER_URI.into()),
                OscType::Int(1),
                OscType::Int(0),
                OscType::Int(1),
                floats(&[]),
                floats(&[0.001]),
            ],
        ))
        .unwrap();

    engine.process_block();
    assert!(!engine.env.contains_node(NodeId(1)));

    // The engine keeps running after the deferred destruction.
    engine.process_block();
    engine.process_block();
}

#[test]
fn test_sine_produces_bounded_signal() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(bundle(
            immediately(),
            vec![
                synth_new(0, SINE_URI, 1, 0, &[440.0, 0.5]),
                map_output(0, 1, 0, 0, BUS_MAPPING_EXTERNAL),
            ],
        ))
        .unwrap();

    engine.process_block();
    engine.process_block();

    let out = engine.output(0);
    assert!(out.iter().any(|&s| s != 0.0));
    assert!(out.iter().all(|&s| s.abs() <= 0.5 + 1e-6));
}

#[test]
fn test_query_external_outputs() {
    let mut engine = TestEngine::new();
    engine
        .handle
        .send_packet(message("/query/external_outputs", vec![OscType::Int(21)]))
        .unwrap();
    engine.process_block();
    assert_eq!(engine.ack_reply(21), vec![0, 1]);

    engine
        .handle
        .send_packet(message("/query/external_inputs", vec![OscType::Int(22)]))
        .unwrap();
    engine.process_block();
    assert_eq!(engine.ack_reply(22), Vec::<i32>::new());
}

#[test]
fn test_same_deadline_executes_in_submission_order() {
    let mut engine = TestEngine::new();
    let deadline = (10.0 * BLOCK_SIZE as f64) / SAMPLE_RATE;

    // Two /node/set bundles with the same deadline: the later submission
    // must win.
    for value in [0.25f32, 0.75] {
        engine
            .handle
            .send_packet(bundle(
                at(deadline),
                vec![message(
                    "/node/set",
                    vec![
                        OscType::Int(0),
                        OscType::Int(1),
                        OscType::Int(0),
                        OscType::Float(value),
                    ],
                )],
            ))
            .unwrap();
    }
    engine
        .handle
        .send_packet(bundle(immediately(), vec![synth_new(0, DC_URI, 1, 0, &[0.0])]))
        .unwrap();

    for _ in 0..=10 {
        engine.process_block();
    }
    assert_eq!(engine.env.control_input(NodeId(1), 0), Some(0.75));
}

#[test]
fn test_malformed_packet_rejected_at_send() {
    let engine = TestEngine::new();
    assert!(engine.handle.send(&[1, 2, 3, 4]).is_err());
    engine.assert_no_replies();
}

#[test]
fn test_bundle_messages_execute_in_order() {
    let mut engine = TestEngine::new();
    // Create and immediately free in one bundle; the engine ends the
    // block with just the root node.
    engine
        .handle
        .send_packet(bundle(
            immediately(),
            vec![
                message(
                    "/group/new",
                    vec![OscType::Int(0), OscType::Int(1), OscType::Int(0), OscType::Int(1)],
                ),
                message("/node/free", vec![OscType::Int(0), OscType::Int(1)]),
            ],
        ))
        .unwrap();
    engine.process_block();
    assert!(!engine.env.contains_node(NodeId(1)));
    assert_eq!(engine.env.num_nodes(), 1);
}
