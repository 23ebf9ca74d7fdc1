//! Whole-session scenarios against the loopback codec, plus a few against
//! a codec that never hands buffers back.

use std::{sync::Arc, time::Duration};

use crate::{
    common::errors::{ComponentError, PipelineError},
    configs::{CodecParamsConfig, EncoderConfig, InputMode, TimeoutConfig},
    encoder::{
        ByteStreamVariant, ChannelSink, CodecVariant, EncoderPipeline, Frame, FramePayload,
        GenericVariant, PixelFormat, SinkEvent, SubmitOutcome, VideoFormat,
    },
    omx::{
        BufferFlags, ComponentState, ConfigRequest, ImportHandle, LoopbackCodec, LoopbackOptions,
        PortIndex, TraceEvent, constants::ANNEXB_START_CODE, testing::ManualCodec,
    },
};

const WAIT: Duration = Duration::from_secs(5);
/// Size of a tightly packed 16x16 I420 frame, which is also the input
/// buffer size the port derives for it.
const FRAME_SIZE: usize = 384;

struct Harness {
    pipeline: EncoderPipeline,
    codec: Arc<LoopbackCodec>,
    events: flume::Receiver<SinkEvent>,
}

fn harness_with(
    options: LoopbackOptions,
    config: EncoderConfig,
    variant: Box<dyn CodecVariant>,
) -> Harness {
    let codec = Arc::new(LoopbackCodec::new(options).unwrap());
    let (sink, events) = ChannelSink::new();
    let pipeline = EncoderPipeline::open(codec.clone(), variant, Arc::new(sink), config).unwrap();
    Harness {
        pipeline,
        codec,
        events,
    }
}

fn harness(options: LoopbackOptions) -> Harness {
    harness_with(
        options,
        EncoderConfig::default(),
        Box::new(GenericVariant::new("video/x-test")),
    )
}

/// A pipeline over a codec that keeps every buffer it is given.
fn held_pipeline(
    config: EncoderConfig,
) -> (EncoderPipeline, Arc<ManualCodec>, flume::Receiver<SinkEvent>) {
    let codec = Arc::new(ManualCodec::new());
    let (sink, events) = ChannelSink::new();
    let pipeline = EncoderPipeline::open(
        codec.clone(),
        Box::new(GenericVariant::new("video/x-test")),
        Arc::new(sink),
        config,
    )
    .unwrap();
    (pipeline, codec, events)
}

fn format() -> VideoFormat {
    VideoFormat::new(PixelFormat::I420, 16, 16).with_framerate(30, 1)
}

fn pts(i: u64) -> Duration {
    Duration::from_millis(i * 33)
}

fn frame(i: u64) -> Frame {
    Frame::from_bytes(i, vec![i as u8; FRAME_SIZE])
        .with_pts(pts(i))
        .with_duration(Duration::from_millis(33))
}

fn collect_until_eos(rx: &flume::Receiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx.recv_timeout(WAIT).expect("sink went quiet");
        let done = event == SinkEvent::Eos;
        events.push(event);
        if done {
            return events;
        }
    }
}

fn frame_ids(events: &[SinkEvent]) -> Vec<Option<u64>> {
    events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Frame(f) => Some(f.frame_id),
            _ => None,
        })
        .collect()
}

fn eos_inputs(codec: &LoopbackCodec) -> usize {
    codec
        .trace()
        .iter()
        .filter(|e| {
            matches!(e, TraceEvent::EmptyBuffer { flags, .. } if flags.contains(BufferFlags::END_OF_STREAM))
        })
        .count()
}

#[test]
fn three_frames_come_back_in_order() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    assert_eq!(h.pipeline.component().state(), ComponentState::Executing);

    for i in 0..3 {
        assert_eq!(h.pipeline.submit(frame(i)).unwrap(), SubmitOutcome::Queued);
    }
    h.pipeline.finish().unwrap();

    let events = collect_until_eos(&h.events);
    assert!(matches!(&events[0], SinkEvent::Caps(c) if c.width == 16 && c.fps_n == 30));
    assert_eq!(frame_ids(&events), vec![Some(0), Some(1), Some(2)]);
    assert_eq!(events.len(), 5);

    for (i, event) in events[1..4].iter().enumerate() {
        let SinkEvent::Frame(out) = event else {
            panic!("expected a frame, got {event:?}");
        };
        assert_eq!(out.pts, pts(i as u64));
        assert_eq!(out.duration, Some(Duration::from_millis(33)));
        assert_eq!(out.data.len(), FRAME_SIZE);
        assert!(out.data.iter().all(|b| *b == i as u8));
        assert_eq!(out.sync_point, i == 0);
    }
    assert_eq!(eos_inputs(&h.codec), 1);
}

#[test]
fn forced_keyframe_config_precedes_its_input() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.submit(frame(0)).unwrap();
    h.pipeline.submit(frame(1)).unwrap();
    h.pipeline.submit(frame(2).keyframe()).unwrap();
    h.pipeline.finish().unwrap();

    let events = collect_until_eos(&h.events);
    let sync: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Frame(f) => Some(f.sync_point),
            _ => None,
        })
        .collect();
    assert_eq!(sync, vec![true, false, true]);

    let trace = h.codec.trace();
    let config = trace
        .iter()
        .position(|e| *e == TraceEvent::Config(ConfigRequest::IntraRefresh))
        .expect("keyframe request");
    let input = trace
        .iter()
        .position(|e| matches!(e, TraceEvent::EmptyBuffer { timestamp: 66_000, .. }))
        .expect("keyframe input");
    assert!(config < input);
}

#[test]
fn drain_is_idempotent_and_resumes() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    for i in 0..3 {
        h.pipeline.submit(frame(i)).unwrap();
    }
    h.pipeline.drain().unwrap();
    h.pipeline.drain().unwrap();
    assert_eq!(eos_inputs(&h.codec), 1);

    h.pipeline.submit(frame(3)).unwrap();
    h.pipeline.finish().unwrap();
    assert_eq!(eos_inputs(&h.codec), 2);

    let events = collect_until_eos(&h.events);
    assert_eq!(frame_ids(&events), vec![Some(0), Some(1), Some(2), Some(3)]);
}

#[test]
fn finish_without_frames_only_signals_eos() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.finish().unwrap();

    assert_eq!(h.events.recv_timeout(WAIT).unwrap(), SinkEvent::Eos);
    assert_eq!(eos_inputs(&h.codec), 0);
    assert!(
        !h.codec
            .trace()
            .iter()
            .any(|e| matches!(e, TraceEvent::EmptyBuffer { .. }))
    );
    assert_eq!(h.pipeline.submit(frame(0)).unwrap_err(), PipelineError::Eos);
    h.pipeline.finish().unwrap();
    assert!(h.events.try_recv().is_err());
}

#[test]
fn output_format_change_is_published_between_frames() {
    let h = harness(LoopbackOptions {
        settings_change_after: Some(3),
        ..Default::default()
    });
    h.pipeline.set_format(format()).unwrap();
    for i in 0..5 {
        h.pipeline.submit(frame(i)).unwrap();
    }
    h.pipeline.finish().unwrap();

    let events = collect_until_eos(&h.events);
    let shape: Vec<String> = events
        .iter()
        .map(|e| match e {
            SinkEvent::Caps(c) => format!("caps {}x{}", c.width, c.height),
            SinkEvent::Frame(f) => format!("frame {:?}", f.frame_id),
            other => format!("{other:?}"),
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            "caps 16x16",
            "frame Some(0)",
            "frame Some(1)",
            "frame Some(2)",
            "caps 32x32",
            "frame Some(3)",
            "frame Some(4)",
            "Eos",
        ]
    );
    assert_eq!(h.pipeline.output_caps().map(|c| c.width), Some(32));
    assert!(h.codec.trace().contains(&TraceEvent::SettingsChanged));
}

#[test]
fn withheld_output_buffers_fail_the_session() {
    let config = EncoderConfig {
        timeouts: TimeoutConfig {
            buffers_released_ms: 200,
            flush_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness_with(
        LoopbackOptions {
            settings_change_after: Some(2),
            withhold_on_disable: true,
            ..Default::default()
        },
        config,
        Box::new(GenericVariant::new("video/x-test")),
    );
    h.pipeline.set_format(format()).unwrap();
    for i in 0..3 {
        h.pipeline.submit(frame(i)).unwrap();
    }

    let events = collect_until_eos(&h.events);
    let err = events
        .iter()
        .find_map(|e| match e {
            SinkEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .expect("error pushed downstream");
    assert!(matches!(
        err,
        PipelineError::Reconfigure {
            port: PortIndex::Output,
            source: ComponentError::Timeout { .. },
        }
    ));
    assert_eq!(frame_ids(&events), vec![Some(0), Some(1)]);

    assert_eq!(h.pipeline.submit(frame(3)).unwrap_err(), err);
    assert_eq!(h.pipeline.status().unwrap_err(), err);
}

#[test]
fn short_frame_fails_alone() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();

    let err = h
        .pipeline
        .submit(Frame::from_bytes(0, vec![0u8; 10]).with_pts(pts(0)))
        .unwrap_err();
    assert!(matches!(err, PipelineError::BufferSize(_)));
    assert!(err.is_recoverable());
    assert!(h.pipeline.status().is_ok());

    h.pipeline.submit(frame(1)).unwrap();
    h.pipeline.finish().unwrap();
    let events = collect_until_eos(&h.events);
    assert_eq!(frame_ids(&events), vec![Some(1)]);
    assert!(h.pipeline.component().input().stats().is_conserved());
}

#[test]
fn flush_discards_and_restarts() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.submit(frame(0)).unwrap();
    h.pipeline.submit(frame(1)).unwrap();
    h.pipeline.flush().unwrap();
    assert!(h.pipeline.status().is_ok());

    h.pipeline.submit(frame(2)).unwrap();
    h.pipeline.finish().unwrap();
    let events = collect_until_eos(&h.events);
    assert_eq!(frame_ids(&events).last(), Some(&Some(2)));

    let output = h.pipeline.component().output().stats();
    assert!(output.is_conserved());
}

#[test]
fn renegotiation_reallocates_input() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.submit(frame(0)).unwrap();
    h.pipeline.submit(frame(1)).unwrap();

    let bigger = VideoFormat::new(PixelFormat::I420, 32, 32).with_framerate(30, 1);
    h.pipeline.set_format(bigger).unwrap();
    assert_eq!(h.pipeline.component().input().definition().buffer_size, 1536);

    for i in 2..4 {
        let frame = Frame::from_bytes(i, vec![i as u8; 1536]).with_pts(pts(i));
        h.pipeline.submit(frame).unwrap();
    }
    h.pipeline.finish().unwrap();

    let events = collect_until_eos(&h.events);
    let caps: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Caps(c) => Some(c.width),
            _ => None,
        })
        .collect();
    assert_eq!(caps, vec![16, 32]);
    assert_eq!(frame_ids(&events), vec![Some(0), Some(1), Some(2), Some(3)]);
}

#[test]
fn import_mode_waits_for_the_pool() {
    let config = EncoderConfig {
        input_mode: InputMode::Import,
        ..Default::default()
    };
    let h = harness_with(
        LoopbackOptions::default(),
        config,
        Box::new(GenericVariant::new("video/x-test")),
    );
    h.pipeline.set_format(format()).unwrap();
    assert_eq!(h.pipeline.component().state(), ComponentState::Idle);

    let mut outcomes = Vec::new();
    for i in 0..6u64 {
        let handle = ImportHandle(100 + (i % 3) as i64);
        let frame = Frame::new(i, FramePayload::Imported(handle)).with_pts(pts(i));
        outcomes.push(h.pipeline.submit(frame).unwrap());
    }
    assert_eq!(
        outcomes,
        vec![
            SubmitOutcome::Dropped,
            SubmitOutcome::Dropped,
            SubmitOutcome::Dropped,
            SubmitOutcome::Queued,
            SubmitOutcome::Queued,
            SubmitOutcome::Queued,
        ]
    );
    assert_eq!(h.pipeline.component().state(), ComponentState::Executing);
    assert_eq!(h.pipeline.component().input().stats().allocated, 3);
    h.pipeline.finish().unwrap();

    let events = collect_until_eos(&h.events);
    assert_eq!(&events[..3], &[
        SinkEvent::Dropped(0),
        SinkEvent::Dropped(1),
        SinkEvent::Dropped(2),
    ]);
    let SinkEvent::Frame(first) = &events[4] else {
        panic!("expected a frame, got {:?}", events[4]);
    };
    assert_eq!(first.frame_id, Some(3));
    assert_eq!(first.data.as_ref(), &100i64.to_le_bytes());
}

#[test]
fn zero_copy_hands_payload_through() {
    let config = EncoderConfig {
        input_mode: InputMode::ZeroCopy,
        ..Default::default()
    };
    let h = harness_with(
        LoopbackOptions::default(),
        config,
        Box::new(GenericVariant::new("video/x-test")),
    );
    h.pipeline.set_format(format()).unwrap();

    let err = h
        .pipeline
        .submit(Frame::from_bytes(0, vec![0u8; 100]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::BufferSize(_)));

    h.pipeline.submit(frame(1)).unwrap();
    h.pipeline.finish().unwrap();
    let events = collect_until_eos(&h.events);
    let SinkEvent::Frame(out) = &events[1] else {
        panic!("expected a frame, got {:?}", events[1]);
    };
    assert!(out.data.iter().all(|b| *b == 1));
}

#[test]
fn byte_stream_headers_ride_with_the_first_frame() {
    let h = harness_with(
        LoopbackOptions {
            emit_codec_config: true,
            ..Default::default()
        },
        EncoderConfig::default(),
        Box::new(ByteStreamVariant::h264()),
    );
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.submit(frame(0)).unwrap();
    h.pipeline.submit(frame(1)).unwrap();
    h.pipeline.finish().unwrap();

    let events = collect_until_eos(&h.events);
    let SinkEvent::Caps(caps) = &events[0] else {
        panic!("expected caps, got {:?}", events[0]);
    };
    assert_eq!(caps.stream_format.as_deref(), Some("byte-stream"));
    assert!(caps.codec_data.is_none());

    let frames: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Frame(f) => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].headers.len(), 1);
    assert!(frames[0].headers[0].starts_with(&ANNEXB_START_CODE));
    assert!(frames[1].headers.is_empty());
}

#[test]
fn generic_codec_config_becomes_codec_data() {
    let h = harness(LoopbackOptions {
        emit_codec_config: true,
        ..Default::default()
    });
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.submit(frame(0)).unwrap();
    h.pipeline.finish().unwrap();

    let events = collect_until_eos(&h.events);
    let codec_data = events.iter().find_map(|e| match e {
        SinkEvent::Caps(c) => c.codec_data.clone(),
        _ => None,
    });
    assert_eq!(codec_data.map(|d| d.len()), Some(16));
    assert_eq!(frame_ids(&events), vec![Some(0)]);
}

#[test]
fn component_fault_is_returned_to_submitters() {
    let h = harness(LoopbackOptions {
        fault_after: Some(2),
        ..Default::default()
    });
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.submit(frame(0)).unwrap();
    h.pipeline.submit(frame(1)).unwrap();

    let events = collect_until_eos(&h.events);
    let err = events
        .iter()
        .find_map(|e| match e {
            SinkEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .expect("error pushed downstream");
    assert!(matches!(err, PipelineError::Component(ComponentError::Fault(_))));
    assert!(h.pipeline.submit(frame(2)).is_err());
    assert_eq!(h.pipeline.component().state(), ComponentState::Invalid);
}

#[test]
fn unsupported_parameters_do_not_fail_open() {
    let config = EncoderConfig {
        params: CodecParamsConfig {
            target_bitrate: Some(1_000_000),
            quant_i_frames: Some(20),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness_with(
        LoopbackOptions {
            supports_parameters: false,
            ..Default::default()
        },
        config,
        Box::new(GenericVariant::new("video/x-test")),
    );
    assert_eq!(h.pipeline.component().state(), ComponentState::Loaded);
}

#[test]
fn latency_and_allocation_hint_follow_the_input_port() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    // Two buffers minimum plus one in flight at 30 fps.
    assert_eq!(h.pipeline.latency(), Duration::from_millis(100));
    let hint = h.pipeline.allocation_hint();
    assert_eq!(hint.buffer_size, FRAME_SIZE);
    assert_eq!(hint.min_buffers, 4);
}

#[test]
fn close_returns_the_component_to_loaded() {
    let h = harness(LoopbackOptions::default());
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.submit(frame(0)).unwrap();
    h.pipeline.finish().unwrap();
    collect_until_eos(&h.events);

    let Harness { pipeline, codec, .. } = h;
    pipeline.close().unwrap();
    let states: Vec<_> = codec
        .trace()
        .into_iter()
        .filter_map(|e| match e {
            TraceEvent::State(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ComponentState::Idle,
            ComponentState::Executing,
            ComponentState::Idle,
            ComponentState::Loaded,
        ]
    );
}

#[test]
fn drain_timeout_fails_the_session() {
    let config = EncoderConfig {
        timeouts: TimeoutConfig {
            drain_ms: 100,
            flush_ms: 500,
            ..Default::default()
        },
        ..Default::default()
    };
    let (pipeline, _codec, events) = held_pipeline(config);
    pipeline.set_format(format()).unwrap();
    pipeline.submit(frame(0)).unwrap();

    let err = pipeline.drain().unwrap_err();
    assert!(matches!(err, PipelineError::Drain(_)));
    assert_eq!(pipeline.status().unwrap_err(), err);
    assert_eq!(pipeline.submit(frame(1)).unwrap_err(), err);

    assert_eq!(events.recv_timeout(WAIT).unwrap(), SinkEvent::Error(err));
    assert_eq!(events.recv_timeout(WAIT).unwrap(), SinkEvent::Eos);
}

#[test]
fn import_frames_outside_the_pool_fail_alone() {
    let config = EncoderConfig {
        input_mode: InputMode::Import,
        ..Default::default()
    };
    let h = harness_with(
        LoopbackOptions::default(),
        config,
        Box::new(GenericVariant::new("video/x-test")),
    );
    h.pipeline.set_format(format()).unwrap();
    h.pipeline.push_import_pool(vec![ImportHandle(1), ImportHandle(2)]);

    let imported = |i: u64, handle: i64| {
        Frame::new(i, FramePayload::Imported(ImportHandle(handle))).with_pts(pts(i))
    };

    // Completes the announced pool, but is not part of it.
    let err = h.pipeline.submit(imported(0, 9)).unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    assert!(err.is_recoverable());
    assert_eq!(h.pipeline.component().state(), ComponentState::Executing);

    assert_eq!(h.pipeline.submit(imported(1, 1)).unwrap(), SubmitOutcome::Queued);
    let err = h.pipeline.submit(imported(2, 7)).unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    assert_eq!(h.pipeline.submit(imported(3, 2)).unwrap(), SubmitOutcome::Queued);
    assert!(h.pipeline.status().is_ok());

    h.pipeline.finish().unwrap();
    let events = collect_until_eos(&h.events);
    assert_eq!(frame_ids(&events), vec![Some(1), Some(3)]);
}

#[test]
fn stop_wakes_a_submitter_waiting_for_input() {
    let (pipeline, codec, _events) = held_pipeline(EncoderConfig::default());
    pipeline.set_format(format()).unwrap();

    let count = pipeline.component().input().stats().allocated;
    for i in 0..count as u64 {
        pipeline.submit(frame(i)).unwrap();
    }
    assert_eq!(codec.held(PortIndex::Input), count);

    let (tx, rx) = flume::bounded(1);
    std::thread::scope(|scope| {
        let pipeline = &pipeline;
        scope.spawn(move || {
            let _ = tx.send(pipeline.submit(frame(count as u64)));
        });

        // Every input buffer is with the codec, the submitter stays parked.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        pipeline.stop().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(PipelineError::Flushing));
    });
    assert_eq!(pipeline.component().state(), ComponentState::Idle);
}
