use std::{sync::Arc, thread, time::Duration};

use omxlink::{
    common::{
        banner::{BannerInfo, print_banner},
        errors::AnyResult,
        logger,
    },
    configs::{Config, DemoConfig},
    encoder::{
        ByteStreamVariant, ChannelSink, CodecVariant, EncoderPipeline, Frame, GenericVariant,
        SinkEvent, SubmitOutcome, VideoFormat,
    },
    log_println,
    omx::{LoopbackCodec, LoopbackOptions},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct SinkReport {
    caps: Vec<String>,
    frames: u64,
    bytes: usize,
    sync_points: u64,
    headers: usize,
    dropped: u64,
    errors: Vec<String>,
    eos: bool,
}

fn main() -> AnyResult<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}. Falling back to defaults.");
            Config::default()
        }
    };

    logger::init(&config)?;
    print_banner(&BannerInfo::default());

    run(&config)
}

fn variant_for(codec: &str) -> Box<dyn CodecVariant> {
    match codec {
        "h264" => Box::new(ByteStreamVariant::h264()),
        "h265" => Box::new(ByteStreamVariant::h265()),
        other => Box::new(GenericVariant::new(format!("video/x-{other}"))),
    }
}

fn run(config: &Config) -> AnyResult<()> {
    let demo = &config.demo;
    let codec = Arc::new(LoopbackCodec::new(LoopbackOptions {
        emit_codec_config: demo.emit_codec_config,
        settings_change_after: demo.settings_change_after,
        ..Default::default()
    })?);

    let (sink, events) = ChannelSink::new();
    let consumer = thread::Builder::new()
        .name("omx-sink".to_string())
        .spawn(move || consume(events))?;

    let pipeline = EncoderPipeline::open(
        codec,
        variant_for(&demo.codec),
        Arc::new(sink),
        config.encoder.clone(),
    )?;

    let format = VideoFormat::new(demo.pixel_format, demo.width, demo.height)
        .with_framerate(demo.fps_n, demo.fps_d);
    pipeline.set_format(format.clone())?;
    info!(
        "Encoding {} frames of {}x{} ({:?}), latency {:?}",
        demo.frames,
        demo.width,
        demo.height,
        demo.pixel_format,
        pipeline.latency()
    );

    let submitted = submit_frames(&pipeline, demo, &format)?;
    pipeline.finish()?;

    let report = match consumer.join() {
        Ok(report) => report,
        Err(_) => return Err("sink consumer panicked".into()),
    };
    let component = pipeline.component();
    let input_stats = component.input().stats();
    let output_stats = component.output().stats();
    pipeline.close()?;

    let summary = json!({
        "codec": demo.codec,
        "submitted": submitted,
        "delivered": report.frames,
        "dropped": report.dropped,
        "bytes": report.bytes,
        "sync_points": report.sync_points,
        "headers": report.headers,
        "caps": report.caps,
        "errors": report.errors,
        "eos": report.eos,
        "input_buffers": input_stats.allocated,
        "output_buffers": output_stats.allocated,
    });
    log_println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn submit_frames(
    pipeline: &EncoderPipeline,
    demo: &DemoConfig,
    format: &VideoFormat,
) -> AnyResult<u64> {
    let Some(layout) = format.default_layout() else {
        return Err(format!("{:?} frames cannot be synthesized", demo.pixel_format).into());
    };
    let duration = format.frame_duration().unwrap_or(Duration::from_millis(40));
    let mut rng = StdRng::seed_from_u64(0x6f6d78);
    let mut queued = 0;

    for i in 0..demo.frames as u64 {
        let mut data = vec![0u8; layout.size];
        for (pos, byte) in data.iter_mut().enumerate() {
            *byte = (pos as u64 + i) as u8;
        }
        data[..layout.size.min(64)].iter_mut().for_each(|b| *b = rng.r#gen());

        let mut frame = Frame::from_bytes(i, data)
            .with_pts(duration * i as u32)
            .with_duration(duration);
        if demo.keyframe_interval > 0 && i > 0 && i % demo.keyframe_interval as u64 == 0 {
            frame = frame.keyframe();
        }

        match pipeline.submit(frame) {
            Ok(SubmitOutcome::Queued) => queued += 1,
            Ok(SubmitOutcome::Dropped) => warn!("Frame {} dropped", i),
            Err(e) if e.is_recoverable() => warn!("Frame {} rejected: {}", i, e),
            Err(e) => {
                error!("Encoding stopped at frame {}: {}", i, e);
                return Err(e.into());
            }
        }
    }
    Ok(queued)
}

fn consume(events: flume::Receiver<SinkEvent>) -> SinkReport {
    let mut report = SinkReport::default();
    for event in events.iter() {
        match event {
            SinkEvent::Caps(caps) => report.caps.push(caps.to_string()),
            SinkEvent::Frame(frame) => {
                report.frames += 1;
                report.bytes += frame.data.len();
                report.headers += frame.headers.len();
                if frame.sync_point {
                    report.sync_points += 1;
                }
            }
            SinkEvent::Dropped(_) => report.dropped += 1,
            SinkEvent::Error(e) => report.errors.push(e.to_string()),
            SinkEvent::Eos => {
                report.eos = true;
                break;
            }
        }
    }
    report
}
