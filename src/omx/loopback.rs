//! In-process codec that "encodes" by echoing input payloads.
//!
//! Runs on its own worker thread fed by a command channel, so buffers come
//! back asynchronously like they would from hardware. Options allow scripting
//! the awkward parts of real components: codec config emission, mid-stream
//! output format changes, withheld buffers and injected faults. Every call is
//! recorded in a trace for inspection.

use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    common::errors::ComponentError,
    omx::{
        buffer::{BufferDescriptor, BufferFlags, BufferMemory},
        codec::{Codec, Rejected},
        component::{ComponentEvents, ComponentState},
        constants::MIN_PORT_BUFFER_SIZE,
        params::{ConfigRequest, ControlRate, Parameter},
        port::{PortDefinition, PortIndex},
    },
};

/// Fake SPS and PPS in Annex B framing.
const CODEC_CONFIG: [u8; 16] = [
    0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xc0, 0x1e, 0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80,
];

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub input_buffers: usize,
    pub output_buffers: usize,
    pub min_buffers: usize,
    /// Row alignment advertised on the input port.
    pub stride_alignment: usize,
    /// Emit a codec config buffer before the first frame.
    pub emit_codec_config: bool,
    /// Raise an output settings change after this many frames.
    pub settings_change_after: Option<usize>,
    /// Output dimensions after the settings change, doubled when unset.
    pub settings_change_to: Option<(u32, u32)>,
    /// Keep output buffers when the port is disabled after a settings change.
    pub withhold_on_disable: bool,
    /// Fault after consuming this many input buffers.
    pub fault_after: Option<usize>,
    pub supports_parameters: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            input_buffers: 4,
            output_buffers: 4,
            min_buffers: 2,
            stride_alignment: 0,
            emit_codec_config: false,
            settings_change_after: None,
            settings_change_to: None,
            withhold_on_disable: false,
            fault_after: None,
            supports_parameters: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    State(ComponentState),
    Config(ConfigRequest),
    EmptyBuffer {
        timestamp: i64,
        flags: BufferFlags,
        len: usize,
    },
    Output {
        timestamp: i64,
        flags: BufferFlags,
        len: usize,
    },
    SettingsChanged,
    Flush(PortIndex),
    Fault,
}

enum Command {
    Attach(ComponentEvents),
    Empty(BufferDescriptor),
    Fill(BufferDescriptor),
    ForceKeyframe,
    Flush(PortIndex),
    ReturnAll,
    Shutdown,
}

impl Command {
    fn into_buffer(self) -> Option<BufferDescriptor> {
        match self {
            Self::Empty(buf) | Self::Fill(buf) => Some(buf),
            _ => None,
        }
    }
}

struct Params {
    control_rate: ControlRate,
    target_bitrate: u32,
    qp: (u32, u32, u32),
}

pub struct LoopbackCodec {
    options: LoopbackOptions,
    tx: flume::Sender<Command>,
    trace: Arc<Mutex<Vec<TraceEvent>>>,
    events: Mutex<Option<ComponentEvents>>,
    output_definition: Arc<Mutex<PortDefinition>>,
    params: Mutex<Params>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackCodec {
    pub fn new(options: LoopbackOptions) -> io::Result<Self> {
        let (tx, rx) = flume::unbounded();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let mut output = PortDefinition::new(PortIndex::Output);
        output.min_buffer_count = options.min_buffers;
        output.buffer_count = options.output_buffers.max(options.min_buffers);
        let output_definition = Arc::new(Mutex::new(output));

        let worker = Worker {
            rx,
            options: options.clone(),
            trace: Arc::clone(&trace),
            output_definition: Arc::clone(&output_definition),
            events: None,
            inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            withheld: Vec::new(),
            keyframe_pending: false,
            produced: 0,
            consumed: 0,
            config_sent: false,
            settings_raised: false,
            awaiting_reconfigure: false,
            faulted: false,
        };
        let handle = thread::Builder::new()
            .name("loopback-codec".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            options,
            tx,
            trace,
            events: Mutex::new(None),
            output_definition,
            params: Mutex::new(Params {
                control_rate: ControlRate::Variable,
                target_bitrate: 0,
                qp: (0, 0, 0),
            }),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Everything the codec has seen so far, in call order.
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.trace.lock().clone()
    }

    pub fn bitrate(&self) -> (ControlRate, u32) {
        let params = self.params.lock();
        (params.control_rate, params.target_bitrate)
    }

    pub fn quantization(&self) -> (u32, u32, u32) {
        self.params.lock().qp
    }

    fn record(&self, event: TraceEvent) {
        self.trace.lock().push(event);
    }

    fn send_buffer(&self, cmd: Command) -> Result<(), Rejected> {
        match self.tx.send(cmd) {
            Ok(()) => Ok(()),
            Err(flume::SendError(cmd)) => match cmd.into_buffer() {
                Some(buffer) => Err(Rejected {
                    error: ComponentError::Fault("loopback worker stopped".into()),
                    buffer,
                }),
                None => Ok(()),
            },
        }
    }
}

impl Drop for LoopbackCodec {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Codec for LoopbackCodec {
    fn name(&self) -> &str {
        "loopback"
    }

    fn attach(&self, events: ComponentEvents) {
        *self.events.lock() = Some(events.clone());
        let _ = self.tx.send(Command::Attach(events));
    }

    fn default_definition(&self, port: PortIndex) -> PortDefinition {
        match port {
            PortIndex::Input => {
                let mut def = PortDefinition::new(PortIndex::Input);
                def.min_buffer_count = self.options.min_buffers;
                def.buffer_count = self.options.input_buffers.max(self.options.min_buffers);
                def.buffer_alignment = self.options.stride_alignment;
                def
            }
            PortIndex::Output => self.output_definition.lock().clone(),
        }
    }

    fn on_state(&self, from: ComponentState, to: ComponentState) -> Result<(), ComponentError> {
        self.record(TraceEvent::State(to));
        if from == ComponentState::Executing && to == ComponentState::Idle {
            let _ = self.tx.send(Command::ReturnAll);
        }
        Ok(())
    }

    fn on_port_definition(
        &self,
        port: PortIndex,
        definition: &mut PortDefinition,
    ) -> Result<(), ComponentError> {
        if definition.buffer_size == 0 {
            return Err(ComponentError::BadParameter(format!(
                "{port} buffer size must not be zero"
            )));
        }
        if port == PortIndex::Output {
            *self.output_definition.lock() = definition.clone();
            return Ok(());
        }

        let output = {
            let mut output = self.output_definition.lock();
            output.video.width = definition.video.width;
            output.video.height = definition.video.height;
            output.video.framerate = definition.video.framerate;
            output.buffer_size = definition.buffer_size.max(MIN_PORT_BUFFER_SIZE);
            output.clone()
        };
        if let Some(events) = self.events.lock().as_ref() {
            events.update_definition(PortIndex::Output, output);
        }
        Ok(())
    }

    fn empty_this_buffer(&self, buf: BufferDescriptor) -> Result<(), Rejected> {
        self.record(TraceEvent::EmptyBuffer {
            timestamp: buf.timestamp,
            flags: buf.flags,
            len: buf.filled_len,
        });
        self.send_buffer(Command::Empty(buf))
    }

    fn fill_this_buffer(&self, buf: BufferDescriptor) -> Result<(), Rejected> {
        self.send_buffer(Command::Fill(buf))
    }

    fn flush(&self, port: PortIndex) {
        self.record(TraceEvent::Flush(port));
        let _ = self.tx.send(Command::Flush(port));
    }

    fn get_parameter(&self, param: &mut Parameter) -> Result<(), ComponentError> {
        if !self.options.supports_parameters {
            return Err(ComponentError::UnsupportedIndex);
        }
        let params = self.params.lock();
        *param = match *param {
            Parameter::Bitrate { .. } => Parameter::Bitrate {
                control_rate: params.control_rate,
                target_bitrate: params.target_bitrate,
            },
            Parameter::Quantization { .. } => Parameter::Quantization {
                qp_i: params.qp.0,
                qp_p: params.qp.1,
                qp_b: params.qp.2,
            },
        };
        Ok(())
    }

    fn set_parameter(&self, param: &Parameter) -> Result<(), ComponentError> {
        if !self.options.supports_parameters {
            return Err(ComponentError::UnsupportedIndex);
        }
        let mut params = self.params.lock();
        match *param {
            Parameter::Bitrate {
                control_rate,
                target_bitrate,
            } => {
                if control_rate.needs_target() && target_bitrate == 0 {
                    return Err(ComponentError::UnsupportedSetting);
                }
                params.control_rate = control_rate;
                params.target_bitrate = target_bitrate;
            }
            Parameter::Quantization { qp_i, qp_p, qp_b } => {
                if [qp_i, qp_p, qp_b].iter().any(|qp| *qp > 51) {
                    return Err(ComponentError::UnsupportedSetting);
                }
                params.qp = (qp_i, qp_p, qp_b);
            }
        }
        debug!("Loopback applied {:?}", param);
        Ok(())
    }

    fn set_config(&self, config: ConfigRequest) -> Result<(), ComponentError> {
        self.record(TraceEvent::Config(config));
        if config == ConfigRequest::IntraRefresh {
            let _ = self.tx.send(Command::ForceKeyframe);
        }
        Ok(())
    }
}

// ── Worker thread ────────────────────────────────────────────────────────────

struct Worker {
    rx: flume::Receiver<Command>,
    options: LoopbackOptions,
    trace: Arc<Mutex<Vec<TraceEvent>>>,
    output_definition: Arc<Mutex<PortDefinition>>,
    events: Option<ComponentEvents>,
    /// Input buffers waiting for an output slot, with their keyframe request.
    inputs: VecDeque<(BufferDescriptor, bool)>,
    outputs: VecDeque<BufferDescriptor>,
    withheld: Vec<BufferDescriptor>,
    keyframe_pending: bool,
    produced: usize,
    consumed: usize,
    config_sent: bool,
    settings_raised: bool,
    awaiting_reconfigure: bool,
    faulted: bool,
}

impl Worker {
    fn run(mut self) {
        while let Ok(cmd) = self.rx.recv() {
            match cmd {
                Command::Attach(events) => self.events = Some(events),
                Command::Empty(buf) => {
                    let keyframe = std::mem::take(&mut self.keyframe_pending);
                    self.inputs.push_back((buf, keyframe));
                }
                Command::Fill(buf) => self.outputs.push_back(buf),
                Command::ForceKeyframe => self.keyframe_pending = true,
                Command::Flush(port) => self.flush(port, false),
                Command::ReturnAll => {
                    self.flush(PortIndex::Input, true);
                    self.flush(PortIndex::Output, true);
                }
                Command::Shutdown => break,
            }
            self.pump();
        }
        debug!("Loopback worker stopped");
    }

    fn record(&self, event: TraceEvent) {
        self.trace.lock().push(event);
    }

    fn flush(&mut self, port: PortIndex, everything: bool) {
        let Some(events) = self.events.clone() else {
            return;
        };
        match port {
            PortIndex::Input => {
                for (buf, _) in self.inputs.drain(..) {
                    events.empty_buffer_done(buf);
                }
            }
            PortIndex::Output => {
                if self.settings_raised && self.options.withhold_on_disable && !everything {
                    warn!("Loopback withholding {} output buffers", self.outputs.len());
                    self.withheld.extend(self.outputs.drain(..));
                    return;
                }
                self.awaiting_reconfigure = false;
                let returned: Vec<_> = self.outputs.drain(..).chain(self.withheld.drain(..)).collect();
                for mut buf in returned {
                    buf.filled_len = 0;
                    events.fill_buffer_done(buf);
                }
            }
        }
    }

    fn pump(&mut self) {
        let Some(events) = self.events.clone() else {
            return;
        };
        while !self.faulted && !self.awaiting_reconfigure {
            if self.inputs.is_empty() || self.outputs.is_empty() {
                break;
            }
            if self.options.settings_change_after == Some(self.produced) && !self.settings_raised {
                self.raise_settings_change(&events);
                break;
            }
            if self.options.emit_codec_config && !self.config_sent {
                self.emit_codec_config(&events);
                continue;
            }

            let (Some((input, keyframe)), Some(mut out)) =
                (self.inputs.pop_front(), self.outputs.pop_front())
            else {
                break;
            };
            self.consumed += 1;
            out.timestamp = input.timestamp;
            out.tick_count = input.tick_count;

            if input.flags.contains(BufferFlags::END_OF_STREAM) {
                out.filled_len = 0;
                out.flags = BufferFlags::END_OF_STREAM;
            } else {
                match input.memory() {
                    BufferMemory::Imported { handle, .. } => {
                        out.write_payload(&handle.0.to_le_bytes());
                    }
                    _ => {
                        out.write_payload(input.data());
                    }
                }
                out.flags = BufferFlags::END_OF_FRAME;
                if keyframe || self.produced == 0 {
                    out.flags |= BufferFlags::SYNC_POINT;
                }
                self.produced += 1;
            }

            self.record(TraceEvent::Output {
                timestamp: out.timestamp,
                flags: out.flags,
                len: out.filled_len,
            });
            events.empty_buffer_done(input);
            events.fill_buffer_done(out);

            if self.options.fault_after == Some(self.consumed) {
                self.faulted = true;
                self.record(TraceEvent::Fault);
                events.error(ComponentError::Fault("injected loopback fault".into()));
            }
        }
    }

    fn emit_codec_config(&mut self, events: &ComponentEvents) {
        let timestamp = self.inputs.front().map(|(buf, _)| buf.timestamp).unwrap_or(0);
        let Some(mut out) = self.outputs.pop_front() else {
            return;
        };
        out.write_payload(&CODEC_CONFIG);
        out.flags = BufferFlags::CONFIG | BufferFlags::END_OF_FRAME;
        out.timestamp = timestamp;
        self.config_sent = true;
        self.record(TraceEvent::Output {
            timestamp,
            flags: out.flags,
            len: out.filled_len,
        });
        events.fill_buffer_done(out);
    }

    fn raise_settings_change(&mut self, events: &ComponentEvents) {
        let definition = {
            let mut def = self.output_definition.lock();
            let (width, height) = self
                .options
                .settings_change_to
                .unwrap_or((def.video.width * 2, def.video.height * 2));
            def.video.width = width;
            def.video.height = height;
            def.buffer_size = (def.buffer_size * 2).max(MIN_PORT_BUFFER_SIZE);
            def.clone()
        };
        info!(
            "Loopback changing output to {}x{}",
            definition.video.width, definition.video.height
        );
        self.settings_raised = true;
        self.awaiting_reconfigure = true;
        self.record(TraceEvent::SettingsChanged);
        events.port_settings_changed(PortIndex::Output, definition);
    }
}
