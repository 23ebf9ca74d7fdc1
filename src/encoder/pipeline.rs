//! The encoder session: owns the component, accepts raw frames on the
//! caller's thread and runs the output loop on its own.
//!
//! Lock order is session, then drain, then the component's internal lock.
//! Every call that can block on the component (input acquire, port
//! transitions, joining the output thread) runs with the session lock
//! released.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    common::errors::{ComponentError, PipelineError},
    configs::{EncoderConfig, InputMode},
    encoder::{
        correlator::PendingFrameSet,
        fill,
        format::{Caps, FormatSettings, VideoFormat, input_port_definition},
        frame::{Frame, FramePayload},
        import::{ImportPoolTracker, PoolStatus},
        output_loop, params, reconfigure,
        sink::OutputSink,
        variant::CodecVariant,
    },
    omx::{
        Acquire, BufferFlags, BufferMemory, Codec, Component, ComponentState, ConfigRequest,
        ImportHandle, PortDefinition, ticks,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum FlowState {
    #[default]
    Ok,
    Flushing,
    Eos,
    Fatal(PipelineError),
}

impl FlowState {
    fn check(&self) -> Result<(), PipelineError> {
        match self {
            Self::Ok => Ok(()),
            Self::Flushing => Err(PipelineError::Flushing),
            Self::Eos => Err(PipelineError::Eos),
            Self::Fatal(err) => Err(err.clone()),
        }
    }
}

/// Per-stream state shared between submitters and the output loop.
#[derive(Default)]
pub(crate) struct Session {
    pub(crate) pending: PendingFrameSet,
    pub(crate) input_format: Option<VideoFormat>,
    pub(crate) output_caps: Option<Caps>,
    pub(crate) flow: FlowState,
    /// A frame went in since the last drain.
    pub(crate) started: bool,
    /// Upstream finished, no more frames are accepted.
    pub(crate) eos: bool,
    pub(crate) eos_forwarded: bool,
    /// The output loop is alive. Cleared by the loop as its last action.
    pub(crate) running: bool,
    pub(crate) last_upstream_ts: Option<Duration>,
    pub(crate) headers: Vec<Bytes>,
    pub(crate) import: ImportPoolTracker,
    pub(crate) latency: Duration,
}

impl Session {
    fn reset_stream(&mut self) {
        self.pending.clear();
        self.flow = FlowState::Ok;
        self.started = false;
        self.eos = false;
        self.eos_forwarded = false;
        self.last_upstream_ts = None;
        self.headers.clear();
    }
}

pub(crate) struct DrainSync {
    draining: Mutex<bool>,
    cond: Condvar,
}

pub(crate) struct Inner {
    pub(crate) component: Component,
    pub(crate) variant: Box<dyn CodecVariant>,
    pub(crate) sink: Arc<dyn OutputSink>,
    pub(crate) config: EncoderConfig,
    pub(crate) session: Mutex<Session>,
    pub(crate) drain: DrainSync,
}

impl Inner {
    /// Completes the drain handshake, waking the waiter.
    pub(crate) fn finish_drain(&self) -> bool {
        let mut draining = self.drain.draining.lock();
        let was = std::mem::replace(&mut *draining, false);
        self.drain.cond.notify_all();
        was
    }

    pub(crate) fn set_fatal(&self, session: &mut Session, err: &PipelineError) {
        if !matches!(session.flow, FlowState::Fatal(_)) {
            session.flow = FlowState::Fatal(err.clone());
        }
    }

    /// Stores `err` as the session status and reports it downstream,
    /// followed by the stream's one EOS.
    pub(crate) fn fail(&self, session: &mut Session, err: &PipelineError) {
        self.set_fatal(session, err);
        self.sink.error(err);
        if !session.eos_forwarded {
            session.eos_forwarded = true;
            self.sink.end_of_stream();
        }
        self.finish_drain();
    }

    /// Sets both ports flushing so the output loop parks and blocked
    /// submitters return.
    pub(crate) fn flush_after_failure(&self) {
        let flush = self.config.timeouts.flush();
        for port in [self.component.input(), self.component.output()] {
            if let Err(err) = port.set_flushing(true, flush) {
                debug!("Could not flush {} port after error: {}", port.index(), err);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The frame went to the component, output follows on the sink.
    Queued,
    /// The frame was completed without encoding.
    Dropped,
}

/// What upstream should allocate to feed the encoder without stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHint {
    pub buffer_size: usize,
    pub min_buffers: u32,
}

pub struct EncoderPipeline {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EncoderPipeline {
    /// Creates the component around `codec` and applies the configured
    /// codec parameters. The component stays Loaded until the first
    /// [`set_format`](Self::set_format).
    pub fn open(
        codec: Arc<dyn Codec>,
        variant: Box<dyn CodecVariant>,
        sink: Arc<dyn OutputSink>,
        config: EncoderConfig,
    ) -> Result<Self, PipelineError> {
        let component = Component::new(codec);
        params::apply(&component, &config.params)?;
        info!(
            "Opened {} encoder on {} ({:?} input)",
            variant.name(),
            component.name(),
            config.input_mode
        );

        Ok(Self {
            inner: Arc::new(Inner {
                component,
                variant,
                sink,
                config,
                session: Mutex::new(Session::default()),
                drain: DrainSync {
                    draining: Mutex::new(false),
                    cond: Condvar::new(),
                },
            }),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn component(&self) -> &Component {
        &self.inner.component
    }

    pub fn output_caps(&self) -> Option<Caps> {
        self.inner.session.lock().output_caps.clone()
    }

    pub fn latency(&self) -> Duration {
        self.inner.session.lock().latency
    }

    /// The stored flow status: `Ok` while frames are accepted.
    pub fn status(&self) -> Result<(), PipelineError> {
        self.inner.session.lock().flow.check()
    }

    pub fn allocation_hint(&self) -> AllocationHint {
        AllocationHint {
            buffer_size: self.inner.component.input().definition().buffer_size,
            min_buffers: self.latency_frames() + 1,
        }
    }

    /// Announces the external buffer pool in import mode.
    pub fn push_import_pool(&self, handles: Vec<ImportHandle>) {
        self.inner.session.lock().import.announce(handles);
    }

    fn latency_frames(&self) -> u32 {
        self.inner.config.latency_frames.unwrap_or_else(|| {
            self.inner.component.input().definition().min_buffer_count as u32 + 1
        })
    }

    // ── Output thread ────────────────────────────────────────────────────────

    fn start_loop(&self, session: &mut Session) -> Result<(), PipelineError> {
        if session.running {
            return Ok(());
        }
        self.join_loop();

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("omx-output-loop".to_string())
            .spawn(move || output_loop::run(inner))
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;
        session.running = true;
        *self.task.lock() = Some(handle);
        debug!("Started output loop");
        Ok(())
    }

    /// Joins the output thread. The loop must be stopping already: paused,
    /// or the output port set flushing.
    fn join_loop(&self) {
        let Some(handle) = self.task.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Output loop panicked");
        }
    }

    /// Restarts the loop after it paused at the end of a drain.
    fn resume_loop(&self, session: &mut MutexGuard<'_, Session>) -> Result<(), PipelineError> {
        let component = &self.inner.component;
        let flush = self.inner.config.timeouts.flush();
        MutexGuard::unlocked(session, || -> Result<(), ComponentError> {
            self.join_loop();
            let output = component.output();
            output.set_flushing(true, flush)?;
            output.set_flushing(false, flush)?;
            output.populate()
        })?;
        self.start_loop(session)
    }

    fn wants_loop(&self, session: &Session) -> bool {
        self.inner.config.input_mode != InputMode::Import || session.import.is_complete()
    }

    // ── Format ───────────────────────────────────────────────────────────────

    /// Configures the input port for `format`, bringing the component to
    /// Executing on first use and reconfiguring it afterwards.
    pub fn set_format(&self, format: VideoFormat) -> Result<(), PipelineError> {
        let inner = &*self.inner;
        let component = &inner.component;
        let config = &inner.config;
        let timeouts = &config.timeouts;
        let (input, output) = (component.input(), component.output());
        let mode = config.input_mode;

        info!(
            "Setting new format {:?} {}x{} @ {}/{}",
            format.pixel_format, format.width, format.height, format.fps_n, format.fps_d
        );

        let mut session = inner.session.lock();
        let needs_disable = component.state() != ComponentState::Loaded;

        if needs_disable {
            debug!("Need to disable and drain encoder");
            self.drain_locked(&mut session, false)?;
            let keep_output = config.quirks.no_disable_output_port;
            MutexGuard::unlocked(&mut session, || -> Result<(), ComponentError> {
                output.set_flushing(true, timeouts.flush())?;
                self.join_loop();

                input.set_enabled(false)?;
                if !keep_output {
                    output.set_enabled(false)?;
                }
                input.wait_buffers_released(timeouts.buffers_released())?;
                input.deallocate_buffers()?;
                input.wait_enabled(timeouts.port_disable())?;
                if !keep_output {
                    output.wait_buffers_released(timeouts.buffers_released())?;
                    output.deallocate_buffers()?;
                    output.wait_enabled(timeouts.port_disable())?;
                }
                Ok(())
            })?;
            debug!("Encoder drained and disabled");
        }

        let settings = FormatSettings {
            stride_alignment: config.stride_alignment,
            slice_height_alignment: config.slice_height_alignment,
            framerate_integer: config.quirks.video_framerate_integer,
        };
        let definition = input_port_definition(&input.definition(), &format, &settings)?;
        debug!(
            "Input port stride {} slice height {} buffer size {}",
            definition.video.stride, definition.video.slice_height, definition.buffer_size
        );
        input.update_definition(definition)?;
        inner.variant.set_format(component, &format)?;
        if needs_disable && config.params.has_bitrate() {
            if let Err(err) = params::apply_bitrate(component, &config.params) {
                warn!("Failed to update bitrate: {}", err);
            }
        }

        MutexGuard::unlocked(&mut session, || -> Result<(), PipelineError> {
            if needs_disable {
                self.reenable(&format)
            } else {
                self.bring_up()
            }
        })?;

        MutexGuard::unlocked(&mut session, || -> Result<(), ComponentError> {
            input.set_flushing(false, timeouts.flush())?;
            output.set_flushing(false, timeouts.flush())?;
            output.populate()
        })?;
        if let Some(err) = component.last_error() {
            error!("Component in error state: {}", err);
            return Err(err.into());
        }

        session.latency = format.latency(self.latency_frames());
        session.input_format = Some(format);
        session.output_caps = None;
        session.reset_stream();
        if mode == InputMode::Import {
            session.import.reset();
        } else {
            self.start_loop(&mut session)?;
        }
        info!("Format set, latency {:?}", session.latency);
        Ok(())
    }

    /// First format: Loaded -> Idle -> Executing with fresh buffers.
    fn bring_up(&self) -> Result<(), PipelineError> {
        let component = &self.inner.component;
        let config = &self.inner.config;
        let (input, output) = (component.input(), component.output());

        if config.input_mode == InputMode::Import {
            // Enabled once the external pool is known.
            input.set_enabled(false)?;
        }

        component.set_state(ComponentState::Idle)?;
        match config.input_mode {
            InputMode::Default => input.allocate_buffers()?,
            InputMode::ZeroCopy => {
                if let Some(memory) = input_memory(config.input_mode, &input.definition(), &[]) {
                    input.use_buffers(memory)?;
                }
            }
            InputMode::Import => {}
        }
        output.allocate_buffers()?;
        self.wait_for_state(ComponentState::Idle)?;

        if config.input_mode != InputMode::Import {
            component.set_state(ComponentState::Executing)?;
            self.wait_for_state(ComponentState::Executing)?;
        }
        Ok(())
    }

    /// Later formats: the ports were disabled, enable them again.
    fn reenable(&self, format: &VideoFormat) -> Result<(), PipelineError> {
        let component = &self.inner.component;
        let config = &self.inner.config;
        let timeouts = &config.timeouts;
        let (input, output) = (component.input(), component.output());

        if config.input_mode != InputMode::Import {
            let memory = input_memory(config.input_mode, &input.definition(), &[]);
            reconfigure::rebuild(input, timeouts, memory)?;
        }

        // The loop rebuilds a disabled output port lazily, except when the
        // component must be brought back to Executing first.
        if !output.is_enabled() && component.state() != ComponentState::Executing {
            reconfigure::rebuild(output, timeouts, None)?;
        }
        if component.state() == ComponentState::Idle && config.input_mode != InputMode::Import {
            component.set_state(ComponentState::Executing)?;
            self.wait_for_state(ComponentState::Executing)?;
        }
        debug!("Re-enabled ports for {}x{}", format.width, format.height);
        Ok(())
    }

    fn wait_for_state(&self, expected: ComponentState) -> Result<(), PipelineError> {
        let timeout = self.inner.config.timeouts.state_change();
        let actual = self.inner.component.wait_state(timeout)?;
        if actual != expected {
            return Err(PipelineError::StateChange { expected, actual });
        }
        Ok(())
    }

    /// Binds the discovered pool and starts encoding.
    fn activate_import(&self, handles: &[ImportHandle]) -> Result<(), PipelineError> {
        let component = &self.inner.component;
        let input = component.input();
        info!("Activating import pool of {} buffers", handles.len());

        let mut definition = input.definition();
        definition.buffer_count = handles.len();
        input.update_definition(definition)?;
        let memory = input_memory(InputMode::Import, &input.definition(), handles);
        reconfigure::rebuild(input, &self.inner.config.timeouts, memory)?;

        if component.state() != ComponentState::Executing {
            component.set_state(ComponentState::Executing)?;
            self.wait_for_state(ComponentState::Executing)?;
        }
        Ok(())
    }

    // ── Submission ───────────────────────────────────────────────────────────

    /// Encodes one frame. Blocks while every input buffer is with the
    /// component.
    pub fn submit(&self, frame: Frame) -> Result<SubmitOutcome, PipelineError> {
        let inner = &*self.inner;
        let component = &inner.component;
        let input = component.input();
        let mode = inner.config.input_mode;

        let mut session = inner.session.lock();
        if session.eos {
            warn!("Got frame {} after EOS", frame.id);
            return Err(PipelineError::Eos);
        }
        session.flow.check()?;
        let Some(format) = session.input_format.clone() else {
            return Err(PipelineError::NotNegotiated("no input format set".into()));
        };

        if mode == InputMode::Import {
            let FramePayload::Imported(handle) = frame.payload else {
                return Err(PipelineError::UnsupportedFormat(
                    "import mode takes imported handles only".into(),
                ));
            };
            match session.import.observe(handle) {
                PoolStatus::Collecting => {
                    inner.sink.frame_dropped(frame.id);
                    return Ok(SubmitOutcome::Dropped);
                }
                PoolStatus::Ready(handles) => {
                    if let Err(err) =
                        MutexGuard::unlocked(&mut session, || self.activate_import(&handles))
                    {
                        error!("Failed to activate import pool: {}", err);
                        inner.set_fatal(&mut session, &err);
                        return Err(err);
                    }
                    self.start_loop(&mut session)?;
                }
                PoolStatus::Active => {}
            }
            if !session.import.pool().contains(&handle) {
                warn!("Frame {} uses {} outside the import pool", frame.id, handle);
                return Err(PipelineError::UnsupportedFormat(format!(
                    "{handle} is not part of the import pool"
                )));
            }
        }

        if !session.running && self.wants_loop(&session) {
            debug!("Restarting output loop");
            self.resume_loop(&mut session)?;
        }

        let mut buf = loop {
            let outcome = MutexGuard::unlocked(&mut session, || match &frame.payload {
                FramePayload::Imported(handle) if mode == InputMode::Import => {
                    input.acquire_handle(*handle)
                }
                _ => input.acquire(),
            });
            match outcome {
                Acquire::Buffer(buf) => break buf,
                Acquire::Flushing => {
                    debug!("Input port is flushing");
                    if let FlowState::Fatal(err) = &session.flow {
                        return Err(err.clone());
                    }
                    return Err(PipelineError::Flushing);
                }
                Acquire::Eos => return Err(PipelineError::Eos),
                Acquire::Reconfigure => {
                    debug!("Input port needs reconfiguration");
                    let memory = input_memory(mode, &input.definition(), session.import.pool());
                    let timeouts = &inner.config.timeouts;
                    let result = MutexGuard::unlocked(&mut session, || {
                        reconfigure::tear_down(input, timeouts)?;
                        reconfigure::rebuild(input, timeouts, memory)
                    });
                    if let Err(err) = result {
                        inner.set_fatal(&mut session, &err);
                        return Err(err);
                    }
                }
                Acquire::Error(err) => {
                    let err = PipelineError::from(err);
                    error!("Failed to acquire input buffer: {}", err);
                    inner.set_fatal(&mut session, &err);
                    return Err(err);
                }
            }
        };

        if buf.capacity() == 0 {
            input.return_unused(buf);
            let err = PipelineError::BufferSize("component returned a buffer with no size".into());
            error!("{}", err);
            inner.set_fatal(&mut session, &err);
            return Err(err);
        }

        let definition = input.definition();
        if let Err(err) = fill::fill_buffer(mode, &format, &definition, &frame.payload, &mut buf) {
            error!("Failed to fill input buffer for frame {}: {}", frame.id, err);
            input.return_unused(buf);
            return Err(err);
        }

        if frame.force_keyframe {
            if let Err(err) = component.set_config(ConfigRequest::IntraRefresh) {
                error!("Failed to force a keyframe: {}", err);
            }
        }
        if frame.force_reference {
            if let Err(err) = component.set_config(ConfigRequest::ForceReference) {
                error!("Failed to force a reference frame: {}", err);
            }
        }

        buf.flags = BufferFlags::END_OF_FRAME;
        if let Some(pts) = frame.pts {
            buf.timestamp = ticks::duration_to_ticks(pts);
            session.last_upstream_ts = Some(pts + frame.duration.unwrap_or_default());
        }
        if let Some(duration) = frame.duration {
            buf.tick_count = ticks::duration_to_tick_count(duration);
        }

        session.started = true;
        session.pending.push(frame.info());
        if let Err(err) = input.release(buf) {
            let err = PipelineError::from(err);
            error!("Failed to release input buffer: {}", err);
            session.pending.remove(frame.id);
            inner.set_fatal(&mut session, &err);
            return Err(err);
        }
        Ok(SubmitOutcome::Queued)
    }

    // ── Drain, flush, stop ───────────────────────────────────────────────────

    /// Waits until every submitted frame came out of the component.
    pub fn drain(&self) -> Result<(), PipelineError> {
        let mut session = self.inner.session.lock();
        self.drain_locked(&mut session, false)
    }

    /// Drains and signals end of stream downstream. Later submissions fail
    /// with [`PipelineError::Eos`].
    pub fn finish(&self) -> Result<(), PipelineError> {
        let mut session = self.inner.session.lock();
        let result = self.drain_locked(&mut session, true);
        session.eos = true;
        if !session.eos_forwarded {
            session.eos_forwarded = true;
            self.inner.sink.end_of_stream();
        }
        result
    }

    fn drain_locked(
        &self,
        session: &mut MutexGuard<'_, Session>,
        at_eos: bool,
    ) -> Result<(), PipelineError> {
        let inner = &*self.inner;

        if !session.started {
            debug!("Component not started yet");
            return Ok(());
        }
        session.started = false;

        if session.eos {
            debug!("Drained already");
            return Ok(());
        }
        if at_eos {
            session.eos = true;
        }

        if inner.config.quirks.no_empty_eos_buffer {
            warn!("Component does not support empty EOS buffers");
            return Ok(());
        }
        match &session.flow {
            FlowState::Fatal(err) => return Err(err.clone()),
            FlowState::Ok if session.running => {}
            _ => return Ok(()),
        }

        *inner.drain.draining.lock() = true;
        let input = inner.component.input();
        let mut buf = match MutexGuard::unlocked(session, || input.acquire()) {
            Acquire::Buffer(buf) => buf,
            Acquire::Flushing => {
                inner.finish_drain();
                debug!("Flushing while draining");
                return Ok(());
            }
            other => {
                inner.finish_drain();
                error!("Failed to acquire buffer for draining: {:?}", other);
                return Err(PipelineError::Drain(format!("{other:?}")));
            }
        };

        buf.filled_len = 0;
        buf.offset = 0;
        buf.flags = BufferFlags::END_OF_STREAM;
        buf.timestamp = session
            .last_upstream_ts
            .map(ticks::duration_to_ticks)
            .unwrap_or(0);
        if let Err(err) = input.release(buf) {
            inner.finish_drain();
            error!("Failed to drain component: {}", err);
            return Err(err.into());
        }

        debug!("Waiting until component is drained");
        let timeout = inner.config.timeouts.drain();
        let drained = MutexGuard::unlocked(session, || {
            let deadline = Instant::now() + timeout;
            let mut draining = inner.drain.draining.lock();
            while *draining {
                if inner.drain.cond.wait_until(&mut draining, deadline).timed_out() {
                    break;
                }
            }
            !std::mem::replace(&mut *draining, false)
        });

        if let FlowState::Fatal(err) = &session.flow {
            return Err(err.clone());
        }
        if !drained {
            let err = PipelineError::Drain(format!("timed out after {timeout:?}"));
            error!("Drain failed: {}", err);
            inner.fail(session, &err);
            MutexGuard::unlocked(session, || inner.flush_after_failure());
            return Err(err);
        }
        debug!("Drained component");
        Ok(())
    }

    /// Discards everything in flight and restarts the output loop.
    pub fn flush(&self) -> Result<(), PipelineError> {
        let inner = &*self.inner;
        let component = &inner.component;
        let flush = inner.config.timeouts.flush();

        let mut session = inner.session.lock();
        if component.state() == ComponentState::Loaded {
            debug!("Flush while not started");
            return Ok(());
        }
        debug!("Flushing encoder");

        MutexGuard::unlocked(&mut session, || -> Result<(), ComponentError> {
            component.input().set_flushing(true, flush)?;
            component.output().set_flushing(true, flush)?;
            inner.finish_drain();
            self.join_loop();
            component.input().set_flushing(false, flush)?;
            component.output().set_flushing(false, flush)?;
            component.output().populate()
        })?;
        if let Some(err) = component.last_error() {
            return Err(err.into());
        }

        session.reset_stream();
        if self.wants_loop(&session) {
            self.start_loop(&mut session)?;
        }
        debug!("Flush finished");
        Ok(())
    }

    /// Stops processing and brings the component back to Idle. A new
    /// [`set_format`](Self::set_format) is needed before submitting again.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let inner = &*self.inner;
        let component = &inner.component;
        let flush = inner.config.timeouts.flush();
        debug!("Stopping encoder");

        let mut session = inner.session.lock();
        MutexGuard::unlocked(&mut session, || {
            for port in [component.input(), component.output()] {
                if let Err(err) = port.set_flushing(true, flush) {
                    warn!("Failed to flush {} port: {}", port.index(), err);
                }
            }
            inner.finish_drain();
            self.join_loop();
        });

        session.reset_stream();
        session.input_format = None;
        session.output_caps = None;
        session.import.reset();

        if component.state() > ComponentState::Idle {
            component.set_state(ComponentState::Idle)?;
            MutexGuard::unlocked(&mut session, || self.wait_for_state(ComponentState::Idle))?;
        }
        debug!("Stopped encoder");
        Ok(())
    }

    /// Shuts the component down to Loaded and frees every buffer.
    pub fn close(self) -> Result<(), PipelineError> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let component = &self.inner.component;
        debug!("Shutting down encoder");

        self.stop()?;
        if component.last_error().is_some() {
            for port in [component.input(), component.output()] {
                let _ = port.deallocate_buffers();
            }
            return Ok(());
        }

        if component.state() == ComponentState::Idle {
            component.set_state(ComponentState::Loaded)?;
            component.input().deallocate_buffers()?;
            component.output().deallocate_buffers()?;
            self.wait_for_state(ComponentState::Loaded)?;
        }
        info!("Closed encoder on {}", component.name());
        Ok(())
    }
}

impl Drop for EncoderPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("Failed to shut down encoder: {}", err);
        }
    }
}

/// Caller memory for the input port, `None` when the port allocates its own.
fn input_memory(
    mode: InputMode,
    definition: &PortDefinition,
    pool: &[ImportHandle],
) -> Option<Vec<BufferMemory>> {
    let capacity = definition.buffer_size;
    match mode {
        InputMode::Default => None,
        InputMode::ZeroCopy => {
            let count = definition
                .buffer_count
                .max(definition.min_buffer_count)
                .max(1);
            Some(
                (0..count)
                    .map(|_| BufferMemory::Borrowed {
                        data: Bytes::new(),
                        capacity,
                    })
                    .collect(),
            )
        }
        InputMode::Import => Some(
            pool.iter()
                .map(|&handle| BufferMemory::Imported { handle, capacity })
                .collect(),
        ),
    }
}
