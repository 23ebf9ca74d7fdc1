//! The output thread: acquire an output buffer, match it to a pending frame,
//! hand it to the codec variant, give it back to the component.

use std::sync::Arc;

use tracing::{debug, error, info, trace};

use crate::{
    common::errors::{FlowError, PipelineError},
    encoder::{
        pipeline::{FlowState, Inner, Session},
        reconfigure,
        variant::OutputContext,
    },
    omx::{Acquire, BufferDescriptor, BufferFlags},
};

enum Step {
    Continue,
    Pause,
}

pub(crate) fn run(inner: Arc<Inner>) {
    debug!("Output loop running");
    while let Step::Continue = step(&inner) {}
    debug!("Output loop paused");
}

fn step(inner: &Inner) -> Step {
    match inner.component.output().acquire() {
        Acquire::Buffer(buf) => handle_buffer(inner, buf),
        Acquire::Flushing => {
            debug!("Flushing -- stopping task");
            flushing(inner, &mut inner.session.lock())
        }
        Acquire::Eos => {
            let mut session = inner.session.lock();
            if inner.finish_drain() {
                debug!("Drained");
            } else if matches!(session.flow, FlowState::Fatal(_)) {
                debug!("Component signalled EOS after a failure");
            } else {
                debug!("Component signalled EOS");
                session.flow = FlowState::Eos;
                if !session.eos_forwarded {
                    session.eos_forwarded = true;
                    inner.sink.end_of_stream();
                }
            }
            pause(&mut session)
        }
        Acquire::Reconfigure => match reconfigure_output(inner) {
            Ok(()) => Step::Continue,
            Err(err) => fatal(inner, err),
        },
        Acquire::Error(err) => fatal(inner, err.into()),
    }
}

fn pause(session: &mut Session) -> Step {
    session.running = false;
    Step::Pause
}

fn flushing(inner: &Inner, session: &mut Session) -> Step {
    if !matches!(session.flow, FlowState::Fatal(_)) {
        session.flow = FlowState::Flushing;
    }
    inner.finish_drain();
    pause(session)
}

/// Tears down the output port, publishes caps for its new definition and
/// brings it back. Only the caps step takes the session lock.
fn reconfigure_output(inner: &Inner) -> Result<(), PipelineError> {
    let output = inner.component.output();
    let timeouts = &inner.config.timeouts;
    info!("Reconfiguring output port");

    reconfigure::tear_down(output, timeouts)?;
    publish_caps(inner, &mut inner.session.lock())?;
    reconfigure::rebuild(output, timeouts, None)
}

fn publish_caps(inner: &Inner, session: &mut Session) -> Result<(), PipelineError> {
    let Some(format) = session.input_format.clone() else {
        return Err(PipelineError::NotNegotiated("no input format set".into()));
    };
    let caps = inner
        .variant
        .get_caps(&inner.component, &format)
        .ok_or_else(|| PipelineError::NotNegotiated(format!("{} has no caps", inner.variant.name())))?;
    info!("Setting output caps: {}", caps);
    inner
        .sink
        .set_caps(&caps)
        .map_err(|err| PipelineError::NotNegotiated(err.to_string()))?;
    session.output_caps = Some(caps);
    Ok(())
}

fn handle_buffer(inner: &Inner, buf: BufferDescriptor) -> Step {
    let output = inner.component.output();
    trace!(
        "Handling output buffer {}: {} bytes, flags {:?}, ts {}",
        buf.id(),
        buf.filled_len,
        buf.flags,
        buf.timestamp
    );

    let mut session = inner.session.lock();
    if output.is_flushing() {
        debug!("Flushing -- returning buffer");
        output.return_unused(buf);
        return flushing(inner, &mut session);
    }

    if session.output_caps.is_none() {
        if let Err(err) = publish_caps(inner, &mut session) {
            output.return_unused(buf);
            drop(session);
            return fatal(inner, err);
        }
    }

    let frame = if buf.flags.contains(BufferFlags::CONFIG) {
        None
    } else {
        session.pending.take_nearest(buf.timestamp)
    };

    let result = {
        let mut ctx = OutputContext {
            component: &inner.component,
            sink: &*inner.sink,
            session: &mut *session,
            quirks: &inner.config.quirks,
            variant: &*inner.variant,
        };
        inner.variant.handle_output_frame(&mut ctx, &buf, frame)
    };

    let released = output.release(buf);
    match (result, released) {
        (_, Err(err)) => {
            drop(session);
            fatal(inner, err.into())
        }
        (Ok(()), Ok(())) => Step::Continue,
        (Err(FlowError::Flushing), _) => {
            debug!("Downstream is flushing");
            flushing(inner, &mut session)
        }
        (Err(FlowError::Eos), _) => {
            debug!("Downstream returned EOS");
            session.flow = FlowState::Eos;
            pause(&mut session)
        }
        (Err(FlowError::NotNegotiated), _) => {
            drop(session);
            fatal(
                inner,
                PipelineError::NotNegotiated("downstream refused the output".into()),
            )
        }
        (Err(err), _) => {
            drop(session);
            fatal(inner, err.into())
        }
    }
}

/// Records the error, tells downstream and stops. Input is set flushing so
/// submitters blocked on a full input port wake up and see the error.
fn fatal(inner: &Inner, err: PipelineError) -> Step {
    error!("Output loop failed: {}", err);
    inner.fail(&mut inner.session.lock(), &err);

    let flush = inner.config.timeouts.flush();
    if let Err(flush_err) = inner.component.input().set_flushing(true, flush) {
        debug!("Could not flush input after error: {}", flush_err);
    }
    pause(&mut inner.session.lock())
}
