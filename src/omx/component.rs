//! Component state machine and the shared state behind both ports.
//!
//! All port and component state lives under one mutex with one condition
//! variable. Every state change broadcasts, so any waiter (buffer acquisition,
//! state waits, enable transitions, release waits) re-checks its predicate.

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::{
    common::errors::ComponentError,
    omx::{
        buffer::BufferDescriptor,
        codec::{Codec, Rejected},
        params::{ConfigRequest, Parameter},
        port::{Port, PortDefinition, PortIndex, PortState},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentState {
    Invalid,
    Loaded,
    Idle,
    Executing,
}

// ── Shared state ─────────────────────────────────────────────────────────────

pub(crate) struct CoreState {
    pub(crate) current: ComponentState,
    pub(crate) pending: Option<ComponentState>,
    pub(crate) last_error: Option<ComponentError>,
    pub(crate) ports: [PortState; 2],
}

impl CoreState {
    pub(crate) fn check_fault(&self) -> Result<(), ComponentError> {
        match &self.last_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Completes whatever port or component transition is now satisfied.
    pub(crate) fn update_transitions(&mut self) {
        for port in &mut self.ports {
            match port.transition {
                Some(false) if port.allocated == 0 => {
                    debug!("{} port disabled", port.index);
                    port.transition = None;
                }
                Some(true) if port.populated() => {
                    debug!("{} port enabled", port.index);
                    port.transition = None;
                }
                _ => {}
            }
        }

        let Some(target) = self.pending else {
            return;
        };
        let done = match (self.current, target) {
            (ComponentState::Loaded, ComponentState::Idle) => {
                self.ports.iter().all(|p| !p.enabled || p.populated())
            }
            (ComponentState::Executing, ComponentState::Idle) => {
                self.ports.iter().all(|p| p.with_component == 0)
            }
            (ComponentState::Idle, ComponentState::Loaded) => {
                self.ports.iter().all(|p| p.allocated == 0)
            }
            _ => true,
        };
        if done {
            debug!("Component reached state {:?}", target);
            self.current = target;
            self.pending = None;
        }
    }
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) state: Mutex<CoreState>,
    pub(crate) cond: Condvar,
}

impl Shared {
    /// Waits on the condition variable until `done` holds, fails, or the
    /// deadline passes.
    pub(crate) fn wait_until<F>(
        &self,
        core: &mut MutexGuard<'_, CoreState>,
        timeout: Duration,
        what: &str,
        mut done: F,
    ) -> Result<(), ComponentError>
    where
        F: FnMut(&CoreState) -> Result<bool, ComponentError>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&**core)? {
                return Ok(());
            }
            if self.cond.wait_until(core, deadline).timed_out() {
                return match done(&**core)? {
                    true => Ok(()),
                    false => {
                        warn!("{}: timed out waiting for {}", self.name, what);
                        Err(ComponentError::timeout(what, timeout))
                    }
                };
            }
        }
    }

    fn buffer_done(&self, buf: BufferDescriptor) {
        let mut core = self.state.lock();
        let port = core.port_mut(buf.port());
        if buf.generation() != port.generation {
            trace!("Dropping stale {} buffer {}", port.index, buf.id());
            return;
        }
        if port.with_component == 0 {
            warn!(
                "{} port got back buffer {} it never gave out",
                port.index,
                buf.id()
            );
            return;
        }
        port.with_component -= 1;
        trace!(
            "{} buffer {} returned ({} bytes, flags {:?})",
            port.index,
            buf.id(),
            buf.filled_len,
            buf.flags
        );
        if port.index == PortIndex::Output && (port.flushing || !port.enabled) {
            port.parked.push_back(buf);
        } else {
            port.ready.push_back(buf);
        }
        core.update_transitions();
        self.cond.notify_all();
    }

    /// Takes back a buffer the codec refused and faults the component.
    pub(crate) fn reject(&self, rejected: Rejected) -> ComponentError {
        let Rejected { error, buffer } = rejected;
        let mut core = self.state.lock();
        let port = core.port_mut(buffer.port());
        if buffer.generation() == port.generation {
            port.with_component = port.with_component.saturating_sub(1);
            port.park(buffer);
        }
        self.fault(&mut core, error.clone());
        error
    }

    fn fault(&self, core: &mut CoreState, err: ComponentError) {
        error!("{}: {}", self.name, err);
        if core.last_error.is_none() {
            core.last_error = Some(err);
        }
        core.current = ComponentState::Invalid;
        core.pending = None;
        self.cond.notify_all();
    }
}

// ── Event sink handed to the codec ───────────────────────────────────────────

/// Callbacks through which a codec returns buffers and reports events.
#[derive(Clone)]
pub struct ComponentEvents {
    shared: Weak<Shared>,
}

impl ComponentEvents {
    pub fn empty_buffer_done(&self, buf: BufferDescriptor) {
        if let Some(shared) = self.shared.upgrade() {
            shared.buffer_done(buf);
        }
    }

    pub fn fill_buffer_done(&self, buf: BufferDescriptor) {
        if let Some(shared) = self.shared.upgrade() {
            shared.buffer_done(buf);
        }
    }

    /// Raises a port settings change. The next acquire on that port reports
    /// [`Acquire::Reconfigure`](crate::omx::Acquire::Reconfigure).
    pub fn port_settings_changed(&self, port: PortIndex, definition: PortDefinition) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut core = shared.state.lock();
        info!("{}: {} port settings changed", shared.name, port);
        let state = core.port_mut(port);
        state.definition = definition;
        state.settings_cookie = state.settings_cookie.wrapping_add(1);
        shared.cond.notify_all();
    }

    /// Silently updates a port definition, e.g. the output buffer size after
    /// the input format was set.
    pub fn update_definition(&self, port: PortIndex, definition: PortDefinition) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().port_mut(port).definition = definition;
            shared.cond.notify_all();
        }
    }

    /// Reports an asynchronous fault. The component becomes Invalid.
    pub fn error(&self, err: ComponentError) {
        if let Some(shared) = self.shared.upgrade() {
            let mut core = shared.state.lock();
            shared.fault(&mut core, err);
        }
    }
}

// ── Component ────────────────────────────────────────────────────────────────

pub struct Component {
    shared: Arc<Shared>,
    input: Port,
    output: Port,
}

impl Component {
    /// Wraps a codec. The component starts Loaded with both ports enabled
    /// and unpopulated.
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        let name = codec.name().to_string();
        let ports = [
            PortState::new(codec.default_definition(PortIndex::Input)),
            PortState::new(codec.default_definition(PortIndex::Output)),
        ];
        let shared = Arc::new(Shared {
            name,
            codec: Arc::clone(&codec),
            state: Mutex::new(CoreState {
                current: ComponentState::Loaded,
                pending: None,
                last_error: None,
                ports,
            }),
            cond: Condvar::new(),
        });
        codec.attach(ComponentEvents {
            shared: Arc::downgrade(&shared),
        });
        info!("Opened component {}", shared.name);

        Self {
            input: Port::new(PortIndex::Input, Arc::clone(&shared)),
            output: Port::new(PortIndex::Output, Arc::clone(&shared)),
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn input(&self) -> &Port {
        &self.input
    }

    pub fn output(&self) -> &Port {
        &self.output
    }

    pub fn port(&self, index: PortIndex) -> &Port {
        match index {
            PortIndex::Input => &self.input,
            PortIndex::Output => &self.output,
        }
    }

    /// Current state without waiting for pending transitions.
    pub fn state(&self) -> ComponentState {
        self.shared.state.lock().current
    }

    pub fn last_error(&self) -> Option<ComponentError> {
        self.shared.state.lock().last_error.clone()
    }

    /// Requests a state transition. Loaded and Idle, Idle and Executing are
    /// the only legal neighbours. Entering Executing hands the output buffers
    /// to the codec.
    pub fn set_state(&self, target: ComponentState) -> Result<(), ComponentError> {
        let shared = &*self.shared;
        let mut core = shared.state.lock();
        core.check_fault()?;
        if core.pending.is_some() {
            return Err(ComponentError::invalid_operation(
                "a state transition is already pending",
            ));
        }
        let from = core.current;
        if from == target {
            return Ok(());
        }
        let legal = matches!(
            (from, target),
            (ComponentState::Loaded, ComponentState::Idle)
                | (ComponentState::Idle, ComponentState::Executing)
                | (ComponentState::Executing, ComponentState::Idle)
                | (ComponentState::Idle, ComponentState::Loaded)
        );
        if !legal {
            return Err(ComponentError::IncorrectStateTransition { from, to: target });
        }
        if target == ComponentState::Executing
            && !core.ports.iter().all(|p| p.enabled && p.populated())
        {
            return Err(ComponentError::invalid_operation(
                "both ports must be enabled and populated before executing",
            ));
        }
        core.pending = Some(target);
        drop(core);

        debug!("Setting {} state {:?} -> {:?}", shared.name, from, target);
        if let Err(err) = shared.codec.on_state(from, target) {
            let mut core = shared.state.lock();
            core.pending = None;
            shared.cond.notify_all();
            return Err(err);
        }

        let mut core = shared.state.lock();
        if core.pending == Some(target) {
            core.update_transitions();
        }
        let executing = core.current == ComponentState::Executing;
        shared.cond.notify_all();
        drop(core);

        if target == ComponentState::Executing && executing {
            self.output.populate()?;
        }
        Ok(())
    }

    /// Waits for the pending transition and returns the state reached.
    pub fn wait_state(&self, timeout: Duration) -> Result<ComponentState, ComponentError> {
        let mut core = self.shared.state.lock();
        self.shared
            .wait_until(&mut core, timeout, "state change", |core| {
                core.check_fault()?;
                Ok(core.pending.is_none())
            })?;
        Ok(core.current)
    }

    pub fn get_parameter(&self, param: &mut Parameter) -> Result<(), ComponentError> {
        self.shared.state.lock().check_fault()?;
        self.shared.codec.get_parameter(param)
    }

    pub fn set_parameter(&self, param: &Parameter) -> Result<(), ComponentError> {
        self.shared.state.lock().check_fault()?;
        self.shared.codec.set_parameter(param)
    }

    pub fn set_config(&self, config: ConfigRequest) -> Result<(), ComponentError> {
        self.shared.state.lock().check_fault()?;
        self.shared.codec.set_config(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omx::testing::ManualCodec;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn starts_loaded_with_enabled_ports() {
        let component = Component::new(Arc::new(ManualCodec::new()));
        assert_eq!(component.state(), ComponentState::Loaded);
        assert!(component.input().is_enabled());
        assert!(component.output().is_enabled());
        assert_eq!(component.name(), "manual");
    }

    #[test]
    fn rejects_skipping_states() {
        let component = Component::new(Arc::new(ManualCodec::new()));
        let err = component.set_state(ComponentState::Executing).unwrap_err();
        assert_eq!(
            err,
            ComponentError::IncorrectStateTransition {
                from: ComponentState::Loaded,
                to: ComponentState::Executing,
            }
        );
    }

    #[test]
    fn idle_waits_for_population() {
        let component = Component::new(Arc::new(ManualCodec::new()));
        component.set_state(ComponentState::Idle).unwrap();
        let err = component.wait_state(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, ComponentError::Timeout { .. }));

        component.input().allocate_buffers().unwrap();
        component.output().allocate_buffers().unwrap();
        assert_eq!(component.wait_state(WAIT).unwrap(), ComponentState::Idle);
    }

    #[test]
    fn full_lifecycle_returns_to_loaded() {
        let codec = Arc::new(ManualCodec::new());
        let component = Component::new(codec.clone());
        component.set_state(ComponentState::Idle).unwrap();
        component.input().allocate_buffers().unwrap();
        component.output().allocate_buffers().unwrap();
        component.wait_state(WAIT).unwrap();

        component.set_state(ComponentState::Executing).unwrap();
        assert_eq!(component.state(), ComponentState::Executing);
        assert_eq!(codec.held(PortIndex::Output), component.output().stats().allocated);

        component.set_state(ComponentState::Idle).unwrap();
        assert_eq!(component.wait_state(WAIT).unwrap(), ComponentState::Idle);
        assert_eq!(codec.held(PortIndex::Output), 0);

        component.set_state(ComponentState::Loaded).unwrap();
        component.input().deallocate_buffers().unwrap();
        component.output().deallocate_buffers().unwrap();
        assert_eq!(component.wait_state(WAIT).unwrap(), ComponentState::Loaded);
    }

    #[test]
    fn disabled_port_need_not_be_populated_for_idle() {
        let component = Component::new(Arc::new(ManualCodec::new()));
        component.input().set_enabled(false).unwrap();
        component.set_state(ComponentState::Idle).unwrap();
        component.output().allocate_buffers().unwrap();
        assert_eq!(component.wait_state(WAIT).unwrap(), ComponentState::Idle);
        assert!(component.set_state(ComponentState::Executing).is_err());
    }
}
