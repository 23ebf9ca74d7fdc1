//! Port definitions and the per-port half of the buffer-ownership protocol.
//!
//! Every buffer allocated on a port is in exactly one place at a time:
//! queued on the port (acquirable or parked), held by the codec, or held by
//! the caller. [`PortStats`] exposes the counts so the conservation law can be
//! checked from outside.

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::{
    common::errors::ComponentError,
    omx::{
        buffer::{BufferDescriptor, BufferFlags, BufferMemory, ImportHandle},
        component::{ComponentState, CoreState, Shared},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortIndex {
    Input,
    Output,
}

impl PortIndex {
    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Input => 0,
            Self::Output => 1,
        }
    }
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    #[default]
    Unused,
    Yuv420Planar,
    Yuv420SemiPlanar,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoPortFormat {
    pub color_format: ColorFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the luma plane.
    pub stride: u32,
    /// Rows per plane, at least `height`.
    pub slice_height: u32,
    /// Frame rate in Q16 fixed point, or a plain integer on components with
    /// the integer-framerate quirk.
    pub framerate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDefinition {
    pub index: PortIndex,
    pub min_buffer_count: usize,
    pub buffer_count: usize,
    pub buffer_size: usize,
    /// Required alignment of buffer rows in bytes, 0 when unconstrained.
    pub buffer_alignment: usize,
    pub video: VideoPortFormat,
}

impl PortDefinition {
    pub fn new(index: PortIndex) -> Self {
        Self {
            index,
            min_buffer_count: 1,
            buffer_count: 1,
            buffer_size: crate::omx::constants::MIN_PORT_BUFFER_SIZE,
            buffer_alignment: 0,
            video: VideoPortFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStats {
    pub allocated: usize,
    pub free: usize,
    pub with_component: usize,
    pub with_caller: usize,
}

impl PortStats {
    pub fn is_conserved(&self) -> bool {
        self.allocated == self.free + self.with_component + self.with_caller
    }
}

/// Outcome of [`Port::acquire`].
#[derive(Debug)]
pub enum Acquire {
    Buffer(BufferDescriptor),
    Flushing,
    Eos,
    /// Port settings changed, the caller must run the reconfiguration
    /// protocol before acquiring again.
    Reconfigure,
    Error(ComponentError),
}

// ── Shared port state ────────────────────────────────────────────────────────

pub(crate) struct PortState {
    pub(crate) index: PortIndex,
    pub(crate) definition: PortDefinition,
    pub(crate) enabled: bool,
    /// Pending enable (`true`) or disable (`false`) transition.
    pub(crate) transition: Option<bool>,
    pub(crate) flushing: bool,
    pub(crate) eos: bool,
    /// Buffers the caller may acquire.
    pub(crate) ready: VecDeque<BufferDescriptor>,
    /// Output buffers waiting to be handed to the codec by `populate`.
    pub(crate) parked: VecDeque<BufferDescriptor>,
    pub(crate) allocated: usize,
    pub(crate) with_component: usize,
    pub(crate) with_caller: usize,
    pub(crate) generation: u32,
    pub(crate) settings_cookie: u32,
    pub(crate) configured_cookie: u32,
}

impl PortState {
    pub(crate) fn new(definition: PortDefinition) -> Self {
        Self {
            index: definition.index,
            definition,
            enabled: true,
            transition: None,
            flushing: false,
            eos: false,
            ready: VecDeque::new(),
            parked: VecDeque::new(),
            allocated: 0,
            with_component: 0,
            with_caller: 0,
            generation: 0,
            settings_cookie: 0,
            configured_cookie: 0,
        }
    }

    pub(crate) fn populated(&self) -> bool {
        self.allocated > 0 && self.allocated >= self.definition.buffer_count
    }

    pub(crate) fn settings_changed(&self) -> bool {
        self.settings_cookie != self.configured_cookie
    }

    pub(crate) fn stats(&self) -> PortStats {
        PortStats {
            allocated: self.allocated,
            free: self.ready.len() + self.parked.len(),
            with_component: self.with_component,
            with_caller: self.with_caller,
        }
    }

    /// Queues a buffer that must not reach the codec right now.
    pub(crate) fn park(&mut self, buf: BufferDescriptor) {
        match self.index {
            PortIndex::Input => self.ready.push_back(buf),
            PortIndex::Output => self.parked.push_back(buf),
        }
    }

    /// Forgets every buffer after a component fault. Descriptors still out
    /// in the wild carry the old generation and are dropped on return.
    pub(crate) fn abandon(&mut self) {
        self.ready.clear();
        self.parked.clear();
        self.allocated = 0;
        self.with_component = 0;
        self.with_caller = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    fn check_can_populate(
        &self,
        current: ComponentState,
        pending: Option<ComponentState>,
    ) -> Result<(), ComponentError> {
        let loading = current == ComponentState::Loaded && pending == Some(ComponentState::Idle);
        let enabling = self.transition == Some(true);
        if !self.enabled {
            return Err(ComponentError::invalid_operation(format!(
                "{} port is disabled",
                self.index
            )));
        }
        if !(loading || enabling) {
            return Err(ComponentError::invalid_operation(format!(
                "cannot allocate {} buffers in state {current:?}",
                self.index
            )));
        }
        if self.allocated > 0 {
            return Err(ComponentError::invalid_operation(format!(
                "{} port already holds {} buffers",
                self.index, self.allocated
            )));
        }
        Ok(())
    }

    fn install(&mut self, memory: Vec<BufferMemory>) {
        self.generation = self.generation.wrapping_add(1);
        self.definition.buffer_count = memory.len();
        self.allocated = memory.len();
        for (id, mem) in memory.into_iter().enumerate() {
            let buf = BufferDescriptor::new(id as u32, self.index, self.generation, mem);
            self.park(buf);
        }
    }
}

// ── Port handle ──────────────────────────────────────────────────────────────

/// Handle to one port of a [`Component`](crate::omx::Component).
#[derive(Clone)]
pub struct Port {
    index: PortIndex,
    shared: Arc<Shared>,
}

impl Port {
    pub(crate) fn new(index: PortIndex, shared: Arc<Shared>) -> Self {
        Self { index, shared }
    }

    pub fn index(&self) -> PortIndex {
        self.index
    }

    pub fn definition(&self) -> PortDefinition {
        self.shared.state.lock().port(self.index).definition.clone()
    }

    pub fn stats(&self) -> PortStats {
        self.shared.state.lock().port(self.index).stats()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().port(self.index).enabled
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.state.lock().port(self.index).flushing
    }

    /// Pushes a new definition to the codec. Only allowed while the
    /// component is Loaded or the port is disabled.
    pub fn update_definition(&self, mut definition: PortDefinition) -> Result<(), ComponentError> {
        if definition.index != self.index {
            return Err(ComponentError::BadParameter(format!(
                "{} port definition given to the {} port",
                definition.index, self.index
            )));
        }
        {
            let core = self.shared.state.lock();
            core.check_fault()?;
            let loaded = core.current == ComponentState::Loaded;
            if !loaded && core.port(self.index).enabled {
                return Err(ComponentError::invalid_operation(format!(
                    "{} port definition can only change while loaded or disabled",
                    self.index
                )));
            }
        }

        self.shared.codec.on_port_definition(self.index, &mut definition)?;

        let mut core = self.shared.state.lock();
        debug!("Updated {} port definition: {:?}", self.index, definition);
        core.port_mut(self.index).definition = definition;
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Blocks until a buffer is available or the port reports a condition.
    pub fn acquire(&self) -> Acquire {
        self.acquire_where(|_| true)
    }

    /// Acquires the buffer bound to `handle` on an import-mode port.
    pub fn acquire_handle(&self, handle: ImportHandle) -> Acquire {
        self.acquire_where(|buf| buf.import_handle() == Some(handle))
    }

    fn acquire_where(&self, mut matches: impl FnMut(&BufferDescriptor) -> bool) -> Acquire {
        let shared = &*self.shared;
        let mut core = shared.state.lock();
        loop {
            if let Some(err) = &core.last_error {
                return Acquire::Error(err.clone());
            }
            let loaded = core.current == ComponentState::Loaded;
            let port = core.port_mut(self.index);

            if port.flushing {
                trace!("{} port is flushing", self.index);
                return Acquire::Flushing;
            }

            match self.index {
                PortIndex::Output => {
                    if !port.enabled && !loaded {
                        return Acquire::Reconfigure;
                    }
                    // Buffers completed before a settings change are still
                    // delivered, the change applies to what follows.
                    if let Some(buf) = port.ready.pop_front() {
                        if buf.flags.contains(BufferFlags::END_OF_STREAM) {
                            debug!("Output port reached EOS");
                            port.eos = true;
                            if buf.filled_len == 0 {
                                port.parked.push_back(buf);
                                return Acquire::Eos;
                            }
                        }
                        return self.hand_out(port, buf);
                    }
                    if port.settings_changed() {
                        debug!("Output port settings changed, needs reconfiguration");
                        return Acquire::Reconfigure;
                    }
                    if port.eos {
                        return Acquire::Eos;
                    }
                }
                PortIndex::Input => {
                    if port.settings_changed() {
                        debug!("Input port settings changed, needs reconfiguration");
                        return Acquire::Reconfigure;
                    }
                    if !port.enabled && port.transition.is_none() && !loaded {
                        return Acquire::Error(ComponentError::invalid_operation(
                            "input port is disabled",
                        ));
                    }
                    if let Some(pos) = port.ready.iter().position(&mut matches) {
                        if let Some(mut buf) = port.ready.remove(pos) {
                            buf.reset();
                            return self.hand_out(port, buf);
                        }
                    }
                }
            }

            shared.cond.wait(&mut core);
        }
    }

    fn hand_out(&self, port: &mut PortState, buf: BufferDescriptor) -> Acquire {
        port.with_caller += 1;
        assert!(
            port.with_caller <= port.allocated,
            "{} port handed out {} buffers but only {} exist",
            self.index,
            port.with_caller,
            port.allocated
        );
        trace!("Acquired {} buffer {}", self.index, buf.id());
        Acquire::Buffer(buf)
    }

    /// Moves a buffer back to the codec: filled input for encoding, or an
    /// emptied output buffer for refilling. While the port is flushing or
    /// disabled the buffer stays queued on the port instead.
    pub fn release(&self, mut buf: BufferDescriptor) -> Result<(), ComponentError> {
        assert_eq!(
            buf.port(),
            self.index,
            "buffer {} released to the wrong port",
            buf.id()
        );
        let shared = &*self.shared;
        let mut core = shared.state.lock();
        let fault = core.last_error.clone();
        let running = matches!(
            core.current,
            ComponentState::Idle | ComponentState::Executing
        );
        let port = core.port_mut(self.index);

        if buf.generation() != port.generation {
            debug!("Dropping stale {} buffer {}", self.index, buf.id());
            return Ok(());
        }
        assert!(
            port.with_caller > 0,
            "{} port has no outstanding buffers",
            self.index
        );
        port.with_caller -= 1;

        if let Some(err) = fault {
            port.park(buf);
            shared.cond.notify_all();
            return Err(err);
        }
        if port.flushing || !port.enabled || !running {
            trace!("Parking {} buffer {}", self.index, buf.id());
            port.park(buf);
            shared.cond.notify_all();
            return Ok(());
        }

        if self.index == PortIndex::Output {
            buf.reset();
        }
        port.with_component += 1;
        drop(core);

        let result = match self.index {
            PortIndex::Input => shared.codec.empty_this_buffer(buf),
            PortIndex::Output => shared.codec.fill_this_buffer(buf),
        };
        result.map_err(|rejected| shared.reject(rejected))
    }

    /// Puts back a buffer that was acquired but never filled, without
    /// involving the codec.
    pub fn return_unused(&self, buf: BufferDescriptor) {
        let mut core = self.shared.state.lock();
        let port = core.port_mut(self.index);
        if buf.generation() != port.generation {
            return;
        }
        port.with_caller = port.with_caller.saturating_sub(1);
        port.park(buf);
        self.shared.cond.notify_all();
    }

    /// Toggles flushing. Entering flushing wakes every waiter and asks the
    /// codec to return what it holds on this port, then waits for it.
    pub fn set_flushing(&self, flushing: bool, timeout: Duration) -> Result<(), ComponentError> {
        let shared = &*self.shared;
        let mut core = shared.state.lock();
        let running = matches!(
            core.current,
            ComponentState::Idle | ComponentState::Executing
        ) && core.last_error.is_none();
        let port = core.port_mut(self.index);
        if port.flushing == flushing {
            return Ok(());
        }

        debug!(
            "{} flushing on {} port",
            if flushing { "Setting" } else { "Clearing" },
            self.index
        );
        port.flushing = flushing;
        if !flushing {
            port.eos = false;
            shared.cond.notify_all();
            return Ok(());
        }

        // Completed output that nobody acquired yet is stale now.
        if self.index == PortIndex::Output {
            port.parked.append(&mut port.ready);
        }
        let held = port.with_component;
        shared.cond.notify_all();
        if !running || held == 0 {
            return Ok(());
        }
        drop(core);

        shared.codec.flush(self.index);

        let index = self.index;
        let mut core = shared.state.lock();
        shared.wait_until(&mut core, timeout, &format!("{index} port flush"), |core| {
            core.check_fault()?;
            Ok(core.port(index).with_component == 0)
        })
    }

    /// Starts an enable or disable transition. Completion is observed with
    /// [`Port::wait_enabled`]. Disabling asks the codec to return the
    /// buffers it holds on this port.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), ComponentError> {
        let shared = &*self.shared;
        let mut core = shared.state.lock();
        core.check_fault()?;
        let loaded = core.current == ComponentState::Loaded && core.pending.is_none();
        let port = core.port_mut(self.index);
        if port.enabled == enabled {
            return Ok(());
        }

        debug!(
            "{} {} port",
            if enabled { "Enabling" } else { "Disabling" },
            self.index
        );
        port.enabled = enabled;
        port.transition = if loaded { None } else { Some(enabled) };
        let hand_back = !enabled && port.with_component > 0;
        if !enabled && self.index == PortIndex::Output {
            port.parked.append(&mut port.ready);
        }
        core.update_transitions();
        shared.cond.notify_all();
        drop(core);

        if hand_back {
            shared.codec.flush(self.index);
        }
        Ok(())
    }

    /// Waits for a pending enable or disable transition to complete.
    pub fn wait_enabled(&self, timeout: Duration) -> Result<(), ComponentError> {
        let index = self.index;
        let what = format!("{index} port enable transition");
        let mut core = self.shared.state.lock();
        self.shared.wait_until(&mut core, timeout, &what, |core| {
            core.check_fault()?;
            Ok(core.port(index).transition.is_none())
        })
    }

    /// Waits until the codec holds no buffers of this port.
    pub fn wait_buffers_released(&self, timeout: Duration) -> Result<(), ComponentError> {
        let index = self.index;
        let what = format!("buffers released on {index} port");
        let mut core = self.shared.state.lock();
        self.shared.wait_until(&mut core, timeout, &what, |core| {
            core.check_fault()?;
            Ok(core.port(index).with_component == 0)
        })
    }

    /// Allocates the port's buffers from its current definition.
    pub fn allocate_buffers(&self) -> Result<(), ComponentError> {
        let mut core = self.shared.state.lock();
        core.check_fault()?;
        let (current, pending) = (core.current, core.pending);
        let port = core.port_mut(self.index);
        port.check_can_populate(current, pending)?;

        let def = &port.definition;
        let count = def.buffer_count.max(def.min_buffer_count).max(1);
        let size = def.buffer_size.max(1);
        let memory = (0..count)
            .map(|_| BufferMemory::Allocated(BytesMut::zeroed(size)))
            .collect();
        port.install(memory);
        debug!(
            "Allocated {} buffers of {} bytes on {} port",
            count, size, self.index
        );

        core.update_transitions();
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Binds caller-provided memory (zero-copy placeholders or imported
    /// handles) instead of allocating.
    pub fn use_buffers(&self, memory: Vec<BufferMemory>) -> Result<(), ComponentError> {
        if memory.is_empty() {
            return Err(ComponentError::BadParameter(format!(
                "no buffers given for the {} port",
                self.index
            )));
        }
        let mut core = self.shared.state.lock();
        core.check_fault()?;
        let (current, pending) = (core.current, core.pending);
        let port = core.port_mut(self.index);
        port.check_can_populate(current, pending)?;
        if memory.len() < port.definition.min_buffer_count {
            return Err(ComponentError::InsufficientResources(format!(
                "{} port needs at least {} buffers, got {}",
                self.index,
                port.definition.min_buffer_count,
                memory.len()
            )));
        }

        let count = memory.len();
        port.install(memory);
        debug!("Using {} caller buffers on {} port", count, self.index);

        core.update_transitions();
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Frees every buffer of the port. A no-op when nothing is allocated.
    pub fn deallocate_buffers(&self) -> Result<(), ComponentError> {
        let mut core = self.shared.state.lock();
        let faulted = core.last_error.is_some();
        let unloading = core.current == ComponentState::Loaded
            || (core.current == ComponentState::Idle
                && core.pending == Some(ComponentState::Loaded));
        let port = core.port_mut(self.index);
        if port.allocated == 0 {
            return Ok(());
        }

        if faulted {
            warn!(
                "Abandoning {} buffers of faulted {} port",
                port.allocated, self.index
            );
            port.abandon();
        } else {
            if port.enabled && !unloading {
                return Err(ComponentError::invalid_operation(format!(
                    "cannot free buffers of enabled {} port",
                    self.index
                )));
            }
            if port.with_component > 0 || port.with_caller > 0 {
                return Err(ComponentError::invalid_operation(format!(
                    "{} port still has {} buffers with the component and {} with the caller",
                    self.index, port.with_component, port.with_caller
                )));
            }
            debug!("Freeing {} buffers of {} port", port.allocated, self.index);
            port.ready.clear();
            port.parked.clear();
            port.allocated = 0;
            port.generation = port.generation.wrapping_add(1);
        }

        core.update_transitions();
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Hands every parked output buffer to the codec for filling.
    pub fn populate(&self) -> Result<(), ComponentError> {
        if self.index == PortIndex::Input {
            return Ok(());
        }
        let shared = &*self.shared;
        let mut core = shared.state.lock();
        core.check_fault()?;
        let executing = core.current == ComponentState::Executing;
        let port = core.port_mut(self.index);
        if !executing || !port.enabled || port.flushing || port.transition.is_some() {
            return Ok(());
        }

        let buffers: Vec<_> = port.parked.drain(..).collect();
        port.with_component += buffers.len();
        drop(core);

        debug!("Populating output port with {} buffers", buffers.len());
        for mut buf in buffers {
            buf.reset();
            if let Err(rejected) = shared.codec.fill_this_buffer(buf) {
                return Err(shared.reject(rejected));
            }
        }
        Ok(())
    }

    /// Records that the current port settings have been applied.
    pub fn mark_reconfigured(&self) {
        let mut core = self.shared.state.lock();
        let port = core.port_mut(self.index);
        port.configured_cookie = port.settings_cookie;
        self.shared.cond.notify_all();
    }
}

impl CoreState {
    pub(crate) fn port(&self, index: PortIndex) -> &PortState {
        &self.ports[index.slot()]
    }

    pub(crate) fn port_mut(&mut self, index: PortIndex) -> &mut PortState {
        &mut self.ports[index.slot()]
    }
}
