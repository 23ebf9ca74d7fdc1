//! A codec that holds buffers until the test hands them back.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::{
    common::errors::ComponentError,
    omx::{
        BufferDescriptor, Codec, ComponentEvents, ComponentState, PortDefinition, PortIndex,
        Rejected,
    },
};

pub(crate) struct ManualCodec {
    events: Mutex<Option<ComponentEvents>>,
    held: Mutex<Vec<BufferDescriptor>>,
    withhold: AtomicBool,
}

impl ManualCodec {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(None),
            held: Mutex::new(Vec::new()),
            withhold: AtomicBool::new(false),
        }
    }

    pub(crate) fn events(&self) -> ComponentEvents {
        self.events.lock().clone().expect("codec not attached")
    }

    pub(crate) fn withhold(&self, on: bool) {
        self.withhold.store(on, Ordering::SeqCst);
    }

    pub(crate) fn held(&self, port: PortIndex) -> usize {
        self.held.lock().iter().filter(|b| b.port() == port).count()
    }

    /// Hands back every buffer held on `port`.
    pub(crate) fn complete(&self, port: PortIndex) {
        let buffers: Vec<_> = {
            let mut held = self.held.lock();
            let (out, keep): (Vec<_>, Vec<_>) = held.drain(..).partition(|b| b.port() == port);
            *held = keep;
            out
        };
        let events = self.events();
        for buf in buffers {
            match port {
                PortIndex::Input => events.empty_buffer_done(buf),
                PortIndex::Output => events.fill_buffer_done(buf),
            }
        }
    }
}

impl Codec for ManualCodec {
    fn name(&self) -> &str {
        "manual"
    }

    fn attach(&self, events: ComponentEvents) {
        *self.events.lock() = Some(events);
    }

    fn default_definition(&self, port: PortIndex) -> PortDefinition {
        let mut def = PortDefinition::new(port);
        def.min_buffer_count = 2;
        def.buffer_count = 3;
        def.buffer_size = 64;
        def
    }

    fn on_state(&self, from: ComponentState, to: ComponentState) -> Result<(), ComponentError> {
        if from == ComponentState::Executing && to == ComponentState::Idle {
            self.complete(PortIndex::Input);
            self.complete(PortIndex::Output);
        }
        Ok(())
    }

    fn empty_this_buffer(&self, buf: BufferDescriptor) -> Result<(), Rejected> {
        self.held.lock().push(buf);
        Ok(())
    }

    fn fill_this_buffer(&self, buf: BufferDescriptor) -> Result<(), Rejected> {
        self.held.lock().push(buf);
        Ok(())
    }

    fn flush(&self, port: PortIndex) {
        if !self.withhold.load(Ordering::SeqCst) {
            self.complete(port);
        }
    }
}
