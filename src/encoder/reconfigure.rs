//! Port reconfiguration: disable, drain, reallocate, enable.
//!
//! Split in two halves so caps can be published in between, with the new
//! output definition known but no buffers allocated yet.

use tracing::debug;

use crate::{
    common::errors::{ComponentError, PipelineError},
    configs::TimeoutConfig,
    omx::{BufferMemory, Port},
};

fn step(port: &Port, result: Result<(), ComponentError>) -> Result<(), PipelineError> {
    result.map_err(|source| PipelineError::Reconfigure {
        port: port.index(),
        source,
    })
}

/// Disables the port and frees its buffers once the component returned
/// them all.
pub fn tear_down(port: &Port, timeouts: &TimeoutConfig) -> Result<(), PipelineError> {
    debug!("Tearing down {} port", port.index());
    if port.is_enabled() {
        step(port, port.set_enabled(false))?;
    }
    step(port, port.wait_buffers_released(timeouts.buffers_released()))?;
    step(port, port.deallocate_buffers())?;
    step(port, port.wait_enabled(timeouts.port_disable()))
}

/// Re-enables the port and acknowledges the settings change. Buffers are
/// allocated from the current definition unless caller memory is given.
pub fn rebuild(
    port: &Port,
    timeouts: &TimeoutConfig,
    memory: Option<Vec<BufferMemory>>,
) -> Result<(), PipelineError> {
    debug!("Rebuilding {} port", port.index());
    step(port, port.set_enabled(true))?;
    match memory {
        Some(memory) => step(port, port.use_buffers(memory))?,
        None => step(port, port.allocate_buffers())?,
    }
    step(port, port.wait_enabled(timeouts.port_enable()))?;
    step(port, port.populate())?;
    port.mark_reconfigured();
    debug!("{} port reconfigured", port.index());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::omx::{Acquire, Component, ComponentState, PortIndex, testing::ManualCodec};

    fn executing() -> (Component, Arc<ManualCodec>) {
        let codec = Arc::new(ManualCodec::new());
        let component = Component::new(codec.clone());
        component.set_state(ComponentState::Idle).unwrap();
        component.input().allocate_buffers().unwrap();
        component.output().allocate_buffers().unwrap();
        component.wait_state(Duration::from_secs(2)).unwrap();
        component.set_state(ComponentState::Executing).unwrap();
        (component, codec)
    }

    #[test]
    fn output_reconfiguration_picks_up_new_size() {
        let (component, codec) = executing();
        let output = component.output();
        let mut def = output.definition();
        def.buffer_size = 4096;
        codec.events().port_settings_changed(PortIndex::Output, def);
        assert!(matches!(output.acquire(), Acquire::Reconfigure));

        let timeouts = TimeoutConfig::default();
        tear_down(output, &timeouts).unwrap();
        assert_eq!(output.stats().allocated, 0);
        rebuild(output, &timeouts, None).unwrap();

        let stats = output.stats();
        assert_eq!(stats.with_component, stats.allocated);
        assert_eq!(codec.held(PortIndex::Output), stats.allocated);

        codec.complete(PortIndex::Output);
        let Acquire::Buffer(buf) = output.acquire() else {
            panic!("expected a buffer");
        };
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn withheld_buffers_fail_the_tear_down() {
        let (component, codec) = executing();
        codec.withhold(true);
        let timeouts = TimeoutConfig {
            buffers_released_ms: 30,
            ..Default::default()
        };
        let err = tear_down(component.output(), &timeouts).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Reconfigure {
                port: PortIndex::Output,
                source: ComponentError::Timeout { .. },
            }
        ));
    }
}
