//! Applying configured rate control and quantization to the component.

use tracing::{debug, info, warn};

use crate::{
    common::errors::{ComponentError, PipelineError},
    configs::CodecParamsConfig,
    omx::{Component, ControlRate, Parameter},
};

/// Applies every configured parameter family with get-modify-set.
///
/// A component that does not know a family, or refuses the setting, only
/// earns a warning. Any other failure to set is fatal.
pub fn apply(component: &Component, config: &CodecParamsConfig) -> Result<(), PipelineError> {
    if config.has_bitrate() {
        apply_bitrate(component, config)?;
    }
    if config.has_quantization() {
        apply_quantization(component, config)?;
    }
    Ok(())
}

pub fn apply_bitrate(component: &Component, config: &CodecParamsConfig) -> Result<(), PipelineError> {
    let mut param = Parameter::Bitrate {
        control_rate: ControlRate::default(),
        target_bitrate: 0,
    };
    update(component, &mut param, |param| {
        if let Parameter::Bitrate {
            control_rate,
            target_bitrate,
        } = param
        {
            if let Some(rate) = config.control_rate {
                *control_rate = rate;
            }
            if let Some(target) = config.target_bitrate {
                *target_bitrate = target;
            }
        }
    })?;

    if let Parameter::Bitrate {
        control_rate,
        target_bitrate,
    } = param
    {
        if control_rate.needs_target() && target_bitrate == 0 {
            return Err(PipelineError::Parameter {
                name: param.name(),
                source: ComponentError::BadParameter(format!(
                    "control rate {control_rate:?} needs a target bitrate"
                )),
            });
        }
    }
    Ok(())
}

fn apply_quantization(component: &Component, config: &CodecParamsConfig) -> Result<(), PipelineError> {
    let mut param = Parameter::Quantization {
        qp_i: 0,
        qp_p: 0,
        qp_b: 0,
    };
    update(component, &mut param, |param| {
        if let Parameter::Quantization { qp_i, qp_p, qp_b } = param {
            for (slot, value) in [
                (qp_i, config.quant_i_frames),
                (qp_p, config.quant_p_frames),
                (qp_b, config.quant_b_frames),
            ] {
                if let Some(value) = value {
                    *slot = value;
                }
            }
        }
    })
}

fn update(
    component: &Component,
    param: &mut Parameter,
    modify: impl FnOnce(&mut Parameter),
) -> Result<(), PipelineError> {
    let name = param.name();
    match component.get_parameter(param) {
        Ok(()) => {
            debug!("Current {} parameters: {:?}", name, param);
        }
        Err(err) => {
            // Nothing to modify, the set below would clobber unknown defaults.
            warn!("Error getting {} parameters: {}", name, err);
            return Ok(());
        }
    }

    modify(param);

    match component.set_parameter(param) {
        Ok(()) => {
            info!("Applied {} parameters: {:?}", name, param);
            Ok(())
        }
        Err(ComponentError::UnsupportedIndex | ComponentError::UnsupportedSetting) => {
            warn!("Setting {} parameters not supported by the component", name);
            Ok(())
        }
        Err(source) => Err(PipelineError::Parameter { name, source }),
    }
}
