//! Raw input formats, output caps and the input port geometry derived from
//! them.

use std::{fmt, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    common::errors::PipelineError,
    omx::{
        ColorFormat, PortDefinition,
        constants::{FALLBACK_FRAMERATE, NANOS_PER_SECOND},
        ticks,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    I420,
    Nv12,
    Yuy2,
    Rgba,
}

impl PixelFormat {
    /// The component color format, `None` when the component has no
    /// equivalent.
    pub fn color_format(self) -> Option<ColorFormat> {
        match self {
            Self::I420 => Some(ColorFormat::Yuv420Planar),
            Self::Nv12 => Some(ColorFormat::Yuv420SemiPlanar),
            Self::Yuy2 | Self::Rgba => None,
        }
    }
}

pub(crate) fn round_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

pub(crate) fn round_up_4(value: u32) -> u32 {
    round_up(value, 4)
}

/// One plane of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub stride: usize,
    /// Meaningful bytes per row.
    pub row_bytes: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub planes: Vec<Plane>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Frame rate numerator, 0 when unknown.
    pub fps_n: u32,
    pub fps_d: u32,
}

impl VideoFormat {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            fps_n: 0,
            fps_d: 1,
        }
    }

    pub fn with_framerate(mut self, fps_n: u32, fps_d: u32) -> Self {
        self.fps_n = fps_n;
        self.fps_d = fps_d.max(1);
        self
    }

    pub fn frame_duration(&self) -> Option<Duration> {
        if self.fps_n == 0 {
            return None;
        }
        Some(Duration::from_nanos(ticks::scale(
            NANOS_PER_SECOND,
            self.fps_d as u64,
            self.fps_n as u64,
        )))
    }

    /// Tightly packed layout with 4-byte aligned rows, the layout callers
    /// produce by default.
    pub fn default_layout(&self) -> Option<PlaneLayout> {
        let (w, h) = (self.width, self.height);
        let luma_stride = round_up_4(w) as usize;
        let luma_rows = round_up(h, 2) as usize;
        let chroma_rows = (round_up(h, 2) / 2) as usize;
        let luma = Plane {
            offset: 0,
            stride: luma_stride,
            row_bytes: w as usize,
            rows: h as usize,
        };

        let planes = match self.pixel_format {
            PixelFormat::I420 => {
                let chroma_stride = round_up_4(round_up(w, 2) / 2) as usize;
                let u_offset = luma_stride * luma_rows;
                let v_offset = u_offset + chroma_stride * chroma_rows;
                let chroma = |offset| Plane {
                    offset,
                    stride: chroma_stride,
                    row_bytes: w.div_ceil(2) as usize,
                    rows: chroma_rows,
                };
                vec![luma, chroma(u_offset), chroma(v_offset)]
            }
            PixelFormat::Nv12 => vec![
                luma,
                Plane {
                    offset: luma_stride * luma_rows,
                    stride: luma_stride,
                    row_bytes: round_up(w, 2) as usize,
                    rows: chroma_rows,
                },
            ],
            PixelFormat::Yuy2 | PixelFormat::Rgba => return None,
        };

        let size = planes
            .last()
            .map(|p| p.offset + p.stride * p.rows)
            .unwrap_or(0);
        Some(PlaneLayout { planes, size })
    }

    /// Reported latency for `frames` frames in flight.
    pub fn latency(&self, frames: u32) -> Duration {
        let (fps_n, fps_d) = if self.fps_n == 0 {
            (FALLBACK_FRAMERATE, 1)
        } else {
            (self.fps_n, self.fps_d.max(1))
        };
        Duration::from_nanos(ticks::scale_ceil(
            frames as u64,
            NANOS_PER_SECOND * fps_d as u64,
            fps_n as u64,
        ))
    }
}

/// Negotiation knobs that come from configuration.
#[derive(Debug, Clone, Default)]
pub struct FormatSettings {
    pub stride_alignment: Option<u32>,
    pub slice_height_alignment: Option<u32>,
    pub framerate_integer: bool,
}

/// Derives the input port definition for `format` from the component's
/// current one.
pub fn input_port_definition(
    base: &PortDefinition,
    format: &VideoFormat,
    settings: &FormatSettings,
) -> Result<PortDefinition, PipelineError> {
    let color_format = format.pixel_format.color_format().ok_or_else(|| {
        PipelineError::UnsupportedFormat(format!("{:?}", format.pixel_format))
    })?;
    if format.width == 0 || format.height == 0 {
        return Err(PipelineError::UnsupportedFormat(format!(
            "{}x{}",
            format.width, format.height
        )));
    }

    let mut def = base.clone();
    let video = &mut def.video;
    video.color_format = color_format;
    video.width = format.width;
    video.height = format.height;

    let alignment = match settings.stride_alignment {
        Some(align) => {
            def.buffer_alignment = align as usize;
            align
        }
        None => def.buffer_alignment as u32,
    };
    video.stride = if alignment > 0 {
        round_up(format.width, alignment)
    } else {
        round_up_4(format.width)
    };
    video.slice_height = match settings.slice_height_alignment {
        Some(align) => round_up(format.height, align),
        None => format.height,
    };

    let stride = video.stride as usize;
    let rows = video.slice_height as usize;
    def.buffer_size = match color_format {
        ColorFormat::Yuv420Planar => stride * rows + 2 * ((stride / 2) * rows.div_ceil(2)),
        ColorFormat::Yuv420SemiPlanar => stride * rows + stride * rows.div_ceil(2),
        ColorFormat::Unused => def.buffer_size,
    };

    video.framerate = if format.fps_n == 0 {
        0
    } else if settings.framerate_integer {
        format.fps_n / format.fps_d.max(1)
    } else {
        ((format.fps_n as u64) << 16).div_euclid(format.fps_d.max(1) as u64) as u32
    };

    Ok(def)
}

/// Description of the encoded output published downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    pub fps_n: u32,
    pub fps_d: u32,
    pub stream_format: Option<String>,
    pub alignment: Option<String>,
    pub codec_data: Option<Bytes>,
}

impl Caps {
    pub fn new(media_type: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            media_type: media_type.into(),
            width,
            height,
            fps_n: 0,
            fps_d: 1,
            stream_format: None,
            alignment: None,
            codec_data: None,
        }
    }

    pub fn with_framerate(mut self, fps_n: u32, fps_d: u32) -> Self {
        self.fps_n = fps_n;
        self.fps_d = fps_d;
        self
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, width={}, height={}, framerate={}/{}",
            self.media_type, self.width, self.height, self.fps_n, self.fps_d
        )?;
        if let Some(stream_format) = &self.stream_format {
            write!(f, ", stream-format={stream_format}")?;
        }
        if let Some(alignment) = &self.alignment {
            write!(f, ", alignment={alignment}")?;
        }
        if let Some(codec_data) = &self.codec_data {
            write!(f, ", codec_data=<{} bytes>", codec_data.len())?;
        }
        Ok(())
    }
}
