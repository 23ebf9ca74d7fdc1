//! Copying raw frames into input buffers.

use tracing::{error, trace};

use crate::{
    common::errors::PipelineError,
    configs::InputMode,
    encoder::{
        format::{PixelFormat, VideoFormat},
        frame::FramePayload,
    },
    omx::{BufferDescriptor, PortDefinition},
};

/// Fills `buf` with `payload` according to the input mode.
///
/// When the payload size matches the buffer it is taken as already being in
/// the component's layout: copied in default mode, referenced in zero-copy
/// mode. Otherwise planes are copied row by row into the component's stride
/// and slice height.
pub fn fill_buffer(
    mode: InputMode,
    format: &VideoFormat,
    definition: &PortDefinition,
    payload: &FramePayload,
    buf: &mut BufferDescriptor,
) -> Result<(), PipelineError> {
    if definition.video.width != format.width || definition.video.height != format.height {
        error!("Width or height do not match");
        return Err(PipelineError::BufferSize(format!(
            "port is {}x{}, frame is {}x{}",
            definition.video.width, definition.video.height, format.width, format.height
        )));
    }

    let data = match (payload, mode) {
        (FramePayload::Imported(handle), InputMode::Import) => {
            if buf.import_handle() != Some(*handle) {
                return Err(PipelineError::BufferSize(format!(
                    "buffer is not bound to handle {handle}"
                )));
            }
            buf.filled_len = buf.free_space();
            return Ok(());
        }
        (FramePayload::Imported(handle), _) => {
            return Err(PipelineError::UnsupportedFormat(format!(
                "imported handle {handle} outside import mode"
            )));
        }
        (FramePayload::Bytes(_), InputMode::Import) => {
            return Err(PipelineError::UnsupportedFormat(
                "import mode takes imported handles only".into(),
            ));
        }
        (FramePayload::Bytes(data), _) => data,
    };

    if data.len() == buf.free_space() {
        trace!("Input layout matches the port, taking {} bytes as is", data.len());
        return match mode {
            InputMode::ZeroCopy if buf.borrow_payload(data.clone()) => Ok(()),
            _ if buf.write_payload(data) == data.len() => Ok(()),
            _ => Err(PipelineError::BufferSize(
                "buffer memory cannot hold the payload".into(),
            )),
        };
    }

    if mode == InputMode::ZeroCopy {
        return Err(PipelineError::BufferSize(format!(
            "zero-copy input needs {} bytes in the component layout, got {}",
            buf.free_space(),
            data.len()
        )));
    }

    copy_planes(format, definition, data, buf)
}

fn copy_planes(
    format: &VideoFormat,
    definition: &PortDefinition,
    data: &[u8],
    buf: &mut BufferDescriptor,
) -> Result<(), PipelineError> {
    let layout = format.default_layout().ok_or_else(|| {
        PipelineError::UnsupportedFormat(format!("{:?}", format.pixel_format))
    })?;
    if data.len() < layout.size {
        error!("Invalid input buffer size");
        return Err(PipelineError::BufferSize(format!(
            "frame holds {} bytes, layout needs {}",
            data.len(),
            layout.size
        )));
    }

    let video = &definition.video;
    let stride = if video.stride > 0 {
        video.stride as usize
    } else {
        layout.planes[0].stride
    };
    let slice_height = video.slice_height.max(video.height) as usize;
    let base = buf.offset;
    let capacity = buf.capacity();
    let Some(dest) = buf.as_mut_slice() else {
        return Err(PipelineError::BufferSize(
            "input buffer memory is not writable".into(),
        ));
    };

    let mut filled = 0;
    for (index, plane) in layout.planes.iter().enumerate() {
        let (dest_stride, dest_offset) = match (format.pixel_format, index) {
            (_, 0) => (stride, 0),
            (PixelFormat::I420, 1) => (stride / 2, stride * slice_height),
            (PixelFormat::I420, _) => (
                stride / 2,
                stride * slice_height + (stride / 2) * (slice_height / 2),
            ),
            _ => (stride, stride * slice_height),
        };
        let dest_offset = base + dest_offset;

        if plane.row_bytes > dest_stride || dest_offset + dest_stride * plane.rows > capacity {
            error!("Invalid output buffer size");
            return Err(PipelineError::BufferSize(format!(
                "plane {index} does not fit the input buffer"
            )));
        }

        for row in 0..plane.rows {
            let src = plane.offset + row * plane.stride;
            let dst = dest_offset + row * dest_stride;
            dest[dst..dst + plane.row_bytes].copy_from_slice(&data[src..src + plane.row_bytes]);
        }
        filled = dest_offset - base + dest_stride * plane.rows;
    }

    buf.filled_len = filled;
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::{
        encoder::format::{FormatSettings, input_port_definition},
        omx::{BufferMemory, ImportHandle, PortIndex},
    };

    fn port_for(format: &VideoFormat, stride_alignment: Option<u32>) -> PortDefinition {
        let settings = FormatSettings {
            stride_alignment,
            ..Default::default()
        };
        input_port_definition(&PortDefinition::new(PortIndex::Input), format, &settings).unwrap()
    }

    fn allocated(size: usize) -> BufferDescriptor {
        BufferDescriptor::new(0, PortIndex::Input, 1, BufferMemory::Allocated(BytesMut::zeroed(size)))
    }

    /// Frame whose every byte encodes its plane and row.
    fn i420_frame(format: &VideoFormat) -> Bytes {
        let layout = format.default_layout().unwrap();
        let mut data = vec![0u8; layout.size];
        for (p, plane) in layout.planes.iter().enumerate() {
            for row in 0..plane.rows {
                let start = plane.offset + row * plane.stride;
                data[start..start + plane.row_bytes].fill((p as u8) << 4 | row as u8);
            }
        }
        Bytes::from(data)
    }

    #[test]
    fn strided_copy_places_planes() {
        let format = VideoFormat::new(PixelFormat::I420, 6, 4);
        let def = port_for(&format, Some(16));
        let mut buf = allocated(def.buffer_size);
        let payload = FramePayload::Bytes(i420_frame(&format));

        fill_buffer(InputMode::Default, &format, &def, &payload, &mut buf).unwrap();

        let mem = buf.as_mut_slice().unwrap();
        // Luma rows at stride 16.
        assert_eq!(&mem[16..22], &[0x01; 6]);
        assert_eq!(mem[22], 0);
        // U plane after 4 luma rows, stride 8.
        assert_eq!(&mem[64..67], &[0x10; 3]);
        assert_eq!(&mem[72..75], &[0x11; 3]);
        // V plane after 2 U rows.
        assert_eq!(&mem[80..83], &[0x20; 3]);
        assert_eq!(buf.filled_len, 96);
    }

    #[test]
    fn matching_size_is_copied_verbatim() {
        let format = VideoFormat::new(PixelFormat::Nv12, 8, 2);
        let def = port_for(&format, None);
        let mut buf = allocated(def.buffer_size);
        let data = Bytes::from(vec![7u8; def.buffer_size]);

        fill_buffer(InputMode::Default, &format, &def, &FramePayload::Bytes(data), &mut buf).unwrap();
        assert_eq!(buf.filled_len, def.buffer_size);
        assert!(buf.data().iter().all(|b| *b == 7));
    }

    #[test]
    fn zero_copy_borrows_matching_payload() {
        let format = VideoFormat::new(PixelFormat::Nv12, 8, 2);
        let def = port_for(&format, None);
        let mut buf = BufferDescriptor::new(
            0,
            PortIndex::Input,
            1,
            BufferMemory::Borrowed { data: Bytes::new(), capacity: def.buffer_size },
        );
        let data = Bytes::from(vec![1u8; def.buffer_size]);

        fill_buffer(InputMode::ZeroCopy, &format, &def, &FramePayload::Bytes(data.clone()), &mut buf)
            .unwrap();
        assert_eq!(buf.payload(), data);

        let short = FramePayload::Bytes(data.slice(..4));
        let err = fill_buffer(InputMode::ZeroCopy, &format, &def, &short, &mut buf).unwrap_err();
        assert!(matches!(err, PipelineError::BufferSize(_)));
    }

    #[test]
    fn short_frame_is_a_size_error() {
        let format = VideoFormat::new(PixelFormat::I420, 16, 16);
        let def = port_for(&format, Some(32));
        let mut buf = allocated(def.buffer_size);
        let payload = FramePayload::Bytes(Bytes::from_static(&[0u8; 10]));

        let err = fill_buffer(InputMode::Default, &format, &def, &payload, &mut buf).unwrap_err();
        assert!(matches!(err, PipelineError::BufferSize(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn dimension_mismatch_is_refused() {
        let format = VideoFormat::new(PixelFormat::I420, 16, 16);
        let def = port_for(&VideoFormat::new(PixelFormat::I420, 32, 16), None);
        let mut buf = allocated(def.buffer_size);
        let payload = FramePayload::Bytes(i420_frame(&format));
        assert!(fill_buffer(InputMode::Default, &format, &def, &payload, &mut buf).is_err());
    }

    #[test]
    fn imported_handle_must_match_binding() {
        let format = VideoFormat::new(PixelFormat::Nv12, 8, 2);
        let def = port_for(&format, None);
        let mut buf = BufferDescriptor::new(
            0,
            PortIndex::Input,
            1,
            BufferMemory::Imported { handle: ImportHandle(3), capacity: def.buffer_size },
        );
        fill_buffer(InputMode::Import, &format, &def, &FramePayload::Imported(ImportHandle(3)), &mut buf)
            .unwrap();
        assert_eq!(buf.filled_len, def.buffer_size);
        assert!(
            fill_buffer(InputMode::Import, &format, &def, &FramePayload::Imported(ImportHandle(4)), &mut buf)
                .is_err()
        );
    }
}
