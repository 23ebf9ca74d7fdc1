//! Buffer descriptors exchanged over component ports.
//!
//! A [`BufferDescriptor`] is move-only. Acquiring one from a port hands the
//! caller sole ownership, releasing it moves ownership back to the port and
//! from there to the codec. At no point do two parties hold the same
//! descriptor.

use std::fmt;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

use crate::omx::port::PortIndex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        const END_OF_STREAM = 1 << 0;
        const END_OF_FRAME = 1 << 4;
        const SYNC_POINT = 1 << 5;
        const CONFIG = 1 << 7;
    }
}

/// Opaque handle to externally owned memory, e.g. a dmabuf fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportHandle(pub i64);

impl fmt::Display for ImportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backing storage of a descriptor.
pub enum BufferMemory {
    /// Memory allocated by the port.
    Allocated(BytesMut),
    /// Caller memory referenced without copying. `capacity` is the size the
    /// port was configured with, the payload may be empty until filled.
    Borrowed { data: Bytes, capacity: usize },
    /// Externally owned memory known only by its handle.
    Imported { handle: ImportHandle, capacity: usize },
}

impl BufferMemory {
    pub fn capacity(&self) -> usize {
        match self {
            Self::Allocated(mem) => mem.len(),
            Self::Borrowed { capacity, .. } | Self::Imported { capacity, .. } => *capacity,
        }
    }
}

impl fmt::Debug for BufferMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocated(mem) => write!(f, "Allocated({} bytes)", mem.len()),
            Self::Borrowed { data, capacity } => {
                write!(f, "Borrowed({}/{} bytes)", data.len(), capacity)
            }
            Self::Imported { handle, capacity } => {
                write!(f, "Imported({handle}, {capacity} bytes)")
            }
        }
    }
}

#[derive(Debug)]
pub struct BufferDescriptor {
    id: u32,
    port: PortIndex,
    generation: u32,
    memory: BufferMemory,
    /// Number of valid payload bytes starting at `offset`.
    pub filled_len: usize,
    pub offset: usize,
    pub flags: BufferFlags,
    /// Presentation timestamp in component ticks.
    pub timestamp: i64,
    /// Duration in component ticks, zero when unknown.
    pub tick_count: u64,
}

impl BufferDescriptor {
    pub(crate) fn new(id: u32, port: PortIndex, generation: u32, memory: BufferMemory) -> Self {
        Self {
            id,
            port,
            generation,
            memory,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::empty(),
            timestamp: 0,
            tick_count: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn port(&self) -> PortIndex {
        self.port
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    pub fn memory(&self) -> &BufferMemory {
        &self.memory
    }

    pub fn capacity(&self) -> usize {
        self.memory.capacity()
    }

    /// Bytes writable past `offset`.
    pub fn free_space(&self) -> usize {
        self.capacity().saturating_sub(self.offset)
    }

    pub fn import_handle(&self) -> Option<ImportHandle> {
        match &self.memory {
            BufferMemory::Imported { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// The valid payload. Imported memory is not readable through the
    /// descriptor and yields an empty slice.
    pub fn data(&self) -> &[u8] {
        match &self.memory {
            BufferMemory::Allocated(mem) => {
                let end = (self.offset + self.filled_len).min(mem.len());
                &mem[self.offset.min(end)..end]
            }
            BufferMemory::Borrowed { data, .. } => {
                let end = self.filled_len.min(data.len());
                &data[..end]
            }
            BufferMemory::Imported { .. } => &[],
        }
    }

    /// Copies the valid payload out into a shareable buffer.
    pub fn payload(&self) -> Bytes {
        match &self.memory {
            BufferMemory::Borrowed { data, .. } => data.slice(..self.filled_len.min(data.len())),
            _ => Bytes::copy_from_slice(self.data()),
        }
    }

    /// Writable view of the whole allocation, `None` unless port-allocated.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.memory {
            BufferMemory::Allocated(mem) => Some(&mut mem[..]),
            _ => None,
        }
    }

    /// Copies `src` in at `offset`, truncating to the free space. Returns the
    /// number of bytes written.
    pub fn write_payload(&mut self, src: &[u8]) -> usize {
        let offset = self.offset;
        let Some(mem) = self.as_mut_slice() else {
            return 0;
        };
        let n = src.len().min(mem.len().saturating_sub(offset));
        mem[offset..offset + n].copy_from_slice(&src[..n]);
        self.filled_len = n;
        n
    }

    /// Points a borrowed descriptor at caller memory without copying.
    pub fn borrow_payload(&mut self, data: Bytes) -> bool {
        match &mut self.memory {
            BufferMemory::Borrowed { data: slot, .. } => {
                self.filled_len = data.len();
                *slot = data;
                true
            }
            _ => false,
        }
    }

    /// Clears payload metadata before the descriptor is handed out again.
    pub(crate) fn reset(&mut self) {
        self.filled_len = 0;
        self.offset = 0;
        self.flags = BufferFlags::empty();
        self.timestamp = 0;
        self.tick_count = 0;
        if let BufferMemory::Borrowed { data, .. } = &mut self.memory {
            *data = Bytes::new();
        }
    }
}
