use std::time::Duration;

/// Component clock resolution: timestamps and durations are in microseconds.
pub const TICKS_PER_SECOND: u64 = 1_000_000;
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

// ── Default waits ────────────────────────────────────────────────────────────

pub const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);
pub const PORT_ENABLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const PORT_DISABLE_TIMEOUT: Duration = Duration::from_secs(1);
pub const BUFFERS_RELEASED_TIMEOUT: Duration = Duration::from_secs(5);
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Frame rate assumed for latency reporting when the input carries none.
pub const FALLBACK_FRAMERATE: u32 = 25;

/// Annex B start code prefixing in-band parameter sets.
pub const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Smallest buffer a port will allocate.
pub const MIN_PORT_BUFFER_SIZE: usize = 1024;
