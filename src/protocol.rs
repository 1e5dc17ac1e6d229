//! Shared wire constants for the TF protocol framed transport

/// Default header width for command frames: 4-byte signed big-endian.
pub const DFLT_HEADER_SIZE: usize = 4;

/// Default negotiated channel length proposed to the server.
pub const DFLT_MAX_BUFFER_SIZE: usize = 512 * 1024;

// Maximum declared frame length we will allocate for (64MB).
// A header claiming more than this is treated as a protocol violation
// instead of an allocation attempt.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Session key length interval in bytes; lengths outside are clamped to the
/// minimum by the handshake.
pub const KEY_LEN_INTERVAL: (usize, usize) = (16, 40);

// Control sentinels multiplexed into the 8-byte chunk-length header during
// bulk transfers. Positive values are chunk lengths; these are not.
pub mod sentinel {
    /// Normal end-of-stream.
    pub const END: i64 = 0;
    /// Pause the exchange.
    pub const STOP: i64 = -1;
    /// Abort the exchange.
    pub const CANCEL: i64 = -2;
    /// Resume after a checkpoint.
    pub const CONT: i64 = -3;
    /// Two-sided terminal handshake code.
    pub const FINISH: i64 = -127;
}

// Centralized timeout defaults for consistent behavior across the client
pub mod timeouts {
    use std::time::Duration;

    // DNS resolution deadline (s)
    pub const DNS_RESOLVE_SECS: u64 = 10;

    // TCP connect deadline per attempt (s)
    pub const CONNECT_SECS: u64 = 10;

    // Connect attempts before giving up
    pub const CONNECT_RETRIES: u32 = 3;

    // Socket read/write deadline; transfers can legitimately stall while the
    // server seeks, so this is generous
    pub const IO_SECS: u64 = 120;

    pub fn io() -> Duration {
        Duration::from_secs(IO_SECS)
    }
}
