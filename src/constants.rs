//! Default configuration constants for the transcription relay
//!
//! These constants provide sensible defaults for timeouts, polling
//! intervals, and queue tuning. `Config` (see `config.rs`) may override the
//! ones that are meant to be tunable per deployment.

/// Upstream provider configuration frame fields (fixed by the wire contract,
/// never negotiated per-session).
pub struct UpstreamAudio {
    pub format: &'static str,
    pub sample_rate: u32,
    pub num_channels: u32,
    pub model: &'static str,
}

/// Default upstream audio contract
pub const DEFAULT_UPSTREAM_AUDIO: UpstreamAudio = UpstreamAudio {
    format: "pcm_s16le",
    sample_rate: 16_000,
    num_channels: 1,
    model: "stt-rt-v3",
};

/// Default timeout values for different operation types (in milliseconds)
pub struct Timeouts {
    /// Upstream WebSocket connection establishment timeout
    pub upstream_connect_ms: u64,
    /// Upstream WebSocket graceful close timeout
    pub upstream_close_ms: u64,
}

/// Default timeout configuration
pub const DEFAULT_TIMEOUTS: Timeouts = Timeouts {
    upstream_connect_ms: 10_000,
    upstream_close_ms: 5_000,
};

/// Session Gateway timer configuration
pub struct SessionTimers {
    pub periodic_save_ms: u64,
}

/// Default session timer configuration
pub const DEFAULT_SESSION_TIMERS: SessionTimers = SessionTimers {
    periodic_save_ms: 60_000,
};

/// Durable Write Queue (C5) tuning
pub struct WriteQueueDefaults {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
    pub dispatch_poll_ms: u64,
    /// Priority of a finalization (disconnect) write; must always outrank periodic writes.
    pub priority_final: i32,
    /// Priority of a periodic IN_PROGRESS checkpoint write.
    pub priority_periodic: i32,
}

/// Default write-queue configuration
pub const DEFAULT_WRITE_QUEUE: WriteQueueDefaults = WriteQueueDefaults {
    max_concurrency: 3,
    max_retries: 3,
    retry_base_backoff_ms: 1_000,
    dispatch_poll_ms: 100,
    priority_final: 10,
    priority_periodic: 1,
};
