/// Process-wide constants for the ingest pipeline.
///
/// Runtime-tunable values (hosts, ports, URLs) live in `config`; everything
/// here is part of the wire contract and must not vary between deployments.

/// The single supported envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Item count bounds for a real ingest call (test mode allows 0..=MAX_ITEMS).
pub const MIN_ITEMS: usize = 1;
pub const MAX_ITEMS: usize = 100;

/// Maximum request body size, before and after decompression.
pub const MAX_BODY_SIZE: usize = 5 * 1024 * 1024; // 5 MiB

/// Serial number length bounds.
pub const SERIAL_MIN_LEN: usize = 16;
pub const SERIAL_MAX_LEN: usize = 24;

/// Maximum length of a client-supplied request id.
pub const CLIENT_REQUEST_ID_MAX_LEN: usize = 128;

/// Cap on per-item error descriptors reported in a response; anything past
/// this is still counted as rejected but not individually described.
pub const MAX_REPORTED_ERRORS: usize = 20;

// Broker stream coordinates. Fixed process-wide, not negotiated per call.
pub const DEFAULT_STREAM_KEY: &str = "ingest.v1";
pub const DEFAULT_CONSUMER_GROUP: &str = "ingest_workers";

/// Records claimed per consumer read.
pub const CONSUMER_READ_COUNT: usize = 10;

/// How long a consumer read blocks waiting for new records (ms).
pub const CONSUMER_BLOCK_MS: u64 = 5000;

/// Pause after a failed record before continuing the consumer loop (ms).
pub const CONSUMER_RETRY_PAUSE_MS: u64 = 1000;

/// Pause after a broker connection failure before retrying the loop (ms).
pub const CONSUMER_RECONNECT_PAUSE_MS: u64 = 5000;

/// Pause before the single retry of an item that hit a uniqueness race (ms).
pub const CONFLICT_RETRY_PAUSE_MS: u64 = 100;

/// Note echoed by the dry-run endpoint.
pub const DRY_RUN_NOTE: &str = "dry-run; nothing enqueued or persisted";
