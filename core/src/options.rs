//! Build-time options
//!
//! Defaults match the reference board configuration. Runtime policy that a
//! client may tune per instance lives in [`crate::tls::ClientOptions`].

/// Scheduler tick frequency in Hz.
pub const TICK_FREQUENCY: u32 = 1024;

/// Size of one memory pool segment in bytes.
pub const MEMPOOL_SEGMENT_SIZE: usize = 64;

/// Number of segments in the default memory pool.
pub const MEMPOOL_SEGMENT_COUNT: usize = 64;

/// Number of buffers a [`crate::streams::BufferQueue`] can hold.
pub const BUFFER_QUEUE_DEPTH: usize = 16;

/// Largest cleartext slice handed to the TLS session in one write.
pub const MAX_TX_RECORD_SIZE: usize = 1280;

/// Growth step of the cleartext RX buffer per session read.
pub const RX_CHUNK_SIZE: usize = 256;

/// Cleartext bytes collected per worker wakeup before yielding.
pub const RX_BUFFER_SOFT_LIMIT: usize = 2048;

/// Size of a persisted DER certificate record.
pub const MAX_DER_CERT_SIZE: usize = 1024;

/// Scratch size for PEM to DER conversion.
pub const MAX_PEM_CERT_SIZE: usize = 1536;

const _: () = assert!(MAX_PEM_CERT_SIZE > MAX_DER_CERT_SIZE);
const _: () = assert!(RX_CHUNK_SIZE <= RX_BUFFER_SOFT_LIMIT);
