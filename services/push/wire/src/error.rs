//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Remaining-length field needs more than four bytes
    #[error("malformed remaining length")]
    MalformedLength,

    /// Packet type tag outside the recognised set
    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),

    /// Declared remaining length disagrees with the bytes the variant consumed
    #[error("length mismatch: declared {declared}, consumed {consumed}")]
    LengthMismatch {
        /// Remaining length from the fixed header
        declared: usize,
        /// Bytes actually consumed by the variant decoder
        consumed: usize,
    },

    /// Frame body ended before a required field
    #[error("truncated frame")]
    Truncated,

    /// Quality-of-service level not supported by this client
    #[error("invalid qos {0}")]
    InvalidQos(u8),

    /// Acknowledgment requested for a publish without packet id
    #[error("publish carries no packet id")]
    MissingPacketId,

    /// String field is not valid UTF-8
    #[error("invalid utf-8 string")]
    InvalidUtf8,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Zlib payload could not be inflated
    #[error("payload decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    /// Zlib payload could not be deflated
    #[error("payload compression failed: {0}")]
    Compress(#[source] std::io::Error),
}
