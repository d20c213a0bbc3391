//! Error types for loadp2.

use std::io;
use thiserror::Error;

/// Result type for loadp2 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for loadp2 operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A protocol-critical wait expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No responsive target on any candidate port.
    #[error("Could not find a P2")]
    DeviceNotFound,

    /// The version banner was missing or malformed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The device sent something other than what the protocol allows here.
    #[error("Protocol error: expected {expected}, got {actual}")]
    Protocol {
        /// What the engine was waiting for.
        expected: String,
        /// What actually arrived.
        actual: String,
    },

    /// Device and host disagree on the transfer checksum.
    #[error(
        "Bad checksum: expected {expected:#04x}, got {actual:#04x} \
         (try increasing the FIFO size)"
    )]
    ChecksumMismatch {
        /// Low 8 bits of the locally accumulated sum.
        expected: u8,
        /// Value reconstructed from the device reply.
        actual: u8,
    },

    /// The device reported an error with a message.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// The device answered `'h'`: the block address needs the himem helper.
    #[error("Device requires the himem helper for address {address:#010x}")]
    HimemRequired {
        /// Target address of the rejected block.
        address: u32,
    },

    /// The built image exceeds what the loader can address.
    #[error("Image size {size} bytes is too large (limit {limit} bytes)")]
    ImageTooLarge {
        /// Computed image size.
        size: usize,
        /// Maximum accepted size.
        limit: usize,
    },

    /// ELF file is structurally broken.
    #[error("Invalid ELF file: {0}")]
    InvalidElf(String),

    /// Malformed multi-file specification.
    #[error("Invalid file chain: {0}")]
    InvalidChain(String),

    /// Program arguments do not fit the arguments block.
    #[error("Invalid program arguments: {0}")]
    InvalidArguments(String),

    /// Image length is not a whole number of 32-bit words.
    #[error("Image length {0} is not a multiple of 4")]
    Unaligned(usize),

    /// A script command failed.
    #[error("Script error in '{command}': {reason}")]
    Script {
        /// Command that failed.
        command: String,
        /// Failure description.
        reason: String,
    },

    /// The operator interrupted the run.
    #[error("Operation cancelled")]
    Cancelled,

    /// Unsupported operation for this target or platform.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a protocol error from the expected description and the raw bytes
    /// that arrived instead.
    pub fn protocol(expected: impl Into<String>, actual: &[u8]) -> Self {
        Self::Protocol {
            expected: expected.into(),
            actual: format!("{:?}", String::from_utf8_lossy(actual)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_mentions_fifo() {
        let err = Error::ChecksumMismatch {
            expected: 0x12,
            actual: 0x34,
        };
        let text = err.to_string();
        assert!(text.contains("0x12"));
        assert!(text.contains("0x34"));
        assert!(text.contains("FIFO"));
    }

    #[test]
    fn test_himem_message_does_not_assume_helper_state() {
        let text = Error::HimemRequired {
            address: 0x0100_0000,
        }
        .to_string();
        assert_eq!(text, "Device requires the himem helper for address 0x01000000");
    }

    #[test]
    fn test_protocol_error_shows_bytes() {
        let err = Error::protocol("\"@@\"", b"x@ ");
        assert_eq!(
            err.to_string(),
            "Protocol error: expected \"@@\", got \"x@ \""
        );
    }
}
