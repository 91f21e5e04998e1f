//! ZMTP 3.x framing
//!
//! The collaboration protocol rides on ZeroMQ over TCP. On the wire each
//! direction of a connection starts with a 64-byte greeting, followed by a
//! sequence of length-prefixed frames:
//!
//! - 1 flag byte; bit 0x02 selects the long form, bit 0x04 marks a command
//!   frame whose payload is protocol control data
//! - 1-byte length (short form) or 8-byte big-endian length (long form)
//! - exactly `length` payload bytes
//!
//! Only the greeting for protocol version 3 with the NULL security
//! mechanism is accepted. This module decodes; it never encodes.

mod decoder;

pub use decoder::{FlowState, FramingDecoder, FrameBytes};

/// Long-form length encoding
pub const FLAG_LONG: u8 = 0x02;
/// Command frame, consumed without being surfaced
pub const FLAG_COMMAND: u8 = 0x04;

/// Greeting size every direction must send before frames
pub const GREETING_LEN: usize = 0x40;

/// Payload sizes above this are logged once per occurrence
pub const LARGE_PAYLOAD: u64 = 65535;

/// Check the fixed part of the version-3 NULL-mechanism greeting.
///
/// Bytes 16..64 are padding and are not inspected.
pub(crate) fn greeting_matches(header: &[u8]) -> bool {
    debug_assert!(header.len() >= 16);
    header[0] == 0xff
        && u64::from_be_bytes(header[1..9].try_into().unwrap()) == 1
        && header[9] == 0x7f
        && header[10] == 3
        && header[11] == 0
        && &header[12..16] == b"NULL"
}

#[cfg(test)]
pub(crate) fn test_greeting() -> Vec<u8> {
    let mut greeting = vec![0u8; GREETING_LEN];
    greeting[0] = 0xff;
    greeting[8] = 1;
    greeting[9] = 0x7f;
    greeting[10] = 3;
    greeting[12..16].copy_from_slice(b"NULL");
    greeting
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_signature_accepts_reference_bytes() {
        assert!(greeting_matches(&test_greeting()));
    }

    #[test]
    fn test_greeting_signature_rejects_other_mechanisms() {
        let mut greeting = test_greeting();
        greeting[12..17].copy_from_slice(b"PLAIN");
        assert!(!greeting_matches(&greeting));
    }

    #[test]
    fn test_greeting_signature_rejects_version_2() {
        let mut greeting = test_greeting();
        greeting[10] = 2;
        assert!(!greeting_matches(&greeting));
    }

    #[test]
    fn test_greeting_padding_is_ignored() {
        let mut greeting = test_greeting();
        greeting[40] = 0xaa;
        assert!(greeting_matches(&greeting));
    }
}
