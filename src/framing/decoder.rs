//! Per-flow framing decoder state machine
//!
//! Every flow runs one `FramingDecoder` over its accumulating byte buffer.
//! The machine has three states: `Unknown` until the greeting is validated,
//! `Valid` while frames are extracted, and terminal `Error`. Header and
//! payload consumption is all-or-nothing: no byte leaves the buffer unless
//! the entire frame it belongs to is available, so a partial read leaves the
//! buffer untouched for the next attempt.

use tracing::{debug, info, warn};

use super::{greeting_matches, FLAG_COMMAND, FLAG_LONG, GREETING_LEN, LARGE_PAYLOAD};

/// Flow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Greeting not yet validated
    Unknown,
    /// Greeting validated (or forced), extracting frames
    Valid,
    /// Terminal: validation failed or an implausible length was declared
    Error,
}

/// One extracted application payload plus the wire bytes it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBytes {
    /// Application payload (header stripped)
    pub payload: Vec<u8>,
    /// Header + payload bytes consumed from the stream
    pub wire_len: usize,
}

/// Growing byte buffer with a read cursor.
///
/// Consumption advances the cursor; the backing store is compacted only
/// when the dead prefix dominates, keeping extraction linear over the life
/// of a flow.
#[derive(Debug, Default)]
struct ByteWindow {
    buf: Vec<u8>,
    start: usize,
}

impl ByteWindow {
    fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n;
        if self.start >= 4096 && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
    }
}

/// Per-flow framing decoder.
pub struct FramingDecoder {
    state: FlowState,
    window: ByteWindow,
    /// Treat the flow as valid even if the greeting is absent
    force: bool,
    /// Set when validity came from forcing rather than the greeting
    forced_validation: bool,
    /// Large-payload log suppression: armed again after each complete frame
    warn_large: bool,
    /// Declared lengths above this are treated as corruption
    max_frame_len: u64,
}

impl FramingDecoder {
    pub fn new(force: bool, max_frame_len: u64) -> Self {
        Self {
            state: FlowState::Unknown,
            window: ByteWindow::default(),
            force,
            forced_validation: false,
            warn_large: true,
            max_frame_len,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Whether the flow passed validation via the port allow-list instead of
    /// an observed greeting.
    pub fn forced_validation(&self) -> bool {
        self.forced_validation
    }

    /// Unread bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    /// Append newly captured stream bytes. Ignored once the flow is in the
    /// terminal error state.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.state == FlowState::Error {
            return;
        }
        self.window.extend(bytes);
    }

    /// Extract the next application payload, if a complete frame is
    /// buffered.
    ///
    /// Returns at most one frame per call. `None` means more bytes are
    /// needed, or the flow is terminally errored; the buffer is left exactly
    /// as it was unless a complete frame (or the greeting) was consumed.
    pub fn read(&mut self) -> Option<FrameBytes> {
        match self.state {
            FlowState::Error => None,
            FlowState::Unknown => {
                if !self.validate_greeting() {
                    return None;
                }
                self.extract()
            }
            FlowState::Valid => self.extract(),
        }
    }

    /// Check the connection greeting once enough bytes are buffered.
    ///
    /// Returns true when the flow transitioned to `Valid`.
    fn validate_greeting(&mut self) -> bool {
        if self.window.len() < GREETING_LEN {
            return false;
        }

        let header = self.window.as_slice();
        if greeting_matches(header) {
            self.window.consume(GREETING_LEN);
            self.state = FlowState::Valid;
            true
        } else if self.force && header[0] & 0xfc == 0 {
            // The capture started mid-connection; the first buffered byte
            // already looks like a frame flag, so decode from byte 0.
            self.state = FlowState::Valid;
            self.forced_validation = true;
            true
        } else {
            debug!("greeting bytes: {}", hex::encode(&header[..GREETING_LEN]));
            self.window.clear();
            self.state = FlowState::Error;
            false
        }
    }

    /// Frame extraction loop for the `Valid` state.
    ///
    /// Command frames are consumed transparently and the loop continues to
    /// the next header within the same call.
    fn extract(&mut self) -> Option<FrameBytes> {
        loop {
            let avail = self.window.len();
            if avail < 1 {
                return None;
            }
            let header = self.window.as_slice();
            let flags = header[0];

            let (length, start) = if flags & FLAG_LONG == 0 {
                if avail < 2 {
                    return None;
                }
                (header[1] as u64, 2usize)
            } else {
                if avail < 9 {
                    return None;
                }
                (u64::from_be_bytes(header[1..9].try_into().unwrap()), 9usize)
            };

            if length > self.max_frame_len {
                warn!(
                    "declared frame length {} exceeds the plausible maximum {}, dropping flow",
                    length, self.max_frame_len
                );
                self.window.clear();
                self.state = FlowState::Error;
                return None;
            }

            if length > LARGE_PAYLOAD && self.warn_large {
                info!("large payload of size {}", length);
                self.warn_large = false;
            }

            let wire_len = start + length as usize;
            if avail < wire_len {
                return None;
            }

            self.warn_large = true;
            if flags & FLAG_COMMAND != 0 {
                self.window.consume(wire_len);
                continue;
            }

            let payload = self.window.as_slice()[start..wire_len].to_vec();
            self.window.consume(wire_len);
            return Some(FrameBytes { payload, wire_len });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::test_greeting;

    const NO_CAP: u64 = u64::MAX;

    fn short_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x00, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame
    }

    fn long_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![FLAG_LONG];
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn command_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![FLAG_COMMAND, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame
    }

    fn valid_decoder() -> FramingDecoder {
        let mut decoder = FramingDecoder::new(false, NO_CAP);
        decoder.append(&test_greeting());
        assert!(decoder.read().is_none());
        assert_eq!(decoder.state(), FlowState::Valid);
        decoder
    }

    #[test]
    fn test_waits_below_greeting_minimum() {
        let mut decoder = FramingDecoder::new(false, NO_CAP);
        decoder.append(&test_greeting()[..GREETING_LEN - 1]);
        assert!(decoder.read().is_none());
        assert_eq!(decoder.state(), FlowState::Unknown);
    }

    #[test]
    fn test_greeting_transitions_to_valid() {
        let mut decoder = FramingDecoder::new(false, NO_CAP);
        decoder.append(&test_greeting());
        assert!(decoder.read().is_none());
        assert_eq!(decoder.state(), FlowState::Valid);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_bad_greeting_is_terminal() {
        let mut decoder = FramingDecoder::new(false, NO_CAP);
        decoder.append(&[0u8; GREETING_LEN]);
        assert!(decoder.read().is_none());
        assert_eq!(decoder.state(), FlowState::Error);

        // Well-formed frames appended afterwards must never surface
        decoder.append(&short_frame(b"late"));
        assert!(decoder.read().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_greeting_and_frame_in_one_call() {
        let mut decoder = FramingDecoder::new(false, NO_CAP);
        let mut bytes = test_greeting();
        bytes.extend_from_slice(&short_frame(b"first"));
        decoder.append(&bytes);

        let frame = decoder.read().unwrap();
        assert_eq!(frame.payload, b"first");
        assert_eq!(frame.wire_len, 2 + 5);
    }

    #[test]
    fn test_short_frame_lengths() {
        let mut decoder = valid_decoder();
        decoder.append(&short_frame(&[0xab; 10]));

        let frame = decoder.read().unwrap();
        assert_eq!(frame.payload.len(), 10);
        assert_eq!(frame.wire_len, 12);
    }

    #[test]
    fn test_long_frame_lengths() {
        let mut decoder = valid_decoder();
        decoder.append(&long_frame(&vec![0xcd; 100_000]));

        let frame = decoder.read().unwrap();
        assert_eq!(frame.payload.len(), 100_000);
        assert_eq!(frame.wire_len, 9 + 100_000);
    }

    #[test]
    fn test_one_frame_per_read() {
        let mut decoder = valid_decoder();
        decoder.append(&short_frame(b"one"));
        decoder.append(&short_frame(b"two"));

        assert_eq!(decoder.read().unwrap().payload, b"one");
        assert_eq!(decoder.read().unwrap().payload, b"two");
        assert!(decoder.read().is_none());
    }

    #[test]
    fn test_byte_by_byte_feed_yields_single_frame() {
        let mut decoder = valid_decoder();
        let frame = long_frame(b"split across many fragments");

        let mut produced = Vec::new();
        for &byte in &frame {
            decoder.append(&[byte]);
            if let Some(frame) = decoder.read() {
                produced.push(frame);
            }
        }

        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].payload, b"split across many fragments");
    }

    #[test]
    fn test_partial_header_consumes_nothing() {
        let mut decoder = valid_decoder();
        // Long-form flag plus half of the length field
        decoder.append(&[FLAG_LONG, 0, 0, 0]);
        assert!(decoder.read().is_none());
        assert_eq!(decoder.buffered(), 4);

        decoder.append(&[0, 0, 0, 0, 3]);
        assert!(decoder.read().is_none());
        assert_eq!(decoder.buffered(), 9);

        decoder.append(b"abc");
        assert_eq!(decoder.read().unwrap().payload, b"abc");
    }

    #[test]
    fn test_command_frames_are_transparent() {
        let mut decoder = valid_decoder();
        let mut bytes = short_frame(b"app1");
        bytes.extend_from_slice(&command_frame(b"\x04PING"));
        bytes.extend_from_slice(&short_frame(b"app2"));
        decoder.append(&bytes);

        assert_eq!(decoder.read().unwrap().payload, b"app1");
        // Command frame is skipped within this same call
        assert_eq!(decoder.read().unwrap().payload, b"app2");
        assert!(decoder.read().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_trailing_command_frame_produces_nothing() {
        let mut decoder = valid_decoder();
        decoder.append(&command_frame(b"\x04PONG"));
        assert!(decoder.read().is_none());
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.state(), FlowState::Valid);
    }

    #[test]
    fn test_forced_flow_decodes_from_byte_zero() {
        let mut decoder = FramingDecoder::new(true, NO_CAP);
        let mut bytes = short_frame(b"lost the greeting");
        // Pad to reach the greeting minimum before validation kicks in
        while bytes.len() < GREETING_LEN {
            bytes.extend_from_slice(&short_frame(b"filler"));
        }
        decoder.append(&bytes);

        let frame = decoder.read().unwrap();
        assert_eq!(frame.payload, b"lost the greeting");
        assert!(decoder.forced_validation());
    }

    #[test]
    fn test_forcing_requires_plausible_flag_byte() {
        let mut decoder = FramingDecoder::new(true, NO_CAP);
        let mut bytes = vec![0xf0u8];
        bytes.resize(GREETING_LEN, 0);
        decoder.append(&bytes);

        assert!(decoder.read().is_none());
        assert_eq!(decoder.state(), FlowState::Error);
    }

    #[test]
    fn test_force_does_not_shadow_real_greeting() {
        let mut decoder = FramingDecoder::new(true, NO_CAP);
        let mut bytes = test_greeting();
        bytes.extend_from_slice(&short_frame(b"payload"));
        decoder.append(&bytes);

        let frame = decoder.read().unwrap();
        assert_eq!(frame.payload, b"payload");
        assert!(!decoder.forced_validation());
    }

    #[test]
    fn test_implausible_length_drops_flow() {
        let mut decoder = FramingDecoder::new(false, 1024);
        decoder.append(&test_greeting());
        assert!(decoder.read().is_none());

        let mut frame = vec![FLAG_LONG];
        frame.extend_from_slice(&(1u64 << 40).to_be_bytes());
        decoder.append(&frame);

        assert!(decoder.read().is_none());
        assert_eq!(decoder.state(), FlowState::Error);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_window_compaction_preserves_stream_position() {
        let mut decoder = valid_decoder();
        // Push enough small frames through to trigger compaction repeatedly
        for i in 0..4096u32 {
            decoder.append(&short_frame(&i.to_be_bytes()));
        }
        for i in 0..4096u32 {
            let frame = decoder.read().unwrap();
            assert_eq!(frame.payload, i.to_be_bytes());
        }
        assert!(decoder.read().is_none());
    }
}
