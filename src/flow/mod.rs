//! Flow reconstruction
//!
//! A flow is one direction of one captured TCP connection: its accumulated
//! unread bytes plus the framing decoder state. Flows are keyed by the
//! stream index and both endpoints, so the two directions of a connection
//! reconstruct independently.

mod demux;

pub use demux::{DemuxStats, FrameReader};

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use tracing::info;

use crate::capture::Fragment;
use crate::framing::{FlowState, FramingDecoder};

/// Composite flow identity: stream index plus the full endpoint 4-tuple.
///
/// Each fragment declares its own direction, so the key is reconstructed
/// per fragment rather than normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub tcp_stream: u32,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn from_fragment(fragment: &Fragment) -> Self {
        Self {
            tcp_stream: fragment.tcp_stream,
            src_ip: fragment.src_ip,
            src_port: fragment.src_port,
            dst_ip: fragment.dst_ip,
            dst_port: fragment.dst_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}:{} -> {}:{}",
            self.tcp_stream, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// One decoded application payload with the flow metadata it inherited.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    /// Capture timestamp of the fragment that completed the frame
    pub timestamp: f64,
    /// Header + payload bytes this frame consumed from the stream
    pub tcp_length: usize,
    pub tcp_stream: u32,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    /// Application payload bytes
    #[serde(serialize_with = "crate::capture::hex_bytes")]
    pub message: Vec<u8>,
}

/// Mutable reconstruction state for one flow.
pub struct Flow {
    key: FlowKey,
    /// Timestamp of the most recent fragment, attached to extracted frames
    frame_time: f64,
    decoder: FramingDecoder,
}

impl Flow {
    /// Create the flow from its first-seen fragment. The fragment's bytes
    /// are appended immediately.
    pub fn new(fragment: &Fragment, force: bool, max_frame_len: u64) -> Self {
        let mut flow = Self {
            key: FlowKey::from_fragment(fragment),
            frame_time: fragment.frame_time,
            decoder: FramingDecoder::new(force, max_frame_len),
        };
        flow.decoder.append(&fragment.data);
        flow
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn state(&self) -> FlowState {
        self.decoder.state()
    }

    /// Append a later fragment's bytes. Errored flows ignore new data.
    pub fn append(&mut self, fragment: &Fragment) {
        debug_assert_eq!(self.key, FlowKey::from_fragment(fragment));
        self.frame_time = fragment.frame_time;
        self.decoder.append(&fragment.data);
    }

    /// Extract the next frame if one is fully buffered.
    pub fn read(&mut self) -> Option<Frame> {
        let before = self.decoder.state();
        let extracted = self.decoder.read();
        let after = self.decoder.state();

        if before == FlowState::Unknown && after != before {
            match after {
                FlowState::Valid if self.decoder.forced_validation() => {
                    info!("forcing as zmq stream {}", self.key);
                }
                FlowState::Error => {
                    info!("skipping non-zmq stream {}", self.key);
                }
                _ => {}
            }
        } else if before == FlowState::Valid && after == FlowState::Error {
            info!("dropping corrupt zmq stream {}", self.key);
        }

        extracted.map(|frame| Frame {
            timestamp: self.frame_time,
            tcp_length: frame.wire_len,
            tcp_stream: self.key.tcp_stream,
            src_ip: self.key.src_ip,
            src_port: self.key.src_port,
            dst_ip: self.key.dst_ip,
            dst_port: self.key.dst_port,
            message: frame.payload,
        })
    }
}
