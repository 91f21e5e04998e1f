//! Packet capture reading
//!
//! Turns a PCAP file into a flat sequence of TCP payload fragments, the
//! input of the flow demultiplexer. Fragments from different connections
//! arrive chronologically interleaved, exactly as recorded on the wire.

mod pcap;
mod stream_table;

pub use pcap::PcapFragmentSource;
pub use stream_table::StreamTable;

use std::net::IpAddr;

use serde::Serialize;

/// One observed unit of TCP payload, as captured off the wire.
///
/// Identifies the owning flow (stream id plus both endpoints), carries the
/// capture timestamp and the raw payload bytes. Consumed immediately by the
/// demultiplexer.
#[derive(Debug, Clone, Serialize)]
pub struct Fragment {
    /// Capture timestamp, epoch seconds
    pub frame_time: f64,
    /// tshark-style TCP stream index, shared by both directions
    pub tcp_stream: u32,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    /// TCP segment payload
    #[serde(serialize_with = "hex_bytes")]
    pub data: Vec<u8>,
}

pub(crate) fn hex_bytes<S: serde::Serializer>(
    data: &[u8],
    ser: S,
) -> std::result::Result<S::Ok, S::Error> {
    ser.serialize_str(&hex::encode(data))
}

/// Trait for fragment sources
///
/// Pull-based: `read` returns the next fragment in capture order, or `None`
/// once the source is exhausted.
pub trait FragmentSource {
    fn read(&mut self) -> crate::error::Result<Option<Fragment>>;
}

/// In-memory fragment source, for tests and callers that already hold
/// decoded fragments.
pub struct VecFragmentSource {
    fragments: std::vec::IntoIter<Fragment>,
}

impl VecFragmentSource {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self { fragments: fragments.into_iter() }
    }
}

impl FragmentSource for VecFragmentSource {
    fn read(&mut self) -> crate::error::Result<Option<Fragment>> {
        Ok(self.fragments.next())
    }
}

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// PCAP records read
    pub records: u64,
    /// TCP segments with payload emitted as fragments
    pub fragments: u64,
    /// Packets skipped (non-IP, non-TCP, empty payload)
    pub skipped: u64,
    /// Packets that failed to parse
    pub malformed: u64,
}
