//! PCAP file fragment source
//!
//! Reads capture records with `pcap-file` and dissects them with
//! `etherparse`. Only TCP segments carrying payload become fragments;
//! everything else is counted and skipped. A parse failure never aborts the
//! read, the offending record is logged and dropped.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use tracing::{debug, warn};

use crate::error::{CilscopeError, Result};
use super::{CaptureStats, Fragment, FragmentSource, StreamTable};

/// Fragment source backed by a PCAP file.
pub struct PcapFragmentSource {
    reader: PcapReader<BufReader<File>>,
    datalink: DataLink,
    streams: StreamTable,
    stats: CaptureStats,
}

impl PcapFragmentSource {
    /// Open a PCAP file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| CilscopeError::PcapError(e.to_string()))?;
        let datalink = reader.header().datalink;

        match datalink {
            DataLink::ETHERNET | DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => {}
            other => {
                return Err(CilscopeError::UnsupportedLinkType(format!("{:?}", other)));
            }
        }

        Ok(Self {
            reader,
            datalink,
            streams: StreamTable::new(),
            stats: CaptureStats::default(),
        })
    }

    /// Capture statistics so far
    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Dissect one capture record into a fragment.
    ///
    /// Returns `None` for records that carry no TCP payload.
    fn dissect(&mut self, data: &[u8], frame_time: f64) -> Option<Fragment> {
        let sliced = match self.datalink {
            DataLink::ETHERNET => SlicedPacket::from_ethernet(data),
            _ => SlicedPacket::from_ip(data),
        };
        let sliced = match sliced {
            Ok(sliced) => sliced,
            Err(e) => {
                self.stats.malformed += 1;
                debug!("failed to parse capture record: {}", e);
                return None;
            }
        };

        let (src_ip, dst_ip) = match &sliced.net {
            Some(NetSlice::Ipv4(v4)) => (
                IpAddr::V4(v4.header().source_addr()),
                IpAddr::V4(v4.header().destination_addr()),
            ),
            Some(NetSlice::Ipv6(v6)) => (
                IpAddr::V6(v6.header().source_addr()),
                IpAddr::V6(v6.header().destination_addr()),
            ),
            _ => {
                self.stats.skipped += 1;
                return None;
            }
        };

        let tcp = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => tcp,
            _ => {
                self.stats.skipped += 1;
                return None;
            }
        };

        let payload = tcp.payload();
        if payload.is_empty() {
            self.stats.skipped += 1;
            return None;
        }

        let src_port = tcp.source_port();
        let dst_port = tcp.destination_port();
        let tcp_stream = self
            .streams
            .stream_id((src_ip, src_port), (dst_ip, dst_port));

        self.stats.fragments += 1;
        Some(Fragment {
            frame_time,
            tcp_stream,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            data: payload.to_vec(),
        })
    }
}

impl FragmentSource for PcapFragmentSource {
    fn read(&mut self) -> Result<Option<Fragment>> {
        loop {
            // The record borrows the reader's buffer, so copy it out before
            // dissecting
            let (data, frame_time) = match self.reader.next_packet() {
                None => return Ok(None),
                Some(Err(e)) => {
                    // A truncated tail record ends the capture, it does not
                    // fail it
                    warn!("pcap read stopped: {}", e);
                    return Ok(None);
                }
                Some(Ok(record)) => (record.data.to_vec(), record.timestamp.as_secs_f64()),
            };
            self.stats.records += 1;

            if let Some(fragment) = self.dissect(&data, frame_time) {
                return Ok(Some(fragment));
            }
        }
    }
}
