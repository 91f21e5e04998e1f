//! Byte-stream demultiplexer
//!
//! The capture interleaves fragments from many concurrent connections.
//! `FrameReader` routes each fragment to its flow and drives the per-flow
//! framing decoders, exposing one pull interface over the whole capture.

use std::collections::HashMap;

use tracing::debug;

use crate::capture::{Fragment, FragmentSource};
use crate::config::DecoderSettings;
use crate::error::Result;
use crate::framing::FlowState;
use super::{Flow, FlowKey, Frame};

/// Demultiplexer statistics
#[derive(Debug, Clone, Default)]
pub struct DemuxStats {
    pub fragments: u64,
    pub flows: u64,
    pub frames: u64,
    pub flows_errored: u64,
}

/// Pull-based frame reader across all flows of a capture.
///
/// `read` returns the next decodable frame, favoring the flow that received
/// the latest fragment; once the fragment source is exhausted every flow is
/// drained of its remaining complete frames before end-of-stream.
pub struct FrameReader<S: FragmentSource> {
    source: S,
    flows: HashMap<FlowKey, Flow>,
    /// Flow creation order, for the deterministic end-of-capture drain
    order: Vec<FlowKey>,
    current: Option<FlowKey>,
    settings: DecoderSettings,
    drain_idx: Option<usize>,
    stats: DemuxStats,
}

impl<S: FragmentSource> FrameReader<S> {
    pub fn new(source: S, settings: DecoderSettings) -> Self {
        Self {
            source,
            flows: HashMap::new(),
            order: Vec::new(),
            current: None,
            settings,
            drain_idx: None,
            stats: DemuxStats::default(),
        }
    }

    /// Pull the next frame across all known flows.
    ///
    /// Returns `Ok(None)` exactly when the fragment source is exhausted and
    /// no flow holds another complete frame.
    pub fn read(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(idx) = self.drain_idx {
                return Ok(self.drain(idx));
            }

            if let Some(key) = &self.current {
                let flow = self.flows.get_mut(key).expect("current flow exists");
                if let Some(frame) = flow.read() {
                    self.stats.frames += 1;
                    return Ok(Some(frame));
                }
                if flow.state() == FlowState::Error {
                    self.current = None;
                }
            }

            match self.source.read()? {
                Some(fragment) => self.route(fragment),
                None => {
                    debug!(
                        "fragment source exhausted after {} fragments, draining {} flows",
                        self.stats.fragments,
                        self.flows.len()
                    );
                    self.drain_idx = Some(0);
                }
            }
        }
    }

    /// Demultiplexer statistics so far
    pub fn stats(&self) -> DemuxStats {
        let mut stats = self.stats.clone();
        stats.flows_errored = self
            .flows
            .values()
            .filter(|f| f.state() == FlowState::Error)
            .count() as u64;
        stats
    }

    /// Route one fragment to its flow, creating the flow on first sight,
    /// and select that flow for the next extraction attempt.
    fn route(&mut self, fragment: Fragment) {
        self.stats.fragments += 1;
        let key = FlowKey::from_fragment(&fragment);

        if let Some(flow) = self.flows.get_mut(&key) {
            flow.append(&fragment);
        } else {
            let force = self.settings.force_ports.contains(&fragment.dst_port);
            let flow = Flow::new(&fragment, force, self.settings.max_frame_len);
            self.flows.insert(key.clone(), flow);
            self.order.push(key.clone());
            self.stats.flows += 1;
        }
        self.current = Some(key);
    }

    /// Walk all flows in creation order, surfacing any complete frame
    /// still buffered, so end-of-stream is only reported once nothing more
    /// can be produced.
    fn drain(&mut self, mut idx: usize) -> Option<Frame> {
        while let Some(key) = self.order.get(idx) {
            let flow = self.flows.get_mut(key).expect("ordered flow exists");
            if let Some(frame) = flow.read() {
                // Stay on this flow; it may hold more complete frames
                self.drain_idx = Some(idx);
                self.stats.frames += 1;
                return Some(frame);
            }
            idx += 1;
        }
        self.drain_idx = Some(idx);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VecFragmentSource;
    use crate::framing::test_greeting;
    use std::net::{IpAddr, Ipv4Addr};

    fn settings() -> DecoderSettings {
        DecoderSettings::default()
    }

    fn fragment(stream: u32, src_port: u16, dst_port: u16, data: Vec<u8>, time: f64) -> Fragment {
        Fragment {
            frame_time: time,
            tcp_stream: stream,
            src_ip: IpAddr::V4(Ipv4Addr::new(172, 30, 101, 101)),
            src_port,
            dst_ip: IpAddr::V4(Ipv4Addr::new(172, 30, 101, 102)),
            dst_port,
            data,
        }
    }

    fn short_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x00, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame
    }

    fn stream_bytes(payloads: &[&[u8]]) -> Vec<u8> {
        let mut bytes = test_greeting();
        for payload in payloads {
            bytes.extend_from_slice(&short_frame(payload));
        }
        bytes
    }

    fn collect(reader: &mut FrameReader<VecFragmentSource>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = reader.read().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_single_flow_in_one_fragment() {
        let source = VecFragmentSource::new(vec![fragment(
            0,
            40000,
            5558,
            stream_bytes(&[b"one", b"two"]),
            1.0,
        )]);
        let mut reader = FrameReader::new(source, settings());

        let frames = collect(&mut reader);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message, b"one");
        assert_eq!(frames[1].message, b"two");
        assert_eq!(reader.stats().flows, 1);
    }

    #[test]
    fn test_interleaved_flows_are_isolated() {
        // Two flows, fragmented at awkward offsets, interleaved
        let a = stream_bytes(&[b"a-first", b"a-second"]);
        let b = stream_bytes(&[b"b-first", b"b-second"]);
        let source = VecFragmentSource::new(vec![
            fragment(0, 40000, 5558, a[..50].to_vec(), 1.0),
            fragment(1, 40001, 5558, b[..70].to_vec(), 1.1),
            fragment(0, 40000, 5558, a[50..].to_vec(), 1.2),
            fragment(1, 40001, 5558, b[70..].to_vec(), 1.3),
        ]);
        let mut reader = FrameReader::new(source, settings());

        let frames = collect(&mut reader);
        let from_a: Vec<_> = frames.iter().filter(|f| f.src_port == 40000).collect();
        let from_b: Vec<_> = frames.iter().filter(|f| f.src_port == 40001).collect();
        assert_eq!(from_a.len(), 2);
        assert_eq!(from_a[0].message, b"a-first");
        assert_eq!(from_a[1].message, b"a-second");
        assert_eq!(from_b.len(), 2);
        assert_eq!(from_b[0].message, b"b-first");
        assert_eq!(from_b[1].message, b"b-second");
    }

    #[test]
    fn test_isolation_matches_solo_decoding() {
        let a = stream_bytes(&[b"alpha", b"beta", b"gamma"]);
        let b = stream_bytes(&[b"delta"]);

        let solo = |bytes: &[u8], stream: u32, port: u16| {
            let source = VecFragmentSource::new(vec![fragment(
                stream,
                port,
                5558,
                bytes.to_vec(),
                1.0,
            )]);
            collect(&mut FrameReader::new(source, settings()))
                .into_iter()
                .map(|f| f.message)
                .collect::<Vec<_>>()
        };
        let a_solo = solo(&a, 0, 40000);
        let b_solo = solo(&b, 1, 40001);

        // Byte-by-byte interleave of the two streams
        let mut fragments = Vec::new();
        for (i, chunk) in a.chunks(3).enumerate() {
            fragments.push(fragment(0, 40000, 5558, chunk.to_vec(), i as f64));
        }
        for (i, chunk) in b.chunks(5).enumerate() {
            fragments.insert(
                (i * 2 + 1).min(fragments.len()),
                fragment(1, 40001, 5558, chunk.to_vec(), i as f64),
            );
        }
        let mut reader = FrameReader::new(VecFragmentSource::new(fragments), settings());
        let frames = collect(&mut reader);

        let a_mixed: Vec<_> = frames
            .iter()
            .filter(|f| f.src_port == 40000)
            .map(|f| f.message.clone())
            .collect();
        let b_mixed: Vec<_> = frames
            .iter()
            .filter(|f| f.src_port == 40001)
            .map(|f| f.message.clone())
            .collect();
        assert_eq!(a_mixed, a_solo);
        assert_eq!(b_mixed, b_solo);
    }

    #[test]
    fn test_opposite_directions_are_distinct_flows() {
        let source = VecFragmentSource::new(vec![
            fragment(0, 40000, 5558, stream_bytes(&[b"request"]), 1.0),
            Fragment {
                frame_time: 1.1,
                tcp_stream: 0,
                src_ip: IpAddr::V4(Ipv4Addr::new(172, 30, 101, 102)),
                src_port: 5558,
                dst_ip: IpAddr::V4(Ipv4Addr::new(172, 30, 101, 101)),
                dst_port: 40000,
                data: stream_bytes(&[b"response"]),
            },
        ]);
        let mut reader = FrameReader::new(source, settings());

        let frames = collect(&mut reader);
        assert_eq!(frames.len(), 2);
        assert_eq!(reader.stats().flows, 2);
    }

    #[test]
    fn test_error_flow_is_skipped_silently() {
        let source = VecFragmentSource::new(vec![
            fragment(0, 40000, 9999, vec![0u8; 64], 1.0),
            fragment(0, 40000, 9999, short_frame(b"never seen"), 1.1),
            fragment(1, 40001, 5558, stream_bytes(&[b"still fine"]), 1.2),
        ]);
        let mut reader = FrameReader::new(source, settings());

        let frames = collect(&mut reader);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message, b"still fine");
        assert_eq!(reader.stats().flows_errored, 1);
    }

    #[test]
    fn test_forced_port_flow_without_greeting() {
        let mut bytes = short_frame(b"mid-connection capture");
        while bytes.len() < 64 {
            bytes.extend_from_slice(&short_frame(b"padding"));
        }
        let source =
            VecFragmentSource::new(vec![fragment(0, 40000, 5558, bytes, 1.0)]);
        let mut settings = settings();
        settings.force_ports = vec![5558];
        let mut reader = FrameReader::new(source, settings);

        let frames = collect(&mut reader);
        assert_eq!(frames[0].message, b"mid-connection capture");
    }

    #[test]
    fn test_unforced_port_without_greeting_errors() {
        let mut bytes = short_frame(b"mid-connection capture");
        bytes.resize(64, 0);
        let source =
            VecFragmentSource::new(vec![fragment(0, 40000, 5559, bytes, 1.0)]);
        let mut reader = FrameReader::new(source, settings());

        assert!(collect(&mut reader).is_empty());
        assert_eq!(reader.stats().flows_errored, 1);
    }

    #[test]
    fn test_every_complete_frame_surfaces_before_end_of_stream() {
        // Flow 0's final frame is completed by its last fragment while a
        // fragment for flow 1 arrives afterwards; nothing may be lost when
        // the source runs dry.
        let a = stream_bytes(&[b"early", b"late"]);
        let split = a.len() - 3;
        let source = VecFragmentSource::new(vec![
            fragment(0, 40000, 5558, a[..split].to_vec(), 1.0),
            fragment(0, 40000, 5558, a[split..].to_vec(), 1.1),
            fragment(1, 40001, 5558, stream_bytes(&[b"other"]), 1.2),
        ]);
        let mut reader = FrameReader::new(source, settings());

        let messages: Vec<_> = collect(&mut reader)
            .into_iter()
            .map(|f| f.message)
            .collect();
        assert!(messages.contains(&b"early".to_vec()));
        assert!(messages.contains(&b"late".to_vec()));
        assert!(messages.contains(&b"other".to_vec()));
    }

    #[test]
    fn test_read_after_end_keeps_returning_none() {
        let source = VecFragmentSource::new(Vec::new());
        let mut reader = FrameReader::new(source, settings());
        assert!(reader.read().unwrap().is_none());
        assert!(reader.read().unwrap().is_none());
    }
}
