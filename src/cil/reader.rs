//! CIL message reader
//!
//! Layers protobuf decoding over the frame reader. Frames are dispatched by
//! the well-known collaboration ports: peer-port frames carry `CilMessage`,
//! server/client-port frames carry the registration pair. Frames on other
//! ports, and frames that fail to decode, are skipped.

use std::net::IpAddr;

use prost::Message;
use serde::Serialize;
use tracing::error;

use crate::capture::FragmentSource;
use crate::config::DecoderSettings;
use crate::error::Result;
use crate::flow::{Frame, FrameReader};
use super::proto::{CilMessage, TalkToServer, TellClient};
use super::{CLIENT_PORT, COLLABORATION_PORTS, PEER_PORT, SERVER_PORT};

/// Decoded message payload, tagged by link type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePayload {
    /// Gateway-to-gateway CIL message
    CilMessage(CilMessage),
    /// Client-to-server registration message
    ClientMsg(TalkToServer),
    /// Server-to-client registration message
    ServerMsg(TellClient),
}

/// One decoded message with the frame metadata it was carried in.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub timestamp: f64,
    pub tcp_length: usize,
    pub tcp_stream: u32,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl MessageRecord {
    fn new(frame: &Frame, payload: MessagePayload) -> Self {
        Self {
            timestamp: frame.timestamp,
            tcp_length: frame.tcp_length,
            tcp_stream: frame.tcp_stream,
            src_ip: frame.src_ip,
            src_port: frame.src_port,
            dst_ip: frame.dst_ip,
            dst_port: frame.dst_port,
            payload,
        }
    }

    pub fn cil_message(&self) -> Option<&CilMessage> {
        match &self.payload {
            MessagePayload::CilMessage(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn client_msg(&self) -> Option<&TalkToServer> {
        match &self.payload {
            MessagePayload::ClientMsg(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn server_msg(&self) -> Option<&TellClient> {
        match &self.payload {
            MessagePayload::ServerMsg(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Pull-based reader of decoded collaboration messages.
pub struct CilReader<S: FragmentSource> {
    frames: FrameReader<S>,
    read_reg: bool,
}

impl<S: FragmentSource> CilReader<S> {
    /// Wrap a fragment source. The collaboration ports are always added to
    /// the decoder's forced-port list; `read_reg` additionally surfaces the
    /// registration traffic.
    pub fn new(source: S, mut settings: DecoderSettings, read_reg: bool) -> Self {
        for port in COLLABORATION_PORTS {
            if !settings.force_ports.contains(&port) {
                settings.force_ports.push(port);
            }
        }
        Self {
            frames: FrameReader::new(source, settings),
            read_reg,
        }
    }

    /// Pull the next decodable message.
    pub fn read(&mut self) -> Result<Option<MessageRecord>> {
        while let Some(frame) = self.frames.read()? {
            if frame.src_port == PEER_PORT || frame.dst_port == PEER_PORT {
                match CilMessage::decode(frame.message.as_slice()) {
                    Ok(msg) => {
                        return Ok(Some(MessageRecord::new(
                            &frame,
                            MessagePayload::CilMessage(msg),
                        )))
                    }
                    Err(e) => {
                        error!("protobuf decode error {}", e);
                        continue;
                    }
                }
            }
            if self.read_reg
                && (frame.src_port == SERVER_PORT || frame.dst_port == SERVER_PORT)
            {
                match TalkToServer::decode(frame.message.as_slice()) {
                    Ok(msg) => {
                        return Ok(Some(MessageRecord::new(
                            &frame,
                            MessagePayload::ClientMsg(msg),
                        )))
                    }
                    Err(e) => {
                        error!("protobuf decode error {}", e);
                        continue;
                    }
                }
            }
            if self.read_reg
                && (frame.src_port == CLIENT_PORT || frame.dst_port == CLIENT_PORT)
            {
                match TellClient::decode(frame.message.as_slice()) {
                    Ok(msg) => {
                        return Ok(Some(MessageRecord::new(
                            &frame,
                            MessagePayload::ServerMsg(msg),
                        )))
                    }
                    Err(e) => {
                        error!("protobuf decode error {}", e);
                        continue;
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Fragment, VecFragmentSource};
    use crate::cil::proto::{cil_message, talk_to_server, CilVersion, Hello, Keepalive, TimeStamp};
    use std::net::Ipv4Addr;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![crate::framing::FLAG_LONG];
        bytes.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn fragment(stream: u32, src_port: u16, dst_port: u16, data: Vec<u8>) -> Fragment {
        Fragment {
            frame_time: 100.0,
            tcp_stream: stream,
            src_ip: IpAddr::V4(Ipv4Addr::new(172, 30, 101, 101)),
            src_port,
            dst_ip: IpAddr::V4(Ipv4Addr::new(172, 30, 101, 102)),
            dst_port,
            data,
        }
    }

    fn hello_message() -> CilMessage {
        CilMessage {
            sender_network_id: u32::from(Ipv4Addr::new(172, 30, 101, 101)),
            msg_count: 1,
            timestamp: Some(TimeStamp { seconds: 100, picoseconds: 0 }),
            network_type: None,
            payload: Some(cil_message::Payload::Hello(Hello {
                version: Some(CilVersion { major: 3, minor: 6, patch: 0 }),
            })),
        }
    }

    /// Prefix the stream with a proper greeting so validation passes
    /// without relying on the forced-port path.
    fn with_greeting(data: Vec<u8>) -> Vec<u8> {
        let mut bytes = crate::framing::test_greeting();
        bytes.extend_from_slice(&data);
        bytes
    }

    #[test]
    fn test_peer_port_frames_decode_as_cil() {
        let message = hello_message();
        let data = with_greeting(frame_bytes(&message.encode_to_vec()));
        let source = VecFragmentSource::new(vec![fragment(0, 40000, PEER_PORT, data)]);
        let mut reader = CilReader::new(source, DecoderSettings::default(), false);

        let record = reader.read().unwrap().unwrap();
        assert_eq!(record.cil_message().unwrap(), &message);
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_registration_requires_read_reg() {
        let keepalive = TalkToServer {
            payload: Some(talk_to_server::Payload::Keepalive(Keepalive {
                my_ip_address: u32::from(Ipv4Addr::new(172, 30, 101, 101)),
            })),
        };
        let data = with_greeting(frame_bytes(&keepalive.encode_to_vec()));

        let source =
            VecFragmentSource::new(vec![fragment(0, 40000, SERVER_PORT, data.clone())]);
        let mut reader = CilReader::new(source, DecoderSettings::default(), false);
        assert!(reader.read().unwrap().is_none());

        let source = VecFragmentSource::new(vec![fragment(0, 40000, SERVER_PORT, data)]);
        let mut reader = CilReader::new(source, DecoderSettings::default(), true);
        let record = reader.read().unwrap().unwrap();
        assert!(matches!(
            record.client_msg().unwrap().payload,
            Some(talk_to_server::Payload::Keepalive(_))
        ));
    }

    #[test]
    fn test_undecodable_peer_frame_is_skipped() {
        let garbage = with_greeting(frame_bytes(&[0x2a, 0xff, 0xff, 0xff]));
        let good = frame_bytes(&hello_message().encode_to_vec());
        let mut data = garbage;
        data.extend_from_slice(&good);
        let source = VecFragmentSource::new(vec![fragment(0, 40000, PEER_PORT, data)]);
        let mut reader = CilReader::new(source, DecoderSettings::default(), false);

        let record = reader.read().unwrap().unwrap();
        assert!(record.cil_message().is_some());
        assert!(reader.read().unwrap().is_none());
    }
}
