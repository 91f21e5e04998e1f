//! Hand-maintained prost schema for the CIL wire messages
//!
//! Covers the message subset the analysis tools inspect. Field numbers
//! match the deployed protocol; unknown fields skip harmlessly during
//! decode, so messages from richer senders still parse.

use serde::Serialize;

/// Split-second timestamp: whole seconds plus picoseconds within the
/// second.
#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct TimeStamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int64, tag = "2")]
    pub picoseconds: i64,
}

impl TimeStamp {
    /// Collapse to epoch seconds. Callers validate the picoseconds range
    /// separately; out-of-range values still produce a number here.
    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + 1e-12 * self.picoseconds as f64
    }
}

/// Local stand-in for `google.protobuf.DoubleValue`, kept so optional
/// doubles are distinguishable from absent ones.
#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct DoubleValue {
    #[prost(double, tag = "1")]
    pub value: f64,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct CilVersion {
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
    #[prost(uint32, tag = "3")]
    pub patch: u32,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct Hello {
    #[prost(message, optional, tag = "1")]
    pub version: Option<CilVersion>,
}

/// One rectangle of spectrum: a frequency range over a time range, with
/// optional duty-cycle shaping.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct SpectrumVoxel {
    #[prost(double, tag = "1")]
    pub freq_start: f64,
    #[prost(double, tag = "2")]
    pub freq_end: f64,
    #[prost(message, optional, tag = "3")]
    pub duty_cycle: Option<DoubleValue>,
    #[prost(message, optional, tag = "4")]
    pub time_start: Option<TimeStamp>,
    #[prost(message, optional, tag = "5")]
    pub time_end: Option<TimeStamp>,
    #[prost(message, optional, tag = "6")]
    pub period_time: Option<DoubleValue>,
    #[prost(message, optional, tag = "7")]
    pub slot_time: Option<DoubleValue>,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct TransmitterInfo {
    #[prost(uint32, tag = "1")]
    pub radio_id: u32,
    #[prost(message, optional, tag = "2")]
    pub power_db: Option<DoubleValue>,
    #[prost(bool, tag = "3")]
    pub mac_cca: bool,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct ReceiverInfo {
    #[prost(uint32, tag = "1")]
    pub radio_id: u32,
    #[prost(message, optional, tag = "2")]
    pub power_db: Option<DoubleValue>,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct SpectrumVoxelUsage {
    #[prost(message, optional, tag = "1")]
    pub spectrum_voxel: Option<SpectrumVoxel>,
    #[prost(message, optional, tag = "2")]
    pub transmitter_info: Option<TransmitterInfo>,
    #[prost(message, repeated, tag = "3")]
    pub receiver_info: Vec<ReceiverInfo>,
    #[prost(bool, tag = "4")]
    pub measured_data: bool,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct SpectrumUsage {
    #[prost(message, repeated, tag = "1")]
    pub voxels: Vec<SpectrumVoxelUsage>,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct Location {
    #[prost(double, tag = "1")]
    pub latitude: f64,
    #[prost(double, tag = "2")]
    pub longitude: f64,
    #[prost(double, tag = "3")]
    pub elevation: f64,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct LocationInfo {
    #[prost(uint32, tag = "1")]
    pub radio_id: u32,
    #[prost(message, optional, tag = "2")]
    pub location: Option<Location>,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<TimeStamp>,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct LocationUpdate {
    #[prost(message, repeated, tag = "1")]
    pub locations: Vec<LocationInfo>,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct MandatePerformance {
    #[prost(double, tag = "1")]
    pub scalar_performance: f64,
    #[prost(uint32, repeated, tag = "2")]
    pub radio_ids: Vec<u32>,
    #[prost(uint32, tag = "3")]
    pub flow_id: u32,
    #[prost(uint32, tag = "4")]
    pub hold_period: u32,
    #[prost(uint32, tag = "5")]
    pub achieved_duration: u32,
    #[prost(uint32, tag = "6")]
    pub point_value: u32,
    #[prost(message, repeated, tag = "7")]
    pub desired_voxels: Vec<SpectrumVoxel>,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct DetailedPerformance {
    #[prost(uint32, tag = "1")]
    pub mandate_count: u32,
    #[prost(message, repeated, tag = "2")]
    pub mandates: Vec<MandatePerformance>,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<TimeStamp>,
    #[prost(uint32, tag = "4")]
    pub mandates_achieved: u32,
    #[prost(uint32, tag = "5")]
    pub total_score_achieved: u32,
    #[prost(uint32, tag = "6")]
    pub scoring_point_threshold: u32,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct IncumbentNotify {
    #[prost(uint32, tag = "1")]
    pub incumbent_id: u32,
    #[prost(message, optional, tag = "2")]
    pub report_time: Option<TimeStamp>,
    /// Measured interference power at the incumbent, dB
    #[prost(double, tag = "3")]
    pub power_db: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ::prost::Enumeration)]
#[repr(i32)]
pub enum NetworkKind {
    Unknown = 0,
    Competitor = 1,
    IncumbentPassive = 2,
    IncumbentActive = 3,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct NetworkType {
    #[prost(enumeration = "NetworkKind", tag = "1")]
    pub network_type: i32,
}

/// Top-level gateway-to-gateway message.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct CilMessage {
    /// IPv4 address of the sending gateway as a big-endian integer
    #[prost(uint32, tag = "1")]
    pub sender_network_id: u32,
    /// Per-sender monotone message counter
    #[prost(uint32, tag = "2")]
    pub msg_count: u32,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<TimeStamp>,
    #[prost(message, optional, tag = "4")]
    pub network_type: Option<NetworkType>,
    #[prost(oneof = "cil_message::Payload", tags = "5, 6, 7, 8, 9")]
    pub payload: Option<cil_message::Payload>,
}

pub mod cil_message {
    use serde::Serialize;

    #[derive(Clone, PartialEq, Serialize, ::prost::Oneof)]
    #[serde(rename_all = "snake_case")]
    pub enum Payload {
        #[prost(message, tag = "5")]
        Hello(super::Hello),
        #[prost(message, tag = "6")]
        SpectrumUsage(super::SpectrumUsage),
        #[prost(message, tag = "7")]
        LocationUpdate(super::LocationUpdate),
        #[prost(message, tag = "8")]
        DetailedPerformance(super::DetailedPerformance),
        #[prost(message, tag = "9")]
        IncumbentNotify(super::IncumbentNotify),
    }
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct Register {
    #[prost(uint32, tag = "1")]
    pub my_ip_address: u32,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct Keepalive {
    #[prost(uint32, tag = "1")]
    pub my_ip_address: u32,
}

#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct Leave {
    #[prost(uint32, tag = "1")]
    pub my_ip_address: u32,
}

/// Client-to-server registration message.
#[derive(Clone, Copy, PartialEq, Serialize, ::prost::Message)]
pub struct TalkToServer {
    #[prost(oneof = "talk_to_server::Payload", tags = "1, 2, 3")]
    pub payload: Option<talk_to_server::Payload>,
}

pub mod talk_to_server {
    use serde::Serialize;

    #[derive(Clone, Copy, PartialEq, Serialize, ::prost::Oneof)]
    #[serde(rename_all = "snake_case")]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Register(super::Register),
        #[prost(message, tag = "2")]
        Keepalive(super::Keepalive),
        #[prost(message, tag = "3")]
        Leave(super::Leave),
    }
}

/// Neighborhood broadcast: which gateways are currently registered.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct Inform {
    #[prost(uint32, tag = "1")]
    pub client_count: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub neighbors: Vec<u32>,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct Notify {
    #[prost(uint32, tag = "1")]
    pub client_count: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub neighbors: Vec<u32>,
}

/// Server-to-client registration message.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct TellClient {
    #[prost(oneof = "tell_client::Payload", tags = "1, 2")]
    pub payload: Option<tell_client::Payload>,
}

pub mod tell_client {
    use serde::Serialize;

    #[derive(Clone, PartialEq, Serialize, ::prost::Oneof)]
    #[serde(rename_all = "snake_case")]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Inform(super::Inform),
        #[prost(message, tag = "2")]
        Notify(super::Notify),
    }
}
