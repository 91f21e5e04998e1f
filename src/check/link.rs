//! Per-link CIL compliance checking
//!
//! One `LinkCheck` watches the messages a source gateway sends to one
//! destination gateway and records every rule violation in its report.
//! The checks follow the collaboration protocol rules: hello first,
//! monotone message counts, honest sender identity and timestamps, bounded
//! spectrum voxels and locations, and per-payload reporting rates inside
//! the validation window.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::cil::proto::{cil_message, tell_client, CilMessage, SpectrumVoxel, TimeStamp};
use crate::cil::MessageRecord;
use crate::config::CheckerSettings;
use super::ValidationWindow;

/// Distinct voxel shape seen on a link, collected for the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoxelSummary {
    pub freq_start: f64,
    pub freq_width: f64,
    pub duty_cycle_set: bool,
    pub period_time: Option<f64>,
    pub slot_time: Option<f64>,
}

/// Everything observed and judged about one link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub cil_check_passed: bool,
    pub cil_version: Option<String>,
    pub sender_ip_address: IpAddr,
    pub receiver_ip_address: IpAddr,
    pub total_messages: u64,
    pub picoseconds_valid: bool,
    pub sender_network_id_valid: bool,
    pub timestamp_is_set: bool,
    pub timestamp_valid: bool,
    pub timestamp_offset: Option<f64>,
    pub timestamp_first: Option<f64>,
    pub timestamp_last: Option<f64>,
    pub msg_count_monotone: bool,
    pub hello_first: bool,
    pub hello_messages: u64,
    pub spectrum_voxel_freq_valid: bool,
    pub spectrum_voxel_time_start_valid: bool,
    pub spectrum_voxel_time_end_valid: bool,
    pub spectrum_usage_messages: u64,
    pub spectrum_usage_voxels: Vec<VoxelSummary>,
    pub spectrum_usage_good_rate: bool,
    pub location_update_messages: u64,
    pub location_info_timestamp_valid: bool,
    pub location_info_location_valid: bool,
    pub location_update_good_rate: bool,
    pub radio_ids: Vec<u32>,
    pub radio_id_valid: bool,
    pub detailed_performance_messages: u64,
    pub detailed_performance_good_rate: bool,
    pub detailed_performance_max_mandate_count: u32,
    pub detailed_performance_max_achieved: u32,
    pub detailed_performance_timestamp_valid: bool,
    pub mandate_performance_messages: u64,
    pub mandate_flow_id_valid: bool,
    pub detailed_performance_mandate_point_value_valid: bool,
    pub detailed_performance_scoring_point_threshold_valid: bool,
    pub incumbent_notify_messages: u64,
    pub peer_disconnect_count: u64,
}

impl LinkReport {
    fn new(sender: IpAddr, receiver: IpAddr) -> Self {
        Self {
            cil_check_passed: false,
            cil_version: None,
            sender_ip_address: sender,
            receiver_ip_address: receiver,
            total_messages: 0,
            picoseconds_valid: true,
            sender_network_id_valid: true,
            timestamp_is_set: true,
            timestamp_valid: true,
            timestamp_offset: None,
            timestamp_first: None,
            timestamp_last: None,
            msg_count_monotone: true,
            hello_first: true,
            hello_messages: 0,
            spectrum_voxel_freq_valid: true,
            spectrum_voxel_time_start_valid: true,
            spectrum_voxel_time_end_valid: true,
            spectrum_usage_messages: 0,
            spectrum_usage_voxels: Vec::new(),
            spectrum_usage_good_rate: true,
            location_update_messages: 0,
            location_info_timestamp_valid: true,
            location_info_location_valid: true,
            location_update_good_rate: true,
            radio_ids: Vec::new(),
            radio_id_valid: true,
            detailed_performance_messages: 0,
            detailed_performance_good_rate: true,
            detailed_performance_max_mandate_count: 0,
            detailed_performance_max_achieved: 0,
            detailed_performance_timestamp_valid: true,
            mandate_performance_messages: 0,
            mandate_flow_id_valid: true,
            detailed_performance_mandate_point_value_valid: true,
            detailed_performance_scoring_point_threshold_valid: true,
            incumbent_notify_messages: 0,
            peer_disconnect_count: 0,
        }
    }
}

/// Flip a report flag, logging the offending message the first time.
fn report_failure(flag: &mut bool, test: &str, record: &MessageRecord) {
    if *flag {
        if let Ok(pretty) = serde_json::to_string(record) {
            debug!("{} error: {}", test, pretty);
        }
    }
    *flag = false;
}

/// Compliance state for the messages one gateway sends to one peer.
pub struct LinkCheck {
    limits: CheckerSettings,
    window: ValidationWindow,
    /// Sender IPv4 address as the network id the sender must claim
    expected_network_id: Option<u32>,
    /// Receiver IPv4 address, for neighbor-list matching
    receiver_network_id: Option<u32>,
    report: LinkReport,
    last_msg_count: i64,
    last_spectrum_usage: Option<f64>,
    last_location_update: Option<f64>,
    last_detailed_performance: Option<f64>,
    timestamp_offset_cnt: u64,
    timestamp_offset_sum: f64,
    peer_connected: bool,
}

impl LinkCheck {
    pub fn new(
        sender: IpAddr,
        receiver: IpAddr,
        window: ValidationWindow,
        limits: CheckerSettings,
    ) -> Self {
        let expected_network_id = match sender {
            IpAddr::V4(v4) => Some(u32::from(v4)),
            IpAddr::V6(_) => {
                warn!("sender {} is not IPv4, skipping network id check", sender);
                None
            }
        };
        let receiver_network_id = match receiver {
            IpAddr::V4(v4) => Some(u32::from(v4)),
            IpAddr::V6(_) => None,
        };

        Self {
            limits,
            window,
            expected_network_id,
            receiver_network_id,
            report: LinkReport::new(sender, receiver),
            last_msg_count: 0,
            last_spectrum_usage: None,
            last_location_update: None,
            last_detailed_performance: None,
            timestamp_offset_cnt: 0,
            timestamp_offset_sum: 0.0,
            peer_connected: true,
        }
    }

    /// Process one CIL message the sender emitted on this link.
    pub fn process_cil_sent(&mut self, record: &MessageRecord) {
        let msg = match record.cil_message() {
            Some(msg) => msg.clone(),
            None => {
                error!("unexpected message");
                return;
            }
        };

        let in_window = self.window.contains(record.timestamp);

        self.report.total_messages += 1;
        self.check_sender_network_id(&msg, record);
        self.check_timestamp(&msg, record);
        self.check_hello_first(&msg, record);
        self.check_message_count(&msg, record);
        self.check_spectrum_usage(&msg, record, in_window);
        self.check_location_update(&msg, record, in_window);
        self.check_detailed_performance(&msg, record, in_window);
        self.check_incumbent_notify(&msg);
    }

    /// Process a registration message the sender received from the
    /// collaboration server, to track peer connectivity.
    pub fn process_reg_rcvd(&mut self, record: &MessageRecord) {
        let msg = match record.server_msg() {
            Some(msg) => msg,
            None => {
                error!("unexpected message");
                return;
            }
        };

        match &msg.payload {
            Some(tell_client::Payload::Inform(inform)) => {
                self.update_peer_connection(&inform.neighbors);
            }
            Some(tell_client::Payload::Notify(notify)) => {
                self.update_peer_connection(&notify.neighbors);
            }
            None => {}
        }
    }

    /// Rate tracking restarts whenever the peer drops off the neighbor list.
    fn update_peer_connection(&mut self, neighbors: &[u32]) {
        let connected = self
            .receiver_network_id
            .map_or(false, |id| neighbors.contains(&id));

        if self.peer_connected && !connected {
            self.report.peer_disconnect_count += 1;
            self.last_spectrum_usage = None;
            self.last_location_update = None;
            self.last_detailed_performance = None;
        }
        self.peer_connected = connected;
    }

    /// Collapse a protocol timestamp, flagging picosecond overflow.
    fn timestamp_value(&mut self, ts: &TimeStamp) -> f64 {
        if ts.picoseconds < 0 || ts.picoseconds as f64 >= 1e12 {
            self.report.picoseconds_valid = false;
            error!(
                "picoseconds field invalid, was {}, must be between 0 and 1e12",
                ts.picoseconds
            );
        }
        ts.as_secs_f64()
    }

    fn add_radio_id(&mut self, radio_id: u32) {
        if !self.report.radio_ids.contains(&radio_id) {
            self.report.radio_ids.push(radio_id);
        }
    }

    fn check_radio_id(&mut self, radio_id: u32, msg: &CilMessage, record: &MessageRecord) {
        if radio_id < self.limits.radio_id_min || radio_id > self.limits.radio_id_max {
            error!(
                "msg {}: radio id invalid, was {}, must be between {} and {}",
                msg.msg_count, radio_id, self.limits.radio_id_min, self.limits.radio_id_max
            );
            report_failure(&mut self.report.radio_id_valid, "radio_id_valid", record);
        }
    }

    fn check_sender_network_id(&mut self, msg: &CilMessage, _record: &MessageRecord) {
        if let Some(expected) = self.expected_network_id {
            if expected != msg.sender_network_id {
                error!(
                    "msg {}: invalid sender network id, expected {}, found {}",
                    msg.msg_count, expected, msg.sender_network_id
                );
                self.report.sender_network_id_valid = false;
            }
        }
    }

    fn check_timestamp(&mut self, msg: &CilMessage, record: &MessageRecord) {
        let ts = msg.timestamp.unwrap_or_default();
        let timestamp = self.timestamp_value(&ts);

        if ts.seconds == 0 {
            report_failure(&mut self.report.timestamp_is_set, "timestamp_is_set", record);
        } else {
            let offset = record.timestamp - timestamp;
            self.timestamp_offset_cnt += 1;
            self.timestamp_offset_sum += offset;
            if offset.abs() > self.limits.timestamp_max_error {
                warn!(
                    "msg {}: large offset between message timestamp and capture timestamp",
                    msg.msg_count
                );
                report_failure(&mut self.report.timestamp_valid, "timestamp_valid", record);
            }
        }

        self.report.timestamp_last = Some(timestamp);
        if self.report.timestamp_first.is_none() {
            self.report.timestamp_first = Some(timestamp);
        }
    }

    fn check_hello_first(&mut self, msg: &CilMessage, record: &MessageRecord) {
        let hello = match &msg.payload {
            Some(cil_message::Payload::Hello(hello)) => Some(hello),
            _ => None,
        };

        if self.report.total_messages == 1 && hello.is_none() {
            error!(
                "msg {}: hello message must be the first CIL message sent to a peer",
                msg.msg_count
            );
            report_failure(&mut self.report.hello_first, "hello_first", record);
        }

        if let Some(hello) = hello {
            self.last_msg_count = msg.msg_count as i64 - 1;
            self.report.hello_messages += 1;
            let version = hello.version.unwrap_or_default();
            self.report.cil_version = Some(format!(
                "{}.{}.{}",
                version.major, version.minor, version.patch
            ));
        }
    }

    fn check_message_count(&mut self, msg: &CilMessage, record: &MessageRecord) {
        if self.last_msg_count >= msg.msg_count as i64 {
            error!(
                "found message count {} after count {}, must be monotonically increasing",
                msg.msg_count, self.last_msg_count
            );
            report_failure(&mut self.report.msg_count_monotone, "msg_count_monotone", record);
        }
        self.last_msg_count = msg.msg_count as i64;
    }

    fn check_spectrum_voxel(
        &mut self,
        voxel: &SpectrumVoxel,
        msg: &CilMessage,
        record: &MessageRecord,
    ) {
        let freq_ok = self.limits.frequency_min <= voxel.freq_start
            && voxel.freq_start < voxel.freq_end
            && voxel.freq_end <= self.limits.frequency_max;
        if !freq_ok {
            error!("msg {}: invalid spectrum voxel frequency range", msg.msg_count);
            report_failure(
                &mut self.report.spectrum_voxel_freq_valid,
                "spectrum_voxel_freq_valid",
                record,
            );
        }

        let timestamp = self.timestamp_value(&msg.timestamp.unwrap_or_default());
        let time_start = self.timestamp_value(&voxel.time_start.unwrap_or_default());
        if (time_start - timestamp).abs() > self.limits.spectrum_voxel_max_time_offset {
            report_failure(
                &mut self.report.spectrum_voxel_time_start_valid,
                "spectrum_voxel_time_start_valid",
                record,
            );
            error!("msg {}: voxel start time was invalid", msg.msg_count);
        }

        if let Some(end) = voxel.time_end {
            let time_end = self.timestamp_value(&end);
            if time_end < time_start
                || (time_end - timestamp).abs() > self.limits.spectrum_voxel_max_time_offset
            {
                report_failure(
                    &mut self.report.spectrum_voxel_time_end_valid,
                    "spectrum_voxel_time_end_valid",
                    record,
                );
                error!("msg {}: voxel end time was invalid", msg.msg_count);
            }
        }

        let summary = VoxelSummary {
            freq_start: voxel.freq_start,
            freq_width: voxel.freq_end - voxel.freq_start,
            duty_cycle_set: voxel.duty_cycle.is_some(),
            period_time: voxel.period_time.map(|v| v.value),
            slot_time: voxel.slot_time.map(|v| v.value),
        };
        if !self.report.spectrum_usage_voxels.contains(&summary) {
            self.report.spectrum_usage_voxels.push(summary);
        }
    }

    fn check_spectrum_usage(&mut self, msg: &CilMessage, record: &MessageRecord, in_window: bool) {
        let usage = match &msg.payload {
            Some(cil_message::Payload::SpectrumUsage(usage)) => usage.clone(),
            _ => return,
        };

        self.report.spectrum_usage_messages += 1;
        for voxel_usage in &usage.voxels {
            self.check_spectrum_voxel(
                &voxel_usage.spectrum_voxel.clone().unwrap_or_default(),
                msg,
                record,
            );

            let transmitter = voxel_usage.transmitter_info.unwrap_or_default();
            self.check_radio_id(transmitter.radio_id, msg, record);
            self.add_radio_id(transmitter.radio_id);
            for info in &voxel_usage.receiver_info {
                self.check_radio_id(info.radio_id, msg, record);
                self.add_radio_id(info.radio_id);
            }
        }

        let timestamp = self.timestamp_value(&msg.timestamp.unwrap_or_default());
        if let Some(last) = self.last_spectrum_usage {
            // Rate checks only apply after the startup grace period and
            // before teardown
            if in_window {
                let rate = timestamp - last;
                if rate < self.limits.spectrum_usage_min_rate
                    || rate > self.limits.spectrum_usage_max_rate
                {
                    report_failure(
                        &mut self.report.spectrum_usage_good_rate,
                        "spectrum_usage_good_rate",
                        record,
                    );
                    error!("msg {}: spectrum usage message rate failure", msg.msg_count);
                    error!(
                        "actual interval was {:.2} s, must be between {:.2} and {:.2} s",
                        rate, self.limits.spectrum_usage_min_rate, self.limits.spectrum_usage_max_rate
                    );
                }
            }
        }
        if self.peer_connected {
            self.last_spectrum_usage = Some(timestamp);
        }
    }

    fn check_location_update(&mut self, msg: &CilMessage, record: &MessageRecord, in_window: bool) {
        let update = match &msg.payload {
            Some(cil_message::Payload::LocationUpdate(update)) => update.clone(),
            _ => return,
        };

        self.report.location_update_messages += 1;
        for info in &update.locations {
            self.check_radio_id(info.radio_id, msg, record);
            self.add_radio_id(info.radio_id);

            let timestamp = self.timestamp_value(&info.timestamp.unwrap_or_default());
            let sendtime = self.timestamp_value(&msg.timestamp.unwrap_or_default());
            if timestamp > sendtime || timestamp < sendtime - self.limits.location_info_max_history
            {
                report_failure(
                    &mut self.report.location_info_timestamp_valid,
                    "location_info_timestamp_valid",
                    record,
                );
                warn!("msg {}: location update timestamp was invalid", msg.msg_count);
            }

            if let Some(location) = info.location {
                if location.latitude < self.limits.latitude_min
                    || location.latitude > self.limits.latitude_max
                {
                    report_failure(
                        &mut self.report.location_info_location_valid,
                        "location_info_location_valid",
                        record,
                    );
                    error!("msg {}: location update latitude is invalid", msg.msg_count);
                }
                if location.longitude < self.limits.longitude_min
                    || location.longitude > self.limits.longitude_max
                {
                    report_failure(
                        &mut self.report.location_info_location_valid,
                        "location_info_location_valid",
                        record,
                    );
                    error!("msg {}: location update longitude is invalid", msg.msg_count);
                }
            } else {
                report_failure(
                    &mut self.report.location_info_location_valid,
                    "location_info_location_valid",
                    record,
                );
                error!(
                    "msg {}: location update did not include a location field",
                    msg.msg_count
                );
            }
        }

        let timestamp = self.timestamp_value(&msg.timestamp.unwrap_or_default());
        if let Some(last) = self.last_location_update {
            if in_window {
                let rate = timestamp - last;
                if rate < self.limits.location_update_min_rate
                    || rate > self.limits.location_update_max_rate
                {
                    report_failure(
                        &mut self.report.location_update_good_rate,
                        "location_update_good_rate",
                        record,
                    );
                    error!("msg {}: location update message rate failure", msg.msg_count);
                }
            }
        }
        if self.peer_connected {
            self.last_location_update = Some(timestamp);
        }
    }

    fn check_detailed_performance(
        &mut self,
        msg: &CilMessage,
        record: &MessageRecord,
        in_window: bool,
    ) {
        let perf = match &msg.payload {
            Some(cil_message::Payload::DetailedPerformance(perf)) => perf.clone(),
            _ => return,
        };

        self.report.detailed_performance_messages += 1;
        self.report.detailed_performance_max_mandate_count = self
            .report
            .detailed_performance_max_mandate_count
            .max(perf.mandate_count);
        self.report.detailed_performance_max_achieved = self
            .report
            .detailed_performance_max_achieved
            .max(perf.mandates_achieved);

        if perf.scoring_point_threshold == 0 {
            report_failure(
                &mut self.report.detailed_performance_scoring_point_threshold_valid,
                "detailed_performance_scoring_point_threshold_valid",
                record,
            );
        }

        for mandate in &perf.mandates {
            self.report.mandate_performance_messages += 1;

            for &radio_id in &mandate.radio_ids {
                self.check_radio_id(radio_id, msg, record);
                self.add_radio_id(radio_id);
            }
            for voxel in &mandate.desired_voxels {
                self.check_spectrum_voxel(voxel, msg, record);
            }

            if mandate.flow_id == 0 {
                report_failure(
                    &mut self.report.mandate_flow_id_valid,
                    "mandate_flow_id_valid",
                    record,
                );
            }
            if mandate.point_value == 0 {
                report_failure(
                    &mut self.report.detailed_performance_mandate_point_value_valid,
                    "detailed_performance_mandate_point_value_valid",
                    record,
                );
            }
        }

        let timestamp = self.timestamp_value(&msg.timestamp.unwrap_or_default());
        if let Some(last) = self.last_detailed_performance {
            if in_window {
                let rate = timestamp - last;
                if rate < self.limits.detailed_performance_min_rate
                    || rate > self.limits.detailed_performance_max_rate
                {
                    report_failure(
                        &mut self.report.detailed_performance_good_rate,
                        "detailed_performance_good_rate",
                        record,
                    );
                    error!(
                        "msg {}: detailed performance message rate failure",
                        msg.msg_count
                    );
                }
            }
        }
        if self.peer_connected {
            self.last_detailed_performance = Some(timestamp);
        }

        let perf_time = self.timestamp_value(&perf.timestamp.unwrap_or_default());
        if perf_time > timestamp
            || perf_time < timestamp - self.limits.detailed_performance_max_history
        {
            report_failure(
                &mut self.report.detailed_performance_timestamp_valid,
                "detailed_performance_timestamp_valid",
                record,
            );
            warn!(
                "msg {}: detailed performance timestamp was invalid",
                msg.msg_count
            );
        }
    }

    fn check_incumbent_notify(&mut self, msg: &CilMessage) {
        if matches!(&msg.payload, Some(cil_message::Payload::IncumbentNotify(_))) {
            self.report.incumbent_notify_messages += 1;
        }
    }

    /// Evaluate the aggregate verdict and finish the report.
    pub fn validate(&mut self) -> bool {
        // timestamp_valid is reported but does not gate the overall result
        self.report.cil_check_passed = self.report.hello_first
            && self.report.msg_count_monotone
            && self.report.picoseconds_valid
            && self.report.sender_network_id_valid
            && self.report.radio_id_valid
            && self.report.timestamp_is_set
            && self.report.spectrum_voxel_freq_valid
            && self.report.spectrum_voxel_time_start_valid
            && self.report.spectrum_voxel_time_end_valid
            && self.report.spectrum_usage_good_rate
            && self.report.spectrum_usage_messages >= self.limits.rate_limited_min_count
            && self.report.location_info_timestamp_valid
            && self.report.location_info_location_valid
            && self.report.location_update_good_rate
            && self.report.location_update_messages >= self.limits.rate_limited_min_count
            && self.report.detailed_performance_timestamp_valid
            && self.report.detailed_performance_good_rate
            && self.report.detailed_performance_messages >= self.limits.rate_limited_min_count
            && self.report.mandate_flow_id_valid
            && self.report.detailed_performance_mandate_point_value_valid
            && self.report.detailed_performance_scoring_point_threshold_valid;

        for (count, what) in [
            (self.report.spectrum_usage_messages, "spectrum usage"),
            (self.report.location_update_messages, "location update"),
            (self.report.detailed_performance_messages, "detailed performance"),
        ] {
            if count < self.limits.rate_limited_min_count {
                error!(
                    "found {} {} messages, need at least {} to check the rate",
                    count, what, self.limits.rate_limited_min_count
                );
            }
        }

        self.report.timestamp_offset = if self.timestamp_offset_cnt > 0 {
            Some(self.timestamp_offset_sum / self.timestamp_offset_cnt as f64)
        } else {
            None
        };

        self.report
            .spectrum_usage_voxels
            .sort_by(|a, b| a.freq_start.total_cmp(&b.freq_start));

        self.report.cil_check_passed
    }

    /// Validate and hand out the finished report.
    pub fn report(&mut self) -> LinkReport {
        self.validate();
        self.report.clone()
    }
}

/// Checks every observed link, optionally filtered by endpoint address.
pub struct AllLinksCheck {
    links: HashMap<(IpAddr, IpAddr), LinkCheck>,
    order: Vec<(IpAddr, IpAddr)>,
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    window: ValidationWindow,
    limits: CheckerSettings,
}

impl AllLinksCheck {
    pub fn new(
        src: Option<IpAddr>,
        dst: Option<IpAddr>,
        window: ValidationWindow,
        limits: CheckerSettings,
    ) -> Self {
        Self {
            links: HashMap::new(),
            order: Vec::new(),
            src,
            dst,
            window,
            limits,
        }
    }

    pub fn process(&mut self, record: &MessageRecord) {
        if record.cil_message().is_some()
            && self.src.map_or(true, |src| src == record.src_ip)
            && self.dst.map_or(true, |dst| dst == record.dst_ip)
        {
            let key = (record.src_ip, record.dst_ip);
            if !self.links.contains_key(&key) {
                self.order.push(key);
                self.links.insert(
                    key,
                    LinkCheck::new(key.0, key.1, self.window, self.limits.clone()),
                );
            }
            self.links
                .get_mut(&key)
                .unwrap()
                .process_cil_sent(record);
        }

        if record.server_msg().is_some() {
            for (key, link) in self.links.iter_mut() {
                if record.dst_ip == key.0 {
                    link.process_reg_rcvd(record);
                }
            }
        }
    }

    /// Finished reports, in link first-seen order.
    pub fn reports(&mut self) -> Vec<LinkReport> {
        let mut reports = Vec::with_capacity(self.order.len());
        for key in &self.order {
            if let Some(link) = self.links.get_mut(key) {
                reports.push(link.report());
            }
        }
        reports
    }
}
