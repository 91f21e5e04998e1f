//! Registration compliance checking
//!
//! Watches the client-to-server registration traffic: every client must
//! register during the startup grace period, then keep the connection alive
//! with sufficiently frequent keepalives.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, error};

use crate::cil::proto::talk_to_server;
use crate::cil::MessageRecord;
use crate::config::CheckerSettings;
use super::ValidationWindow;

/// Everything observed and judged about one client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    pub reg_check_passed: bool,
    pub server_ip_address: IpAddr,
    pub client_ip_address: IpAddr,
    pub total_keepalives: u64,
    pub keepalive_good_rate: bool,
    pub total_registrations: u64,
    pub no_repeat_registration: bool,
}

/// Compliance state for one registration client.
pub struct ClientCheck {
    limits: CheckerSettings,
    window: ValidationWindow,
    report: ClientReport,
    last_keepalive: Option<f64>,
}

impl ClientCheck {
    pub fn new(
        server: IpAddr,
        client: IpAddr,
        window: ValidationWindow,
        limits: CheckerSettings,
    ) -> Self {
        Self {
            limits,
            window,
            report: ClientReport {
                reg_check_passed: false,
                server_ip_address: server,
                client_ip_address: client,
                total_keepalives: 0,
                keepalive_good_rate: true,
                total_registrations: 0,
                no_repeat_registration: true,
            },
            last_keepalive: None,
        }
    }

    pub fn process(&mut self, record: &MessageRecord) {
        let msg = match record.client_msg() {
            Some(msg) => msg,
            None => return,
        };

        let in_window = self.window.contains(record.timestamp);

        match &msg.payload {
            Some(talk_to_server::Payload::Keepalive(_)) => {
                self.report.total_keepalives += 1;
                self.check_keepalive_rate(record.timestamp, in_window, record);
            }
            Some(talk_to_server::Payload::Register(_)) => {
                self.report.total_registrations += 1;
                // Registration belongs in the grace period, not mid-match
                if in_window {
                    fail(&mut self.report.no_repeat_registration, "no_repeat_registration", record);
                }
            }
            _ => {}
        }
    }

    fn check_keepalive_rate(&mut self, timestamp: f64, in_window: bool, record: &MessageRecord) {
        if let Some(last) = self.last_keepalive {
            if in_window {
                let interval = timestamp - last;
                if interval > self.limits.keepalive_max_interval {
                    error!(
                        "keepalive interval was {:.2} s, must be at most {:.2} s",
                        interval, self.limits.keepalive_max_interval
                    );
                    fail(&mut self.report.keepalive_good_rate, "keepalive_good_rate", record);
                }
            }
        }
        self.last_keepalive = Some(timestamp);
    }

    /// Evaluate the aggregate verdict and finish the report.
    pub fn validate(&mut self) -> bool {
        self.report.reg_check_passed = self.report.keepalive_good_rate
            && self.report.no_repeat_registration
            && self.report.total_keepalives > 0
            && self.report.total_registrations > 0;
        self.report.reg_check_passed
    }

    pub fn report(&mut self) -> ClientReport {
        self.validate();
        self.report.clone()
    }
}

fn fail(flag: &mut bool, test: &str, record: &MessageRecord) {
    if *flag {
        if let Ok(pretty) = serde_json::to_string(record) {
            debug!("{} error: {}", test, pretty);
        }
    }
    *flag = false;
}

/// Checks every registration client seen in the capture.
pub struct AllClientsCheck {
    clients: HashMap<IpAddr, ClientCheck>,
    order: Vec<IpAddr>,
    window: ValidationWindow,
    limits: CheckerSettings,
}

impl AllClientsCheck {
    pub fn new(window: ValidationWindow, limits: CheckerSettings) -> Self {
        Self {
            clients: HashMap::new(),
            order: Vec::new(),
            window,
            limits,
        }
    }

    pub fn process(&mut self, record: &MessageRecord) {
        // Client messages run client -> server, server messages the reverse
        let (client_ip, server_ip) = if record.client_msg().is_some() {
            (record.src_ip, record.dst_ip)
        } else if record.server_msg().is_some() {
            (record.dst_ip, record.src_ip)
        } else {
            return;
        };

        if !self.clients.contains_key(&client_ip) {
            self.order.push(client_ip);
            self.clients.insert(
                client_ip,
                ClientCheck::new(server_ip, client_ip, self.window, self.limits.clone()),
            );
        }
        self.clients.get_mut(&client_ip).unwrap().process(record);
    }

    /// Finished reports, in client first-seen order.
    pub fn reports(&mut self) -> Vec<ClientReport> {
        let mut reports = Vec::with_capacity(self.order.len());
        for client in &self.order {
            if let Some(check) = self.clients.get_mut(client) {
                reports.push(check.report());
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::proto::{Keepalive, Register, TalkToServer};
    use crate::cil::{MessagePayload, CLIENT_PORT, SERVER_PORT};
    use std::net::Ipv4Addr;

    const SERVER: Ipv4Addr = Ipv4Addr::new(172, 30, 1, 1);
    const CLIENT: Ipv4Addr = Ipv4Addr::new(172, 30, 101, 101);

    fn client_record(timestamp: f64, payload: talk_to_server::Payload) -> MessageRecord {
        MessageRecord {
            timestamp,
            tcp_length: 16,
            tcp_stream: 0,
            src_ip: IpAddr::V4(CLIENT),
            src_port: 40000,
            dst_ip: IpAddr::V4(SERVER),
            dst_port: SERVER_PORT,
            payload: MessagePayload::ClientMsg(TalkToServer { payload: Some(payload) }),
        }
    }

    fn register(timestamp: f64) -> MessageRecord {
        client_record(
            timestamp,
            talk_to_server::Payload::Register(Register {
                my_ip_address: u32::from(CLIENT),
            }),
        )
    }

    fn keepalive(timestamp: f64) -> MessageRecord {
        client_record(
            timestamp,
            talk_to_server::Payload::Keepalive(Keepalive {
                my_ip_address: u32::from(CLIENT),
            }),
        )
    }

    fn window() -> ValidationWindow {
        ValidationWindow { start: 1000.0, end: 5000.0 }
    }

    fn check() -> ClientCheck {
        ClientCheck::new(
            IpAddr::V4(SERVER),
            IpAddr::V4(CLIENT),
            window(),
            CheckerSettings::default(),
        )
    }

    #[test]
    fn test_conforming_client_passes() {
        let mut check = check();
        check.process(&register(900.0));
        for i in 0..5 {
            check.process(&keepalive(1000.0 + 20.0 * i as f64));
        }
        let report = check.report();
        assert!(report.reg_check_passed);
        assert_eq!(report.total_keepalives, 5);
        assert_eq!(report.total_registrations, 1);
    }

    #[test]
    fn test_keepalive_gap_fails() {
        let mut check = check();
        check.process(&register(900.0));
        check.process(&keepalive(1000.0));
        check.process(&keepalive(1100.0));
        let report = check.report();
        assert!(!report.keepalive_good_rate);
        assert!(!report.reg_check_passed);
    }

    #[test]
    fn test_registration_inside_window_fails() {
        let mut check = check();
        check.process(&register(1500.0));
        check.process(&keepalive(1510.0));
        let report = check.report();
        assert!(!report.no_repeat_registration);
    }

    #[test]
    fn test_missing_registration_fails() {
        let mut check = check();
        check.process(&keepalive(1000.0));
        check.process(&keepalive(1020.0));
        assert!(!check.report().reg_check_passed);
    }

    #[test]
    fn test_gap_outside_window_is_tolerated() {
        let mut check = check();
        check.process(&register(900.0));
        check.process(&keepalive(910.0));
        // Next keepalive is late, but teardown already began
        check.process(&keepalive(6000.0));
        assert!(check.report().keepalive_good_rate);
    }

    #[test]
    fn test_all_clients_keyed_by_client_ip() {
        let mut all = AllClientsCheck::new(window(), CheckerSettings::default());
        all.process(&register(900.0));
        all.process(&keepalive(1000.0));

        // A server-side message for the same client must not create a
        // second entry
        let server_record = MessageRecord {
            timestamp: 1001.0,
            tcp_length: 16,
            tcp_stream: 1,
            src_ip: IpAddr::V4(SERVER),
            src_port: CLIENT_PORT,
            dst_ip: IpAddr::V4(CLIENT),
            dst_port: 40001,
            payload: MessagePayload::ServerMsg(crate::cil::proto::TellClient { payload: None }),
        };
        all.process(&server_record);

        let reports = all.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].client_ip_address, IpAddr::V4(CLIENT));
    }
}
