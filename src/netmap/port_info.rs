use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Port {
    pub number: u16,
    pub protocol: String,
    pub state: String,
    pub service: String,
    pub version: String,
}

impl Port {
    pub fn new(number: u16, protocol: &str) -> Self {
        Port {
            number,
            protocol: protocol.to_lowercase(),
            ..Default::default()
        }
    }

    // Non-empty incoming fields win
    pub fn merge(&mut self, other: &Port) {
        if !other.protocol.is_empty() {
            self.protocol = other.protocol.clone();
        }
        if !other.state.is_empty() {
            self.state = other.state.clone();
        }
        if !other.service.is_empty() {
            self.service = other.service.clone();
        }
        if !other.version.is_empty() {
            self.version = other.version.clone();
        }
    }
}

#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
pub enum FindingCategory {
    Critical,
    Potential,
    Informational,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Vulnerability {
    pub cve: String,
    pub description: String,
    pub state: String,
    pub category: FindingCategory,
    pub port: Option<u16>,
}

impl Vulnerability {
    pub fn same_finding(&self, other: &Vulnerability) -> bool {
        self.cve == other.cve && self.port == other.port
    }
}

// Guess a service name from a well known port number
pub fn service_for_port(port: u16, protocol: &str) -> &'static str {
    match (port, protocol) {
        (20 | 21, "tcp") => "ftp",
        (22, "tcp") => "ssh",
        (23, "tcp") => "telnet",
        (25, "tcp") => "smtp",
        (53, _) => "domain",
        (67 | 68, "udp") => "dhcp",
        (80, "tcp") => "http",
        (110, "tcp") => "pop3",
        (123, "udp") => "ntp",
        (137, "udp") => "netbios-ns",
        (139, "tcp") => "netbios-ssn",
        (143, "tcp") => "imap",
        (161, "udp") => "snmp",
        (443, "tcp") => "https",
        (445, "tcp") => "microsoft-ds",
        (993, "tcp") => "imaps",
        (995, "tcp") => "pop3s",
        (1883, "tcp") => "mqtt",
        (3306, "tcp") => "mysql",
        (3389, "tcp") => "ms-wbt-server",
        (5353, "udp") => "mdns",
        (5432, "tcp") => "postgresql",
        (5900, "tcp") => "vnc",
        (8080, "tcp") => "http-proxy",
        _ => "",
    }
}
