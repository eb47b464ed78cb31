use crate::netmap::port_info::*;
use crate::netmap::probes::*;
use crate::netmap::summary::HandshakeState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::{Display, EnumString};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default, Display, EnumString)]
#[serde(from = "String", into = "String")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HostStatus {
    Up,
    Down,
    #[default]
    #[strum(serialize = "")]
    Unknown,
    // Anything else reported by a collaborator, kept verbatim
    #[strum(default)]
    Other(String),
}

impl HostStatus {
    /// Never fails, unrecognised states land in `Other`.
    pub fn parse(s: &str) -> Self {
        s.trim()
            .parse()
            .unwrap_or_else(|_| HostStatus::Other(s.trim().to_string()))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, HostStatus::Unknown)
    }
}

impl From<String> for HostStatus {
    fn from(s: String) -> Self {
        HostStatus::parse(&s)
    }
}

impl From<HostStatus> for String {
    fn from(status: HostStatus) -> Self {
        status.to_string()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Fingerprint {
    pub operating_system: String,
    pub device_type: String,
    pub vendor: String,
    pub behavioral_clues: BTreeSet<String>,
}

impl Fingerprint {
    pub fn merge(&mut self, other: &Fingerprint) {
        if !other.operating_system.is_empty() {
            self.operating_system = other.operating_system.clone();
        }
        if !other.device_type.is_empty() {
            self.device_type = other.device_type.clone();
        }
        if !other.vendor.is_empty() {
            self.vendor = other.vendor.clone();
        }
        self.behavioral_clues
            .extend(other.behavioral_clues.iter().cloned());
    }

    /// Stored form of the clue set, sorted and comma separated.
    pub fn clues_joined(&self) -> String {
        self.behavioral_clues
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn set_clues_from_joined(&mut self, joined: &str) {
        self.behavioral_clues = joined
            .split(',')
            .map(|clue| clue.trim())
            .filter(|clue| !clue.is_empty())
            .map(|clue| clue.to_string())
            .collect();
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
    pub isp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Communication {
    pub counterpart_ip: String,
    pub packet_count: u64,
    pub geo: Option<GeoInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WifiInfo {
    // "Access Point" or "Client"
    pub device_role: String,
    pub ssid: String,
    pub associated_ap: String,
    pub probe_requests: BTreeSet<String>,
    pub handshake_state: Option<HandshakeState>,
}

impl WifiInfo {
    pub fn merge(&mut self, other: &WifiInfo) {
        if !other.device_role.is_empty() {
            self.device_role = other.device_role.clone();
        }
        if !other.ssid.is_empty() {
            self.ssid = other.ssid.clone();
        }
        if !other.associated_ap.is_empty() {
            self.associated_ap = other.associated_ap.clone();
        }
        self.probe_requests
            .extend(other.probe_requests.iter().cloned());
        if other.handshake_state.is_some() {
            self.handshake_state = other.handshake_state;
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Host {
    // Store surrogate key, 0 until persisted
    pub id: i64,
    pub mac_address: String,
    pub ipv4_addresses: BTreeSet<String>,
    pub status: HostStatus,
    pub discovered_by: String,
    pub ports: BTreeMap<u16, Port>,
    pub fingerprint: Fingerprint,
    pub communications: BTreeMap<String, Communication>,
    pub dns_lookups: BTreeSet<String>,
    pub findings: BTreeMap<FindingCategory, Vec<Vulnerability>>,
    pub wifi: Option<WifiInfo>,
    pub web_responses: Vec<WebResponse>,
    pub screenshots: Vec<Screenshot>,
    pub ftp_results: Vec<FtpResult>,
    pub ssh_results: Vec<SshResult>,
    pub smb_results: Vec<SmbResult>,
}

impl Host {
    pub fn new(mac_address: &str) -> Self {
        Host {
            mac_address: mac_address.to_string(),
            ..Default::default()
        }
    }

    /// Deterministic pick among the IPv4 set: the lexicographically smallest address.
    pub fn primary_ip(&self) -> Option<&str> {
        self.ipv4_addresses.iter().next().map(|ip| ip.as_str())
    }

    pub fn add_ip(&mut self, ip: &str) {
        let ip = ip.trim();
        if !ip.is_empty() && ip != "0.0.0.0" {
            self.ipv4_addresses.insert(ip.to_string());
        }
    }

    pub fn add_port(&mut self, port: Port) {
        match self.ports.get_mut(&port.number) {
            Some(existing) => existing.merge(&port),
            None => {
                self.ports.insert(port.number, port);
            }
        }
    }

    pub fn add_finding(&mut self, vuln: Vulnerability) {
        let list = self.findings.entry(vuln.category).or_default();
        match list.iter_mut().find(|existing| existing.same_finding(&vuln)) {
            Some(existing) => *existing = vuln,
            None => list.push(vuln),
        }
    }

    pub fn record_communication(&mut self, counterpart_ip: &str, packets: u64) {
        let comm = self
            .communications
            .entry(counterpart_ip.to_string())
            .or_insert_with(|| Communication {
                counterpart_ip: counterpart_ip.to_string(),
                ..Default::default()
            });
        comm.packet_count += packets;
    }

    pub fn wifi_mut(&mut self) -> &mut WifiInfo {
        self.wifi.get_or_insert_with(WifiInfo::default)
    }

    pub fn has_findings(&self) -> bool {
        self.findings.values().any(|list| !list.is_empty())
    }

    /// Folds another observation of the same device into this one.
    /// Sets are unioned, keyed collections merged by key, non-empty scalars of `other` win.
    pub fn merge(&mut self, other: Host) {
        if self.id == 0 {
            self.id = other.id;
        }
        if self.mac_address.is_empty() {
            self.mac_address = other.mac_address.clone();
        }

        self.ipv4_addresses.extend(other.ipv4_addresses);

        if !other.status.is_unknown() {
            self.status = other.status;
        }
        if !other.discovered_by.is_empty() {
            self.discovered_by = other.discovered_by;
        }

        for (_, port) in other.ports {
            self.add_port(port);
        }

        self.fingerprint.merge(&other.fingerprint);

        for (ip, comm) in other.communications {
            match self.communications.get_mut(&ip) {
                Some(existing) => {
                    existing.packet_count = comm.packet_count;
                    if comm.geo.is_some() {
                        existing.geo = comm.geo;
                    }
                }
                None => {
                    self.communications.insert(ip, comm);
                }
            }
        }

        self.dns_lookups.extend(other.dns_lookups);

        for (_, list) in other.findings {
            for vuln in list {
                self.add_finding(vuln);
            }
        }

        if let Some(wifi) = other.wifi {
            self.wifi_mut().merge(&wifi);
        }

        self.web_responses.extend(other.web_responses);
        self.screenshots.extend(other.screenshots);
        self.ftp_results.extend(other.ftp_results);
        self.ssh_results.extend(other.ssh_results);
        self.smb_results.extend(other.smb_results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_host(mac: &str, ip: &str) -> Host {
        let mut host = Host::new(mac);
        host.add_ip(ip);
        host
    }

    #[test]
    fn test_host_status_strings() {
        assert_eq!(HostStatus::parse("UP"), HostStatus::Up);
        assert_eq!(HostStatus::parse(" down "), HostStatus::Down);
        assert_eq!(HostStatus::parse(""), HostStatus::Unknown);
        assert_eq!(
            HostStatus::parse("Filtered"),
            HostStatus::Other("Filtered".to_string()),
            "Unrecognised states are kept verbatim"
        );
        assert_eq!(HostStatus::Down.to_string(), "down");
        assert_eq!(HostStatus::Unknown.to_string(), "");
        assert_eq!(HostStatus::Other("filtered".to_string()).to_string(), "filtered");
    }

    #[test]
    fn test_host_status_serde_is_plain_string() {
        let json = serde_json::to_string(&HostStatus::Up).unwrap();
        assert_eq!(json, "\"up\"");
        let other: HostStatus = serde_json::from_str("\"unreachable\"").unwrap();
        assert_eq!(other, HostStatus::Other("unreachable".to_string()));
        let unknown: HostStatus = serde_json::from_str("\"\"").unwrap();
        assert!(unknown.is_unknown());
    }

    #[test]
    fn test_merge_scalar_last_wins() {
        let mut host = create_host("aa:bb:cc:dd:ee:ff", "10.0.0.5");
        host.status = HostStatus::Up;
        host.fingerprint.operating_system = "Linux 5.x".to_string();

        let mut update = create_host("aa:bb:cc:dd:ee:ff", "10.0.0.9");
        update.status = HostStatus::Down;
        update.fingerprint.vendor = "Raspberry Pi".to_string();

        host.merge(update);

        assert_eq!(host.status, HostStatus::Down);
        assert_eq!(host.fingerprint.operating_system, "Linux 5.x", "Empty OS must not erase");
        assert_eq!(host.fingerprint.vendor, "Raspberry Pi");
        assert_eq!(host.ipv4_addresses.len(), 2);
    }

    #[test]
    fn test_merge_unknown_status_does_not_overwrite() {
        let mut host = create_host("aa:bb:cc:dd:ee:ff", "10.0.0.5");
        host.status = HostStatus::Up;
        host.merge(Host::new("aa:bb:cc:dd:ee:ff"));
        assert_eq!(host.status, HostStatus::Up);
    }

    #[test]
    fn test_merge_ports_by_number() {
        let mut host = Host::new("aa:bb:cc:dd:ee:ff");
        host.add_port(Port {
            number: 80,
            protocol: "tcp".to_string(),
            state: "open".to_string(),
            service: "http".to_string(),
            version: String::new(),
        });

        let mut update = Host::new("aa:bb:cc:dd:ee:ff");
        update.add_port(Port {
            number: 80,
            protocol: "tcp".to_string(),
            state: "open".to_string(),
            service: String::new(),
            version: "nginx 1.24".to_string(),
        });
        update.add_port(Port::new(443, "tcp"));

        host.merge(update);

        assert_eq!(host.ports.len(), 2);
        let http = &host.ports[&80];
        assert_eq!(http.service, "http");
        assert_eq!(http.version, "nginx 1.24");
    }

    #[test]
    fn test_merge_findings_replace_same_cve_and_port() {
        let mut host = Host::new("aa:bb:cc:dd:ee:ff");
        host.add_finding(Vulnerability {
            cve: "CVE-2024-0001".to_string(),
            description: "old".to_string(),
            state: "VULNERABLE".to_string(),
            category: FindingCategory::Critical,
            port: Some(22),
        });

        let mut update = Host::new("aa:bb:cc:dd:ee:ff");
        update.add_finding(Vulnerability {
            cve: "CVE-2024-0001".to_string(),
            description: "new".to_string(),
            state: "VULNERABLE".to_string(),
            category: FindingCategory::Critical,
            port: Some(22),
        });
        update.add_finding(Vulnerability {
            cve: "CVE-2024-0001".to_string(),
            description: "other port".to_string(),
            state: "VULNERABLE".to_string(),
            category: FindingCategory::Critical,
            port: Some(2222),
        });
        host.merge(update);

        let critical = &host.findings[&FindingCategory::Critical];
        assert_eq!(critical.len(), 2);
        assert_eq!(critical[0].description, "new");
        assert!(host.has_findings());
    }

    #[test]
    fn test_merge_communications_keeps_geo() {
        let mut host = Host::new("aa:bb:cc:dd:ee:ff");
        host.record_communication("8.8.8.8", 3);
        host.communications.get_mut("8.8.8.8").unwrap().geo = Some(GeoInfo {
            country: "US".to_string(),
            city: "Mountain View".to_string(),
            isp: "Google".to_string(),
        });

        let mut update = Host::new("aa:bb:cc:dd:ee:ff");
        update.record_communication("8.8.8.8", 10);
        host.merge(update);

        let comm = &host.communications["8.8.8.8"];
        assert_eq!(comm.packet_count, 10);
        assert_eq!(comm.geo.as_ref().unwrap().country, "US");
    }

    #[test]
    fn test_primary_ip_is_smallest() {
        let mut host = create_host("aa:bb:cc:dd:ee:ff", "10.0.0.9");
        host.add_ip("10.0.0.10");
        host.add_ip("0.0.0.0");
        host.add_ip("");
        assert_eq!(host.primary_ip(), Some("10.0.0.10"));
        assert_eq!(host.ipv4_addresses.len(), 2);
    }

    #[test]
    fn test_clues_round_trip_through_joined_form() {
        let mut fp = Fingerprint::default();
        fp.behavioral_clues.insert("uses mDNS".to_string());
        fp.behavioral_clues.insert("DHCP client".to_string());
        let joined = fp.clues_joined();
        assert_eq!(joined, "DHCP client, uses mDNS");
        let mut restored = Fingerprint::default();
        restored.set_clues_from_joined(&joined);
        assert_eq!(restored.behavioral_clues, fp.behavioral_clues);
    }
}
