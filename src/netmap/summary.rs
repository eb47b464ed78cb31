use crate::handshake::EapolTracker;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::{Display, EnumString};

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString,
)]
pub enum HandshakeState {
    Partial,
    Full,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Handshake {
    pub id: i64,
    pub client_mac: String,
    pub ap_mac: String,
    pub ssid: String,
    pub pcap_file: String,
    // HCCAPX record
    #[serde(skip_serializing, default)]
    pub key_data: Vec<u8>,
    pub state: HandshakeState,
}

impl Handshake {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.key_data)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Credential {
    pub id: i64,
    pub host_mac: String,
    pub endpoint: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    pub value: String,
    pub pcap_file: String,
    pub campaign_id: i64,
}

/// Accumulator for one capture or processing run.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct PcapSummary {
    pub total_packets: u64,
    pub malformed_frames: u64,
    pub protocol_counts: BTreeMap<String, u64>,
    // BSSID -> advertised SSIDs
    pub advertised_aps: BTreeMap<String, BTreeSet<String>>,
    // Client MAC -> probed SSIDs
    pub probe_requests: BTreeMap<String, BTreeSet<String>>,
    // MAC -> where it was seen
    pub unidentified_macs: BTreeMap<String, String>,
    pub handshakes: Vec<Handshake>,
    pub credentials: Vec<Credential>,
    #[serde(skip)]
    pub eapol_tracker: EapolTracker,
}

impl PcapSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_protocol(&mut self, protocol: &str) {
        *self
            .protocol_counts
            .entry(protocol.to_string())
            .or_insert(0) += 1;
    }

    pub fn add_advertised_ap(&mut self, bssid: &str, ssid: &str) {
        let ssids = self.advertised_aps.entry(bssid.to_string()).or_default();
        if !ssid.is_empty() {
            ssids.insert(ssid.to_string());
        }
    }

    pub fn add_probe_request(&mut self, client_mac: &str, ssid: &str) {
        if ssid.is_empty() {
            return;
        }
        self.probe_requests
            .entry(client_mac.to_string())
            .or_default()
            .insert(ssid.to_string());
    }

    pub fn ssid_for_ap(&self, bssid: &str) -> Option<&str> {
        self.advertised_aps
            .get(bssid)
            .and_then(|ssids| ssids.iter().next())
            .map(|ssid| ssid.as_str())
    }

    pub fn merge(&mut self, other: PcapSummary) {
        self.total_packets += other.total_packets;
        self.malformed_frames += other.malformed_frames;
        for (protocol, count) in other.protocol_counts {
            *self.protocol_counts.entry(protocol).or_insert(0) += count;
        }
        for (bssid, ssids) in other.advertised_aps {
            self.advertised_aps.entry(bssid).or_default().extend(ssids);
        }
        for (mac, ssids) in other.probe_requests {
            self.probe_requests.entry(mac).or_default().extend(ssids);
        }
        for (mac, origin) in other.unidentified_macs {
            self.unidentified_macs.entry(mac).or_insert(origin);
        }
        self.handshakes.extend(other.handshakes);
        self.credentials.extend(other.credentials);
        self.eapol_tracker.absorb(other.eapol_tracker);
    }
}
