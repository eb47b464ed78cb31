use crate::netmap::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dns_parser::Packet as DnsPacket;
use lazy_static::lazy_static;
use pnet_packet::arp::ArpPacket;
use pnet_packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::{TcpFlags, TcpPacket};
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet as PnetPacket;
use regex::Regex;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

pub const ETHERTYPE_EAPOL: u16 = 0x888e;
const LLC_SNAP_HEADER: [u8; 6] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00];
const DOT11_HEADER_LEN: usize = 24;
// Timestamp, beacon interval and capability info
const BEACON_FIXED_LEN: usize = 12;

// Unanswered USER commands remembered per decoder, oldest dropped first
const MAX_PENDING_USERS: usize = 256;

const ACCESS_POINT: &str = "Access Point";
const CLIENT: &str = "Client";

lazy_static! {
    static ref USER_CMD: Regex = Regex::new(r"(?i)^USER\s+(\S+)").unwrap();
    static ref PASS_CMD: Regex = Regex::new(r"(?i)^PASS\s+(\S+)").unwrap();
    static ref IMAP_LOGIN: Regex =
        Regex::new(r#"(?i)^\S+\s+LOGIN\s+"?([^"\s]+)"?\s+"?([^"\s]+)"?"#).unwrap();
    static ref HTTP_BASIC: Regex =
        Regex::new(r"(?im)^Authorization:\s*Basic\s+([A-Za-z0-9+/=]+)").unwrap();
}

/// Link layer of the frames handed to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Radiotap,
    Ieee80211,
}

impl LinkType {
    /// Maps a libpcap DLT value.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkType::Ethernet),
            105 => Some(LinkType::Ieee80211),
            127 => Some(LinkType::Radiotap),
            _ => None,
        }
    }
}

/// Folds captured frames into a session's network map and summary.
/// One decoder per capture file or live session; it remembers the pending
/// `USER` commands needed to pair cleartext logins, up to a fixed number of flows.
pub struct FrameDecoder {
    source: String,
    pending_users: VecDeque<(String, String)>,
}

impl FrameDecoder {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            pending_users: VecDeque::new(),
        }
    }

    fn remember_user(&mut self, flow: String, user: String) {
        self.pending_users.retain(|(pending, _)| *pending != flow);
        if self.pending_users.len() >= MAX_PENDING_USERS {
            if let Some((dropped, _)) = self.pending_users.pop_front() {
                trace!("Forgetting unanswered USER on {}", dropped);
            }
        }
        self.pending_users.push_back((flow, user));
    }

    fn take_user(&mut self, flow: &str) -> Option<String> {
        let index = self
            .pending_users
            .iter()
            .position(|(pending, _)| pending == flow)?;
        self.pending_users.remove(index).map(|(_, user)| user)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn decode(
        &mut self,
        link: LinkType,
        data: &[u8],
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) {
        summary.total_packets += 1;
        match link {
            LinkType::Ethernet => self.decode_ethernet(data, map, summary),
            LinkType::Radiotap => match strip_radiotap(data) {
                Some(frame) => self.decode_dot11(frame, map, summary),
                None => malformed(summary, "radiotap header"),
            },
            LinkType::Ieee80211 => self.decode_dot11(data, map, summary),
        }
    }

    fn decode_ethernet(&mut self, data: &[u8], map: &mut NetworkMap, summary: &mut PcapSummary) {
        let ethernet = match EthernetPacket::new(data) {
            Some(packet) => packet,
            None => return malformed(summary, "ethernet frame"),
        };
        let src_bytes = &data[6..12];
        let src_mac = match mac_from_bytes(src_bytes) {
            Some(mac) => mac,
            None => return malformed(summary, "ethernet source"),
        };
        let unicast_src = src_bytes[0] & 0x01 == 0;

        match ethernet.get_ethertype() {
            EtherTypes::Ipv4 => {
                let ipv4 = match Ipv4Packet::new(ethernet.payload()) {
                    Some(packet) => packet,
                    None => return malformed(summary, "IPv4 packet"),
                };
                self.decode_ipv4(&src_mac, unicast_src, &ipv4, map, summary);
            }
            EtherTypes::Arp => {
                summary.count_protocol("ARP");
                let arp = match ArpPacket::new(ethernet.payload()) {
                    Some(packet) => packet,
                    None => return malformed(summary, "ARP packet"),
                };
                let sender = identity_key(&arp.get_sender_hw_addr().to_string());
                let sender_ip = arp.get_sender_proto_addr();
                if unicast_src && !sender_ip.is_unspecified() {
                    self.observe_host(&sender, Some(sender_ip), map, summary);
                } else if unicast_src {
                    self.note_unidentified(&src_mac, map, summary);
                }
            }
            EtherTypes::Ipv6 => {
                summary.count_protocol("IPv6");
                if unicast_src {
                    self.note_unidentified(&src_mac, map, summary);
                }
            }
            EtherType(ETHERTYPE_EAPOL) => {
                summary.count_protocol("EAPOL");
                let dst_mac = mac_from_bytes(&data[0..6]).unwrap_or_default();
                let (ap, client) = match crate::handshake::EapolKey::parse(ethernet.payload()) {
                    Ok(key) if key.from_access_point() => (src_mac.clone(), dst_mac),
                    _ => (dst_mac, src_mac.clone()),
                };
                summary
                    .eapol_tracker
                    .push(&ap, &client, ethernet.payload(), &self.source);
            }
            _ => {
                summary.count_protocol("Other");
                if unicast_src {
                    self.note_unidentified(&src_mac, map, summary);
                }
            }
        }
    }

    fn decode_ipv4(
        &mut self,
        src_mac: &str,
        unicast_src: bool,
        ipv4: &Ipv4Packet,
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) {
        let src_ip = ipv4.get_source();
        let dst_ip = ipv4.get_destination();
        let host_key = if unicast_src && !src_ip.is_unspecified() {
            self.observe_host(src_mac, Some(src_ip), map, summary)
        } else {
            None
        };
        if let Some(host) = host_key.as_deref().and_then(|key| map.get_mut(key)) {
            host.record_communication(&dst_ip.to_string(), 1);
        }

        match ipv4.get_next_level_protocol() {
            IpNextHeaderProtocols::Tcp => {
                summary.count_protocol("TCP");
                let tcp = match TcpPacket::new(ipv4.payload()) {
                    Some(packet) => packet,
                    None => return malformed(summary, "TCP segment"),
                };
                let flags = tcp.get_flags();
                if flags & TcpFlags::SYN != 0 && flags & TcpFlags::ACK != 0 {
                    if let Some(host) = host_key.as_deref().and_then(|key| map.get_mut(key)) {
                        let number = tcp.get_source();
                        trace!("Open port {}/tcp on {}", number, src_ip);
                        host.add_port(Port {
                            number,
                            protocol: "tcp".to_string(),
                            state: "open".to_string(),
                            service: service_for_port(number, "tcp").to_string(),
                            version: String::new(),
                        });
                    }
                }
                let payload = tcp.payload();
                if !payload.is_empty() {
                    self.sniff_credentials(src_mac, src_ip, dst_ip, tcp.get_destination(), payload, summary);
                }
            }
            IpNextHeaderProtocols::Udp => {
                summary.count_protocol("UDP");
                let udp = match UdpPacket::new(ipv4.payload()) {
                    Some(packet) => packet,
                    None => return malformed(summary, "UDP datagram"),
                };
                if udp.get_destination() == 53 {
                    if let Some(domain) = dns_query_name(udp.payload()) {
                        if let Some(host) = host_key.as_deref().and_then(|key| map.get_mut(key)) {
                            debug!("DNS query from {} for {}", src_ip, domain);
                            host.dns_lookups.insert(domain);
                        }
                    }
                }
            }
            IpNextHeaderProtocols::Icmp => summary.count_protocol("ICMP"),
            _ => summary.count_protocol("Other"),
        }
    }

    fn sniff_credentials(
        &mut self,
        sender_mac: &str,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
        summary: &mut PcapSummary,
    ) {
        let text = String::from_utf8_lossy(payload);
        let endpoint = format!("{}:{}", dst_ip, dst_port);
        let mut found: Vec<(&str, String)> = Vec::new();

        if let Some(caps) = HTTP_BASIC.captures(&text) {
            if let Ok(decoded) = STANDARD.decode(&caps[1]) {
                found.push(("HTTP Basic", String::from_utf8_lossy(&decoded).to_string()));
            }
        }

        for line in text.lines().map(|line| line.trim()) {
            match dst_port {
                21 | 110 => {
                    let kind = if dst_port == 21 { "FTP" } else { "POP3" };
                    let flow = format!("{}>{}", src_ip, endpoint);
                    if let Some(caps) = USER_CMD.captures(line) {
                        self.remember_user(flow, caps[1].to_string());
                    } else if let Some(caps) = PASS_CMD.captures(line) {
                        let value = match self.take_user(&flow) {
                            Some(user) => format!("{}:{}", user, &caps[1]),
                            None => caps[1].to_string(),
                        };
                        found.push((kind, value));
                    }
                }
                143 => {
                    if let Some(caps) = IMAP_LOGIN.captures(line) {
                        found.push(("IMAP", format!("{}:{}", &caps[1], &caps[2])));
                    }
                }
                _ => {}
            }
        }

        for (kind, value) in found {
            debug!("Captured {} credential from {} towards {}", kind, sender_mac, endpoint);
            summary.credentials.push(Credential {
                host_mac: sender_mac.to_string(),
                endpoint: endpoint.clone(),
                credential_type: kind.to_string(),
                value,
                pcap_file: self.source.clone(),
                ..Default::default()
            });
        }
    }

    fn decode_dot11(&mut self, frame: &[u8], map: &mut NetworkMap, summary: &mut PcapSummary) {
        if frame.len() < 2 {
            return malformed(summary, "802.11 frame control");
        }
        summary.count_protocol("802.11");
        let frame_type = (frame[0] >> 2) & 0x03;
        let subtype = frame[0] >> 4;
        let flags = frame[1];

        match frame_type {
            // Management
            0 => {
                if frame.len() < DOT11_HEADER_LEN {
                    return malformed(summary, "802.11 management header");
                }
                let transmitter = mac_from_bytes(&frame[10..16]).unwrap_or_default();
                let bssid = mac_from_bytes(&frame[16..22]).unwrap_or_default();
                match subtype {
                    // Beacon and probe response
                    8 | 5 => {
                        let Some(elements) = frame.get(DOT11_HEADER_LEN + BEACON_FIXED_LEN..) else {
                            return malformed(summary, "beacon body");
                        };
                        let ssid = ssid_element(elements).unwrap_or_default();
                        summary.add_advertised_ap(&bssid, &ssid);
                        let mut ap = Host::new(&bssid);
                        ap.status = HostStatus::Up;
                        ap.discovered_by = "pcap".to_string();
                        let wifi = ap.wifi_mut();
                        wifi.device_role = ACCESS_POINT.to_string();
                        wifi.ssid = ssid;
                        self.merge_wireless(ap, map, summary);
                    }
                    // Probe request
                    4 => {
                        if frame[10] & 0x01 != 0 {
                            return;
                        }
                        let ssid = ssid_element(&frame[DOT11_HEADER_LEN..]).unwrap_or_default();
                        summary.add_probe_request(&transmitter, &ssid);
                        let mut client = Host::new(&transmitter);
                        client.status = HostStatus::Up;
                        client.discovered_by = "pcap".to_string();
                        let wifi = client.wifi_mut();
                        wifi.device_role = CLIENT.to_string();
                        if !ssid.is_empty() {
                            wifi.probe_requests.insert(ssid);
                        }
                        self.merge_wireless(client, map, summary);
                    }
                    _ => {}
                }
            }
            // Data
            2 => self.decode_dot11_data(frame, subtype, flags, map, summary),
            _ => {}
        }
    }

    fn decode_dot11_data(
        &mut self,
        frame: &[u8],
        subtype: u8,
        flags: u8,
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) {
        if frame.len() < DOT11_HEADER_LEN {
            return malformed(summary, "802.11 data header");
        }
        let to_ds = flags & 0x01 != 0;
        let from_ds = flags & 0x02 != 0;
        let protected = flags & 0x40 != 0;

        let (bssid_range, station_range) = match (to_ds, from_ds) {
            (true, false) => (4..10, 10..16),
            (false, true) => (10..16, 4..10),
            (false, false) => (16..22, 10..16),
            // Bridged frames carry no station of ours
            (true, true) => return,
        };
        let station_bytes = &frame[station_range];
        if station_bytes[0] & 0x01 != 0 || protected {
            return;
        }
        let bssid = mac_from_bytes(&frame[bssid_range]).unwrap_or_default();
        let station = mac_from_bytes(station_bytes).unwrap_or_default();

        let mut header_len = DOT11_HEADER_LEN;
        if subtype & 0x08 != 0 {
            // QoS control
            header_len += 2;
        }
        let Some(body) = frame.get(header_len..) else {
            return malformed(summary, "802.11 data body");
        };
        if body.len() < 8 || body[..6] != LLC_SNAP_HEADER {
            return;
        }
        if u16::from_be_bytes([body[6], body[7]]) != ETHERTYPE_EAPOL {
            return;
        }

        summary.count_protocol("EAPOL");
        summary
            .eapol_tracker
            .push(&bssid, &station, &body[8..], &self.source);

        let mut client = Host::new(&station);
        client.discovered_by = "pcap".to_string();
        let wifi = client.wifi_mut();
        wifi.device_role = CLIENT.to_string();
        wifi.associated_ap = bssid.clone();
        if let Some(ssid) = summary.ssid_for_ap(&bssid) {
            wifi.ssid = ssid.to_string();
        }
        self.merge_wireless(client, map, summary);
    }

    fn observe_host(
        &self,
        mac: &str,
        ip: Option<Ipv4Addr>,
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) -> Option<String> {
        let mut host = Host::new(mac);
        if let Some(ip) = ip {
            host.add_ip(&ip.to_string());
        }
        host.status = HostStatus::Up;
        host.discovered_by = "pcap".to_string();
        let key = map.merge_observation(host)?;
        summary.unidentified_macs.remove(&key);
        Some(key)
    }

    fn merge_wireless(&self, host: Host, map: &mut NetworkMap, summary: &mut PcapSummary) {
        if let Some(key) = map.merge_observation(host) {
            summary.unidentified_macs.remove(&key);
        }
    }

    fn note_unidentified(&self, mac: &str, map: &NetworkMap, summary: &mut PcapSummary) {
        if map.get(mac).is_none() {
            summary
                .unidentified_macs
                .entry(mac.to_string())
                .or_insert_with(|| self.source.clone());
        }
    }
}

fn malformed(summary: &mut PcapSummary, what: &str) {
    summary.malformed_frames += 1;
    trace!("Malformed {}", what);
}

/// 802.11 frame behind a radiotap header.
fn strip_radiotap(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 4 || data[0] != 0 {
        return None;
    }
    let len = u16::from_le_bytes([data[2], data[3]]) as usize;
    if len < 8 {
        return None;
    }
    data.get(len..)
}

// SSID information element, empty for hidden networks
fn ssid_element(mut elements: &[u8]) -> Option<String> {
    while elements.len() >= 2 {
        let id = elements[0];
        let len = elements[1] as usize;
        let value = elements.get(2..2 + len)?;
        if id == 0 {
            if value.iter().all(|b| *b == 0) {
                return Some(String::new());
            }
            return Some(String::from_utf8_lossy(value).to_string());
        }
        elements = &elements[2 + len..];
    }
    None
}

fn dns_query_name(payload: &[u8]) -> Option<String> {
    let packet = match DnsPacket::parse(payload) {
        Ok(packet) => packet,
        Err(e) => {
            trace!("Failed to parse DNS packet: {}", e);
            return None;
        }
    };
    if !packet.header.query {
        return None;
    }
    let domain = packet.questions.first()?.qname.to_string();
    if domain.ends_with(".in-addr.arpa") || domain.ends_with(".ip6.arpa") {
        return None;
    }
    Some(domain)
}
