use crate::handshake::eapol::EapolKey;
use crate::handshake::hccapx::HccapxRecord;
use crate::netmap::mac::identity_key;
use crate::netmap::summary::{Handshake, HandshakeState};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

const ALL_MESSAGES: u8 = 0x0f;

#[derive(Debug, Clone)]
struct TrackedFrame {
    source: String,
    key: EapolKey,
}

/// Pending EAPOL-Key frames, buffered per (AP, client) pair in arrival order
/// until `finalize` is called once capture is over.
#[derive(Debug, Default)]
pub struct EapolTracker {
    pairs: BTreeMap<(String, String), Vec<TrackedFrame>>,
    malformed: u64,
}

impl EapolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers one 802.1X frame for the pair. Returns false when the frame was not a handshake message.
    pub fn push(&mut self, ap_mac: &str, client_mac: &str, frame: &[u8], source: &str) -> bool {
        match EapolKey::parse(frame) {
            Ok(key) => {
                self.pairs
                    .entry((identity_key(ap_mac), identity_key(client_mac)))
                    .or_default()
                    .push(TrackedFrame {
                        source: source.to_string(),
                        key,
                    });
                true
            }
            Err(e) => {
                if e.is_malformed() {
                    self.malformed += 1;
                    debug!("Skipping EAPOL frame {} -> {}: {}", ap_mac, client_mac, e);
                }
                false
            }
        }
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn frame_count(&self) -> usize {
        self.pairs.values().map(|frames| frames.len()).sum()
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    pub fn absorb(&mut self, other: EapolTracker) {
        for (pair, frames) in other.pairs {
            self.pairs.entry(pair).or_default().extend(frames);
        }
        self.malformed += other.malformed;
    }

    /// Drains every buffered pair into handshake records, one per SSID the AP advertised.
    /// Calling it again, or on an empty tracker, yields nothing.
    pub fn finalize(
        &mut self,
        advertised_aps: &BTreeMap<String, BTreeSet<String>>,
    ) -> Vec<Handshake> {
        let pairs = std::mem::take(&mut self.pairs);
        let mut handshakes = Vec::new();

        for ((ap_mac, client_mac), frames) in pairs {
            if frames.is_empty() {
                continue;
            }

            let mut seen: u8 = 0;
            for frame in &frames {
                seen |= 1 << (frame.key.message - 1);
            }
            let state = if seen == ALL_MESSAGES {
                HandshakeState::Full
            } else {
                HandshakeState::Partial
            };

            let messages = select_messages(&frames);
            let ssids: Vec<String> = match advertised_aps.get(&ap_mac) {
                Some(ssids) if !ssids.is_empty() => ssids.iter().cloned().collect(),
                _ => vec![String::new()],
            };

            for ssid in ssids {
                let record = HccapxRecord::from_messages(&ssid, &ap_mac, &client_mac, &messages);
                info!(
                    "{} handshake AP {} client {} SSID '{}' ({} frames)",
                    state,
                    ap_mac,
                    client_mac,
                    ssid,
                    frames.len()
                );
                handshakes.push(Handshake {
                    id: 0,
                    client_mac: client_mac.clone(),
                    ap_mac: ap_mac.clone(),
                    ssid,
                    pcap_file: frames[0].source.clone(),
                    key_data: record.to_bytes(),
                    state,
                });
            }
        }
        handshakes
    }
}

// First M2 wins; M1 is the one sharing its replay counter when there is one.
fn select_messages(frames: &[TrackedFrame]) -> [Option<&EapolKey>; 4] {
    let first = |message: u8| {
        frames
            .iter()
            .map(|f| &f.key)
            .find(|k| k.message == message)
    };
    let m2 = first(2);
    let m1 = m2
        .and_then(|m2| {
            frames
                .iter()
                .map(|f| &f.key)
                .find(|k| k.message == 1 && k.replay_counter == m2.replay_counter)
        })
        .or_else(|| first(1));
    [m1, m2, first(3), first(4)]
}
