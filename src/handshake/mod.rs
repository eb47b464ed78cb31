pub mod eapol;
pub mod hccapx;
pub mod tracker;

pub use eapol::*;
pub use hccapx::*;
pub use tracker::*;

use crate::netmap::{NetworkMap, PcapSummary};
use tracing::info;

/// Turns the buffered EAPOL frames of a run into handshake records and tags
/// the client hosts with the best completeness seen for them.
pub fn finalize_handshakes(map: &mut NetworkMap, summary: &mut PcapSummary) -> usize {
    let mut tracker = std::mem::take(&mut summary.eapol_tracker);
    summary.malformed_frames += tracker.malformed();

    let handshakes = tracker.finalize(&summary.advertised_aps);
    for handshake in &handshakes {
        if let Some(host) = map.get_mut(&handshake.client_mac) {
            let wifi = host.wifi_mut();
            if wifi.handshake_state.map_or(true, |s| s < handshake.state) {
                wifi.handshake_state = Some(handshake.state);
            }
            if wifi.associated_ap.is_empty() {
                wifi.associated_ap = handshake.ap_mac.clone();
            }
        }
    }

    let count = handshakes.len();
    if count > 0 {
        info!("Finalized {} handshake(s)", count);
    }
    summary.handshakes.extend(handshakes);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::eapol::tests::key_frame;
    use crate::netmap::{Host, HandshakeState};

    #[test]
    fn test_finalize_tags_client_host() {
        let mut map = NetworkMap::new();
        map.merge_observation(Host::new("11:22:33:44:55:66"));
        let mut summary = PcapSummary::new();
        summary.add_advertised_ap("aa:bb:cc:dd:ee:ff", "lab");
        for message in 1..=4u8 {
            summary.eapol_tracker.push(
                "aa:bb:cc:dd:ee:ff",
                "11:22:33:44:55:66",
                &key_frame(message, message),
                "a.pcap",
            );
        }
        // Partial exchange for a client that is not in the map
        summary.eapol_tracker.push(
            "aa:bb:cc:dd:ee:ff",
            "22:22:22:22:22:22",
            &key_frame(1, 9),
            "a.pcap",
        );
        summary
            .eapol_tracker
            .push("aa:bb:cc:dd:ee:ff", "11:22:33:44:55:66", &[0x02, 0x03], "a.pcap");

        assert_eq!(finalize_handshakes(&mut map, &mut summary), 2);
        assert_eq!(summary.handshakes.len(), 2);
        assert_eq!(summary.malformed_frames, 1);

        let wifi = map.get("11:22:33:44:55:66").unwrap().wifi.as_ref().unwrap();
        assert_eq!(wifi.handshake_state, Some(HandshakeState::Full));
        assert_eq!(wifi.associated_ap, "aa:bb:cc:dd:ee:ff");

        assert_eq!(finalize_handshakes(&mut map, &mut summary), 0);
    }
}
