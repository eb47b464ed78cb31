use crate::handshake::eapol::{EapolKey, MIC_OFFSET_IN_FRAME};
use eui48::MacAddress;

pub const HCCAPX_SIGNATURE: u32 = 0x5850_4348;
pub const HCCAPX_VERSION: u32 = 4;
pub const HCCAPX_LEN: usize = 393;
pub const HCCAPX_MAX_EAPOL: usize = 256;
const MAX_ESSID: usize = 32;

/// Which two messages of the exchange the record was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePair {
    // EAPOL taken from M2
    M1M2 = 0,
    // EAPOL taken from M4
    M1M4 = 1,
    // EAPOL taken from M2
    M2M3 = 2,
    // EAPOL taken from M4
    M3M4 = 5,
}

/// Fixed size little endian record consumed by offline key recovery tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HccapxRecord {
    pub message_pair: u8,
    pub essid: Vec<u8>,
    pub keyver: u8,
    pub keymic: [u8; 16],
    pub mac_ap: [u8; 6],
    pub nonce_ap: [u8; 32],
    pub mac_sta: [u8; 6],
    pub nonce_sta: [u8; 32],
    pub eapol: Vec<u8>,
}

impl HccapxRecord {
    /// Picks the best available message pair. Missing material stays zero so
    /// partial exchanges still export a well formed record.
    pub fn from_messages(
        essid: &str,
        ap_mac: &str,
        client_mac: &str,
        messages: &[Option<&EapolKey>; 4],
    ) -> Self {
        let [m1, m2, m3, m4] = *messages;

        let (pair, anonce, snonce, eapol_src) = match (m1, m2, m3, m4) {
            (Some(m1), Some(m2), _, _) => (MessagePair::M1M2, Some(m1), Some(m2), Some(m2)),
            (_, Some(m2), Some(m3), _) => (MessagePair::M2M3, Some(m3), Some(m2), Some(m2)),
            (Some(m1), _, _, Some(m4)) => (MessagePair::M1M4, Some(m1), Some(m4), Some(m4)),
            (_, _, Some(m3), Some(m4)) => (MessagePair::M3M4, Some(m3), Some(m4), Some(m4)),
            _ => (
                MessagePair::M1M2,
                m1.or(m3),
                m2.or(m4),
                m2.or(m4),
            ),
        };

        let mut record = HccapxRecord {
            message_pair: pair as u8,
            essid: essid.as_bytes().iter().take(MAX_ESSID).cloned().collect(),
            keyver: 0,
            keymic: [0u8; 16],
            mac_ap: mac_bytes(ap_mac),
            nonce_ap: anonce.map(|k| k.nonce).unwrap_or([0u8; 32]),
            mac_sta: mac_bytes(client_mac),
            nonce_sta: snonce.map(|k| k.nonce).unwrap_or([0u8; 32]),
            eapol: Vec::new(),
        };

        if let Some(src) = eapol_src.or(m1).or(m3) {
            record.keyver = src.key_info.version;
            record.keymic = src.mic;
            let mut eapol: Vec<u8> = src.raw.iter().take(HCCAPX_MAX_EAPOL).cloned().collect();
            if eapol.len() >= MIC_OFFSET_IN_FRAME + 16 {
                for b in eapol[MIC_OFFSET_IN_FRAME..MIC_OFFSET_IN_FRAME + 16].iter_mut() {
                    *b = 0;
                }
            }
            record.eapol = eapol;
        }
        record
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HCCAPX_LEN);
        out.extend_from_slice(&HCCAPX_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&HCCAPX_VERSION.to_le_bytes());
        out.push(self.message_pair);
        out.push(self.essid.len() as u8);
        let mut essid = [0u8; MAX_ESSID];
        essid[..self.essid.len()].copy_from_slice(&self.essid);
        out.extend_from_slice(&essid);
        out.push(self.keyver);
        out.extend_from_slice(&self.keymic);
        out.extend_from_slice(&self.mac_ap);
        out.extend_from_slice(&self.nonce_ap);
        out.extend_from_slice(&self.mac_sta);
        out.extend_from_slice(&self.nonce_sta);
        out.extend_from_slice(&(self.eapol.len() as u16).to_le_bytes());
        let mut eapol = [0u8; HCCAPX_MAX_EAPOL];
        eapol[..self.eapol.len()].copy_from_slice(&self.eapol);
        out.extend_from_slice(&eapol);
        out
    }
}

fn mac_bytes(mac: &str) -> [u8; 6] {
    let mut out = [0u8; 6];
    if let Ok(parsed) = MacAddress::parse_str(mac) {
        out.copy_from_slice(parsed.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::eapol::tests::key_frame;

    const AP: &str = "aa:bb:cc:dd:ee:ff";
    const STA: &str = "11:22:33:44:55:66";

    fn key(message: u8, nonce: u8) -> EapolKey {
        EapolKey::parse(&key_frame(message, nonce)).unwrap()
    }

    #[test]
    fn test_full_exchange_prefers_m1_m2() {
        let (m1, m2, m3, m4) = (key(1, 0xA1), key(2, 0xB2), key(3, 0xA3), key(4, 0x00));
        let record =
            HccapxRecord::from_messages("lab", AP, STA, &[Some(&m1), Some(&m2), Some(&m3), Some(&m4)]);
        assert_eq!(record.message_pair, MessagePair::M1M2 as u8);
        assert_eq!(record.nonce_ap, [0xA1; 32]);
        assert_eq!(record.nonce_sta, [0xB2; 32]);
        assert_eq!(record.keymic, [0xEE; 16]);
        assert_eq!(record.keyver, 2);

        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), HCCAPX_LEN);
        assert_eq!(&bytes[0..4], b"HCPX");
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 4);
        assert_eq!(bytes[9], 3, "essid length");
        assert_eq!(&bytes[10..13], b"lab");
        assert_eq!(&bytes[59..65], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        // MIC is zeroed in the embedded EAPOL frame
        let eapol_start = 393 - 256;
        let mic = &bytes[eapol_start + MIC_OFFSET_IN_FRAME..eapol_start + MIC_OFFSET_IN_FRAME + 16];
        assert!(mic.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pair_preference_without_m1() {
        let (m2, m3) = (key(2, 0xB2), key(3, 0xA3));
        let record = HccapxRecord::from_messages("lab", AP, STA, &[None, Some(&m2), Some(&m3), None]);
        assert_eq!(record.message_pair, MessagePair::M2M3 as u8);
        assert_eq!(record.nonce_ap, [0xA3; 32]);

        let (m3, m4) = (key(3, 0xA3), key(4, 0xC4));
        let record = HccapxRecord::from_messages("lab", AP, STA, &[None, None, Some(&m3), Some(&m4)]);
        assert_eq!(record.message_pair, MessagePair::M3M4 as u8);
        assert_eq!(record.nonce_sta, [0xC4; 32]);
    }

    #[test]
    fn test_single_message_zero_fills() {
        let m1 = key(1, 0xA1);
        let record = HccapxRecord::from_messages("", AP, STA, &[Some(&m1), None, None, None]);
        assert_eq!(record.nonce_ap, [0xA1; 32]);
        assert_eq!(record.nonce_sta, [0u8; 32]);
        assert_eq!(record.keymic, [0u8; 16]);
        assert_eq!(record.to_bytes().len(), HCCAPX_LEN);
    }
}
