use thiserror::Error;

pub const EAPOL_HEADER_LEN: usize = 4;
// Key descriptor up to and including the key data length field
pub const KEY_DESCRIPTOR_LEN: usize = 95;
pub const EAPOL_TYPE_KEY: u8 = 3;

// Offsets inside the key descriptor body
const REPLAY_COUNTER: std::ops::Range<usize> = 5..13;
const NONCE: std::ops::Range<usize> = 13..45;
const MIC: std::ops::Range<usize> = 77..93;

/// Offset of the MIC inside a full 802.1X frame (header included).
pub const MIC_OFFSET_IN_FRAME: usize = EAPOL_HEADER_LEN + 77;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EapolParseError {
    #[error("frame truncated: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
    #[error("not an EAPOL-Key frame (type {0})")]
    NotKey(u8),
    #[error("key information {0:#06x} does not map to a handshake message")]
    UnknownMessage(u16),
    #[error("group key frame (key information {0:#06x})")]
    GroupKey(u16),
}

impl EapolParseError {
    /// Non-key EAPOL traffic (start, logoff, EAP) and group key exchanges are
    /// legitimate and not counted as malformed.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, EapolParseError::NotKey(_) | EapolParseError::GroupKey(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub version: u8,
    pub pairwise: bool,
    pub install: bool,
    pub ack: bool,
    pub mic: bool,
    pub secure: bool,
}

impl KeyInfo {
    pub fn from_u16(val: u16) -> Self {
        KeyInfo {
            version: (val & 0x07) as u8,
            pairwise: val & 0x08 != 0,
            install: val & 0x40 != 0,
            ack: val & 0x80 != 0,
            mic: val & 0x100 != 0,
            secure: val & 0x200 != 0,
        }
    }

    /// Position of the frame in the 4-way exchange, 0 when it is none of them.
    /// Only pairwise frames belong to the 4-way exchange.
    pub fn message_number(&self) -> u8 {
        if !self.pairwise {
            return 0;
        }
        match (self.ack, self.mic, self.secure, self.install) {
            (true, false, false, false) => 1,
            (false, true, false, false) => 2,
            (true, true, true, true) => 3,
            (false, true, true, false) => 4,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapolKey {
    pub key_info: KeyInfo,
    pub replay_counter: u64,
    pub nonce: [u8; 32],
    pub mic: [u8; 16],
    pub message: u8,
    // Whole 802.1X frame, trailing padding removed
    pub raw: Vec<u8>,
}

impl EapolKey {
    /// Parses an 802.1X frame starting at its version byte.
    pub fn parse(frame: &[u8]) -> Result<Self, EapolParseError> {
        if frame.len() < EAPOL_HEADER_LEN {
            return Err(EapolParseError::Truncated {
                got: frame.len(),
                need: EAPOL_HEADER_LEN,
            });
        }
        if frame[1] != EAPOL_TYPE_KEY {
            return Err(EapolParseError::NotKey(frame[1]));
        }

        let body_length = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        let total = EAPOL_HEADER_LEN + body_length;
        if body_length < KEY_DESCRIPTOR_LEN || frame.len() < total {
            return Err(EapolParseError::Truncated {
                got: frame.len(),
                need: total.max(EAPOL_HEADER_LEN + KEY_DESCRIPTOR_LEN),
            });
        }

        let body = &frame[EAPOL_HEADER_LEN..total];
        let raw_info = u16::from_be_bytes([body[1], body[2]]);
        let key_info = KeyInfo::from_u16(raw_info);
        if !key_info.pairwise {
            return Err(EapolParseError::GroupKey(raw_info));
        }
        let message = key_info.message_number();
        if message == 0 {
            return Err(EapolParseError::UnknownMessage(raw_info));
        }

        let mut counter = [0u8; 8];
        counter.copy_from_slice(&body[REPLAY_COUNTER]);
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&body[NONCE]);
        let mut mic = [0u8; 16];
        mic.copy_from_slice(&body[MIC]);

        Ok(EapolKey {
            key_info,
            replay_counter: u64::from_be_bytes(counter),
            nonce,
            mic,
            message,
            raw: frame[..total].to_vec(),
        })
    }

    /// Frames sent by the authenticator carry the Key ACK bit.
    pub fn from_access_point(&self) -> bool {
        self.key_info.ack
    }
}
