use eui48::MacAddress;

/// Canonical lowercase, colon separated form used as the identity key of a host.
/// Returns `None` for strings that are not a MAC address.
pub fn normalize_mac(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    MacAddress::parse_str(trimmed)
        .ok()
        .map(|mac| mac.to_hex_string())
}

/// Normalizes when possible, otherwise keeps the identity as given (synthetic keys such as `ip:10.0.0.1`).
pub fn identity_key(input: &str) -> String {
    normalize_mac(input).unwrap_or_else(|| input.trim().to_string())
}

pub fn mac_from_bytes(bytes: &[u8]) -> Option<String> {
    MacAddress::from_bytes(bytes)
        .ok()
        .map(|mac| mac.to_hex_string())
}

pub fn is_broadcast_or_multicast(mac: &[u8; 6]) -> bool {
    mac[0] & 0x01 == 0x01
}
