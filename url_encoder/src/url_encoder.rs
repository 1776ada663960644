use std::fmt::Write;

/// Percent-encodes raw bytes, rendering every byte as `%XX`.
///
/// Tracker query parameters carrying binary values (`info_hash`, `peer_id`)
/// must be encoded this way regardless of whether a byte would be a legal
/// URL character.
pub fn encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        // writing to a String cannot fail
        let _ = write!(&mut encoded, "%{:02X}", b);
    }
    encoded
}

/// Takes a hex string ("a1b2…") and applies percent-encoding to the bytes it
/// spells, returning "%a1%b2…".
pub fn encode_hex_str(hex_string: &str) -> String {
    if hex_string.is_empty() {
        return hex_string.to_string();
    }
    let mut encoded = hex_string
        .chars()
        .collect::<Vec<char>>()
        .chunks(2)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<String>>()
        .join("%");
    encoded.insert(0, '%');
    encoded
}
