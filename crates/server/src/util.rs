use blake3::Hasher;
use rand::RngCore;
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Opaque identifier derived from a context label, the clock and
/// fresh entropy. Collision-free for all practical purposes.
pub fn generate_id(context: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    if let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) {
        hasher.update(&elapsed.as_nanos().to_le_bytes());
    }
    let mut entropy = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut entropy);
    hasher.update(&entropy);
    encode_hex(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encodes_known_bytes() {
        assert_eq!(encode_hex(&[1u8, 2, 3, 254]), "010203fe");
        assert_eq!(encode_hex(&[]), "");
    }

    #[test]
    fn generated_ids_do_not_repeat() {
        let first = generate_id("session:alice");
        let second = generate_id("session:alice");
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
    }
}
