#[cfg(test)]
use rand::{distributions::Alphanumeric, Rng};

/// Generate random string id of `length`, used during tests
#[cfg(test)]
pub fn generate_random_id(length: usize) -> String {
    let rng = rand::thread_rng();
    let id: String = rng.sample_iter(&Alphanumeric).take(length).map(char::from).collect();
    id
}

/// Renders a byte key for logging, escaping non-printable bytes
pub fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key {
        if b.is_ascii_graphic() || *b == b' ' {
            out.push(*b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}

/// Big-endian version encoding used inside durable feed keys so that byte
/// order equals numeric order
pub fn encode_version_be(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

pub fn decode_version_be(bytes: &[u8]) -> Option<u64> {
    if bytes.len() != 8 {
        return None;
    }
    Some(u64::from_be_bytes(bytes.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable() {
        assert_eq!(printable(b"abc"), "abc");
        assert_eq!(printable(b"\xff\xffID"), "\\xff\\xffID");
    }

    #[test]
    fn test_version_round_trip() {
        let v = 123_456_789_u64;
        assert_eq!(decode_version_be(&encode_version_be(v)), Some(v));
        assert_eq!(decode_version_be(b"short"), None);
    }

    #[test]
    fn test_version_order_matches_byte_order() {
        assert!(encode_version_be(1) < encode_version_be(2));
        assert!(encode_version_be(255) < encode_version_be(256));
    }
}
