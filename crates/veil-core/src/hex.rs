//! Hex encoding/decoding helpers (no external dep needed, just a small impl).
//!
//! Used for drive/authorization ids in sequencer store keys and user-facing
//! authorization strings.

use crate::error::{VeilError, VeilResult};

pub fn encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for byte in data {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

pub fn decode(s: &str) -> VeilResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(VeilError::Format("odd-length hex string".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| VeilError::Format(format!("invalid hex: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let data = [0u8, 1, 0xab, 0xff, 0x10];
        let s = encode(&data);
        assert_eq!(s, "0001abff10");
        assert_eq!(decode(&s).unwrap(), data);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        assert!(decode("abc").is_err());
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        assert!(decode("zz").is_err());
    }

    #[test]
    fn test_case_insensitive_decode() {
        assert_eq!(decode("AbFf").unwrap(), vec![0xab, 0xff]);
    }
}
