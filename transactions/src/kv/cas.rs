//! CAS and CRC string forms.
//!
//! The `${Mutation.CAS}` macro is stored as `0x` followed by the eight CAS
//! bytes in little-endian order, which is how a server writes it. CAS values
//! are nanosecond hybrid-logical-clock readings.

use std::fmt::Write;

/// Render a CAS as the macro-expanded string.
#[must_use]
pub fn cas_to_macro_string(cas: u64) -> String {
    let mut out = String::with_capacity(18);
    out.push_str("0x");
    for byte in cas.to_le_bytes() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parse a macro-expanded CAS string back into the CAS value.
#[must_use]
pub fn cas_from_macro_string(s: &str) -> Option<u64> {
    let hex = s.strip_prefix("0x")?;
    if hex.len() != 16 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

/// Milliseconds of the hybrid logical clock reading inside a CAS.
#[must_use]
pub const fn cas_to_millis(cas: u64) -> u64 {
    cas / 1_000_000
}

#[must_use]
pub fn crc32_to_string(crc: u32) -> String {
    format!("0x{crc:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_macro_string_is_little_endian() {
        assert_eq!(cas_to_macro_string(1), "0x0100000000000000");
        assert_eq!(cas_from_macro_string("0x0100000000000000"), Some(1));
    }

    #[test]
    fn test_cas_macro_string_round_trip_realistic() {
        let cas = 1_700_000_000_123_456_789u64;
        let s = cas_to_macro_string(cas);
        assert_eq!(s.len(), 18);
        assert_eq!(cas_from_macro_string(&s), Some(cas));
        assert_eq!(cas_to_millis(cas), 1_700_000_000_123);
    }

    #[test]
    fn test_cas_macro_string_rejects_garbage() {
        assert_eq!(cas_from_macro_string("1234"), None);
        assert_eq!(cas_from_macro_string("0x12"), None);
        assert_eq!(cas_from_macro_string("0xzz00000000000000"), None);
    }

    #[test]
    fn test_crc32_to_string() {
        assert_eq!(crc32_to_string(0xdead_beef), "0xdeadbeef");
        assert_eq!(crc32_to_string(1), "0x00000001");
    }
}
