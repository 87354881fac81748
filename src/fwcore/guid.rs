// SPDX-License-Identifier: LGPL-2.1-or-later

//! GUID generation and the mixed-endian byte order used by EFI structures.
//!
//! Instance-ID strings become stable GUIDs through RFC 4122 name-based
//! hashing (SHA-1 in the DNS namespace). On-disk GUIDs in ACPI and vendor
//! tables store the first three fields little-endian.

use uuid::Uuid;

use crate::{FwError, ResultFw};

/// Hash a free-form string into a stable lowercase GUID
#[must_use]
pub fn guid_hash_string(value: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, value.as_bytes())
        .hyphenated()
        .to_string()
}

/// Render 16 mixed-endian bytes as a GUID string
#[must_use]
pub fn guid_from_bytes_mixed(bytes: &[u8; 16]) -> String {
    Uuid::from_bytes_le(*bytes).hyphenated().to_string()
}

/// Parse a GUID string back into mixed-endian bytes
pub fn guid_to_bytes_mixed(value: &str) -> ResultFw<[u8; 16]> {
    let uuid = Uuid::parse_str(value)
        .map_err(|err| FwError::InvalidData(format!("GUID {value} invalid: {err}")))?;
    Ok(uuid.to_bytes_le())
}

/// Whether a 16-byte window plausibly holds a GUID rather than padding
#[must_use]
pub fn guid_is_plausible(bytes: &[u8]) -> bool {
    if bytes.len() < 16 {
        return false;
    }
    let window = &bytes[..16];
    !window.iter().all(|b| *b == 0x00) && !window.iter().all(|b| *b == 0xFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_string_is_stable() {
        // known value pinned so that quirk files keep matching across releases
        assert_eq!(
            guid_hash_string("TOSHIBA THNSN5512GPU7"),
            "e1409b09-50cf-5aef-8ad8-760b9022f88d"
        );
        assert_eq!(guid_hash_string("a"), guid_hash_string("a"));
        assert_ne!(guid_hash_string("a"), guid_hash_string("b"));
    }

    #[test]
    fn test_mixed_endian_roundtrip() {
        let text = "12345678-9abc-def0-1234-56789abcdef0";
        let bytes = guid_to_bytes_mixed(text).unwrap();
        // first three fields are stored little-endian
        assert_eq!(&bytes[0..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&bytes[4..6], &[0xbc, 0x9a]);
        assert_eq!(guid_from_bytes_mixed(&bytes), text);
    }

    #[test]
    fn test_plausible() {
        assert!(!guid_is_plausible(&[0x00; 16]));
        assert!(!guid_is_plausible(&[0xFF; 16]));
        assert!(!guid_is_plausible(&[0x01; 8]));
        let mut bytes = [0u8; 16];
        bytes[3] = 0x42;
        assert!(guid_is_plausible(&bytes));
    }
}
