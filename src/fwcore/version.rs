// SPDX-License-Identifier: LGPL-2.1-or-later

//! Version formats, raw-to-string conversion and ordering.

use std::cmp::Ordering;

/// How a raw version integer is rendered and compared
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum VersionFormat {
    /// Free-form string, compared segment-wise
    #[default]
    Plain,
    /// Single unsigned number
    Number,
    /// Two parts, `major.minor`
    Pair,
    /// Three parts packed 8.16.8 into a u32
    Triplet,
    /// Four byte-sized parts
    Quad,
    /// Hexadecimal literal
    Hex,
    /// Binary-coded decimal nibble pairs
    Bcd,
}

fn bcd(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

/// Render a raw 16-bit version per format
#[must_use]
pub fn version_from_u16(value: u16, format: VersionFormat) -> String {
    match format {
        VersionFormat::Pair => format!("{}.{}", value >> 8, value & 0xFF),
        VersionFormat::Bcd => format!("{}.{}", bcd((value >> 8) as u8), bcd((value & 0xFF) as u8)),
        VersionFormat::Hex => format!("{value:#06x}"),
        _ => format!("{value}"),
    }
}

/// Render a raw 32-bit version per format
#[must_use]
pub fn version_from_u32(value: u32, format: VersionFormat) -> String {
    match format {
        VersionFormat::Pair => format!("{}.{}", value >> 16, value & 0xFFFF),
        VersionFormat::Triplet => format!(
            "{}.{}.{}",
            (value >> 24) & 0xFF,
            (value >> 16) & 0xFF,
            value & 0xFFFF
        ),
        VersionFormat::Quad => format!(
            "{}.{}.{}.{}",
            (value >> 24) & 0xFF,
            (value >> 16) & 0xFF,
            (value >> 8) & 0xFF,
            value & 0xFF
        ),
        VersionFormat::Bcd => format!(
            "{}.{}.{}.{}",
            bcd((value >> 24) as u8),
            bcd((value >> 16) as u8),
            bcd((value >> 8) as u8),
            bcd((value & 0xFF) as u8)
        ),
        VersionFormat::Hex => format!("{value:#010x}"),
        _ => format!("{value}"),
    }
}

/// Render a raw 64-bit version per format; wide formats consume 16 bits per part
#[must_use]
pub fn version_from_u64(value: u64, format: VersionFormat) -> String {
    match format {
        VersionFormat::Pair => format!("{}.{}", value >> 32, value & 0xFFFF_FFFF),
        VersionFormat::Triplet | VersionFormat::Quad => format!(
            "{}.{}.{}.{}",
            (value >> 48) & 0xFFFF,
            (value >> 32) & 0xFFFF,
            (value >> 16) & 0xFFFF,
            value & 0xFFFF
        ),
        VersionFormat::Hex => format!("{value:#018x}"),
        _ => {
            if value <= u64::from(u32::MAX) {
                version_from_u32(value as u32, format)
            } else {
                format!("{value}")
            }
        }
    }
}

/// Compare two version strings segment-wise.
///
/// Segments that parse as unsigned integers compare numerically, anything
/// else lexicographically; a missing segment loses to a present one.
#[must_use]
pub fn version_compare(left: &str, right: &str, _format: VersionFormat) -> Ordering {
    let mut lhs = left.split('.');
    let mut rhs = right.split('.');
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => {
                let ord = match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(a), Ok(b)) => a.cmp(&b),
                    _ => a.cmp(b),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
