// SPDX-License-Identifier: LGPL-2.1-or-later

//! Quirk lookup: instance-ID strings map to sets of key/value effects.
//!
//! Matching is case-insensitive on the whole instance ID. Several keys may
//! apply to one ID; effects are additive and their order is unspecified.
//! A missing quirk never fails a probe.

use std::collections::HashMap;

use log::debug;

use crate::{FwError, ResultFw};

/// In-memory quirk source
#[derive(Debug, Default)]
pub struct QuirkDb {
    entries: HashMap<String, Vec<(String, String)>>,
}

impl QuirkDb {
    #[must_use]
    pub fn new() -> Self {
        QuirkDb::default()
    }

    /// Register one effect for an instance ID
    pub fn add(&mut self, instance_id: &str, key: &str, value: &str) {
        self.entries
            .entry(instance_id.to_ascii_lowercase())
            .or_default()
            .push((key.to_owned(), value.to_owned()));
    }

    /// All effects registered for an instance ID, or an empty slice
    #[must_use]
    pub fn lookup(&self, instance_id: &str) -> &[(String, String)] {
        self.entries
            .get(&instance_id.to_ascii_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    /// Load an ini-style quirk snippet: `[InstanceId]` sections of `Key = Value`
    pub fn load_from_str(&mut self, text: &str) -> ResultFw<()> {
        let mut section: Option<String> = None;
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let header = header.strip_suffix(']').ok_or_else(|| {
                    FwError::InvalidFile(format!("unterminated section on line {}", lineno + 1))
                })?;
                section = Some(header.to_owned());
                continue;
            }
            let Some(section) = section.as_deref() else {
                return Err(FwError::InvalidFile(format!(
                    "key outside of section on line {}",
                    lineno + 1
                )));
            };
            let Some((key, value)) = line.split_once('=') else {
                return Err(FwError::InvalidFile(format!(
                    "expected key=value on line {}",
                    lineno + 1
                )));
            };
            self.add(section, key.trim(), value.trim());
        }
        debug!("loaded {} quirk entries", self.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut db = QuirkDb::new();
        db.add("USB\\VID_17EF&PID_61EB", "Flags", "updatable");
        db.add("USB\\VID_17EF&PID_61EB", "RemoveDelayMs", "5000");
        let hits = db.lookup("usb\\vid_17ef&pid_61eb");
        assert_eq!(hits.len(), 2);
        assert!(db.lookup("USB\\VID_0000&PID_0000").is_empty());
    }

    #[test]
    fn test_load_ini() {
        let mut db = QuirkDb::new();
        db.load_from_str(
            "# comment\n\
             [USB\\VID_1234&PID_5678]\n\
             Flags = dual-image\n\
             FirmwareSizeMax = 0x10000\n",
        )
        .unwrap();
        let hits = db.lookup("USB\\VID_1234&PID_5678");
        assert_eq!(hits[0], ("Flags".to_owned(), "dual-image".to_owned()));
        assert_eq!(hits[1].1, "0x10000");
        assert!(db.load_from_str("Key = value\n").is_err());
    }
}
