// SPDX-License-Identifier: LGPL-2.1-or-later

//! Wire abstractions used by devices.
//!
//! Each adapter is a small trait so that device logic can be exercised with
//! in-memory fakes; the concrete implementations talk to real hardware. Every
//! call takes an explicit timeout; timeouts are never retried here, the
//! calling code decides whether one is fatal.

use std::fs;
use std::path::Path;

use crate::{FwError, ResultFw};

pub mod block;
pub mod efivar;
pub mod hid;
pub mod mei;
pub mod usb;

/// Read the `idx`th line of a small pseudo-file, e.g. a sysfs attribute.
///
/// The file is read eagerly; such attributes are well under a page in
/// practice.
pub fn read_sysfs_line(path: &Path, idx: usize) -> ResultFw<String> {
    let text = fs::read_to_string(path)?;
    let lines: Vec<&str> = text.lines().collect();
    lines.get(idx).map(|line| (*line).to_owned()).ok_or_else(|| {
        FwError::InvalidFile(format!("requested line {idx} of {}", lines.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_sysfs_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "9.1.4.1000").unwrap();
        writeln!(file, "9.1.4.1001").unwrap();
        assert_eq!(read_sysfs_line(file.path(), 1).unwrap(), "9.1.4.1001");
        assert!(matches!(
            read_sysfs_line(file.path(), 5),
            Err(FwError::InvalidFile(_))
        ));
    }
}
