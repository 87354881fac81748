// SPDX-License-Identifier: LGPL-2.1-or-later

//! Read-only access to UEFI variables and ACPI tables via sysfs.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{FwError, ResultFw};

const EFIVARS_PATH: &str = "/sys/firmware/efi/efivars";
const ACPI_TABLES_PATH: &str = "/sys/firmware/acpi/tables";

/// Read a UEFI variable; the 4-byte attribute prefix is stripped
pub fn efivar_get(guid: &str, name: &str) -> ResultFw<Vec<u8>> {
    efivar_get_from(Path::new(EFIVARS_PATH), guid, name)
}

pub(crate) fn efivar_get_from(root: &Path, guid: &str, name: &str) -> ResultFw<Vec<u8>> {
    let path = root.join(format!("{name}-{guid}"));
    let bytes = read_or_not_found(&path)?;
    if bytes.len() < 4 {
        return Err(FwError::InvalidData(format!(
            "variable {name} too small, got {:#x} bytes",
            bytes.len()
        )));
    }
    Ok(bytes[4..].to_vec())
}

/// Read a raw ACPI table by signature, e.g. `PHAT`
pub fn acpi_table(signature: &str) -> ResultFw<Vec<u8>> {
    read_or_not_found(&PathBuf::from(ACPI_TABLES_PATH).join(signature))
}

fn read_or_not_found(path: &Path) -> ResultFw<Vec<u8>> {
    fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            FwError::NotFound(format!("no attribute {}", path.display()))
        } else {
            err.into()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_efivar_strips_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let guid = "8be4df61-93ca-11d2-aa0d-00e098032b8c";
        fs::write(
            dir.path().join(format!("BootOrder-{guid}")),
            [0x07, 0x00, 0x00, 0x00, 0x01, 0x00],
        )
        .unwrap();
        let value = efivar_get_from(dir.path(), guid, "BootOrder").unwrap();
        assert_eq!(value, vec![0x01, 0x00]);
        assert!(matches!(
            efivar_get_from(dir.path(), guid, "Missing"),
            Err(FwError::NotFound(_))
        ));
    }
}
