// SPDX-License-Identifier: LGPL-2.1-or-later

//! Legacy VBIOS image carrying the part-number and version strings that gate
//! GPU firmware updates.

use std::any::Any;

use serde_json::{Map, Value, json};

use crate::firmware::{Firmware, FirmwareBase, FirmwareOps, ParseFlags};
use crate::stream::{Endian, InputStream, memmem, strsafe};
use crate::{FwError, ResultFw};

const ATOM_IMAGE_MAGIC: u16 = 0xAA55;
const ATOM_ROM_SIGNATURE: &[u8; 4] = b"ATOM";
const BIOS_VERSION_PREFIX: &[u8] = b"ATOMBIOSBK-AMD VER";
const BIOS_STRING_LENGTH: usize = 43;
const STRLEN_NORMAL: usize = 32;
const STRLEN_LONG: usize = 64;

// image header offsets
const ATOM_IMAGE_SIZE_OFFSET: u64 = 0x02;
const ATOM_IMAGE_NUM_STRINGS_OFFSET: u64 = 0x10;
const ATOM_IMAGE_STR_LOC_OFFSET: u64 = 0x12;
const ATOM_IMAGE_ROM_LOC_OFFSET: u64 = 0x48;
const ATOM_IMAGE_DATE_OFFSET: usize = 0x50;

// ROM 2.1 header offsets, relative to rom_loc
const ATOM_ROM_SIGNATURE_OFFSET: u64 = 0x04;
const ATOM_ROM_CONFIG_FILENAME_OFFSET: u64 = 0x14;

/// Positional meaning of the first four image strings
const STRING_INDEX_PART_NUMBER: usize = 0;
const STRING_INDEX_ASIC: usize = 1;
const STRING_INDEX_PCI_TYPE: usize = 2;
const STRING_INDEX_MEMORY_TYPE: usize = 3;

/// VBIOS "ATOM" image: identification strings, build date and version
#[derive(Debug, Default)]
pub struct AtomFirmware {
    part_number: Option<String>,
    asic: Option<String>,
    pci_type: Option<String>,
    memory_type: Option<String>,
    bios_date: Option<String>,
    model_name: Option<String>,
    config_filename: Option<String>,
}

impl AtomFirmware {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(AtomFirmware::default()))
    }

    /// The part number used to match firmware files against hardware
    #[must_use]
    pub fn part_number(&self) -> Option<&str> {
        self.part_number.as_deref()
    }

    #[must_use]
    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    fn parse_date(&mut self, buf: &[u8]) -> ResultFw<()> {
        let window = buf.get(ATOM_IMAGE_DATE_OFFSET..ATOM_IMAGE_DATE_OFFSET + 10).ok_or_else(
            || FwError::InvalidData("ATOMBIOS date is invalid".into()),
        )?;
        if !window.iter().all(u8::is_ascii_digit) {
            return Err(FwError::InvalidData("ATOMBIOS date is invalid".into()));
        }
        let field = |idx: usize| std::str::from_utf8(&window[idx..idx + 2]).unwrap().to_owned();
        self.bios_date = Some(format!(
            "20{}/{}/{} {}:{}",
            field(0),
            field(2),
            field(4),
            field(6),
            field(8)
        ));
        Ok(())
    }

    fn parse_strings(
        &mut self,
        buf: &[u8],
        num_strings: usize,
        str_loc: usize,
        image_size: usize,
    ) -> ResultFw<()> {
        if num_strings == 0 {
            return Err(FwError::InvalidData("ATOMBIOS number of strings is 0".into()));
        }
        if str_loc == 0 {
            return Err(FwError::InvalidData(
                "ATOMBIOS string location is invalid".into(),
            ));
        }
        // make sure there is enough space for all the strings
        if str_loc + num_strings * (STRLEN_NORMAL - 1) > image_size {
            return Err(FwError::InvalidData("bufsz is too small for all strings".into()));
        }
        let mut idx = str_loc;
        for position in 0..num_strings {
            let text = strsafe(buf, idx, STRLEN_NORMAL - 1)?;
            idx += text.len() + 1;
            match position {
                STRING_INDEX_PART_NUMBER => self.part_number = Some(text),
                STRING_INDEX_ASIC => self.asic = Some(text),
                STRING_INDEX_PCI_TYPE => self.pci_type = Some(text),
                STRING_INDEX_MEMORY_TYPE => self.memory_type = Some(text),
                _ => {
                    return Err(FwError::InvalidData(format!(
                        "unknown string index: {position}"
                    )));
                }
            }
        }

        // skip the following 2 chars: 0x0D 0x0A
        idx += 2;
        if idx + STRLEN_LONG - 1 > image_size {
            return Err(FwError::InvalidData("bufsz is too small for name string".into()));
        }
        self.model_name = Some(strsafe(buf, idx, STRLEN_LONG - 1)?.trim().to_owned());
        Ok(())
    }

    fn parse_version(&self, base: &mut FirmwareBase, buf: &[u8]) -> ResultFw<()> {
        let offset = memmem(buf, BIOS_VERSION_PREFIX)
            .map_err(|err| FwError::NotFound(format!("failed to find anchor: {err}")))?;
        let version = strsafe(buf, offset + BIOS_VERSION_PREFIX.len(), BIOS_STRING_LENGTH)?;
        base.set_version(&version);
        Ok(())
    }
}

impl FirmwareOps for AtomFirmware {
    fn kind(&self) -> &'static str {
        "amd-atom"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        let magic = stream.read_u16(offset, Endian::Little)?;
        if magic != ATOM_IMAGE_MAGIC {
            return Err(FwError::NotSupported(format!(
                "field magic: got {magic:#06x}, expected {ATOM_IMAGE_MAGIC:#06x}"
            )));
        }
        let rom_loc = u64::from(stream.read_u16(offset + ATOM_IMAGE_ROM_LOC_OFFSET, Endian::Little)?);
        let signature = stream.read_bytes(offset + rom_loc + ATOM_ROM_SIGNATURE_OFFSET, 4)?;
        if signature != ATOM_ROM_SIGNATURE {
            return Err(FwError::NotSupported(
                "field signature: no ATOM ROM header".into(),
            ));
        }
        Ok(())
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        _flags: ParseFlags,
    ) -> ResultFw<()> {
        self.validate(stream, 0)?;
        let buf = stream.as_slice();

        // unit is 512 bytes
        let size_units = stream.read_u16(ATOM_IMAGE_SIZE_OFFSET, Endian::Little)?;
        let image_size = usize::from(size_units) * 512;
        base.set_size(image_size as u64);

        let rom_loc = u64::from(stream.read_u16(ATOM_IMAGE_ROM_LOC_OFFSET, Endian::Little)?);
        let config_offset =
            stream.read_u16(rom_loc + ATOM_ROM_CONFIG_FILENAME_OFFSET, Endian::Little)?;
        self.config_filename =
            Some(strsafe(buf, usize::from(config_offset), STRLEN_LONG - 1)?.trim().to_owned());

        self.parse_date(buf)?;
        let num_strings = usize::from(stream.read_u8(ATOM_IMAGE_NUM_STRINGS_OFFSET)?);
        let str_loc = usize::from(stream.read_u16(ATOM_IMAGE_STR_LOC_OFFSET, Endian::Little)?);
        self.parse_strings(buf, num_strings, str_loc, image_size)?;
        self.parse_version(base, buf)?;
        Ok(())
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        for (key, value) in [
            ("part_number", &self.part_number),
            ("asic", &self.asic),
            ("pci_type", &self.pci_type),
            ("memory_type", &self.memory_type),
            ("bios_date", &self.bios_date),
            ("model_name", &self.model_name),
            ("config_filename", &self.config_filename),
        ] {
            if let Some(value) = value.as_deref() {
                node.insert(key.into(), json!(value));
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn build_test_image() -> Vec<u8> {
    let mut buf = vec![0u8; 0x1000];
    buf[0..2].copy_from_slice(&ATOM_IMAGE_MAGIC.to_le_bytes());
    buf[2..4].copy_from_slice(&8u16.to_le_bytes()); // 8 * 512 = 0x1000
    buf[0x10] = 4; // num_strings
    buf[0x12..0x14].copy_from_slice(&0x200u16.to_le_bytes());
    buf[0x48..0x4A].copy_from_slice(&0x60u16.to_le_bytes());
    buf[0x50..0x5A].copy_from_slice(b"2406301234");
    // ROM 2.1 header
    buf[0x64..0x68].copy_from_slice(ATOM_ROM_SIGNATURE);
    buf[0x74..0x76].copy_from_slice(&0x300u16.to_le_bytes());
    // identification strings
    let mut idx = 0x200;
    for text in ["113-D7550200-102", "NAVI32", "PCI_EXPRESS", "GDDR6"] {
        buf[idx..idx + text.len()].copy_from_slice(text.as_bytes());
        idx += text.len() + 1;
    }
    buf[idx] = 0x0D;
    buf[idx + 1] = 0x0A;
    idx += 2;
    let model = b"AMD Radeon RX 7700";
    buf[idx..idx + model.len()].copy_from_slice(model);
    // config filename and version anchor
    buf[0x300..0x30A].copy_from_slice(b"navi32.cfg");
    let anchor = b"ATOMBIOSBK-AMD VER022.001.000.038.112906";
    buf[0x380..0x380 + anchor.len()].copy_from_slice(anchor);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strings_and_version() {
        let mut firmware = AtomFirmware::new();
        firmware
            .parse(&InputStream::from_vec(build_test_image()), ParseFlags::empty())
            .unwrap();
        let ops = firmware.ops_as::<AtomFirmware>().unwrap();
        assert_eq!(ops.part_number(), Some("113-D7550200-102"));
        assert_eq!(ops.asic.as_deref(), Some("NAVI32"));
        assert_eq!(ops.pci_type.as_deref(), Some("PCI_EXPRESS"));
        assert_eq!(ops.memory_type.as_deref(), Some("GDDR6"));
        assert_eq!(ops.model_name(), Some("AMD Radeon RX 7700"));
        assert_eq!(ops.bios_date.as_deref(), Some("2024/06/30 12:34"));
        assert_eq!(ops.config_filename.as_deref(), Some("navi32.cfg"));
        assert_eq!(firmware.version(), Some("022.001.000.038.112906"));
        assert_eq!(firmware.size(), 0x1000);
    }

    #[test]
    fn test_no_strings_rejected() {
        let mut image = build_test_image();
        image[0x10] = 0;
        let mut firmware = AtomFirmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(image), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_too_many_strings_rejected() {
        let mut image = build_test_image();
        image[0x10] = 5;
        let mut firmware = AtomFirmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(image), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_missing_anchor() {
        let mut image = build_test_image();
        image[0x380] ^= 0xFF;
        let mut firmware = AtomFirmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(image), ParseFlags::empty()),
            Err(FwError::NotFound(_))
        ));
    }

    #[test]
    fn test_not_an_atom_image() {
        let mut firmware = AtomFirmware::new();
        assert!(matches!(
            firmware.parse_stream(
                &InputStream::from_vec(vec![0u8; 256]),
                0,
                ParseFlags::NO_SEARCH
            ),
            Err(FwError::NotSupported(_))
        ));
    }
}
