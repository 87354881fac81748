// SPDX-License-Identifier: LGPL-2.1-or-later

//! USB4 retimer/router NVM image: fixed offsets carry the vendor/product IDs
//! and the version pair used to gate installs.

use std::any::Any;

use serde_json::{Map, Value, json};

use crate::firmware::{Firmware, FirmwareBase, FirmwareFlags, FirmwareOps, ParseFlags};
use crate::stream::{Endian, InputStream};
use crate::ResultFw;

const NVM_VER_OFFSET_MINOR: u64 = 0x9;
const NVM_VID_OFFSET_MINOR: u64 = 0x220;
const NVM_PID_OFFSET_MINOR: u64 = 0x222;

/// Identifier of the payload child image
pub const FIRMWARE_ID_PAYLOAD: &str = "payload";

/// NVM image with embedded vendor and product IDs
#[derive(Debug, Default)]
pub struct Usb4NvmFirmware {
    vendor_id: u16,
    product_id: u16,
}

impl Usb4NvmFirmware {
    #[must_use]
    pub fn new() -> Firmware {
        let mut firmware = Firmware::with_ops(Box::new(Usb4NvmFirmware::default()));
        firmware.base_mut().add_flag(FirmwareFlags::HAS_VID_PID);
        // no magic to sniff, the caller has to know the layout
        firmware.base_mut().add_flag(FirmwareFlags::NO_AUTO_DETECTION);
        firmware
    }

    #[must_use]
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    #[must_use]
    pub fn product_id(&self) -> u16 {
        self.product_id
    }
}

impl FirmwareOps for Usb4NvmFirmware {
    fn kind(&self) -> &'static str {
        "usb4-nvm"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        _flags: ParseFlags,
    ) -> ResultFw<()> {
        self.vendor_id = stream.read_u16(NVM_VID_OFFSET_MINOR, Endian::Little)?;
        self.product_id = stream.read_u16(NVM_PID_OFFSET_MINOR, Endian::Little)?;

        let version_raw = stream.read_u16(NVM_VER_OFFSET_MINOR, Endian::Little)?;
        base.set_version_raw(u64::from(version_raw));
        base.set_version(&format!(
            "{:02x}.{:02x}",
            version_raw >> 8,
            version_raw & 0xFF
        ));

        // an easy-to-grab payload blob
        let mut payload = Firmware::from_bytes(stream.as_slice().to_vec());
        payload.set_id(FIRMWARE_ID_PAYLOAD);
        base.add_image(payload)?;
        Ok(())
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        node.insert("vendor_id".into(), json!(self.vendor_id));
        node.insert("product_id".into(), json!(self.product_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FwError;

    #[test]
    fn test_parse_ids_and_version() {
        let mut image = vec![0u8; 0x400];
        image[0x9..0xB].copy_from_slice(&0x2810u16.to_le_bytes());
        image[0x220..0x222].copy_from_slice(&0x8087u16.to_le_bytes());
        image[0x222..0x224].copy_from_slice(&0x0B26u16.to_le_bytes());
        let mut firmware = Usb4NvmFirmware::new();
        firmware
            .parse(&InputStream::from_vec(image), ParseFlags::empty())
            .unwrap();
        let ops = firmware.ops_as::<Usb4NvmFirmware>().unwrap();
        assert_eq!(ops.vendor_id(), 0x8087);
        assert_eq!(ops.product_id(), 0x0B26);
        assert_eq!(firmware.version(), Some("28.10"));
        assert_eq!(
            firmware.image_by_id(FIRMWARE_ID_PAYLOAD).unwrap().size(),
            0x400
        );
    }

    #[test]
    fn test_truncated() {
        let mut firmware = Usb4NvmFirmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(vec![0u8; 0x100]), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }
}
