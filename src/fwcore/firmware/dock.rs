// SPDX-License-Identifier: LGPL-2.1-or-later

//! Dock firmware bundle: a small header followed by the concatenated images
//! for the controller and the two gamepads. The header carries the IDs the
//! device layer uses to reject incompatible targets.

use std::any::Any;

use serde_json::{Map, Value, json};

use crate::firmware::{Firmware, FirmwareBase, FirmwareFlags, FirmwareOps, ParseFlags};
use crate::stream::{Endian, InputStream};
use crate::version::{VersionFormat, version_from_u32};
use crate::{FwError, ResultFw};

const DOCK_MAGIC: &[u8; 4] = b"DKF1";
const DOCK_HEADER_SIZE: u64 = 32;

/// Slot identifiers, also used as the child-device logical IDs
pub const SLOT_ID_MCU: &str = "DeviceIDMcu";
pub const SLOT_ID_PAD_LEFT: &str = "DeviceIDPadL";
pub const SLOT_ID_PAD_RIGHT: &str = "DeviceIDPadR";

const SLOT_IDS: [&str; 3] = [SLOT_ID_MCU, SLOT_ID_PAD_LEFT, SLOT_ID_PAD_RIGHT];

/// Bundle of per-slot images plus target identification
#[derive(Debug, Default)]
pub struct DockFirmware {
    product_id: u16,
    dfu_pid: u16,
}

impl DockFirmware {
    #[must_use]
    pub fn new() -> Firmware {
        let mut firmware = Firmware::with_ops(Box::new(DockFirmware::default()));
        firmware.base_mut().add_flag(FirmwareFlags::HAS_VID_PID);
        firmware
    }

    /// Product the bundle was built for
    #[must_use]
    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// PID the device re-enumerates with in bootloader mode
    #[must_use]
    pub fn dfu_pid(&self) -> u16 {
        self.dfu_pid
    }
}

impl FirmwareOps for DockFirmware {
    fn kind(&self) -> &'static str {
        "dock"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        let magic = stream.read_bytes(offset, 4)?;
        if magic != DOCK_MAGIC {
            return Err(FwError::NotSupported(format!(
                "field magic: got {magic:02x?}, expected {DOCK_MAGIC:02x?}"
            )));
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
        self.product_id = stream.read_u16(4, Endian::Little)?;
        self.dfu_pid = stream.read_u16(6, Endian::Little)?;

        let mut offset = DOCK_HEADER_SIZE;
        for (index, slot_id) in SLOT_IDS.iter().enumerate() {
            let descriptor = 8 + (index as u64) * 8;
            let size = u64::from(stream.read_u32(descriptor, Endian::Little)?);
            let version_raw = stream.read_u32(descriptor + 4, Endian::Little)?;
            if size == 0 {
                continue;
            }
            if offset + size > stream.size() {
                return Err(FwError::InvalidData(format!(
                    "field size: slot {slot_id} needs {size:#x} bytes at {offset:#x}, \
                     stream is {:#x}",
                    stream.size()
                )));
            }
            let mut image = Firmware::from_bytes(stream.read_bytes(offset, size as usize)?);
            image.set_id(slot_id);
            image.base_mut().set_offset(offset);
            image.base_mut().set_version_format(VersionFormat::Triplet);
            image.base_mut().set_version_raw(u64::from(version_raw));
            image
                .base_mut()
                .set_version(&version_from_u32(version_raw, VersionFormat::Triplet));
            base.add_image(image)?;
            offset += size;
        }
        if base.images().is_empty() {
            return Err(FwError::InvalidData("bundle contains no images".into()));
        }
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let mut header = vec![0u8; DOCK_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(DOCK_MAGIC);
        header[4..6].copy_from_slice(&self.product_id.to_le_bytes());
        header[6..8].copy_from_slice(&self.dfu_pid.to_le_bytes());
        let mut payload = Vec::new();
        for (index, slot_id) in SLOT_IDS.iter().enumerate() {
            let descriptor = 8 + index * 8;
            let Ok(image) = base.image_by_id(slot_id) else {
                continue;
            };
            let bytes = image.bytes()?;
            header[descriptor..descriptor + 4]
                .copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            header[descriptor + 4..descriptor + 8]
                .copy_from_slice(&(image.version_raw() as u32).to_le_bytes());
            payload.extend_from_slice(bytes);
        }
        header.extend_from_slice(&payload);
        Ok(header)
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        node.insert("product_id".into(), json!(self.product_id));
        node.insert("dfu_pid".into(), json!(self.dfu_pid));
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &Value) -> ResultFw<()> {
        if let Some(product_id) = node.get("product_id").and_then(Value::as_u64) {
            self.product_id = product_id as u16;
        }
        if let Some(dfu_pid) = node.get("dfu_pid").and_then(Value::as_u64) {
            self.dfu_pid = dfu_pid as u16;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn build_test_bundle(product_id: u16) -> Vec<u8> {
    let slots: [(&[u8], u32); 3] = [
        (&[0x10; 64], 0x01020003),
        (&[0x20; 32], 0x02000001),
        (&[0x30; 32], 0x02000002),
    ];
    let mut buf = vec![0u8; 32];
    buf[0..4].copy_from_slice(DOCK_MAGIC);
    buf[4..6].copy_from_slice(&product_id.to_le_bytes());
    buf[6..8].copy_from_slice(&0x61ECu16.to_le_bytes());
    for (index, (bytes, version)) in slots.iter().enumerate() {
        let descriptor = 8 + index * 8;
        buf[descriptor..descriptor + 4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf[descriptor + 4..descriptor + 8].copy_from_slice(&version.to_le_bytes());
    }
    for (bytes, _) in slots {
        buf.extend_from_slice(bytes);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slots() {
        let mut firmware = DockFirmware::new();
        firmware
            .parse(
                &InputStream::from_vec(build_test_bundle(0x61EB)),
                ParseFlags::empty(),
            )
            .unwrap();
        let ops = firmware.ops_as::<DockFirmware>().unwrap();
        assert_eq!(ops.product_id(), 0x61EB);
        assert_eq!(ops.dfu_pid(), 0x61EC);
        assert_eq!(firmware.images().len(), 3);
        let mcu = firmware.image_by_id(SLOT_ID_MCU).unwrap();
        assert_eq!(mcu.bytes().unwrap().len(), 64);
        assert_eq!(mcu.version(), Some("1.2.3"));
        let pad = firmware.image_by_id(SLOT_ID_PAD_LEFT).unwrap();
        assert_eq!(pad.version_raw(), 0x02000001);
    }

    #[test]
    fn test_roundtrip() {
        let blob = build_test_bundle(0x1234);
        let mut firmware = DockFirmware::new();
        firmware
            .parse(&InputStream::from_vec(blob.clone()), ParseFlags::empty())
            .unwrap();
        assert_eq!(firmware.write().unwrap(), blob);
    }

    #[test]
    fn test_truncated_slot() {
        let mut blob = build_test_bundle(0x1234);
        blob.truncate(blob.len() - 8);
        let mut firmware = DockFirmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(blob), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }
}
