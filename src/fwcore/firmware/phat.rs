// SPDX-License-Identifier: LGPL-2.1-or-later

//! ACPI Platform Health Assessment Table and its record types.

use std::any::Any;

use crate::firmware::{
    Firmware, FirmwareBase, FirmwareFlags, FirmwareOps, ParseFlags,
};
use crate::guid::{guid_from_bytes_mixed, guid_to_bytes_mixed};
use crate::stream::{Endian, InputStream, read_safe, strsafe, sum8};
use crate::{FwError, ResultFw};
use serde_json::{Map, Value, json};

const PHAT_SIGNATURE: &[u8; 4] = b"PHAT";
const PHAT_REVISION: u8 = 1;
const PHAT_HEADER_SIZE: u64 = 36;
const PHAT_IMAGES_MAX: usize = 2000;

const PHAT_RECORD_TYPE_VERSION: u16 = 0x0000;
const PHAT_RECORD_TYPE_HEALTH: u16 = 0x0001;

const PHAT_VERSION_RECORD_HDR_SIZE: u64 = 12;
const PHAT_VERSION_ELEMENT_SIZE: u64 = 28;

/// The outer PHAT table
#[derive(Debug, Default)]
pub struct PhatFirmware {
    oem_id: Option<String>,
}

impl PhatFirmware {
    #[must_use]
    pub fn new() -> Firmware {
        let mut firmware = Firmware::with_ops(Box::new(PhatFirmware::default()));
        firmware.base_mut().set_images_max(PHAT_IMAGES_MAX);
        firmware.base_mut().add_flag(FirmwareFlags::HAS_CHECKSUM);
        firmware
    }

    #[must_use]
    pub fn oem_id(&self) -> Option<&str> {
        self.oem_id.as_deref()
    }

    fn parse_record(
        base: &mut FirmwareBase,
        stream: &InputStream,
        offset: &mut u64,
        flags: ParseFlags,
    ) -> ResultFw<()> {
        let record_type = stream.read_u16(*offset, Endian::Little)?;
        let record_length = stream.read_u16(*offset + 2, Endian::Little)?;
        if record_length < 5 {
            return Err(FwError::NotSupported(format!(
                "PHAT record length invalid, got {record_length:#x}"
            )));
        }
        let revision = stream.read_u8(*offset + 4)?;

        let window = stream.partial(*offset, u64::from(record_length))?;
        let record = match record_type {
            PHAT_RECORD_TYPE_VERSION | PHAT_RECORD_TYPE_HEALTH => {
                let mut record = if record_type == PHAT_RECORD_TYPE_VERSION {
                    PhatVersionRecord::new()
                } else {
                    PhatHealthRecord::new()
                };
                record.base_mut().set_size(u64::from(record_length));
                record.base_mut().set_version_raw(u64::from(revision));
                record.parse_stream(&window, 0, flags | ParseFlags::NO_SEARCH)?;
                record.base_mut().set_offset(*offset);
                record
            }
            _ => {
                // opaque record, kept so the export still covers the table
                let mut opaque = Firmware::from_bytes(window.as_slice().to_vec());
                opaque.set_idx(u64::from(record_type));
                opaque.base_mut().set_offset(*offset);
                opaque
            }
        };
        base.add_image(record)?;
        *offset += u64::from(record_length);
        Ok(())
    }
}

impl FirmwareOps for PhatFirmware {
    fn kind(&self) -> &'static str {
        "acpi-phat"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        let signature = stream.read_bytes(offset, 4)?;
        if signature != PHAT_SIGNATURE {
            return Err(FwError::NotSupported(format!(
                "field signature: got {:02x?}, expected 'PHAT'",
                signature
            )));
        }
        Ok(())
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<()> {
        let streamsz = stream.size();
        let length = u64::from(stream.read_u32(4, Endian::Little)?);
        if streamsz < length {
            return Err(FwError::NotSupported(format!(
                "PHAT table invalid size, got {streamsz:#x}, expected {length:#x}"
            )));
        }

        if !flags.contains(ParseFlags::FORCE) {
            let revision = stream.read_u8(8)?;
            if revision != PHAT_REVISION {
                return Err(FwError::NotSupported(format!(
                    "PHAT table revision invalid, got {revision:#x}, expected {PHAT_REVISION:#x}"
                )));
            }
        }

        // the unsigned byte sum over the declared length must be zero
        if !flags.contains(ParseFlags::IGNORE_CHECKSUM) {
            let checksum = stream.partial(0, length)?.compute_sum8();
            if checksum != 0x00 {
                return Err(FwError::InvalidData(format!(
                    "PHAT table checksum invalid, got {checksum:#04x}"
                )));
            }
        }

        let buf = stream.as_slice();
        self.oem_id = strsafe(buf, 10, 6).ok();
        if let Ok(oem_table_id) = strsafe(buf, 16, 8) {
            base.set_id(&oem_table_id);
        }
        base.set_version_raw(u64::from(stream.read_u32(24, Endian::Little)?));

        let mut offset = PHAT_HEADER_SIZE;
        while offset < length {
            Self::parse_record(base, stream, &mut offset, flags)?;
        }
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let mut records = Vec::new();
        for image in base.images() {
            records.extend_from_slice(&image.write()?);
        }

        let mut buf = Vec::with_capacity(PHAT_HEADER_SIZE as usize + records.len());
        buf.extend_from_slice(PHAT_SIGNATURE);
        buf.extend_from_slice(&((records.len() as u32) + PHAT_HEADER_SIZE as u32).to_le_bytes());
        buf.push(base.version_raw() as u8);
        buf.push(0xFF); // checksum, fixed up below
        let mut oem_id = [0u8; 6];
        if let Some(text) = self.oem_id.as_deref() {
            read_safe(&mut oem_id, 0, text.as_bytes(), 0, text.len())?;
        }
        buf.extend_from_slice(&oem_id);
        let mut oem_table_id = [0u8; 8];
        if let Some(text) = base.id() {
            read_safe(&mut oem_table_id, 0, text.as_bytes(), 0, text.len())?;
        }
        buf.extend_from_slice(&oem_table_id);
        buf.extend_from_slice(&(base.version_raw() as u32).to_le_bytes());
        buf.extend_from_slice(b"FWUP");
        buf.extend_from_slice(b"0000");
        buf.extend_from_slice(&records);

        buf[9] = 0xFF - sum8(&buf);
        Ok(buf)
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        if let Some(oem_id) = self.oem_id.as_deref() {
            node.insert("oem_id".into(), json!(oem_id));
        }
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &Value) -> ResultFw<()> {
        if let Some(oem_id) = node.get("oem_id").and_then(Value::as_str) {
            self.oem_id = Some(oem_id.to_owned());
        }
        Ok(())
    }
}

/// Record type 0x0000: a list of 28-byte component version elements
#[derive(Debug, Default)]
pub struct PhatVersionRecord;

impl PhatVersionRecord {
    #[must_use]
    pub fn new() -> Firmware {
        let mut firmware = Firmware::with_ops(Box::new(PhatVersionRecord));
        firmware.base_mut().set_images_max(PHAT_IMAGES_MAX);
        firmware.base_mut().add_flag(FirmwareFlags::NO_AUTO_DETECTION);
        firmware
    }
}

impl FirmwareOps for PhatVersionRecord {
    fn kind(&self) -> &'static str {
        "acpi-phat-version-record"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<()> {
        let record_count = stream.read_u32(8, Endian::Little)?;
        let mut offset = PHAT_VERSION_RECORD_HDR_SIZE;
        for _ in 0..record_count {
            let mut element = PhatVersionElement::new();
            let window = stream.partial(offset, PHAT_VERSION_ELEMENT_SIZE)?;
            element.parse_stream(&window, 0, flags | ParseFlags::NO_SEARCH)?;
            element.base_mut().set_offset(offset);
            base.add_image(element)?;
            offset += PHAT_VERSION_ELEMENT_SIZE;
        }
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let mut elements = Vec::new();
        for image in base.images() {
            elements.extend_from_slice(&image.write()?);
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(&PHAT_RECORD_TYPE_VERSION.to_le_bytes());
        buf.extend_from_slice(
            &((PHAT_VERSION_RECORD_HDR_SIZE as u16) + elements.len() as u16).to_le_bytes(),
        );
        buf.push(base.version_raw() as u8);
        buf.extend_from_slice(&[0x00; 3]);
        buf.extend_from_slice(&(base.images().len() as u32).to_le_bytes());
        buf.extend_from_slice(&elements);
        Ok(buf)
    }
}

/// One component GUID/version/producer element
#[derive(Debug, Default)]
pub struct PhatVersionElement {
    guid: Option<String>,
    producer_id: Option<String>,
}

impl PhatVersionElement {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(PhatVersionElement::default()))
    }

    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    #[must_use]
    pub fn producer_id(&self) -> Option<&str> {
        self.producer_id.as_deref()
    }
}

impl FirmwareOps for PhatVersionElement {
    fn kind(&self) -> &'static str {
        "acpi-phat-version-element"
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
        base.set_size(PHAT_VERSION_ELEMENT_SIZE);
        let buf = stream.as_slice();
        let mut component_id = [0u8; 16];
        read_safe(&mut component_id, 0, buf, 0, 16)?;
        self.guid = Some(guid_from_bytes_mixed(&component_id));
        base.set_version_raw(stream.read_u64(16, Endian::Little)?);
        let mut producer_id = [0u8; 4];
        read_safe(&mut producer_id, 0, buf, 24, 4)?;
        if producer_id == [0u8; 4] {
            return Err(FwError::NotSupported("PHAT version element invalid".into()));
        }
        self.producer_id = strsafe(&producer_id, 0, 4).ok();
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let mut buf = Vec::with_capacity(PHAT_VERSION_ELEMENT_SIZE as usize);
        let guid_bytes = match self.guid.as_deref() {
            Some(guid) => guid_to_bytes_mixed(guid)?,
            None => [0u8; 16],
        };
        buf.extend_from_slice(&guid_bytes);
        buf.extend_from_slice(&base.version_raw().to_le_bytes());
        let mut producer_id = [0u8; 4];
        if let Some(text) = self.producer_id.as_deref() {
            read_safe(&mut producer_id, 0, text.as_bytes(), 0, text.len())?;
        }
        buf.extend_from_slice(&producer_id);
        Ok(buf)
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        if let Some(guid) = self.guid.as_deref() {
            node.insert("guid".into(), json!(guid));
        }
        if let Some(producer_id) = self.producer_id.as_deref() {
            node.insert("producer_id".into(), json!(producer_id));
        }
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &Value) -> ResultFw<()> {
        if let Some(guid) = node.get("guid").and_then(Value::as_str) {
            self.guid = Some(guid.to_owned());
        }
        if let Some(producer_id) = node.get("producer_id").and_then(Value::as_str) {
            self.producer_id = Some(producer_id.to_owned());
        }
        Ok(())
    }
}

/// Record type 0x0001: device health with an optional UTF-16 device path
#[derive(Debug, Default)]
pub struct PhatHealthRecord {
    am_healthy: u8,
    guid: Option<String>,
    device_path: Option<String>,
}

impl PhatHealthRecord {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(PhatHealthRecord::default()))
    }

    #[must_use]
    pub fn am_healthy(&self) -> u8 {
        self.am_healthy
    }

    #[must_use]
    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }
}

impl FirmwareOps for PhatHealthRecord {
    fn kind(&self) -> &'static str {
        "acpi-phat-health-record"
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
        let buf = stream.as_slice();
        self.am_healthy = stream.read_u8(7)?;
        let mut guid = [0u8; 16];
        read_safe(&mut guid, 0, buf, 8, 16)?;
        self.guid = Some(guid_from_bytes_mixed(&guid));
        if buf.len() > 28 {
            let units: Vec<u16> = buf[28..]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .take_while(|unit| *unit != 0)
                .collect();
            let path: String = char::decode_utf16(units)
                .collect::<Result<_, _>>()
                .map_err(|err| {
                    FwError::InvalidData(format!("device path not UTF-16: {err}"))
                })?;
            self.device_path = Some(path);
        }
        let _ = base;
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let path_utf16: Vec<u8> = self
            .device_path
            .as_deref()
            .map(|path| {
                path.encode_utf16()
                    .flat_map(|unit| unit.to_le_bytes())
                    .collect()
            })
            .unwrap_or_default();
        let mut buf = Vec::new();
        buf.extend_from_slice(&PHAT_RECORD_TYPE_HEALTH.to_le_bytes());
        buf.extend_from_slice(&(28u16 + path_utf16.len() as u16).to_le_bytes());
        buf.push(base.version_raw() as u8);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.push(self.am_healthy);
        let guid_bytes = match self.guid.as_deref() {
            Some(guid) => guid_to_bytes_mixed(guid)?,
            None => [0u8; 16],
        };
        buf.extend_from_slice(&guid_bytes);
        // device-specific data unsupported
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&path_utf16);
        Ok(buf)
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        if let Some(guid) = self.guid.as_deref() {
            node.insert("guid".into(), json!(guid));
        }
        if let Some(device_path) = self.device_path.as_deref() {
            node.insert("device_path".into(), json!(device_path));
        }
        if self.am_healthy != 0 {
            node.insert("am_healthy".into(), json!(self.am_healthy));
        }
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &Value) -> ResultFw<()> {
        if let Some(guid) = node.get("guid").and_then(Value::as_str) {
            self.guid = Some(guid.to_owned());
        }
        if let Some(device_path) = node.get("device_path").and_then(Value::as_str) {
            self.device_path = Some(device_path.to_owned());
        }
        if let Some(am_healthy) = node.get("am_healthy").and_then(Value::as_u64) {
            if am_healthy > u64::from(u8::MAX) {
                return Err(FwError::NotSupported(format!(
                    "am_healthy value invalid, got {am_healthy:#x}"
                )));
            }
            self.am_healthy = am_healthy as u8;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a syntactically valid table with a correct checksum
    fn build_table(records: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(PHAT_SIGNATURE);
        buf.extend_from_slice(&((records.len() as u32) + 36).to_le_bytes());
        buf.push(PHAT_REVISION);
        buf.push(0xFF);
        buf.extend_from_slice(b"OEMIDX");
        buf.extend_from_slice(b"TABLEID1");
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"FWUP");
        buf.extend_from_slice(b"0000");
        buf.extend_from_slice(records);
        buf[9] = 0xFF - sum8(&buf);
        buf
    }

    fn version_record_with_element() -> Vec<u8> {
        let mut element = Vec::new();
        element.extend_from_slice(&guid_to_bytes_mixed("12345678-9abc-def0-1234-56789abcdef0").unwrap());
        element.extend_from_slice(&0x0102_0304u64.to_le_bytes());
        element.extend_from_slice(b"ACME");
        let mut record = Vec::new();
        record.extend_from_slice(&PHAT_RECORD_TYPE_VERSION.to_le_bytes());
        record.extend_from_slice(&(12u16 + element.len() as u16).to_le_bytes());
        record.push(1);
        record.extend_from_slice(&[0x00; 3]);
        record.extend_from_slice(&1u32.to_le_bytes());
        record.extend_from_slice(&element);
        record
    }

    #[test]
    fn test_parse_version_record() {
        let table = build_table(&version_record_with_element());
        let mut firmware = PhatFirmware::new();
        firmware
            .parse(&InputStream::from_vec(table.clone()), ParseFlags::empty())
            .unwrap();
        assert_eq!(firmware.id(), Some("TABLEID1"));
        assert_eq!(firmware.version_raw(), 3);
        let record = &firmware.images()[0];
        assert_eq!(record.kind(), "acpi-phat-version-record");
        let element = &record.images()[0];
        let ops = element.ops_as::<PhatVersionElement>().unwrap();
        assert_eq!(ops.guid(), Some("12345678-9abc-def0-1234-56789abcdef0"));
        assert_eq!(ops.producer_id(), Some("ACME"));
        assert_eq!(element.version_raw(), 0x0102_0304);

        // checksum invariant: unsigned sum over data[0..length) is zero
        assert_eq!(sum8(&table), 0x00);
    }

    #[test]
    fn test_checksum_reject() {
        let mut table = build_table(&version_record_with_element());
        table[20] ^= 0xA5;
        let mut firmware = PhatFirmware::new();
        let err = firmware
            .parse(&InputStream::from_vec(table.clone()), ParseFlags::empty())
            .unwrap_err();
        match err {
            FwError::InvalidData(message) => {
                assert!(message.starts_with("PHAT table checksum invalid, got 0x"), "{message}");
            }
            other => panic!("wrong kind: {other}"),
        }
        // the developer override skips the integrity check
        let mut firmware = PhatFirmware::new();
        firmware
            .parse(&InputStream::from_vec(table), ParseFlags::IGNORE_CHECKSUM)
            .unwrap();
    }

    #[test]
    fn test_revision_reject_unless_force() {
        let mut table = build_table(&[]);
        table[8] = 2;
        table[9] = 0xFF;
        table[9] = 0xFF - sum8(&table);
        let mut firmware = PhatFirmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(table.clone()), ParseFlags::empty()),
            Err(FwError::NotSupported(_))
        ));
        let mut firmware = PhatFirmware::new();
        firmware
            .parse(&InputStream::from_vec(table), ParseFlags::FORCE)
            .unwrap();
    }

    #[test]
    fn test_health_record_roundtrip() {
        let ops = PhatHealthRecord {
            am_healthy: 1,
            guid: Some("12345678-9abc-def0-1234-56789abcdef0".to_owned()),
            device_path: Some("\\_SB.PC00".to_owned()),
        };
        let base = FirmwareBase::default();
        let blob = FirmwareOps::write(&ops, &base).unwrap();
        assert_eq!(u16::from_le_bytes([blob[0], blob[1]]), PHAT_RECORD_TYPE_HEALTH);

        let mut parsed = PhatHealthRecord::default();
        let mut parsed_base = FirmwareBase::default();
        parsed
            .parse(&mut parsed_base, &InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        assert_eq!(parsed.am_healthy(), 1);
        assert_eq!(parsed.device_path(), Some("\\_SB.PC00"));
        assert_eq!(parsed.guid.as_deref(), ops.guid.as_deref());
    }

    #[test]
    fn test_nul_producer_rejected() {
        let mut element = vec![0u8; 28];
        element[0] = 0x01; // GUID plausible enough
        let mut firmware = PhatVersionElement::new();
        assert!(matches!(
            firmware.parse_stream(&InputStream::from_vec(element), 0, ParseFlags::NO_SEARCH),
            Err(FwError::NotSupported(_))
        ));
    }

    #[test]
    fn test_table_roundtrip() {
        let table = build_table(&version_record_with_element());
        let mut firmware = PhatFirmware::new();
        firmware
            .parse(&InputStream::from_vec(table), ParseFlags::empty())
            .unwrap();
        let written = firmware.write().unwrap();
        // the writer fixes the checksum up so the invariant holds again
        assert_eq!(sum8(&written), 0x00);
        let mut reparsed = PhatFirmware::new();
        reparsed
            .parse(&InputStream::from_vec(written), ParseFlags::empty())
            .unwrap();
        assert_eq!(reparsed.export_report(), firmware.export_report());
    }
}
