// SPDX-License-Identifier: LGPL-2.1-or-later

//! USB Flashing Format: self-describing 512-byte blocks.

use std::any::Any;

use log::warn;

use crate::chunks::ChunkArray;
use crate::firmware::{Firmware, FirmwareBase, FirmwareOps, ParseFlags};
use crate::stream::{Endian, InputStream, align_up, read_safe, strsafe};
use crate::{FwError, ResultFw};

const UF2_MAGIC_START0: u32 = 0x0A324655;
const UF2_MAGIC_START1: u32 = 0x9E5D5157;
const UF2_MAGIC_END: u32 = 0x0AB16F30;

const UF2_BLOCK_SZ: u64 = 512;
const UF2_DATA_OFFSET: usize = 32;
const UF2_DATA_SZ: usize = 476;
const UF2_WRITE_PAYLOAD_SZ: u32 = 256;

// block flags
const UF2_FLAG_IS_CONTAINER: u32 = 0x0000_1000;
const UF2_FLAG_HAS_FAMILY: u32 = 0x0000_2000;
const UF2_FLAG_HAS_MD5: u32 = 0x0000_4000;
const UF2_FLAG_HAS_EXTENSION_TAG: u32 = 0x0000_8000;

// extension tags
const UF2_TAG_VERSION: u32 = 0x9FC7BC;
const UF2_TAG_DESCRIPTION: u32 = 0x650D9D;

/// UF2 container: flat payload plus base address and family ID
#[derive(Debug, Default)]
pub struct Uf2Firmware;

impl Uf2Firmware {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(Uf2Firmware))
    }
}

fn parse_extensions(
    base: &mut FirmwareBase,
    block: &[u8],
    mut offset: usize,
) -> ResultFw<()> {
    while offset < UF2_DATA_OFFSET + UF2_DATA_SZ {
        let size = usize::from(block[offset]);
        if size == 0 {
            break;
        }
        if size < 4 {
            return Err(FwError::InvalidData(format!(
                "invalid extension tag size {size:#x}"
            )));
        }
        let tag = u32::from(block[offset + 1])
            | (u32::from(block[offset + 2]) << 8)
            | (u32::from(block[offset + 3]) << 16);
        if tag == 0 {
            break;
        }
        match tag {
            UF2_TAG_VERSION => {
                let value = strsafe(block, offset + 4, size - 4)?;
                base.set_version(&value);
            }
            UF2_TAG_DESCRIPTION => {
                let value = strsafe(block, offset + 4, size - 4)?;
                base.set_id(&value);
            }
            _ => {
                if std::env::var_os("FWUPD_FUZZER_RUNNING").is_none() {
                    warn!("unknown tag {tag:#08x}");
                }
            }
        }
        offset += align_up(size, 4);
    }
    Ok(())
}

fn parse_block(
    base: &mut FirmwareBase,
    idx: u32,
    block: &[u8],
    payload: &mut Vec<u8>,
) -> ResultFw<()> {
    let stream = InputStream::from_slice(block);
    let magic0 = stream.read_u32(0, Endian::Little)?;
    let magic1 = stream.read_u32(4, Endian::Little)?;
    let magic_end = stream.read_u32(508, Endian::Little)?;
    if magic0 != UF2_MAGIC_START0 || magic1 != UF2_MAGIC_START1 || magic_end != UF2_MAGIC_END {
        return Err(FwError::InvalidData(format!(
            "field magic: got {magic0:#010x}/{magic1:#010x}/{magic_end:#010x}"
        )));
    }
    let flags = stream.read_u32(8, Endian::Little)?;
    if flags & UF2_FLAG_IS_CONTAINER != 0 {
        return Err(FwError::NotSupported(
            "container UF2 firmware not supported".into(),
        ));
    }
    let datasz = stream.read_u32(16, Endian::Little)?;
    if datasz > UF2_DATA_SZ as u32 {
        return Err(FwError::InvalidData(format!(
            "data size impossible, got {datasz:#010x}"
        )));
    }
    let block_no = stream.read_u32(20, Endian::Little)?;
    if block_no != idx {
        return Err(FwError::InvalidData(format!(
            "block count invalid, expected {idx:#06x} and got {block_no:#06x}"
        )));
    }
    if stream.read_u32(24, Endian::Little)? == 0 {
        return Err(FwError::InvalidData("block count invalid, expected > 0".into()));
    }
    let family_id = stream.read_u32(28, Endian::Little)?;
    if flags & UF2_FLAG_HAS_FAMILY != 0 && family_id == 0 {
        return Err(FwError::InvalidData(
            "family_id required but not supplied".into(),
        ));
    }

    // the first block is representative of the whole image
    if idx == 0 {
        base.set_addr(u64::from(stream.read_u32(12, Endian::Little)?));
        base.set_idx(u64::from(family_id));
    } else if u64::from(family_id) != base.idx() {
        return Err(FwError::InvalidData(format!(
            "family_id invalid, got {family_id:#010x}, expected {:#010x}",
            base.idx()
        )));
    }

    payload.extend_from_slice(&block[UF2_DATA_OFFSET..UF2_DATA_OFFSET + datasz as usize]);
    if flags & UF2_FLAG_HAS_MD5 != 0 && datasz < 24 {
        return Err(FwError::InvalidData(
            "not enough space for MD5 checksum".into(),
        ));
    }
    if flags & UF2_FLAG_HAS_EXTENSION_TAG != 0 {
        parse_extensions(base, block, UF2_DATA_OFFSET + datasz as usize)?;
    }
    Ok(())
}

fn build_utf8_extension(tag: u32, value: &str) -> Vec<u8> {
    let mut ext = vec![
        (4 + value.len()) as u8,
        tag as u8,
        (tag >> 8) as u8,
        (tag >> 16) as u8,
    ];
    ext.extend_from_slice(value.as_bytes());
    ext.resize(align_up(ext.len(), 4), 0x00);
    ext
}

fn write_block(base: &FirmwareBase, idx: u32, total: u32, data: &[u8]) -> ResultFw<Vec<u8>> {
    let mut flags = 0u32;
    if base.idx() > 0 {
        flags |= UF2_FLAG_HAS_FAMILY;
    }

    // extension tags only go on the first block
    let mut extensions = Vec::new();
    if idx == 0 {
        if let Some(id) = base.id() {
            extensions.push(build_utf8_extension(UF2_TAG_DESCRIPTION, id));
        }
        if let Some(version) = base.version() {
            extensions.push(build_utf8_extension(UF2_TAG_VERSION, version));
        }
        if !extensions.is_empty() {
            flags |= UF2_FLAG_HAS_EXTENSION_TAG;
        }
    }

    let addr = base.addr() as u32 + idx * UF2_WRITE_PAYLOAD_SZ;
    let mut block = vec![0u8; UF2_BLOCK_SZ as usize];
    block[0..4].copy_from_slice(&UF2_MAGIC_START0.to_le_bytes());
    block[4..8].copy_from_slice(&UF2_MAGIC_START1.to_le_bytes());
    block[8..12].copy_from_slice(&flags.to_le_bytes());
    block[12..16].copy_from_slice(&addr.to_le_bytes());
    block[16..20].copy_from_slice(&(data.len() as u32).to_le_bytes());
    block[20..24].copy_from_slice(&idx.to_le_bytes());
    block[24..28].copy_from_slice(&total.to_le_bytes());
    block[28..32].copy_from_slice(&(base.idx() as u32).to_le_bytes());
    read_safe(&mut block, UF2_DATA_OFFSET, data, 0, data.len())?;

    let mut ext_offset = UF2_DATA_OFFSET + data.len();
    for ext in &extensions {
        read_safe(&mut block, ext_offset, ext, 0, ext.len())?;
        ext_offset += ext.len();
    }
    block[508..512].copy_from_slice(&UF2_MAGIC_END.to_le_bytes());
    Ok(block)
}

impl FirmwareOps for Uf2Firmware {
    fn kind(&self) -> &'static str {
        "uf2"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        let magic0 = stream.read_u32(offset, Endian::Little)?;
        let magic1 = stream.read_u32(offset + 4, Endian::Little)?;
        if magic0 != UF2_MAGIC_START0 || magic1 != UF2_MAGIC_START1 {
            return Err(FwError::NotSupported(format!(
                "field magic: got {magic0:#010x}, expected {UF2_MAGIC_START0:#010x}"
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
        let chunks = ChunkArray::from_stream(stream, None, None, UF2_BLOCK_SZ as u32)?;
        let mut payload = Vec::new();
        for chunk in &chunks {
            if chunk.data_sz() != UF2_BLOCK_SZ as usize {
                return Err(FwError::InvalidData(format!(
                    "block {:#x} truncated, got {:#x} bytes",
                    chunk.idx(),
                    chunk.data_sz()
                )));
            }
            parse_block(base, chunk.idx(), chunk.data(), &mut payload)?;
        }
        base.set_bytes(payload);
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let chunks = ChunkArray::from_bytes(base.bytes()?, None, UF2_WRITE_PAYLOAD_SZ)?;
        let mut out = Vec::new();
        for chunk in &chunks {
            out.extend_from_slice(&write_block(
                base,
                chunk.idx(),
                chunks.length(),
                chunk.data(),
            )?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_block(
        idx: u32,
        total: u32,
        addr: u32,
        family: u32,
        flags: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        block[0..4].copy_from_slice(&UF2_MAGIC_START0.to_le_bytes());
        block[4..8].copy_from_slice(&UF2_MAGIC_START1.to_le_bytes());
        block[8..12].copy_from_slice(&flags.to_le_bytes());
        block[12..16].copy_from_slice(&addr.to_le_bytes());
        block[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        block[20..24].copy_from_slice(&idx.to_le_bytes());
        block[24..28].copy_from_slice(&total.to_le_bytes());
        block[28..32].copy_from_slice(&family.to_le_bytes());
        block[32..32 + payload.len()].copy_from_slice(payload);
        block[508..512].copy_from_slice(&UF2_MAGIC_END.to_le_bytes());
        block
    }

    #[test]
    fn test_parse_minimal() {
        let mut blob = build_block(0, 2, 0x2000, 0xE48BFF56, UF2_FLAG_HAS_FAMILY, &[0x11; 256]);
        blob.extend(build_block(1, 2, 0x2100, 0xE48BFF56, UF2_FLAG_HAS_FAMILY, &[0x22; 256]));
        let mut firmware = Uf2Firmware::new();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        assert_eq!(firmware.addr(), 0x2000);
        assert_eq!(firmware.idx(), 0xE48BFF56);
        assert_eq!(firmware.bytes().unwrap().len(), 512);
    }

    #[test]
    fn test_reject_block_no_mismatch() {
        let blob = build_block(5, 2, 0x2000, 0, 0, &[0u8; 16]);
        let mut firmware = Uf2Firmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(blob), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_reject_zero_num_blocks() {
        let blob = build_block(0, 0, 0x2000, 0, 0, &[0u8; 16]);
        let mut firmware = Uf2Firmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(blob), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_reject_container() {
        let blob = build_block(0, 1, 0x2000, 0, UF2_FLAG_IS_CONTAINER, &[0u8; 16]);
        let mut firmware = Uf2Firmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(blob), ParseFlags::empty()),
            Err(FwError::NotSupported(_))
        ));
    }

    #[test]
    fn test_reject_family_mismatch() {
        let mut blob = build_block(0, 2, 0x0, 0x1111, UF2_FLAG_HAS_FAMILY, &[0u8; 16]);
        blob.extend(build_block(1, 2, 0x0, 0x2222, UF2_FLAG_HAS_FAMILY, &[0u8; 16]));
        let mut firmware = Uf2Firmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(blob), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_extension_tags() {
        let payload = [0x99u8; 16];
        let mut ext = build_utf8_extension(UF2_TAG_VERSION, "1.2");
        ext.extend(build_utf8_extension(UF2_TAG_DESCRIPTION, "unit"));
        let mut block = build_block(0, 1, 0x4000, 0, UF2_FLAG_HAS_EXTENSION_TAG, &payload);
        block[32 + payload.len()..32 + payload.len() + ext.len()].copy_from_slice(&ext);
        let mut firmware = Uf2Firmware::new();
        firmware
            .parse(&InputStream::from_vec(block), ParseFlags::empty())
            .unwrap();
        assert_eq!(firmware.version(), Some("1.2"));
        assert_eq!(firmware.id(), Some("unit"));
    }

    #[test]
    fn test_write_roundtrip() {
        let mut firmware = Uf2Firmware::new();
        firmware.set_addr(0x8000);
        firmware.set_idx(0xBFDD4EEE);
        firmware.set_id("demo");
        firmware.set_version("2.0.1");
        firmware.set_bytes((0..=255u8).cycle().take(600).collect());

        let blob = firmware.write().unwrap();
        assert_eq!(blob.len() % 512, 0);

        let mut parsed = Uf2Firmware::new();
        parsed
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        assert_eq!(parsed.addr(), 0x8000);
        assert_eq!(parsed.idx(), 0xBFDD4EEE);
        assert_eq!(parsed.id(), Some("demo"));
        assert_eq!(parsed.version(), Some("2.0.1"));
        assert_eq!(parsed.bytes().unwrap(), firmware.bytes().unwrap());
    }
}
