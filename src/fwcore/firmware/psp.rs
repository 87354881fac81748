// SPDX-License-Identifier: LGPL-2.1-or-later

//! AMD PSP container: an Embedded Firmware Structure pointing at an L1
//! directory of Image Slot Headers, each describing an A/B partition with an
//! L2 directory and a legacy VBIOS ("ATOM CSM") sub-image.

use std::any::Any;

use serde_json::{Map, Value, json};

use crate::firmware::atom::AtomFirmware;
use crate::firmware::{Firmware, FirmwareBase, FirmwareOps, ParseFlags};
use crate::stream::{Endian, InputStream};
use crate::{FwError, ResultFw};

const EFS_SIGNATURE: u32 = 0xAA55AA55;
const EFS_PSP_DIR_LOC_OFFSET: u64 = 0x10;

const PSP_DIR_MAGIC: &[u8; 4] = b"$PSP";
const PSP_L2_MAGIC: &[u8; 4] = b"$PL2";
const PSP_DIR_HEADER_SIZE: u64 = 16;
const PSP_DIR_ENTRY_SIZE: u64 = 16;
const ISH_HEADER_SIZE: u64 = 32;

// firmware IDs found in directory and slot headers
pub const FWID_ISH_A: u32 = 0x11;
pub const FWID_ISH_B: u32 = 0x12;
pub const FWID_PARTITION_A_L2: u32 = 0x01;
pub const FWID_PARTITION_B_L2: u32 = 0x02;

#[derive(Debug)]
struct DirEntry {
    fw_id: u32,
    loc: u32,
    size: u32,
}

fn parse_dir_entries(
    stream: &InputStream,
    offset: u64,
    magic: &[u8; 4],
) -> ResultFw<Vec<DirEntry>> {
    let found = stream.read_bytes(offset, 4)?;
    if found != magic {
        return Err(FwError::InvalidData(format!(
            "field magic: got {found:02x?}, expected {magic:02x?}"
        )));
    }
    let total_entries = stream.read_u32(offset + 8, Endian::Little)?;
    let mut entries = Vec::new();
    let mut entry_offset = offset + PSP_DIR_HEADER_SIZE;
    for _ in 0..total_entries {
        entries.push(DirEntry {
            fw_id: stream.read_u32(entry_offset, Endian::Little)?,
            loc: stream.read_u32(entry_offset + 4, Endian::Little)?,
            size: stream.read_u32(entry_offset + 8, Endian::Little)?,
        });
        entry_offset += PSP_DIR_ENTRY_SIZE;
    }
    Ok(entries)
}

#[derive(Debug)]
struct ImageSlotHeader {
    loc: u32,
    slot_max_size: u32,
    fw_id: u32,
    loc_csm: u32,
}

fn parse_ish(stream: &InputStream, offset: u64) -> ResultFw<ImageSlotHeader> {
    stream.read_bytes(offset, ISH_HEADER_SIZE as usize)?;
    Ok(ImageSlotHeader {
        loc: stream.read_u32(offset + 0x0C, Endian::Little)?,
        slot_max_size: stream.read_u32(offset + 0x14, Endian::Little)?,
        fw_id: stream.read_u32(offset + 0x18, Endian::Little)?,
        loc_csm: stream.read_u32(offset + 0x1C, Endian::Little)?,
    })
}

/// The outer PSP firmware image
#[derive(Debug, Default)]
pub struct PspFirmware {
    dir_location: u32,
}

impl PspFirmware {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(PspFirmware::default()))
    }

    fn parse_l2(
        l2_img: &mut Firmware,
        stream: &InputStream,
        offset: u64,
    ) -> ResultFw<()> {
        for entry in parse_dir_entries(stream, offset, PSP_L2_MAGIC)? {
            let mut blob = Firmware::from_bytes(
                stream.read_bytes(u64::from(entry.loc), entry.size as usize)?,
            );
            blob.set_idx(u64::from(entry.fw_id));
            blob.set_addr(u64::from(entry.loc));
            l2_img.add_image(blob)?;
        }
        Ok(())
    }

    fn parse_l1(
        base: &mut FirmwareBase,
        stream: &InputStream,
        offset: u64,
        flags: ParseFlags,
    ) -> ResultFw<()> {
        for entry in parse_dir_entries(stream, offset, PSP_DIR_MAGIC)? {
            let mut ish_img = Firmware::new();
            match entry.fw_id {
                FWID_ISH_A => ish_img.set_id("ISH_A"),
                FWID_ISH_B => ish_img.set_id("ISH_B"),
                _ => {
                    return Err(FwError::InvalidData(format!(
                        "unknown ISH FWID: {:x}",
                        entry.fw_id
                    )));
                }
            }

            // parse the image slot header
            let loc = u64::from(entry.loc);
            let ish = parse_ish(stream, loc)?;
            ish_img.parse_stream(stream, loc, flags)?;
            ish_img.set_addr(loc);

            // parse the csm image
            let mut csm_img = AtomFirmware::new();
            let csm_loc = u64::from(ish.loc_csm);
            csm_img.parse_stream(stream, csm_loc, flags | ParseFlags::NO_SEARCH)?;
            csm_img.set_addr(csm_loc);

            let mut l2_img = Firmware::new();
            match ish.fw_id {
                FWID_PARTITION_A_L2 => {
                    l2_img.set_id("PARTITION_A");
                    csm_img.set_id("ATOM_CSM_A");
                }
                FWID_PARTITION_B_L2 => {
                    l2_img.set_id("PARTITION_B");
                    csm_img.set_id("ATOM_CSM_B");
                }
                _ => {
                    return Err(FwError::InvalidData(format!(
                        "unknown Partition FWID: {:x}",
                        ish.fw_id
                    )));
                }
            }
            l2_img.add_image(csm_img)?;

            let partition_loc = u64::from(ish.loc);
            let partition_stream =
                stream.partial(partition_loc, u64::from(ish.slot_max_size))?;
            l2_img.parse_stream(&partition_stream, 0, flags)?;
            l2_img.set_addr(partition_loc);

            // parse the partition directory
            Self::parse_l2(&mut l2_img, stream, partition_loc)?;

            ish_img.add_image(l2_img)?;
            base.add_image(ish_img)?;
        }
        Ok(())
    }
}

impl FirmwareOps for PspFirmware {
    fn kind(&self) -> &'static str {
        "amd-psp"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        let signature = stream.read_u32(offset, Endian::Little)?;
        if signature != EFS_SIGNATURE {
            return Err(FwError::NotSupported(format!(
                "field signature: got {signature:#010x}, expected {EFS_SIGNATURE:#010x}"
            )));
        }
        let dir_loc = stream.read_u32(offset + EFS_PSP_DIR_LOC_OFFSET, Endian::Little)?;
        let magic = stream.read_bytes(offset + u64::from(dir_loc), 4)?;
        if magic != PSP_DIR_MAGIC {
            return Err(FwError::NotSupported(
                "field magic: no PSP directory".into(),
            ));
        }
        Ok(())
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<()> {
        let signature = stream.read_u32(0, Endian::Little)?;
        if signature != EFS_SIGNATURE {
            return Err(FwError::InvalidData(format!(
                "field signature: got {signature:#010x}, expected {EFS_SIGNATURE:#010x}"
            )));
        }
        self.dir_location = stream.read_u32(EFS_PSP_DIR_LOC_OFFSET, Endian::Little)?;
        Self::parse_l1(base, stream, u64::from(self.dir_location), flags)
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        node.insert("dir_location".into(), json!(self.dir_location));
    }
}

/// Part number of the VBIOS in partition A, used to gate update acceptance
pub fn vbios_part_number(firmware: &Firmware) -> ResultFw<String> {
    let ish_a = firmware.image_by_id("ISH_A")?;
    let partition_a = ish_a.image_by_id("PARTITION_A")?;
    let csm = partition_a.image_by_id("ATOM_CSM_A")?;
    let atom = csm
        .ops_as::<AtomFirmware>()
        .ok_or_else(|| FwError::Internal("CSM image is not an ATOM image".into()))?;
    atom.part_number()
        .map(str::to_owned)
        .ok_or_else(|| FwError::NotFound("no VBIOS part number".into()))
}

#[cfg(test)]
pub(crate) fn build_test_container() -> Vec<u8> {
    let mut buf = vec![0u8; 0x2000];
    // EFS
    buf[0..4].copy_from_slice(&EFS_SIGNATURE.to_le_bytes());
    buf[0x10..0x14].copy_from_slice(&0x100u32.to_le_bytes());
    // L1 directory with one ISH_A entry
    buf[0x100..0x104].copy_from_slice(PSP_DIR_MAGIC);
    buf[0x108..0x10C].copy_from_slice(&1u32.to_le_bytes());
    buf[0x110..0x114].copy_from_slice(&FWID_ISH_A.to_le_bytes());
    buf[0x114..0x118].copy_from_slice(&0x140u32.to_le_bytes());
    buf[0x118..0x11C].copy_from_slice(&0x20u32.to_le_bytes());
    // image slot header
    buf[0x14C..0x150].copy_from_slice(&0x800u32.to_le_bytes()); // partition loc
    buf[0x154..0x158].copy_from_slice(&0x200u32.to_le_bytes()); // slot max size
    buf[0x158..0x15C].copy_from_slice(&FWID_PARTITION_A_L2.to_le_bytes());
    buf[0x15C..0x160].copy_from_slice(&0x1000u32.to_le_bytes()); // csm loc
    // L2 directory with one opaque blob
    buf[0x800..0x804].copy_from_slice(PSP_L2_MAGIC);
    buf[0x808..0x80C].copy_from_slice(&1u32.to_le_bytes());
    buf[0x810..0x814].copy_from_slice(&0x42u32.to_le_bytes());
    buf[0x814..0x818].copy_from_slice(&0x900u32.to_le_bytes());
    buf[0x818..0x81C].copy_from_slice(&0x10u32.to_le_bytes());
    buf[0x900..0x910].copy_from_slice(&[0xA5; 16]);
    // ATOM CSM image
    let atom = crate::firmware::atom::build_test_image();
    buf[0x1000..0x1000 + atom.len()].copy_from_slice(&atom);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let mut firmware = PspFirmware::new();
        firmware
            .parse(
                &InputStream::from_vec(build_test_container()),
                ParseFlags::empty(),
            )
            .unwrap();
        let ops = firmware.ops_as::<PspFirmware>().unwrap();
        assert_eq!(ops.dir_location, 0x100);

        let ish_a = firmware.image_by_id("ISH_A").unwrap();
        assert_eq!(ish_a.addr(), 0x140);
        let partition = ish_a.image_by_id("PARTITION_A").unwrap();
        assert_eq!(partition.addr(), 0x800);
        let csm = partition.image_by_id("ATOM_CSM_A").unwrap();
        assert_eq!(csm.addr(), 0x1000);
        // L2 entries become opaque children of the partition
        let blob = partition.image_by_idx(0x42).unwrap();
        assert_eq!(blob.bytes().unwrap(), &[0xA5; 16]);

        assert_eq!(
            vbios_part_number(&firmware).unwrap(),
            "113-D7550200-102"
        );
    }

    #[test]
    fn test_unknown_ish_fwid() {
        let mut container = build_test_container();
        container[0x110..0x114].copy_from_slice(&0x99u32.to_le_bytes());
        let mut firmware = PspFirmware::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(container), ParseFlags::empty()),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_validate_rejects_junk() {
        let firmware = PspFirmware::new();
        assert!(matches!(
            firmware.validate(&InputStream::from_vec(vec![0u8; 64]), 0),
            Err(FwError::NotSupported(_))
        ));
    }
}
