// SPDX-License-Identifier: LGPL-2.1-or-later

//! NVM Express solid state drive: identity from the 4096-byte controller
//! identify structure, firmware delivered over admin download/commit.

use std::any::Any;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::debug;

use crate::chunks::ChunkArray;
use crate::device::{DeviceBase, DeviceFlags, DeviceOps, InstallFlags};
use crate::firmware::Firmware;
use crate::guid::{guid_from_bytes_mixed, guid_is_plausible};
use crate::progress::{Progress, Status};
use crate::version::VersionFormat;
use crate::{FwError, ResultFw};

const NVME_ID_CTRL_SIZE: usize = 0x1000;

// commit actions per the NVMe specification
const NVME_COMMIT_ACTION_CA1: u8 = 0b001; /* replace, and activate on next reset */
const NVME_COMMIT_ACTION_CA3: u8 = 0b011; /* replace, and activate immediately */

/// Quirkable behaviour switches
pub const PRIVATE_FLAG_FORCE_ALIGN: &str = "force-align";
pub const PRIVATE_FLAG_COMMIT_CA3: &str = "commit-ca3";

/// `_IOWR('N', 0x41, struct nvme_admin_cmd)`; the command block is 72 bytes
const NVME_IOCTL_ADMIN_CMD: libc::c_ulong = 0xC048_4E41;

/// Vendors that prefix the model number with their own name; the name swap
/// moves the token to the end so sorting by product works
const VENDOR_PREFIXES: [&str; 7] = [
    "TOSHIBA", "SAMSUNG", "INTEL", "KINGSTON", "SANDISK", "MICRON", "WDC",
];

/// Admin command pass-through a device uses; split out so the write flow can
/// be exercised without a kernel
pub trait NvmeAdmin {
    fn identify_ctrl(&mut self, buf: &mut [u8]) -> ResultFw<()>;
    fn fw_download(&mut self, addr: u32, data: &[u8]) -> ResultFw<()>;
    fn fw_commit(&mut self, slot: u8, action: u8, bpid: u8) -> ResultFw<()>;
}

/// Pass-through over the `/dev/nvme*` character device
pub struct NvmeIoctl {
    file: File,
}

#[repr(C)]
#[derive(Default)]
struct NvmeAdminCmd {
    opcode: u8,
    flags: u8,
    rsvd1: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    metadata: u64,
    addr: u64,
    metadata_len: u32,
    data_len: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
    timeout_ms: u32,
    result: u32,
}

impl NvmeIoctl {
    pub fn open(device_file: &Path) -> ResultFw<Self> {
        Ok(NvmeIoctl {
            file: File::open(device_file)?,
        })
    }

    fn submit(&mut self, cmd: &mut NvmeAdminCmd) -> ResultFw<()> {
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                NVME_IOCTL_ADMIN_CMD,
                std::ptr::from_mut(cmd),
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // low bits carry the NVMe status code
        match rc & 0x3FF {
            0x000 => Ok(()),
            // the device is always added needing a reboot, so a firmware
            // activation that wants a reset is still a success
            0x10B | 0x110 | 0x111 => Ok(()),
            status => Err(FwError::NotSupported(format!(
                "admin command 0x{:02x} failed with status 0x{status:03x}",
                cmd.opcode
            ))),
        }
    }
}

impl NvmeAdmin for NvmeIoctl {
    fn identify_ctrl(&mut self, buf: &mut [u8]) -> ResultFw<()> {
        let mut cmd = NvmeAdminCmd {
            opcode: 0x06,
            addr: buf.as_mut_ptr() as u64,
            data_len: buf.len() as u32,
            cdw10: 0x01,
            ..NvmeAdminCmd::default()
        };
        self.submit(&mut cmd)
    }

    fn fw_download(&mut self, addr: u32, data: &[u8]) -> ResultFw<()> {
        let mut cmd = NvmeAdminCmd {
            opcode: 0x11,
            addr: data.as_ptr() as u64,
            data_len: data.len() as u32,
            cdw10: (data.len() as u32 >> 2) - 1, /* convert to DWORDs */
            cdw11: addr >> 2,                    /* convert to DWORDs */
            ..NvmeAdminCmd::default()
        };
        self.submit(&mut cmd)
    }

    fn fw_commit(&mut self, slot: u8, action: u8, bpid: u8) -> ResultFw<()> {
        let mut cmd = NvmeAdminCmd {
            opcode: 0x10,
            cdw10: (u32::from(bpid) << 31) | (u32::from(action) << 3) | u32::from(slot),
            ..NvmeAdminCmd::default()
        };
        self.submit(&mut cmd)
    }
}

/// One NVMe controller as an updatable device
pub struct NvmeDevice {
    admin: Box<dyn NvmeAdmin>,
    pci_depth: u32,
    write_block_size: u64,
}

impl NvmeDevice {
    #[must_use]
    pub fn new(admin: Box<dyn NvmeAdmin>, pci_depth: u32) -> Self {
        NvmeDevice {
            admin,
            pci_depth,
            write_block_size: 0,
        }
    }

    /// Configure a fresh device base the way this protocol expects
    pub fn init_base(base: &mut DeviceBase) {
        base.add_flag(DeviceFlags::REQUIRE_AC);
        base.add_flag(DeviceFlags::UPDATABLE);
        base.set_version_format(VersionFormat::Plain);
        base.set_summary("NVM Express solid state drive");
        base.add_protocol("org.nvmexpress");
    }

    /// Extract a printable string from an inclusive field range, trimming
    /// leading whitespace
    fn get_string_safe(buf: &[u8], addr_start: usize, addr_end: usize) -> Option<String> {
        let mut out = String::new();
        for &byte in buf.get(addr_start..=addr_end)? {
            let ch = char::from(byte);
            if ch.is_ascii_whitespace() && out.is_empty() {
                continue;
            }
            if ch.is_ascii_graphic() || ch == ' ' {
                out.push(ch);
            }
        }
        let trimmed = out.trim_end().to_owned();
        if trimmed.is_empty() { None } else { Some(trimmed) }
    }

    fn get_guid_safe(buf: &[u8], addr_start: usize) -> Option<String> {
        let window = buf.get(addr_start..addr_start + 16)?;
        if !guid_is_plausible(window) {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(window);
        Some(guid_from_bytes_mixed(&bytes))
    }

    /// Move a leading vendor token of the model number to the end
    fn swap_vendor_prefix(name: &str) -> String {
        if let Some((first, rest)) = name.split_once(' ')
            && VENDOR_PREFIXES.contains(&first)
            && !rest.is_empty()
        {
            return format!("{rest} {first}");
        }
        name.to_owned()
    }

    /// Parse the controller identify structure into device identity
    pub fn parse_cns(&mut self, base: &mut DeviceBase, buf: &[u8]) -> ResultFw<()> {
        if buf.len() != NVME_ID_CTRL_SIZE {
            return Err(FwError::InvalidData(format!(
                "failed to parse blob, expected {NVME_ID_CTRL_SIZE:#06x} bytes"
            )));
        }

        // string fields at the offsets of the ratified 1.3c layout
        if let Some(sn) = Self::get_string_safe(buf, 4, 23) {
            base.set_serial(&sn);
        }
        let mn = Self::get_string_safe(buf, 24, 63);
        if let Some(mn) = mn.as_deref() {
            base.set_name(&Self::swap_vendor_prefix(mn));
        }
        if let Some(sr) = Self::get_string_safe(buf, 64, 71) {
            base.set_version(&sr);
        }

        // firmware update granularity scales the transfer block size
        let fwug = buf[319];
        if fwug != 0x00 && fwug != 0xFF {
            self.write_block_size = u64::from(fwug) * 0x1000;
        }

        // firmware slot information
        let fawr = (buf[260] & 0x10) >> 4;
        let nfws = (buf[260] & 0x0E) >> 1;
        let s1ro = buf[260] & 0x01;
        debug!("fawr: {fawr}, nr fw slots: {nfws}, slot1 r/o: {s1ro}");

        // FRU globally unique identifier
        if let Some(guid) = Self::get_guid_safe(buf, 127) {
            base.add_guid(&guid);
        }

        // some vendors hide an EFI GUID and component ID at fixed offsets;
        // check the component ID looks plausible before trusting either
        if let Some(component_id) = Self::get_string_safe(buf, 0xC36, 0xC3D)
            && component_id.is_ascii()
            && component_id.len() >= 6
        {
            base.add_instance_id(&format!("STORAGE-DELL-{component_id}"));
            if let Some(guid) = Self::get_guid_safe(buf, 0xC26) {
                base.add_guid(&guid);
            }
        }

        // fall back to the device description
        if base.guids().is_empty() {
            debug!("no vendor GUID, falling back to mn");
            if let Some(mn) = mn.as_deref() {
                base.add_instance_id(mn);
            }
        }
        Ok(())
    }
}

impl DeviceOps for NvmeDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn to_string_kv(&self, _base: &DeviceBase) -> Vec<(String, String)> {
        vec![("PciDepth".to_owned(), self.pci_depth.to_string())]
    }

    fn probe(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        // look at the PCI depth to work out if in an external enclosure
        if self.pci_depth <= 2 {
            base.add_flag(DeviceFlags::INTERNAL);
            base.add_flag(DeviceFlags::USABLE_DURING_UPDATE);
        }
        if !base.has_private_flag(PRIVATE_FLAG_COMMIT_CA3)
            && !base.has_flag(DeviceFlags::NEEDS_SHUTDOWN)
        {
            base.add_flag(DeviceFlags::NEEDS_REBOOT);
        }
        Ok(())
    }

    fn setup(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        let mut buf = vec![0u8; NVME_ID_CTRL_SIZE];
        self.admin.identify_ctrl(&mut buf)?;
        self.parse_cns(base, &buf)?;

        // one extra instance ID so that bad firmware can be quirked
        if let Some(version) = base.version().map(str::to_owned) {
            base.add_instance_str("VER", &version);
        }
        Ok(())
    }

    fn write_firmware(
        &mut self,
        base: &mut DeviceBase,
        firmware: &Firmware,
        progress: &mut Progress,
        _flags: InstallFlags,
    ) -> ResultFw<()> {
        let block_size = if self.write_block_size > 0 {
            self.write_block_size
        } else {
            0x1000
        };
        progress.add_step(Status::DeviceWrite, 20, None);
        progress.add_step(Status::DeviceVerify, 80, Some("commit"));

        let fw = firmware.bytes()?;

        // some vendors provide firmware files whose sizes are not multiples
        // of the block size and the device will not accept short blocks
        let mut padded;
        let fw = if base.has_private_flag(PRIVATE_FLAG_FORCE_ALIGN)
            && fw.len() % block_size as usize != 0
        {
            padded = fw.to_vec();
            let target = fw.len().div_ceil(block_size as usize) * block_size as usize;
            padded.resize(target, 0xFF);
            padded.as_slice()
        } else {
            fw
        };

        let chunks = ChunkArray::from_bytes(fw, None, block_size as u32)?;
        for chunk in &chunks {
            self.admin
                .fw_download(chunk.address() as u32, chunk.data())
                .map_err(|err| {
                    FwError::Write(format!("failed to write chunk {}: {err}", chunk.idx()))
                })?;
            progress
                .get_child()
                .set_percentage_full(u64::from(chunk.idx()) + 1, u64::from(chunks.length()));
        }
        progress.step_done();

        let commit_action = if base.has_private_flag(PRIVATE_FLAG_COMMIT_CA3) {
            NVME_COMMIT_ACTION_CA3
        } else {
            NVME_COMMIT_ACTION_CA1
        };
        self.admin
            .fw_commit(0x00, commit_action, 0x00)
            .map_err(|err| FwError::Write(format!("failed to commit to auto slot: {err}")))?;
        progress.step_done();
        Ok(())
    }

    fn set_progress(&self, _base: &DeviceBase, progress: &mut Progress) {
        progress.add_step(Status::DeviceRestart, 0, Some("detach"));
        progress.add_step(Status::DeviceWrite, 80, Some("write"));
        progress.add_step(Status::DeviceRestart, 0, Some("attach"));
        progress.add_step(Status::DeviceBusy, 20, Some("reload"));
    }

    fn set_quirk_kv(&mut self, _base: &mut DeviceBase, key: &str, value: &str) -> ResultFw<()> {
        if key == "NvmeBlockSize" {
            self.write_block_size = value
                .parse()
                .map_err(|_| FwError::InvalidData(format!("bad block size {value}")))?;
            return Ok(());
        }
        Err(FwError::NotSupported("quirk key not supported".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct FakeAdmin {
        cns: Vec<u8>,
        downloads: Rc<RefCell<Vec<(u32, usize)>>>,
        commits: Rc<RefCell<Vec<(u8, u8, u8)>>>,
    }

    impl NvmeAdmin for FakeAdmin {
        fn identify_ctrl(&mut self, buf: &mut [u8]) -> ResultFw<()> {
            buf.copy_from_slice(&self.cns);
            Ok(())
        }
        fn fw_download(&mut self, addr: u32, data: &[u8]) -> ResultFw<()> {
            self.downloads.borrow_mut().push((addr, data.len()));
            Ok(())
        }
        fn fw_commit(&mut self, slot: u8, action: u8, bpid: u8) -> ResultFw<()> {
            self.commits.borrow_mut().push((slot, action, bpid));
            Ok(())
        }
    }

    fn sample_cns() -> Vec<u8> {
        let mut buf = vec![0u8; NVME_ID_CTRL_SIZE];
        buf[4..4 + 12].copy_from_slice(b"37RSDEADBEEF");
        buf[24..24 + 21].copy_from_slice(b"TOSHIBA THNSN5512GPU7");
        buf[64..64 + 8].copy_from_slice(b"410557LA");
        buf
    }

    #[test]
    fn test_identify_parses_identity() {
        let mut device = NvmeDevice::new(
            Box::new(FakeAdmin {
                cns: sample_cns(),
                ..FakeAdmin::default()
            }),
            2,
        );
        let mut base = DeviceBase::default();
        NvmeDevice::init_base(&mut base);
        device.setup(&mut base).unwrap();
        assert_eq!(base.name(), Some("THNSN5512GPU7 TOSHIBA"));
        assert_eq!(base.version(), Some("410557LA"));
        assert_eq!(base.serial(), Some("37RSDEADBEEF"));
        // one GUID derived from the model number
        assert_eq!(base.guids().len(), 1);
        assert_eq!(
            base.guids()[0],
            "e1409b09-50cf-5aef-8ad8-760b9022f88d"
        );
    }

    #[test]
    fn test_cns_wrong_size() {
        let mut device = NvmeDevice::new(Box::new(FakeAdmin::default()), 2);
        let mut base = DeviceBase::default();
        assert!(matches!(
            device.parse_cns(&mut base, &[0u8; 512]),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_fwug_scales_block_size() {
        let mut cns = sample_cns();
        cns[319] = 0x04;
        let mut device = NvmeDevice::new(Box::new(FakeAdmin::default()), 2);
        let mut base = DeviceBase::default();
        device.parse_cns(&mut base, &cns).unwrap();
        assert_eq!(device.write_block_size, 0x4000);
    }

    #[test]
    fn test_write_chunks_and_commits() {
        let downloads = Rc::new(RefCell::new(Vec::new()));
        let commits = Rc::new(RefCell::new(Vec::new()));
        let mut device = NvmeDevice::new(
            Box::new(FakeAdmin {
                cns: sample_cns(),
                downloads: Rc::clone(&downloads),
                commits: Rc::clone(&commits),
            }),
            2,
        );
        let mut base = DeviceBase::default();
        let firmware = Firmware::from_bytes(vec![0xAB; 0x2800]);
        let mut progress = Progress::new();
        device
            .write_firmware(&mut base, &firmware, &mut progress, InstallFlags::empty())
            .unwrap();
        let downloads = downloads.borrow();
        assert_eq!(downloads.len(), 3);
        assert_eq!(downloads[0], (0x0000, 0x1000));
        assert_eq!(downloads[2], (0x2000, 0x0800));
        assert_eq!(commits.borrow()[0], (0x00, NVME_COMMIT_ACTION_CA1, 0x00));
        assert_eq!(progress.percentage(), 100);
    }

    #[test]
    fn test_force_align_pads() {
        let downloads = Rc::new(RefCell::new(Vec::new()));
        let mut device = NvmeDevice::new(
            Box::new(FakeAdmin {
                cns: sample_cns(),
                downloads: Rc::clone(&downloads),
                ..FakeAdmin::default()
            }),
            2,
        );
        let mut base = DeviceBase::default();
        base.add_private_flag(PRIVATE_FLAG_FORCE_ALIGN);
        let firmware = Firmware::from_bytes(vec![0xAB; 0x1801]);
        let mut progress = Progress::new();
        device
            .write_firmware(&mut base, &firmware, &mut progress, InstallFlags::empty())
            .unwrap();
        let downloads = downloads.borrow();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[1], (0x1000, 0x1000));
    }
}
