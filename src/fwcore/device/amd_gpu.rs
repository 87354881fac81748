// SPDX-License-Identifier: LGPL-2.1-or-later

//! Discrete AMD GPU updated through the kernel `psp_vbflash` interface.

use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};

use crate::device::{DeviceBase, DeviceFlags, DeviceOps, InstallFlags, retry};
use crate::firmware::psp::{PspFirmware, vbios_part_number};
use crate::firmware::{Firmware, ParseFlags};
use crate::progress::{Progress, Status};
use crate::stream::InputStream;
use crate::transport::block::set_contents;
use crate::transport::read_sysfs_line;
use crate::{FwError, ResultFw};

const VBFLASH_STATUS_SUCCESS: u64 = 0;
const VBFLASH_MAX_POLL: u32 = 100;
const VBFLASH_POLL_DELAY: Duration = Duration::from_millis(100);

/// One GPU addressed through its sysfs directory
pub struct AmdGpuDevice {
    sysfs_path: PathBuf,
    vbios_pn: Option<String>,
}

impl AmdGpuDevice {
    #[must_use]
    pub fn new(sysfs_path: PathBuf) -> Self {
        AmdGpuDevice {
            sysfs_path,
            vbios_pn: None,
        }
    }

    fn vbflash_path(&self) -> PathBuf {
        self.sysfs_path.join("psp_vbflash")
    }

    fn vbflash_status(&self) -> ResultFw<u64> {
        let text = read_sysfs_line(&self.sysfs_path.join("psp_vbflash_status"), 0)?;
        text.trim()
            .parse()
            .map_err(|_| FwError::InvalidData(format!("status {text} is not a number")))
    }
}

impl DeviceOps for AmdGpuDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn probe(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        // flashing is only possible when the kernel exposes both files
        if !self.vbflash_path().exists()
            || !self.sysfs_path.join("psp_vbflash_status").exists()
        {
            return Err(FwError::NotSupported(
                "kernel does not support VBIOS flash".into(),
            ));
        }
        base.add_flag(DeviceFlags::UPDATABLE);
        base.add_flag(DeviceFlags::INTERNAL);
        base.add_flag(DeviceFlags::NEEDS_REBOOT);
        base.add_flag(DeviceFlags::SIGNED_PAYLOAD);
        base.add_protocol("com.amd.psp");
        Ok(())
    }

    fn setup(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        // the running VBIOS identifies which images are acceptable
        let part = read_sysfs_line(&self.sysfs_path.join("vbios_version"), 0)?;
        let part = part.trim().to_owned();
        base.add_instance_id(&format!("AMD\\{part}"));
        self.vbios_pn = Some(part);
        Ok(())
    }

    fn prepare_firmware(
        &mut self,
        _base: &mut DeviceBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<Firmware> {
        let mut firmware = PspFirmware::new();
        firmware.parse(stream, flags)?;

        // we always flash the contents of partition A
        let fw_pn = vbios_part_number(&firmware)?;
        if let Some(vbios_pn) = self.vbios_pn.as_deref()
            && fw_pn != vbios_pn
        {
            if !flags.contains(ParseFlags::FORCE) {
                return Err(FwError::InvalidFile(format!(
                    "firmware for {fw_pn} does not match {vbios_pn}"
                )));
            }
            warn!("firmware for {fw_pn} does not match {vbios_pn} but is being force installed");
        }
        Ok(firmware)
    }

    fn write_firmware(
        &mut self,
        _base: &mut DeviceBase,
        firmware: &Firmware,
        progress: &mut Progress,
        _flags: InstallFlags,
    ) -> ResultFw<()> {
        let path = self.vbflash_path();

        // stage the image
        progress.set_status(Status::DeviceWrite);
        set_contents(
            &path,
            &InputStream::from_slice(firmware.bytes()?),
            Some(progress),
        )?;

        // trigger the update by reading one byte back; the driver returns
        // zero bytes so any error here still means "triggered"
        let mut trigger = [0u8; 1];
        match OpenOptions::new()
            .read(true)
            .open(&path)
            .and_then(|mut file: File| file.read(&mut trigger))
        {
            Ok(_) => debug!("triggered update"),
            Err(err) => debug!("triggered update: {err}"),
        }

        // poll for completion
        progress.set_status(Status::DeviceBusy);
        retry(
            |_attempt| {
                let status = self.vbflash_status()?;
                if status != VBFLASH_STATUS_SUCCESS {
                    return Err(FwError::Busy(format!("status was {status}")));
                }
                Ok(())
            },
            VBFLASH_MAX_POLL,
            VBFLASH_POLL_DELAY,
        )
    }

    fn set_progress(&self, _base: &DeviceBase, progress: &mut Progress) {
        progress.add_step(Status::DeviceRestart, 0, None); /* detach */
        progress.add_step(Status::DeviceWrite, 100, None); /* write */
        progress.add_step(Status::DeviceRestart, 0, None); /* attach */
        progress.add_step(Status::DeviceBusy, 0, None); /* reload */
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_gpu(dir: &std::path::Path, part: &str) -> AmdGpuDevice {
        fs::write(dir.join("psp_vbflash"), b"").unwrap();
        fs::write(dir.join("psp_vbflash_status"), b"0\n").unwrap();
        fs::write(dir.join("vbios_version"), format!("{part}\n")).unwrap();
        AmdGpuDevice::new(dir.to_path_buf())
    }

    #[test]
    fn test_probe_and_setup() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = fake_gpu(dir.path(), "113-D7550200-102");
        let mut base = DeviceBase::default();
        device.probe(&mut base).unwrap();
        assert!(base.has_flag(DeviceFlags::UPDATABLE));
        device.setup(&mut base).unwrap();
        assert_eq!(device.vbios_pn.as_deref(), Some("113-D7550200-102"));
        assert_eq!(base.instance_ids()[0], "AMD\\113-D7550200-102");
    }

    #[test]
    fn test_probe_without_kernel_support() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = AmdGpuDevice::new(dir.path().to_path_buf());
        let mut base = DeviceBase::default();
        assert!(matches!(
            device.probe(&mut base),
            Err(FwError::NotSupported(_))
        ));
    }

    #[test]
    fn test_prepare_firmware_gates_part_number() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = fake_gpu(dir.path(), "113-MISMATCH-000");
        let mut base = DeviceBase::default();
        device.setup(&mut base).unwrap();
        let stream = InputStream::from_vec(crate::firmware::psp::build_test_container());
        assert!(matches!(
            device.prepare_firmware(&mut base, &stream, ParseFlags::empty()),
            Err(FwError::InvalidFile(_))
        ));
        // the force flag downgrades the mismatch to a warning
        device
            .prepare_firmware(&mut base, &stream, ParseFlags::FORCE)
            .unwrap();
    }

    #[test]
    fn test_write_firmware_polls_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = fake_gpu(dir.path(), "113-D7550200-102");
        let mut base = DeviceBase::default();
        let firmware = Firmware::from_bytes(vec![0x77; 0x100]);
        let mut progress = Progress::new();
        device
            .write_firmware(&mut base, &firmware, &mut progress, InstallFlags::empty())
            .unwrap();
        assert_eq!(fs::read(dir.path().join("psp_vbflash")).unwrap(), vec![0x77; 0x100]);
    }
}
