// SPDX-License-Identifier: LGPL-2.1-or-later

//! Mass-storage bootloader device: the firmware is a UF2 file dropped onto a
//! FAT volume that the device exposes after reset.

use std::any::Any;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use crate::device::{DeviceBase, DeviceFlags, DeviceOps, InstallFlags, retry};
use crate::firmware::uf2::Uf2Firmware;
use crate::firmware::{Firmware, ParseFlags};
use crate::progress::{Progress, Status};
use crate::stream::InputStream;
use crate::transport::block::{Volume, get_contents, set_contents};
use crate::{FwError, ResultFw};

const FIRMWARE_FILENAME: &str = "FIRMWARE.UF2";
const INFO_FILENAME: &str = "INFO_UF2.TXT";
const MOUNT_POLL_COUNT: u32 = 30;
const MOUNT_POLL_DELAY: Duration = Duration::from_millis(500);

/// One UF2 bootloader volume
pub struct Uf2Device {
    device_file: PathBuf,
    volume: Option<Volume>, /* non-empty when mounted privately */
    family_id: u64,
}

impl Uf2Device {
    #[must_use]
    pub fn new(device_file: PathBuf) -> Self {
        Uf2Device {
            device_file,
            volume: None,
            family_id: 0,
        }
    }

    /// Configure a fresh device base the way this protocol expects
    pub fn init_base(base: &mut DeviceBase) {
        base.add_flag(DeviceFlags::UPDATABLE);
        base.add_flag(DeviceFlags::IS_BOOTLOADER);
        base.set_remove_delay(Duration::from_secs(30));
        base.add_protocol("com.microsoft.uf2");
    }

    fn file_path(&self, filename: &str) -> ResultFw<PathBuf> {
        let volume = Volume::new_by_device(&self.device_file)?;
        Ok(volume.mount_point()?.join(filename))
    }

    /// Wait for the user session to mount the volume; only fall back to a
    /// private mount when it never shows up, as a private mount makes the
    /// files invisible to the user
    fn ensure_mounted(&mut self) -> ResultFw<()> {
        let wait = retry(
            |_attempt| {
                let volume = Volume::new_by_device(&self.device_file)?;
                if volume.is_mounted() {
                    Ok(())
                } else {
                    Err(FwError::Busy("is not mounted".into()))
                }
            },
            MOUNT_POLL_COUNT,
            MOUNT_POLL_DELAY,
        );
        if wait.is_err() {
            debug!("user session never mounted the volume, mounting privately");
            let mut volume = Volume::new_by_device(&self.device_file)?;
            volume.mount()?;
            self.volume = Some(volume);
        }
        Ok(())
    }

    fn release_mount(&mut self) -> ResultFw<()> {
        // we only unmount when the mount was ours
        if let Some(mut volume) = self.volume.take() {
            volume.unmount()?;
        }
        Ok(())
    }
}

impl DeviceOps for Uf2Device {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn setup(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        // the info file carries the board identity used for quirk matching
        let info_path = self.file_path(INFO_FILENAME)?;
        let text = String::from_utf8_lossy(&get_contents(&info_path)?).into_owned();
        for line in text.lines() {
            if let Some(model) = line.strip_prefix("Model: ") {
                base.set_name(model.trim());
            } else if let Some(board_id) = line.strip_prefix("Board-ID: ") {
                base.add_instance_id(&format!("UF2\\BOARD_{}", board_id.trim()));
            }
        }
        Ok(())
    }

    fn prepare_firmware(
        &mut self,
        base: &mut DeviceBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<Firmware> {
        crate::device::check_firmware_size(base, stream.size())?;
        let mut firmware = Uf2Firmware::new();
        firmware.parse(stream, flags)?;
        if self.family_id != 0
            && firmware.idx() != self.family_id
            && !flags.contains(ParseFlags::IGNORE_VID_PID)
        {
            return Err(FwError::InvalidFile(format!(
                "firmware family {:#010x} does not match device {:#010x}",
                firmware.idx(),
                self.family_id
            )));
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
        self.ensure_mounted()?;
        let path = self.file_path(FIRMWARE_FILENAME)?;
        progress.set_status(Status::DeviceWrite);
        // writing the blocks makes the device reboot into the new image
        set_contents(&path, &InputStream::from_vec(firmware.write()?), Some(progress))
    }

    fn cleanup(
        &mut self,
        _base: &mut DeviceBase,
        _progress: &mut Progress,
        _cancelled: bool,
    ) -> ResultFw<()> {
        self.release_mount()
    }

    fn close(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        self.release_mount()
    }

    fn set_quirk_kv(&mut self, _base: &mut DeviceBase, key: &str, value: &str) -> ResultFw<()> {
        if key == "Uf2FamilyId" {
            let trimmed = value.trim_start_matches("0x");
            self.family_id = u64::from_str_radix(trimmed, 16)
                .map_err(|_| FwError::InvalidData(format!("bad family ID {value}")))?;
            return Ok(());
        }
        Err(FwError::NotSupported(format!("quirk key {key} not supported")))
    }

    fn set_progress(&self, _base: &DeviceBase, progress: &mut Progress) {
        progress.add_step(Status::DeviceRestart, 0, Some("detach"));
        progress.add_step(Status::DeviceWrite, 100, Some("write"));
        progress.add_step(Status::DeviceRestart, 0, Some("attach"));
        progress.add_step(Status::DeviceBusy, 0, Some("reload"));
    }
}
