// SPDX-License-Identifier: LGPL-2.1-or-later

//! File and block-device I/O, plus the volume mount discipline: a volume is
//! either observed where the user session mounted it, or mounted privately
//! and guaranteed to be unmounted on every exit path.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::chunks::ChunkArray;
use crate::progress::Progress;
use crate::stream::InputStream;
use crate::{FwError, ResultFw};

const SET_CONTENTS_BLOCK_SZ: u32 = 0x8000;

/// Read a whole file from within a mounted device
pub fn get_contents(path: &Path) -> ResultFw<Vec<u8>> {
    let mut file = File::open(path)
        .map_err(|err| FwError::NotFound(format!("no file {}: {err}", path.display())))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Stream a payload into a file in fixed-size pieces, reporting progress
pub fn set_contents(
    path: &Path,
    stream: &InputStream,
    progress: Option<&mut Progress>,
) -> ResultFw<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let chunks = ChunkArray::from_stream(stream, None, None, SET_CONTENTS_BLOCK_SZ)?;
    let mut progress = progress;
    for chunk in &chunks {
        file.write_all(chunk.data())?;
        if let Some(progress) = progress.as_deref_mut() {
            progress.set_percentage_full(u64::from(chunk.idx()) + 1, u64::from(chunks.length()));
        }
    }
    file.sync_all()?;
    Ok(())
}

/// A mountable filesystem volume backed by a block device.
///
/// When this object did the mounting, dropping it unmounts again; a volume
/// mounted by the user session is left alone.
#[derive(Debug)]
pub struct Volume {
    device: PathBuf,
    mount_point: Option<PathBuf>,
    privately_mounted: bool,
}

impl Volume {
    /// Look the device up in the mount table
    pub fn new_by_device(device: &Path) -> ResultFw<Self> {
        let mount_point = find_mount_point(device)?;
        Ok(Volume {
            device: device.to_path_buf(),
            mount_point,
            privately_mounted: false,
        })
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mount_point.is_some()
    }

    /// Where the volume is mounted
    pub fn mount_point(&self) -> ResultFw<&Path> {
        self.mount_point
            .as_deref()
            .ok_or_else(|| FwError::NotFound(format!("{} is not mounted", self.device.display())))
    }

    /// Mount privately if the user session has not already done so
    pub fn mount(&mut self) -> ResultFw<()> {
        if self.is_mounted() {
            return Ok(());
        }
        let target = std::env::temp_dir().join(format!(
            "fwcore-{}",
            self.device
                .file_name()
                .map_or_else(|| "volume".into(), |name| name.to_string_lossy())
        ));
        std::fs::create_dir_all(&target)?;
        let source = path_cstring(&self.device)?;
        let target_c = path_cstring(&target)?;
        let fstype = CString::new("vfat").unwrap();
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target_c.as_ptr(),
                fstype.as_ptr(),
                0,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        debug!("privately mounted {} on {}", self.device.display(), target.display());
        self.mount_point = Some(target);
        self.privately_mounted = true;
        Ok(())
    }

    /// Unmount, but only if this object mounted the volume
    pub fn unmount(&mut self) -> ResultFw<()> {
        if !self.privately_mounted {
            return Ok(());
        }
        let Some(mount_point) = self.mount_point.take() else {
            return Ok(());
        };
        let target = path_cstring(&mount_point)?;
        let rc = unsafe { libc::umount(target.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.privately_mounted = false;
        Ok(())
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if self.privately_mounted {
            if let Err(err) = self.unmount() {
                warn!("failed to unmount {}: {err}", self.device.display());
            }
        }
    }
}

fn path_cstring(path: &Path) -> ResultFw<CString> {
    CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| FwError::Internal(format!("path {} contains NUL", path.display())))
}

fn find_mount_point(device: &Path) -> ResultFw<Option<PathBuf>> {
    let mounts = std::fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(target)) = (fields.next(), fields.next()) else {
            continue;
        };
        if Path::new(source) == device {
            // mount entries escape spaces as octal
            return Ok(Some(PathBuf::from(target.replace("\\040", " "))));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contents_roundtrip_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.bin");
        let payload: Vec<u8> = (0u8..=255).cycle().take(0x12345).collect();
        let mut progress = Progress::new();
        set_contents(
            &path,
            &InputStream::from_vec(payload.clone()),
            Some(&mut progress),
        )
        .unwrap();
        assert_eq!(progress.percentage(), 100);
        assert_eq!(get_contents(&path).unwrap(), payload);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        assert!(matches!(
            get_contents(Path::new("/nonexistent/fw.bin")),
            Err(FwError::NotFound(_))
        ));
    }

    #[test]
    fn test_unmounted_volume() {
        let volume = Volume::new_by_device(Path::new("/dev/nonexistent0")).unwrap();
        assert!(!volume.is_mounted());
        assert!(matches!(volume.mount_point(), Err(FwError::NotFound(_))));
    }
}
