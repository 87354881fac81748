// SPDX-License-Identifier: LGPL-2.1-or-later

//! Intel MEI message transport: connect via ioctl, then exchange raw buffers
//! on the character device, gated by a select-style poll.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::guid::guid_to_bytes_mixed;
use crate::transport::read_sysfs_line;
use crate::ResultFw;
use crate::FwError;

/// `_IOWR('H', 0x01, struct mei_connect_client_data)`; the argument union is
/// 16 bytes in both directions
const IOCTL_MEI_CONNECT_CLIENT: libc::c_ulong = iowr(b'H', 0x01, 16);

const fn iowr(kind: u8, nr: u8, size: u16) -> libc::c_ulong {
    // _IOC(_IOC_READ | _IOC_WRITE, kind, nr, size)
    ((3 as libc::c_ulong) << 30)
        | ((size as libc::c_ulong) << 16)
        | ((kind as libc::c_ulong) << 8)
        | (nr as libc::c_ulong)
}

/// MEI wire operations plus the sysfs side-channel of the parent device
pub trait MeiIo {
    /// Connect the client UUID; returns `(max_msg_length, protocol_version)`
    fn connect(&mut self, uuid: &str, req_protocol_version: u8) -> ResultFw<(u32, u8)>;

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> ResultFw<usize>;

    fn write(&mut self, buf: &[u8], timeout: Duration) -> ResultFw<()>;

    /// Largest message the firmware accepts, valid after `connect`
    fn max_msg_length(&self) -> u32;

    /// Protocol version negotiated by `connect`, 0 when unset
    fn protocol_version(&self) -> u8 {
        0
    }

    /// The `mei[0-9]` sysfs directory backing the side-channel reads
    fn parent_device_file(&self) -> Option<String> {
        None
    }

    /// The `fw_ver` line at `idx` from the parent `mei[0-9]` device
    fn fw_ver(&mut self, idx: usize) -> ResultFw<String>;

    /// The `fw_status` line at `idx` from the parent `mei[0-9]` device
    fn fw_status(&mut self, idx: usize) -> ResultFw<String>;
}

/// Transport over `/dev/mei*`
pub struct MeiTransport {
    file: File,
    parent_device_file: PathBuf,
    max_msg_length: u32,
    protocol_version: u8,
}

impl MeiTransport {
    /// Open a MEI character device; `parent_device_file` is the sysfs
    /// directory carrying `fw_ver`/`fw_status`
    pub fn open(device_file: &Path, parent_device_file: &Path) -> ResultFw<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_file)?;
        Ok(MeiTransport {
            file,
            parent_device_file: parent_device_file.to_path_buf(),
            max_msg_length: 0,
            protocol_version: 0,
        })
    }

    fn select_readable(&self, timeout: Duration) -> ResultFw<bool> {
        let fd = self.file.as_raw_fd();
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
        };
        unsafe {
            let mut set: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut set);
            libc::FD_SET(fd, &mut set);
            let rc = libc::select(fd + 1, &mut set, std::ptr::null_mut(), std::ptr::null_mut(), &mut tv);
            if rc < 0 {
                return Err(FwError::Write(format!(
                    "write failed on select with status {rc}"
                )));
            }
            Ok(rc > 0 && libc::FD_ISSET(fd, &set))
        }
    }
}

impl MeiIo for MeiTransport {
    fn connect(&mut self, uuid: &str, req_protocol_version: u8) -> ResultFw<(u32, u8)> {
        // in: client UUID, mixed-endian; out: client properties
        let mut data = [0u8; 16];
        data.copy_from_slice(&guid_to_bytes_mixed(uuid)?);
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_MEI_CONNECT_CLIENT,
                data.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let max_msg_length = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let protocol_version = data[4];
        if req_protocol_version > 0 && protocol_version != req_protocol_version {
            return Err(FwError::NotSupported(format!(
                "Intel MEI protocol version not supported {protocol_version}"
            )));
        }
        self.max_msg_length = max_msg_length;
        self.protocol_version = protocol_version;
        debug!("connected {uuid}: max_msg_length {max_msg_length:#x} protocol {protocol_version}");
        Ok((max_msg_length, protocol_version))
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> ResultFw<usize> {
        let rc = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if rc < 0 {
            return Err(FwError::Read(format!(
                "read failed: {}",
                io::Error::last_os_error()
            )));
        }
        debug!("read {rc:#x} bytes");
        Ok(rc as usize)
    }

    fn write(&mut self, buf: &[u8], timeout: Duration) -> ResultFw<()> {
        let written =
            unsafe { libc::write(self.file.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if written < 0 {
            return Err(FwError::Write(format!(
                "write failed: {}",
                io::Error::last_os_error()
            )));
        }
        if written as usize != buf.len() {
            return Err(FwError::Write(format!(
                "only wrote {written} of {}",
                buf.len()
            )));
        }
        // the device signals message consumption by becoming readable
        if !self.select_readable(timeout)? {
            return Err(FwError::Write("write failed on timeout".into()));
        }
        Ok(())
    }

    fn max_msg_length(&self) -> u32 {
        self.max_msg_length
    }

    fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    fn parent_device_file(&self) -> Option<String> {
        Some(self.parent_device_file.display().to_string())
    }

    fn fw_ver(&mut self, idx: usize) -> ResultFw<String> {
        read_sysfs_line(&self.parent_device_file.join("fw_ver"), idx)
    }

    fn fw_status(&mut self, idx: usize) -> ResultFw<String> {
        read_sysfs_line(&self.parent_device_file.join("fw_status"), idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_number() {
        // pinned so a refactor cannot silently change the ABI
        assert_eq!(IOCTL_MEI_CONNECT_CLIENT, 0xC010_4801);
    }
}
