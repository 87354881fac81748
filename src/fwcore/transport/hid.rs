// SPDX-License-Identifier: LGPL-2.1-or-later

//! HID feature and interrupt report transport.

use std::time::Duration;

use bitflags::bitflags;
use color_print::cstr;
use hidapi::{HidApi, HidDevice};
use log::debug;

use crate::firmware::hid_descriptor::HidDescriptor;
use crate::{FwError, ResultFw};

bitflags! {
    /// Behaviour modifiers for a single report exchange
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HidReportFlags: u32 {
        /// The buffer is a feature report (byte 0 is the report ID)
        const IS_FEATURE = 1 << 0;
        /// Short reads are acceptable
        const ALLOW_TRUNC = 1 << 1;
        /// Send via the interrupt endpoint instead of the control pipe
        const USE_INTERRUPT_TRANSFER = 1 << 2;
        /// Retry once on transient failure
        const RETRY_FAILURE = 1 << 3;
    }
}

/// HID wire operations a device needs during an update.
///
/// Buffers carry the report ID in byte 0, matching the underlying library.
pub trait HidIo {
    /// Read a feature report into `buf`; returns the byte count
    fn get_feature(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        flags: HidReportFlags,
    ) -> ResultFw<usize>;

    /// Send a feature report
    fn set_feature(&mut self, buf: &[u8], timeout: Duration, flags: HidReportFlags)
    -> ResultFw<()>;

    fn interrupt_read(&mut self, buf: &mut [u8], timeout: Duration) -> ResultFw<usize>;

    fn interrupt_write(&mut self, buf: &[u8], timeout: Duration) -> ResultFw<()>;

    /// Raw report descriptor bytes
    fn report_descriptor(&mut self) -> ResultFw<Vec<u8>> {
        Err(FwError::NotSupported("no report descriptor".into()))
    }

    /// Parse the report descriptor into a queryable tree
    fn parse_descriptor(&mut self) -> ResultFw<HidDescriptor> {
        let raw = self.report_descriptor()?;
        HidDescriptor::parse(&raw)
    }
}

/// Transport over a hidraw device
pub struct HidapiTransport {
    identifier: String,
    device: HidDevice,
}

impl HidapiTransport {
    /// Open from an identifier in the format `vid:pid`, e.g. `0x17EF:0x61EB`
    pub fn open_from_identifier(identifier: &str) -> ResultFw<Self> {
        let (vid_str, pid_str) = identifier
            .split_once([':', ','])
            .ok_or_else(|| FwError::InvalidData(format!("invalid USB identifier: {identifier}")))?;
        let vid = crate::parsers::parse_number(vid_str).map_err(FwError::InvalidData)?;
        let pid = crate::parsers::parse_number(pid_str).map_err(FwError::InvalidData)?;
        Self::open(vid, pid)
    }

    /// Open the first device matching `vid:pid`
    pub fn open(vid: u16, pid: u16) -> ResultFw<Self> {
        let api = HidApi::new()
            .map_err(|err| FwError::NotFound(format!("failed to initialize HID API: {err}")))?;
        let device = api
            .open(vid, pid)
            .map_err(|err| FwError::NotFound(format!("failed to open HID device: {err}")))?;
        Ok(HidapiTransport {
            identifier: format!("{vid:04x}:{pid:04x}"),
            device,
        })
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn timeout_ms(timeout: Duration) -> i32 {
        timeout.as_millis().try_into().unwrap_or(i32::MAX)
    }
}

impl HidIo for HidapiTransport {
    fn get_feature(
        &mut self,
        buf: &mut [u8],
        _timeout: Duration,
        flags: HidReportFlags,
    ) -> ResultFw<usize> {
        let mut attempts = if flags.contains(HidReportFlags::RETRY_FAILURE) { 2 } else { 1 };
        loop {
            attempts -= 1;
            match self.device.get_feature_report(buf) {
                Ok(read) => {
                    debug!("{}: {:02X?}", cstr!("<r!>RX"), &buf[..read]);
                    if read != buf.len() && !flags.contains(HidReportFlags::ALLOW_TRUNC) {
                        return Err(FwError::Read(format!(
                            "feature report truncated, got {read:#x}, expected {:#x}",
                            buf.len()
                        )));
                    }
                    return Ok(read);
                }
                Err(err) if attempts > 0 => {
                    debug!("retrying feature read: {err}");
                }
                Err(err) => {
                    return Err(FwError::Read(err.to_string()));
                }
            }
        }
    }

    fn set_feature(
        &mut self,
        buf: &[u8],
        timeout: Duration,
        flags: HidReportFlags,
    ) -> ResultFw<()> {
        if flags.contains(HidReportFlags::USE_INTERRUPT_TRANSFER) {
            return self.interrupt_write(buf, timeout);
        }
        debug!("{}: {buf:02X?}", cstr!("<g!>TX"));
        let mut attempts = if flags.contains(HidReportFlags::RETRY_FAILURE) { 2 } else { 1 };
        loop {
            attempts -= 1;
            match self.device.send_feature_report(buf) {
                Ok(()) => return Ok(()),
                Err(err) if attempts > 0 => {
                    debug!("retrying feature write: {err}");
                }
                Err(err) => return Err(FwError::Write(err.to_string())),
            }
        }
    }

    fn interrupt_read(&mut self, buf: &mut [u8], timeout: Duration) -> ResultFw<usize> {
        let read = self
            .device
            .read_timeout(buf, Self::timeout_ms(timeout))
            .map_err(|err| FwError::Read(err.to_string()))?;
        if read == 0 {
            return Err(FwError::Timeout("no interrupt report received".into()));
        }
        debug!("{}: {:02X?}", cstr!("<r!>RX"), &buf[..read]);
        Ok(read)
    }

    fn interrupt_write(&mut self, buf: &[u8], _timeout: Duration) -> ResultFw<()> {
        debug!("{}: {buf:02X?}", cstr!("<g!>TX"));
        let written = self
            .device
            .write(buf)
            .map_err(|err| FwError::Write(err.to_string()))?;
        if written != buf.len() {
            return Err(FwError::Write(format!(
                "failed to write all bytes: wrote {written} of {}",
                buf.len()
            )));
        }
        Ok(())
    }
}
