// SPDX-License-Identifier: LGPL-2.1-or-later

//! Plugin surface: binds probe events to device types and format names to
//! firmware parsers, and hooks the composite transaction.

use crate::backend::ProbeEvent;
use crate::device::{Device, DeviceRef};
use crate::firmware::Firmware;
use crate::ResultFw;

/// One registered plugin
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Subsystem filters; an empty list sees every event
    fn subsystems(&self) -> &'static [&'static str] {
        &[]
    }

    /// Instantiate a device for a matching probe event, or decline it
    fn create_device(&mut self, _event: &ProbeEvent) -> Option<Device> {
        None
    }

    /// Instantiate the firmware parser registered under `format_id`
    fn firmware_new(&self, _format_id: &str) -> Option<Firmware> {
        None
    }

    /// Runs once before any device of a composite transaction is opened,
    /// e.g. to switch a shared controller into a flashing mode
    fn composite_prepare(&mut self, _devices: &[DeviceRef]) -> ResultFw<()> {
        Ok(())
    }

    /// Runs once after every device of a composite transaction closed
    fn composite_cleanup(&mut self, _devices: &[DeviceRef]) -> ResultFw<()> {
        Ok(())
    }
}

/// Construct a firmware parser by registered format name, independent of any
/// plugin; this is the registry the offline tooling uses
#[must_use]
pub fn firmware_from_format(format_id: &str) -> Option<Firmware> {
    use crate::firmware as fw;
    match format_id {
        "raw" => Some(Firmware::new()),
        "archive" => Some(fw::archive::ArchiveFirmware::new()),
        "ihex" => Some(fw::ihex::IhexFirmware::new()),
        "hailuck-kbd" => Some(fw::ihex::HailuckKbdFirmware::new()),
        "uf2" => Some(fw::uf2::Uf2Firmware::new()),
        "tpm-eventlog-v1" => Some(fw::tpm_eventlog::TpmEventlogV1::new()),
        "tpm-eventlog-v2" => Some(fw::tpm_eventlog::TpmEventlogV2::new()),
        "acpi-phat" => Some(fw::phat::PhatFirmware::new()),
        "amd-psp" => Some(fw::psp::PspFirmware::new()),
        "amd-atom" => Some(fw::atom::AtomFirmware::new()),
        "usb4-nvm" => Some(fw::usb4_nvm::Usb4NvmFirmware::new()),
        "dock" => Some(fw::dock::DockFirmware::new()),
        _ => None,
    }
}

/// All format names accepted by [`firmware_from_format`]
#[must_use]
pub fn firmware_formats() -> &'static [&'static str] {
    &[
        "raw",
        "archive",
        "ihex",
        "hailuck-kbd",
        "uf2",
        "tpm-eventlog-v1",
        "tpm-eventlog-v2",
        "acpi-phat",
        "amd-psp",
        "amd-atom",
        "usb4-nvm",
        "dock",
    ]
}
