// SPDX-License-Identifier: LGPL-2.1-or-later

//! Dock controller and its proxied child devices.
//!
//! The MCU owns the HID handle; pad children route every transfer through it
//! and may only be open while the controller is open. The wire protocol is a
//! feature-report command set with a polled status register.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::debug;

use crate::chunks::ChunkArray;
use crate::device::{
    DeviceBase, DeviceFlags, DeviceOps, DeviceRef, InstallFlags, PRIVATE_FLAG_USE_PROXY_FOR_OPEN,
    retry,
};
use crate::firmware::dock::DockFirmware;
use crate::firmware::{Firmware, ParseFlags};
use crate::progress::{Progress, Status};
use crate::stream::InputStream;
use crate::transport::hid::{HidIo, HidReportFlags};
use crate::version::VersionFormat;
use crate::{FwError, ResultFw};

const REPORT_ID_CONTROL: u8 = 0x2A;
const REPORT_ID_STATUS: u8 = 0x2B;
const REPORT_ID_DATA: u8 = 0x2C;

const CMD_ENTER_FLASH: u8 = 0x01;
const CMD_START: u8 = 0x02;
const CMD_DATA: u8 = 0x03;
const CMD_END: u8 = 0x04;
const CMD_RESET: u8 = 0x05;

// status register semantics; the OP_VALID bit gates every phase change but
// its full meaning is undocumented
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_BUSY: u8 = 0x01;
pub const STATUS_FAIL: u8 = 0x02;
pub const STATUS_OP_VALID: u8 = 0x10;

const PACKET_LEN: usize = 64;
const DATA_PAYLOAD_LEN: usize = PACKET_LEN - 4;
const HID_TIMEOUT: Duration = Duration::from_millis(2000);
const BUSY_POLL_COUNT: u32 = 100;
const BUSY_POLL_DELAY: Duration = Duration::from_millis(10);

/// Components addressable behind the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DockComponent {
    Mcu,
    PadLeft,
    PadRight,
}

impl DockComponent {
    /// Index used on the wire
    #[must_use]
    pub fn idx(self) -> u8 {
        match self {
            DockComponent::Mcu => 0,
            DockComponent::PadLeft => 1,
            DockComponent::PadRight => 2,
        }
    }

    /// Slot name in the firmware bundle, also the child logical ID
    #[must_use]
    pub fn slot_id(self) -> &'static str {
        match self {
            DockComponent::Mcu => crate::firmware::dock::SLOT_ID_MCU,
            DockComponent::PadLeft => crate::firmware::dock::SLOT_ID_PAD_LEFT,
            DockComponent::PadRight => crate::firmware::dock::SLOT_ID_PAD_RIGHT,
        }
    }
}

/// The dock controller owning the shared HID handle
pub struct DockMcuDevice {
    hid: Rc<RefCell<dyn HidIo>>,
    update_phase: u8,
    status_code: u8,
}

impl DockMcuDevice {
    #[must_use]
    pub fn new(hid: Rc<RefCell<dyn HidIo>>) -> Self {
        DockMcuDevice {
            hid,
            update_phase: 0,
            status_code: 0,
        }
    }

    /// Configure a fresh device base the way this protocol expects
    pub fn init_base(base: &mut DeviceBase) {
        base.add_flag(DeviceFlags::UPDATABLE);
        base.add_flag(DeviceFlags::UNSIGNED_PAYLOAD);
        base.set_version_format(VersionFormat::Triplet);
        base.set_remove_delay(Duration::from_secs(10));
        base.add_protocol("com.example.dock");
    }

    fn send_command(&mut self, command: u8, component_idx: u8, arg: &[u8]) -> ResultFw<()> {
        let mut buf = vec![0xFFu8; PACKET_LEN];
        buf[0] = REPORT_ID_CONTROL;
        buf[1] = command;
        buf[2] = component_idx;
        crate::stream::read_safe(&mut buf, 3, arg, 0, arg.len())?;
        self.hid
            .borrow_mut()
            .set_feature(&buf, HID_TIMEOUT, HidReportFlags::ALLOW_TRUNC)
    }

    fn refresh_status(&mut self) -> ResultFw<()> {
        let mut buf = vec![0xFFu8; PACKET_LEN];
        buf[0] = REPORT_ID_STATUS;
        self.hid
            .borrow_mut()
            .get_feature(&mut buf, HID_TIMEOUT, HidReportFlags::ALLOW_TRUNC)?;
        if buf[3] & STATUS_OP_VALID == 0 {
            return Err(FwError::Internal(format!(
                "status not valid, got {:#04x}",
                buf[3]
            )));
        }
        if self.update_phase != buf[1] || self.status_code != buf[2] {
            self.update_phase = buf[1];
            self.status_code = buf[2];
            debug!(
                "phase: {:#04x}, status: {:#04x}",
                self.update_phase, self.status_code
            );
        }
        Ok(())
    }

    /// Poll the status register until the controller leaves the busy state
    fn wait_for_idle(&mut self) -> ResultFw<()> {
        // settle before polling status
        std::thread::sleep(BUSY_POLL_DELAY);
        retry(
            |_attempt| {
                self.refresh_status()?;
                match self.status_code {
                    STATUS_BUSY => Err(FwError::Busy("update engine busy".into())),
                    STATUS_OK => Ok(()),
                    status => Err(FwError::Internal(format!(
                        "refresh returned status {status:#04x}"
                    ))),
                }
            },
            BUSY_POLL_COUNT,
            BUSY_POLL_DELAY,
        )
    }

    /// Switch the controller into its flash loader
    pub fn enter_flash_mode(&mut self) -> ResultFw<()> {
        self.send_command(CMD_ENTER_FLASH, DockComponent::Mcu.idx(), &[])?;
        self.wait_for_idle()
    }

    /// Reset the controller back into runtime mode
    pub fn reset(&mut self) -> ResultFw<()> {
        self.send_command(CMD_RESET, DockComponent::Mcu.idx(), &[])
    }

    /// Chunked write of one component image, driven by parent or child
    pub fn write_component(
        &mut self,
        component: DockComponent,
        image: &Firmware,
        progress: &mut Progress,
    ) -> ResultFw<()> {
        let bytes = image.bytes()?;
        progress.set_status(Status::DeviceErase);
        self.send_command(
            CMD_START,
            component.idx(),
            &(bytes.len() as u32).to_le_bytes(),
        )?;
        self.wait_for_idle()?;

        progress.set_status(Status::DeviceWrite);
        let chunks = ChunkArray::from_bytes(bytes, None, DATA_PAYLOAD_LEN as u32)?;
        for chunk in &chunks {
            let mut buf = vec![0xFFu8; PACKET_LEN];
            buf[0] = REPORT_ID_DATA;
            buf[1] = CMD_DATA;
            buf[2] = component.idx();
            buf[3] = chunk.data_sz() as u8;
            crate::stream::read_safe(&mut buf, 4, chunk.data(), 0, chunk.data_sz())?;
            self.hid
                .borrow_mut()
                .set_feature(&buf, HID_TIMEOUT, HidReportFlags::ALLOW_TRUNC)?;
            progress.set_percentage_full(u64::from(chunk.idx()) + 1, u64::from(chunks.length()));
        }

        progress.set_status(Status::DeviceVerify);
        self.send_command(CMD_END, component.idx(), &[])?;
        self.wait_for_idle()
    }
}

impl DeviceOps for DockMcuDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn to_string_kv(&self, _base: &DeviceBase) -> Vec<(String, String)> {
        vec![
            ("UpdatePhase".to_owned(), format!("{:#04x}", self.update_phase)),
            ("StatusCode".to_owned(), format!("{:#04x}", self.status_code)),
        ]
    }

    fn setup(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        self.refresh_status()
    }

    fn prepare_firmware(
        &mut self,
        base: &mut DeviceBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<Firmware> {
        let mut firmware = DockFirmware::new();
        firmware.parse(stream, flags)?;
        let ops = firmware
            .ops_as::<DockFirmware>()
            .ok_or_else(|| FwError::Internal("expected a dock bundle".into()))?;
        if ops.product_id() != base.pid() && !flags.contains(ParseFlags::IGNORE_VID_PID) {
            return Err(FwError::InvalidFile(format!(
                "firmware product {:#06x} does not match device {:#06x}",
                ops.product_id(),
                base.pid()
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
        let image = firmware.image_by_id(DockComponent::Mcu.slot_id())?;
        self.write_component(DockComponent::Mcu, image, progress)
    }

    fn attach(&mut self, base: &mut DeviceBase, _progress: &mut Progress) -> ResultFw<()> {
        // the reset drops us off the bus; the registry re-binds on replug
        base.add_flag(DeviceFlags::WAIT_FOR_REPLUG);
        self.reset()
    }

    fn set_progress(&self, _base: &DeviceBase, progress: &mut Progress) {
        progress.add_step(Status::DeviceRestart, 0, Some("detach"));
        progress.add_step(Status::DeviceWrite, 100, Some("write"));
        progress.add_step(Status::DeviceRestart, 0, Some("attach"));
        progress.add_step(Status::DeviceBusy, 0, Some("reload"));
    }
}

/// One pad behind the controller; shares the proxy's transport
pub struct DockChildDevice {
    component: DockComponent,
}

impl DockChildDevice {
    /// Build a child device wired to its proxy controller
    #[must_use]
    pub fn new_ref(component: DockComponent, proxy: &DeviceRef) -> DeviceRef {
        let mut device = crate::device::Device::with_ops(Box::new(DockChildDevice { component }));
        device.base_mut().add_flag(DeviceFlags::UPDATABLE);
        device.base_mut().set_version_format(VersionFormat::Triplet);
        device
            .base_mut()
            .add_private_flag(PRIVATE_FLAG_USE_PROXY_FOR_OPEN);
        device.base_mut().set_logical_id(component.slot_id());
        device.set_proxy(proxy);
        device.into_ref()
    }

    #[must_use]
    pub fn component(&self) -> DockComponent {
        self.component
    }
}

impl DeviceOps for DockChildDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn to_string_kv(&self, _base: &DeviceBase) -> Vec<(String, String)> {
        vec![(
            "ComponentIdx".to_owned(),
            self.component.idx().to_string(),
        )]
    }

    fn prepare_firmware(
        &mut self,
        _base: &mut DeviceBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<Firmware> {
        let mut firmware = DockFirmware::new();
        firmware.parse(stream, flags)?;
        firmware.image_by_id(self.component.slot_id())?;
        Ok(firmware)
    }

    fn write_firmware(
        &mut self,
        base: &mut DeviceBase,
        firmware: &Firmware,
        progress: &mut Progress,
        _flags: InstallFlags,
    ) -> ResultFw<()> {
        // only the proxy's thread of control may touch the shared handle, so
        // the transfer itself runs on the controller
        let proxy = base.proxy_device()?;
        let image = firmware.image_by_id(self.component.slot_id())?;
        {
            let mut proxy = proxy.borrow_mut();
            let mcu = proxy
                .ops_as_mut::<DockMcuDevice>()
                .ok_or_else(|| FwError::Internal("proxy is not a dock controller".into()))?;
            mcu.write_component(self.component, image, progress)?;
        }
        if let Some(version) = image.version().map(str::to_owned) {
            base.set_version(&version);
        }
        Ok(())
    }
}
