// SPDX-License-Identifier: LGPL-2.1-or-later

//! Bulk/control/interrupt USB transport.

use std::time::Duration;

use futures_lite::future::block_on;
use log::info;
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};

use crate::{FwError, ResultFw};

/// Type bits of a control request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbRequestType {
    Standard,
    Class,
    Vendor,
}

/// Recipient bits of a control request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// One control request header
#[derive(Clone, Copy, Debug)]
pub struct ControlRequest {
    pub request_type: UsbRequestType,
    pub recipient: UsbRecipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// USB wire operations a device needs during an update
pub trait UsbIo {
    fn control_in(
        &mut self,
        req: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> ResultFw<usize>;

    fn control_out(&mut self, req: ControlRequest, buf: &[u8], timeout: Duration) -> ResultFw<()>;

    fn bulk_in(&mut self, endpoint: u8, len: usize, timeout: Duration) -> ResultFw<Vec<u8>>;

    fn bulk_out(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> ResultFw<()>;

    fn interrupt_in(&mut self, endpoint: u8, len: usize, timeout: Duration) -> ResultFw<Vec<u8>>;

    fn interrupt_out(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> ResultFw<()>;

    /// Port-level reset, used as a last resort to leave bootloader mode
    fn reset(&mut self) -> ResultFw<()>;
}

/// Transport over a claimed interface of a real device
pub struct NusbTransport {
    device: nusb::Device,
    interface: nusb::Interface,
}

impl NusbTransport {
    /// Open the first device matching `vid:pid` and claim an interface
    pub fn open(vid: u16, pid: u16, interface: u8) -> ResultFw<Self> {
        let info = nusb::list_devices()
            .map_err(|err| FwError::NotFound(format!("failed to list USB devices: {err}")))?
            .find(|dev| dev.vendor_id() == vid && dev.product_id() == pid)
            .ok_or_else(|| {
                FwError::NotFound(format!("no USB device with ID {vid:04x}:{pid:04x}"))
            })?;
        let device = info
            .open()
            .map_err(|err| FwError::NotFound(format!("failed to open USB device: {err}")))?;
        let claimed = device
            .claim_interface(interface)
            .map_err(|err| FwError::NotFound(format!("failed to claim interface: {err}")))?;
        info!("opened USB device {vid:04x}:{pid:04x} interface {interface}");
        Ok(NusbTransport {
            device,
            interface: claimed,
        })
    }

    fn control(req: ControlRequest) -> Control {
        Control {
            control_type: match req.request_type {
                UsbRequestType::Standard => ControlType::Standard,
                UsbRequestType::Class => ControlType::Class,
                UsbRequestType::Vendor => ControlType::Vendor,
            },
            recipient: match req.recipient {
                UsbRecipient::Device => Recipient::Device,
                UsbRecipient::Interface => Recipient::Interface,
                UsbRecipient::Endpoint => Recipient::Endpoint,
                UsbRecipient::Other => Recipient::Other,
            },
            request: req.request,
            value: req.value,
            index: req.index,
        }
    }
}

impl UsbIo for NusbTransport {
    fn control_in(
        &mut self,
        req: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> ResultFw<usize> {
        self.interface
            .control_in_blocking(Self::control(req), buf, timeout)
            .map_err(|err| FwError::Read(format!("control transfer failed: {err}")))
    }

    fn control_out(&mut self, req: ControlRequest, buf: &[u8], timeout: Duration) -> ResultFw<()> {
        self.interface
            .control_out_blocking(Self::control(req), buf, timeout)
            .map_err(|err| FwError::Write(format!("control transfer failed: {err}")))?;
        Ok(())
    }

    fn bulk_in(&mut self, endpoint: u8, len: usize, _timeout: Duration) -> ResultFw<Vec<u8>> {
        block_on(self.interface.bulk_in(endpoint, RequestBuffer::new(len)))
            .into_result()
            .map_err(|err| FwError::Read(format!("bulk transfer failed: {err}")))
    }

    fn bulk_out(&mut self, endpoint: u8, buf: &[u8], _timeout: Duration) -> ResultFw<()> {
        block_on(self.interface.bulk_out(endpoint, buf.to_vec()))
            .into_result()
            .map_err(|err| FwError::Write(format!("bulk transfer failed: {err}")))?;
        Ok(())
    }

    fn interrupt_in(&mut self, endpoint: u8, len: usize, _timeout: Duration) -> ResultFw<Vec<u8>> {
        block_on(self.interface.interrupt_in(endpoint, RequestBuffer::new(len)))
            .into_result()
            .map_err(|err| FwError::Read(format!("interrupt transfer failed: {err}")))
    }

    fn interrupt_out(&mut self, endpoint: u8, buf: &[u8], _timeout: Duration) -> ResultFw<()> {
        block_on(self.interface.interrupt_out(endpoint, buf.to_vec()))
            .into_result()
            .map_err(|err| FwError::Write(format!("interrupt transfer failed: {err}")))?;
        Ok(())
    }

    fn reset(&mut self) -> ResultFw<()> {
        self.device
            .reset()
            .map_err(|err| FwError::Write(format!("reset failed: {err}")))
    }
}
