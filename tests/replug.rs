// SPDX-License-Identifier: LGPL-2.1-or-later

//! A device whose attach asks the user to replug: the registry waits up to
//! the remove delay for re-enumeration and re-binds, or times the
//! transaction out.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use fwcore::FwError;
use fwcore::ResultFw;
use fwcore::backend::{BackendEvent, ProbeEvent, StaticBackend};
use fwcore::daemon::Daemon;
use fwcore::device::{Device, DeviceBase, DeviceFlags, DeviceOps, InstallFlags};
use fwcore::firmware::Firmware;
use fwcore::progress::{Progress, Status};
use fwcore::request::{Request, RequestId, RequestKind};
use fwcore::stream::InputStream;

struct ReplugDevice {
    reloaded: Rc<RefCell<bool>>,
}

impl DeviceOps for ReplugDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn write_firmware(
        &mut self,
        _base: &mut DeviceBase,
        _firmware: &Firmware,
        _progress: &mut Progress,
        _flags: InstallFlags,
    ) -> ResultFw<()> {
        Ok(())
    }
    fn attach(&mut self, base: &mut DeviceBase, _progress: &mut Progress) -> ResultFw<()> {
        base.emit_request(Request::new(RequestKind::Immediate, RequestId::RemoveUsbCable));
        base.add_flag(DeviceFlags::WAIT_FOR_REPLUG);
        Ok(())
    }
    fn reload(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        *self.reloaded.borrow_mut() = true;
        base.set_version("2.0.0");
        Ok(())
    }
    fn set_progress(&self, _base: &DeviceBase, progress: &mut Progress) {
        progress.add_step(Status::DeviceWrite, 90, Some("write"));
        progress.add_step(Status::DeviceBusy, 10, Some("reload"));
    }
}

fn replug_device(reloaded: &Rc<RefCell<bool>>) -> Device {
    let mut device = Device::with_ops(Box::new(ReplugDevice {
        reloaded: Rc::clone(reloaded),
    }));
    device.base_mut().add_flag(DeviceFlags::UPDATABLE);
    device.base_mut().set_physical_id("usb:05:00");
    device.base_mut().set_remove_delay(Duration::from_millis(200));
    device.base_mut().set_version("1.0.0");
    device
}

#[test]
fn test_replug_rebinds_and_reloads() {
    let reloaded = Rc::new(RefCell::new(false));
    let device = replug_device(&reloaded).into_ref();

    // the cable comes back on a new port before the delay expires
    let mut backend = StaticBackend::new();
    backend.push(BackendEvent::DeviceAdded(ProbeEvent {
        subsystem: "usb".to_owned(),
        vid: 0x1234,
        pid: 0x5678,
        physical_id: "usb:05:00".to_owned(),
        device_file: None,
        name: None,
    }));
    let mut daemon = Daemon::new(Box::new(backend));

    let mut progress = Progress::new();
    let stream = InputStream::from_vec(vec![0u8; 64]);
    daemon
        .install(&[device.clone()], &stream, &mut progress, InstallFlags::empty())
        .unwrap();

    assert!(*reloaded.borrow());
    let this = device.borrow();
    assert!(!this.base().has_flag(DeviceFlags::WAIT_FOR_REPLUG));
    assert_eq!(this.base().version(), Some("2.0.0"));
    drop(this);

    // the interactive request surfaced without blocking the transaction
    let requests = daemon.take_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id, RequestId::RemoveUsbCable);
}

#[test]
fn test_replug_times_out() {
    let reloaded = Rc::new(RefCell::new(false));
    let device = replug_device(&reloaded).into_ref();

    // nothing ever re-enumerates
    let mut daemon = Daemon::new(Box::new(StaticBackend::new()));
    let mut progress = Progress::new();
    let stream = InputStream::from_vec(vec![0u8; 64]);
    let result = daemon.install(&[device.clone()], &stream, &mut progress, InstallFlags::empty());
    assert!(matches!(result, Err(FwError::Timeout(_))));
    assert!(!*reloaded.borrow());
    // the transport was still torn down
    assert!(!device.borrow().is_open());
}
