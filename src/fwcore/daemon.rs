// SPDX-License-Identifier: LGPL-2.1-or-later

//! Device registry and transaction engine.
//!
//! The daemon owns the plugins, the quirk database and every registered
//! device, pumps backend probe events, and drives the composite write
//! transaction: prepare once, then open/detach/write/attach/reload each
//! target with cleanup guaranteed on every path, then clean up once.
//!
//! Scheduling is single-threaded cooperative; the explicit scheduler replaces
//! event-loop timer callbacks for things like delayed re-entry after an
//! interactive request.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backend::{Backend, BackendEvent, ProbeEvent};
use crate::device::{CancelToken, Device, DeviceFlags, DeviceRef, InstallFlags};
use crate::firmware::ParseFlags;
use crate::plugin::Plugin;
use crate::progress::Progress;
use crate::quirks::QuirkDb;
use crate::request::Request;
use crate::stream::InputStream;
use crate::{FwError, ResultFw};

const REPLUG_POLL_DELAY: Duration = Duration::from_millis(10);

/// A delayed continuation with its own resources
type Continuation = Box<dyn FnOnce(&mut Daemon)>;

struct ScheduledTask {
    due: Instant,
    seq: u64,
    continuation: Continuation,
}

/// The explicit value replacing process-wide registry state
pub struct Daemon {
    backend: Box<dyn Backend>,
    plugins: Vec<Box<dyn Plugin>>,
    quirks: QuirkDb,
    devices: Vec<DeviceRef>,
    tasks: Vec<ScheduledTask>,
    task_seq: u64,
    cancel: CancelToken,
    pending_requests: Vec<Request>,
}

impl Daemon {
    #[must_use]
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Daemon {
            backend,
            plugins: Vec::new(),
            quirks: QuirkDb::new(),
            devices: Vec::new(),
            tasks: Vec::new(),
            task_seq: 0,
            cancel: CancelToken::new(),
            pending_requests: Vec::new(),
        }
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn Plugin>) {
        info!("registered plugin {}", plugin.name());
        self.plugins.push(plugin);
    }

    #[must_use]
    pub fn quirks(&self) -> &QuirkDb {
        &self.quirks
    }

    pub fn quirks_mut(&mut self) -> &mut QuirkDb {
        &mut self.quirks
    }

    #[must_use]
    pub fn devices(&self) -> &[DeviceRef] {
        &self.devices
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Requests emitted by devices since the last call
    pub fn take_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.pending_requests)
    }

    /// Pump the backend once, registering and unregistering devices
    pub fn process_events(&mut self) -> ResultFw<()> {
        for event in self.backend.poll() {
            match event {
                BackendEvent::DeviceAdded(probe) => self.device_added(&probe),
                BackendEvent::DeviceRemoved(physical_id) => self.device_removed(&physical_id),
            }
        }
        Ok(())
    }

    fn device_added(&mut self, probe: &ProbeEvent) {
        // a device waiting for replug gets its state re-bound, not a new object
        if self.try_rebind(probe) {
            return;
        }

        // identity must come from somewhere
        if probe.subsystem == "usb" && probe.vid == 0 {
            warn!("ignoring USB device without vendor ID");
            return;
        }

        for index in 0..self.plugins.len() {
            let subsystems = self.plugins[index].subsystems();
            if !subsystems.is_empty() && !subsystems.contains(&probe.subsystem.as_str()) {
                continue;
            }
            let Some(mut device) = self.plugins[index].create_device(probe) else {
                continue;
            };
            device.base_mut().set_vid(probe.vid);
            device.base_mut().set_pid(probe.pid);
            device.base_mut().set_physical_id(&probe.physical_id);
            match self.register_device(device) {
                Ok(device) => {
                    self.devices.push(device);
                    return;
                }
                Err(err) => {
                    // a failed setup removes the device from consideration
                    debug!("plugin {} declined device: {err}", self.plugins[index].name());
                }
            }
        }
    }

    fn register_device(&mut self, mut device: Device) -> ResultFw<DeviceRef> {
        device.probe()?;

        // apply quirk effects for every matching instance ID
        let instance_ids: Vec<String> = device.base().instance_ids().to_vec();
        for instance_id in instance_ids {
            let effects: Vec<(String, String)> = self.quirks.lookup(&instance_id).to_vec();
            for (key, value) in effects {
                if let Err(err) = device.set_quirk_kv(&key, &value) {
                    debug!("quirk {key}={value} not applied: {err}");
                }
            }
        }

        let device = device.into_ref();
        Device::open(&device)?;
        let setup = device.borrow_mut().setup();
        let closed = Device::close(&device);
        setup?;
        closed?;
        Ok(device)
    }

    fn device_removed(&mut self, physical_id: &str) {
        self.devices.retain(|device| {
            let matches = device.borrow().base().physical_id() == Some(physical_id);
            if matches {
                info!("removed device {physical_id}");
            }
            !matches
        });
    }

    fn try_rebind(&mut self, probe: &ProbeEvent) -> bool {
        for device in &self.devices {
            let mut this = device.borrow_mut();
            if !this.base().has_flag(DeviceFlags::WAIT_FOR_REPLUG) {
                continue;
            }
            let matched = this.base().physical_id() == Some(probe.physical_id.as_str())
                || this
                    .base()
                    .guids()
                    .iter()
                    .any(|guid| probe.name.as_deref() == Some(guid.as_str()));
            if matched {
                info!("re-binding {} after replug", probe.physical_id);
                this.base_mut().set_physical_id(&probe.physical_id);
                this.base_mut().remove_flag(DeviceFlags::WAIT_FOR_REPLUG);
                return true;
            }
        }
        false
    }

    /// Schedule a continuation to run after `delay`
    pub fn schedule(&mut self, delay: Duration, continuation: Continuation) {
        self.task_seq += 1;
        self.tasks.push(ScheduledTask {
            due: Instant::now() + delay,
            seq: self.task_seq,
            continuation,
        });
    }

    /// Run every continuation whose delay expired
    pub fn run_pending(&mut self) {
        let now = Instant::now();
        let mut due: Vec<ScheduledTask> = Vec::new();
        let mut index = 0;
        while index < self.tasks.len() {
            if self.tasks[index].due <= now {
                due.push(self.tasks.remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|task| (task.due, task.seq));
        for task in due {
            (task.continuation)(self);
        }
    }

    /// Depth of a device below its root, following parent or proxy links
    fn device_depth(device: &DeviceRef) -> u32 {
        let mut depth = 0;
        let mut current = device.clone();
        loop {
            let next = {
                let this = current.borrow();
                this.parent().or_else(|_| this.proxy()).ok()
            };
            match next {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => return depth,
            }
        }
    }

    /// Install one payload onto several devices as a single transaction.
    ///
    /// Targets are ordered children-first so that a shared controller is
    /// flashed after the devices that proxy through it; `composite_prepare`
    /// still runs before the first open and `composite_cleanup` after the
    /// last close.
    pub fn install(
        &mut self,
        targets: &[DeviceRef],
        stream: &InputStream,
        progress: &mut Progress,
        flags: InstallFlags,
    ) -> ResultFw<()> {
        let mut ordered: Vec<DeviceRef> = targets.to_vec();
        ordered.sort_by_key(|device| std::cmp::Reverse(Self::device_depth(device)));

        for plugin in &mut self.plugins {
            plugin.composite_prepare(&ordered)?;
        }

        progress.set_steps(ordered.len());
        let mut result = Ok(());
        for device in &ordered {
            if let Err(err) = self.install_one(device, stream, progress.get_child(), flags) {
                // the first fatal error aborts the transaction; devices that
                // had not started are left untouched
                result = Err(err);
                break;
            }
            progress.step_done();
            progress.flush();
        }

        for plugin in &mut self.plugins {
            if let Err(err) = plugin.composite_cleanup(&ordered) {
                warn!("composite cleanup failed: {err}");
            }
        }
        result
    }

    fn install_one(
        &mut self,
        device: &DeviceRef,
        stream: &InputStream,
        progress: &mut Progress,
        flags: InstallFlags,
    ) -> ResultFw<()> {
        let parse_flags = if flags.contains(InstallFlags::FORCE) {
            ParseFlags::FORCE
        } else {
            ParseFlags::empty()
        };
        let firmware = device.borrow_mut().prepare_firmware(stream, parse_flags)?;
        device.borrow().set_progress(progress);

        Device::open(device)?;
        let result = self.write_transaction(device, &firmware, progress, flags);

        // cleanup must run on every path and never fails the transaction
        let cancelled = self.cancel.is_cancelled();
        if let Err(err) = device.borrow_mut().cleanup(progress, cancelled) {
            warn!("cleanup failed: {err}");
        }
        if let Err(err) = Device::close(device) {
            warn!("close failed: {err}");
        }
        self.drain_requests(device);
        result
    }

    fn write_transaction(
        &mut self,
        device: &DeviceRef,
        firmware: &crate::firmware::Firmware,
        progress: &mut Progress,
        flags: InstallFlags,
    ) -> ResultFw<()> {
        self.cancel.check()?;
        device.borrow_mut().detach(progress.get_child())?;
        progress.step_done();
        self.drain_requests(device);

        self.cancel.check()?;
        device
            .borrow_mut()
            .write_firmware(firmware, progress.get_child(), flags)?;
        progress.step_done();

        self.cancel.check()?;
        device.borrow_mut().attach(progress.get_child())?;
        progress.step_done();
        self.drain_requests(device);

        if device.borrow().base().has_flag(DeviceFlags::WAIT_FOR_REPLUG) {
            self.wait_for_replug(device)?;
        }

        self.cancel.check()?;
        device.borrow_mut().reload()?;
        progress.step_done();
        Ok(())
    }

    fn drain_requests(&mut self, device: &DeviceRef) {
        self.pending_requests
            .extend(device.borrow_mut().base_mut().take_requests());
    }

    /// Wait up to the device's remove delay for it to come back.
    ///
    /// Re-enumeration is matched by physical ID or by instance identity; on
    /// success the registry re-binds state onto the existing object.
    pub fn wait_for_replug(&mut self, device: &DeviceRef) -> ResultFw<()> {
        let deadline = Instant::now() + device.borrow().base().remove_delay();
        while Instant::now() < deadline {
            self.cancel.check()?;
            for event in self.backend.poll() {
                if let BackendEvent::DeviceAdded(probe) = event {
                    let matched = {
                        let this = device.borrow();
                        this.base().physical_id() == Some(probe.physical_id.as_str())
                            || this
                                .base()
                                .guids()
                                .iter()
                                .any(|guid| probe.name.as_deref() == Some(guid.as_str()))
                    };
                    if matched {
                        let mut this = device.borrow_mut();
                        this.base_mut().set_physical_id(&probe.physical_id);
                        this.base_mut().remove_flag(DeviceFlags::WAIT_FOR_REPLUG);
                        return Ok(());
                    }
                }
            }
            std::thread::sleep(REPLUG_POLL_DELAY);
        }
        Err(FwError::Timeout(
            "device did not come back after the update".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticBackend;
    use crate::device::{DeviceBase, DeviceOps, NullDeviceOps};
    use crate::progress::Status;
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct TestPlugin {
        created: Rc<RefCell<u32>>,
    }

    impl Plugin for TestPlugin {
        fn name(&self) -> &'static str {
            "test"
        }
        fn subsystems(&self) -> &'static [&'static str] {
            &["usb"]
        }
        fn create_device(&mut self, event: &ProbeEvent) -> Option<Device> {
            if event.vid != 0x1234 {
                return None;
            }
            *self.created.borrow_mut() += 1;
            let mut device = Device::with_ops(Box::new(NullDeviceOps));
            device.base_mut().add_instance_str("VID", "1234");
            device.base_mut().add_flag(DeviceFlags::UPDATABLE);
            Some(device)
        }
    }

    fn added(vid: u16, physical_id: &str) -> BackendEvent {
        BackendEvent::DeviceAdded(ProbeEvent {
            subsystem: "usb".to_owned(),
            vid,
            pid: 0x0001,
            physical_id: physical_id.to_owned(),
            device_file: None,
            name: None,
        })
    }

    #[test]
    fn test_register_and_remove() {
        let mut backend = StaticBackend::new();
        backend.push(added(0x1234, "usb:01:00"));
        backend.push(added(0x9999, "usb:01:01"));
        let created = Rc::new(RefCell::new(0));
        let mut daemon = Daemon::new(Box::new(backend));
        daemon.add_plugin(Box::new(TestPlugin {
            created: Rc::clone(&created),
        }));
        daemon.process_events().unwrap();
        assert_eq!(daemon.devices().len(), 1);
        assert_eq!(*created.borrow(), 1);

        let mut backend = StaticBackend::new();
        backend.push(BackendEvent::DeviceRemoved("usb:01:00".to_owned()));
        daemon.backend = Box::new(backend);
        daemon.process_events().unwrap();
        assert!(daemon.devices().is_empty());
    }

    #[test]
    fn test_usb_without_vid_rejected() {
        let mut backend = StaticBackend::new();
        backend.push(added(0x0000, "usb:02:00"));
        let mut daemon = Daemon::new(Box::new(backend));
        daemon.add_plugin(Box::new(TestPlugin {
            created: Rc::new(RefCell::new(0)),
        }));
        daemon.process_events().unwrap();
        assert!(daemon.devices().is_empty());
    }

    #[test]
    fn test_quirks_applied_on_register() {
        let mut daemon = Daemon::new(Box::new(StaticBackend::new()));
        daemon
            .quirks_mut()
            .add("USB\\VID_1234", "Flags", "dual-image");
        let mut device = Device::with_ops(Box::new(NullDeviceOps));
        device.base_mut().add_instance_id("USB\\VID_1234");
        let device = daemon.register_device(device).unwrap();
        assert!(device.borrow().base().has_flag(DeviceFlags::DUAL_IMAGE));
    }

    #[test]
    fn test_scheduler_order() {
        let mut daemon = Daemon::new(Box::new(StaticBackend::new()));
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_a = Rc::clone(&log);
        let log_b = Rc::clone(&log);
        daemon.schedule(Duration::ZERO, Box::new(move |_| log_a.borrow_mut().push("a")));
        daemon.schedule(Duration::ZERO, Box::new(move |_| log_b.borrow_mut().push("b")));
        std::thread::sleep(Duration::from_millis(1));
        daemon.run_pending();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert!(daemon.tasks.is_empty());
    }

    struct FailingWrite;
    impl DeviceOps for FailingWrite {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn write_firmware(
            &mut self,
            _base: &mut DeviceBase,
            _firmware: &crate::firmware::Firmware,
            _progress: &mut Progress,
            _flags: InstallFlags,
        ) -> ResultFw<()> {
            Err(FwError::Write("flash failed".into()))
        }
        fn set_progress(&self, _base: &DeviceBase, progress: &mut Progress) {
            progress.add_step(Status::DeviceWrite, 100, None);
        }
    }

    #[test]
    fn test_install_error_still_cleans_up() {
        let mut daemon = Daemon::new(Box::new(StaticBackend::new()));
        let device = Device::with_ops(Box::new(FailingWrite)).into_ref();
        let mut progress = Progress::new();
        let stream = InputStream::from_vec(vec![0u8; 16]);
        let result = daemon.install(
            &[device.clone()],
            &stream,
            &mut progress,
            InstallFlags::empty(),
        );
        assert!(matches!(result, Err(FwError::Write(_))));
        // the transport was released even though the write failed
        assert!(!device.borrow().is_open());
    }
}
