// SPDX-License-Identifier: LGPL-2.1-or-later

//! The stateful, polymorphic object representing one updatable target.
//!
//! Shared state (identity, flags, version, relations) lives in
//! [`DeviceBase`]; protocol-specific behaviour lives in a [`DeviceOps`]
//! implementation owned by the outer value. Children are owned by their
//! parent; the proxy is a non-owning back-reference that turns into
//! [`FwError::Gone`] if its target is destroyed.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, warn};

use crate::firmware::{Firmware, ParseFlags};
use crate::guid::guid_hash_string;
use crate::progress::{Progress, Status};
use crate::request::Request;
use crate::stream::InputStream;
use crate::version::{VersionFormat, version_compare, version_from_u64};
use crate::{FwError, ResultFw};

pub mod amd_gpu;
pub mod dock_dev;
pub mod mkhi;
pub mod nvme;
pub mod uf2_dev;

bitflags! {
    /// Externally visible device capabilities and constraints
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceFlags: u64 {
        const UPDATABLE            = 1 << 0;
        const IS_BOOTLOADER        = 1 << 1;
        const NEEDS_REBOOT         = 1 << 2;
        const NEEDS_SHUTDOWN       = 1 << 3;
        const WAIT_FOR_REPLUG      = 1 << 4;
        const USABLE_DURING_UPDATE = 1 << 5;
        const REQUIRE_AC           = 1 << 6;
        const INTERNAL             = 1 << 7;
        const DUAL_IMAGE           = 1 << 8;
        const SELF_RECOVERY        = 1 << 9;
        const SIGNED_PAYLOAD       = 1 << 10;
        const UNSIGNED_PAYLOAD     = 1 << 11;
        const NEEDS_ACTIVATION     = 1 << 12;
        const ONLY_VERSION_UPGRADE = 1 << 13;
        const CAN_VERIFY_IMAGE     = 1 << 14;
    }
}

bitflags! {
    /// Install-time behaviour requested by the user
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InstallFlags: u32 {
        /// Ignore version and compatibility gates
        const FORCE = 1 << 0;
        /// Permit a downgrade
        const ALLOW_OLDER = 1 << 1;
    }
}

bitflags! {
    /// Attributes copied by [`Device::apply_donor`]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IncorporateFlags: u32 {
        const VENDOR      = 1 << 0;
        const VENDOR_IDS  = 1 << 1;
        const VID         = 1 << 2;
        const PID         = 1 << 3;
        const PHYSICAL_ID = 1 << 4;
    }
}

/// Route `open` through the proxy device
pub const PRIVATE_FLAG_USE_PROXY_FOR_OPEN: &str = "use-proxy-for-open";

/// Shared handle to a registered device
pub type DeviceRef = Rc<RefCell<Device>>;
type DeviceWeak = Weak<RefCell<Device>>;

/// Cooperative cancellation token checked at every suspension point
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }

    /// Error out if cancellation was requested
    pub fn check(&self) -> ResultFw<()> {
        if self.is_cancelled() {
            return Err(FwError::Aborted);
        }
        Ok(())
    }
}

/// State shared by every device regardless of protocol
#[derive(Debug, Default)]
pub struct DeviceBase {
    name: Option<String>,
    vendor: Option<String>,
    summary: Option<String>,
    serial: Option<String>,
    vid: u16,
    pid: u16,
    physical_id: Option<String>,
    logical_id: Option<String>,
    vendor_ids: Vec<String>,
    guids: Vec<String>,
    instance_ids: Vec<String>,
    instance_parts: Vec<(String, String)>,
    version: Option<String>,
    version_lowest: Option<String>,
    version_raw: u64,
    version_format: VersionFormat,
    flags: DeviceFlags,
    private_flags: Vec<String>,
    open_refcount: u32,
    firmware_size_min: u64,
    firmware_size_max: u64,
    protocols: Vec<String>,
    remove_delay: Duration,
    install_duration: Duration,
    requests: Vec<Request>,
    parent: Option<DeviceWeak>,
    proxy: Option<DeviceWeak>,
    children: Vec<DeviceRef>,
}

impl DeviceBase {
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_owned());
    }

    #[must_use]
    pub fn vendor(&self) -> Option<&str> {
        self.vendor.as_deref()
    }

    pub fn set_vendor(&mut self, vendor: &str) {
        self.vendor = Some(vendor.to_owned());
    }

    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn set_summary(&mut self, summary: &str) {
        self.summary = Some(summary.to_owned());
    }

    #[must_use]
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn set_serial(&mut self, serial: &str) {
        self.serial = Some(serial.to_owned());
    }

    #[must_use]
    pub fn vid(&self) -> u16 {
        self.vid
    }

    pub fn set_vid(&mut self, vid: u16) {
        self.vid = vid;
    }

    #[must_use]
    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn set_pid(&mut self, pid: u16) {
        self.pid = pid;
    }

    /// Stable per-socket identifier
    #[must_use]
    pub fn physical_id(&self) -> Option<&str> {
        self.physical_id.as_deref()
    }

    pub fn set_physical_id(&mut self, physical_id: &str) {
        self.physical_id = Some(physical_id.to_owned());
    }

    /// Stable per-subfunction identifier
    #[must_use]
    pub fn logical_id(&self) -> Option<&str> {
        self.logical_id.as_deref()
    }

    pub fn set_logical_id(&mut self, logical_id: &str) {
        self.logical_id = Some(logical_id.to_owned());
    }

    /// Register a typed vendor ID, e.g. `USB:0x17EF`
    pub fn build_vendor_id(&mut self, prefix: &str, value: u16) {
        let vendor_id = format!("{prefix}:{value:#06X}");
        if !self.vendor_ids.contains(&vendor_id) {
            self.vendor_ids.push(vendor_id);
        }
    }

    #[must_use]
    pub fn vendor_ids(&self) -> &[String] {
        &self.vendor_ids
    }

    #[must_use]
    pub fn guids(&self) -> &[String] {
        &self.guids
    }

    pub fn add_guid(&mut self, guid: &str) {
        if !self.guids.iter().any(|g| g == guid) {
            self.guids.push(guid.to_owned());
        }
    }

    #[must_use]
    pub fn has_guid(&self, guid: &str) -> bool {
        self.guids.iter().any(|g| g == guid)
    }

    /// Record an instance-ID fragment used to build quirk keys
    pub fn add_instance_str(&mut self, key: &str, value: &str) {
        self.instance_parts.push((key.to_owned(), value.to_owned()));
    }

    #[must_use]
    pub fn instance_str(&self, key: &str) -> Option<&str> {
        self.instance_parts
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Add a literal instance ID and its derived GUID
    pub fn add_instance_id(&mut self, instance_id: &str) {
        if !self.instance_ids.iter().any(|id| id == instance_id) {
            self.instance_ids.push(instance_id.to_owned());
        }
        let guid = guid_hash_string(instance_id);
        self.add_guid(&guid);
    }

    /// Concatenate recorded fragments into `SUBSYS\KEY1_v1&KEY2_v2`
    pub fn build_instance_id(&mut self, subsystem: &str, keys: &[&str]) -> ResultFw<String> {
        let mut instance_id = format!("{subsystem}\\");
        for (index, key) in keys.iter().enumerate() {
            let value = self.instance_str(key).ok_or_else(|| {
                FwError::NotFound(format!("no instance fragment for {key}"))
            })?;
            if index > 0 {
                instance_id.push('&');
            }
            let _ = write!(instance_id, "{key}_{value}");
        }
        self.add_instance_id(&instance_id);
        Ok(instance_id)
    }

    #[must_use]
    pub fn instance_ids(&self) -> &[String] {
        &self.instance_ids
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn set_version(&mut self, version: &str) {
        self.version = Some(version.to_owned());
    }

    #[must_use]
    pub fn version_lowest(&self) -> Option<&str> {
        self.version_lowest.as_deref()
    }

    pub fn set_version_lowest(&mut self, version: &str) {
        self.version_lowest = Some(version.to_owned());
    }

    #[must_use]
    pub fn version_raw(&self) -> u64 {
        self.version_raw
    }

    pub fn set_version_raw(&mut self, version_raw: u64) {
        self.version_raw = version_raw;
    }

    #[must_use]
    pub fn version_format(&self) -> VersionFormat {
        self.version_format
    }

    pub fn set_version_format(&mut self, format: VersionFormat) {
        self.version_format = format;
    }

    #[must_use]
    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    #[must_use]
    pub fn has_flag(&self, flag: DeviceFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn add_flag(&mut self, flag: DeviceFlags) {
        // a device in bootloader mode cannot also be used normally
        if flag.contains(DeviceFlags::IS_BOOTLOADER)
            && self.flags.contains(DeviceFlags::USABLE_DURING_UPDATE)
        {
            debug!("removing usable-during-update for bootloader device");
            self.flags.remove(DeviceFlags::USABLE_DURING_UPDATE);
        }
        self.flags |= flag;
    }

    pub fn remove_flag(&mut self, flag: DeviceFlags) {
        self.flags.remove(flag);
    }

    pub fn add_private_flag(&mut self, flag: &str) {
        if !self.private_flags.iter().any(|f| f == flag) {
            self.private_flags.push(flag.to_owned());
        }
    }

    #[must_use]
    pub fn has_private_flag(&self, flag: &str) -> bool {
        self.private_flags.iter().any(|f| f == flag)
    }

    #[must_use]
    pub fn firmware_size_min(&self) -> u64 {
        self.firmware_size_min
    }

    pub fn set_firmware_size_min(&mut self, size: u64) {
        self.firmware_size_min = size;
    }

    #[must_use]
    pub fn firmware_size_max(&self) -> u64 {
        self.firmware_size_max
    }

    pub fn set_firmware_size_max(&mut self, size: u64) {
        self.firmware_size_max = size;
    }

    /// Reverse-DNS protocol identifiers for reporting
    pub fn add_protocol(&mut self, protocol: &str) {
        if !self.protocols.iter().any(|p| p == protocol) {
            self.protocols.push(protocol.to_owned());
        }
    }

    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// How long to wait for re-enumeration after a restart
    #[must_use]
    pub fn remove_delay(&self) -> Duration {
        self.remove_delay
    }

    pub fn set_remove_delay(&mut self, delay: Duration) {
        self.remove_delay = delay;
    }

    #[must_use]
    pub fn install_duration(&self) -> Duration {
        self.install_duration
    }

    pub fn set_install_duration(&mut self, duration: Duration) {
        self.install_duration = duration;
    }

    /// Queue a user-visible request; never blocks
    pub fn emit_request(&mut self, request: Request) {
        debug!("emitting request {}", request.id);
        self.requests.push(request);
    }

    /// Drain requests queued since the last call
    pub fn take_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    /// The proxy back-reference, or `Gone` if it was destroyed.
    ///
    /// Exposed on the base so protocol ops can route transfers through the
    /// proxy; only the proxy's thread of control may touch its handle.
    pub fn proxy_device(&self) -> ResultFw<DeviceRef> {
        let weak = self
            .proxy
            .as_ref()
            .ok_or_else(|| FwError::NotFound("no proxy device".into()))?;
        weak.upgrade()
            .ok_or_else(|| FwError::Gone("proxy device was destroyed".into()))
    }

    /// Copy selected attributes from a donor device.
    ///
    /// Strings are cloned, lists are extended rather than replaced.
    pub fn apply_donor(&mut self, donor: &DeviceBase, flags: IncorporateFlags) {
        if flags.contains(IncorporateFlags::VENDOR) && self.vendor.is_none() {
            self.vendor.clone_from(&donor.vendor);
        }
        if flags.contains(IncorporateFlags::VENDOR_IDS) {
            for vendor_id in &donor.vendor_ids {
                if !self.vendor_ids.contains(vendor_id) {
                    self.vendor_ids.push(vendor_id.clone());
                }
            }
        }
        if flags.contains(IncorporateFlags::VID) && self.vid == 0 {
            self.vid = donor.vid;
        }
        if flags.contains(IncorporateFlags::PID) && self.pid == 0 {
            self.pid = donor.pid;
        }
        if flags.contains(IncorporateFlags::PHYSICAL_ID) && self.physical_id.is_none() {
            self.physical_id.clone_from(&donor.physical_id);
        }
    }
}

/// Protocol-specific behaviour of a device.
///
/// `probe` must stay side-effect-free; `setup` may issue wire transactions;
/// `write_firmware` is the only operation allowed to mutate persistent device
/// state; `cleanup` runs on every path and must not fail the transaction.
pub trait DeviceOps: Any {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Typed key/value metadata appended to the debug dump
    fn to_string_kv(&self, _base: &DeviceBase) -> Vec<(String, String)> {
        Vec::new()
    }

    fn probe(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        Ok(())
    }

    fn setup(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        Ok(())
    }

    /// Acquire the transport handle
    fn open(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        Ok(())
    }

    /// Release the transport handle
    fn close(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        Ok(())
    }

    /// Switch from runtime to bootloader mode
    fn detach(&mut self, _base: &mut DeviceBase, _progress: &mut Progress) -> ResultFw<()> {
        Ok(())
    }

    /// Switch back to runtime mode
    fn attach(&mut self, _base: &mut DeviceBase, _progress: &mut Progress) -> ResultFw<()> {
        Ok(())
    }

    /// Re-read version and child metadata after a write
    fn reload(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        Ok(())
    }

    /// Always runs, even on error; `cancelled` distinguishes an aborted exit
    fn cleanup(
        &mut self,
        _base: &mut DeviceBase,
        _progress: &mut Progress,
        _cancelled: bool,
    ) -> ResultFw<()> {
        Ok(())
    }

    /// Parse and vet an incoming payload for this device
    fn prepare_firmware(
        &mut self,
        base: &mut DeviceBase,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<Firmware> {
        check_firmware_size(base, stream.size())?;
        let mut firmware = Firmware::new();
        firmware.parse(stream, flags)?;
        Ok(firmware)
    }

    fn write_firmware(
        &mut self,
        _base: &mut DeviceBase,
        _firmware: &Firmware,
        _progress: &mut Progress,
        _flags: InstallFlags,
    ) -> ResultFw<()> {
        Err(FwError::NotSupported("writing firmware is not supported".into()))
    }

    /// Declare the steps of a full write transaction
    fn set_progress(&self, _base: &DeviceBase, progress: &mut Progress) {
        progress.add_step(Status::DeviceRestart, 0, Some("detach"));
        progress.add_step(Status::DeviceWrite, 90, Some("write"));
        progress.add_step(Status::DeviceRestart, 0, Some("attach"));
        progress.add_step(Status::DeviceBusy, 10, Some("reload"));
    }

    /// Apply one quirk effect the shared layer did not understand
    fn set_quirk_kv(&mut self, _base: &mut DeviceBase, key: &str, _value: &str) -> ResultFw<()> {
        Err(FwError::NotSupported(format!("quirk key {key} not supported")))
    }

    /// Convert a raw version to a display string
    fn convert_version(&self, base: &DeviceBase, version_raw: u64) -> String {
        version_from_u64(version_raw, base.version_format())
    }
}

/// Ops for a device with no protocol behaviour, useful for container nodes
#[derive(Debug, Default)]
pub struct NullDeviceOps;

impl DeviceOps for NullDeviceOps {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Reject payloads outside the declared size bounds before parsing
pub fn check_firmware_size(base: &DeviceBase, size: u64) -> ResultFw<()> {
    if base.firmware_size_min() > 0 && size < base.firmware_size_min() {
        return Err(FwError::InvalidFile(format!(
            "firmware too small, got {size:#x}, expected >= {:#x}",
            base.firmware_size_min()
        )));
    }
    if base.firmware_size_max() > 0 && size > base.firmware_size_max() {
        return Err(FwError::InvalidFile(format!(
            "firmware too large, got {size:#x}, expected <= {:#x}",
            base.firmware_size_max()
        )));
    }
    Ok(())
}

/// One updatable endpoint
pub struct Device {
    base: DeviceBase,
    ops: Box<dyn DeviceOps>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("base", &self.base).finish()
    }
}

impl Device {
    #[must_use]
    pub fn with_ops(ops: Box<dyn DeviceOps>) -> Self {
        Device {
            base: DeviceBase::default(),
            ops,
        }
    }

    #[must_use]
    pub fn into_ref(self) -> DeviceRef {
        Rc::new(RefCell::new(self))
    }

    #[must_use]
    pub fn base(&self) -> &DeviceBase {
        &self.base
    }

    #[must_use]
    pub fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    #[must_use]
    pub fn ops_as<T: DeviceOps>(&self) -> Option<&T> {
        self.ops.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn ops_as_mut<T: DeviceOps>(&mut self) -> Option<&mut T> {
        self.ops.as_any_mut().downcast_mut::<T>()
    }

    /// The proxy back-reference, or `Gone` if it was destroyed
    pub fn proxy(&self) -> ResultFw<DeviceRef> {
        self.base.proxy_device()
    }

    pub fn set_proxy(&mut self, proxy: &DeviceRef) {
        self.base.proxy = Some(Rc::downgrade(proxy));
    }

    pub fn parent(&self) -> ResultFw<DeviceRef> {
        let weak = self
            .base
            .parent
            .as_ref()
            .ok_or_else(|| FwError::NotFound("no parent device".into()))?;
        weak.upgrade()
            .ok_or_else(|| FwError::Gone("parent device was destroyed".into()))
    }

    #[must_use]
    pub fn children(&self) -> &[DeviceRef] {
        &self.base.children
    }

    /// Own a child device; the parent outlives its children
    pub fn add_child(parent: &DeviceRef, child: DeviceRef) {
        child.borrow_mut().base.parent = Some(Rc::downgrade(parent));
        parent.borrow_mut().base.children.push(child);
    }

    /// Refcounted open; the first call acquires the transport.
    ///
    /// A device carrying the proxy-open private flag forwards to the proxy,
    /// which must stay open for the lifetime of this device's transaction.
    pub fn open(device: &DeviceRef) -> ResultFw<()> {
        let use_proxy = device
            .borrow()
            .base
            .has_private_flag(PRIVATE_FLAG_USE_PROXY_FOR_OPEN);
        if use_proxy {
            let proxy = device.borrow().proxy()?;
            return Device::open(&proxy);
        }
        let mut this = device.borrow_mut();
        this.base.open_refcount += 1;
        if this.base.open_refcount == 1 {
            let Device { base, ops } = &mut *this;
            if let Err(err) = ops.open(base) {
                base.open_refcount -= 1;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Refcounted close; tears down at zero
    pub fn close(device: &DeviceRef) -> ResultFw<()> {
        let use_proxy = device
            .borrow()
            .base
            .has_private_flag(PRIVATE_FLAG_USE_PROXY_FOR_OPEN);
        if use_proxy {
            let proxy = device.borrow().proxy()?;
            return Device::close(&proxy);
        }
        let mut this = device.borrow_mut();
        if this.base.open_refcount == 0 {
            return Err(FwError::Internal("close without open".into()));
        }
        this.base.open_refcount -= 1;
        if this.base.open_refcount == 0 {
            let Device { base, ops } = &mut *this;
            ops.close(base)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.base.open_refcount > 0
    }

    /// Read cheap metadata; must not touch device state
    pub fn probe(&mut self) -> ResultFw<()> {
        let Device { base, ops } = self;
        ops.probe(base)
    }

    /// Read expensive metadata, possibly over the wire
    pub fn setup(&mut self) -> ResultFw<()> {
        let Device { base, ops } = self;
        ops.setup(base)
    }

    /// Transition to bootloader mode; a no-op when already there
    pub fn detach(&mut self, progress: &mut Progress) -> ResultFw<()> {
        if self.base.has_flag(DeviceFlags::IS_BOOTLOADER) {
            debug!("already in bootloader mode, skipping detach");
            return Ok(());
        }
        let Device { base, ops } = self;
        ops.detach(base, progress)
    }

    pub fn attach(&mut self, progress: &mut Progress) -> ResultFw<()> {
        let Device { base, ops } = self;
        ops.attach(base, progress)
    }

    pub fn reload(&mut self) -> ResultFw<()> {
        let Device { base, ops } = self;
        ops.reload(base)
    }

    pub fn cleanup(&mut self, progress: &mut Progress, cancelled: bool) -> ResultFw<()> {
        let Device { base, ops } = self;
        ops.cleanup(base, progress, cancelled)
    }

    pub fn prepare_firmware(
        &mut self,
        stream: &InputStream,
        flags: ParseFlags,
    ) -> ResultFw<Firmware> {
        let Device { base, ops } = self;
        ops.prepare_firmware(base, stream, flags)
    }

    /// Write a vetted payload; gates version downgrades first
    pub fn write_firmware(
        &mut self,
        firmware: &Firmware,
        progress: &mut Progress,
        flags: InstallFlags,
    ) -> ResultFw<()> {
        if self.base.has_flag(DeviceFlags::ONLY_VERSION_UPGRADE)
            && !flags.intersects(InstallFlags::FORCE | InstallFlags::ALLOW_OLDER)
            && let (Some(new), Some(old)) = (firmware.version(), self.base.version())
            && version_compare(new, old, self.base.version_format()) == std::cmp::Ordering::Less
        {
            return Err(FwError::NotSupported(format!(
                "firmware version {new} is older than device version {old}"
            )));
        }
        let Device { base, ops } = self;
        ops.write_firmware(base, firmware, progress, flags)
    }

    pub fn set_progress(&self, progress: &mut Progress) {
        self.ops.set_progress(&self.base, progress);
    }

    /// Apply one quirk effect; common keys are handled here, the rest go to
    /// the protocol ops
    pub fn set_quirk_kv(&mut self, key: &str, value: &str) -> ResultFw<()> {
        match key {
            "Flags" => {
                for name in value.split(',') {
                    if let Some(flag) = device_flag_from_string(name.trim()) {
                        self.base.add_flag(flag);
                    } else {
                        self.base.add_private_flag(name.trim());
                    }
                }
                Ok(())
            }
            "FirmwareSizeMin" => {
                self.base.set_firmware_size_min(parse_quirk_number(value)?);
                Ok(())
            }
            "FirmwareSizeMax" => {
                self.base.set_firmware_size_max(parse_quirk_number(value)?);
                Ok(())
            }
            "RemoveDelayMs" => {
                self.base
                    .set_remove_delay(Duration::from_millis(parse_quirk_number(value)?));
                Ok(())
            }
            "InstallDurationS" => {
                self.base
                    .set_install_duration(Duration::from_secs(parse_quirk_number(value)?));
                Ok(())
            }
            "Vendor" => {
                self.base.set_vendor(value);
                Ok(())
            }
            _ => {
                let Device { base, ops } = self;
                ops.set_quirk_kv(base, key, value)
            }
        }
    }

    #[must_use]
    pub fn convert_version(&self, version_raw: u64) -> String {
        self.ops.convert_version(&self.base, version_raw)
    }

    /// Multi-line debug dump including the protocol metadata
    #[must_use]
    pub fn to_string_full(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Device:");
        for (key, value) in [
            ("Name", self.base.name()),
            ("Vendor", self.base.vendor()),
            ("Serial", self.base.serial()),
            ("PhysicalId", self.base.physical_id()),
            ("LogicalId", self.base.logical_id()),
            ("Version", self.base.version()),
        ] {
            if let Some(value) = value {
                let _ = writeln!(out, "  {key}: {value}");
            }
        }
        for guid in self.base.guids() {
            let _ = writeln!(out, "  Guid: {guid}");
        }
        for (key, value) in self.ops.to_string_kv(&self.base) {
            let _ = writeln!(out, "  {key}: {value}");
        }
        out
    }
}

fn device_flag_from_string(name: &str) -> Option<DeviceFlags> {
    match name {
        "updatable" => Some(DeviceFlags::UPDATABLE),
        "is-bootloader" => Some(DeviceFlags::IS_BOOTLOADER),
        "needs-reboot" => Some(DeviceFlags::NEEDS_REBOOT),
        "needs-shutdown" => Some(DeviceFlags::NEEDS_SHUTDOWN),
        "usable-during-update" => Some(DeviceFlags::USABLE_DURING_UPDATE),
        "require-ac" => Some(DeviceFlags::REQUIRE_AC),
        "internal" => Some(DeviceFlags::INTERNAL),
        "dual-image" => Some(DeviceFlags::DUAL_IMAGE),
        "self-recovery" => Some(DeviceFlags::SELF_RECOVERY),
        "signed-payload" => Some(DeviceFlags::SIGNED_PAYLOAD),
        "unsigned-payload" => Some(DeviceFlags::UNSIGNED_PAYLOAD),
        "needs-activation" => Some(DeviceFlags::NEEDS_ACTIVATION),
        "only-version-upgrade" => Some(DeviceFlags::ONLY_VERSION_UPGRADE),
        "can-verify-image" => Some(DeviceFlags::CAN_VERIFY_IMAGE),
        _ => None,
    }
}

fn parse_quirk_number(value: &str) -> ResultFw<u64> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| FwError::InvalidData(format!("quirk value {value} is not a number")))
}

/// Call `func` until it stops returning [`FwError::Busy`].
///
/// Other errors bypass the retry; on sustained busy the final error is
/// returned after exactly `count` invocations separated by `delay`.
pub fn retry<T, F>(mut func: F, count: u32, delay: Duration) -> ResultFw<T>
where
    F: FnMut(u32) -> ResultFw<T>,
{
    if count == 0 {
        return Err(FwError::Internal("retry count is zero".into()));
    }
    for attempt in 0..count {
        match func(attempt) {
            Err(FwError::Busy(message)) => {
                if attempt + 1 == count {
                    return Err(FwError::Busy(message));
                }
                warn!("attempt {attempt} busy: {message}");
                std::thread::sleep(delay);
            }
            other => return other,
        }
    }
    unreachable!("retry loop always returns");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_retry_bound() {
        let mut invocations = 0;
        let delay = Duration::from_millis(5);
        let started = Instant::now();
        let result: ResultFw<()> = retry(
            |_| {
                invocations += 1;
                Err(FwError::Busy("status register".into()))
            },
            3,
            delay,
        );
        assert!(matches!(result, Err(FwError::Busy(_))));
        assert_eq!(invocations, 3);
        assert!(started.elapsed() >= delay * 2);
    }

    #[test]
    fn test_retry_bypasses_fatal() {
        let mut invocations = 0;
        let result: ResultFw<()> = retry(
            |_| {
                invocations += 1;
                Err(FwError::Read("gone".into()))
            },
            5,
            Duration::ZERO,
        );
        assert!(matches!(result, Err(FwError::Read(_))));
        assert_eq!(invocations, 1);
    }

    #[test]
    fn test_retry_succeeds_midway() {
        let mut invocations = 0;
        let value = retry(
            |attempt| {
                invocations += 1;
                if attempt < 2 {
                    Err(FwError::Busy("not yet".into()))
                } else {
                    Ok(42)
                }
            },
            10,
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(invocations, 3);
    }

    #[test]
    fn test_open_refcount() {
        struct CountingOps {
            opens: u32,
            closes: u32,
        }
        impl DeviceOps for CountingOps {
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
            fn open(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
                self.opens += 1;
                Ok(())
            }
            fn close(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
                self.closes += 1;
                Ok(())
            }
        }
        let device = Device::with_ops(Box::new(CountingOps { opens: 0, closes: 0 })).into_ref();
        Device::open(&device).unwrap();
        Device::open(&device).unwrap();
        Device::close(&device).unwrap();
        {
            let this = device.borrow();
            let ops = this.ops_as::<CountingOps>().unwrap();
            assert_eq!((ops.opens, ops.closes), (1, 0));
        }
        Device::close(&device).unwrap();
        {
            let this = device.borrow();
            let ops = this.ops_as::<CountingOps>().unwrap();
            assert_eq!((ops.opens, ops.closes), (1, 1));
        }
        assert!(matches!(
            Device::close(&device),
            Err(FwError::Internal(_))
        ));
    }

    #[test]
    fn test_proxy_gone() {
        let device = Device::with_ops(Box::new(NullDeviceOps)).into_ref();
        {
            let proxy = Device::with_ops(Box::new(NullDeviceOps)).into_ref();
            device.borrow_mut().set_proxy(&proxy);
            assert!(device.borrow().proxy().is_ok());
        }
        assert!(matches!(device.borrow().proxy(), Err(FwError::Gone(_))));
    }

    #[test]
    fn test_bootloader_clears_usable() {
        let mut device = Device::with_ops(Box::new(NullDeviceOps));
        device.base_mut().add_flag(DeviceFlags::USABLE_DURING_UPDATE);
        device.base_mut().add_flag(DeviceFlags::IS_BOOTLOADER);
        assert!(!device.base().has_flag(DeviceFlags::USABLE_DURING_UPDATE));
    }

    #[test]
    fn test_instance_id_builds_guid() {
        let mut device = Device::with_ops(Box::new(NullDeviceOps));
        device.base_mut().add_instance_str("VID", "17EF");
        device.base_mut().add_instance_str("PID", "61EB");
        let id = device
            .base_mut()
            .build_instance_id("USB", &["VID", "PID"])
            .unwrap();
        assert_eq!(id, "USB\\VID_17EF&PID_61EB");
        assert_eq!(device.base().guids().len(), 1);
        assert_eq!(device.base().guids()[0], guid_hash_string(&id));
    }

    #[test]
    fn test_version_upgrade_gate() {
        struct WriteOps;
        impl DeviceOps for WriteOps {
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
        }
        let mut device = Device::with_ops(Box::new(WriteOps));
        device.base_mut().add_flag(DeviceFlags::ONLY_VERSION_UPGRADE);
        device.base_mut().set_version("2.0.0");
        device.base_mut().set_version_format(VersionFormat::Triplet);
        let mut firmware = Firmware::from_bytes(vec![0]);
        firmware.set_version("1.9.9");
        let mut progress = Progress::new();
        assert!(matches!(
            device.write_firmware(&firmware, &mut progress, InstallFlags::empty()),
            Err(FwError::NotSupported(_))
        ));
        device
            .write_firmware(&firmware, &mut progress, InstallFlags::FORCE)
            .unwrap();
    }

    #[test]
    fn test_quirk_flags() {
        let mut device = Device::with_ops(Box::new(NullDeviceOps));
        device
            .set_quirk_kv("Flags", "updatable,dual-image,vendor-magic")
            .unwrap();
        assert!(device.base().has_flag(DeviceFlags::UPDATABLE));
        assert!(device.base().has_flag(DeviceFlags::DUAL_IMAGE));
        assert!(device.base().has_private_flag("vendor-magic"));
        device.set_quirk_kv("FirmwareSizeMax", "0x8000").unwrap();
        assert_eq!(device.base().firmware_size_max(), 0x8000);
        assert!(matches!(
            device.set_quirk_kv("NoSuchKey", "1"),
            Err(FwError::NotSupported(_))
        ));
    }

    #[test]
    fn test_firmware_size_bounds() {
        let mut base = DeviceBase::default();
        base.set_firmware_size_min(0x100);
        base.set_firmware_size_max(0x1000);
        assert!(check_firmware_size(&base, 0x800).is_ok());
        assert!(matches!(
            check_firmware_size(&base, 0x10),
            Err(FwError::InvalidFile(_))
        ));
        assert!(matches!(
            check_firmware_size(&base, 0x10000),
            Err(FwError::InvalidFile(_))
        ));
    }

    #[test]
    fn test_apply_donor() {
        let mut donor = DeviceBase::default();
        donor.set_vendor("ACME");
        donor.set_vid(0x17EF);
        donor.set_physical_id("PCI_SLOT_NAME=0000:03:00.0");
        donor.build_vendor_id("PCI", 0x17EF);
        let mut base = DeviceBase::default();
        base.apply_donor(
            &donor,
            IncorporateFlags::VENDOR | IncorporateFlags::VID | IncorporateFlags::VENDOR_IDS,
        );
        assert_eq!(base.vendor(), Some("ACME"));
        assert_eq!(base.vid(), 0x17EF);
        assert_eq!(base.vendor_ids().len(), 1);
        // physical ID was not requested
        assert_eq!(base.physical_id(), None);
    }
}
