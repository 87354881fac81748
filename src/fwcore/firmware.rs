// SPDX-License-Identifier: LGPL-2.1-or-later

//! Polymorphic firmware container.
//!
//! A [`Firmware`] is a labelled tree of images. The shared state (id, index,
//! address, version, payload bytes, child images) lives in [`FirmwareBase`];
//! the format-specific behaviour lives in a [`FirmwareOps`] implementation
//! owned by the outer value. Parsers for concrete container formats are in
//! the submodules.
//!
//! A parser must either fully describe its tree by setting `bytes` on leaf
//! images, or make `write` reconstruct the container from its structural
//! decisions; mixed partial trees are not allowed.

use std::any::Any;

use bitflags::bitflags;
use serde_json::{Map, Value, json};
use sha1::Digest;

use crate::stream::InputStream;
use crate::version::VersionFormat;
use crate::{FwError, ResultFw};

pub mod archive;
pub mod atom;
pub mod dock;
pub mod hid_descriptor;
pub mod ihex;
pub mod phat;
pub mod psp;
pub mod tpm_eventlog;
pub mod uf2;
pub mod usb4_nvm;

bitflags! {
    /// Properties a parser declares about its container
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FirmwareFlags: u32 {
        /// The image carries vendor/product IDs the device layer must verify
        const HAS_VID_PID = 1 << 0;
        /// The image carries an integrity checksum
        const HAS_CHECKSUM = 1 << 1;
        /// Never consider this parser during content sniffing
        const NO_AUTO_DETECTION = 1 << 2;
    }
}

bitflags! {
    /// Caller-supplied parse behaviour
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ParseFlags: u32 {
        /// Do not scan for magic; the image must start at offset 0
        const NO_SEARCH = 1 << 0;
        /// Skip integrity checks (developer override)
        const IGNORE_CHECKSUM = 1 << 1;
        /// Warn instead of fail on VID/PID mismatch
        const IGNORE_VID_PID = 1 << 2;
        /// Accept minor format violations
        const FORCE = 1 << 3;
    }
}

/// Digest algorithm for [`Firmware::checksum`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ChecksumKind {
    Sha1,
    Sha256,
    Sha384,
}

/// State shared by every firmware regardless of format
#[derive(Debug, Default)]
pub struct FirmwareBase {
    id: Option<String>,
    idx: u64,
    addr: u64,
    offset: u64,
    size: u64,
    version: Option<String>,
    version_raw: u64,
    version_format: VersionFormat,
    bytes: Option<Vec<u8>>,
    images: Vec<Firmware>,
    flags: FirmwareFlags,
    images_max: usize,
}

impl FirmwareBase {
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_owned());
    }

    #[must_use]
    pub fn idx(&self) -> u64 {
        self.idx
    }

    pub fn set_idx(&mut self, idx: u64) {
        self.idx = idx;
    }

    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn set_addr(&mut self, addr: u64) {
        self.addr = addr;
    }

    /// Offset within the source stream; diagnostic only
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn set_version(&mut self, version: &str) {
        self.version = Some(version.to_owned());
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

    /// Payload bytes, failing if the parser never set any
    pub fn bytes(&self) -> ResultFw<&[u8]> {
        self.bytes
            .as_deref()
            .ok_or_else(|| FwError::NotFound("no payload bytes set".into()))
    }

    #[must_use]
    pub fn has_bytes(&self) -> bool {
        self.bytes.is_some()
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        if self.size == 0 {
            self.size = bytes.len() as u64;
        }
        self.bytes = Some(bytes);
    }

    #[must_use]
    pub fn flags(&self) -> FirmwareFlags {
        self.flags
    }

    pub fn add_flag(&mut self, flag: FirmwareFlags) {
        self.flags |= flag;
    }

    #[must_use]
    pub fn images_max(&self) -> usize {
        self.images_max
    }

    pub fn set_images_max(&mut self, max: usize) {
        self.images_max = max;
    }

    #[must_use]
    pub fn images(&self) -> &[Firmware] {
        &self.images
    }

    #[must_use]
    pub fn images_mut(&mut self) -> &mut [Firmware] {
        &mut self.images
    }

    /// Append a child image, enforcing the `images_max` cap
    pub fn add_image(&mut self, image: Firmware) -> ResultFw<()> {
        if self.images_max > 0 && self.images.len() >= self.images_max {
            return Err(FwError::InvalidData(format!(
                "too many images, limit is {}",
                self.images_max
            )));
        }
        self.images.push(image);
        Ok(())
    }

    pub fn image_by_id(&self, id: &str) -> ResultFw<&Firmware> {
        self.images
            .iter()
            .find(|img| img.id() == Some(id))
            .ok_or_else(|| FwError::NotFound(format!("no image with ID {id}")))
    }

    pub fn image_by_idx(&self, idx: u64) -> ResultFw<&Firmware> {
        self.images
            .iter()
            .find(|img| img.idx() == idx)
            .ok_or_else(|| FwError::NotFound(format!("no image with index {idx:#x}")))
    }
}

/// Format-specific behaviour of a firmware container.
///
/// Defaults make a plain payload-carrying image: parse captures the stream,
/// write emits the captured bytes or the concatenated child images.
pub trait FirmwareOps: Any {
    /// Short format name used in exports and CLI selection
    fn kind(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Cheap magic/signature check; [`FwError::NotSupported`] when absent
    fn validate(&self, _stream: &InputStream, _offset: u64) -> ResultFw<()> {
        Ok(())
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        _flags: ParseFlags,
    ) -> ResultFw<()> {
        base.set_bytes(stream.as_slice().to_vec());
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        if let Ok(bytes) = base.bytes() {
            return Ok(bytes.to_vec());
        }
        if base.images().is_empty() {
            return Err(FwError::NotSupported("no payload or images to write".into()));
        }
        let mut buf = Vec::new();
        for image in base.images() {
            buf.extend_from_slice(&image.write()?);
        }
        Ok(buf)
    }

    /// Format-specific key/values merged into the export node
    fn export(&self, _base: &FirmwareBase, _node: &mut Map<String, Value>) {}

    /// Inverse of `export`, used by the golden-file test pipeline
    fn build(&mut self, _base: &mut FirmwareBase, _node: &Value) -> ResultFw<()> {
        Ok(())
    }

    /// Format-specific checksum override; `None` falls back to hashing `write()`
    fn checksum(&self, _base: &FirmwareBase, _kind: ChecksumKind) -> Option<ResultFw<String>> {
        None
    }
}

/// Default ops for an opaque payload
#[derive(Debug, Default)]
pub struct RawFirmware;

impl FirmwareOps for RawFirmware {
    fn kind(&self) -> &'static str {
        "raw"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A parsed firmware: shared state plus format-specific behaviour
pub struct Firmware {
    base: FirmwareBase,
    ops: Box<dyn FirmwareOps>,
}

impl std::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firmware")
            .field("kind", &self.ops.kind())
            .field("base", &self.base)
            .finish()
    }
}

impl Default for Firmware {
    fn default() -> Self {
        Firmware::new()
    }
}

impl Firmware {
    /// An opaque payload-carrying firmware
    #[must_use]
    pub fn new() -> Self {
        Firmware::with_ops(Box::new(RawFirmware))
    }

    #[must_use]
    pub fn with_ops(ops: Box<dyn FirmwareOps>) -> Self {
        Firmware {
            base: FirmwareBase::default(),
            ops,
        }
    }

    /// An opaque firmware wrapping existing bytes
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut firmware = Firmware::new();
        firmware.base.set_bytes(bytes);
        firmware
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.ops.kind()
    }

    #[must_use]
    pub fn base(&self) -> &FirmwareBase {
        &self.base
    }

    #[must_use]
    pub fn base_mut(&mut self) -> &mut FirmwareBase {
        &mut self.base
    }

    /// Downcast the format-specific state
    #[must_use]
    pub fn ops_as<T: FirmwareOps>(&self) -> Option<&T> {
        self.ops.as_any().downcast_ref::<T>()
    }

    /// Check the stream is parseable by this format at the given offset
    pub fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        self.ops.validate(stream, offset)
    }

    /// Parse from the start of a stream.
    ///
    /// Unless `NO_SEARCH` is given (or the parser opted out of detection),
    /// the magic is searched for byte-wise and the image may start at any
    /// offset; the found offset is recorded for diagnostics.
    pub fn parse(&mut self, stream: &InputStream, flags: ParseFlags) -> ResultFw<()> {
        let mut offset = 0u64;
        if let Err(err) = self.ops.validate(stream, 0) {
            if flags.contains(ParseFlags::NO_SEARCH)
                || self.base.flags().contains(FirmwareFlags::NO_AUTO_DETECTION)
            {
                return Err(err);
            }
            offset = self.search_magic(stream).ok_or(err)?;
        }
        self.parse_stream(stream, offset, flags)
    }

    /// Parse at an explicit offset within a larger stream
    pub fn parse_stream(
        &mut self,
        stream: &InputStream,
        offset: u64,
        flags: ParseFlags,
    ) -> ResultFw<()> {
        let window = if offset == 0 {
            stream.clone()
        } else {
            stream.partial(offset, stream.size() - offset)?
        };
        self.base.offset = offset;
        if self.base.size == 0 {
            self.base.size = window.size();
        }
        self.ops.parse(&mut self.base, &window, flags)
    }

    fn search_magic(&self, stream: &InputStream) -> Option<u64> {
        for offset in 1..stream.size() {
            if self.ops.validate(stream, offset).is_ok() {
                return Some(offset);
            }
        }
        None
    }

    /// Serialise the container back to bytes
    pub fn write(&self) -> ResultFw<Vec<u8>> {
        self.ops.write(&self.base)
    }

    /// Diagnostic tree export
    #[must_use]
    pub fn export(&self) -> Value {
        let mut node = Map::new();
        node.insert("kind".into(), json!(self.kind()));
        if let Some(id) = self.base.id() {
            node.insert("id".into(), json!(id));
        }
        if self.base.idx != 0 {
            node.insert("idx".into(), json!(self.base.idx));
        }
        if self.base.addr != 0 {
            node.insert("addr".into(), json!(self.base.addr));
        }
        if self.base.offset != 0 {
            node.insert("offset".into(), json!(self.base.offset));
        }
        if self.base.size != 0 {
            node.insert("size".into(), json!(self.base.size));
        }
        if !self.base.flags.is_empty() {
            node.insert("flags".into(), json!(self.base.flags.bits()));
        }
        if let Some(version) = self.base.version() {
            node.insert("version".into(), json!(version));
        }
        if self.base.version_raw != 0 {
            node.insert("version_raw".into(), json!(self.base.version_raw));
        }
        if let Some(bytes) = self.base.bytes.as_deref() {
            node.insert("data".into(), json!(hex::encode(bytes)));
        }
        self.ops.export(&self.base, &mut node);
        if !self.base.images.is_empty() {
            let images: Vec<Value> = self.base.images.iter().map(Firmware::export).collect();
            node.insert("images".into(), json!(images));
        }
        Value::Object(node)
    }

    /// Export with volatile keys removed, for golden-file comparison
    #[must_use]
    pub fn export_report(&self) -> Value {
        fn strip(node: &mut Value) {
            if let Value::Object(map) = node {
                map.remove("offset");
                map.remove("flags");
                map.remove("size");
                if let Some(Value::Array(images)) = map.get_mut("images") {
                    for image in images {
                        strip(image);
                    }
                }
            }
        }
        let mut value = self.export();
        strip(&mut value);
        value
    }

    /// Rebuild from an exported node
    pub fn build(&mut self, node: &Value) -> ResultFw<()> {
        let map = node
            .as_object()
            .ok_or_else(|| FwError::InvalidData("expected an object node".into()))?;
        if let Some(id) = map.get("id").and_then(Value::as_str) {
            self.base.set_id(id);
        }
        if let Some(idx) = map.get("idx").and_then(Value::as_u64) {
            self.base.set_idx(idx);
        }
        if let Some(addr) = map.get("addr").and_then(Value::as_u64) {
            self.base.set_addr(addr);
        }
        if let Some(version) = map.get("version").and_then(Value::as_str) {
            self.base.set_version(version);
        }
        if let Some(raw) = map.get("version_raw").and_then(Value::as_u64) {
            self.base.set_version_raw(raw);
        }
        if let Some(data) = map.get("data").and_then(Value::as_str) {
            let bytes = hex::decode(data)
                .map_err(|err| FwError::InvalidData(format!("data not hex: {err}")))?;
            self.base.set_bytes(bytes);
        }
        self.ops.build(&mut self.base, node)?;
        if let Some(Value::Array(images)) = map.get("images") {
            for child in images {
                let mut image = Firmware::new();
                image.build(child)?;
                self.base.add_image(image)?;
            }
        }
        Ok(())
    }

    /// Digest of the serialised payload, or the parser-provided value
    pub fn checksum(&self, kind: ChecksumKind) -> ResultFw<String> {
        if let Some(result) = self.ops.checksum(&self.base, kind) {
            return result;
        }
        let blob = self.write()?;
        Ok(match kind {
            ChecksumKind::Sha1 => hex::encode(sha1::Sha1::digest(&blob)),
            ChecksumKind::Sha256 => hex::encode(sha2::Sha256::digest(&blob)),
            ChecksumKind::Sha384 => hex::encode(sha2::Sha384::digest(&blob)),
        })
    }

    // shared-state conveniences, mirrored from the base

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.base.id()
    }

    pub fn set_id(&mut self, id: &str) {
        self.base.set_id(id);
    }

    #[must_use]
    pub fn idx(&self) -> u64 {
        self.base.idx()
    }

    pub fn set_idx(&mut self, idx: u64) {
        self.base.set_idx(idx);
    }

    #[must_use]
    pub fn addr(&self) -> u64 {
        self.base.addr()
    }

    pub fn set_addr(&mut self, addr: u64) {
        self.base.set_addr(addr);
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.base.size()
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.base.version()
    }

    pub fn set_version(&mut self, version: &str) {
        self.base.set_version(version);
    }

    #[must_use]
    pub fn version_raw(&self) -> u64 {
        self.base.version_raw()
    }

    pub fn bytes(&self) -> ResultFw<&[u8]> {
        self.base.bytes()
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.base.set_bytes(bytes);
    }

    #[must_use]
    pub fn images(&self) -> &[Firmware] {
        self.base.images()
    }

    pub fn add_image(&mut self, image: Firmware) -> ResultFw<()> {
        self.base.add_image(image)
    }

    pub fn image_by_id(&self, id: &str) -> ResultFw<&Firmware> {
        self.base.image_by_id(id)
    }

    pub fn image_by_idx(&self, idx: u64) -> ResultFw<&Firmware> {
        self.base.image_by_idx(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip() {
        let stream = InputStream::from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut firmware = Firmware::new();
        firmware.parse(&stream, ParseFlags::empty()).unwrap();
        assert_eq!(firmware.write().unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(firmware.size(), 4);
    }

    #[test]
    fn test_write_concatenates_images() {
        let mut firmware = Firmware::new();
        firmware.add_image(Firmware::from_bytes(vec![1, 2])).unwrap();
        firmware.add_image(Firmware::from_bytes(vec![3])).unwrap();
        assert_eq!(firmware.write().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_images_max_enforced() {
        let mut firmware = Firmware::new();
        firmware.base_mut().set_images_max(1);
        firmware.add_image(Firmware::new()).unwrap();
        assert!(matches!(
            firmware.add_image(Firmware::new()),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_image_lookup() {
        let mut firmware = Firmware::new();
        let mut child = Firmware::from_bytes(vec![7]);
        child.set_id("payload");
        child.set_idx(0x42);
        firmware.add_image(child).unwrap();
        assert_eq!(firmware.image_by_id("payload").unwrap().idx(), 0x42);
        assert!(matches!(
            firmware.image_by_id("missing"),
            Err(FwError::NotFound(_))
        ));
        assert!(firmware.image_by_idx(0x42).is_ok());
    }

    #[test]
    fn test_export_build_roundtrip() {
        let mut firmware = Firmware::from_bytes(vec![0xAA, 0xBB]);
        firmware.set_id("outer");
        firmware.base_mut().set_version("1.2.3");
        let mut child = Firmware::from_bytes(vec![0xCC]);
        child.set_id("inner");
        firmware.add_image(child).unwrap();

        let node = firmware.export();
        let mut rebuilt = Firmware::new();
        rebuilt.build(&node).unwrap();
        assert_eq!(rebuilt.id(), Some("outer"));
        assert_eq!(rebuilt.version(), Some("1.2.3"));
        assert_eq!(rebuilt.bytes().unwrap(), &[0xAA, 0xBB]);
        assert_eq!(rebuilt.images().len(), 1);
        assert_eq!(rebuilt.export_report(), firmware.export_report());
    }

    #[test]
    fn test_checksum_default() {
        let firmware = Firmware::from_bytes(b"abc".to_vec());
        assert_eq!(
            firmware.checksum(ChecksumKind::Sha1).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            firmware.checksum(ChecksumKind::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
