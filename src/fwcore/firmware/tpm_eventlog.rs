// SPDX-License-Identifier: LGPL-2.1-or-later

//! TPM event logs, v1 fixed-digest and v2 crypto-agile, plus the PCR fold
//! used to cross-check measurements against hardware registers.

use std::any::Any;

use serde_json::{Map, Value, json};
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384};

use crate::firmware::{ChecksumKind, Firmware, FirmwareBase, FirmwareOps, ParseFlags};
use crate::stream::{Endian, InputStream};
use crate::{FwError, ResultFw};

/// TCG algorithm identifiers
pub const TPM_ALG_SHA1: u16 = 0x0004;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_SHA384: u16 = 0x000C;
pub const TPM_ALG_SHA512: u16 = 0x000D;
pub const TPM_ALG_SM3_256: u16 = 0x0012;

/// Event type for informational records
pub const TPM_EVENT_KIND_NO_ACTION: u32 = 0x0000_0003;

const TPM_V1_ITEM_SIZE: u64 = 32;
const TPM_EVENT_SIZE_MAX: u32 = 1024 * 1024;
const TPM_V2_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";
const STARTUP_LOCALITY_SIGNATURE: &[u8; 16] = b"StartupLocality\0";

const DIGEST_SIZE_SHA1: usize = 20;
const DIGEST_SIZE_SHA256: usize = 32;
const DIGEST_SIZE_SHA384: usize = 48;
const DIGEST_SIZE_SHA512: usize = 64;
const DIGEST_SIZE_SM3_256: usize = 32;

fn alg_size(alg: u16) -> Option<usize> {
    match alg {
        TPM_ALG_SHA1 => Some(DIGEST_SIZE_SHA1),
        TPM_ALG_SHA256 => Some(DIGEST_SIZE_SHA256),
        TPM_ALG_SHA384 => Some(DIGEST_SIZE_SHA384),
        TPM_ALG_SHA512 => Some(DIGEST_SIZE_SHA512),
        TPM_ALG_SM3_256 => Some(DIGEST_SIZE_SM3_256),
        _ => None,
    }
}

/// One measured event; the digests we keep for analysis are SHA1/256/384
#[derive(Debug, Default)]
pub struct EventlogItem {
    kind: u32,
    pcr: u8,
    checksum_sha1: Option<Vec<u8>>,
    checksum_sha256: Option<Vec<u8>>,
    checksum_sha384: Option<Vec<u8>>,
}

impl EventlogItem {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(EventlogItem::default()))
    }

    #[must_use]
    pub fn kind_raw(&self) -> u32 {
        self.kind
    }

    pub fn set_kind_raw(&mut self, kind: u32) {
        self.kind = kind;
    }

    #[must_use]
    pub fn pcr(&self) -> u8 {
        self.pcr
    }

    pub fn set_pcr(&mut self, pcr: u8) {
        self.pcr = pcr;
    }

    /// Raw digest of a specific algorithm, if the log carried one
    #[must_use]
    pub fn digest(&self, alg: u16) -> Option<&[u8]> {
        match alg {
            TPM_ALG_SHA1 => self.checksum_sha1.as_deref(),
            TPM_ALG_SHA256 => self.checksum_sha256.as_deref(),
            TPM_ALG_SHA384 => self.checksum_sha384.as_deref(),
            _ => None,
        }
    }

    pub fn add_digest(&mut self, alg: u16, digest: Vec<u8>) {
        match alg {
            TPM_ALG_SHA1 => self.checksum_sha1 = Some(digest),
            TPM_ALG_SHA256 => self.checksum_sha256 = Some(digest),
            TPM_ALG_SHA384 => self.checksum_sha384 = Some(digest),
            _ => {}
        }
    }
}

impl FirmwareOps for EventlogItem {
    fn kind(&self) -> &'static str {
        "tpm-eventlog-item"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn checksum(&self, _base: &FirmwareBase, kind: ChecksumKind) -> Option<ResultFw<String>> {
        let digest = match kind {
            ChecksumKind::Sha1 => &self.checksum_sha1,
            ChecksumKind::Sha256 => &self.checksum_sha256,
            ChecksumKind::Sha384 => &self.checksum_sha384,
        };
        Some(match digest {
            Some(digest) => Ok(hex::encode(digest)),
            None => Err(FwError::NotSupported(format!("checksum {kind} not set"))),
        })
    }

    fn export(&self, _base: &FirmwareBase, node: &mut Map<String, Value>) {
        node.insert("event_kind".into(), json!(self.kind));
        node.insert("pcr".into(), json!(self.pcr));
        if let Some(digest) = &self.checksum_sha1 {
            node.insert("sha1".into(), json!(hex::encode(digest)));
        }
        if let Some(digest) = &self.checksum_sha256 {
            node.insert("sha256".into(), json!(hex::encode(digest)));
        }
        if let Some(digest) = &self.checksum_sha384 {
            node.insert("sha384".into(), json!(hex::encode(digest)));
        }
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &Value) -> ResultFw<()> {
        if let Some(kind) = node.get("event_kind").and_then(Value::as_u64) {
            self.kind = kind as u32;
        }
        if let Some(pcr) = node.get("pcr").and_then(Value::as_u64) {
            self.pcr = pcr as u8;
        }
        for (key, alg) in [
            ("sha1", TPM_ALG_SHA1),
            ("sha256", TPM_ALG_SHA256),
            ("sha384", TPM_ALG_SHA384),
        ] {
            if let Some(text) = node.get(key).and_then(Value::as_str) {
                let digest = hex::decode(text)
                    .map_err(|err| FwError::InvalidData(format!("digest not hex: {err}")))?;
                self.add_digest(alg, digest);
            }
        }
        Ok(())
    }
}

fn read_event_data(
    stream: &InputStream,
    offset: u64,
    datasz: u32,
) -> ResultFw<Option<Vec<u8>>> {
    if datasz > TPM_EVENT_SIZE_MAX {
        return Err(FwError::NotSupported("event log item too large".into()));
    }
    if datasz == 0 {
        return Ok(None);
    }
    Ok(Some(stream.read_bytes(offset, datasz as usize)?))
}

/// TPM 1.2 event log: fixed 32-byte headers with one SHA1 digest each
#[derive(Debug, Default)]
pub struct TpmEventlogV1;

impl TpmEventlogV1 {
    #[must_use]
    pub fn new() -> Firmware {
        let mut firmware = Firmware::with_ops(Box::new(TpmEventlogV1));
        // no magic to sniff, the caller has to know the layout
        firmware
            .base_mut()
            .add_flag(crate::firmware::FirmwareFlags::NO_AUTO_DETECTION);
        firmware
    }
}

impl FirmwareOps for TpmEventlogV1 {
    fn kind(&self) -> &'static str {
        "tpm-eventlog-v1"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        _flags: ParseFlags,
    ) -> ResultFw<()> {
        let streamsz = stream.size();
        let mut idx = 0u64;
        while idx < streamsz {
            let pcr = stream.read_u32(idx, Endian::Little)?;
            let event_type = stream.read_u32(idx + 4, Endian::Little)?;
            let digest = stream.read_bytes(idx + 8, DIGEST_SIZE_SHA1)?;
            let datasz = stream.read_u32(idx + 28, Endian::Little)?;

            let mut ops = EventlogItem::default();
            ops.set_pcr(pcr as u8);
            ops.set_kind_raw(event_type);
            ops.add_digest(TPM_ALG_SHA1, digest);
            let mut item = Firmware::with_ops(Box::new(ops));
            if let Some(data) = read_event_data(stream, idx + TPM_V1_ITEM_SIZE, datasz)? {
                item.set_bytes(data);
            }
            base.add_image(item)?;
            idx += TPM_V1_ITEM_SIZE + u64::from(datasz);
        }
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let mut buf = Vec::new();
        for image in base.images() {
            let item = image
                .ops_as::<EventlogItem>()
                .ok_or_else(|| FwError::Internal("image is not an event log item".into()))?;
            let digest = item
                .digest(TPM_ALG_SHA1)
                .ok_or_else(|| FwError::NotSupported("checksum sha1 not set".into()))?;
            let data = image.bytes().unwrap_or(&[]);
            buf.extend_from_slice(&u32::from(item.pcr()).to_le_bytes());
            buf.extend_from_slice(&item.kind_raw().to_le_bytes());
            buf.extend_from_slice(digest);
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(data);
        }
        Ok(buf)
    }
}

/// TPM 2.0 crypto-agile event log with a v1-shaped informational prologue
#[derive(Debug, Default)]
pub struct TpmEventlogV2;

impl TpmEventlogV2 {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(TpmEventlogV2))
    }

    fn parse_item(
        base: &mut FirmwareBase,
        stream: &InputStream,
        idx: &mut u64,
    ) -> ResultFw<()> {
        let pcr = stream.read_u32(*idx, Endian::Little)?;
        let event_type = stream.read_u32(*idx + 4, Endian::Little)?;
        let digest_count = stream.read_u32(*idx + 8, Endian::Little)?;
        *idx += 12;

        let mut ops = EventlogItem::default();
        ops.set_pcr(pcr as u8);
        ops.set_kind_raw(event_type);
        for _ in 0..digest_count {
            let alg = stream.read_u16(*idx, Endian::Little)?;
            let size = alg_size(alg).ok_or_else(|| {
                FwError::NotSupported(format!("hash algorithm {alg:#x} size not known"))
            })?;
            *idx += 2;
            let digest = stream.read_bytes(*idx, size)?;
            ops.add_digest(alg, digest);
            *idx += size as u64;
        }

        let datasz = stream.read_u32(*idx, Endian::Little)?;
        *idx += 4;
        let mut item = Firmware::with_ops(Box::new(ops));
        if let Some(data) = read_event_data(stream, *idx, datasz)? {
            item.set_bytes(data);
        }
        base.add_image(item)?;
        *idx += u64::from(datasz);
        Ok(())
    }
}

impl FirmwareOps for TpmEventlogV2 {
    fn kind(&self) -> &'static str {
        "tpm-eventlog-v2"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        let signature = stream.read_bytes(offset + TPM_V1_ITEM_SIZE, TPM_V2_SIGNATURE.len())?;
        if signature != TPM_V2_SIGNATURE {
            return Err(FwError::NotSupported(
                "field signature: no TCG v2 crypto-agility header".into(),
            ));
        }
        Ok(())
    }

    fn parse(
        &mut self,
        base: &mut FirmwareBase,
        stream: &InputStream,
        _flags: ParseFlags,
    ) -> ResultFw<()> {
        // v1-shaped prologue record declares the header size
        let hdrsz = stream.read_u32(TPM_V1_ITEM_SIZE - 4, Endian::Little)?;
        let streamsz = stream.size();
        let mut idx = TPM_V1_ITEM_SIZE + u64::from(hdrsz);
        while idx < streamsz {
            Self::parse_item(base, stream, &mut idx)?;
        }
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let mut buf = Vec::new();

        // informational prologue
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&TPM_EVENT_KIND_NO_ACTION.to_le_bytes());
        buf.extend_from_slice(&[0u8; DIGEST_SIZE_SHA1]);
        buf.extend_from_slice(&(TPM_V2_SIGNATURE.len() as u32).to_le_bytes());
        buf.extend_from_slice(TPM_V2_SIGNATURE);

        for image in base.images() {
            let item = image
                .ops_as::<EventlogItem>()
                .ok_or_else(|| FwError::Internal("image is not an event log item".into()))?;
            let digests: Vec<(u16, &[u8])> = [TPM_ALG_SHA1, TPM_ALG_SHA256, TPM_ALG_SHA384]
                .into_iter()
                .filter_map(|alg| item.digest(alg).map(|digest| (alg, digest)))
                .collect();
            buf.extend_from_slice(&u32::from(item.pcr()).to_le_bytes());
            buf.extend_from_slice(&item.kind_raw().to_le_bytes());
            buf.extend_from_slice(&(digests.len() as u32).to_le_bytes());
            for (alg, digest) in digests {
                buf.extend_from_slice(&alg.to_le_bytes());
                buf.extend_from_slice(digest);
            }
            let data = image.bytes().unwrap_or(&[]);
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(data);
        }
        Ok(buf)
    }
}

struct PcrFold {
    sha1: [u8; DIGEST_SIZE_SHA1],
    sha256: [u8; DIGEST_SIZE_SHA256],
    sha384: [u8; DIGEST_SIZE_SHA384],
    cnt_sha1: u32,
    cnt_sha256: u32,
    cnt_sha384: u32,
}

/// Calculate the possible PCR values for a register by folding each
/// measured event into a per-algorithm accumulator.
///
/// A no-action startup-locality event at index 0 seeds the low byte of each
/// accumulator with the locality instead of being measured.
pub fn calc_checksums(firmware: &Firmware, pcr: u8) -> ResultFw<Vec<String>> {
    let images = firmware.images();
    if images.is_empty() {
        return Err(FwError::InvalidData("no event log data".into()));
    }
    let mut fold = PcrFold {
        sha1: [0; DIGEST_SIZE_SHA1],
        sha256: [0; DIGEST_SIZE_SHA256],
        sha384: [0; DIGEST_SIZE_SHA384],
        cnt_sha1: 0,
        cnt_sha256: 0,
        cnt_sha384: 0,
    };
    for (index, image) in images.iter().enumerate() {
        let Some(item) = image.ops_as::<EventlogItem>() else {
            continue;
        };
        if item.pcr() != pcr {
            continue;
        }
        if item.kind_raw() == TPM_EVENT_KIND_NO_ACTION && item.pcr() == 0 && index == 0 {
            if let Ok(data) = image.bytes()
                && data.len() > STARTUP_LOCALITY_SIGNATURE.len()
                && &data[..STARTUP_LOCALITY_SIGNATURE.len()] == STARTUP_LOCALITY_SIGNATURE
            {
                let locality = data[STARTUP_LOCALITY_SIGNATURE.len()];
                fold.sha1[DIGEST_SIZE_SHA1 - 1] = locality;
                fold.sha256[DIGEST_SIZE_SHA256 - 1] = locality;
                fold.sha384[DIGEST_SIZE_SHA384 - 1] = locality;
                continue;
            }
        }
        if let Some(digest) = item.digest(TPM_ALG_SHA1) {
            let mut hasher = Sha1::new();
            hasher.update(fold.sha1);
            hasher.update(digest);
            fold.sha1.copy_from_slice(&hasher.finalize());
            fold.cnt_sha1 += 1;
        }
        if let Some(digest) = item.digest(TPM_ALG_SHA256) {
            let mut hasher = Sha256::new();
            hasher.update(fold.sha256);
            hasher.update(digest);
            fold.sha256.copy_from_slice(&hasher.finalize());
            fold.cnt_sha256 += 1;
        }
        if let Some(digest) = item.digest(TPM_ALG_SHA384) {
            let mut hasher = Sha384::new();
            hasher.update(fold.sha384);
            hasher.update(digest);
            fold.sha384.copy_from_slice(&hasher.finalize());
            fold.cnt_sha384 += 1;
        }
    }
    if fold.cnt_sha1 == 0 && fold.cnt_sha256 == 0 && fold.cnt_sha384 == 0 {
        return Err(FwError::InvalidData("no SHA1, SHA256, or SHA384 data".into()));
    }
    let mut checksums = Vec::new();
    if fold.cnt_sha1 > 0 {
        checksums.push(hex::encode(fold.sha1));
    }
    if fold.cnt_sha256 > 0 {
        checksums.push(hex::encode(fold.sha256));
    }
    if fold.cnt_sha384 > 0 {
        checksums.push(hex::encode(fold.sha384));
    }
    Ok(checksums)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_record(pcr: u32, kind: u32, digest: &[u8; 20], data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&pcr.to_le_bytes());
        buf.extend_from_slice(&kind.to_le_bytes());
        buf.extend_from_slice(digest);
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn test_v1_parse() {
        let mut blob = v1_record(0, 0x8, &[0xAA; 20], b"data");
        blob.extend(v1_record(1, 0x4, &[0xBB; 20], &[]));
        let mut firmware = TpmEventlogV1::new();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        assert_eq!(firmware.images().len(), 2);
        let item = firmware.images()[0].ops_as::<EventlogItem>().unwrap();
        assert_eq!(item.pcr(), 0);
        assert_eq!(item.digest(TPM_ALG_SHA1).unwrap(), &[0xAA; 20]);
        assert_eq!(firmware.images()[0].bytes().unwrap(), b"data");
    }

    #[test]
    fn test_v1_write_roundtrip() {
        let blob = v1_record(2, 0x0D, &[0x12; 20], b"ev");
        let mut firmware = TpmEventlogV1::new();
        firmware
            .parse(&InputStream::from_vec(blob.clone()), ParseFlags::empty())
            .unwrap();
        assert_eq!(firmware.write().unwrap(), blob);
    }

    #[test]
    fn test_v1_too_large() {
        let mut blob = v1_record(0, 0x8, &[0u8; 20], &[]);
        // overwrite datasz with something enormous
        blob[28..32].copy_from_slice(&(2 * 1024 * 1024u32).to_le_bytes());
        let mut firmware = TpmEventlogV1::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(blob), ParseFlags::empty()),
            Err(FwError::NotSupported(_))
        ));
    }

    fn v2_blob(items: &[(u32, u32, Vec<(u16, Vec<u8>)>, Vec<u8>)]) -> Vec<u8> {
        let mut buf = v1_record(0, TPM_EVENT_KIND_NO_ACTION, &[0u8; 20], TPM_V2_SIGNATURE);
        for (pcr, kind, digests, data) in items {
            buf.extend_from_slice(&pcr.to_le_bytes());
            buf.extend_from_slice(&kind.to_le_bytes());
            buf.extend_from_slice(&(digests.len() as u32).to_le_bytes());
            for (alg, digest) in digests {
                buf.extend_from_slice(&alg.to_le_bytes());
                buf.extend_from_slice(digest);
            }
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(data);
        }
        buf
    }

    #[test]
    fn test_v2_parse() {
        let blob = v2_blob(&[(
            0,
            0x8,
            vec![
                (TPM_ALG_SHA1, vec![0x01; 20]),
                (TPM_ALG_SHA256, vec![0x02; 32]),
            ],
            b"hello".to_vec(),
        )]);
        let mut firmware = TpmEventlogV2::new();
        firmware.validate(&InputStream::from_slice(&blob), 0).unwrap();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        let item = firmware.images()[0].ops_as::<EventlogItem>().unwrap();
        assert_eq!(item.digest(TPM_ALG_SHA256).unwrap(), &[0x02; 32]);
        assert_eq!(firmware.images()[0].bytes().unwrap(), b"hello");
    }

    #[test]
    fn test_v2_unknown_alg() {
        let blob = v2_blob(&[(0, 0x8, vec![(0x00FF, vec![0x01; 20])], Vec::new())]);
        let mut firmware = TpmEventlogV2::new();
        assert!(matches!(
            firmware.parse(&InputStream::from_vec(blob), ParseFlags::empty()),
            Err(FwError::NotSupported(_))
        ));
    }

    #[test]
    fn test_v2_write_roundtrip() {
        let blob = v2_blob(&[(
            4,
            0x80000008,
            vec![(TPM_ALG_SHA384, vec![0x77; 48])],
            b"x".to_vec(),
        )]);
        let mut firmware = TpmEventlogV2::new();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        let blob2 = firmware.write().unwrap();
        let mut firmware2 = TpmEventlogV2::new();
        firmware2
            .parse(&InputStream::from_vec(blob2), ParseFlags::empty())
            .unwrap();
        assert_eq!(
            firmware2.images()[0]
                .ops_as::<EventlogItem>()
                .unwrap()
                .digest(TPM_ALG_SHA384)
                .unwrap(),
            &[0x77; 48]
        );
    }

    #[test]
    fn test_pcr_fold_single() {
        let blob = v1_record(0, 0x8, &[0u8; 20], &[]);
        let mut firmware = TpmEventlogV1::new();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        let checksums = calc_checksums(&firmware, 0).unwrap();
        // one measurement of all-zeros: H(zeros20 || zeros20)
        let expected = hex::encode(Sha1::digest([0u8; 40]));
        assert_eq!(checksums, vec![expected]);
    }

    #[test]
    fn test_pcr_fold_composes() {
        let mut blob = v1_record(0, 0x8, &[0x01; 20], &[]);
        blob.extend(v1_record(0, 0x8, &[0x02; 20], &[]));
        let mut firmware = TpmEventlogV1::new();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        let step1 = Sha1::digest([[0u8; 20].as_slice(), &[0x01; 20]].concat());
        let step2 = Sha1::digest([step1.as_slice(), &[0x02; 20]].concat());
        assert_eq!(calc_checksums(&firmware, 0).unwrap(), vec![hex::encode(step2)]);
    }

    #[test]
    fn test_pcr_fold_startup_locality() {
        let mut data = STARTUP_LOCALITY_SIGNATURE.to_vec();
        data.push(0x03);
        let mut blob = v1_record(0, TPM_EVENT_KIND_NO_ACTION, &[0u8; 20], &data);
        blob.extend(v1_record(0, 0x8, &[0x05; 20], &[]));
        let mut firmware = TpmEventlogV1::new();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        let mut seed = [0u8; 20];
        seed[19] = 0x03;
        let expected = Sha1::digest([seed.as_slice(), &[0x05; 20]].concat());
        assert_eq!(calc_checksums(&firmware, 0).unwrap(), vec![hex::encode(expected)]);
    }

    #[test]
    fn test_pcr_fold_no_measurements() {
        let blob = v1_record(3, 0x8, &[0u8; 20], &[]);
        let mut firmware = TpmEventlogV1::new();
        firmware
            .parse(&InputStream::from_vec(blob), ParseFlags::empty())
            .unwrap();
        assert!(matches!(
            calc_checksums(&firmware, 7),
            Err(FwError::InvalidData(_))
        ));
    }
}
