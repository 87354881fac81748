// SPDX-License-Identifier: LGPL-2.1-or-later

//! Intel HEX record stream and the keyboard-controller parser derived from
//! it, which relocates the reset vector before flashing.

use std::any::Any;

use log::debug;

use crate::firmware::{Firmware, FirmwareBase, FirmwareFlags, FirmwareOps, ParseFlags};
use crate::stream::{InputStream, read_safe};
use crate::{FwError, ResultFw};

/// Record types defined by the Intel HEX format
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::TryFrom)]
#[try_from(repr)]
#[repr(u8)]
pub enum IhexRecordType {
    Data = 0x00,
    Eof = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

/// One decoded record with its absolute address
#[derive(Clone, Debug)]
pub struct IhexRecord {
    pub addr: u32,
    pub record_type: IhexRecordType,
    pub data: Vec<u8>,
}

/// Decode a `:llaaaatt..cc` text stream into absolute-addressed records
pub fn parse_records(stream: &InputStream) -> ResultFw<Vec<IhexRecord>> {
    let text = stream.as_slice();
    let mut records = Vec::new();
    let mut base_address: u32 = 0;
    for (lineno, line) in text.split(|b| *b == b'\n').enumerate() {
        let line = match line.strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => line,
        };
        if line.is_empty() {
            continue;
        }
        let Some(body) = line.strip_prefix(b":") else {
            return Err(FwError::InvalidData(format!(
                "line {}: expected ':' record start",
                lineno + 1
            )));
        };
        let bytes = decode_hex_line(body, lineno)?;
        if bytes.len() < 5 {
            return Err(FwError::InvalidData(format!(
                "line {}: record too short",
                lineno + 1
            )));
        }
        let byte_count = bytes[0] as usize;
        if bytes.len() != byte_count + 5 {
            return Err(FwError::InvalidData(format!(
                "line {}: length mismatch, got {:#x}, expected {:#x}",
                lineno + 1,
                bytes.len(),
                byte_count + 5
            )));
        }
        let addr16 = (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
        let record_type = IhexRecordType::try_from(bytes[3]).map_err(|_| {
            FwError::InvalidData(format!(
                "line {}: record type {:#04x} invalid",
                lineno + 1,
                bytes[3]
            ))
        })?;
        // two's-complement sum over the whole record must be zero
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(FwError::InvalidData(format!(
                "line {}: checksum invalid, got {:#04x}",
                lineno + 1,
                bytes[bytes.len() - 1]
            )));
        }
        let data = bytes[4..4 + byte_count].to_vec();
        match record_type {
            IhexRecordType::ExtendedSegmentAddress => {
                if data.len() != 2 {
                    return Err(FwError::InvalidData(format!(
                        "line {}: extended segment record needs 2 bytes",
                        lineno + 1
                    )));
                }
                base_address = ((u32::from(data[0]) << 8) | u32::from(data[1])) << 4;
            }
            IhexRecordType::ExtendedLinearAddress => {
                if data.len() != 2 {
                    return Err(FwError::InvalidData(format!(
                        "line {}: extended linear record needs 2 bytes",
                        lineno + 1
                    )));
                }
                base_address = ((u32::from(data[0]) << 8) | u32::from(data[1])) << 16;
            }
            _ => {}
        }
        records.push(IhexRecord {
            addr: base_address + addr16,
            record_type,
            data,
        });
        if record_type == IhexRecordType::Eof {
            break;
        }
    }
    debug!("decoded {} ihex records", records.len());
    Ok(records)
}

fn decode_hex_line(body: &[u8], lineno: usize) -> ResultFw<Vec<u8>> {
    if body.len() % 2 != 0 {
        return Err(FwError::InvalidData(format!(
            "line {}: odd number of hex digits",
            lineno + 1
        )));
    }
    body.chunks_exact(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)
                .map_err(|_| FwError::InvalidData(format!("line {}: not ASCII", lineno + 1)))?;
            u8::from_str_radix(text, 16).map_err(|_| {
                FwError::InvalidData(format!("line {}: invalid hex byte {text}", lineno + 1))
            })
        })
        .collect()
}

/// Generic Intel HEX firmware: records flattened into one zero-filled image
#[derive(Debug, Default)]
pub struct IhexFirmware {
    records: Vec<IhexRecord>,
}

impl IhexFirmware {
    #[must_use]
    pub fn new() -> Firmware {
        Firmware::with_ops(Box::new(IhexFirmware::default()))
    }

    #[must_use]
    pub fn records(&self) -> &[IhexRecord] {
        &self.records
    }
}

impl FirmwareOps for IhexFirmware {
    fn kind(&self) -> &'static str {
        "ihex"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self, stream: &InputStream, offset: u64) -> ResultFw<()> {
        if stream.read_u8(offset)? != b':' {
            return Err(FwError::NotSupported(
                "field start: got no ':', expected ihex record".into(),
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
        self.records = parse_records(stream)?;
        let mut buf = Vec::new();
        for record in &self.records {
            if record.record_type != IhexRecordType::Data {
                continue;
            }
            let end = record.addr as usize + record.data.len();
            if end > buf.len() {
                buf.resize(end, 0x00);
            }
            read_safe(&mut buf, record.addr as usize, &record.data, 0, record.data.len())?;
        }
        base.set_bytes(buf);
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> ResultFw<Vec<u8>> {
        let bytes = base.bytes()?;
        let mut out = String::new();
        for (index, line) in bytes.chunks(16).enumerate() {
            let addr = (index * 16) as u16;
            let mut record = vec![line.len() as u8, (addr >> 8) as u8, addr as u8, 0x00];
            record.extend_from_slice(line);
            let sum = record.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            record.push(sum.wrapping_neg());
            out.push(':');
            out.push_str(&hex::encode_upper(&record));
            out.push('\n');
        }
        out.push_str(":00000001FF\n");
        Ok(out.into_bytes())
    }
}

/// Keyboard-controller image built from an Intel HEX stream.
///
/// Only data and EOF records are accepted. The flat buffer is zero-extended
/// to each record's declared address. When the image is large enough and
/// bytes 1..3 hold the 0x38 0x00 bootstrap pattern, the three bytes at the
/// vendor vector slot 0x37FB..0x37FE are moved to offset 0 and the slot is
/// cleared; the swap is observable device behaviour and must stay bit-exact.
#[derive(Debug, Default)]
pub struct HailuckKbdFirmware;

impl HailuckKbdFirmware {
    #[must_use]
    pub fn new() -> Firmware {
        let mut firmware = Firmware::with_ops(Box::new(HailuckKbdFirmware));
        firmware.base_mut().add_flag(FirmwareFlags::NO_AUTO_DETECTION);
        firmware
    }
}

impl FirmwareOps for HailuckKbdFirmware {
    fn kind(&self) -> &'static str {
        "hailuck-kbd"
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
        let records = parse_records(stream)?;
        let mut buf: Vec<u8> = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if record.record_type == IhexRecordType::Eof {
                break;
            }
            if record.record_type != IhexRecordType::Data {
                return Err(FwError::NotSupported(format!(
                    "only record 0x0 supported, got {:#04x}",
                    record.record_type as u8
                )));
            }
            if record.data.is_empty() {
                return Err(FwError::NotSupported(format!(
                    "record {index:#x} had zero size"
                )));
            }
            let end = record.addr as usize + record.data.len();
            if end > buf.len() {
                if end == 0 {
                    return Err(FwError::NotSupported("buffer would have zero size".into()));
                }
                buf.resize(end, 0x00);
            }
            read_safe(&mut buf, record.addr as usize, &record.data, 0, record.data.len())?;
        }
        if buf.is_empty() {
            return Err(FwError::NotSupported("buffer would have zero size".into()));
        }

        // set the main function executed on system init
        if buf.len() > 0x37FD && buf[1] == 0x38 && buf[2] == 0x00 {
            buf[0] = buf[0x37FB];
            buf[1] = buf[0x37FC];
            buf[2] = buf[0x37FD];
            buf[0x37FB] = 0x00;
            buf[0x37FC] = 0x00;
            buf[0x37FD] = 0x00;
        }

        base.set_bytes(buf);
        Ok(())
    }
}
