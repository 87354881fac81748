// SPDX-License-Identifier: LGPL-2.1-or-later

//! MKHI request/response protocol spoken over the MEI transport, used to
//! read files from the ME filesystem.

use std::any::Any;
use std::time::Duration;

use crate::device::{DeviceBase, DeviceFlags, DeviceOps};
use crate::stream::read_safe;
use crate::transport::mei::MeiIo;
use crate::{FwError, ResultFw};

const MKHI_TIMEOUT: Duration = Duration::from_millis(200);

// header: group, command, reserved, result
const MKHI_HEADER_SIZE: usize = 4;
const MKHI_GROUP_ID_MCA: u8 = 0x0A;
const MKHI_COMMAND_READ_FILE: u8 = 0x02;
const MKHI_COMMAND_READ_FILE_EX: u8 = 0x0A;
const MKHI_RESPONSE_FLAG: u8 = 0x80;

const MKHI_FILENAME_SIZE: usize = 64;
const MKHI_READ_FILE_REQUEST_SIZE: usize = MKHI_HEADER_SIZE + MKHI_FILENAME_SIZE + 9;
const MKHI_READ_FILE_EX_REQUEST_SIZE: usize = MKHI_HEADER_SIZE + 13;
const MKHI_READ_FILE_RESPONSE_SIZE: usize = MKHI_HEADER_SIZE + 4;

const MKHI_READ_FILE_DATASZ: u32 = 0x80;

/// Result codes the firmware returns in the response header
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::TryFrom, derive_more::Display)]
#[try_from(repr)]
#[repr(u8)]
pub enum MkhiStatus {
    Success = 0x00,
    Fail = 0x01,
    NotSupported = 0x02,
    NotAvailable = 0x03,
    NotSet = 0x04,
    InvalidParams = 0x05,
}

fn result_to_error(result: u8) -> ResultFw<()> {
    match MkhiStatus::try_from(result) {
        Ok(MkhiStatus::Success) => Ok(()),
        Ok(MkhiStatus::NotSupported | MkhiStatus::NotAvailable | MkhiStatus::NotSet) => Err(
            FwError::NotSupported(format!("not supported [{result:#x}]")),
        ),
        _ => Err(FwError::Internal(format!("generic failure [{result:#x}]"))),
    }
}

/// Serialise a read-file request; the filename is NUL-padded to 64 bytes
pub fn build_read_file_request(filename: &str, data_size: u32, flags: u8) -> ResultFw<Vec<u8>> {
    if filename.len() >= MKHI_FILENAME_SIZE {
        return Err(FwError::InvalidData(format!(
            "filename too long, got {:#x} bytes",
            filename.len()
        )));
    }
    let mut buf = vec![0u8; MKHI_READ_FILE_REQUEST_SIZE];
    buf[0] = MKHI_GROUP_ID_MCA;
    buf[1] = MKHI_COMMAND_READ_FILE;
    read_safe(&mut buf, MKHI_HEADER_SIZE, filename.as_bytes(), 0, filename.len())?;
    // offset stays zero
    buf[MKHI_HEADER_SIZE + MKHI_FILENAME_SIZE + 4..MKHI_HEADER_SIZE + MKHI_FILENAME_SIZE + 8]
        .copy_from_slice(&data_size.to_le_bytes());
    buf[MKHI_HEADER_SIZE + MKHI_FILENAME_SIZE + 8] = flags;
    Ok(buf)
}

/// Serialise a read-file-ex request addressing by file ID and section
#[must_use]
pub fn build_read_file_ex_request(file_id: u32, section: u32, data_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; MKHI_READ_FILE_EX_REQUEST_SIZE];
    buf[0] = MKHI_GROUP_ID_MCA;
    buf[1] = MKHI_COMMAND_READ_FILE_EX;
    buf[4..8].copy_from_slice(&file_id.to_le_bytes());
    // offset stays zero
    buf[12..16].copy_from_slice(&data_size.to_le_bytes());
    buf[16] = section as u8;
    buf
}

/// Split a read-file response into `(result, data)`
pub fn parse_read_file_response(buf: &[u8], command: u8, datasz_req: u32) -> ResultFw<Vec<u8>> {
    if buf.len() < MKHI_READ_FILE_RESPONSE_SIZE {
        return Err(FwError::InvalidData(format!(
            "response truncated, got {:#x} bytes",
            buf.len()
        )));
    }
    if buf[0] != MKHI_GROUP_ID_MCA || buf[1] != (command | MKHI_RESPONSE_FLAG) {
        return Err(FwError::InvalidData(format!(
            "field command: got {:#04x}, expected {:#04x}",
            buf[1],
            command | MKHI_RESPONSE_FLAG
        )));
    }
    result_to_error(buf[3])?;
    let data_size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if data_size > datasz_req {
        return Err(FwError::InvalidData(format!(
            "invalid response data size, requested {datasz_req:#x} and got {data_size:#x}"
        )));
    }
    let end = MKHI_READ_FILE_RESPONSE_SIZE + data_size as usize;
    if end > buf.len() {
        return Err(FwError::InvalidData(format!(
            "response payload truncated, needs {end:#x} bytes"
        )));
    }
    Ok(buf[MKHI_READ_FILE_RESPONSE_SIZE..end].to_vec())
}

/// Management-engine endpoint reachable over MEI
pub struct MkhiDevice {
    mei: Box<dyn MeiIo>,
    uuid: String,
}

impl MkhiDevice {
    #[must_use]
    pub fn new(mei: Box<dyn MeiIo>, uuid: &str) -> Self {
        MkhiDevice {
            mei,
            uuid: uuid.to_owned(),
        }
    }

    /// Read a file from the MFS by name
    pub fn read_file(&mut self, filename: &str) -> ResultFw<Vec<u8>> {
        let request = build_read_file_request(filename, MKHI_READ_FILE_DATASZ, 1 << 3)?;
        self.mei.write(&request, MKHI_TIMEOUT)?;
        let mut response =
            vec![0u8; MKHI_READ_FILE_RESPONSE_SIZE + MKHI_READ_FILE_DATASZ as usize];
        self.mei.read(&mut response, MKHI_TIMEOUT)?;
        parse_read_file_response(&response, MKHI_COMMAND_READ_FILE, MKHI_READ_FILE_DATASZ)
    }

    /// Read a file from the MFS by ID, requesting at most `datasz_req` bytes
    pub fn read_file_ex(
        &mut self,
        file_id: u32,
        section: u32,
        datasz_req: u32,
    ) -> ResultFw<Vec<u8>> {
        let request = build_read_file_ex_request(file_id, section, datasz_req);
        self.mei.write(&request, MKHI_TIMEOUT)?;
        let mut response = vec![0u8; MKHI_READ_FILE_RESPONSE_SIZE + datasz_req as usize];
        self.mei.read(&mut response, MKHI_TIMEOUT)?;
        parse_read_file_response(&response, MKHI_COMMAND_READ_FILE_EX, datasz_req)
    }
}

impl DeviceOps for MkhiDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn to_string_kv(&self, _base: &DeviceBase) -> Vec<(String, String)> {
        let mut kv = vec![
            ("Uuid".to_owned(), self.uuid.clone()),
            (
                "MaxMsgLength".to_owned(),
                format!("{:#x}", self.mei.max_msg_length()),
            ),
            (
                "ProtocolVer".to_owned(),
                format!("{:#x}", self.mei.protocol_version()),
            ),
        ];
        if let Some(parent) = self.mei.parent_device_file() {
            kv.push(("ParentDeviceFile".to_owned(), parent));
        }
        kv
    }

    fn probe(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        base.add_flag(DeviceFlags::INTERNAL);
        let uuid = self.uuid.clone();
        base.add_guid(&uuid);
        Ok(())
    }

    fn open(&mut self, _base: &mut DeviceBase) -> ResultFw<()> {
        self.mei.connect(&self.uuid, 0)?;
        Ok(())
    }

    fn setup(&mut self, base: &mut DeviceBase) -> ResultFw<()> {
        // the running firmware version is the first fw_ver line
        let version = self.mei.fw_ver(0)?;
        base.set_version(&version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMei {
        response: Vec<u8>,
        written: Vec<Vec<u8>>,
    }

    impl MeiIo for FakeMei {
        fn connect(&mut self, _uuid: &str, _req: u8) -> ResultFw<(u32, u8)> {
            Ok((0x1000, 4))
        }
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> ResultFw<usize> {
            let len = self.response.len().min(buf.len());
            buf[..len].copy_from_slice(&self.response[..len]);
            Ok(len)
        }
        fn write(&mut self, buf: &[u8], _timeout: Duration) -> ResultFw<()> {
            self.written.push(buf.to_vec());
            Ok(())
        }
        fn max_msg_length(&self) -> u32 {
            0x1000
        }
        fn fw_ver(&mut self, idx: usize) -> ResultFw<String> {
            Ok(format!("0:16.1.25.{idx}"))
        }
        fn fw_status(&mut self, _idx: usize) -> ResultFw<String> {
            Ok("94000245".to_owned())
        }
    }

    fn response(command: u8, result: u8, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![MKHI_GROUP_ID_MCA, command | MKHI_RESPONSE_FLAG, 0, result];
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn test_read_file() {
        let mut device = MkhiDevice::new(
            Box::new(FakeMei {
                response: response(MKHI_COMMAND_READ_FILE, 0x00, b"contents"),
                written: Vec::new(),
            }),
            "8e6a6715-9abc-4043-88ef-9e39c6f63e0f",
        );
        let data = device.read_file("/fpf/intel/OemData").unwrap();
        assert_eq!(data, b"contents");
    }

    #[test]
    fn test_read_file_not_supported() {
        let mut device = MkhiDevice::new(
            Box::new(FakeMei {
                response: response(MKHI_COMMAND_READ_FILE, 0x02, &[]),
                written: Vec::new(),
            }),
            "8e6a6715-9abc-4043-88ef-9e39c6f63e0f",
        );
        assert!(matches!(
            device.read_file("/fpf/missing"),
            Err(FwError::NotSupported(_))
        ));
    }

    #[test]
    fn test_oversize_response_rejected() {
        let mut big = vec![0u8; 0x200];
        let header = response(MKHI_COMMAND_READ_FILE_EX, 0x00, &[]);
        big[..header.len()].copy_from_slice(&header);
        // claim more data than was requested
        big[4..8].copy_from_slice(&0x100u32.to_le_bytes());
        let mut device = MkhiDevice::new(
            Box::new(FakeMei {
                response: big,
                written: Vec::new(),
            }),
            "8e6a6715-9abc-4043-88ef-9e39c6f63e0f",
        );
        assert!(matches!(
            device.read_file_ex(0x1234, 0, 0x80),
            Err(FwError::InvalidData(_))
        ));
    }

    #[test]
    fn test_request_shapes() {
        let request = build_read_file_request("/a/b", 0x80, 0x08).unwrap();
        assert_eq!(request.len(), MKHI_READ_FILE_REQUEST_SIZE);
        assert_eq!(request[0], MKHI_GROUP_ID_MCA);
        assert_eq!(&request[4..8], b"/a/b");
        assert_eq!(request[MKHI_READ_FILE_REQUEST_SIZE - 1], 0x08);

        let request = build_read_file_ex_request(0xCAFE_F00D, 2, 0x40);
        assert_eq!(request.len(), MKHI_READ_FILE_EX_REQUEST_SIZE);
        assert_eq!(&request[4..8], &0xCAFE_F00Du32.to_le_bytes());
        assert_eq!(request[16], 2);
    }

    #[test]
    fn test_setup_reads_fw_ver() {
        let mut device = MkhiDevice::new(
            Box::new(FakeMei {
                response: Vec::new(),
                written: Vec::new(),
            }),
            "8e6a6715-9abc-4043-88ef-9e39c6f63e0f",
        );
        let mut base = DeviceBase::default();
        device.setup(&mut base).unwrap();
        assert_eq!(base.version(), Some("0:16.1.25.0"));
    }
}
