// SPDX-License-Identifier: LGPL-2.1-or-later

//! Interactive requests a device raises mid-update, e.g. asking the user to
//! replug a cable. Emission never blocks the transaction; the event loop
//! schedules a continuation to re-enter the device.

use bitflags::bitflags;

/// When the user must act
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RequestKind {
    /// Act now, the update is waiting
    Immediate,
    /// Act after the update finished
    Post,
}

/// Canonical request identifiers understood by front-ends
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum RequestId {
    RemoveUsbCable,
    InsertUsbCable,
    PressUnlock,
    DoNotPowerOff,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// Front-ends without a translation for the ID may show a generic message
        const ALLOW_GENERIC_MESSAGE = 1 << 0;
    }
}

/// A user-visible request raised by a device during flashing
#[derive(Clone, Debug)]
pub struct Request {
    pub kind: RequestKind,
    pub id: RequestId,
    pub message: Option<String>,
    pub flags: RequestFlags,
}

impl Request {
    #[must_use]
    pub fn new(kind: RequestKind, id: RequestId) -> Self {
        Request {
            kind,
            id,
            message: None,
            flags: RequestFlags::empty(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_owned());
        self
    }
}
