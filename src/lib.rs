// SPDX-License-Identifier: LGPL-2.1-or-later
pub use fwcore::{
    FwError, ResultFw, backend, chunks, crc, daemon, device, firmware, formatters, guid, plugin,
    progress, quirks, request, stream, transport, version,
};

mod fwcore;
mod parsers;
