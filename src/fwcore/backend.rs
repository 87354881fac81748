// SPDX-License-Identifier: LGPL-2.1-or-later

//! Bus enumeration boundary.
//!
//! Physical enumeration lives outside the core; a backend just emits probe
//! events describing devices arriving and leaving. The static backend feeds
//! scripted events to tests and to replay tooling.

use std::collections::VecDeque;
use std::path::PathBuf;

/// What a backend learned about one discovered device
#[derive(Clone, Debug, Default)]
pub struct ProbeEvent {
    pub subsystem: String,
    pub vid: u16,
    pub pid: u16,
    pub physical_id: String,
    pub device_file: Option<PathBuf>,
    pub name: Option<String>,
}

/// One enumeration change
#[derive(Clone, Debug)]
pub enum BackendEvent {
    DeviceAdded(ProbeEvent),
    /// Carries the physical ID of the departed device
    DeviceRemoved(String),
}

/// Source of probe events
pub trait Backend {
    /// Drain whatever happened since the last poll
    fn poll(&mut self) -> Vec<BackendEvent>;
}

/// Scripted backend used by tests and event replay
#[derive(Debug, Default)]
pub struct StaticBackend {
    queue: VecDeque<BackendEvent>,
}

impl StaticBackend {
    #[must_use]
    pub fn new() -> Self {
        StaticBackend::default()
    }

    pub fn push(&mut self, event: BackendEvent) {
        self.queue.push_back(event);
    }
}

impl Backend for StaticBackend {
    fn poll(&mut self) -> Vec<BackendEvent> {
        self.queue.drain(..).collect()
    }
}
