// SPDX-License-Identifier: LGPL-2.1-or-later

//! Hierarchical progress reporting for write transactions.
//!
//! A device declares its steps up front; nested operations report into the
//! active child so that a dock full of sub-devices still presents one
//! contiguous 0-100% to the user. The externally visible value is monotonic:
//! a late recalculation can never move the reported percentage backwards.

use log::debug;

/// Operation the engine is currently performing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumIs)]
#[strum(serialize_all = "kebab-case")]
pub enum Status {
    #[default]
    Unknown,
    Decompressing,
    DeviceErase,
    DeviceWrite,
    DeviceRead,
    DeviceVerify,
    DeviceBusy,
    DeviceRestart,
}

/// Callback receiving coalesced `(percentage, status)` notifications
pub type ProgressSink = Box<dyn FnMut(u32, Status)>;

/// One node in the progress tree
#[derive(Default)]
pub struct Progress {
    id: Option<String>,
    status: Status,
    percentage: u32,
    weight: u32,
    steps: Vec<Progress>,
    step_now: usize,
    sink: Option<ProgressSink>,
    last_reported: u32,
}

impl Progress {
    #[must_use]
    pub fn new() -> Self {
        Progress {
            weight: 1,
            ..Progress::default()
        }
    }

    /// Identify this node in debug output
    pub fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_owned());
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.notify();
    }

    #[must_use]
    pub fn status(&self) -> Status {
        if let Some(child) = self.steps.get(self.step_now) {
            let status = child.status();
            if status != Status::Unknown {
                return status;
            }
        }
        self.status
    }

    /// Pre-create `count` equal-weight children
    pub fn set_steps(&mut self, count: usize) {
        self.steps = (0..count).map(|_| Progress::new()).collect();
        self.step_now = 0;
    }

    /// Append one weighted step
    pub fn add_step(&mut self, status: Status, weight: u32, name: Option<&str>) {
        let mut step = Progress::new();
        step.status = status;
        step.weight = weight;
        if let Some(name) = name {
            step.set_id(name);
        }
        self.steps.push(step);
    }

    /// Advance to the next child step
    pub fn step_done(&mut self) {
        if let Some(child) = self.steps.get_mut(self.step_now) {
            child.percentage = 100;
        }
        if self.step_now < self.steps.len() {
            self.step_now += 1;
        }
        self.notify();
    }

    /// The active child, so nested operations can report into their own slot
    pub fn get_child(&mut self) -> &mut Progress {
        if self.steps.is_empty() {
            debug!("no steps declared, reporting into self");
            return self;
        }
        let idx = self.step_now.min(self.steps.len() - 1);
        &mut self.steps[idx]
    }

    /// Set a leaf percentage directly
    pub fn set_percentage(&mut self, percentage: u32) {
        self.percentage = percentage.min(100);
        self.notify();
    }

    /// Set a leaf percentage from a counter
    pub fn set_percentage_full(&mut self, current: u64, total: u64) {
        if total == 0 {
            return;
        }
        self.set_percentage(((current.min(total) * 100) / total) as u32);
    }

    /// Weighted roll-up over the step tree, 0..=100
    #[must_use]
    pub fn percentage(&self) -> u32 {
        if self.steps.is_empty() {
            return self.percentage;
        }
        let total_weight: u64 = self.steps.iter().map(|s| u64::from(s.weight)).sum();
        if total_weight == 0 {
            return self.percentage;
        }
        let mut acc: u64 = 0;
        for (idx, step) in self.steps.iter().enumerate() {
            let part = if idx < self.step_now {
                100
            } else if idx == self.step_now {
                u64::from(step.percentage())
            } else {
                0
            };
            acc += part * u64::from(step.weight);
        }
        (acc / total_weight) as u32
    }

    /// Attach the notification sink; intermediate updates are coalesced so the
    /// sink only sees integer percentage changes, and never a lower value
    pub fn set_sink(&mut self, sink: ProgressSink) {
        self.sink = Some(sink);
    }

    fn notify(&mut self) {
        let value = self.percentage().max(self.last_reported);
        if let Some(sink) = self.sink.as_mut() {
            if value != self.last_reported || self.last_reported == 0 {
                sink(value, self.status);
            }
        }
        self.last_reported = value;
    }

    /// Re-emit the roll-up after a nested operation reported into a child.
    ///
    /// Children have no back-pointer, so the owner of the root calls this at
    /// step boundaries; the monotonic guard makes double-flushing harmless.
    pub fn flush(&mut self) {
        self.notify();
    }
}
