//! Debugger visible events.

use crate::debugger::thread::EuThreadId;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use strum_macros::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum DetachReason {
    /// Kernel rejected the debug descriptor, usually the debuggee is gone.
    #[strum(serialize = "invalid argument")]
    InvalidArgument,
    /// Unrecoverable event read failure.
    #[strum(serialize = "read failure")]
    ReadFailure,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum ModuleFormat {
    #[strum(serialize = "elf")]
    Elf,
}

/// Module location, `begin..end` is the ELF image and `load` its canonical GPU address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub format: ModuleFormat,
    pub begin: u64,
    pub end: u64,
    pub load: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiEventKind {
    Detached { reason: DetachReason },
    ProcessEntry,
    ProcessExit,
    ModuleLoad(ModuleInfo),
    ModuleUnload(ModuleInfo),
    ThreadStopped { thread: EuThreadId },
    ThreadUnavailable { thread: EuThreadId },
    PageFault { address: u64, mask: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiEvent {
    pub kind: ApiEventKind,
    /// Client must acknowledge event with `acknowledge_event`.
    pub need_ack: bool,
}

impl ApiEvent {
    pub fn new(kind: ApiEventKind) -> Self {
        Self {
            kind,
            need_ack: false,
        }
    }

    pub fn with_ack(kind: ApiEventKind, need_ack: bool) -> Self {
        Self { kind, need_ack }
    }

    /// Process and detach events are delivered to every session, including tile ones.
    pub fn is_process_wide(&self) -> bool {
        matches!(
            self.kind,
            ApiEventKind::Detached { .. } | ApiEventKind::ProcessEntry | ApiEventKind::ProcessExit
        )
    }
}

impl Display for ApiEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ApiEventKind::Detached { reason } => write!(f, "detached ({reason})")?,
            ApiEventKind::ProcessEntry => f.write_str("process entry")?,
            ApiEventKind::ProcessExit => f.write_str("process exit")?,
            ApiEventKind::ModuleLoad(m) => write!(
                f,
                "module load: {} {:#x}..{:#x} at {:#x}",
                m.format, m.begin, m.end, m.load
            )?,
            ApiEventKind::ModuleUnload(m) => write!(
                f,
                "module unload: {} {:#x}..{:#x} at {:#x}",
                m.format, m.begin, m.end, m.load
            )?,
            ApiEventKind::ThreadStopped { thread } => write!(f, "thread stopped: {thread}")?,
            ApiEventKind::ThreadUnavailable { thread } => {
                write!(f, "thread unavailable: {thread}")?
            }
            ApiEventKind::PageFault { address, .. } => write!(f, "page fault at {address:#x}")?,
        }
        if self.need_ack {
            f.write_str(" [need ack]")?;
        }
        Ok(())
    }
}

/// Ordered queue of events waiting for `read_event`.
#[derive(Default, Debug)]
pub struct ApiQueue {
    events: VecDeque<ApiEvent>,
}

impl ApiQueue {
    pub fn push(&mut self, event: ApiEvent) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<ApiEvent> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApiEvent> {
        self.events.iter()
    }

    pub fn clear(&mut self) {
        self.events.clear()
    }
}
