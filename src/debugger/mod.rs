pub mod ack;
pub mod api;
mod attention;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod memory;
pub mod mock;
pub mod module;
pub mod proto;
pub mod register;
mod session;
pub mod thread;
mod tile;
pub mod topology;
pub mod transport;
mod utils;
pub mod uuid;

pub use ack::AckMode;
pub use api::{ApiEvent, ApiEventKind, DetachReason, ModuleFormat, ModuleInfo};
pub use config::SessionConfig;
pub use error::{Error, Status};
pub use memory::{MemoryDesc, MemorySpace};
pub use register::RegisterType;
pub use session::RootSession;
pub use thread::EuThreadId;
pub use tile::TileSession;
pub use topology::{DeviceTopology, HwLayout, Topology};
pub use transport::{SysTransport, Transport};

use std::time::Duration;

/// Debug session handle given to a front-end: the root session or one of its tiles.
pub enum DebugSession<'a> {
    Root(&'a mut RootSession),
    Tile(&'a TileSession),
}

macro_rules! dispatch {
    ($self: expr, $s: ident => $call: expr) => {
        match $self {
            DebugSession::Root($s) => $call,
            DebugSession::Tile($s) => $call,
        }
    };
}

impl DebugSession<'_> {
    pub fn is_tile(&self) -> bool {
        matches!(self, DebugSession::Tile(_))
    }

    pub fn initialize(&mut self) -> Result<(), Error> {
        dispatch!(self, s => s.initialize())
    }

    pub fn read_event(&self, timeout: Duration) -> Result<ApiEvent, Error> {
        dispatch!(self, s => s.read_event(timeout))
    }

    pub fn acknowledge_event(&self, event: &ApiEvent) -> Result<(), Error> {
        dispatch!(self, s => s.acknowledge_event(event))
    }

    pub fn interrupt(&self, thread: EuThreadId) -> Result<(), Error> {
        dispatch!(self, s => s.interrupt(thread))
    }

    pub fn resume(&self, thread: EuThreadId) -> Result<(), Error> {
        dispatch!(self, s => s.resume(thread))
    }

    pub fn read_memory(&self, thread: EuThreadId, desc: MemoryDesc, buf: &mut [u8]) -> Result<(), Error> {
        dispatch!(self, s => s.read_memory(thread, desc, buf))
    }

    pub fn write_memory(&self, thread: EuThreadId, desc: MemoryDesc, buf: &[u8]) -> Result<(), Error> {
        dispatch!(self, s => s.write_memory(thread, desc, buf))
    }

    pub fn read_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        dispatch!(self, s => s.read_registers(thread, kind, start, count, buf))
    }

    pub fn write_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), Error> {
        dispatch!(self, s => s.write_registers(thread, kind, start, count, buf))
    }

    pub fn state_save_area_va(&self, thread: EuThreadId) -> Result<u64, Error> {
        dispatch!(self, s => s.state_save_area_va(thread))
    }
}
