//! Tile sessions: per sub-device views over the root session.

use crate::debugger::api::{ApiEvent, ApiEventKind};
use crate::debugger::error::Error;
use crate::debugger::memory::MemoryDesc;
use crate::debugger::module;
use crate::debugger::register::RegisterType;
use crate::debugger::session::Shared;
use crate::debugger::thread::EuThreadId;
use crate::{contract_violation, eu_info, weak_error};
use std::sync::Arc;
use std::time::Duration;

/// Session bound to a single tile of the device.
///
/// Tile session shares kernel connection and state with its root session, it sees
/// process wide events and events of its own tile only while attached.
#[derive(Clone)]
pub struct TileSession {
    tile: u32,
    shared: Arc<Shared>,
}

impl TileSession {
    pub(super) fn new(tile: u32, shared: Arc<Shared>) -> Self {
        Self { tile, shared }
    }

    pub fn tile(&self) -> u32 {
        self.tile
    }

    pub fn is_attached(&self) -> bool {
        let state = self.shared.lock();
        state
            .tiles
            .get(self.tile as usize)
            .is_some_and(|t| t.attached)
    }

    /// Start receiving tile events.
    ///
    /// Events describing the current process state (process entry, loaded modules, detach)
    /// are queued first. Return [`Error::NotReady`] while some module of the tile is loaded
    /// only partially.
    pub fn attach(&self) -> Result<(), Error> {
        let mut state = self.shared.lock();
        if state.tiles.get(self.tile as usize).is_some_and(|t| t.attached) {
            return Ok(());
        }
        if state
            .connections
            .active()
            .is_some_and(|conn| module::has_partial_module(conn, self.tile))
        {
            return Err(Error::NotReady);
        }

        let mut events = vec![];
        if state.connections.device_map_len() > 0 {
            events.push(ApiEvent::new(ApiEventKind::ProcessEntry));
        }
        if let Some(conn) = state.connections.active() {
            events.extend(
                module::loaded_modules(conn, self.shared.topology.as_ref(), self.tile)
                    .into_iter()
                    .map(|info| ApiEvent::new(ApiEventKind::ModuleLoad(info))),
            );
        }
        if let Some(reason) = state.detached {
            events.push(ApiEvent::new(ApiEventKind::Detached { reason }));
        }

        let tile = state
            .tiles
            .get_mut(self.tile as usize)
            .ok_or(Error::InvalidArgument("tile index"))?;
        tile.queue.clear();
        events.into_iter().for_each(|e| tile.queue.push(e));
        tile.attached = true;
        eu_info!("tile {} attached", self.tile);
        drop(state);

        self.shared.notify();
        Ok(())
    }

    /// Stop receiving tile events, kernel events held by the tile are acknowledged.
    pub fn detach(&self) -> Result<(), Error> {
        let mut state = self.shared.lock();
        if state
            .connections
            .active()
            .is_some_and(|conn| module::has_partial_module(conn, self.tile))
        {
            return Err(Error::NotReady);
        }

        let mut acks = state
            .connections
            .active_mut()
            .map(|conn| module::take_tile_acks(conn, self.tile))
            .unwrap_or_default();
        acks.extend(state.acks.take_tile(self.tile));
        for ack in acks {
            weak_error!(self.shared.ack(ack), "tile detach ack:");
        }

        let tile = state
            .tiles
            .get_mut(self.tile as usize)
            .ok_or(Error::InvalidArgument("tile index"))?;
        tile.attached = false;
        tile.queue.clear();
        eu_info!("tile {} detached", self.tile);
        Ok(())
    }

    pub fn initialize(&self) -> Result<(), Error> {
        contract_violation!("initialize called on tile {} session", self.tile)
    }

    pub fn close(&self) {
        contract_violation!("close called on tile {} session", self.tile)
    }

    fn own(&self, thread: EuThreadId) -> EuThreadId {
        EuThreadId {
            tile: self.tile,
            ..thread
        }
    }

    pub fn read_event(&self, timeout: Duration) -> Result<ApiEvent, Error> {
        self.shared.read_event(Some(self.tile), timeout)
    }

    pub fn acknowledge_event(&self, event: &ApiEvent) -> Result<(), Error> {
        self.shared.acknowledge_event(Some(self.tile), event)
    }

    pub fn interrupt(&self, thread: EuThreadId) -> Result<(), Error> {
        self.shared.interrupt(self.own(thread))
    }

    pub fn resume(&self, thread: EuThreadId) -> Result<(), Error> {
        self.shared.resume(self.own(thread))
    }

    pub fn read_memory(&self, thread: EuThreadId, desc: MemoryDesc, buf: &mut [u8]) -> Result<(), Error> {
        self.shared.read_memory(self.own(thread), desc, buf)
    }

    pub fn write_memory(&self, thread: EuThreadId, desc: MemoryDesc, buf: &[u8]) -> Result<(), Error> {
        self.shared.write_memory(self.own(thread), desc, buf)
    }

    pub fn read_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        self.shared
            .read_registers(self.own(thread), kind, start, count, buf)
    }

    pub fn write_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), Error> {
        self.shared
            .write_registers(self.own(thread), kind, start, count, buf)
    }

    pub fn state_save_area_va(&self, thread: EuThreadId) -> Result<u64, Error> {
        self.shared.state_save_area_va(self.own(thread))
    }
}
