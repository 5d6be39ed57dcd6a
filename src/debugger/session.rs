//! Root debug session: kernel event reader, dispatcher and the caller side api.

use crate::debugger::ack::{AckMode, PendingAcks};
use crate::debugger::api::{ApiEvent, ApiEventKind, ApiQueue, DetachReason};
use crate::debugger::attention::{self, AttentionState};
use crate::debugger::config::SessionConfig;
use crate::debugger::connection::{BindInfo, ConnectionRegistry, PendingBind};
use crate::debugger::error::{Error, Status};
use crate::debugger::event::{self, AckRef, DecodedEvent, Event, EventHeader, VmBindEvent};
use crate::debugger::memory::{self, DebugAreaHeader, MemoryDesc, VmIo, VmTarget};
use crate::debugger::module::{self, BindScope};
use crate::debugger::register::{RegisterType, StateSaveAreaHeader};
use crate::debugger::thread::{EuThreadId, Registry};
use crate::debugger::tile::TileSession;
use crate::debugger::topology::Topology;
use crate::debugger::transport::{Transport, UuidData};
use crate::debugger::uuid::{self, ResourceClass};
use crate::{eu_error, eu_info, eu_warn, weak_error};
use nix::errno::Errno;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Per tile event consumer.
#[derive(Default)]
pub(super) struct TileState {
    pub(super) attached: bool,
    pub(super) queue: ApiQueue,
}

/// Everything guarded by the session lock.
#[derive(Default)]
pub(super) struct State {
    pub(super) connections: ConnectionRegistry,
    pub(super) threads: Registry,
    pub(super) acks: PendingAcks,
    /// Root session events.
    pub(super) queue: ApiQueue,
    /// Tile session consumers, empty if tile sessions are disabled.
    pub(super) tiles: Vec<TileState>,
    pub(super) attention: AttentionState,
    /// State save area header, read once per session.
    pub(super) ssa_header: Option<StateSaveAreaHeader>,
    /// Set once kernel connection is gone.
    pub(super) detached: Option<DetachReason>,
    pub(super) bootstrapped: bool,
}

impl State {
    fn tile_sessions(&self) -> bool {
        !self.tiles.is_empty()
    }

    /// True if events of `tile` reach a consumer.
    pub(super) fn delivers(&self, tile: u32) -> bool {
        !self.tile_sessions() || self.tiles.get(tile as usize).is_some_and(|t| t.attached)
    }

    /// Owner of acknowledgments of `tile` events, `None` for root session.
    fn ack_owner(&self, tile: u32) -> Option<u32> {
        self.tile_sessions().then_some(tile)
    }

    /// Queue thread or module event of `tile`.
    pub(super) fn push(&mut self, tile: u32, event: ApiEvent) {
        eu_info!("api event for tile {tile}: {event}");
        if !self.tile_sessions() {
            self.queue.push(event);
            return;
        }
        match self.tiles.get_mut(tile as usize) {
            Some(t) if t.attached => t.queue.push(event),
            Some(_) => eu_info!("tile {tile} is detached, {event} dropped"),
            None => eu_error!("event {event} for unknown tile {tile}"),
        }
    }

    /// Queue event to the root and every attached tile session.
    pub(super) fn push_process_wide(&mut self, event: ApiEvent) {
        eu_info!("api event: {event}");
        for tile in self.tiles.iter_mut().filter(|t| t.attached) {
            tile.queue.push(event.clone());
        }
        self.queue.push(event);
    }

    fn queue_mut(&mut self, tile: Option<u32>) -> Result<&mut ApiQueue, Error> {
        match tile {
            None => Ok(&mut self.queue),
            Some(tile) => self
                .tiles
                .get_mut(tile as usize)
                .map(|t| &mut t.queue)
                .ok_or(Error::InvalidArgument("tile index")),
        }
    }

    /// Module debug area bind of the active client.
    fn bootstrap_area(&self) -> Option<(u64, u64, BindInfo)> {
        let conn = self.connections.active()?;
        conn.module_debug_area
            .iter()
            .min_by_key(|(vm, _)| **vm)
            .map(|(vm, info)| (conn.handle, *vm, *info))
    }
}

/// Session part shared by the caller, reader and dispatcher threads.
pub(super) struct Shared {
    pub(super) transport: Arc<dyn Transport>,
    pub(super) topology: Arc<dyn Topology>,
    pub(super) config: SessionConfig,
    pub(super) ack_mode: AckMode,
    state: Mutex<State>,
    api_cond: Condvar,
    closing: AtomicBool,
}

impl Shared {
    pub(super) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn vm_io(&self, client_handle: u64) -> VmIo<'_> {
        VmIo {
            transport: self.transport.as_ref(),
            config: &self.config,
            client_handle,
        }
    }

    /// Wake up callers waiting for api events.
    pub(super) fn notify(&self) {
        self.api_cond.notify_all();
    }

    pub(super) fn ack(&self, event: AckRef) -> Result<(), Error> {
        eu_info!("ack event type {} seqno {}", event.kind, event.seqno);
        self.transport.ack_event(event)
    }

    fn ack_all(&self, events: impl IntoIterator<Item = AckRef>) {
        for event in events {
            weak_error!(self.ack(event), "kernel event ack:");
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn detach(&self, reason: DetachReason) {
        let mut state = self.lock();
        if state.detached.is_none() {
            eu_warn!("session detached: {reason}");
            state.detached = Some(reason);
            state.push_process_wide(ApiEvent::new(ApiEventKind::Detached { reason }));
        }
        drop(state);
        self.notify();
    }

    /// Decode and apply a single kernel event record.
    fn handle_internal_event(&self, record: &[u8]) {
        let Some(decoded) = weak_error!(event::decode(record), "drop kernel event:") else {
            return;
        };
        eu_info!(
            "kernel event type {} flags {:#x} seqno {}: {:?}",
            decoded.header.kind,
            decoded.header.flags,
            decoded.header.seqno,
            decoded.event
        );

        let uuid_data = match &decoded.event {
            Event::Uuid(ev) if decoded.header.is_create() && ev.payload_size > 0 => {
                let data = weak_error!(
                    self.transport
                        .read_uuid(ev.client_handle, ev.handle, ev.payload_size),
                    "read uuid:"
                );
                if let Some(data) = &data {
                    if !uuid::is_well_formed(&data.uuid) {
                        eu_warn!("uuid {} is malformed: {:?}", ev.handle, data.uuid);
                    }
                }
                data
            }
            _ => None,
        };

        let mut state = self.lock();
        self.apply_event(&mut state, decoded, uuid_data);
        drop(state);
        self.notify();
    }

    fn apply_event(&self, state: &mut State, decoded: DecodedEvent, uuid_data: Option<UuidData>) {
        let DecodedEvent { header, event } = decoded;
        let create = header.is_create();

        match event {
            Event::Client { handle } => {
                if create {
                    state.connections.on_client_create(handle);
                } else if header.is_destroy() {
                    let active = state.connections.active_handle() == Some(handle);
                    let events = state.connections.on_client_destroy(handle, state.bootstrapped);
                    if active {
                        state.threads.clear();
                        state.attention.clear();
                    }
                    events
                        .into_iter()
                        .for_each(|e| state.push_process_wide(e));
                }
            }
            Event::Context {
                client_handle,
                handle,
            } => match state.connections.get_mut(client_handle) {
                Some(conn) => conn.on_context(handle, create),
                None => eu_error!("context {handle} of unknown client {client_handle}"),
            },
            Event::Vm {
                client_handle,
                handle,
            } => match state.connections.get_mut(client_handle) {
                Some(conn) => {
                    let dropped = conn.on_vm(handle, create);
                    self.ack_all(dropped);
                }
                None => eu_error!("vm {handle} of unknown client {client_handle}"),
            },
            Event::Uuid(ev) => {
                let events = if create {
                    state.connections.on_uuid_create(&ev, uuid_data)
                } else {
                    state.connections.on_uuid_destroy(&ev)
                };
                events
                    .into_iter()
                    .for_each(|e| state.push_process_wide(e));
            }
            Event::VmBind(bind) => {
                self.on_vm_bind(state, header, bind);
                return;
            }
            Event::ContextParam(ev) => {
                let mapped = match state.connections.get_mut(ev.client_handle) {
                    Some(conn) => conn.on_context_param(&ev, self.topology.as_ref()),
                    None => {
                        eu_error!("context param of unknown client {}", ev.client_handle);
                        None
                    }
                };
                if let Some(vm) = mapped {
                    self.replay_pending_binds(state, ev.client_handle, vm);
                }
            }
            Event::Engines(ev) => match state.connections.get_mut(ev.client_handle) {
                Some(conn) => conn.on_engines(&ev, create),
                None => eu_error!("engines of unknown client {}", ev.client_handle),
            },
            Event::EuAttention(ev) => attention::on_attention(self, state, &header, &ev),
            Event::PageFault(ev) => attention::on_page_fault(self, state, &ev),
        }

        if header.need_ack() {
            weak_error!(self.ack(header.ack_ref()), "kernel event ack:");
        }
    }

    fn on_vm_bind(&self, state: &mut State, header: EventHeader, bind: VmBindEvent) {
        let mut ack = header.need_ack().then(|| header.ack_ref());
        if state.connections.active_handle() != Some(bind.client_handle) {
            eu_info!("vm bind of inactive client {} ignored", bind.client_handle);
            self.ack_all(ack);
            return;
        }
        let Some(conn) = state.connections.active_mut() else {
            return;
        };

        if !conn.vm_ids.contains(&bind.vm_handle) {
            eu_info!("vm bind {:#x} on unknown vm {}", bind.va_start, bind.vm_handle);
            self.ack_all(ack.take());
        } else if self.topology.tile_count() > 1
            && conn.tile_for_vm(bind.vm_handle).is_none()
            && bind.uuids.first().and_then(|h| conn.uuid_kind(*h)) == Some(ResourceClass::Isa)
        {
            eu_info!("vm bind {:#x} waits for vm {} tile", bind.va_start, bind.vm_handle);
            conn.pending_binds.push_back(PendingBind { header, bind });
            return;
        }

        self.apply_bind(state, &header, &bind, ack);
    }

    fn replay_pending_binds(&self, state: &mut State, client_handle: u64, vm: u64) {
        let Some(conn) = state.connections.get_mut(client_handle) else {
            return;
        };
        for pending in conn.take_pending_binds(vm) {
            eu_info!("replay vm bind {:#x} on vm {vm}", pending.bind.va_start);
            let ack = pending
                .header
                .need_ack()
                .then(|| pending.header.ack_ref());
            self.apply_bind(state, &pending.header, &pending.bind, ack);
        }
    }

    fn apply_bind(&self, state: &mut State, header: &EventHeader, bind: &VmBindEvent, ack: Option<AckRef>) {
        let tile_sessions = state.tile_sessions();
        let Some(conn) = state.connections.active_mut() else {
            self.ack_all(ack);
            return;
        };
        let tile = conn.tile_for_vm(bind.vm_handle).unwrap_or(0);
        let tile_count = self.topology.tile_count();
        let deliver = state.delivers(tile);
        let scope = BindScope {
            topology: self.topology.as_ref(),
            ack_mode: self.ack_mode,
            tile,
            tile_count,
            aggregate: tile_count > 1 && !tile_sessions,
            deliver,
            max_uuids: self.config.max_uuids_per_bind,
        };

        let Some(conn) = state.connections.active_mut() else {
            return;
        };
        let outcome = module::track_bind(conn, &scope, header, bind, ack);
        self.ack_all(outcome.ack_now);
        let owner = state.ack_owner(tile);
        for (event, ack) in outcome.hold {
            state.acks.push(owner, event, ack);
        }
        for event in outcome.events {
            state.push(tile, event);
        }
    }

    pub(super) fn read_event(&self, tile: Option<u32>, timeout: Duration) -> Result<ApiEvent, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(event) = state.queue_mut(tile)?.pop() {
                return Ok(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::NotReady);
            }
            state = self
                .api_cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(super) fn acknowledge_event(&self, tile: Option<u32>, event: &ApiEvent) -> Result<(), Error> {
        let mut state = self.lock();
        if let Some(ack) = state.acks.take(tile, event) {
            return self.ack(ack);
        }
        if let ApiEventKind::ModuleLoad(info) = &event.kind {
            if let Some(conn) = state.connections.active_mut() {
                if let Some(acks) = module::take_load_acks(conn, self.topology.as_ref(), info.load, tile) {
                    for ack in acks {
                        self.ack(ack)?;
                    }
                    return Ok(());
                }
            }
        }
        Err(Error::Uninitialized)
    }

    pub(super) fn interrupt(&self, thread: EuThreadId) -> Result<(), Error> {
        let mut state = self.lock();
        attention::interrupt(self, &mut state, thread)
    }

    pub(super) fn resume(&self, thread: EuThreadId) -> Result<(), Error> {
        let mut state = self.lock();
        attention::resume(self, &mut state, thread)
    }

    fn memory_target(state: &State, thread: &EuThreadId) -> Result<VmTarget, Error> {
        if !thread.is_single() {
            return Ok(VmTarget::Any);
        }
        state
            .threads
            .get(thread)
            .filter(|t| t.is_stopped())
            .and_then(|t| t.memory_handle)
            .map(VmTarget::Vm)
            .ok_or(Error::NotAvailable)
    }

    pub(super) fn read_memory(
        &self,
        thread: EuThreadId,
        desc: MemoryDesc,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let state = self.lock();
        let conn = state.connections.active().ok_or(Error::Uninitialized)?;
        let target = Self::memory_target(&state, &thread)?;
        memory::read_memory(
            &self.vm_io(conn.handle),
            conn,
            self.topology.as_ref(),
            target,
            desc,
            buf,
        )
    }

    pub(super) fn write_memory(&self, thread: EuThreadId, desc: MemoryDesc, buf: &[u8]) -> Result<(), Error> {
        let state = self.lock();
        let conn = state.connections.active().ok_or(Error::Uninitialized)?;
        let target = Self::memory_target(&state, &thread)?;
        memory::write_memory(
            &self.vm_io(conn.handle),
            conn,
            self.topology.as_ref(),
            target,
            desc,
            buf,
        )
    }

    pub(super) fn read_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut state = self.lock();
        attention::read_registers(self, &mut state, &thread, kind, start, count, buf)
    }

    pub(super) fn write_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), Error> {
        let mut state = self.lock();
        attention::write_registers(self, &mut state, &thread, kind, start, count, buf)
    }

    /// Canonical address of the context state save area a stopped thread runs with.
    pub(super) fn state_save_area_va(&self, thread: EuThreadId) -> Result<u64, Error> {
        let state = self.lock();
        let conn = state.connections.active().ok_or(Error::Uninitialized)?;
        let vm = match Self::memory_target(&state, &thread)? {
            VmTarget::Vm(vm) => vm,
            VmTarget::Any => return Err(Error::InvalidArgument("state save area of many threads")),
        };
        let csa = conn.context_save_area.get(&vm).ok_or(Error::NotAvailable)?;
        Ok(self.topology.canonize(csa.va))
    }
}

fn reader_loop(shared: Arc<Shared>, events: Sender<Vec<u8>>) {
    while !shared.is_closing() {
        match shared.transport.poll(shared.config.poll_timeout()) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(Error::Syscall(_, Errno::EINTR)) => continue,
            Err(Error::Syscall(_, Errno::EINVAL)) => {
                shared.detach(DetachReason::InvalidArgument);
                return;
            }
            Err(e) => {
                eu_error!("poll debug connection: {e}");
                shared.detach(DetachReason::ReadFailure);
                return;
            }
        }

        for _ in 0..shared.config.max_events_per_wakeup {
            let mut record = vec![0u8; shared.config.max_event_size];
            match shared.transport.read_event(&mut record) {
                Ok(()) => {
                    if events.send(record).is_err() {
                        return;
                    }
                }
                Err(e) if e.status() == Status::TransientRetryable => break,
                Err(e) => {
                    eu_error!("read kernel event: {e}");
                    shared.detach(DetachReason::ReadFailure);
                    return;
                }
            }
        }
    }
}

fn dispatch_loop(shared: Arc<Shared>, events: Receiver<Vec<u8>>) {
    let wait = shared.config.internal_event_wait();
    let mut disconnected = false;
    while !shared.is_closing() {
        if disconnected {
            thread::sleep(wait);
        } else {
            match events.recv_timeout(wait) {
                Ok(record) => shared.handle_internal_event(&record),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => disconnected = true,
            }
        }

        let mut state = shared.lock();
        attention::send_interrupts(&shared, &mut state);
        attention::generate_events_and_resume_stopped_threads(&shared, &mut state);
        drop(state);
        shared.notify();
    }
}

/// Session owning the kernel debug connection.
pub struct RootSession {
    shared: Arc<Shared>,
    /// Kernel event records produced by the reader, consumed by the caller
    /// during initialization and by the dispatcher afterwards.
    events: Option<Receiver<Vec<u8>>>,
    sender: Option<Sender<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    tile_sessions: Vec<TileSession>,
}

impl RootSession {
    /// Create session over transport, `version` is the kernel debug protocol version.
    pub fn new(
        transport: Arc<dyn Transport>,
        topology: Arc<dyn Topology>,
        config: SessionConfig,
        version: u32,
    ) -> Self {
        crate::log::set_channels(config.log_channels);
        let ack_mode = config
            .force_ack_mode
            .unwrap_or_else(|| AckMode::from_version(version));
        eu_info!("protocol version {version}, ack mode: {ack_mode}");

        let tiles = topology.tile_count();
        let mut state = State {
            connections: ConnectionRegistry::new(tiles),
            ..Default::default()
        };
        let tile_sessions_enabled = config.enable_tile_attach && tiles > 1;
        if tile_sessions_enabled {
            state.tiles = (0..tiles).map(|_| TileState::default()).collect();
        }

        let shared = Arc::new(Shared {
            transport,
            topology,
            config,
            ack_mode,
            state: Mutex::new(state),
            api_cond: Condvar::new(),
            closing: AtomicBool::new(false),
        });
        let tile_sessions = if tile_sessions_enabled {
            (0..tiles)
                .map(|tile| TileSession::new(tile, shared.clone()))
                .collect()
        } else {
            vec![]
        };
        let (sender, events) = mpsc::channel();

        Self {
            shared,
            events: Some(events),
            sender: Some(sender),
            reader: None,
            dispatcher: None,
            tile_sessions,
        }
    }

    pub fn ack_mode(&self) -> AckMode {
        self.shared.ack_mode
    }

    /// Tile sub-session, exists only if tile sessions are enabled on a multi-tile device.
    pub fn tile(&self, tile: u32) -> Option<&TileSession> {
        self.tile_sessions.get(tile as usize)
    }

    pub fn tile_sessions(&self) -> &[TileSession] {
        &self.tile_sessions
    }

    pub fn is_initialized(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Attach to the debuggee.
    ///
    /// Kernel events are processed on the caller thread until the module debug area is bound,
    /// then the dispatcher thread takes over. Return [`Error::NotReady`] if kernel has nothing
    /// to say yet and [`Error::DeviceLost`] if the debuggee went away before bootstrap.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.is_initialized() {
            return Ok(());
        }

        if self.reader.is_none() {
            if !self.shared.transport.poll(self.shared.config.poll_timeout())? {
                return Err(Error::NotReady);
            }
            let sender = self.sender.take().ok_or(Error::Uninitialized)?;
            let shared = self.shared.clone();
            self.reader = Some(
                thread::Builder::new()
                    .name("eudebug-reader".to_string())
                    .spawn(move || reader_loop(shared, sender))?,
            );
        }

        let events = self.events.as_ref().ok_or(Error::Uninitialized)?;
        let deadline = Instant::now() + self.shared.config.bootstrap_timeout();
        let (client_handle, vm, area) = loop {
            {
                let state = self.shared.lock();
                if state.connections.client_destroyed_before_bootstrap() || state.detached.is_some() {
                    return Err(Error::DeviceLost);
                }
                if let Some(area) = state.bootstrap_area() {
                    break area;
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::NotReady);
            }
            match events.recv_timeout(self.shared.config.internal_event_wait()) {
                Ok(record) => self.shared.handle_internal_event(&record),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(Error::DeviceLost),
            }
        };

        let mut buf = [0u8; DebugAreaHeader::SIZE];
        self.shared.vm_io(client_handle).read(vm, area.va, &mut buf)?;
        let header = DebugAreaHeader::parse(&buf)?;
        eu_info!(
            "module debug area at {:#x}, version {}, scratch {:#x}..{:#x}",
            area.va,
            header.version,
            header.scratch_begin,
            header.scratch_end
        );
        self.shared.lock().bootstrapped = true;

        let events = self.events.take().ok_or(Error::Uninitialized)?;
        let shared = self.shared.clone();
        self.dispatcher = Some(
            thread::Builder::new()
                .name("eudebug-dispatcher".to_string())
                .spawn(move || dispatch_loop(shared, events))?,
        );
        Ok(())
    }

    /// Pop the next api event, wait up to `timeout` for one.
    pub fn read_event(&self, timeout: Duration) -> Result<ApiEvent, Error> {
        self.shared.read_event(None, timeout)
    }

    /// Acknowledge api event, kernel events it holds are released.
    pub fn acknowledge_event(&self, event: &ApiEvent) -> Result<(), Error> {
        self.shared.acknowledge_event(None, event)
    }

    pub fn interrupt(&self, thread: EuThreadId) -> Result<(), Error> {
        self.shared.interrupt(thread)
    }

    pub fn resume(&self, thread: EuThreadId) -> Result<(), Error> {
        self.shared.resume(thread)
    }

    pub fn read_memory(&self, thread: EuThreadId, desc: MemoryDesc, buf: &mut [u8]) -> Result<(), Error> {
        self.shared.read_memory(thread, desc, buf)
    }

    pub fn write_memory(&self, thread: EuThreadId, desc: MemoryDesc, buf: &[u8]) -> Result<(), Error> {
        self.shared.write_memory(thread, desc, buf)
    }

    /// Read registers of a stopped thread, return bytes read.
    pub fn read_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        self.shared.read_registers(thread, kind, start, count, buf)
    }

    pub fn write_registers(
        &self,
        thread: EuThreadId,
        kind: RegisterType,
        start: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), Error> {
        self.shared.write_registers(thread, kind, start, count, buf)
    }

    pub fn state_save_area_va(&self, thread: EuThreadId) -> Result<u64, Error> {
        self.shared.state_save_area_va(thread)
    }

    /// Stop reader and dispatcher threads. Kernel connection is closed with the last
    /// reference to transport.
    pub fn close(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.notify();
        for handle in [self.reader.take(), self.dispatcher.take()].into_iter().flatten() {
            if handle.join().is_err() {
                eu_error!("session thread panicked");
            }
        }
    }
}

impl Drop for RootSession {
    fn drop(&mut self) {
        self.close();
    }
}
