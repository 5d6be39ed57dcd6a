//! EU thread control: interrupts, attention and page fault handling, register access.

use crate::debugger::api::{ApiEvent, ApiEventKind};
use crate::debugger::connection::ClientConnection;
use crate::debugger::error::Error;
use crate::debugger::event::{AttentionEvent, EngineInstance, EventHeader, PageFaultEvent};
use crate::debugger::memory::VmIo;
use crate::debugger::register::{
    parse_sr_ident, RegisterType, StateSaveAreaHeader, SBA_REGSET, SR_IDENT_SIZE,
    SSA_HEADER_SIZE,
};
use crate::debugger::session::{Shared, State};
use crate::debugger::thread::EuThreadId;
use crate::debugger::topology::{apply_resume_workaround, Topology};
use crate::debugger::transport::{EuControlCmd, EuControlRequest};
use crate::debugger::utils::TryGetOrInsert;
use crate::{eu_error, eu_threads, muted_error, weak_error};
use indexmap::IndexMap;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;
use std::time::Instant;

/// Exception bits of CR0.1.
const CR0_EXCEPTION_MASK: u32 = 0xFC00_0000;
const CR0_FORCE_EXCEPTION: u32 = 1 << 30;
const CR0_EXTERNAL_HALT: u32 = 1 << 26;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct PendingInterrupt {
    sent: bool,
    satisfied: bool,
}

/// Interrupt requests and stop detection results waiting for event generation.
#[derive(Default)]
pub struct AttentionState {
    /// Requested selectors in request order.
    pending: IndexMap<EuThreadId, PendingInterrupt>,
    sent_at: Option<Instant>,
    /// Sequence number of the last interrupt per tile.
    interrupt_seqno: HashMap<u32, u64>,
    new_stopped: Vec<EuThreadId>,
    /// Threads already reported since the last event generation.
    reported: HashSet<EuThreadId>,
}

impl AttentionState {
    fn interrupts_sent(&self) -> bool {
        self.pending.values().any(|p| p.sent)
    }

    fn satisfy(&mut self, id: &EuThreadId) {
        for (selector, interrupt) in self.pending.iter_mut() {
            if interrupt.sent && selector.matches(id) {
                interrupt.satisfied = true;
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything, used when the debuggee is gone.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn check_selector(topology: &dyn Topology, selector: &EuThreadId) -> Result<(), Error> {
    let layout = topology.layout();
    let fits = |v: u32, bound: u32| v == EuThreadId::ALL || v < bound;
    let valid = selector.tile < topology.tile_count()
        && fits(selector.slice, layout.slices)
        && fits(selector.subslice, layout.subslices_per_slice)
        && fits(selector.eu, layout.eus_per_subslice)
        && fits(selector.thread, layout.threads_per_eu);
    if !valid {
        return Err(Error::InvalidArgument("thread coordinate"));
    }
    Ok(())
}

fn ssa_header<'a>(
    io: &VmIo,
    conn: &ClientConnection,
    vm: u64,
    cache: &'a mut Option<StateSaveAreaHeader>,
) -> Result<&'a StateSaveAreaHeader, Error> {
    cache.try_get_or_insert_with(|| {
        let csa = conn.context_save_area.get(&vm).ok_or(Error::NotAvailable)?;
        let mut buf = vec![0; SSA_HEADER_SIZE];
        io.read(vm, csa.va, &mut buf)?;
        StateSaveAreaHeader::parse(&buf)
    })
}

/// System routine counter of a thread, `None` if thread context can not be inspected.
fn sr_counter(
    shared: &Shared,
    cache: &mut Option<StateSaveAreaHeader>,
    conn: &ClientConnection,
    vm: u64,
    id: &EuThreadId,
) -> Option<u8> {
    let io = shared.vm_io(conn.handle);
    let header = muted_error!(ssa_header(&io, conn, vm, cache), "state save area:")?;
    let csa = conn.context_save_area.get(&vm)?;
    let addr = csa.va + header.sr_ident_offset(id);

    let mut ident = [0u8; SR_IDENT_SIZE];
    for _ in 0..=shared.config.sr_ident_retries {
        weak_error!(io.read(vm, addr, &mut ident), "read system routine ident:")?;
        match weak_error!(parse_sr_ident(&ident))? {
            0 => thread::sleep(shared.config.sr_ident_retry_delay()),
            counter => return Some(counter),
        }
    }
    eu_threads!("thread {id}: system routine counter is not set");
    None
}

/// Query attention bits until two scans agree.
fn rescan(shared: &Shared, client_handle: u64, engine: EngineInstance, mut bitmask: Vec<u8>) -> Vec<u8> {
    let size = shared.topology.layout().bitmask_size();
    for _ in 0..shared.config.attention_rescan_limit {
        let mut request = EuControlRequest {
            client_handle,
            cmd: EuControlCmd::Stopped,
            engine,
            bitmask: vec![0; size],
        };
        if let Err(e) = shared.transport.eu_control(&mut request) {
            eu_error!("stopped threads query on {engine}: {e}");
            break;
        }
        if request.bitmask == bitmask {
            break;
        }
        bitmask = request.bitmask;
    }
    bitmask
}

/// Handle EU attention: find threads that entered the system routine and mark them stopped.
pub(super) fn on_attention(
    shared: &Shared,
    state: &mut State,
    header: &EventHeader,
    ev: &AttentionEvent,
) {
    let topology = shared.topology.as_ref();
    let tile = topology.tile_for_engine(ev.engine);

    let State {
        connections,
        threads,
        attention,
        ssa_header,
        ..
    } = state;

    if attention.interrupts_sent() {
        if let Some(seqno) = attention.interrupt_seqno.get(&tile) {
            if header.seqno <= *seqno {
                eu_threads!("attention {} precedes interrupt {seqno}, dropped", header.seqno);
                return;
            }
        }
    }

    let Some(conn) = connections.get(ev.client_handle) else {
        eu_error!("attention of unknown client {}", ev.client_handle);
        return;
    };
    let Some(vm) = conn.vm_for_lrc(ev.lrc_handle) else {
        eu_error!("attention on lrc {} without vm", ev.lrc_handle);
        return;
    };

    let bitmask = if attention.pending.is_empty() {
        ev.bitmask.clone()
    } else {
        rescan(shared, conn.handle, ev.engine, ev.bitmask.clone())
    };
    let ids: Vec<_> = topology
        .layout()
        .threads_from_bitmask(tile, &bitmask)
        .into_iter()
        .filter(|id| id.tile < topology.tile_count())
        .collect();
    eu_threads!("attention on tile {tile}, vm {vm}: {} threads", ids.len());

    for id in ids {
        let counter = sr_counter(shared, ssa_header, conn, vm, &id);
        let thread = threads.get_or_insert(id);
        let stopped = counter.map_or(true, |c| thread.verify_stopped(c));
        if stopped {
            if thread.stop(vm) {
                eu_threads!("thread {id} stopped");
                attention.new_stopped.push(id);
            }
            attention.satisfy(&id);
        }
    }
}

/// Handle page fault: faulting threads stop and are reported right away.
pub(super) fn on_page_fault(shared: &Shared, state: &mut State, ev: &PageFaultEvent) {
    let topology = shared.topology.as_ref();
    let layout = topology.layout();
    let tile = topology.tile_for_engine(ev.engine);

    let Some(vm) = state
        .connections
        .get(ev.client_handle)
        .and_then(|conn| conn.vm_for_lrc(ev.lrc_handle))
    else {
        eu_error!("page fault on lrc {} without vm", ev.lrc_handle);
        return;
    };

    let after = layout.threads_from_bitmask(tile, &ev.after);
    let mut faulted = after.clone();
    faulted.extend(
        layout
            .threads_from_bitmask(tile, &ev.resolved)
            .into_iter()
            .filter(|id| !after.contains(id)),
    );
    if faulted.is_empty() {
        eu_error!("page fault at {:#x} without threads", ev.address);
        return;
    }

    let mut events = vec![];
    for id in &faulted {
        let thread = state.threads.get_or_insert(*id);
        thread.page_fault = true;
        if thread.stop(vm) {
            events.push(ApiEventKind::ThreadStopped { thread: *id });
        }
        state.attention.reported.insert(*id);
        state.attention.satisfy(id);
    }
    eu_threads!("page fault at {:#x}, {} threads", ev.address, faulted.len());
    events.push(ApiEventKind::PageFault {
        address: ev.address,
        mask: layout.bitmask_for_threads(&faulted),
    });
    for kind in events {
        state.push(tile, ApiEvent::new(kind));
    }
}

/// Send queued interrupt requests, one request per tile.
pub(super) fn send_interrupts(shared: &Shared, state: &mut State) {
    let topology = shared.topology.as_ref();
    let layout = topology.layout();

    let mut by_tile: BTreeMap<u32, SmallVec<[EuThreadId; 4]>> = BTreeMap::new();
    for (selector, _) in state.attention.pending.iter().filter(|(_, p)| !p.sent) {
        by_tile.entry(selector.tile).or_default().push(*selector);
    }
    if by_tile.is_empty() {
        return;
    }
    let client = state.connections.active_handle();

    for (tile, selectors) in by_tile {
        let (cmd, bitmask) = match selectors.as_slice() {
            [single] if single.is_single() => {
                (EuControlCmd::Interrupt, layout.bitmask_for_threads(&[*single]))
            }
            _ => (EuControlCmd::InterruptAll, vec![]),
        };
        let result = client.ok_or(Error::Uninitialized).and_then(|client_handle| {
            let mut request = EuControlRequest {
                client_handle,
                cmd,
                engine: topology.engine_for_tile(tile),
                bitmask,
            };
            shared.transport.eu_control(&mut request)
        });

        match result {
            Ok(seqno) => {
                eu_threads!("{cmd} sent to tile {tile}, seqno {seqno}");
                state.attention.interrupt_seqno.insert(tile, seqno);
                state.attention.sent_at = Some(Instant::now());
                for selector in &selectors {
                    if let Some(interrupt) = state.attention.pending.get_mut(selector) {
                        interrupt.sent = true;
                    }
                    if selector.is_single() {
                        state.threads.get_or_insert(*selector).request_interrupt();
                    }
                }
            }
            Err(e) => {
                eu_error!("{cmd} on tile {tile} failed: {e}");
                state.attention.interrupt_seqno.remove(&tile);
                for selector in selectors {
                    state.attention.pending.shift_remove(&selector);
                    state.push(
                        tile,
                        ApiEvent::new(ApiEventKind::ThreadUnavailable { thread: selector }),
                    );
                }
            }
        }
    }
}

/// Stop caused only by forced exception or external halt, clear those bits.
fn is_forced_stop(shared: &Shared, state: &mut State, id: &EuThreadId) -> bool {
    let mut cr = vec![0u8; 16];
    let Some(len) = muted_error!(read_registers(shared, state, id, RegisterType::Cr, 0, 1, &mut cr))
    else {
        return false;
    };
    if len < 8 {
        return false;
    }
    let cr0_1 = u32::from_le_bytes([cr[4], cr[5], cr[6], cr[7]]);
    if cr0_1 & CR0_EXCEPTION_MASK & !(CR0_FORCE_EXCEPTION | CR0_EXTERNAL_HALT) != 0 {
        return false;
    }
    let cleared = cr0_1 & !(CR0_FORCE_EXCEPTION | CR0_EXTERNAL_HALT);
    cr[4..8].copy_from_slice(&cleared.to_le_bytes());
    weak_error!(
        write_registers(shared, state, id, RegisterType::Cr, 0, 1, &cr[..len]),
        "clear exception bits:"
    );
    true
}

/// Report newly stopped threads and the outcome of interrupts.
///
/// Nothing happens while sent interrupts are neither confirmed nor timed out. Threads stopped
/// only by a forced exception that nobody asked for are resumed without an event.
pub(super) fn generate_events_and_resume_stopped_threads(shared: &Shared, state: &mut State) {
    let att = &state.attention;
    if att.pending.values().any(|p| !p.sent) {
        return;
    }
    let waiting = att.pending.values().any(|p| !p.satisfied);
    let timed_out = att
        .sent_at
        .is_some_and(|at| at.elapsed() >= shared.config.interrupt_timeout());
    if waiting && !timed_out {
        return;
    }
    if att.pending.is_empty() && att.new_stopped.is_empty() {
        return;
    }

    let mut events = vec![];
    let mut resume: BTreeMap<u32, Vec<EuThreadId>> = BTreeMap::new();
    for id in std::mem::take(&mut state.attention.new_stopped) {
        let Some(thread) = state.threads.get(&id).filter(|t| t.is_stopped()) else {
            continue;
        };
        let page_fault = thread.page_fault;
        let interrupted = state.attention.pending.keys().any(|sel| sel.matches(&id));
        if !page_fault && !interrupted && is_forced_stop(shared, state, &id) {
            resume.entry(id.tile).or_default().push(id);
            continue;
        }
        state.attention.reported.insert(id);
        events.push((id.tile, ApiEventKind::ThreadStopped { thread: id }));
    }

    for (tile, ids) in resume {
        eu_threads!("resume {} threads stopped by forced exception", ids.len());
        weak_error!(resume_threads(shared, state, tile, &ids));
    }

    for (selector, interrupt) in std::mem::take(&mut state.attention.pending) {
        if !interrupt.satisfied {
            events.push((selector.tile, ApiEventKind::ThreadUnavailable { thread: selector }));
        } else if !state.attention.reported.iter().any(|id| selector.matches(id)) {
            events.push((selector.tile, ApiEventKind::ThreadStopped { thread: selector }));
        }
    }
    state.attention.reported.clear();
    state.attention.sent_at = None;

    for (tile, kind) in events {
        state.push(tile, ApiEvent::new(kind));
    }
}

fn resume_threads(
    shared: &Shared,
    state: &mut State,
    tile: u32,
    ids: &[EuThreadId],
) -> Result<(), Error> {
    let client_handle = state
        .connections
        .active_handle()
        .ok_or(Error::Uninitialized)?;
    let topology = shared.topology.as_ref();
    let mut bitmask = topology.layout().bitmask_for_threads(ids);
    if topology.resume_workaround() {
        apply_resume_workaround(&mut bitmask);
    }
    let mut request = EuControlRequest {
        client_handle,
        cmd: EuControlCmd::Resume,
        engine: topology.engine_for_tile(tile),
        bitmask,
    };
    shared.transport.eu_control(&mut request).map_err(|e| {
        eu_error!("resume on tile {tile} failed: {e}");
        Error::NotAvailable
    })?;
    state.threads.resume(ids);
    Ok(())
}

/// Queue interrupt of selected threads, it is sent by the dispatcher.
pub(super) fn interrupt(shared: &Shared, state: &mut State, selector: EuThreadId) -> Result<(), Error> {
    check_selector(shared.topology.as_ref(), &selector)?;
    if state.connections.active_handle().is_none() {
        return Err(Error::Uninitialized);
    }
    let all_stopped = shared
        .topology
        .layout()
        .expand(&selector)
        .iter()
        .all(|id| state.threads.is_stopped(id));
    if all_stopped {
        return Err(Error::NotAvailable);
    }
    if state.attention.pending.contains_key(&selector) {
        return Err(Error::NotReady);
    }
    eu_threads!("interrupt {selector} queued");
    state
        .attention
        .pending
        .insert(selector, PendingInterrupt::default());
    Ok(())
}

/// Resume stopped threads of selector.
pub(super) fn resume(shared: &Shared, state: &mut State, selector: EuThreadId) -> Result<(), Error> {
    check_selector(shared.topology.as_ref(), &selector)?;
    let stopped = state.threads.stopped(&selector);
    if stopped.is_empty() {
        return Err(Error::NotAvailable);
    }
    eu_threads!("resume {selector}: {} threads", stopped.len());
    resume_threads(shared, state, selector.tile, &stopped)
}

/// Where registers of a thread live.
struct RegisterLocation {
    client_handle: u64,
    vm: u64,
    addr: u64,
    len: usize,
}

fn register_location(
    shared: &Shared,
    state: &mut State,
    id: &EuThreadId,
    kind: RegisterType,
    start: u32,
    count: u32,
    buf_len: usize,
) -> Result<RegisterLocation, Error> {
    if !id.is_single() {
        return Err(Error::InvalidArgument("register access needs a single thread"));
    }
    let vm = state
        .threads
        .get(id)
        .filter(|t| t.is_stopped())
        .and_then(|t| t.memory_handle)
        .ok_or(Error::NotAvailable)?;

    let State {
        connections,
        ssa_header: cache,
        ..
    } = state;
    let conn = connections.active().ok_or(Error::Uninitialized)?;

    if kind == RegisterType::Sba {
        let (offset, len) = SBA_REGSET.range(start, count)?;
        if buf_len < len {
            return Err(Error::InvalidArgument("buffer too small"));
        }
        let sba = conn.state_base_area.get(&vm).ok_or(Error::NotAvailable)?;
        return Ok(RegisterLocation {
            client_handle: conn.handle,
            vm,
            addr: sba.va + offset,
            len,
        });
    }

    let io = shared.vm_io(conn.handle);
    let header = ssa_header(&io, conn, vm, cache)?;
    let desc = header
        .regset(kind)
        .filter(|desc| desc.num > 0)
        .ok_or(Error::InvalidArgument("register type"))?;
    let (offset, len) = desc.range(start, count)?;
    if buf_len < len {
        return Err(Error::InvalidArgument("buffer too small"));
    }

    let csa = conn.context_save_area.get(&vm).ok_or(Error::NotAvailable)?;
    let mut ident = [0u8; SR_IDENT_SIZE];
    io.read(vm, csa.va + header.sr_ident_offset(id), &mut ident)?;
    parse_sr_ident(&ident)?;

    Ok(RegisterLocation {
        client_handle: conn.handle,
        vm,
        addr: csa.va + header.thread_slot_offset(id) + offset,
        len,
    })
}

/// Read `count` registers starting from `start`, return bytes read.
pub(super) fn read_registers(
    shared: &Shared,
    state: &mut State,
    id: &EuThreadId,
    kind: RegisterType,
    start: u32,
    count: u32,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let loc = register_location(shared, state, id, kind, start, count, buf.len())?;
    shared
        .vm_io(loc.client_handle)
        .read(loc.vm, loc.addr, &mut buf[..loc.len])?;
    Ok(loc.len)
}

/// Write `count` registers starting from `start`.
pub(super) fn write_registers(
    shared: &Shared,
    state: &mut State,
    id: &EuThreadId,
    kind: RegisterType,
    start: u32,
    count: u32,
    buf: &[u8],
) -> Result<(), Error> {
    if !kind.is_writable() {
        return Err(Error::InvalidArgument("read-only register type"));
    }
    let loc = register_location(shared, state, id, kind, start, count, buf.len())?;
    shared
        .vm_io(loc.client_handle)
        .write(loc.vm, loc.addr, &buf[..loc.len])
}
