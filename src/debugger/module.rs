//! Module lifecycle built from VM bind events.
//!
//! A bind whose first uuid is of ISA class creates (or references) an [`IsaAllocation`]
//! on the tile of its VM. An allocation without a zebin module uuid is a module by itself,
//! allocations sharing a zebin module uuid are segments of one [`Module`], that is loaded
//! when every segment is bound.

use crate::debugger::ack::AckMode;
use crate::debugger::api::{ApiEvent, ApiEventKind, ModuleFormat, ModuleInfo};
use crate::debugger::connection::{BindInfo, ClientConnection};
use crate::debugger::event::{AckRef, EventHeader, VmBindEvent};
use crate::debugger::topology::Topology;
use crate::debugger::uuid::ResourceClass;
use crate::{eu_error, eu_info};
use std::collections::BTreeSet;

/// GPU memory range holding instructions of a kernel or of a module segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IsaAllocation {
    pub bind: BindInfo,
    pub vm: u64,
    pub isa_uuid: u64,
    pub elf: Option<u64>,
    /// Zebin module the allocation is a segment of.
    pub module: Option<u64>,
    pub module_begin: u64,
    pub module_end: u64,
    /// Allocation is bound on every tile.
    pub tile_instanced: bool,
    pub bind_count: u32,
    /// Kernel events waiting for client acknowledgment of module load.
    pub ack_events: Vec<AckRef>,
    pub load_acked: bool,
    pub load_emitted: bool,
}

impl IsaAllocation {
    /// Allocation is a module by itself.
    pub fn per_kernel(&self) -> bool {
        self.module.is_none()
    }

    fn info(&self, topology: &dyn Topology) -> ModuleInfo {
        ModuleInfo {
            format: ModuleFormat::Elf,
            begin: self.module_begin,
            end: self.module_end,
            load: topology.canonize(self.bind.va),
        }
    }
}

/// Module state on a single tile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleTile {
    pub load_addresses: BTreeSet<u64>,
    pub ack_events: Vec<AckRef>,
    pub load_acked: bool,
    pub load_emitted: bool,
    /// Reported load address, valid while `load_emitted`.
    pub load: u64,
}

impl ModuleTile {
    fn is_loaded(&self, segment_count: u32) -> bool {
        self.load_addresses.len() >= segment_count.max(1) as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub handle: u64,
    pub segment_count: u32,
    pub elf: Option<u64>,
    pub module_begin: u64,
    pub module_end: u64,
    pub tiles: Vec<ModuleTile>,
}

impl Module {
    pub fn new(handle: u64, segment_count: u32, tiles: u32) -> Self {
        Self {
            handle,
            segment_count,
            elf: None,
            module_begin: 0,
            module_end: 0,
            tiles: vec![ModuleTile::default(); tiles.max(1) as usize],
        }
    }

    pub fn is_loaded(&self, tile: u32) -> bool {
        self.tiles
            .get(tile as usize)
            .map(|t| t.is_loaded(self.segment_count))
            .unwrap_or(false)
    }

    /// Some, but not all, segments are bound on tile.
    pub fn is_partially_loaded(&self, tile: u32) -> bool {
        self.tiles
            .get(tile as usize)
            .map(|t| !t.load_addresses.is_empty() && !t.is_loaded(self.segment_count))
            .unwrap_or(false)
    }

    fn info(&self, load: u64) -> ModuleInfo {
        ModuleInfo {
            format: ModuleFormat::Elf,
            begin: self.module_begin,
            end: self.module_end,
            load,
        }
    }
}

/// Where and how a bind is applied.
pub struct BindScope<'a> {
    pub topology: &'a dyn Topology,
    pub ack_mode: AckMode,
    /// Tile of bind VM.
    pub tile: u32,
    pub tile_count: u32,
    /// Single module event for all tiles, instead of an event per tile.
    pub aggregate: bool,
    /// Events of this tile reach a consumer.
    pub deliver: bool,
    pub max_uuids: usize,
}

/// Result of a bind: new api events and kernel events disposition.
#[derive(Default, Debug, PartialEq)]
pub struct BindOutcome {
    pub events: Vec<ApiEvent>,
    /// Kernel events to acknowledge right away.
    pub ack_now: Vec<AckRef>,
    /// Api events holding a kernel event until acknowledged by client.
    pub hold: Vec<(ApiEvent, AckRef)>,
}

impl BindOutcome {
    fn ack(&mut self, ack: Option<AckRef>) {
        self.ack_now.extend(ack);
    }
}

/// Apply VM bind to connection state.
///
/// `ack` is the kernel event to acknowledge, `None` if bind does not need one.
pub fn track_bind(
    conn: &mut ClientConnection,
    scope: &BindScope,
    header: &EventHeader,
    bind: &VmBindEvent,
    ack: Option<AckRef>,
) -> BindOutcome {
    let mut out = BindOutcome::default();

    if bind.uuids.is_empty() || bind.uuids.len() > scope.max_uuids {
        eu_info!(
            "vm bind {:#x} with {} uuids ignored",
            bind.va_start,
            bind.uuids.len()
        );
        out.ack(ack);
        return out;
    }

    let first = bind.uuids[0];
    let Some(kind) = conn.uuids.get(&first).map(|obj| obj.kind) else {
        eu_error!("vm bind {:#x} refers unknown uuid {first}", bind.va_start);
        out.ack(ack);
        return out;
    };

    match kind {
        Some(kind) if kind.is_special_area() => {
            let info = BindInfo {
                va: bind.va_start,
                size: bind.va_length,
            };
            eu_info!("{kind} bound at {:#x} in vm {}", info.va, bind.vm_handle);
            if header.is_create() || header.is_destroy() {
                conn.record_special_bind(kind, bind.vm_handle, info, header.is_create());
            }
            out.ack(ack);
        }
        Some(ResourceClass::Isa) => track_isa(conn, scope, header, bind, ack, &mut out),
        _ => out.ack(ack),
    }
    out
}

fn track_isa(
    conn: &mut ClientConnection,
    scope: &BindScope,
    header: &EventHeader,
    bind: &VmBindEvent,
    ack: Option<AckRef>,
    out: &mut BindOutcome,
) {
    let isa_uuid = bind.uuids[0];
    let mut elf = None;
    let mut module = None;
    let mut tile_instanced = false;
    for handle in &bind.uuids[1..] {
        let Some(obj) = conn.uuids.get(handle) else {
            eu_error!("vm bind {:#x} refers unknown uuid {handle}", bind.va_start);
            continue;
        };
        match obj.kind {
            Some(ResourceClass::Elf) => elf = Some(*handle),
            Some(ResourceClass::ZebinModule) => module = Some(*handle),
            // cookie uuids are instances of the ISA uuid itself
            _ if obj.class_handle == isa_uuid => tile_instanced = true,
            _ => {}
        }
    }
    let (module_begin, module_end) = elf
        .and_then(|h| conn.uuids.get(&h))
        .map(|obj| (obj.ptr, obj.ptr.saturating_add(obj.data.len() as u64)))
        .unwrap_or_default();

    let tile = scope.tile as usize;
    let va = bind.va_start;
    let Some(map) = conn.isa.get_mut(tile) else {
        eu_error!("vm bind {va:#x} on unknown tile {tile}");
        out.ack(ack);
        return;
    };

    if header.is_create() {
        let is_new = !map.contains_key(&va);
        let alloc = map.entry(va).or_insert_with(|| IsaAllocation {
            bind: BindInfo {
                va,
                size: bind.va_length,
            },
            vm: bind.vm_handle,
            isa_uuid,
            elf,
            module,
            module_begin,
            module_end,
            tile_instanced,
            ..Default::default()
        });
        alloc.bind_count += 1;

        match module {
            None => isa_created(conn, scope, va, is_new, ack, out),
            Some(handle) => segment_created(
                conn,
                scope,
                handle,
                va,
                is_new,
                (elf, module_begin, module_end),
                ack,
                out,
            ),
        }
    } else if header.is_destroy() {
        let Some(alloc) = map.get_mut(&va) else {
            eu_error!("unbind of unknown isa {va:#x}");
            out.ack(ack);
            return;
        };
        alloc.bind_count = alloc.bind_count.saturating_sub(1);
        if alloc.bind_count > 0 {
            out.ack(ack);
            return;
        }

        let Some(alloc) = map.remove(&va) else {
            return;
        };
        out.ack_now.extend(alloc.ack_events.iter().copied());
        match alloc.module {
            None => isa_removed(conn, scope, &alloc, ack, out),
            Some(handle) => segment_removed(conn, scope, handle, va, ack, out),
        }

        conn.release_uuid(alloc.isa_uuid);
        if let Some(elf) = alloc.elf {
            conn.release_uuid(elf);
        }
    } else {
        out.ack(ack);
    }
}

fn tiles_with_isa(conn: &ClientConnection, va: u64) -> usize {
    conn.isa.iter().filter(|m| m.contains_key(&va)).count()
}

fn isa_created(
    conn: &mut ClientConnection,
    scope: &BindScope,
    va: u64,
    is_new: bool,
    ack: Option<AckRef>,
    out: &mut BindOutcome,
) {
    let tile = scope.tile as usize;
    let Some(alloc) = conn.isa[tile].get_mut(&va) else {
        return;
    };

    if !scope.deliver {
        alloc.load_acked = true;
        out.ack(ack);
        return;
    }
    match ack {
        Some(ack) if !alloc.load_acked => alloc.ack_events.push(ack),
        ack => out.ack(ack),
    }
    if !is_new {
        return;
    }

    let tile_instanced = alloc.tile_instanced;
    let emit = if scope.aggregate {
        let bound = tiles_with_isa(conn, va);
        if tile_instanced {
            bound >= scope.tile_count as usize
        } else {
            bound == 1
        }
    } else {
        true
    };
    if !emit {
        return;
    }

    let mut allocs: Vec<&mut IsaAllocation> = conn
        .isa
        .iter_mut()
        .enumerate()
        .filter(|(t, _)| scope.aggregate || *t == tile)
        .filter_map(|(_, m)| m.get_mut(&va))
        .collect();
    let need_ack = allocs.iter().any(|a| !a.ack_events.is_empty());
    let info = allocs
        .first()
        .map(|a| a.info(scope.topology))
        .unwrap_or_else(|| ModuleInfo {
            format: ModuleFormat::Elf,
            begin: 0,
            end: 0,
            load: scope.topology.canonize(va),
        });
    for alloc in allocs.iter_mut() {
        alloc.load_emitted = true;
        if !need_ack {
            alloc.load_acked = true;
        }
    }

    eu_info!("module load at {:#x}, need ack: {need_ack}", info.load);
    out.events
        .push(ApiEvent::with_ack(ApiEventKind::ModuleLoad(info), need_ack));
}

fn isa_removed(
    conn: &ClientConnection,
    scope: &BindScope,
    alloc: &IsaAllocation,
    ack: Option<AckRef>,
    out: &mut BindOutcome,
) {
    let last = !scope.aggregate || tiles_with_isa(conn, alloc.bind.va) == 0;
    if !(alloc.load_emitted && scope.deliver && last) {
        out.ack(ack);
        return;
    }

    let event = ApiEvent::with_ack(
        ApiEventKind::ModuleUnload(alloc.info(scope.topology)),
        ack.is_some(),
    );
    eu_info!("module unload at {:#x}", alloc.bind.va);
    if let Some(ack) = ack {
        out.hold.push((event.clone(), ack));
    }
    out.events.push(event);
}

#[allow(clippy::too_many_arguments)]
fn segment_created(
    conn: &mut ClientConnection,
    scope: &BindScope,
    handle: u64,
    va: u64,
    is_new: bool,
    (elf, begin, end): (Option<u64>, u64, u64),
    ack: Option<AckRef>,
    out: &mut BindOutcome,
) {
    let tile = scope.tile as usize;
    let Some(module) = conn.modules.get_mut(&handle) else {
        eu_error!("segment {va:#x} of unknown module {handle}");
        out.ack(ack);
        return;
    };
    if module.elf.is_none() && elf.is_some() {
        module.elf = elf;
        module.module_begin = begin;
        module.module_end = end;
    }

    let segment_count = module.segment_count;
    let Some(mt) = module.tiles.get_mut(tile) else {
        out.ack(ack);
        return;
    };
    let completed = is_new && mt.load_addresses.insert(va) && mt.is_loaded(segment_count);

    if !scope.deliver {
        mt.load_acked = true;
        out.ack(ack);
        return;
    }

    let defer = |mt: &mut ModuleTile, out: &mut BindOutcome| match ack {
        Some(ack) if !mt.load_acked && scope.ack_mode.is_fence() => mt.ack_events.push(ack),
        ack => out.ack(ack),
    };
    if !completed {
        defer(mt, out);
        return;
    }

    let all_loaded = module.tiles.iter().all(|t| t.is_loaded(segment_count));
    if scope.aggregate && !all_loaded {
        if let Some(mt) = module.tiles.get_mut(tile) {
            defer(mt, out);
        }
        return;
    }

    let load = module.tiles[tile].load_addresses.first().copied().unwrap_or(va);
    let load = scope.topology.canonize(load);
    module.tiles[tile].ack_events.extend(ack);

    let in_scope = |t: usize| scope.aggregate || t == tile;
    let need_ack = module
        .tiles
        .iter()
        .enumerate()
        .any(|(t, mt)| in_scope(t) && !mt.ack_events.is_empty());
    for (_, mt) in module.tiles.iter_mut().enumerate().filter(|(t, _)| in_scope(*t)) {
        mt.load_emitted = true;
        mt.load = load;
        if !need_ack {
            mt.load_acked = true;
        }
    }

    eu_info!("module {handle} load at {load:#x}, need ack: {need_ack}");
    out.events.push(ApiEvent::with_ack(
        ApiEventKind::ModuleLoad(module.info(load)),
        need_ack,
    ));
}

fn segment_removed(
    conn: &mut ClientConnection,
    scope: &BindScope,
    handle: u64,
    va: u64,
    ack: Option<AckRef>,
    out: &mut BindOutcome,
) {
    let tile = scope.tile as usize;
    let Some(module) = conn.modules.get_mut(&handle) else {
        out.ack(ack);
        return;
    };
    let Some(mt) = module.tiles.get_mut(tile) else {
        out.ack(ack);
        return;
    };

    mt.load_addresses.remove(&va);
    if !mt.load_addresses.is_empty() {
        out.ack(ack);
        return;
    }

    out.ack_now.append(&mut mt.ack_events);
    mt.load_acked = false;
    let emitted = mt.load_emitted;
    let load = mt.load;
    if !scope.aggregate {
        mt.load_emitted = false;
    }

    let all_unloaded = module.tiles.iter().all(|t| t.load_addresses.is_empty());
    if scope.aggregate && all_unloaded {
        module.tiles.iter_mut().for_each(|t| t.load_emitted = false);
    }

    let emit = emitted && scope.deliver && (!scope.aggregate || all_unloaded);
    if !emit {
        out.ack(ack);
        return;
    }

    let event = ApiEvent::with_ack(
        ApiEventKind::ModuleUnload(module.info(load)),
        ack.is_some(),
    );
    eu_info!("module {handle} unload at {load:#x}");
    if let Some(ack) = ack {
        out.hold.push((event.clone(), ack));
    }
    out.events.push(event);
}

/// Take kernel events held by module load at `load` (canonical address).
///
/// Events of every tile are taken when `tile` is `None`. Return `None` if no such
/// module has pending acknowledgments.
pub fn take_load_acks(
    conn: &mut ClientConnection,
    topology: &dyn Topology,
    load: u64,
    tile: Option<u32>,
) -> Option<Vec<AckRef>> {
    let va = topology.decanonize(load);
    let in_scope = |t: usize| tile.map_or(true, |tile| tile as usize == t);
    let mut acks = vec![];

    for (_, map) in conn.isa.iter_mut().enumerate().filter(|(t, _)| in_scope(*t)) {
        for alloc in map.values_mut() {
            if alloc.per_kernel() && alloc.load_emitted && topology.decanonize(alloc.bind.va) == va {
                acks.append(&mut alloc.ack_events);
                alloc.load_acked = true;
            }
        }
    }
    if !acks.is_empty() {
        return Some(acks);
    }

    for module in conn.modules.values_mut() {
        for (_, mt) in module.tiles.iter_mut().enumerate().filter(|(t, _)| in_scope(*t)) {
            if mt.load_emitted && topology.decanonize(mt.load) == va && !mt.ack_events.is_empty() {
                acks.append(&mut mt.ack_events);
                mt.load_acked = true;
            }
        }
        if !acks.is_empty() {
            return Some(acks);
        }
    }
    None
}

/// Take every kernel event held by modules of `tile`, loads are treated as acknowledged.
pub fn take_tile_acks(conn: &mut ClientConnection, tile: u32) -> Vec<AckRef> {
    let mut acks = vec![];
    if let Some(map) = conn.isa.get_mut(tile as usize) {
        for alloc in map.values_mut() {
            acks.append(&mut alloc.ack_events);
            alloc.load_acked = true;
        }
    }
    for module in conn.modules.values_mut() {
        if let Some(mt) = module.tiles.get_mut(tile as usize) {
            acks.append(&mut mt.ack_events);
            mt.load_acked = true;
        }
    }
    acks
}

/// Some module of `tile` has only part of its segments bound.
pub fn has_partial_module(conn: &ClientConnection, tile: u32) -> bool {
    conn.modules.values().any(|m| m.is_partially_loaded(tile))
}

/// Modules fully loaded on `tile`.
pub fn loaded_modules(conn: &ClientConnection, topology: &dyn Topology, tile: u32) -> Vec<ModuleInfo> {
    let mut modules: Vec<_> = conn
        .isa
        .get(tile as usize)
        .into_iter()
        .flat_map(|m| m.values())
        .filter(|alloc| alloc.per_kernel())
        .map(|alloc| alloc.info(topology))
        .collect();
    modules.extend(conn.modules.values().filter(|m| m.is_loaded(tile)).filter_map(|m| {
        let load = m.tiles.get(tile as usize)?.load_addresses.first()?;
        Some(m.info(topology.canonize(*load)))
    }));
    modules.sort_by_key(|m| m.load);
    modules
}
