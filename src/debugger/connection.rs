//! Per debuggee process state, built from kernel resource events.

use crate::debugger::api::{ApiEvent, ApiEventKind};
use crate::debugger::event::{
    AckRef, ContextParam, ContextParamEvent, EngineInstance, EnginesEvent, EventHeader,
    UuidEvent, VmBindEvent,
};
use crate::debugger::module::{IsaAllocation, Module};
use crate::debugger::topology::Topology;
use crate::debugger::transport::UuidData;
use crate::debugger::uuid::{extract_va, ResourceClass, COMMAND_QUEUE_UUID};
use crate::{contract_violation, eu_error, eu_info};
use bytes::Buf;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

/// GPU address range of a bind.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BindInfo {
    pub va: u64,
    pub size: u64,
}

impl BindInfo {
    /// True if `va..va + len` lies inside the bind.
    pub fn contains(&self, va: u64, len: u64) -> bool {
        va >= self.va && va.saturating_add(len) <= self.va.saturating_add(self.size)
    }

    /// True if `va` lies inside the bind.
    pub fn contains_addr(&self, va: u64) -> bool {
        va >= self.va && va < self.va.saturating_add(self.size)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Context {
    pub handle: u64,
    pub vm: Option<u64>,
    pub engines: Vec<EngineInstance>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UuidObject {
    pub handle: u64,
    pub class_handle: u64,
    pub kind: Option<ResourceClass>,
    pub uuid: String,
    pub data: Vec<u8>,
    /// ELF load address or GPU address of a special area.
    pub ptr: u64,
    /// Uuid destroyed while still referenced by a bind.
    pub destroyed: bool,
}

/// VM bind received before its VM was mapped to a tile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBind {
    pub header: EventHeader,
    pub bind: VmBindEvent,
}

pub struct ClientConnection {
    pub handle: u64,
    pub contexts: HashMap<u64, Context>,
    pub lrc_to_context: HashMap<u64, u64>,
    pub vm_ids: HashSet<u64>,
    pub vm_to_tile: HashMap<u64, u32>,
    pub uuids: HashMap<u64, UuidObject>,
    /// Class uuid handle to its name and kind.
    pub class_handles: HashMap<u64, (String, ResourceClass)>,
    /// ISA allocations by address, one map per tile.
    pub isa: Vec<HashMap<u64, IsaAllocation>>,
    /// Zebin modules by module uuid handle.
    pub modules: HashMap<u64, Module>,
    /// ELF load address to uuid handle.
    pub elf_map: HashMap<u64, u64>,
    pub module_debug_area: HashMap<u64, BindInfo>,
    pub context_save_area: HashMap<u64, BindInfo>,
    pub state_base_area: HashMap<u64, BindInfo>,
    pub pending_binds: VecDeque<PendingBind>,
}

impl ClientConnection {
    pub fn new(handle: u64, tiles: u32) -> Self {
        Self {
            handle,
            contexts: HashMap::new(),
            lrc_to_context: HashMap::new(),
            vm_ids: HashSet::new(),
            vm_to_tile: HashMap::new(),
            uuids: HashMap::new(),
            class_handles: HashMap::new(),
            isa: (0..tiles.max(1)).map(|_| HashMap::new()).collect(),
            modules: HashMap::new(),
            elf_map: HashMap::new(),
            module_debug_area: HashMap::new(),
            context_save_area: HashMap::new(),
            state_base_area: HashMap::new(),
            pending_binds: VecDeque::new(),
        }
    }

    pub fn class_of(&self, class_handle: u64) -> Option<ResourceClass> {
        self.class_handles.get(&class_handle).map(|(_, kind)| *kind)
    }

    /// Kind of uuid object with `handle`.
    pub fn uuid_kind(&self, handle: u64) -> Option<ResourceClass> {
        self.uuids.get(&handle).and_then(|obj| obj.kind)
    }

    /// VM of the context owning logical ring context `lrc_handle`.
    pub fn vm_for_lrc(&self, lrc_handle: u64) -> Option<u64> {
        let ctx = self.lrc_to_context.get(&lrc_handle)?;
        self.contexts.get(ctx)?.vm
    }

    /// Tile of `vm`, `None` if VM is not mapped yet.
    pub fn tile_for_vm(&self, vm: u64) -> Option<u32> {
        self.vm_to_tile.get(&vm).copied()
    }

    pub fn on_context(&mut self, handle: u64, create: bool) {
        if create {
            self.contexts.insert(
                handle,
                Context {
                    handle,
                    ..Default::default()
                },
            );
        } else {
            self.contexts.remove(&handle);
            self.lrc_to_context.retain(|_, ctx| *ctx != handle);
        }
    }

    /// Apply VM CREATE or DESTROY, return acks of binds dropped with the VM.
    pub fn on_vm(&mut self, handle: u64, create: bool) -> Vec<AckRef> {
        if create {
            self.vm_ids.insert(handle);
            return vec![];
        }
        self.vm_ids.remove(&handle);
        self.vm_to_tile.remove(&handle);
        self.take_pending_binds(handle)
            .into_iter()
            .filter(|p| p.header.need_ack())
            .map(|p| {
                eu_info!("vm {handle} destroyed, drop bind {:#x}", p.bind.va_start);
                p.header.ack_ref()
            })
            .collect()
    }

    /// Map (or unmap) logical ring contexts to their context.
    pub fn on_engines(&mut self, ev: &EnginesEvent, create: bool) {
        for (engine, lrc) in &ev.engines {
            if create {
                eu_info!("lrc {lrc} of context {} on {engine}", ev.ctx_handle);
                self.lrc_to_context.insert(*lrc, ev.ctx_handle);
            } else {
                self.lrc_to_context.remove(lrc);
            }
        }
    }

    /// Apply context parameter, return VM whose tile became known.
    pub fn on_context_param(
        &mut self,
        ev: &ContextParamEvent,
        topology: &dyn Topology,
    ) -> Option<u64> {
        let Some(ctx) = self.contexts.get_mut(&ev.ctx_handle) else {
            eu_error!("parameter of unknown context {}", ev.ctx_handle);
            return None;
        };
        match &ev.param {
            ContextParam::Vm(vm) => ctx.vm = Some(*vm),
            ContextParam::Engines(engines) => ctx.engines = engines.clone(),
            ContextParam::Other { param, value } => {
                eu_info!("context {}: param {param:#x} = {value:#x}", ev.ctx_handle);
                return None;
            }
        }

        let vm = ctx.vm?;
        let tile = topology.tile_for_engine(*ctx.engines.first()?);
        if self.vm_to_tile.insert(vm, tile) == Some(tile) {
            return None;
        }
        eu_info!("vm {vm} runs on tile {tile}");
        Some(vm)
    }

    /// Record or drop a special area bind of `vm`.
    pub fn record_special_bind(&mut self, kind: ResourceClass, vm: u64, info: BindInfo, create: bool) {
        let map = match kind {
            ResourceClass::ModuleDebugArea => &mut self.module_debug_area,
            ResourceClass::ContextSaveArea => &mut self.context_save_area,
            ResourceClass::SbaTrackingBuffer => &mut self.state_base_area,
            _ => return,
        };
        if create {
            map.insert(vm, info);
        } else {
            map.remove(&vm);
        }
    }

    /// True if a live ISA allocation or module refers to uuid `handle`.
    pub fn is_uuid_referenced(&self, handle: u64) -> bool {
        self.isa.iter().flat_map(|m| m.values()).any(|alloc| {
            alloc.isa_uuid == handle || alloc.elf == Some(handle) || alloc.module == Some(handle)
        }) || self.modules.values().any(|m| m.elf == Some(handle))
    }

    /// Drop uuid `handle` if it is destroyed and no longer referenced.
    pub fn release_uuid(&mut self, handle: u64) {
        let destroyed = self.uuids.get(&handle).map(|o| o.destroyed);
        if destroyed == Some(true) && !self.is_uuid_referenced(handle) {
            self.remove_uuid(handle);
        }
    }

    fn remove_uuid(&mut self, handle: u64) {
        if let Some(obj) = self.uuids.remove(&handle) {
            if obj.kind == Some(ResourceClass::Elf) && self.elf_map.get(&obj.ptr) == Some(&handle) {
                self.elf_map.remove(&obj.ptr);
            }
        }
    }

    /// ELF image containing `va..va + len`, return image bytes and its load address.
    pub fn elf_containing(&self, va: u64, len: u64) -> Option<(&[u8], u64)> {
        self.elf_map.iter().find_map(|(ptr, handle)| {
            let obj = self.uuids.get(handle)?;
            let range = BindInfo {
                va: *ptr,
                size: obj.data.len() as u64,
            };
            range.contains(va, len).then_some((obj.data.as_slice(), *ptr))
        })
    }

    /// ISA allocation (on any tile) whose range contains `va`.
    pub fn isa_containing(&self, va: u64) -> Option<&IsaAllocation> {
        self.isa
            .iter()
            .flat_map(|m| m.values())
            .find(|alloc| alloc.bind.contains_addr(va))
    }

    /// Remove binds queued for `vm`, keeping arrival order.
    pub fn take_pending_binds(&mut self, vm: u64) -> Vec<PendingBind> {
        let (taken, kept) = std::mem::take(&mut self.pending_binds)
            .into_iter()
            .partition::<VecDeque<_>, _>(|p| p.bind.vm_handle == vm);
        self.pending_binds = kept;
        taken.into_iter().collect()
    }

    fn on_uuid_object(&mut self, ev: &UuidEvent, data: Option<UuidData>, tiles: u32) {
        let kind = self.class_of(ev.class_handle);
        let mut obj = UuidObject {
            handle: ev.handle,
            class_handle: ev.class_handle,
            kind,
            ..Default::default()
        };

        if let Some(data) = data {
            match kind {
                Some(ResourceClass::Elf) => match extract_va(&data.uuid) {
                    Some(ptr) => {
                        obj.ptr = ptr;
                        self.elf_map.insert(ptr, ev.handle);
                    }
                    None => eu_error!("uuid {}: no ELF address in {}", ev.handle, data.uuid),
                },
                Some(ResourceClass::ZebinModule) => {
                    if data.payload.len() >= 4 {
                        let segment_count = (&data.payload[..]).get_u32_le();
                        self.modules.insert(
                            ev.handle,
                            Module::new(ev.handle, segment_count, tiles),
                        );
                    } else {
                        eu_error!("zebin module uuid {}: no segment count", ev.handle);
                    }
                }
                Some(kind) if kind.is_special_area() => {
                    if data.payload.len() == 8 {
                        obj.ptr = (&data.payload[..]).get_u64_le();
                    } else {
                        eu_error!("{kind} uuid {}: unexpected payload size", ev.handle);
                    }
                }
                _ => {}
            }
            obj.uuid = data.uuid;
            obj.data = data.payload;
        }

        eu_info!(
            "uuid {} created, class: {}",
            ev.handle,
            kind.map(|k| k.to_string()).unwrap_or_else(|| "none".to_string())
        );
        self.uuids.insert(ev.handle, obj);
    }

    fn on_uuid_destroy(&mut self, handle: u64) {
        if self.modules.remove(&handle).is_some() {
            eu_info!("zebin module {handle} dropped");
        }
        if self.is_uuid_referenced(handle) {
            if let Some(obj) = self.uuids.get_mut(&handle) {
                obj.destroyed = true;
            }
        } else {
            self.remove_uuid(handle);
        }
        self.class_handles.remove(&handle);
    }
}

/// Every client connection of a debug session, at most one of them is active.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<u64, ClientConnection>,
    active: Option<u64>,
    /// Command queue uuid handles of the active client to sub-device index.
    device_map: HashMap<u64, u32>,
    client_destroyed_before_bootstrap: bool,
    tiles: u32,
}

impl ConnectionRegistry {
    pub fn new(tiles: u32) -> Self {
        Self {
            tiles: tiles.max(1),
            ..Default::default()
        }
    }

    pub fn get(&self, handle: u64) -> Option<&ClientConnection> {
        self.connections.get(&handle)
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut ClientConnection> {
        self.connections.get_mut(&handle)
    }

    pub fn active_handle(&self) -> Option<u64> {
        self.active
    }

    pub fn active(&self) -> Option<&ClientConnection> {
        self.connections.get(&self.active?)
    }

    pub fn active_mut(&mut self) -> Option<&mut ClientConnection> {
        self.connections.get_mut(&self.active?)
    }

    pub fn device_map_len(&self) -> usize {
        self.device_map.len()
    }

    pub fn client_destroyed_before_bootstrap(&self) -> bool {
        self.client_destroyed_before_bootstrap
    }

    fn activate_if_none(&mut self, handle: u64) -> bool {
        match self.active {
            None => {
                eu_info!("client {handle} is active");
                self.active = Some(handle);
                true
            }
            Some(active) => active == handle,
        }
    }

    /// Register new connection, return false for a duplicate handle.
    pub fn on_client_create(&mut self, handle: u64) -> bool {
        match self.connections.entry(handle) {
            Entry::Occupied(_) => {
                eu_error!("client {handle} already exists, create ignored");
                false
            }
            Entry::Vacant(entry) => {
                if let Some(active) = self.active {
                    eu_info!("client {handle} created while client {active} is active");
                }
                entry.insert(ClientConnection::new(handle, self.tiles));
                true
            }
        }
    }

    /// Free connection, return events produced by destroying the active client.
    pub fn on_client_destroy(&mut self, handle: u64, bootstrapped: bool) -> Vec<ApiEvent> {
        if self.connections.remove(&handle).is_none() {
            eu_error!("destroy of unknown client {handle}");
            return vec![];
        }
        if self.active != Some(handle) {
            return vec![];
        }

        self.active = None;
        let mut events = vec![];
        if !bootstrapped {
            self.client_destroyed_before_bootstrap = true;
        } else if !self.device_map.is_empty() {
            events.push(ApiEvent::new(ApiEventKind::ProcessExit));
        }
        self.device_map.clear();
        events
    }

    /// Apply UUID CREATE, `data` is the payload read for events with one.
    pub fn on_uuid_create(&mut self, ev: &UuidEvent, data: Option<UuidData>) -> Vec<ApiEvent> {
        if !self.connections.contains_key(&ev.client_handle) {
            eu_error!("uuid {} of unknown client {}", ev.handle, ev.client_handle);
            return vec![];
        }

        if let Some(data) = &data {
            if data.uuid == COMMAND_QUEUE_UUID {
                return self.on_command_queue_create(ev, data);
            }
            if let Some(kind) = ResourceClass::from_uuid(&data.uuid) {
                let name = String::from_utf8_lossy(&data.payload)
                    .trim_end_matches('\0')
                    .to_string();
                eu_info!("class uuid {} registered: {name} ({kind})", ev.handle);
                self.activate_if_none(ev.client_handle);
                if let Some(conn) = self.connections.get_mut(&ev.client_handle) {
                    conn.class_handles.insert(ev.handle, (name, kind));
                }
                return vec![];
            }
        }

        let tiles = self.tiles;
        if let Some(conn) = self.connections.get_mut(&ev.client_handle) {
            conn.on_uuid_object(ev, data, tiles);
        }
        vec![]
    }

    fn on_command_queue_create(&mut self, ev: &UuidEvent, data: &UuidData) -> Vec<ApiEvent> {
        if !self.activate_if_none(ev.client_handle) {
            eu_info!("command queue of inactive client {} ignored", ev.client_handle);
            return vec![];
        }

        let (index, count) = if data.payload.len() >= 8 {
            let mut payload = &data.payload[..];
            (payload.get_u32_le(), payload.get_u32_le())
        } else {
            (0, 0)
        };
        if count > 0 && index >= count {
            contract_violation!("command queue sub-device index {index} out of {count}");
        }

        let mut events = vec![];
        if self.device_map.is_empty() {
            events.push(ApiEvent::new(ApiEventKind::ProcessEntry));
        }
        self.device_map.insert(ev.handle, index);
        events
    }

    /// Apply UUID DESTROY.
    pub fn on_uuid_destroy(&mut self, ev: &UuidEvent) -> Vec<ApiEvent> {
        if self.active == Some(ev.client_handle) && self.device_map.remove(&ev.handle).is_some() {
            if self.device_map.is_empty() {
                return vec![ApiEvent::new(ApiEventKind::ProcessExit)];
            }
            return vec![];
        }

        match self.connections.get_mut(&ev.client_handle) {
            Some(conn) => conn.on_uuid_destroy(ev.handle),
            None => eu_error!("uuid {} of unknown client {}", ev.handle, ev.client_handle),
        }
        vec![]
    }
}
