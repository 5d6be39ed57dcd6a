use eudebug::debugger::api::ApiEvent;
use eudebug::debugger::event::EngineInstance;
use eudebug::debugger::memory::DebugAreaHeader;
use eudebug::debugger::mock::{wire, MockTransport};
use eudebug::debugger::proto::{EVENT_FLAG_CREATE, EVENT_FLAG_NEED_ACK};
use eudebug::debugger::register::{
    sr_ident_bytes, RegisterType, RegsetDesc, StateSaveAreaHeader,
};
use eudebug::debugger::transport::UuidData;
use eudebug::debugger::uuid::{ResourceClass, COMMAND_QUEUE_UUID};
use eudebug::debugger::{
    DeviceTopology, Error, EuThreadId, HwLayout, RootSession, SessionConfig, Topology,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const CLIENT: u64 = 1;
pub const CTX: u64 = 3;
pub const LRC: u64 = 30;
pub const VM: u64 = 7;
/// VM of the second tile, created but not mapped to a tile at boot.
pub const VM_TILE1: u64 = 8;

pub const MDA_VA: u64 = 0x10_0000;
pub const CSA_VA: u64 = 0x20_0000;
pub const SBA_VA: u64 = 0x30_0000;

const CLASS_BASE: u64 = 100;
pub const ISA_CLASS: u64 = CLASS_BASE + 1;

/// Thread context size inside the state save area.
pub const SLOT_SIZE: u32 = 0x100;
pub const SR_MAGIC_OFFSET: u32 = 0x10;
pub const CR_OFFSET: u32 = 0x20;
pub const GRF_OFFSET: u32 = 0x40;
pub const GRF_SIZE: u16 = 32;

/// Sequence numbers of scripted events start here, boot events use lower ones.
pub const SEQNO_BASE: u64 = 1000;

pub fn layout() -> HwLayout {
    HwLayout {
        slices: 1,
        subslices_per_slice: 1,
        eus_per_subslice: 2,
        threads_per_eu: 8,
    }
}

pub fn config() -> SessionConfig {
    SessionConfig {
        log_channels: eudebug::log::INFO
            | eudebug::log::ERROR
            | eudebug::log::THREADS
            | eudebug::log::MEM_ACCESS,
        poll_timeout_ms: 10,
        internal_event_wait_ms: 5,
        interrupt_timeout_ms: 500,
        bootstrap_timeout_ms: 2000,
        sr_ident_retries: 2,
        sr_ident_retry_delay_us: 10,
        ..Default::default()
    }
}

pub fn ssa_header() -> StateSaveAreaHeader {
    StateSaveAreaHeader::new(
        layout(),
        SLOT_SIZE,
        &[
            (
                RegisterType::Grf,
                RegsetDesc {
                    offset: GRF_OFFSET,
                    num: 4,
                    bits: 256,
                    bytes: GRF_SIZE,
                },
            ),
            (
                RegisterType::Cr,
                RegsetDesc {
                    offset: CR_OFFSET,
                    num: 1,
                    bits: 128,
                    bytes: 16,
                },
            ),
        ],
    )
    .with_sr_magic_offset(SR_MAGIC_OFFSET)
}

pub struct Fixture {
    pub transport: Arc<MockTransport>,
    pub topology: Arc<DeviceTopology>,
    pub session: RootSession,
    seqno: u64,
}

impl Fixture {
    /// Scripted debuggee with tile count `tiles`, session is not initialized yet.
    pub fn new(tiles: u32, config: SessionConfig) -> Self {
        let transport = Arc::new(MockTransport::default());
        let topology = Arc::new(DeviceTopology::new(tiles, layout()));
        let session = RootSession::new(transport.clone(), topology.clone(), config, 2);
        Self {
            transport,
            topology,
            session,
            seqno: SEQNO_BASE,
        }
    }

    pub fn next_seqno(&mut self) -> u64 {
        self.seqno += 1;
        self.seqno
    }

    pub fn engine(&self, tile: u32) -> EngineInstance {
        self.topology.engine_for_tile(tile)
    }

    /// Register a uuid resource with READ_UUID answer `data`.
    pub fn uuid(&self, seqno: u64, handle: u64, class_handle: u64, data: UuidData) -> Vec<u8> {
        let size = data.payload.len() as u64;
        self.transport.set_uuid(CLIENT, handle, data);
        wire::uuid(EVENT_FLAG_CREATE, seqno, CLIENT, handle, class_handle, size)
    }

    /// Queue events a runtime produces up to the module debug area bind.
    pub fn script_boot(&self) {
        let t = &self.transport;
        let mut seqno = 0;
        let mut next = || {
            seqno += 1;
            seqno
        };

        t.push_event(wire::client(EVENT_FLAG_CREATE, next(), CLIENT));
        for (i, kind) in [
            ResourceClass::Elf,
            ResourceClass::Isa,
            ResourceClass::ModuleDebugArea,
            ResourceClass::ContextSaveArea,
            ResourceClass::SbaTrackingBuffer,
            ResourceClass::ZebinModule,
        ]
        .into_iter()
        .enumerate()
        {
            let class = UuidData {
                uuid: kind.uuid().to_string(),
                payload: kind.class_name().as_bytes().to_vec(),
            };
            t.push_event(self.uuid(next(), CLASS_BASE + i as u64, 0, class));
        }
        let queue = UuidData {
            uuid: COMMAND_QUEUE_UUID.to_string(),
            payload: [0u32.to_le_bytes(), 1u32.to_le_bytes()].concat(),
        };
        t.push_event(self.uuid(next(), 5, 0, queue));

        t.push_event(wire::vm(EVENT_FLAG_CREATE, next(), CLIENT, VM));
        t.push_event(wire::vm(EVENT_FLAG_CREATE, next(), CLIENT, VM_TILE1));
        t.push_event(wire::context(EVENT_FLAG_CREATE, next(), CLIENT, CTX));
        t.push_event(wire::context_param_vm(EVENT_FLAG_CREATE, next(), CLIENT, CTX, VM));
        t.push_event(wire::context_param_engines(
            EVENT_FLAG_CREATE,
            next(),
            CLIENT,
            CTX,
            &[self.engine(0)],
        ));
        t.push_event(wire::engines(
            EVENT_FLAG_CREATE,
            next(),
            CLIENT,
            CTX,
            &[(self.engine(0), LRC)],
        ));

        t.write_vm(
            VM,
            MDA_VA,
            &DebugAreaHeader {
                version: 1,
                pgsize: 1,
                size: 4,
                scratch_begin: 0x40,
                scratch_end: 0x80,
                is_shared: 0,
            }
            .to_bytes(),
        );
        t.write_vm(VM, CSA_VA, &ssa_header().to_bytes());

        let areas = [
            (ResourceClass::SbaTrackingBuffer, 112, SBA_VA),
            (ResourceClass::ContextSaveArea, 111, CSA_VA),
            (ResourceClass::ModuleDebugArea, 110, MDA_VA),
        ];
        for (kind, handle, va) in areas {
            let class = CLASS_BASE + kind_index(kind);
            let data = UuidData {
                uuid: "00000000-0000-0000-0000-000000000000".to_string(),
                payload: va.to_le_bytes().to_vec(),
            };
            t.push_event(self.uuid(next(), handle, class, data));
            t.push_event(wire::vm_bind(
                EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK,
                next(),
                CLIENT,
                VM,
                va,
                0x1000,
                &[handle],
            ));
        }
    }

    /// Script boot and initialize the session.
    pub fn boot(tiles: u32, config: SessionConfig) -> Self {
        let mut fixture = Self::new(tiles, config);
        fixture.script_boot();
        fixture.initialize();
        fixture
    }

    pub fn initialize(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.session.initialize() {
                Ok(()) => return,
                Err(Error::NotReady) if Instant::now() < deadline => continue,
                Err(e) => panic!("session initialization: {e}"),
            }
        }
    }

    /// Write system routine ident of a thread with `counter`.
    pub fn set_sr_counter(&self, id: &EuThreadId, counter: u8) {
        let addr = CSA_VA + ssa_header().sr_ident_offset(id);
        self.transport.write_vm(VM, addr, &sr_ident_bytes(counter));
    }

    /// Address of register set `offset` of a thread context.
    pub fn regset_addr(&self, id: &EuThreadId, offset: u32) -> u64 {
        CSA_VA + ssa_header().thread_slot_offset(id) + offset as u64
    }

    /// Bind ISA `handle` at `va`, register the uuid first.
    pub fn bind_isa(&mut self, vm: u64, handle: u64, va: u64, flags: u32) {
        let seqno = self.next_seqno();
        self.transport
            .push_event(wire::uuid(EVENT_FLAG_CREATE, seqno, CLIENT, handle, ISA_CLASS, 0));
        let seqno = self.next_seqno();
        self.transport
            .push_event(wire::vm_bind(flags, seqno, CLIENT, vm, va, 0x1000, &[handle]));
    }

    pub fn bitmask(&self, threads: &[EuThreadId]) -> Vec<u8> {
        layout().bitmask_for_threads(threads)
    }
}

fn kind_index(kind: ResourceClass) -> u64 {
    match kind {
        ResourceClass::Elf => 0,
        ResourceClass::Isa => 1,
        ResourceClass::ModuleDebugArea => 2,
        ResourceClass::ContextSaveArea => 3,
        ResourceClass::SbaTrackingBuffer => 4,
        ResourceClass::ZebinModule => 5,
    }
}

/// Wait for the next event of a session.
#[macro_export]
macro_rules! next_event {
    ($session: expr) => {
        $session
            .read_event(std::time::Duration::from_secs(3))
            .expect("event expected")
    };
}

/// Assert that no event arrives for a while.
pub fn assert_no_event(read: impl Fn(Duration) -> Result<ApiEvent, Error>) {
    match read(Duration::from_millis(200)) {
        Err(Error::NotReady) => {}
        other => panic!("no event expected, got {other:?}"),
    }
}

/// Wait until `cond` holds.
pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "condition is not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}
