use crate::common::{assert_no_event, config, Fixture, CLIENT, VM};
use eudebug::debugger::event::AckRef;
use eudebug::debugger::mock::wire;
use eudebug::debugger::proto::{
    EVENT_FLAG_CREATE, EVENT_FLAG_DESTROY, EVENT_FLAG_NEED_ACK, EVENT_VM_BIND,
};
use eudebug::debugger::transport::UuidData;
use eudebug::debugger::uuid::uuid_with_va;
use eudebug::debugger::{
    AckMode, ApiEventKind, Error, EuThreadId, MemoryDesc, ModuleFormat, ModuleInfo, SessionConfig,
};
use serial_test::serial;

const ELF_CLASS: u64 = 100;
const ZEBIN_CLASS: u64 = 105;

fn bind_ack(seqno: u64) -> AckRef {
    AckRef {
        kind: EVENT_VM_BIND,
        seqno,
    }
}

#[test]
#[serial]
fn test_isa_load_and_unload_need_ack() {
    let mut fixture = Fixture::boot(1, config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);

    fixture.bind_isa(VM, 120, 0x10000, EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK);
    let bind_seqno = fixture.next_seqno() - 1;

    let load = next_event!(fixture.session);
    assert_eq!(
        load.kind,
        ApiEventKind::ModuleLoad(ModuleInfo {
            format: ModuleFormat::Elf,
            begin: 0,
            end: 0,
            load: 0x10000,
        })
    );
    assert!(load.need_ack);
    assert!(!fixture.transport.acks().contains(&bind_ack(bind_seqno)));

    fixture.session.acknowledge_event(&load).unwrap();
    assert!(fixture.transport.acks().contains(&bind_ack(bind_seqno)));
    assert!(matches!(
        fixture.session.acknowledge_event(&load),
        Err(Error::Uninitialized)
    ));

    let seqno = fixture.next_seqno();
    fixture.transport.push_event(wire::vm_bind(
        EVENT_FLAG_DESTROY | EVENT_FLAG_NEED_ACK,
        seqno,
        CLIENT,
        VM,
        0x10000,
        0x1000,
        &[120],
    ));
    let unload = next_event!(fixture.session);
    assert!(matches!(unload.kind, ApiEventKind::ModuleUnload(info) if info.load == 0x10000));
    assert!(unload.need_ack);
    assert!(!fixture.transport.acks().contains(&bind_ack(seqno)));
    fixture.session.acknowledge_event(&unload).unwrap();
    assert!(fixture.transport.acks().contains(&bind_ack(seqno)));
}

#[test]
#[serial]
fn test_isa_load_without_ack() {
    let mut fixture = Fixture::boot(1, config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);

    fixture.bind_isa(VM, 120, 0x10000, EVENT_FLAG_CREATE);
    let load = next_event!(fixture.session);
    assert!(matches!(load.kind, ApiEventKind::ModuleLoad(_)));
    assert!(!load.need_ack);

    // rebinding the same range is not a new module
    let seqno = fixture.next_seqno();
    fixture.transport.push_event(wire::vm_bind(
        EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK,
        seqno,
        CLIENT,
        VM,
        0x10000,
        0x1000,
        &[120],
    ));
    assert_no_event(|t| fixture.session.read_event(t));
    assert!(fixture.transport.acks().contains(&bind_ack(seqno)));
}

#[test]
#[serial]
fn test_zebin_module_in_fence_mode() {
    let config = SessionConfig {
        force_ack_mode: Some(AckMode::Fence),
        ..config()
    };
    let mut fixture = Fixture::boot(1, config);
    assert_eq!(fixture.session.ack_mode(), AckMode::Fence);
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);

    let elf_image: Vec<u8> = (0..0x100).map(|i| i as u8).collect();
    let seqno = fixture.next_seqno();
    let module = fixture.uuid(
        seqno,
        130,
        ZEBIN_CLASS,
        UuidData {
            uuid: "00000000-0000-0000-0000-000000000001".to_string(),
            payload: 2u32.to_le_bytes().to_vec(),
        },
    );
    fixture.transport.push_event(module);
    let seqno = fixture.next_seqno();
    let elf = fixture.uuid(
        seqno,
        131,
        ELF_CLASS,
        UuidData {
            uuid: uuid_with_va(0x1234, 0x7000_0000),
            payload: elf_image.clone(),
        },
    );
    fixture.transport.push_event(elf);
    let seqno = fixture.next_seqno();
    fixture.transport.push_event(wire::uuid(
        EVENT_FLAG_CREATE,
        seqno,
        CLIENT,
        132,
        crate::common::ISA_CLASS,
        0,
    ));

    let mut segment_seqnos = vec![];
    for va in [0x2000, 0x1000] {
        let seqno = fixture.next_seqno();
        segment_seqnos.push(seqno);
        fixture.transport.push_event(wire::vm_bind(
            EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK,
            seqno,
            CLIENT,
            VM,
            va,
            0x1000,
            &[132, 131, 130],
        ));
    }

    let load = next_event!(fixture.session);
    assert_eq!(
        load.kind,
        ApiEventKind::ModuleLoad(ModuleInfo {
            format: ModuleFormat::Elf,
            begin: 0x7000_0000,
            end: 0x7000_0100,
            load: 0x1000,
        })
    );
    assert!(load.need_ack);
    for seqno in &segment_seqnos {
        assert!(!fixture.transport.acks().contains(&bind_ack(*seqno)));
    }

    fixture.session.acknowledge_event(&load).unwrap();
    for seqno in &segment_seqnos {
        assert!(fixture.transport.acks().contains(&bind_ack(*seqno)));
    }

    // ELF image is served from the uuid payload
    let mut buf = [0u8; 16];
    fixture
        .session
        .read_memory(EuThreadId::all(0), MemoryDesc::new(0x7000_0010), &mut buf)
        .unwrap();
    assert_eq!(&buf[..], &elf_image[0x10..0x20]);
}

#[test]
#[serial]
fn test_bind_with_unknown_uuid_is_acked() {
    let mut fixture = Fixture::boot(1, config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);

    let seqno = fixture.next_seqno();
    fixture.transport.push_event(wire::vm_bind(
        EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK,
        seqno,
        CLIENT,
        VM,
        0x40000,
        0x1000,
        &[999],
    ));
    assert_no_event(|t| fixture.session.read_event(t));
    assert!(fixture.transport.acks().contains(&bind_ack(seqno)));
}
