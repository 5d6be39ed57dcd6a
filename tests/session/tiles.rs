use crate::common::{assert_no_event, config, wait_for, Fixture, CLIENT, VM, VM_TILE1};
use eudebug::debugger::event::AckRef;
use eudebug::debugger::mock::wire;
use eudebug::debugger::proto::{
    EVENT_FLAG_CREATE, EVENT_FLAG_DESTROY, EVENT_FLAG_NEED_ACK, EVENT_VM_BIND,
};
use eudebug::debugger::transport::EuControlCmd;
use eudebug::debugger::{ApiEventKind, EuThreadId, SessionConfig};
use serial_test::serial;

const CTX_TILE1: u64 = 4;

fn tile_config() -> SessionConfig {
    SessionConfig {
        enable_tile_attach: true,
        ..config()
    }
}

fn bind_ack(seqno: u64) -> AckRef {
    AckRef {
        kind: EVENT_VM_BIND,
        seqno,
    }
}

/// Map `VM_TILE1` to tile 1 through a context running on its engine.
fn map_second_vm(fixture: &mut Fixture) {
    let engine = fixture.engine(1);
    let records = [
        wire::context(EVENT_FLAG_CREATE, fixture.next_seqno(), CLIENT, CTX_TILE1),
        wire::context_param_vm(
            EVENT_FLAG_CREATE,
            fixture.next_seqno(),
            CLIENT,
            CTX_TILE1,
            VM_TILE1,
        ),
        wire::context_param_engines(
            EVENT_FLAG_CREATE,
            fixture.next_seqno(),
            CLIENT,
            CTX_TILE1,
            &[engine],
        ),
    ];
    for record in records {
        fixture.transport.push_event(record);
    }
}

#[test]
#[serial]
fn test_tile_sessions_exist_only_when_enabled() {
    let fixture = Fixture::boot(2, config());
    assert!(fixture.session.tile(0).is_none());
    assert!(fixture.session.tile_sessions().is_empty());

    let fixture = Fixture::boot(1, tile_config());
    assert!(fixture.session.tile(0).is_none());

    let fixture = Fixture::boot(2, tile_config());
    assert_eq!(fixture.session.tile_sessions().len(), 2);
    assert_eq!(fixture.session.tile(1).map(|t| t.tile()), Some(1));
}

#[test]
#[serial]
fn test_isa_bind_waits_for_vm_tile() {
    let mut fixture = Fixture::boot(2, tile_config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);
    let tile = fixture.session.tile(1).cloned().expect("tile session");
    tile.attach().unwrap();
    assert!(tile.is_attached());
    assert_eq!(next_event!(tile).kind, ApiEventKind::ProcessEntry);

    fixture.bind_isa(VM_TILE1, 120, 0x10000, EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK);
    let bind_seqno = fixture.next_seqno() - 1;
    assert_no_event(|t| tile.read_event(t));

    map_second_vm(&mut fixture);
    let load = next_event!(tile);
    assert!(matches!(load.kind, ApiEventKind::ModuleLoad(info) if info.load == 0x10000));
    assert!(load.need_ack);
    assert_no_event(|t| fixture.session.read_event(t));

    assert!(!fixture.transport.acks().contains(&bind_ack(bind_seqno)));
    tile.acknowledge_event(&load).unwrap();
    assert!(fixture.transport.acks().contains(&bind_ack(bind_seqno)));
}

#[test]
#[serial]
fn test_vm_destroy_acks_waiting_binds() {
    let mut fixture = Fixture::boot(2, tile_config());
    fixture.bind_isa(VM_TILE1, 120, 0x10000, EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK);
    let bind_seqno = fixture.next_seqno() - 1;

    let seqno = fixture.next_seqno();
    fixture
        .transport
        .push_event(wire::vm(EVENT_FLAG_DESTROY, seqno, CLIENT, VM_TILE1));
    wait_for(|| fixture.transport.acks().contains(&bind_ack(bind_seqno)));

    // the vm mapped later does not bring the dropped bind back
    let tile = fixture.session.tile(1).cloned().expect("tile session");
    tile.attach().unwrap();
    assert_eq!(next_event!(tile).kind, ApiEventKind::ProcessEntry);
    map_second_vm(&mut fixture);
    assert_no_event(|t| tile.read_event(t));
}

#[test]
#[serial]
fn test_tile_detach_releases_held_acks() {
    let mut fixture = Fixture::boot(2, tile_config());
    let tile = fixture.session.tile(0).cloned().expect("tile session");
    tile.attach().unwrap();
    assert_eq!(next_event!(tile).kind, ApiEventKind::ProcessEntry);

    fixture.bind_isa(VM, 120, 0x10000, EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK);
    let first = fixture.next_seqno() - 1;
    assert!(matches!(next_event!(tile).kind, ApiEventKind::ModuleLoad(_)));

    tile.detach().unwrap();
    assert!(!tile.is_attached());
    assert!(fixture.transport.acks().contains(&bind_ack(first)));

    // binds of a detached tile are not delivered and acknowledged at once
    fixture.bind_isa(VM, 121, 0x20000, EVENT_FLAG_CREATE | EVENT_FLAG_NEED_ACK);
    let second = fixture.next_seqno() - 1;
    wait_for(|| fixture.transport.acks().contains(&bind_ack(second)));

    // attach replays the current state
    tile.attach().unwrap();
    assert_eq!(next_event!(tile).kind, ApiEventKind::ProcessEntry);
    let loads: Vec<_> = (0..2)
        .map(|_| match next_event!(tile).kind {
            ApiEventKind::ModuleLoad(info) => info.load,
            other => panic!("module load expected, got {other:?}"),
        })
        .collect();
    assert_eq!(loads, vec![0x10000, 0x20000]);
}

#[test]
#[serial]
fn test_tile_session_selects_own_threads() {
    let fixture = Fixture::boot(2, tile_config());
    let tile = fixture.session.tile(1).cloned().expect("tile session");
    tile.attach().unwrap();

    tile.interrupt(EuThreadId::all(0)).unwrap();
    wait_for(|| {
        fixture
            .transport
            .eu_controls()
            .iter()
            .any(|c| c.cmd == EuControlCmd::InterruptAll)
    });
    let sent = fixture
        .transport
        .eu_controls()
        .into_iter()
        .find(|c| c.cmd == EuControlCmd::InterruptAll)
        .expect("interrupt sent");
    assert_eq!(sent.engine, fixture.engine(1));
}

#[test]
#[serial]
fn test_aggregated_root_without_tile_sessions() {
    let mut fixture = Fixture::boot(2, config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);

    fixture.bind_isa(VM, 120, 0x10000, EVENT_FLAG_CREATE);
    assert!(matches!(
        next_event!(fixture.session).kind,
        ApiEventKind::ModuleLoad(info) if info.load == 0x10000
    ));
}
