#[macro_use]
mod common;

mod modules;
mod threads;
mod tiles;

use crate::common::{assert_no_event, config, Fixture, CLIENT, MDA_VA, VM};
use eudebug::debugger::mock::wire;
use eudebug::debugger::proto::{EVENT_FLAG_CREATE, EVENT_FLAG_DESTROY};
use eudebug::debugger::uuid::ResourceClass;
use eudebug::debugger::transport::UuidData;
use eudebug::debugger::{ApiEventKind, DetachReason, Error};
use serial_test::serial;

#[test]
#[serial]
fn test_initialize_without_events_is_not_ready() {
    let mut fixture = Fixture::new(1, config());
    assert!(matches!(fixture.session.initialize(), Err(Error::NotReady)));
    assert!(!fixture.session.is_initialized());
}

#[test]
#[serial]
fn test_initialize_and_process_entry() {
    let fixture = Fixture::boot(1, config());
    assert!(fixture.session.is_initialized());

    let event = next_event!(fixture.session);
    assert_eq!(event.kind, ApiEventKind::ProcessEntry);
    assert!(!event.need_ack);
    assert_no_event(|t| fixture.session.read_event(t));

    // module debug area header is read through its vm
    assert!(fixture.transport.vm_opens().iter().any(|(_, vm, _)| *vm == VM));
    // special area binds are acknowledged right away
    assert_eq!(fixture.transport.acks().len(), 3);
}

#[test]
#[serial]
fn test_client_gone_before_bootstrap() {
    let mut fixture = Fixture::new(1, config());
    let t = fixture.transport.clone();
    t.push_event(wire::client(EVENT_FLAG_CREATE, 1, CLIENT));
    let class = UuidData {
        uuid: ResourceClass::Elf.uuid().to_string(),
        payload: ResourceClass::Elf.class_name().as_bytes().to_vec(),
    };
    t.push_event(fixture.uuid(2, 100, 0, class));
    t.push_event(wire::client(EVENT_FLAG_DESTROY, 3, CLIENT));

    let result = loop {
        match fixture.session.initialize() {
            Err(Error::NotReady) => continue,
            other => break other,
        }
    };
    assert!(matches!(result, Err(Error::DeviceLost)));
    fixture.session.close();
}

#[test]
#[serial]
fn test_bad_module_debug_area() {
    let mut fixture = Fixture::new(1, config());
    fixture.script_boot();
    fixture.transport.write_vm(VM, MDA_VA, b"garbage!");

    let result = loop {
        match fixture.session.initialize() {
            Err(Error::NotReady) => continue,
            other => break other,
        }
    };
    assert!(matches!(result, Err(Error::Magic(_))));
}

#[test]
#[serial]
fn test_process_exit() {
    let mut fixture = Fixture::boot(1, config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);

    let seqno = fixture.next_seqno();
    fixture
        .transport
        .push_event(wire::client(EVENT_FLAG_DESTROY, seqno, CLIENT));
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessExit);
}

#[test]
#[serial]
fn test_detach_on_closed_connection() {
    let fixture = Fixture::boot(1, config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);

    fixture.transport.detach();
    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::Detached {
            reason: DetachReason::InvalidArgument
        }
    );
    assert_no_event(|t| fixture.session.read_event(t));
}
