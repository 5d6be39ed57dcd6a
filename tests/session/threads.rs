use crate::common::{
    assert_no_event, config, wait_for, Fixture, CLIENT, CR_OFFSET, CSA_VA, CTX, GRF_OFFSET,
    GRF_SIZE, LRC, SBA_VA, VM,
};
use eudebug::debugger::mock::wire;
use eudebug::debugger::proto::EVENT_FLAG_STATE_CHANGE;
use eudebug::debugger::transport::EuControlCmd;
use eudebug::debugger::{ApiEventKind, Error, EuThreadId, MemoryDesc, RegisterType};
use serial_test::serial;

const FORCE_EXCEPTION: u32 = 1 << 30;

fn booted() -> Fixture {
    let fixture = Fixture::boot(1, config());
    assert_eq!(next_event!(fixture.session).kind, ApiEventKind::ProcessEntry);
    fixture
}

fn last_command(fixture: &Fixture, cmd: EuControlCmd) -> Option<Vec<u8>> {
    fixture
        .transport
        .eu_controls()
        .into_iter()
        .rev()
        .find(|c| c.cmd == cmd)
        .map(|c| c.bitmask)
}

/// Report attention for `threads`, event seqno is far above interrupt ones.
fn attention(fixture: &mut Fixture, threads: &[EuThreadId]) {
    let bitmask = fixture.bitmask(threads);
    fixture
        .transport
        .set_stopped(fixture.engine(0), bitmask.clone());
    let seqno = fixture.next_seqno();
    let record = wire::eu_attention(
        EVENT_FLAG_STATE_CHANGE,
        seqno,
        CLIENT,
        CTX,
        LRC,
        fixture.engine(0),
        &bitmask,
    );
    fixture.transport.push_event(record);
}

#[test]
#[serial]
fn test_interrupt_all_and_thread_access() {
    let mut fixture = booted();
    let thread = EuThreadId::new(0, 0, 0, 0, 1);
    fixture.set_sr_counter(&thread, 1);

    fixture.session.interrupt(EuThreadId::all(0)).unwrap();
    assert!(matches!(
        fixture.session.interrupt(EuThreadId::all(0)),
        Err(Error::NotReady)
    ));
    wait_for(|| last_command(&fixture, EuControlCmd::InterruptAll).is_some());

    attention(&mut fixture, &[thread]);
    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::ThreadStopped { thread }
    );
    assert_no_event(|t| fixture.session.read_event(t));

    // registers live in the thread slot of the context save area
    let grf: Vec<u8> = (0..GRF_SIZE as u8).collect();
    fixture
        .transport
        .write_vm(VM, fixture.regset_addr(&thread, GRF_OFFSET), &grf);
    let mut buf = vec![0u8; GRF_SIZE as usize];
    let len = fixture
        .session
        .read_registers(thread, RegisterType::Grf, 0, 1, &mut buf)
        .unwrap();
    assert_eq!(len, GRF_SIZE as usize);
    assert_eq!(buf, grf);

    fixture
        .session
        .write_registers(thread, RegisterType::Grf, 1, 1, &[0xee; GRF_SIZE as usize])
        .unwrap();
    assert_eq!(
        fixture.transport.read_vm(
            VM,
            fixture.regset_addr(&thread, GRF_OFFSET) + GRF_SIZE as u64,
            GRF_SIZE as usize
        ),
        vec![0xee; GRF_SIZE as usize]
    );
    assert!(matches!(
        fixture
            .session
            .read_registers(thread, RegisterType::Grf, 3, 2, &mut vec![0; 64]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        fixture
            .session
            .write_registers(thread, RegisterType::Sba, 0, 1, &[0; 8]),
        Err(Error::InvalidArgument(_))
    ));

    fixture.transport.write_vm(VM, SBA_VA + 8, &0x5000u64.to_le_bytes());
    let mut sba = [0u8; 8];
    fixture
        .session
        .read_registers(thread, RegisterType::Sba, 1, 1, &mut sba)
        .unwrap();
    assert_eq!(u64::from_le_bytes(sba), 0x5000);

    // memory of a stopped thread is read through its vm
    fixture.transport.write_vm(VM, 0x8000, &[1, 2, 3]);
    let mut mem = [0u8; 3];
    fixture
        .session
        .read_memory(thread, MemoryDesc::new(0x8000), &mut mem)
        .unwrap();
    assert_eq!(mem, [1, 2, 3]);
    assert_eq!(fixture.session.state_save_area_va(thread).unwrap(), CSA_VA);

    // running threads have neither memory nor registers
    let running = EuThreadId::new(0, 0, 0, 1, 0);
    assert!(matches!(
        fixture
            .session
            .read_memory(running, MemoryDesc::new(0x8000), &mut mem),
        Err(Error::NotAvailable)
    ));
    assert!(matches!(
        fixture
            .session
            .read_registers(running, RegisterType::Grf, 0, 1, &mut buf),
        Err(Error::NotAvailable)
    ));

    fixture.session.resume(thread).unwrap();
    assert_eq!(
        last_command(&fixture, EuControlCmd::Resume),
        Some(fixture.bitmask(&[thread]))
    );
    assert!(matches!(
        fixture.session.resume(thread),
        Err(Error::NotAvailable)
    ));
    assert!(matches!(
        fixture
            .session
            .read_memory(thread, MemoryDesc::new(0x8000), &mut mem),
        Err(Error::NotAvailable)
    ));
}

#[test]
#[serial]
fn test_interrupt_single_thread() {
    let mut fixture = booted();
    let thread = EuThreadId::new(0, 0, 0, 1, 3);
    fixture.set_sr_counter(&thread, 3);

    fixture.session.interrupt(thread).unwrap();
    wait_for(|| last_command(&fixture, EuControlCmd::Interrupt).is_some());
    assert_eq!(
        last_command(&fixture, EuControlCmd::Interrupt),
        Some(fixture.bitmask(&[thread]))
    );

    attention(&mut fixture, &[thread]);
    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::ThreadStopped { thread }
    );
    assert!(matches!(
        fixture.session.interrupt(thread),
        Err(Error::NotAvailable)
    ));
}

#[test]
#[serial]
fn test_interrupt_timeout_reports_unavailable() {
    let fixture = booted();
    let thread = EuThreadId::new(0, 0, 0, 1, 2);

    fixture.session.interrupt(thread).unwrap();
    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::ThreadUnavailable { thread }
    );
}

#[test]
#[serial]
fn test_failed_interrupt_reports_unavailable() {
    let fixture = booted();
    fixture.transport.fail_eu_control(true);

    let selector = EuThreadId::all(0);
    fixture.session.interrupt(selector).unwrap();
    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::ThreadUnavailable { thread: selector }
    );
}

#[test]
#[serial]
fn test_interrupt_bad_coordinates() {
    let fixture = booted();
    for selector in [
        EuThreadId::new(1, 0, 0, 0, 0),
        EuThreadId::new(0, 0, 0, 2, 0),
        EuThreadId::new(0, 0, 0, 0, 8),
    ] {
        assert!(matches!(
            fixture.session.interrupt(selector),
            Err(Error::InvalidArgument(_))
        ));
    }
}

#[test]
#[serial]
fn test_forced_exception_stop_is_resumed_silently() {
    let mut fixture = booted();
    let thread = EuThreadId::new(0, 0, 0, 0, 4);
    fixture.set_sr_counter(&thread, 1);
    let mut cr = [0u8; 16];
    cr[4..8].copy_from_slice(&FORCE_EXCEPTION.to_le_bytes());
    fixture
        .transport
        .write_vm(VM, fixture.regset_addr(&thread, CR_OFFSET), &cr);

    attention(&mut fixture, &[thread]);
    wait_for(|| last_command(&fixture, EuControlCmd::Resume).is_some());
    assert_eq!(
        last_command(&fixture, EuControlCmd::Resume),
        Some(fixture.bitmask(&[thread]))
    );
    assert_no_event(|t| fixture.session.read_event(t));

    let cr = fixture
        .transport
        .read_vm(VM, fixture.regset_addr(&thread, CR_OFFSET) + 4, 4);
    assert_eq!(u32::from_le_bytes([cr[0], cr[1], cr[2], cr[3]]), 0);
}

#[test]
#[serial]
fn test_breakpoint_stop_is_reported() {
    let mut fixture = booted();
    let thread = EuThreadId::new(0, 0, 0, 1, 5);
    fixture.set_sr_counter(&thread, 1);
    let mut cr = [0u8; 16];
    // breakpoint exception
    cr[4..8].copy_from_slice(&(1u32 << 31).to_le_bytes());
    fixture
        .transport
        .write_vm(VM, fixture.regset_addr(&thread, CR_OFFSET), &cr);

    attention(&mut fixture, &[thread]);
    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::ThreadStopped { thread }
    );
}

#[test]
#[serial]
fn test_page_fault() {
    let mut fixture = booted();
    let thread = EuThreadId::new(0, 0, 0, 0, 2);
    let mask = fixture.bitmask(&[thread]);
    let empty = vec![0u8; mask.len()];

    let seqno = fixture.next_seqno();
    let record = wire::page_fault(
        EVENT_FLAG_STATE_CHANGE,
        seqno,
        CLIENT,
        CTX,
        LRC,
        fixture.engine(0),
        0xdead_0000,
        &mask,
        &mask,
        &empty,
    );
    fixture.transport.push_event(record);

    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::ThreadStopped { thread }
    );
    assert_eq!(
        next_event!(fixture.session).kind,
        ApiEventKind::PageFault {
            address: 0xdead_0000,
            mask,
        }
    );
    assert_no_event(|t| fixture.session.read_event(t));
}
