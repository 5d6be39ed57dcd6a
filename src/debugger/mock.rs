//! In-process kernel stand-in: scripted events, recorded requests and in-memory VMs.

use crate::debugger::error::Error;
use crate::debugger::event::{AckRef, EngineInstance};
use crate::debugger::transport::{
    EuControlCmd, EuControlRequest, Transport, UuidData, VmAccess, VmFile,
};
use nix::errno::Errno;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Recorded EU control request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EuControlRecord {
    pub client_handle: u64,
    pub cmd: EuControlCmd,
    pub engine: EngineInstance,
    pub bitmask: Vec<u8>,
    pub seqno: u64,
}

type Memory = Arc<Mutex<HashMap<u64, BTreeMap<u64, u8>>>>;

#[derive(Default)]
struct MockState {
    events: VecDeque<Vec<u8>>,
    uuids: HashMap<(u64, u64), UuidData>,
    acks: Vec<AckRef>,
    eu_controls: Vec<EuControlRecord>,
    vm_opens: Vec<(u64, u64, VmAccess)>,
    /// Attention bitmask reported by STOPPED requests, per engine.
    stopped: HashMap<EngineInstance, Vec<u8>>,
    seqno: u64,
    detached: bool,
    fail_vm_open: bool,
    fail_eu_control: bool,
}

/// [`Transport`] implementation that never touches a device.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    memory: Memory,
}

impl MockTransport {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue raw event record, see [`wire`] for builders.
    pub fn push_event(&self, record: Vec<u8>) {
        self.state().events.push_back(record);
    }

    pub fn pending_events(&self) -> usize {
        self.state().events.len()
    }

    /// Set READ_UUID answer for uuid `handle` of `client`.
    pub fn set_uuid(&self, client: u64, handle: u64, data: UuidData) {
        self.state().uuids.insert((client, handle), data);
    }

    pub fn acks(&self) -> Vec<AckRef> {
        self.state().acks.clone()
    }

    pub fn eu_controls(&self) -> Vec<EuControlRecord> {
        self.state().eu_controls.clone()
    }

    pub fn vm_opens(&self) -> Vec<(u64, u64, VmAccess)> {
        self.state().vm_opens.clone()
    }

    /// Set attention bitmask returned by STOPPED requests on `engine`.
    pub fn set_stopped(&self, engine: EngineInstance, bitmask: Vec<u8>) {
        self.state().stopped.insert(engine, bitmask);
    }

    /// Make poll fail like on a closed debug descriptor.
    pub fn detach(&self) {
        self.state().detached = true;
    }

    pub fn fail_vm_open(&self, fail: bool) {
        self.state().fail_vm_open = fail;
    }

    pub fn fail_eu_control(&self, fail: bool) {
        self.state().fail_eu_control = fail;
    }

    pub fn write_vm(&self, vm: u64, va: u64, data: &[u8]) {
        write_memory(&self.memory, vm, va, data)
    }

    /// Read VM memory, never written bytes read as zero.
    pub fn read_vm(&self, vm: u64, va: u64, len: usize) -> Vec<u8> {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        (0..len as u64)
            .map(|i| {
                memory
                    .get(&vm)
                    .and_then(|m| m.get(&(va + i)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }
}

fn write_memory(memory: &Memory, vm: u64, va: u64, data: &[u8]) {
    let mut memory = memory.lock().unwrap_or_else(PoisonError::into_inner);
    let space = memory.entry(vm).or_default();
    for (i, byte) in data.iter().enumerate() {
        space.insert(va + i as u64, *byte);
    }
}

impl Transport for MockTransport {
    fn poll(&self, timeout: Duration) -> Result<bool, Error> {
        {
            let state = self.state();
            if state.detached {
                return Err(Error::Syscall("poll", Errno::EINVAL));
            }
            if !state.events.is_empty() {
                return Ok(true);
            }
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(false)
    }

    fn read_event(&self, buf: &mut [u8]) -> Result<(), Error> {
        let record = self
            .state()
            .events
            .pop_front()
            .ok_or(Error::Syscall("read event", Errno::EAGAIN))?;
        if record.len() > buf.len() {
            return Err(Error::Syscall("read event", Errno::EMSGSIZE));
        }
        buf[..record.len()].copy_from_slice(&record);
        Ok(())
    }

    fn read_uuid(
        &self,
        client_handle: u64,
        handle: u64,
        _payload_size: u64,
    ) -> Result<UuidData, Error> {
        self.state()
            .uuids
            .get(&(client_handle, handle))
            .cloned()
            .ok_or(Error::Syscall("read uuid", Errno::ENOENT))
    }

    fn ack_event(&self, event: AckRef) -> Result<(), Error> {
        self.state().acks.push(event);
        Ok(())
    }

    fn eu_control(&self, request: &mut EuControlRequest) -> Result<u64, Error> {
        let mut state = self.state();
        if state.fail_eu_control {
            return Err(Error::Syscall("eu control", Errno::EIO));
        }
        if request.cmd == EuControlCmd::Stopped {
            let len = request.bitmask.len();
            request.bitmask = state
                .stopped
                .get(&request.engine)
                .cloned()
                .unwrap_or_default();
            request.bitmask.resize(len, 0);
        }
        state.seqno += 1;
        let seqno = state.seqno;
        state.eu_controls.push(EuControlRecord {
            client_handle: request.client_handle,
            cmd: request.cmd,
            engine: request.engine,
            bitmask: request.bitmask.clone(),
            seqno,
        });
        Ok(seqno)
    }

    fn vm_open(
        &self,
        client_handle: u64,
        vm_handle: u64,
        access: VmAccess,
    ) -> Result<Box<dyn VmFile>, Error> {
        let mut state = self.state();
        if state.fail_vm_open {
            return Err(Error::Syscall("vm open", Errno::EBUSY));
        }
        state.vm_opens.push((client_handle, vm_handle, access));
        Ok(Box::new(MockVmFile {
            vm: vm_handle,
            memory: self.memory.clone(),
        }))
    }
}

struct MockVmFile {
    vm: u64,
    memory: Memory,
}

impl VmFile for MockVmFile {
    /// Fails on never written bytes, like a read of unbound GPU memory.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let space = memory
            .get(&self.vm)
            .ok_or(Error::Syscall("pread", Errno::EIO))?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = *space
                .get(&(offset + i as u64))
                .ok_or(Error::Syscall("pread", Errno::EIO))?;
        }
        Ok(buf.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        write_memory(&self.memory, self.vm, offset, buf);
        Ok(buf.len())
    }

    fn read_mapped(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        self.read_at(buf, offset).map(|_| ())
    }

    fn write_mapped(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        self.write_at(buf, offset).map(|_| ())
    }
}

/// Builders of kernel event records.
pub mod wire {
    use crate::debugger::event::EngineInstance;
    use crate::debugger::proto;
    use bytes::BufMut;

    fn record(kind: u32, flags: u32, seqno: u64, payload: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = Vec::with_capacity(proto::EVENT_HEADER_SIZE);
        buf.put_u32_le(kind);
        buf.put_u32_le(flags);
        buf.put_u64_le(seqno);
        buf.put_u64_le(0);
        payload(&mut buf);
        let size = buf.len() as u64;
        buf[16..24].copy_from_slice(&size.to_le_bytes());
        buf
    }

    fn put_engine(buf: &mut Vec<u8>, engine: EngineInstance) {
        buf.put_u16_le(engine.class);
        buf.put_u16_le(engine.instance);
    }

    pub fn client(flags: u32, seqno: u64, handle: u64) -> Vec<u8> {
        record(proto::EVENT_CLIENT, flags, seqno, |b| b.put_u64_le(handle))
    }

    pub fn context(flags: u32, seqno: u64, client: u64, handle: u64) -> Vec<u8> {
        record(proto::EVENT_CONTEXT, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(handle);
        })
    }

    pub fn vm(flags: u32, seqno: u64, client: u64, handle: u64) -> Vec<u8> {
        record(proto::EVENT_VM, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(handle);
        })
    }

    pub fn uuid(
        flags: u32,
        seqno: u64,
        client: u64,
        handle: u64,
        class_handle: u64,
        payload_size: u64,
    ) -> Vec<u8> {
        record(proto::EVENT_UUID, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(handle);
            b.put_u64_le(class_handle);
            b.put_u64_le(payload_size);
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn vm_bind(
        flags: u32,
        seqno: u64,
        client: u64,
        vm: u64,
        va: u64,
        len: u64,
        uuids: &[u64],
    ) -> Vec<u8> {
        record(proto::EVENT_VM_BIND, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(vm);
            b.put_u64_le(va);
            b.put_u64_le(len);
            b.put_u32_le(uuids.len() as u32);
            b.put_u32_le(0);
            uuids.iter().for_each(|uuid| b.put_u64_le(*uuid));
        })
    }

    fn context_param(
        flags: u32,
        seqno: u64,
        client: u64,
        ctx: u64,
        param: u64,
        value: u64,
        data: &[u8],
    ) -> Vec<u8> {
        record(proto::EVENT_CONTEXT_PARAM, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(ctx);
            b.put_u32_le(0);
            b.put_u32_le(data.len() as u32);
            b.put_u64_le(param);
            b.put_u64_le(value);
            b.put_slice(data);
        })
    }

    pub fn context_param_vm(flags: u32, seqno: u64, client: u64, ctx: u64, vm: u64) -> Vec<u8> {
        context_param(flags, seqno, client, ctx, proto::CONTEXT_PARAM_VM, vm, &[])
    }

    pub fn context_param_engines(
        flags: u32,
        seqno: u64,
        client: u64,
        ctx: u64,
        engines: &[EngineInstance],
    ) -> Vec<u8> {
        let mut data = vec![];
        data.put_u64_le(0);
        engines.iter().for_each(|e| put_engine(&mut data, *e));
        context_param(
            flags,
            seqno,
            client,
            ctx,
            proto::CONTEXT_PARAM_ENGINES,
            0,
            &data,
        )
    }

    pub fn engines(
        flags: u32,
        seqno: u64,
        client: u64,
        ctx: u64,
        engines: &[(EngineInstance, u64)],
    ) -> Vec<u8> {
        record(proto::EVENT_ENGINES, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(ctx);
            b.put_u64_le(engines.len() as u64);
            for (engine, lrc) in engines {
                put_engine(b, *engine);
                b.put_u64_le(*lrc);
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn eu_attention(
        flags: u32,
        seqno: u64,
        client: u64,
        ctx: u64,
        lrc: u64,
        engine: EngineInstance,
        bitmask: &[u8],
    ) -> Vec<u8> {
        record(proto::EVENT_EU_ATTENTION, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(ctx);
            b.put_u64_le(lrc);
            b.put_u32_le(0);
            put_engine(b, engine);
            b.put_u32_le(bitmask.len() as u32);
            b.put_slice(bitmask);
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn page_fault(
        flags: u32,
        seqno: u64,
        client: u64,
        ctx: u64,
        lrc: u64,
        engine: EngineInstance,
        address: u64,
        before: &[u8],
        after: &[u8],
        resolved: &[u8],
    ) -> Vec<u8> {
        record(proto::EVENT_PAGE_FAULT, flags, seqno, |b| {
            b.put_u64_le(client);
            b.put_u64_le(ctx);
            b.put_u64_le(lrc);
            b.put_u32_le(0);
            put_engine(b, engine);
            b.put_u64_le(address);
            b.put_u32_le((before.len() + after.len() + resolved.len()) as u32);
            b.put_slice(before);
            b.put_slice(after);
            b.put_slice(resolved);
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::proto;

    #[test]
    fn test_scripted_events() {
        let transport = MockTransport::default();
        assert!(!transport.poll(Duration::from_millis(1)).unwrap());

        transport.push_event(wire::client(proto::EVENT_FLAG_CREATE, 1, 1));
        assert!(transport.poll(Duration::from_millis(1)).unwrap());
        let mut buf = vec![0; 64];
        transport.read_event(&mut buf).unwrap();
        assert_eq!(&buf[..4], &proto::EVENT_CLIENT.to_le_bytes());
        assert!(matches!(
            transport.read_event(&mut buf),
            Err(Error::Syscall(_, Errno::EAGAIN))
        ));

        transport.detach();
        assert!(transport.poll(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_vm_memory() {
        let transport = MockTransport::default();
        transport.write_vm(1, 0x100, &[1, 2]);

        let file = transport.vm_open(7, 1, VmAccess::ReadOnly).unwrap();
        let mut buf = [0; 2];
        assert_eq!(file.read_at(&mut buf, 0x100).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert!(file.read_at(&mut buf, 0x101).is_err());
        assert_eq!(transport.vm_opens(), vec![(7, 1, VmAccess::ReadOnly)]);
    }
}
