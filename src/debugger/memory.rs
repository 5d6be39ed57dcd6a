//! GPU memory access through per-VM descriptors.

use crate::debugger::config::SessionConfig;
use crate::debugger::connection::ClientConnection;
use crate::debugger::error::Error;
use crate::debugger::topology::Topology;
use crate::debugger::transport::{transfer_all, Transport, VmAccess};
use crate::debugger::utils::c_str_eq;
use crate::eu_mem;
use bytes::{Buf, BufMut};
use itertools::Itertools;
use strum_macros::Display;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
pub enum MemorySpace {
    /// GPU virtual address space of a VM.
    #[default]
    #[strum(serialize = "default")]
    Default,
    /// Shared local memory, not accessible through VM descriptors.
    #[strum(serialize = "slm")]
    Slm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryDesc {
    pub space: MemorySpace,
    pub address: u64,
}

impl MemoryDesc {
    pub fn new(address: u64) -> Self {
        Self {
            space: MemorySpace::Default,
            address,
        }
    }
}

/// Which VM an access goes through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmTarget {
    /// VM a stopped thread runs under.
    Vm(u64),
    /// First VM of the client the access succeeds on.
    Any,
}

/// Reads and writes of a client VM, descriptor is opened and closed per call.
pub struct VmIo<'a> {
    pub transport: &'a dyn Transport,
    pub config: &'a SessionConfig,
    pub client_handle: u64,
}

impl VmIo<'_> {
    pub fn read(&self, vm: u64, va: u64, buf: &mut [u8]) -> Result<(), Error> {
        eu_mem!("read {} bytes at {va:#x} of vm {vm}", buf.len());
        let file = self
            .transport
            .vm_open(self.client_handle, vm, VmAccess::ReadOnly)?;
        if self.config.use_mmap_access {
            return file.read_mapped(buf, va);
        }
        let len = buf.len();
        transfer_all(len, self.config.access_retries, |done| {
            file.read_at(&mut buf[done..], va + done as u64)
        })
    }

    pub fn write(&self, vm: u64, va: u64, buf: &[u8]) -> Result<(), Error> {
        eu_mem!("write {} bytes at {va:#x} of vm {vm}", buf.len());
        let file = self
            .transport
            .vm_open(self.client_handle, vm, VmAccess::ReadWrite)?;
        if self.config.use_mmap_access {
            return file.write_mapped(buf, va);
        }
        transfer_all(buf.len(), self.config.access_retries, |done| {
            file.write_at(&buf[done..], va + done as u64)
        })
    }

    fn each_vm<F>(&self, conn: &ClientConnection, mut op: F) -> Result<(), Error>
    where
        F: FnMut(u64) -> Result<(), Error>,
    {
        for vm in conn.vm_ids.iter().sorted() {
            match op(*vm) {
                Ok(()) => return Ok(()),
                Err(e) => eu_mem!("access through vm {vm} failed: {e}"),
            }
        }
        Err(Error::NotAvailable)
    }
}

/// Read GPU memory of the client.
///
/// ISA ranges are served from their own VM, ELF images from uuid payload,
/// anything else from the target VM.
pub fn read_memory(
    io: &VmIo,
    conn: &ClientConnection,
    topology: &dyn Topology,
    target: VmTarget,
    desc: MemoryDesc,
    buf: &mut [u8],
) -> Result<(), Error> {
    if desc.space != MemorySpace::Default {
        return Err(Error::InvalidArgument("memory space"));
    }
    let va = topology.decanonize(desc.address);
    let len = buf.len() as u64;

    if let Some(isa) = conn.isa_containing(va) {
        if !isa.bind.contains(va, len) {
            return Err(Error::InvalidArgument("access crosses isa range"));
        }
        return io.read(isa.vm, va, buf);
    }

    if let Some((image, begin)) = conn.elf_containing(va, len) {
        let offset = (va - begin) as usize;
        let src = image
            .get(offset..offset + buf.len())
            .ok_or(Error::InvalidArgument("access crosses elf image"))?;
        buf.copy_from_slice(src);
        return Ok(());
    }

    match target {
        VmTarget::Vm(vm) => io.read(vm, va, buf),
        VmTarget::Any => io.each_vm(conn, |vm| io.read(vm, va, buf)),
    }
}

/// Write GPU memory of the client.
pub fn write_memory(
    io: &VmIo,
    conn: &ClientConnection,
    topology: &dyn Topology,
    target: VmTarget,
    desc: MemoryDesc,
    buf: &[u8],
) -> Result<(), Error> {
    if desc.space != MemorySpace::Default {
        return Err(Error::InvalidArgument("memory space"));
    }
    let va = topology.decanonize(desc.address);

    if let Some(isa) = conn.isa_containing(va) {
        if !isa.bind.contains(va, buf.len() as u64) {
            return Err(Error::InvalidArgument("access crosses isa range"));
        }
        return io.write(isa.vm, va, buf);
    }

    match target {
        VmTarget::Vm(vm) => io.write(vm, va, buf),
        VmTarget::Any => io.each_vm(conn, |vm| io.write(vm, va, buf)),
    }
}

pub const DEBUG_AREA_MAGIC: &str = "dbgarea";

/// Header of the module debug area, written by the runtime.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugAreaHeader {
    pub version: u8,
    pub pgsize: u8,
    pub size: u8,
    pub scratch_begin: u16,
    pub scratch_end: u16,
    pub is_shared: u64,
}

impl DebugAreaHeader {
    pub const SIZE: usize = 32;

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE || !c_str_eq(&bytes[..8], DEBUG_AREA_MAGIC) {
            return Err(Error::Magic("module debug area"));
        }
        let mut b = &bytes[16..];
        let version = b.get_u8();
        let pgsize = b.get_u8();
        let size = b.get_u8();
        b.advance(1);
        Ok(Self {
            version,
            pgsize,
            size,
            scratch_begin: b.get_u16_le(),
            scratch_end: b.get_u16_le(),
            is_shared: b.get_u64_le(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        let mut magic = [0u8; 8];
        magic[..DEBUG_AREA_MAGIC.len()].copy_from_slice(DEBUG_AREA_MAGIC.as_bytes());
        buf.put_slice(&magic);
        buf.put_u64_le(0);
        buf.put_u8(self.version);
        buf.put_u8(self.pgsize);
        buf.put_u8(self.size);
        buf.put_u8(0);
        buf.put_u16_le(self.scratch_begin);
        buf.put_u16_le(self.scratch_end);
        buf.put_u64_le(self.is_shared);
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::connection::BindInfo;
    use crate::debugger::mock::MockTransport;
    use crate::debugger::module::IsaAllocation;
    use crate::debugger::topology::{DeviceTopology, HwLayout};

    fn topology() -> DeviceTopology {
        DeviceTopology::new(
            1,
            HwLayout {
                slices: 1,
                subslices_per_slice: 1,
                eus_per_subslice: 1,
                threads_per_eu: 8,
            },
        )
    }

    fn connection() -> ClientConnection {
        let mut conn = ClientConnection::new(1, 1);
        conn.vm_ids.extend([5, 6]);
        conn.isa[0].insert(
            0x10000,
            IsaAllocation {
                bind: BindInfo {
                    va: 0x10000,
                    size: 0x1000,
                },
                vm: 6,
                bind_count: 1,
                ..Default::default()
            },
        );
        conn
    }

    #[test]
    fn test_read_routing() {
        struct TestCase {
            target: VmTarget,
            desc: MemoryDesc,
            len: usize,
            expected: Result<Vec<u8>, &'static str>,
        }
        let cases = vec![
            TestCase {
                target: VmTarget::Vm(5),
                desc: MemoryDesc::new(0x2000),
                len: 4,
                expected: Ok(vec![1, 2, 3, 4]),
            },
            TestCase {
                target: VmTarget::Vm(5),
                desc: MemoryDesc::new(0x10010),
                len: 2,
                expected: Ok(vec![0xaa, 0xbb]),
            },
            TestCase {
                target: VmTarget::Vm(5),
                desc: MemoryDesc::new(0x10ffe),
                len: 4,
                expected: Err("isa"),
            },
            TestCase {
                target: VmTarget::Vm(5),
                desc: MemoryDesc {
                    space: MemorySpace::Slm,
                    address: 0x2000,
                },
                len: 4,
                expected: Err("space"),
            },
            TestCase {
                target: VmTarget::Any,
                desc: MemoryDesc::new(0x3000),
                len: 1,
                expected: Ok(vec![9]),
            },
        ];

        let transport = MockTransport::default();
        transport.write_vm(5, 0x2000, &[1, 2, 3, 4]);
        transport.write_vm(6, 0x10010, &[0xaa, 0xbb]);
        transport.write_vm(6, 0x3000, &[9]);
        let config = SessionConfig::default();
        let io = VmIo {
            transport: &transport,
            config: &config,
            client_handle: 1,
        };
        let conn = connection();

        for tc in cases {
            let mut buf = vec![0; tc.len];
            let result = read_memory(&io, &conn, &topology(), tc.target, tc.desc, &mut buf);
            match tc.expected {
                Ok(expected) => {
                    result.unwrap();
                    assert_eq!(buf, expected);
                }
                Err(_) => assert!(matches!(result, Err(Error::InvalidArgument(_)))),
            }
        }
    }

    #[test]
    fn test_write_and_mapped_access() {
        let transport = MockTransport::default();
        let config = SessionConfig {
            use_mmap_access: true,
            ..Default::default()
        };
        let io = VmIo {
            transport: &transport,
            config: &config,
            client_handle: 1,
        };
        let conn = connection();

        write_memory(
            &io,
            &conn,
            &topology(),
            VmTarget::Vm(5),
            MemoryDesc::new(0xffff_8000_0000_0000),
            &[7, 7],
        )
        .unwrap();
        assert_eq!(transport.read_vm(5, 0x8000_0000_0000, 2), vec![7, 7]);

        let mut buf = [0; 2];
        read_memory(
            &io,
            &conn,
            &topology(),
            VmTarget::Vm(5),
            MemoryDesc::new(0x8000_0000_0000),
            &mut buf,
        )
        .unwrap();
        assert_eq!(buf, [7, 7]);
    }

    #[test]
    fn test_any_vm_not_available() {
        let transport = MockTransport::default();
        transport.fail_vm_open(true);
        let config = SessionConfig::default();
        let io = VmIo {
            transport: &transport,
            config: &config,
            client_handle: 1,
        };
        let mut buf = [0; 4];
        let result = read_memory(
            &io,
            &connection(),
            &topology(),
            VmTarget::Any,
            MemoryDesc::new(0x2000),
            &mut buf,
        );
        assert!(matches!(result, Err(Error::NotAvailable)));
    }

    #[test]
    fn test_debug_area_header() {
        let header = DebugAreaHeader {
            version: 1,
            pgsize: 1,
            size: 4,
            scratch_begin: 0x10,
            scratch_end: 0x20,
            is_shared: 1,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), DebugAreaHeader::SIZE);
        assert_eq!(DebugAreaHeader::parse(&bytes).unwrap(), header);

        let mut bad = bytes.clone();
        bad[2] = b'X';
        assert!(matches!(
            DebugAreaHeader::parse(&bad),
            Err(Error::Magic(_))
        ));
    }
}
