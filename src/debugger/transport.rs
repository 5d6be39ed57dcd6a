use crate::debugger::error::Error;
use crate::debugger::event::{AckRef, EngineInstance};
use crate::debugger::proto;
use crate::debugger::proto::RequestCode;
use crate::eu_mem;
use memmap2::MmapOptions;
use nix::errno::Errno;
use nix::libc;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;
use strum_macros::Display;

/// Upper bound of retries for EU control requests.
const EU_CONTROL_RETRIES: u32 = 1000;

/// Payload of a UUID resource fetched with READ_UUID request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UuidData {
    /// 36 chars uuid string.
    pub uuid: String,
    pub payload: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum VmAccess {
    #[strum(serialize = "ro")]
    ReadOnly,
    #[strum(serialize = "rw")]
    ReadWrite,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum EuControlCmd {
    #[strum(serialize = "interrupt all")]
    InterruptAll,
    #[strum(serialize = "stopped")]
    Stopped,
    #[strum(serialize = "resume")]
    Resume,
    #[strum(serialize = "interrupt")]
    Interrupt,
}

impl EuControlCmd {
    pub fn raw(self) -> u32 {
        match self {
            EuControlCmd::InterruptAll => proto::EU_THREADS_CMD_INTERRUPT_ALL,
            EuControlCmd::Stopped => proto::EU_THREADS_CMD_STOPPED,
            EuControlCmd::Resume => proto::EU_THREADS_CMD_RESUME,
            EuControlCmd::Interrupt => proto::EU_THREADS_CMD_INTERRUPT,
        }
    }

    /// True if command carries a thread bitmask.
    pub fn has_bitmask(self) -> bool {
        !matches!(self, EuControlCmd::InterruptAll)
    }
}

/// EU control request, bitmask is an input for interrupt/resume and an output for stopped.
#[derive(Clone, Debug)]
pub struct EuControlRequest {
    pub client_handle: u64,
    pub cmd: EuControlCmd,
    pub engine: EngineInstance,
    pub bitmask: Vec<u8>,
}

/// Descriptor of a single GPU address space, closed on drop.
pub trait VmFile {
    /// Single pread at VA-relative offset, return transferred bytes count.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error>;
    /// Single pwrite at VA-relative offset, return transferred bytes count.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, Error>;
    /// Read through a temporary page aligned mapping.
    fn read_mapped(&self, buf: &mut [u8], offset: u64) -> Result<(), Error>;
    /// Write through a temporary page aligned mapping.
    fn write_mapped(&self, buf: &[u8], offset: u64) -> Result<(), Error>;
}

/// Kernel debug connection. Every ioctl failure is translated into [`Error`] here.
pub trait Transport: Send + Sync {
    /// Wait for the next event, return true if one is ready.
    fn poll(&self, timeout: Duration) -> Result<bool, Error>;

    /// Read next event record into `buf`, buffer length is the maximum event size.
    fn read_event(&self, buf: &mut [u8]) -> Result<(), Error>;

    fn read_uuid(&self, client_handle: u64, handle: u64, payload_size: u64)
        -> Result<UuidData, Error>;

    /// Acknowledge kernel event, type and seqno are copied from the original event.
    fn ack_event(&self, event: AckRef) -> Result<(), Error>;

    /// Issue EU control request, return kernel assigned sequence number.
    fn eu_control(&self, request: &mut EuControlRequest) -> Result<u64, Error>;

    fn vm_open(
        &self,
        client_handle: u64,
        vm_handle: u64,
        access: VmAccess,
    ) -> Result<Box<dyn VmFile>, Error>;
}

/// Errno values that a request is restarted on.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// EINTR, EAGAIN and EBUSY, until request completes.
    Default,
    /// EINTR and EAGAIN, bounded.
    EuControl,
}

impl RetryPolicy {
    pub fn should_retry(self, errno: Errno, attempt: u32) -> bool {
        match self {
            RetryPolicy::Default => matches!(errno, Errno::EINTR | Errno::EAGAIN | Errno::EBUSY),
            RetryPolicy::EuControl => {
                matches!(errno, Errno::EINTR | Errno::EAGAIN) && attempt < EU_CONTROL_RETRIES
            }
        }
    }
}

/// Restart `request` while it fails with an errno accepted by `policy`.
pub fn retry_request<F>(policy: RetryPolicy, mut request: F) -> nix::Result<libc::c_int>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    let mut attempt = 0;
    loop {
        match request() {
            Err(errno) if policy.should_retry(errno, attempt) => attempt += 1,
            result => return result,
        }
    }
}

/// Request still failing with a retryable errno after bounded retries.
fn retries_exhausted(err: Error) -> Error {
    match err {
        Error::Syscall(_, Errno::EINTR | Errno::EAGAIN) => Error::TransientRetryable,
        err => err,
    }
}

/// Transfer `len` bytes with repeated partial `op` calls.
///
/// `op` receives already transferred bytes count and returns bytes transferred by this call.
/// Zero-length transfers are retried up to `zero_retries` times, counter resets on progress.
pub fn transfer_all<F>(len: usize, zero_retries: u32, mut op: F) -> Result<(), Error>
where
    F: FnMut(usize) -> Result<usize, Error>,
{
    let mut done = 0;
    let mut retries = 0;
    while done < len && retries < zero_retries {
        match op(done)? {
            0 => retries += 1,
            n => {
                done += n;
                retries = 0;
            }
        }
    }

    if done >= len {
        Ok(())
    } else {
        Err(Error::Unknown(format!(
            "incomplete transfer, {} of {len} bytes",
            done
        )))
    }
}

/// Transport over a real i915 debugger file descriptor.
pub struct SysTransport {
    fd: OwnedFd,
}

impl SysTransport {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Open debugger connection for process `pid` through DRM device node.
    /// Return transport and kernel debug protocol version.
    pub fn connect(device: &Path, pid: u32) -> Result<(Self, u32), Error> {
        let drm = OpenOptions::new().read(true).write(true).open(device)?;
        let mut param = proto::DebuggerOpenParam {
            pid: pid as u64,
            flags: proto::DEBUG_FLAG_FD_NONBLOCK,
            ..Default::default()
        };
        let fd = ioctl(
            drm.as_raw_fd(),
            proto::IOCTL_DEBUGGER_OPEN,
            &mut param,
            RetryPolicy::Default,
        )?;
        // SAFETY: kernel returns a new descriptor owned by caller
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok((Self::new(fd), param.version))
    }
}

fn ioctl<T>(
    fd: RawFd,
    request: RequestCode,
    arg: &mut T,
    policy: RetryPolicy,
) -> Result<libc::c_int, Error> {
    let arg = arg as *mut T;
    retry_request(policy, || {
        // SAFETY: `arg` points to a live argument struct matching `request` layout
        Errno::result(unsafe { libc::ioctl(fd, request as _, arg) })
    })
    .map_err(|errno| Error::Syscall(proto::request_name(request), errno))
}

impl Transport for SysTransport {
    fn poll(&self, timeout: Duration) -> Result<bool, Error> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: single valid pollfd
        let ready = Errno::result(unsafe { libc::poll(&mut pfd, 1, timeout) })
            .map_err(|e| Error::Syscall("poll", e))?;
        Ok(ready > 0)
    }

    fn read_event(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < proto::EVENT_HEADER_SIZE {
            return Err(Error::InvalidArgument("event buffer too small"));
        }
        buf[0..4].copy_from_slice(&proto::EVENT_READ.to_le_bytes());
        buf[4..8].copy_from_slice(&0u32.to_le_bytes());
        buf[8..16].copy_from_slice(&0u64.to_le_bytes());
        let len = buf.len() as u64;
        buf[16..24].copy_from_slice(&len.to_le_bytes());

        let ptr = buf.as_mut_ptr();
        retry_request(RetryPolicy::Default, || {
            // SAFETY: buffer is at least as long as declared in its header
            Errno::result(unsafe {
                libc::ioctl(self.fd.as_raw_fd(), proto::IOCTL_READ_EVENT as _, ptr)
            })
        })
        .map_err(|e| Error::Syscall("READ_EVENT", e))?;
        Ok(())
    }

    fn read_uuid(
        &self,
        client_handle: u64,
        handle: u64,
        payload_size: u64,
    ) -> Result<UuidData, Error> {
        let mut payload = vec![0u8; payload_size as usize];
        let mut arg = proto::ReadUuid {
            client_handle,
            handle,
            payload_ptr: payload.as_mut_ptr() as u64,
            payload_size,
            ..Default::default()
        };
        ioctl(
            self.fd.as_raw_fd(),
            proto::IOCTL_READ_UUID,
            &mut arg,
            RetryPolicy::Default,
        )?;

        let uuid_bytes = arg.uuid;
        Ok(UuidData {
            uuid: String::from_utf8_lossy(&uuid_bytes).into_owned(),
            payload,
        })
    }

    fn ack_event(&self, event: AckRef) -> Result<(), Error> {
        let mut arg = proto::EventAck {
            kind: event.kind,
            flags: 0,
            seqno: event.seqno,
        };
        ioctl(
            self.fd.as_raw_fd(),
            proto::IOCTL_ACK_EVENT,
            &mut arg,
            RetryPolicy::Default,
        )?;
        Ok(())
    }

    fn eu_control(&self, request: &mut EuControlRequest) -> Result<u64, Error> {
        let (ptr, size) = if request.cmd.has_bitmask() {
            (
                request.bitmask.as_mut_ptr() as u64,
                request.bitmask.len() as u32,
            )
        } else {
            (0, 0)
        };
        let mut arg = proto::EuControl {
            client_handle: request.client_handle,
            cmd: request.cmd.raw(),
            flags: 0,
            seqno: 0,
            ci: proto::EngineClassInstance {
                engine_class: request.engine.class,
                engine_instance: request.engine.instance,
            },
            bitmask_size: size,
            bitmask_ptr: ptr,
        };
        ioctl(
            self.fd.as_raw_fd(),
            proto::IOCTL_EU_CONTROL,
            &mut arg,
            RetryPolicy::EuControl,
        )
        .map_err(retries_exhausted)?;
        Ok(arg.seqno)
    }

    fn vm_open(
        &self,
        client_handle: u64,
        vm_handle: u64,
        access: VmAccess,
    ) -> Result<Box<dyn VmFile>, Error> {
        let mut arg = proto::VmOpen {
            client_handle,
            handle: vm_handle,
            flags: match access {
                VmAccess::ReadOnly => proto::VM_OPEN_READ_ONLY,
                VmAccess::ReadWrite => proto::VM_OPEN_READ_WRITE,
            },
        };
        let fd = ioctl(
            self.fd.as_raw_fd(),
            proto::IOCTL_VM_OPEN,
            &mut arg,
            RetryPolicy::Default,
        )?;
        eu_mem!("vm open, client {client_handle} vm {vm_handle} ({access}) -> fd {fd}");
        // SAFETY: kernel returns a new descriptor owned by caller
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(Box::new(SysVmFile { file }))
    }
}

struct SysVmFile {
    file: File,
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as u64,
        _ => 4096,
    }
}

/// Split `offset` into page aligned start and in-page delta.
fn page_align(offset: u64) -> (u64, usize) {
    let aligned = offset & !(page_size() - 1);
    (aligned, (offset - aligned) as usize)
}

impl VmFile for SysVmFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        // SAFETY: buffer is valid for `buf.len()` bytes
        let ret = unsafe {
            libc::pread(
                self.file.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                offset as libc::off_t,
            )
        };
        Errno::result(ret)
            .map(|n| n as usize)
            .map_err(|e| Error::Syscall("pread", e))
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        // SAFETY: buffer is valid for `buf.len()` bytes
        let ret = unsafe {
            libc::pwrite(
                self.file.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                offset as libc::off_t,
            )
        };
        Errno::result(ret)
            .map(|n| n as usize)
            .map_err(|e| Error::Syscall("pwrite", e))
    }

    fn read_mapped(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        let (aligned, delta) = page_align(offset);
        // SAFETY: mapping is private to this call and dropped (unmapped) before return
        let map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(delta + buf.len())
                .map(&self.file)?
        };
        buf.copy_from_slice(&map[delta..delta + buf.len()]);
        Ok(())
    }

    fn write_mapped(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let (aligned, delta) = page_align(offset);
        // SAFETY: mapping is private to this call and dropped (unmapped) before return
        let mut map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(delta + buf.len())
                .map_mut(&self.file)?
        };
        map[delta..delta + buf.len()].copy_from_slice(buf);
        map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_read_event_request_header() {
        let file = File::open("/dev/null").unwrap();
        let transport = SysTransport::new(OwnedFd::from(file));

        assert!(matches!(
            transport.read_event(&mut [0; 8]),
            Err(Error::InvalidArgument(_))
        ));

        // not a debugger fd, request header stays as prepared
        let mut buf = vec![0xff; 64];
        assert!(matches!(
            transport.read_event(&mut buf),
            Err(Error::Syscall(_, Errno::ENOTTY))
        ));
        assert_eq!(&buf[0..4], &proto::EVENT_READ.to_le_bytes());
        assert_eq!(&buf[4..16], &[0; 12]);
        assert_eq!(&buf[16..24], &64u64.to_le_bytes());
    }

    #[test]
    fn test_retry_policy() {
        struct TestCase {
            policy: RetryPolicy,
            errno: Errno,
            retry: bool,
        }
        let cases = vec![
            TestCase {
                policy: RetryPolicy::Default,
                errno: Errno::EINTR,
                retry: true,
            },
            TestCase {
                policy: RetryPolicy::Default,
                errno: Errno::EBUSY,
                retry: true,
            },
            TestCase {
                policy: RetryPolicy::Default,
                errno: Errno::EINVAL,
                retry: false,
            },
            TestCase {
                policy: RetryPolicy::EuControl,
                errno: Errno::EAGAIN,
                retry: true,
            },
            TestCase {
                policy: RetryPolicy::EuControl,
                errno: Errno::EBUSY,
                retry: false,
            },
        ];

        for tc in cases {
            assert_eq!(tc.policy.should_retry(tc.errno, 0), tc.retry);
        }
        assert!(!RetryPolicy::EuControl.should_retry(Errno::EINTR, EU_CONTROL_RETRIES));
    }

    #[test]
    fn test_retry_request_restarts_on_transient() {
        let calls = Cell::new(0);
        let result = retry_request(RetryPolicy::Default, || {
            calls.set(calls.get() + 1);
            match calls.get() {
                1 => Err(Errno::EINTR),
                2 => Err(Errno::EBUSY),
                _ => Ok(5),
            }
        });
        assert_eq!(result, Ok(5));
        assert_eq!(calls.get(), 3);

        let result = retry_request(RetryPolicy::EuControl, || Err(Errno::EBUSY));
        assert_eq!(result, Err(Errno::EBUSY));
    }

    #[test]
    fn test_exhausted_eu_control_is_transient() {
        assert!(matches!(
            retries_exhausted(Error::Syscall("ioctl", Errno::EAGAIN)),
            Error::TransientRetryable
        ));
        assert!(matches!(
            retries_exhausted(Error::Syscall("ioctl", Errno::EINVAL)),
            Error::Syscall(_, Errno::EINVAL)
        ));
    }

    #[test]
    fn test_transfer_all() {
        struct TestCase {
            chunks: Vec<Result<usize, ()>>,
            len: usize,
            ok: bool,
        }
        let cases = vec![
            // partial transfers
            TestCase {
                chunks: vec![Ok(4), Ok(4), Ok(8)],
                len: 16,
                ok: true,
            },
            // zero transfers are retried, counter resets on progress
            TestCase {
                chunks: vec![Ok(0), Ok(0), Ok(8), Ok(0), Ok(0), Ok(8)],
                len: 16,
                ok: true,
            },
            // three zero transfers in a row
            TestCase {
                chunks: vec![Ok(8), Ok(0), Ok(0), Ok(0), Ok(8)],
                len: 16,
                ok: false,
            },
            // failed syscall
            TestCase {
                chunks: vec![Ok(8), Err(())],
                len: 16,
                ok: false,
            },
        ];

        for tc in cases {
            let mut chunks = tc.chunks.into_iter();
            let result = transfer_all(tc.len, 3, |_| match chunks.next() {
                Some(Ok(n)) => Ok(n),
                Some(Err(_)) => Err(Error::Syscall("pread", Errno::EIO)),
                None => Ok(0),
            });
            assert_eq!(result.is_ok(), tc.ok);
        }
    }

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert_eq!(page_align(page + 10), (page, 10));
        assert_eq!(page_align(page * 3), (page * 3, 0));
    }
}
