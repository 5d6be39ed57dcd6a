//! Wire layout of the i915 debugger interface (prelim uAPI).
//!
//! Event records are decoded field by field in [`crate::debugger::event`], structs here are the
//! ioctl arguments passed to the kernel as is.

use nix::libc;
use std::mem::size_of;

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const DEBUG_IOCTL_BASE: u8 = b'j';
pub const DRM_IOCTL_BASE: u8 = b'd';
pub const DRM_COMMAND_BASE: u8 = 0x40;
pub const DRM_I915_DEBUGGER_OPEN: u8 = 0x56;

/// Protocol version starting from which vm-bind completion is gated on user fences,
/// so kernel does not block on CPU until acknowledged.
pub const DEBUG_VERSION_BLOCK_ON_FENCE: u32 = 3;

pub const DEBUG_FLAG_FD_NONBLOCK: u32 = 1 << 31;

pub const CONTEXT_PARAM_VM: u64 = 0x9;
pub const CONTEXT_PARAM_ENGINES: u64 = 0xa;

// ===============================================================================================
// Events
// ===============================================================================================

pub const EVENT_NONE: u32 = 0;
pub const EVENT_READ: u32 = 1;
pub const EVENT_CLIENT: u32 = 2;
pub const EVENT_CONTEXT: u32 = 3;
pub const EVENT_UUID: u32 = 4;
pub const EVENT_VM: u32 = 5;
pub const EVENT_VM_BIND: u32 = 6;
pub const EVENT_CONTEXT_PARAM: u32 = 7;
pub const EVENT_EU_ATTENTION: u32 = 8;
pub const EVENT_ENGINES: u32 = 9;
pub const EVENT_PAGE_FAULT: u32 = 10;
pub const EVENT_MAX: u32 = EVENT_PAGE_FAULT;

pub const EVENT_FLAG_CREATE: u32 = 1 << 31;
pub const EVENT_FLAG_DESTROY: u32 = 1 << 30;
pub const EVENT_FLAG_STATE_CHANGE: u32 = 1 << 29;
pub const EVENT_FLAG_NEED_ACK: u32 = 1 << 28;

/// `{type:u32, flags:u32, seqno:u64, size:u64}`
pub const EVENT_HEADER_SIZE: usize = 24;
pub const EVENT_CLIENT_SIZE: usize = EVENT_HEADER_SIZE + 8;
pub const EVENT_CONTEXT_SIZE: usize = EVENT_HEADER_SIZE + 16;
pub const EVENT_UUID_SIZE: usize = EVENT_HEADER_SIZE + 32;
pub const EVENT_VM_SIZE: usize = EVENT_HEADER_SIZE + 16;
pub const EVENT_VM_BIND_SIZE: usize = EVENT_HEADER_SIZE + 40;
pub const EVENT_CONTEXT_PARAM_SIZE: usize = EVENT_HEADER_SIZE + 16 + 24;
pub const EVENT_EU_ATTENTION_SIZE: usize = EVENT_HEADER_SIZE + 36;
pub const EVENT_ENGINES_SIZE: usize = EVENT_HEADER_SIZE + 24;
pub const EVENT_PAGE_FAULT_SIZE: usize = EVENT_HEADER_SIZE + 44;

/// `{class:u16, instance:u16, lrc_handle:u64}`
pub const ENGINE_INFO_SIZE: usize = 12;
/// `{class:u16, instance:u16}`
pub const ENGINE_CLASS_INSTANCE_SIZE: usize = 4;
/// Leading `extensions` field of engines context parameter.
pub const CONTEXT_PARAM_ENGINES_HEADER: usize = 8;

pub const UUID_STRING_LEN: usize = 36;

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EventAck {
    pub kind: u32,
    pub flags: u32,
    pub seqno: u64,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct ReadUuid {
    pub client_handle: u64,
    pub handle: u64,
    pub flags: u32,
    pub uuid: [u8; UUID_STRING_LEN],
    pub payload_ptr: u64,
    pub payload_size: u64,
}

impl Default for ReadUuid {
    fn default() -> Self {
        Self {
            client_handle: 0,
            handle: 0,
            flags: 0,
            uuid: [0; UUID_STRING_LEN],
            payload_ptr: 0,
            payload_size: 0,
        }
    }
}

// ===============================================================================================
// VM Access
// ===============================================================================================

pub const VM_OPEN_READ_ONLY: u64 = libc::O_RDONLY as u64;
pub const VM_OPEN_READ_WRITE: u64 = libc::O_RDWR as u64;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VmOpen {
    pub client_handle: u64,
    pub handle: u64,
    pub flags: u64,
}

// ===============================================================================================
// EU Thread Control
// ===============================================================================================

pub const EU_THREADS_CMD_INTERRUPT_ALL: u32 = 0;
pub const EU_THREADS_CMD_STOPPED: u32 = 1;
pub const EU_THREADS_CMD_RESUME: u32 = 2;
pub const EU_THREADS_CMD_INTERRUPT: u32 = 3;

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EngineClassInstance {
    pub engine_class: u16,
    pub engine_instance: u16,
}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EuControl {
    pub client_handle: u64,
    pub cmd: u32,
    pub flags: u32,
    pub seqno: u64,
    pub ci: EngineClassInstance,
    pub bitmask_size: u32,
    pub bitmask_ptr: u64,
}

// ===============================================================================================
// Debugger Connection
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DebuggerOpenParam {
    pub pid: u64,
    pub flags: u32,
    pub version: u32,
    pub events: u64,
    pub extensions: u64,
}

// ===============================================================================================
// Request Codes
// ===============================================================================================

pub type RequestCode = libc::c_ulong;

pub const IOCTL_READ_EVENT: RequestCode = nix::request_code_none!(DEBUG_IOCTL_BASE, 0x0) as _;
pub const IOCTL_READ_UUID: RequestCode =
    nix::request_code_readwrite!(DEBUG_IOCTL_BASE, 0x1, size_of::<ReadUuid>()) as _;
pub const IOCTL_VM_OPEN: RequestCode =
    nix::request_code_write!(DEBUG_IOCTL_BASE, 0x2, size_of::<VmOpen>()) as _;
pub const IOCTL_EU_CONTROL: RequestCode =
    nix::request_code_readwrite!(DEBUG_IOCTL_BASE, 0x3, size_of::<EuControl>()) as _;
pub const IOCTL_ACK_EVENT: RequestCode =
    nix::request_code_write!(DEBUG_IOCTL_BASE, 0x4, size_of::<EventAck>()) as _;
pub const IOCTL_DEBUGGER_OPEN: RequestCode = nix::request_code_readwrite!(
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_I915_DEBUGGER_OPEN,
    size_of::<DebuggerOpenParam>()
) as _;

/// Human readable request name, used in logs and syscall errors.
pub fn request_name(request: RequestCode) -> &'static str {
    match request {
        IOCTL_READ_EVENT => "READ_EVENT",
        IOCTL_READ_UUID => "READ_UUID",
        IOCTL_VM_OPEN => "VM_OPEN",
        IOCTL_EU_CONTROL => "EU_CONTROL",
        IOCTL_ACK_EVENT => "ACK_EVENT",
        IOCTL_DEBUGGER_OPEN => "DEBUGGER_OPEN",
        _ => "ioctl",
    }
}
