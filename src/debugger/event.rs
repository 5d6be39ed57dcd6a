use crate::debugger::proto;
use bytes::Buf;
use std::fmt::{Display, Formatter};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("record shorter than event header ({0} bytes)")]
    NoHeader(usize),
    #[error("event type {kind} declares {declared} bytes, {required} required")]
    Truncated {
        kind: u32,
        declared: u64,
        required: usize,
    },
    #[error("event type {kind} declares {declared} bytes, buffer is {available}")]
    Oversized {
        kind: u32,
        declared: u64,
        available: usize,
    },
    #[error("unknown event type {0}")]
    UnknownType(u32),
    #[error("event type {kind} with unsupported flags {flags:#x}")]
    UnsupportedFlags { kind: u32, flags: u32 },
}

/// Kernel event reference used by acknowledgment ioctl.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AckRef {
    pub kind: u32,
    pub seqno: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineInstance {
    pub class: u16,
    pub instance: u16,
}

impl Display for EngineInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.class, self.instance)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventHeader {
    pub kind: u32,
    pub flags: u32,
    pub seqno: u64,
    pub size: u64,
}

impl EventHeader {
    pub fn is_create(&self) -> bool {
        self.flags & proto::EVENT_FLAG_CREATE != 0
    }

    pub fn is_destroy(&self) -> bool {
        self.flags & proto::EVENT_FLAG_DESTROY != 0
    }

    pub fn is_state_change(&self) -> bool {
        self.flags & proto::EVENT_FLAG_STATE_CHANGE != 0
    }

    pub fn need_ack(&self) -> bool {
        self.flags & proto::EVENT_FLAG_NEED_ACK != 0
    }

    pub fn ack_ref(&self) -> AckRef {
        AckRef {
            kind: self.kind,
            seqno: self.seqno,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UuidEvent {
    pub client_handle: u64,
    pub handle: u64,
    pub class_handle: u64,
    pub payload_size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmBindEvent {
    pub client_handle: u64,
    pub vm_handle: u64,
    pub va_start: u64,
    pub va_length: u64,
    pub flags: u32,
    pub uuids: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextParam {
    Vm(u64),
    Engines(Vec<EngineInstance>),
    Other { param: u64, value: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextParamEvent {
    pub client_handle: u64,
    pub ctx_handle: u64,
    pub param: ContextParam,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnginesEvent {
    pub client_handle: u64,
    pub ctx_handle: u64,
    /// Engine and its logical ring context handle.
    pub engines: Vec<(EngineInstance, u64)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttentionEvent {
    pub client_handle: u64,
    pub ctx_handle: u64,
    pub lrc_handle: u64,
    pub flags: u32,
    pub engine: EngineInstance,
    pub bitmask: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageFaultEvent {
    pub client_handle: u64,
    pub ctx_handle: u64,
    pub lrc_handle: u64,
    pub flags: u32,
    pub engine: EngineInstance,
    pub address: u64,
    /// Attention bits before the fault was raised.
    pub before: Vec<u8>,
    /// Attention bits after the fault was raised.
    pub after: Vec<u8>,
    /// Threads with already resolved fault.
    pub resolved: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Client { handle: u64 },
    Context { client_handle: u64, handle: u64 },
    Uuid(UuidEvent),
    Vm { client_handle: u64, handle: u64 },
    VmBind(VmBindEvent),
    ContextParam(ContextParamEvent),
    Engines(EnginesEvent),
    EuAttention(AttentionEvent),
    PageFault(PageFaultEvent),
}

/// Decoded kernel event with its original header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEvent {
    pub header: EventHeader,
    pub event: Event,
}

/// Parse event header, check declared size against buffer.
pub fn decode_header(buf: &[u8]) -> Result<EventHeader, DecodeError> {
    if buf.len() < proto::EVENT_HEADER_SIZE {
        return Err(DecodeError::NoHeader(buf.len()));
    }
    let mut b = buf;
    let header = EventHeader {
        kind: b.get_u32_le(),
        flags: b.get_u32_le(),
        seqno: b.get_u64_le(),
        size: b.get_u64_le(),
    };
    required(&header, proto::EVENT_HEADER_SIZE)?;
    if header.size > buf.len() as u64 {
        return Err(DecodeError::Oversized {
            kind: header.kind,
            declared: header.size,
            available: buf.len(),
        });
    }
    Ok(header)
}

fn required(header: &EventHeader, size: usize) -> Result<(), DecodeError> {
    if header.size < size as u64 {
        return Err(DecodeError::Truncated {
            kind: header.kind,
            declared: header.size,
            required: size,
        });
    }
    Ok(())
}

fn engine(b: &mut &[u8]) -> EngineInstance {
    EngineInstance {
        class: b.get_u16_le(),
        instance: b.get_u16_le(),
    }
}

/// Decode a single event record.
///
/// Declared size is validated before any payload access, variable sized tails
/// (uuids, engines, bitmasks) are validated against declared size as well.
pub fn decode(buf: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let header = decode_header(buf)?;

    if !header.is_create() && !header.is_destroy() && !header.is_state_change() {
        return Err(DecodeError::UnsupportedFlags {
            kind: header.kind,
            flags: header.flags,
        });
    }

    let record = &buf[..header.size as usize];
    let mut b = &record[proto::EVENT_HEADER_SIZE..];

    let event = match header.kind {
        proto::EVENT_CLIENT => {
            required(&header, proto::EVENT_CLIENT_SIZE)?;
            Event::Client {
                handle: b.get_u64_le(),
            }
        }
        proto::EVENT_CONTEXT => {
            required(&header, proto::EVENT_CONTEXT_SIZE)?;
            Event::Context {
                client_handle: b.get_u64_le(),
                handle: b.get_u64_le(),
            }
        }
        proto::EVENT_UUID => {
            required(&header, proto::EVENT_UUID_SIZE)?;
            Event::Uuid(UuidEvent {
                client_handle: b.get_u64_le(),
                handle: b.get_u64_le(),
                class_handle: b.get_u64_le(),
                payload_size: b.get_u64_le(),
            })
        }
        proto::EVENT_VM => {
            required(&header, proto::EVENT_VM_SIZE)?;
            Event::Vm {
                client_handle: b.get_u64_le(),
                handle: b.get_u64_le(),
            }
        }
        proto::EVENT_VM_BIND => {
            required(&header, proto::EVENT_VM_BIND_SIZE)?;
            let client_handle = b.get_u64_le();
            let vm_handle = b.get_u64_le();
            let va_start = b.get_u64_le();
            let va_length = b.get_u64_le();
            let num_uuids = b.get_u32_le() as usize;
            let flags = b.get_u32_le();
            required(&header, proto::EVENT_VM_BIND_SIZE + num_uuids * 8)?;
            let uuids = (0..num_uuids).map(|_| b.get_u64_le()).collect();
            Event::VmBind(VmBindEvent {
                client_handle,
                vm_handle,
                va_start,
                va_length,
                flags,
                uuids,
            })
        }
        proto::EVENT_CONTEXT_PARAM => {
            required(&header, proto::EVENT_CONTEXT_PARAM_SIZE)?;
            let client_handle = b.get_u64_le();
            let ctx_handle = b.get_u64_le();
            let _ctx_id = b.get_u32_le();
            let size = b.get_u32_le() as usize;
            let param = b.get_u64_le();
            let value = b.get_u64_le();

            let param = match param {
                proto::CONTEXT_PARAM_VM => ContextParam::Vm(value),
                proto::CONTEXT_PARAM_ENGINES => {
                    let count = size.saturating_sub(proto::CONTEXT_PARAM_ENGINES_HEADER)
                        / proto::ENGINE_CLASS_INSTANCE_SIZE;
                    if count > 0 {
                        required(
                            &header,
                            proto::EVENT_CONTEXT_PARAM_SIZE
                                + proto::CONTEXT_PARAM_ENGINES_HEADER
                                + count * proto::ENGINE_CLASS_INSTANCE_SIZE,
                        )?;
                        b.advance(proto::CONTEXT_PARAM_ENGINES_HEADER);
                    }
                    ContextParam::Engines((0..count).map(|_| engine(&mut b)).collect())
                }
                _ => ContextParam::Other { param, value },
            };
            Event::ContextParam(ContextParamEvent {
                client_handle,
                ctx_handle,
                param,
            })
        }
        proto::EVENT_ENGINES => {
            required(&header, proto::EVENT_ENGINES_SIZE)?;
            let client_handle = b.get_u64_le();
            let ctx_handle = b.get_u64_le();
            let num_engines = b.get_u64_le() as usize;
            let engines_size = num_engines.saturating_mul(proto::ENGINE_INFO_SIZE);
            required(&header, proto::EVENT_ENGINES_SIZE.saturating_add(engines_size))?;
            let engines = (0..num_engines)
                .map(|_| {
                    let ci = engine(&mut b);
                    (ci, b.get_u64_le())
                })
                .collect();
            Event::Engines(EnginesEvent {
                client_handle,
                ctx_handle,
                engines,
            })
        }
        proto::EVENT_EU_ATTENTION => {
            required(&header, proto::EVENT_EU_ATTENTION_SIZE)?;
            let client_handle = b.get_u64_le();
            let ctx_handle = b.get_u64_le();
            let lrc_handle = b.get_u64_le();
            let flags = b.get_u32_le();
            let ci = engine(&mut b);
            let bitmask_size = b.get_u32_le() as usize;
            required(&header, proto::EVENT_EU_ATTENTION_SIZE + bitmask_size)?;
            Event::EuAttention(AttentionEvent {
                client_handle,
                ctx_handle,
                lrc_handle,
                flags,
                engine: ci,
                bitmask: b[..bitmask_size].to_vec(),
            })
        }
        proto::EVENT_PAGE_FAULT => {
            required(&header, proto::EVENT_PAGE_FAULT_SIZE)?;
            let client_handle = b.get_u64_le();
            let ctx_handle = b.get_u64_le();
            let lrc_handle = b.get_u64_le();
            let flags = b.get_u32_le();
            let ci = engine(&mut b);
            let address = b.get_u64_le();
            let bitmask_size = b.get_u32_le() as usize;
            required(&header, proto::EVENT_PAGE_FAULT_SIZE + bitmask_size)?;
            // bitmask_size covers all three masks
            let size = bitmask_size / 3;
            Event::PageFault(PageFaultEvent {
                client_handle,
                ctx_handle,
                lrc_handle,
                flags,
                engine: ci,
                address,
                before: b[..size].to_vec(),
                after: b[size..2 * size].to_vec(),
                resolved: b[2 * size..3 * size].to_vec(),
            })
        }
        kind => return Err(DecodeError::UnknownType(kind)),
    };

    Ok(DecodedEvent { header, event })
}
