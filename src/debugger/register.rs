//! EU thread context layout inside the context state save area.

use crate::debugger::error::Error;
use crate::debugger::thread::EuThreadId;
use crate::debugger::topology::HwLayout;
use crate::debugger::utils::c_str_eq;
use bytes::{Buf, BufMut};
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum RegisterType {
    Grf,
    Addr,
    Flag,
    Ce,
    Sr,
    Cr,
    Tdr,
    Acc,
    Sp,
    Dbg,
    Fc,
    /// Virtual register set served from state base area tracking buffer.
    Sba,
}

impl RegisterType {
    pub fn is_writable(self) -> bool {
        !matches!(self, RegisterType::Ce | RegisterType::Tdr | RegisterType::Sba)
    }
}

/// Register set location inside thread context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegsetDesc {
    pub offset: u32,
    pub num: u16,
    pub bits: u16,
    pub bytes: u16,
}

impl RegsetDesc {
    const SIZE: usize = 10;

    /// Byte range of registers `start..start + count`.
    pub fn range(&self, start: u32, count: u32) -> Result<(u64, usize), Error> {
        if count == 0 || start as u64 + count as u64 > self.num as u64 {
            return Err(Error::InvalidArgument("register range"));
        }
        Ok((
            self.offset as u64 + self.bytes as u64 * start as u64,
            self.bytes as usize * count as usize,
        ))
    }
}

pub const SBA_REGSET: RegsetDesc = RegsetDesc {
    offset: 0,
    num: 9,
    bits: 64,
    bytes: 8,
};

pub const SSA_MAGIC: &str = "tssarea";
pub const SR_MAGIC: &str = "srmagic";
/// `{magic:[u8;8], count:u8, reserved:[u8;7]}`
pub const SR_IDENT_SIZE: usize = 16;

const VERSION_HEADER_SIZE: usize = 24;
/// Register sets in header order, `None` entries are not exposed.
const REGSET_ORDER: [Option<RegisterType>; 16] = [
    Some(RegisterType::Grf),
    Some(RegisterType::Addr),
    Some(RegisterType::Flag),
    Some(RegisterType::Ce),
    Some(RegisterType::Sr),
    Some(RegisterType::Cr),
    None, // notification
    Some(RegisterType::Tdr),
    Some(RegisterType::Acc),
    None, // mme
    None, // ctrl
    Some(RegisterType::Sp),
    None, // cmd
    None, // tm
    Some(RegisterType::Fc),
    Some(RegisterType::Dbg),
];
pub const SSA_HEADER_SIZE: usize = VERSION_HEADER_SIZE + 32 + REGSET_ORDER.len() * RegsetDesc::SIZE;

/// Parsed header of the context state save area.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSaveAreaHeader {
    pub version: (u8, u8, u8),
    /// Version header size, in 8 byte units.
    pub size: u8,
    pub layout: HwLayout,
    pub state_area_offset: u32,
    pub state_save_size: u32,
    pub sr_magic_offset: u32,
    regsets: Vec<(RegisterType, RegsetDesc)>,
}

impl StateSaveAreaHeader {
    pub fn new(layout: HwLayout, state_save_size: u32, regsets: &[(RegisterType, RegsetDesc)]) -> Self {
        Self {
            version: (1, 0, 0),
            size: (SSA_HEADER_SIZE / 8) as u8,
            layout,
            state_area_offset: 0,
            state_save_size,
            sr_magic_offset: 0,
            regsets: regsets.to_vec(),
        }
    }

    pub fn with_sr_magic_offset(self, offset: u32) -> Self {
        Self {
            sr_magic_offset: offset,
            ..self
        }
    }

    /// Parse header, `bytes` must start at state save area begin.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SSA_HEADER_SIZE {
            return Err(Error::InvalidArgument("state save area header size"));
        }
        if !c_str_eq(&bytes[..8], SSA_MAGIC) {
            return Err(Error::Magic("state save area"));
        }

        let mut b = &bytes[16..];
        let version = (b.get_u8(), b.get_u8(), b.get_u8());
        let size = b.get_u8();
        b.advance(4);

        let layout = HwLayout {
            slices: b.get_u16_le() as u32,
            subslices_per_slice: b.get_u16_le() as u32,
            eus_per_subslice: b.get_u16_le() as u32,
            threads_per_eu: b.get_u16_le() as u32,
        };
        let state_area_offset = b.get_u32_le();
        let state_save_size = b.get_u32_le();
        // slm area offset, slm bank size, slm bank valid
        b.advance(12);
        let sr_magic_offset = b.get_u32_le();

        let regsets = REGSET_ORDER
            .iter()
            .filter_map(|kind| {
                let desc = RegsetDesc {
                    offset: b.get_u32_le(),
                    num: b.get_u16_le(),
                    bits: b.get_u16_le(),
                    bytes: b.get_u16_le(),
                };
                // sets absent on this platform have no registers
                kind.filter(|_| desc.num > 0).map(|kind| (kind, desc))
            })
            .collect();

        Ok(Self {
            version,
            size,
            layout,
            state_area_offset,
            state_save_size,
            sr_magic_offset,
            regsets,
        })
    }

    /// Serialize header, inverse of [`StateSaveAreaHeader::parse`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SSA_HEADER_SIZE);
        let mut magic = [0u8; 8];
        magic[..SSA_MAGIC.len()].copy_from_slice(SSA_MAGIC.as_bytes());
        buf.put_slice(&magic);
        buf.put_u64_le(0);
        buf.put_u8(self.version.0);
        buf.put_u8(self.version.1);
        buf.put_u8(self.version.2);
        buf.put_u8(self.size);
        buf.put_u32_le(0);

        buf.put_u16_le(self.layout.slices as u16);
        buf.put_u16_le(self.layout.subslices_per_slice as u16);
        buf.put_u16_le(self.layout.eus_per_subslice as u16);
        buf.put_u16_le(self.layout.threads_per_eu as u16);
        buf.put_u32_le(self.state_area_offset);
        buf.put_u32_le(self.state_save_size);
        buf.put_bytes(0, 12);
        buf.put_u32_le(self.sr_magic_offset);

        for kind in REGSET_ORDER {
            let desc = kind.and_then(|k| self.regset(k)).unwrap_or_default();
            buf.put_u32_le(desc.offset);
            buf.put_u16_le(desc.num);
            buf.put_u16_le(desc.bits);
            buf.put_u16_le(desc.bytes);
        }
        buf
    }

    pub fn regset(&self, kind: RegisterType) -> Option<RegsetDesc> {
        if kind == RegisterType::Sba {
            return Some(SBA_REGSET);
        }
        self.regsets
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, desc)| *desc)
    }

    /// Offset of thread context from state save area begin.
    pub fn thread_slot_offset(&self, id: &EuThreadId) -> u64 {
        self.size as u64 * 8
            + self.state_area_offset as u64
            + self.layout.thread_index(id) as u64 * self.state_save_size as u64
    }

    /// Offset of system routine ident of a thread from state save area begin.
    pub fn sr_ident_offset(&self, id: &EuThreadId) -> u64 {
        self.thread_slot_offset(id) + self.sr_magic_offset as u64
    }
}

/// Parse system routine ident, return its counter.
pub fn parse_sr_ident(bytes: &[u8]) -> Result<u8, Error> {
    if bytes.len() < SR_IDENT_SIZE || !c_str_eq(&bytes[..8], SR_MAGIC) {
        return Err(Error::Magic("system routine ident"));
    }
    Ok(bytes[8])
}

/// Serialize system routine ident with `counter`.
pub fn sr_ident_bytes(counter: u8) -> [u8; SR_IDENT_SIZE] {
    let mut ident = [0u8; SR_IDENT_SIZE];
    ident[..SR_MAGIC.len()].copy_from_slice(SR_MAGIC.as_bytes());
    ident[8] = counter;
    ident
}
