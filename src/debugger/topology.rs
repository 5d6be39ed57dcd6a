//! Hardware facts the session relies on but does not discover by itself:
//! thread population, engine to tile mapping and GPU address canonical form.

use crate::debugger::event::EngineInstance;
use crate::debugger::thread::EuThreadId;
use bit_field::BitField;

/// EU thread population of a single tile.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwLayout {
    pub slices: u32,
    pub subslices_per_slice: u32,
    pub eus_per_subslice: u32,
    pub threads_per_eu: u32,
}

impl HwLayout {
    fn bytes_per_eu(&self) -> usize {
        (self.threads_per_eu as usize).div_ceil(8)
    }

    fn eu_index(&self, id: &EuThreadId) -> usize {
        let subslice = id.slice * self.subslices_per_slice + id.subslice;
        (subslice * self.eus_per_subslice + id.eu) as usize
    }

    /// Size of attention bitmask covering every thread of a tile.
    pub fn bitmask_size(&self) -> usize {
        (self.slices * self.subslices_per_slice * self.eus_per_subslice) as usize
            * self.bytes_per_eu()
    }

    /// True if id addresses an existing thread.
    pub fn contains(&self, id: &EuThreadId) -> bool {
        id.slice < self.slices
            && id.subslice < self.subslices_per_slice
            && id.eu < self.eus_per_subslice
            && id.thread < self.threads_per_eu
    }

    /// Linear index of a thread inside tile, used for state save area slots.
    pub fn thread_index(&self, id: &EuThreadId) -> usize {
        self.eu_index(id) * self.threads_per_eu as usize + id.thread as usize
    }

    /// Every thread of a tile selected by (possibly wildcard) `selector`.
    pub fn expand(&self, selector: &EuThreadId) -> Vec<EuThreadId> {
        let mut threads = vec![];
        for slice in 0..self.slices {
            for subslice in 0..self.subslices_per_slice {
                for eu in 0..self.eus_per_subslice {
                    for thread in 0..self.threads_per_eu {
                        let id = EuThreadId::new(selector.tile, slice, subslice, eu, thread);
                        if selector.matches(&id) {
                            threads.push(id);
                        }
                    }
                }
            }
        }
        threads
    }

    /// Decode threads set in attention `bitmask` of tile `tile`.
    pub fn threads_from_bitmask(&self, tile: u32, bitmask: &[u8]) -> Vec<EuThreadId> {
        let bytes_per_eu = self.bytes_per_eu();
        let mut threads = vec![];
        for slice in 0..self.slices {
            for subslice in 0..self.subslices_per_slice {
                for eu in 0..self.eus_per_subslice {
                    let base = EuThreadId::new(tile, slice, subslice, eu, 0);
                    let offset = self.eu_index(&base) * bytes_per_eu;
                    for byte in 0..bytes_per_eu {
                        let Some(bits) = bitmask.get(offset + byte) else {
                            return threads;
                        };
                        for bit in 0..8 {
                            let thread = (byte * 8 + bit) as u32;
                            if thread < self.threads_per_eu && bits.get_bit(bit) {
                                threads.push(EuThreadId { thread, ..base });
                            }
                        }
                    }
                }
            }
        }
        threads
    }

    /// Build attention bitmask with bits of `threads` set, wildcard ids are expanded.
    pub fn bitmask_for_threads(&self, threads: &[EuThreadId]) -> Vec<u8> {
        let bytes_per_eu = self.bytes_per_eu();
        let mut bitmask = vec![0u8; self.bitmask_size()];
        for selector in threads {
            for id in self.expand(selector) {
                let idx = self.eu_index(&id) * bytes_per_eu + id.thread as usize / 8;
                bitmask[idx].set_bit(id.thread as usize % 8, true);
            }
        }
        bitmask
    }
}

/// Workaround for hardware resuming only one thread of a pair: OR adjacent dwords.
pub fn apply_resume_workaround(bitmask: &mut [u8]) {
    let dwords = bitmask.len() / 4;
    let mut i = 0;
    while i + 1 < dwords {
        let dword = |at: usize| -> u32 {
            u32::from_le_bytes(bitmask[at..at + 4].try_into().unwrap_or_default())
        };
        let (lo, hi) = (dword(i * 4), dword(i * 4 + 4));
        let merged = (lo | hi).to_le_bytes();
        bitmask[i * 4..i * 4 + 4].copy_from_slice(&merged);
        bitmask[i * 4 + 4..i * 4 + 8].copy_from_slice(&merged);
        i += 2;
    }
}

/// Device facts provider.
pub trait Topology: Send + Sync {
    fn tile_count(&self) -> u32;

    fn layout(&self) -> HwLayout;

    /// Tile hosting engine.
    fn tile_for_engine(&self, engine: EngineInstance) -> u32;

    /// Engine addressed by EU control requests for tile.
    fn engine_for_tile(&self, tile: u32) -> EngineInstance;

    /// Sign extend GPU virtual address.
    fn canonize(&self, va: u64) -> u64;

    /// Strip sign extension of GPU virtual address.
    fn decanonize(&self, va: u64) -> u64;

    /// Resume requests must use [`apply_resume_workaround`].
    fn resume_workaround(&self) -> bool;
}

#[derive(Clone, Debug)]
pub struct DeviceTopology {
    tiles: u32,
    layout: HwLayout,
    va_bits: u32,
    engine_class: u16,
    engines_per_tile: u16,
    resume_workaround: bool,
}

impl DeviceTopology {
    /// Compute engine class.
    pub const ENGINE_CLASS_COMPUTE: u16 = 4;

    pub fn new(tiles: u32, layout: HwLayout) -> Self {
        Self {
            tiles: tiles.max(1),
            layout,
            va_bits: 48,
            engine_class: Self::ENGINE_CLASS_COMPUTE,
            engines_per_tile: 1,
            resume_workaround: false,
        }
    }

    pub fn with_resume_workaround(self, enabled: bool) -> Self {
        Self {
            resume_workaround: enabled,
            ..self
        }
    }

    pub fn with_engines_per_tile(self, engines: u16) -> Self {
        Self {
            engines_per_tile: engines.max(1),
            ..self
        }
    }

    pub fn with_va_bits(self, bits: u32) -> Self {
        Self {
            va_bits: bits.clamp(32, 64),
            ..self
        }
    }
}

impl Topology for DeviceTopology {
    fn tile_count(&self) -> u32 {
        self.tiles
    }

    fn layout(&self) -> HwLayout {
        self.layout
    }

    fn tile_for_engine(&self, engine: EngineInstance) -> u32 {
        let tile = (engine.instance / self.engines_per_tile) as u32;
        tile.min(self.tiles - 1)
    }

    fn engine_for_tile(&self, tile: u32) -> EngineInstance {
        EngineInstance {
            class: self.engine_class,
            instance: tile as u16 * self.engines_per_tile,
        }
    }

    fn canonize(&self, va: u64) -> u64 {
        if self.va_bits >= 64 {
            return va;
        }
        let shift = 64 - self.va_bits;
        (((va << shift) as i64) >> shift) as u64
    }

    fn decanonize(&self, va: u64) -> u64 {
        if self.va_bits >= 64 {
            return va;
        }
        va & ((1u64 << self.va_bits) - 1)
    }

    fn resume_workaround(&self) -> bool {
        self.resume_workaround
    }
}
