use crate::debugger::thread::EuThreadStatus::{InterruptRequested, Running, Stopped};
use crate::eu_threads;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Hardware coordinate of an EU thread.
///
/// Any component except `tile` may be [`EuThreadId::ALL`], such id selects every thread
/// with matching remaining components.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EuThreadId {
    pub tile: u32,
    pub slice: u32,
    pub subslice: u32,
    pub eu: u32,
    pub thread: u32,
}

impl EuThreadId {
    pub const ALL: u32 = u32::MAX;

    pub fn new(tile: u32, slice: u32, subslice: u32, eu: u32, thread: u32) -> Self {
        Self {
            tile,
            slice,
            subslice,
            eu,
            thread,
        }
    }

    /// Every thread of the tile.
    pub fn all(tile: u32) -> Self {
        Self::new(tile, Self::ALL, Self::ALL, Self::ALL, Self::ALL)
    }

    pub fn is_all(&self) -> bool {
        self.slice == Self::ALL
            && self.subslice == Self::ALL
            && self.eu == Self::ALL
            && self.thread == Self::ALL
    }

    /// True if id addresses exactly one thread.
    pub fn is_single(&self) -> bool {
        self.slice != Self::ALL
            && self.subslice != Self::ALL
            && self.eu != Self::ALL
            && self.thread != Self::ALL
    }

    /// True if `other` is selected by this (possibly wildcard) id.
    pub fn matches(&self, other: &EuThreadId) -> bool {
        fn component(pattern: u32, value: u32) -> bool {
            pattern == EuThreadId::ALL || pattern == value
        }
        self.tile == other.tile
            && component(self.slice, other.slice)
            && component(self.subslice, other.subslice)
            && component(self.eu, other.eu)
            && component(self.thread, other.thread)
    }
}

impl Display for EuThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn component(v: u32) -> String {
            if v == EuThreadId::ALL {
                "*".to_string()
            } else {
                v.to_string()
            }
        }
        write!(
            f,
            "tile:{} slice:{} subslice:{} eu:{} thread:{}",
            self.tile,
            component(self.slice),
            component(self.subslice),
            component(self.eu),
            component(self.thread)
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EuThreadStatus {
    /// Thread executes (or was resumed).
    Running,
    /// Interrupt issued, stop not confirmed yet.
    InterruptRequested,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct EuThread {
    pub id: EuThreadId,
    pub status: EuThreadStatus,
    /// VM the thread stopped under.
    pub memory_handle: Option<u64>,
    pub page_fault: bool,
    /// Last observed system routine counter, odd while thread is inside system routine.
    sr_counter: u8,
}

impl EuThread {
    fn new(id: EuThreadId) -> Self {
        Self {
            id,
            status: Running,
            memory_handle: None,
            page_fault: false,
            sr_counter: 0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.status == Stopped
    }

    /// Mark thread stopped under VM `vm`. Return false if thread already stopped.
    pub fn stop(&mut self, vm: u64) -> bool {
        self.memory_handle = Some(vm);
        if self.status == Stopped {
            return false;
        }
        self.status = Stopped;
        true
    }

    /// Continue thread, resumed thread is indistinguishable from running one.
    pub fn resume(&mut self) {
        self.status = Running;
        self.memory_handle = None;
        self.page_fault = false;
    }

    pub fn request_interrupt(&mut self) {
        if self.status == Running {
            self.status = InterruptRequested;
        }
    }

    /// Update status from system routine counter. Return true if thread is stopped.
    pub fn verify_stopped(&mut self, counter: u8) -> bool {
        if counter > self.sr_counter.wrapping_add(2) && self.sr_counter != 0 {
            eu_threads!(
                "thread {}: system routine counter jumps from {} to {}",
                self.id,
                self.sr_counter,
                counter
            );
        }
        self.sr_counter = counter;
        let stopped = counter % 2 != 0;
        if !stopped {
            if self.status == Stopped {
                eu_threads!("thread {}: stopped, but counter says running", self.id);
            }
            self.status = Running;
        }
        stopped
    }
}

/// All EU threads seen by a session.
#[derive(Default)]
pub(super) struct Registry {
    threads: HashMap<EuThreadId, EuThread>,
}

impl Registry {
    pub(super) fn get(&self, id: &EuThreadId) -> Option<&EuThread> {
        self.threads.get(id)
    }

    /// Return thread, register it in `running` status if not seen yet.
    pub(super) fn get_or_insert(&mut self, id: EuThreadId) -> &mut EuThread {
        self.threads.entry(id).or_insert_with(|| EuThread::new(id))
    }

    pub(super) fn is_stopped(&self, id: &EuThreadId) -> bool {
        self.threads.get(id).map(|t| t.is_stopped()).unwrap_or(false)
    }

    /// Return stopped threads selected by `selector`.
    pub(super) fn stopped(&self, selector: &EuThreadId) -> Vec<EuThreadId> {
        let mut stopped: Vec<_> = self
            .threads
            .values()
            .filter(|t| t.is_stopped() && selector.matches(&t.id))
            .map(|t| t.id)
            .collect();
        stopped.sort();
        stopped
    }

    /// Continue selected threads.
    pub(super) fn resume(&mut self, ids: &[EuThreadId]) {
        for id in ids {
            if let Some(thread) = self.threads.get_mut(id) {
                thread.resume();
            }
        }
    }

    /// Forget all threads, used when debugged process is gone.
    pub(super) fn clear(&mut self) {
        self.threads.clear();
    }
}
