use std::sync::atomic::{AtomicU32, Ordering};

/// Protocol traffic: every decoded kernel event and issued ioctl.
pub const INFO: u32 = 1 << 0;
/// Failures worth reporting even when nobody asked for traces.
pub const ERROR: u32 = 1 << 1;
/// Attention, interrupt and resume handling.
pub const THREADS: u32 = 1 << 2;
/// GPU memory and register access.
pub const MEM_ACCESS: u32 = 1 << 3;

static CHANNELS: AtomicU32 = AtomicU32::new(ERROR);

#[inline(always)]
pub fn is_enabled(channel: u32) -> bool {
    CHANNELS.load(Ordering::SeqCst) & channel != 0
}

/// Replace enabled channel set.
pub fn set_channels(mask: u32) {
    CHANNELS.store(mask, Ordering::SeqCst)
}

pub fn channels() -> u32 {
    CHANNELS.load(Ordering::SeqCst)
}

pub fn disable(channel: u32) {
    CHANNELS.fetch_and(!channel, Ordering::SeqCst);
}

pub fn enable(channel: u32) {
    CHANNELS.fetch_or(channel, Ordering::SeqCst);
}

#[macro_export]
macro_rules! eu_info {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::INFO) {
            ::log::info!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::INFO) {
            ::log::info!(target: "eudebug", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! eu_warn {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::ERROR) {
            ::log::warn!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::ERROR) {
            ::log::warn!(target: "eudebug", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! eu_error {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::ERROR) {
            ::log::error!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::ERROR) {
            ::log::error!(target: "eudebug", $($arg)+)
        }
    };
}

/// Thread control traces, gated by [`THREADS`] channel.
#[macro_export]
macro_rules! eu_threads {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::THREADS) {
            ::log::debug!(target: "eudebug::threads", $($arg)+)
        }
    };
}

/// Memory access traces, gated by [`MEM_ACCESS`] channel.
#[macro_export]
macro_rules! eu_mem {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::MEM_ACCESS) {
            ::log::debug!(target: "eudebug::mem", $($arg)+)
        }
    };
}
