//! Kernel event acknowledgment bookkeeping.

use crate::debugger::api::ApiEvent;
use crate::debugger::event::AckRef;
use crate::debugger::proto;
use serde::Deserialize;
use strum_macros::{Display, EnumString};

/// When NEED_ACK kernel events are acknowledged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Auto acknowledge once load condition is met, except the event completing a module.
    Cpu,
    /// Defer every bind acknowledgment until client acknowledges module event.
    Fence,
}

impl AckMode {
    /// Mode implied by kernel debug protocol version.
    pub fn from_version(version: u32) -> Self {
        if version >= proto::DEBUG_VERSION_BLOCK_ON_FENCE {
            AckMode::Fence
        } else {
            AckMode::Cpu
        }
    }

    pub fn is_fence(self) -> bool {
        self == AckMode::Fence
    }
}

/// Api event waiting for client acknowledgment together with the kernel event it holds.
#[derive(Clone, Debug)]
pub struct EventToAck {
    /// Tile that event was generated for, `None` for root queue.
    pub tile: Option<u32>,
    pub event: ApiEvent,
    pub kernel_event: AckRef,
}

/// Kernel events held by api events that are not tracked by a module resource.
#[derive(Default, Debug)]
pub struct PendingAcks {
    events: Vec<EventToAck>,
}

impl PendingAcks {
    pub fn push(&mut self, tile: Option<u32>, event: ApiEvent, kernel_event: AckRef) {
        self.events.push(EventToAck {
            tile,
            event,
            kernel_event,
        });
    }

    /// Remove entry of `tile` with exactly matching api event, return held kernel event.
    pub fn take(&mut self, tile: Option<u32>, event: &ApiEvent) -> Option<AckRef> {
        let idx = self
            .events
            .iter()
            .position(|e| e.tile == tile && e.event == *event)?;
        Some(self.events.remove(idx).kernel_event)
    }

    /// Remove every entry generated for `tile`.
    pub fn take_tile(&mut self, tile: u32) -> Vec<AckRef> {
        let (taken, kept) = std::mem::take(&mut self.events)
            .into_iter()
            .partition::<Vec<_>, _>(|e| e.tile == Some(tile));
        self.events = kept;
        taken.into_iter().map(|e| e.kernel_event).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
