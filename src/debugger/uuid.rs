use crate::weak_error;
use once_cell::sync;
use regex::Regex;
use strum_macros::{Display, EnumIter};
use ::uuid::Uuid;

/// Semantic kind of a UUID resource, learned from well known class names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ResourceClass {
    #[strum(serialize = "elf")]
    Elf,
    #[strum(serialize = "isa")]
    Isa,
    #[strum(serialize = "module debug area")]
    ModuleDebugArea,
    #[strum(serialize = "context save area")]
    ContextSaveArea,
    #[strum(serialize = "sba tracking buffer")]
    SbaTrackingBuffer,
    #[strum(serialize = "zebin module")]
    ZebinModule,
}

/// Class name and its uuid string, as registered by the runtime at client create.
static CLASSES: &[(ResourceClass, &str, &str)] = &[
    (
        ResourceClass::Elf,
        "I915_UUID_CLASS_ELF_BINARY",
        "31203221-8069-5a0a-9d43-94a4d3395ee1",
    ),
    (
        ResourceClass::Isa,
        "I915_UUID_CLASS_ISA_BYTECODE",
        "53baed0a-12c3-5d19-aa69-ab9c51aa1039",
    ),
    (
        ResourceClass::ModuleDebugArea,
        "I915_UUID_L0_MODULE_AREA",
        "a411e82e-16c9-58b7-bfb5-b209b8601d5f",
    ),
    (
        ResourceClass::ContextSaveArea,
        "I915_UUID_L0_SIP_AREA",
        "21fd6baf-f918-53cc-ba74-f09aaaea2dc0",
    ),
    (
        ResourceClass::SbaTrackingBuffer,
        "I915_UUID_L0_SBA_AREA",
        "ec45189d-97d3-58e2-80d1-ab52c72fdcc1",
    ),
    (
        ResourceClass::ZebinModule,
        "L0_ZEBIN_MODULE",
        "88d347c1-c79b-530a-b68f-e0db7d575e04",
    ),
];

/// Uuid string of command queue creation notifications.
pub const COMMAND_QUEUE_UUID: &str = "285208b2-c5e0-5fcb-90bb-7576ed7a9697";

impl ResourceClass {
    /// Resolve class by its uuid string.
    pub fn from_uuid(uuid: &str) -> Option<Self> {
        CLASSES
            .iter()
            .find(|(_, _, class_uuid)| *class_uuid == uuid)
            .map(|(class, _, _)| *class)
    }

    pub fn class_name(self) -> &'static str {
        CLASSES
            .iter()
            .find(|(class, _, _)| *class == self)
            .map(|(_, name, _)| *name)
            .unwrap_or_default()
    }

    pub fn uuid(self) -> &'static str {
        CLASSES
            .iter()
            .find(|(class, _, _)| *class == self)
            .map(|(_, _, uuid)| *uuid)
            .unwrap_or_default()
    }

    /// Classes whose payload is a single GPU address of a special region.
    pub fn is_special_area(self) -> bool {
        matches!(
            self,
            ResourceClass::ModuleDebugArea
                | ResourceClass::ContextSaveArea
                | ResourceClass::SbaTrackingBuffer
        )
    }
}

/// Check that kernel reported uuid string is well formed.
pub fn is_well_formed(uuid: &str) -> bool {
    uuid.len() == 36 && Uuid::parse_str(uuid).is_ok()
}

/// Extract ELF virtual address encoded in the last two uuid groups.
///
/// Uuid strings of ELF resources look like "xxxxxxxx-xxxx-xxxx-HHHH-LLLLLLLLLLLL",
/// where `LLLLLLLLLLLL` are lower 48 bits of address and `HHHH` are upper 16 bits.
pub fn extract_va(uuid: &str) -> Option<u64> {
    static VA_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-([0-9a-fA-F]{4})-([0-9a-fA-F]{12})$")
            .expect("must compile")
    });

    let (_, [high, low]) = VA_RE.captures(uuid).map(|c| c.extract())?;
    let high = weak_error!(u64::from_str_radix(high, 16))?;
    let low = weak_error!(u64::from_str_radix(low, 16))?;
    Some(low | (high & 0xFFFF) << 48)
}

/// Build uuid string carrying `va`, inverse of [`extract_va`].
pub fn uuid_with_va(prefix: u64, va: u64) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (prefix >> 32) as u32,
        (prefix >> 16) as u16,
        prefix as u16,
        (va >> 48) as u16,
        va & 0xFFFF_FFFF_FFFF
    )
}
