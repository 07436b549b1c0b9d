//! Core identifiers shared by every plane of the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One node of the distributed job. Locale 0 is the coordinator.
pub type LocaleId = u32;

/// An absolute address interpreted in some locale's address space.
///
/// Addresses are never translated in flight. Both ends agree on layout
/// because segments are allocated symmetrically and the static region sits
/// at the same base on every locale.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteAddr(pub u64);

impl RemoteAddr {
    pub const NULL: RemoteAddr = RemoteAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u64) -> RemoteAddr {
        RemoteAddr(self.0 + bytes)
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteAddr(0x{:x})", self.0)
    }
}

/// Index into the locale-local table of registered fork targets.
///
/// Every locale must register the same functions in the same order, so an id
/// minted on one locale names the same code on all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Key into a locale's pending-completion table.
///
/// Travels on the wire in place of a raw flag address; only the locale that
/// minted it can resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckHandle(pub u64);

impl fmt::Display for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ack#{}", self.0)
    }
}
