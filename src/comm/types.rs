//! Communication-layer constants and shared types.
//!
//! Everything a peer must agree on lives here: the active-message opcodes,
//! the payload limits, and the layout of the static region that every locale
//! maps at the same base address.

use crate::types::RemoteAddr;
use serde::{Deserialize, Serialize};

// =============================================================================
// ACTIVE MESSAGE OPCODES
// =============================================================================
// Carried as the first byte of every AM frame. The numbering starts above the
// range reserved by common substrates for their own handlers.

/// Asynchronous remote task spawn. No completion ack.
pub const AM_FORK_NB: u8 = 128;

/// Synchronous remote task spawn; the receiver signals back when done.
pub const AM_FORK: u8 = 129;

/// Completion ack for a synchronous fork (or the shutdown release).
pub const AM_SIGNAL: u8 = 130;

/// Inline put into the receiver's memory; used by the private broadcast.
pub const AM_PUTDATA: u8 = 131;

/// Synchronous fork whose argument is too big to inline; the frame carries
/// one address in the caller's space and the receiver pulls the argument.
pub const AM_FORK_LARGE: u8 = 132;

// =============================================================================
// PAYLOAD LIMITS
// =============================================================================

/// Default medium-AM payload limit for the loopback substrate.
/// Real substrates report their own limit; the fork engine only ever asks the
/// endpoint, never this constant.
pub const DEFAULT_MAX_AM_MEDIUM: usize = 1024;

/// Hard upper bound accepted by the wire codec regardless of the configured
/// medium limit. Rejecting at decode time keeps a corrupt length prefix from
/// turning into an allocation.
pub const MAX_AM_PAYLOAD: usize = 64 * 1024;

/// Worst-case encoded size of a fork frame minus its argument bytes: opcode,
/// caller, optional ack handle, serial flag, function id, argument size and
/// the argument length prefix, all varint-encoded. The real worst case is
/// 33 bytes; the slack absorbs future field growth. `message` has a unit
/// test holding this bound.
pub const FORK_WIRE_OVERHEAD: usize = 40;

// =============================================================================
// ADDRESS SPACE LAYOUT
// =============================================================================
// Each locale's addressable space has two windows. The segment window is
// present only when the substrate provides symmetric segments; its per-locale
// base comes from the segment table. The static region is always present, at
// the same base and with the same layout on every locale. That symmetry is a
// deployment requirement: the private broadcast writes "the same address" on
// every peer and only works because the layout matches.

/// Base of the per-locale segment windows. Locale i's segment starts at
/// `SEGMENT_BASE + i * SEGMENT_STRIDE`.
pub const SEGMENT_BASE: u64 = 0x1_0000_0000;

/// Spacing between segment bases; also the maximum segment size.
pub const SEGMENT_STRIDE: u64 = 0x1000_0000;

/// Default segment size for the loopback substrate.
pub const DEFAULT_SEGMENT_SIZE: usize = 1024 * 1024;

/// Base of the static region, identical on every locale.
pub const STATIC_BASE: u64 = 0x5000_0000;

/// Static region size.
pub const STATIC_SIZE: usize = 64 * 1024;

/// The verbose-comm flag word, a 32-bit little-endian int.
pub const VERBOSE_FLAG_ADDR: RemoteAddr = RemoteAddr(STATIC_BASE);

/// The comm-diagnostics flag word.
pub const DIAG_FLAG_ADDR: RemoteAddr = RemoteAddr(STATIC_BASE + 4);

/// Width of a broadcastable flag word.
pub const FLAG_BYTES: usize = 4;

/// Start of the static global-variable registry, the fallback used when the
/// substrate provides no segments.
pub const STATIC_REGISTRY_ADDR: RemoteAddr = RemoteAddr(STATIC_BASE + 64);

/// Capacity of the static registry, in 8-byte slots.
pub const MAX_STATIC_GLOBALS: u32 = 256;

/// Scratch area available to user code at the same address everywhere.
pub const STATIC_USER_ADDR: RemoteAddr =
    RemoteAddr(STATIC_REGISTRY_ADDR.0 + MAX_STATIC_GLOBALS as u64 * 8);

/// Scratch area size.
pub const STATIC_USER_SIZE: usize = 4096;

/// Staging pool for oversized fork arguments when no shared heap exists.
pub const STATIC_POOL_ADDR: RemoteAddr =
    RemoteAddr(STATIC_USER_ADDR.0 + STATIC_USER_SIZE as u64);

/// End of the staging pool (exclusive).
pub const STATIC_POOL_END: u64 = STATIC_BASE + STATIC_SIZE as u64;

// =============================================================================
// SHARED TYPES
// =============================================================================

/// One locale's symmetric segment as published to every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub base: RemoteAddr,
    pub size: usize,
}

impl SegmentInfo {
    pub fn end(&self) -> u64 {
        self.base.0 + self.size as u64
    }

    pub fn contains(&self, addr: RemoteAddr, len: usize) -> bool {
        addr.0 >= self.base.0 && addr.0 + len as u64 <= self.end()
    }
}

/// How the endpoint should wait for network events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Sleep until woken. The runtime always selects this at init.
    #[default]
    Block,
    /// Spin on the queues. Loopback treats this the same as `Block`.
    Poll,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_layout_is_disjoint() {
        assert!(DIAG_FLAG_ADDR.0 + FLAG_BYTES as u64 <= STATIC_REGISTRY_ADDR.0);
        assert!(STATIC_REGISTRY_ADDR.0 + MAX_STATIC_GLOBALS as u64 * 8 <= STATIC_USER_ADDR.0);
        assert!(STATIC_USER_ADDR.0 + STATIC_USER_SIZE as u64 <= STATIC_POOL_ADDR.0);
        assert!(STATIC_POOL_ADDR.0 < STATIC_POOL_END);
        assert_eq!(STATIC_POOL_END, STATIC_BASE + STATIC_SIZE as u64);
    }

    #[test]
    fn static_region_below_segments() {
        assert!(STATIC_POOL_END <= SEGMENT_BASE);
        assert!(DEFAULT_SEGMENT_SIZE as u64 <= SEGMENT_STRIDE);
    }

    #[test]
    fn segment_contains() {
        let seg = SegmentInfo { base: RemoteAddr(0x1000), size: 0x100 };
        assert!(seg.contains(RemoteAddr(0x1000), 0x100));
        assert!(seg.contains(RemoteAddr(0x10ff), 1));
        assert!(!seg.contains(RemoteAddr(0x10ff), 2));
        assert!(!seg.contains(RemoteAddr(0xfff), 1));
    }
}
