//! The memory plane: addressable regions, the shared heap, and the global
//! variable registry.
//!
//! Each locale's address space has two windows. The segment window exists
//! when the substrate provides symmetric segments and hosts the registry
//! prefix plus the shared heap. The static region always exists at the same
//! base and layout on every locale; it hosts the broadcastable flag words,
//! the fallback registry, a user scratch area, and the staging pool used for
//! oversized fork arguments when there is no shared heap.

use super::runtime::CommError;
use super::substrate::SubstrateError;
use super::types::{
    SegmentInfo, MAX_STATIC_GLOBALS, STATIC_BASE, STATIC_POOL_ADDR, STATIC_POOL_END,
    STATIC_REGISTRY_ADDR, STATIC_SIZE,
};
use crate::types::{LocaleId, RemoteAddr};
use std::sync::{Arc, Mutex};

/// Width of one registry slot.
const SLOT_BYTES: u64 = 8;

/// A contiguous addressable window of one locale's memory.
pub struct MemRegion {
    base: u64,
    data: Mutex<Box<[u8]>>,
}

impl MemRegion {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.data.lock().expect("region lock poisoned").len()
    }

    fn contains(&self, addr: RemoteAddr, len: usize) -> bool {
        let size = self.data.lock().expect("region lock poisoned").len();
        addr.0 >= self.base && addr.0 + len as u64 <= self.base + size as u64
    }

    fn read(&self, addr: RemoteAddr, dst: &mut [u8]) {
        let data = self.data.lock().expect("region lock poisoned");
        let off = (addr.0 - self.base) as usize;
        dst.copy_from_slice(&data[off..off + dst.len()]);
    }

    fn write(&self, addr: RemoteAddr, src: &[u8]) {
        let mut data = self.data.lock().expect("region lock poisoned");
        let off = (addr.0 - self.base) as usize;
        data[off..off + src.len()].copy_from_slice(src);
    }
}

/// One locale's addressable memory: the optional segment plus the static
/// region. Shared between the owning runtime (local access) and the fabric
/// (remote one-sided access), so all accesses go through region locks.
pub struct LocaleMemory {
    locale: LocaleId,
    segment: Option<MemRegion>,
    static_region: MemRegion,
}

impl LocaleMemory {
    pub fn new(locale: LocaleId, segment: Option<MemRegion>) -> Self {
        Self {
            locale,
            segment,
            static_region: MemRegion::new(STATIC_BASE, STATIC_SIZE),
        }
    }

    pub fn locale(&self) -> LocaleId {
        self.locale
    }

    pub fn segment_base(&self) -> Option<RemoteAddr> {
        self.segment.as_ref().map(|s| RemoteAddr(s.base()))
    }

    fn region_for(&self, addr: RemoteAddr, len: usize) -> Result<&MemRegion, SubstrateError> {
        if self.static_region.contains(addr, len) {
            return Ok(&self.static_region);
        }
        if let Some(seg) = &self.segment {
            if seg.contains(addr, len) {
                return Ok(seg);
            }
        }
        Err(SubstrateError::AddressOutOfRange {
            locale: self.locale,
            addr,
            len,
        })
    }

    pub fn read(&self, addr: RemoteAddr, dst: &mut [u8]) -> Result<(), SubstrateError> {
        if dst.is_empty() {
            return Ok(());
        }
        self.region_for(addr, dst.len())?.read(addr, dst);
        Ok(())
    }

    pub fn write(&self, addr: RemoteAddr, src: &[u8]) -> Result<(), SubstrateError> {
        if src.is_empty() {
            return Ok(());
        }
        self.region_for(addr, src.len())?.write(addr, src);
        Ok(())
    }

    pub fn read_u32(&self, addr: RemoteAddr) -> Result<u32, SubstrateError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, addr: RemoteAddr, value: u32) -> Result<(), SubstrateError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_addr(&self, addr: RemoteAddr) -> Result<RemoteAddr, SubstrateError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(RemoteAddr(u64::from_le_bytes(buf)))
    }

    pub fn write_addr(&self, addr: RemoteAddr, value: RemoteAddr) -> Result<(), SubstrateError> {
        self.write(addr, &value.0.to_le_bytes())
    }
}

/// The allocator interface the shared heap is handed to. External to the
/// communication layer proper; [`BumpHeap`] is the default implementation.
pub trait HeapAllocator: Send + Sync {
    /// (Re)initialize over the given region, or over nothing.
    fn init(&self, region: Option<(RemoteAddr, usize)>);

    fn alloc(&self, size: usize) -> Option<RemoteAddr>;

    fn free(&self, addr: RemoteAddr, size: usize);
}

#[derive(Default)]
struct BumpState {
    start: u64,
    end: u64,
    next: u64,
    live: u32,
}

/// Epoch-resetting bump allocator: allocations bump a cursor, and the cursor
/// rewinds once every outstanding allocation has been freed.
#[derive(Default)]
pub struct BumpHeap {
    state: Mutex<BumpState>,
}

impl BumpHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(start: RemoteAddr, size: usize) -> Self {
        let heap = Self::new();
        heap.init(Some((start, size)));
        heap
    }
}

impl HeapAllocator for BumpHeap {
    fn init(&self, region: Option<(RemoteAddr, usize)>) {
        let mut state = self.state.lock().expect("heap lock poisoned");
        *state = match region {
            Some((start, size)) => BumpState {
                start: start.0,
                end: start.0 + size as u64,
                next: start.0,
                live: 0,
            },
            None => BumpState::default(),
        };
    }

    fn alloc(&self, size: usize) -> Option<RemoteAddr> {
        let mut state = self.state.lock().expect("heap lock poisoned");
        if state.end == 0 {
            return None;
        }
        let addr = state.next.next_multiple_of(SLOT_BYTES);
        if addr + size as u64 > state.end {
            return None;
        }
        state.next = addr + size as u64;
        state.live += 1;
        Some(RemoteAddr(addr))
    }

    fn free(&self, _addr: RemoteAddr, _size: usize) {
        let mut state = self.state.lock().expect("heap lock poisoned");
        state.live = state.live.saturating_sub(1);
        if state.live == 0 {
            state.next = state.start;
        }
    }
}

/// Global-variable registry location and length, fixed by `alloc_registry`.
struct RegistryState {
    base: Option<RemoteAddr>,
    count: u32,
}

/// Per-locale view of the memory plane.
pub struct MemoryPlane {
    local: Arc<LocaleMemory>,
    segments: Option<Arc<[SegmentInfo]>>,
    heap: Arc<dyn HeapAllocator>,
    static_pool: BumpHeap,
    registry: Mutex<RegistryState>,
}

impl MemoryPlane {
    pub fn new(
        local: Arc<LocaleMemory>,
        segments: Option<Arc<[SegmentInfo]>>,
        heap: Arc<dyn HeapAllocator>,
    ) -> Self {
        let pool_size = (STATIC_POOL_END - STATIC_POOL_ADDR.0) as usize;
        Self {
            local,
            segments,
            heap,
            static_pool: BumpHeap::with_region(STATIC_POOL_ADDR, pool_size),
            registry: Mutex::new(RegistryState { base: None, count: 0 }),
        }
    }

    pub fn local(&self) -> &Arc<LocaleMemory> {
        &self.local
    }

    pub fn has_segments(&self) -> bool {
        self.segments.is_some()
    }

    pub fn segments(&self) -> Option<&Arc<[SegmentInfo]>> {
        self.segments.as_ref()
    }

    /// Hand the segment beyond the registry prefix to the heap allocator, or
    /// nothing at all when segments are unavailable.
    pub fn init_shared_heap(&self, num_globals: u32) -> Result<(), CommError> {
        match self.local.segment_base() {
            Some(base) => {
                let seg_size = self
                    .segments
                    .as_ref()
                    .and_then(|segs| segs.get(self.local.locale() as usize))
                    .map(|s| s.size)
                    .unwrap_or(0);
                let prefix = num_globals as u64 * SLOT_BYTES;
                if prefix > seg_size as u64 {
                    return Err(CommError::RegistryOverflow {
                        requested: num_globals,
                        capacity: (seg_size as u64 / SLOT_BYTES) as u32,
                    });
                }
                self.heap
                    .init(Some((base.offset(prefix), seg_size - prefix as usize)));
            }
            None => self.heap.init(None),
        }
        Ok(())
    }

    /// Fix the registry location: the segment base when segments exist, the
    /// static table otherwise, null when there are no globals.
    pub fn alloc_registry(&self, num_globals: u32) -> Result<(), CommError> {
        let base = if num_globals == 0 {
            None
        } else if let Some(seg_base) = self.local.segment_base() {
            Some(seg_base)
        } else {
            if num_globals > MAX_STATIC_GLOBALS {
                return Err(CommError::RegistryOverflow {
                    requested: num_globals,
                    capacity: MAX_STATIC_GLOBALS,
                });
            }
            Some(STATIC_REGISTRY_ADDR)
        };
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.base = base;
        registry.count = num_globals;
        Ok(())
    }

    pub fn registry_base(&self) -> Option<RemoteAddr> {
        self.registry.lock().expect("registry lock poisoned").base
    }

    pub fn num_globals(&self) -> u32 {
        self.registry.lock().expect("registry lock poisoned").count
    }

    /// Address of local registry slot `index`.
    pub fn registry_slot(&self, index: u32) -> Result<RemoteAddr, CommError> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        let base = registry.base.ok_or(CommError::RegistryUnallocated)?;
        if index >= registry.count {
            return Err(CommError::GlobalOutOfRange {
                index,
                count: registry.count,
            });
        }
        Ok(base.offset(index as u64 * SLOT_BYTES))
    }

    /// Address of slot `index` in locale 0's registry, as seen from here.
    pub fn registry_slot_on_root(&self, index: u32) -> Result<RemoteAddr, CommError> {
        let count = self.num_globals();
        if index >= count {
            return Err(CommError::GlobalOutOfRange { index, count });
        }
        let base = match self.segments.as_ref().and_then(|segs| segs.first()) {
            Some(root) => root.base,
            None => STATIC_REGISTRY_ADDR,
        };
        Ok(base.offset(index as u64 * SLOT_BYTES))
    }

    pub fn set_global(&self, index: u32, value: RemoteAddr) -> Result<(), CommError> {
        let slot = self.registry_slot(index)?;
        self.local
            .write_addr(slot, value)
            .map_err(|e| CommError::Substrate { call: "registry slot write", source: e })
    }

    pub fn global(&self, index: u32) -> Result<RemoteAddr, CommError> {
        let slot = self.registry_slot(index)?;
        self.local
            .read_addr(slot)
            .map_err(|e| CommError::Substrate { call: "registry slot read", source: e })
    }

    pub fn heap_alloc(&self, size: usize) -> Result<RemoteAddr, CommError> {
        self.heap
            .alloc(size)
            .ok_or(CommError::HeapExhausted { size })
    }

    pub fn heap_free(&self, addr: RemoteAddr, size: usize) {
        self.heap.free(addr, size);
    }

    /// Caller-addressable scratch for an oversized fork argument: shared heap
    /// when segments exist, static staging pool otherwise.
    pub fn alloc_staging(&self, size: usize) -> Result<RemoteAddr, CommError> {
        if self.has_segments() {
            self.heap_alloc(size)
        } else {
            self.static_pool
                .alloc(size)
                .ok_or(CommError::HeapExhausted { size })
        }
    }

    pub fn free_staging(&self, addr: RemoteAddr, size: usize) {
        if self.has_segments() {
            self.heap.free(addr, size);
        } else {
            self.static_pool.free(addr, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::types::{SEGMENT_BASE, STATIC_USER_ADDR};

    fn segmented_plane() -> MemoryPlane {
        let seg = MemRegion::new(SEGMENT_BASE, 4096);
        let segs: Arc<[SegmentInfo]> =
            vec![SegmentInfo { base: RemoteAddr(SEGMENT_BASE), size: 4096 }].into();
        MemoryPlane::new(
            Arc::new(LocaleMemory::new(0, Some(seg))),
            Some(segs),
            Arc::new(BumpHeap::new()),
        )
    }

    fn static_plane() -> MemoryPlane {
        MemoryPlane::new(
            Arc::new(LocaleMemory::new(0, None)),
            None,
            Arc::new(BumpHeap::new()),
        )
    }

    #[test]
    fn test_region_roundtrip_and_bounds() {
        let mem = LocaleMemory::new(0, Some(MemRegion::new(SEGMENT_BASE, 64)));
        mem.write(RemoteAddr(SEGMENT_BASE + 8), &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        mem.read(RemoteAddr(SEGMENT_BASE + 8), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        let err = mem.write(RemoteAddr(SEGMENT_BASE + 62), &[0; 4]).unwrap_err();
        assert!(matches!(err, SubstrateError::AddressOutOfRange { .. }));
        let err = mem.read(RemoteAddr(0x10), &mut buf).unwrap_err();
        assert!(matches!(err, SubstrateError::AddressOutOfRange { .. }));
    }

    #[test]
    fn test_static_region_always_addressable() {
        let mem = LocaleMemory::new(3, None);
        mem.write_u32(STATIC_USER_ADDR, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(STATIC_USER_ADDR).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_bump_heap_alloc_free_reset() {
        let heap = BumpHeap::with_region(RemoteAddr(0x100), 64);
        let a = heap.alloc(24).unwrap();
        let b = heap.alloc(24).unwrap();
        assert_eq!(a, RemoteAddr(0x100));
        assert_eq!(b, RemoteAddr(0x118));
        assert!(heap.alloc(24).is_none());

        heap.free(a, 24);
        heap.free(b, 24);
        // All freed, cursor rewinds.
        assert_eq!(heap.alloc(24).unwrap(), RemoteAddr(0x100));
    }

    #[test]
    fn test_uninitialized_heap_refuses() {
        let heap = BumpHeap::new();
        assert!(heap.alloc(8).is_none());
    }

    #[test]
    fn test_shared_heap_starts_after_registry_prefix() {
        let plane = segmented_plane();
        plane.init_shared_heap(4).unwrap();
        plane.alloc_registry(4).unwrap();
        let addr = plane.heap_alloc(16).unwrap();
        assert!(addr.0 >= SEGMENT_BASE + 32);
        assert_eq!(plane.registry_slot(0).unwrap(), RemoteAddr(SEGMENT_BASE));
        assert_eq!(plane.registry_slot(3).unwrap(), RemoteAddr(SEGMENT_BASE + 24));
    }

    #[test]
    fn test_registry_null_when_empty() {
        let plane = segmented_plane();
        plane.alloc_registry(0).unwrap();
        assert!(plane.registry_base().is_none());
        assert!(matches!(plane.registry_slot(0), Err(CommError::RegistryUnallocated)));
    }

    #[test]
    fn test_static_registry_fallback() {
        let plane = static_plane();
        plane.init_shared_heap(2).unwrap();
        plane.alloc_registry(2).unwrap();
        assert_eq!(plane.registry_base(), Some(STATIC_REGISTRY_ADDR));
        // No shared heap in this mode, but staging still works.
        assert!(matches!(plane.heap_alloc(8), Err(CommError::HeapExhausted { .. })));
        let staged = plane.alloc_staging(128).unwrap();
        assert_eq!(staged, STATIC_POOL_ADDR);
        plane.free_staging(staged, 128);
    }

    #[test]
    fn test_global_slots_roundtrip() {
        let plane = segmented_plane();
        plane.init_shared_heap(2).unwrap();
        plane.alloc_registry(2).unwrap();
        plane.set_global(1, RemoteAddr(0xabcd)).unwrap();
        assert_eq!(plane.global(1).unwrap(), RemoteAddr(0xabcd));
        assert!(matches!(
            plane.set_global(2, RemoteAddr::NULL),
            Err(CommError::GlobalOutOfRange { .. })
        ));
    }
}
