//! Fixed-stride ring allocator backed by host shared memory.
//!
//! The whole allocator lives in one segment: header, ring state, per-slot
//! reference counts, then the item bytes. Peers attach by segment id and
//! operate on the same words; every offset handed out is relative to the
//! header, so it means the same thing in every process.

use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use shared::constants::alloc_segment_name;
use shared::domain::{DeviceType, DomainId, Strategy};
use shared::errors::AllocError;
use shared::layout::CpuRingLayout;

use crate::allocator::ring::RingCtl;
use crate::shmem::{self, ShmemSegment};

pub struct CpuRingAllocator {
    seg: ShmemSegment,
}

impl CpuRingAllocator {
    /// Create a fresh ring: `ring_size` slots of `item_size` bytes each.
    /// The `len` argument of later `allocate` calls is checked against
    /// `item_size` but does not change the stride.
    pub fn create(prefix: &str, item_size: usize, ring_size: usize) -> Result<Self, AllocError> {
        debug_assert!(item_size > 0 && ring_size > 0);
        let total = CpuRingLayout::segment_size(item_size, ring_size);
        let (id, seg) = shmem::create_unique(|id| alloc_segment_name(prefix, id), total)?;

        let alloc = CpuRingAllocator { seg };
        // Fresh segments are zero-filled; only the non-zero fields need
        // explicit stores before the id becomes visible to any peer.
        unsafe {
            let base = alloc.seg.as_ptr();
            let hdr = base as *mut shared::layout::AllocatorHeader;
            (*hdr).shmem_id = id;
            (*hdr).strategy = Strategy::Ring as u32;
            (*hdr).device_type = DeviceType::Cpu as u32;
            (*hdr).device_number = 0;
            let ring = base.add(shared::layout::AllocatorHeader::SIZE)
                as *mut shared::layout::RingState;
            (*ring).item_size = item_size as u32;
            (*ring).ring_size = ring_size as u32;
        }
        alloc.layout().ring.attached.store(1, Ordering::Release);
        debug!("cpu ring {id:#x}: {ring_size} x {item_size} bytes");
        Ok(alloc)
    }

    /// Wrap an already-attached segment. The dispatch layer has validated
    /// the `(strategy, device_type)` tags; this checks the size invariants
    /// before trusting anything past the header.
    pub(crate) fn from_segment(seg: ShmemSegment) -> Result<Self, AllocError> {
        // Validate before constructing Self: Drop decrements the attach
        // count, which only becomes ours after the checks pass.
        let id = unsafe { (*(seg.as_ptr() as *const shared::layout::AllocatorHeader)).shmem_id };
        if seg.len() < std::mem::size_of::<CpuRingLayout>() {
            return Err(AllocError::Truncated {
                shmem_id: id,
                need: std::mem::size_of::<CpuRingLayout>(),
                have: seg.len(),
            });
        }
        let (item_size, ring_size) = unsafe {
            let layout = &*(seg.as_ptr() as *const CpuRingLayout);
            (layout.ring.item_size, layout.ring.ring_size)
        };
        let need = CpuRingLayout::segment_size(item_size as usize, ring_size as usize);
        if seg.len() < need {
            return Err(AllocError::Truncated {
                shmem_id: id,
                need,
                have: seg.len(),
            });
        }
        let alloc = CpuRingAllocator { seg };
        alloc.layout().ring.attached.fetch_add(1, Ordering::AcqRel);
        Ok(alloc)
    }

    fn layout(&self) -> &CpuRingLayout {
        // SAFETY: the segment is at least segment_size() bytes (checked at
        // create/attach) and the layout is #[repr(C)] at offset 0.
        unsafe { &*(self.seg.as_ptr() as *const CpuRingLayout) }
    }

    fn ctl(&self) -> RingCtl<'_> {
        let layout = self.layout();
        let refs = unsafe { self.seg.as_ptr().add(CpuRingLayout::refs_offset()) };
        unsafe { RingCtl::new(&layout.ring, refs as *const AtomicU32) }
    }

    pub fn shmem_id(&self) -> u32 {
        self.layout().header.shmem_id
    }

    pub fn domain(&self) -> DomainId {
        self.layout().header.domain()
    }

    pub fn item_size(&self) -> usize {
        self.layout().ring.item_size as usize
    }

    pub fn ring_size(&self) -> usize {
        self.layout().ring.ring_size as usize
    }

    /// Offset of slot 0; allocations are `data_offset() + slot * item_size`.
    pub fn data_offset(&self) -> u32 {
        CpuRingLayout::data_offset(self.ring_size()) as u32
    }

    /// Claim the next slot. `len` only sanity-checks against the stride.
    pub fn allocate(&self, len: usize) -> Option<u32> {
        debug_assert!(len <= self.item_size());
        let slot = self.ctl().allocate()?;
        Some(self.data_offset() + slot * self.layout().ring.item_size)
    }

    pub fn share(&self, offset: u32) -> Result<(), AllocError> {
        let slot = self.slot_of(offset)?;
        self.ctl().share(slot);
        Ok(())
    }

    pub fn deallocate(&self, offset: u32) -> Result<(), AllocError> {
        let slot = self.slot_of(offset)?;
        self.ctl().deallocate(slot);
        Ok(())
    }

    /// Host pointer for an offset inside the data region.
    pub fn ptr(&self, offset: u32) -> Result<*mut u8, AllocError> {
        self.check_range(offset)?;
        Ok(unsafe { self.seg.as_ptr().add(offset as usize) })
    }

    pub fn copy_to(&self, dst_offset: u32, src: &[u8]) -> Result<(), AllocError> {
        self.check_payload(src.len())?;
        let dst = self.ptr(dst_offset)?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    pub fn copy_from(&self, src_offset: u32, dst: &mut [u8]) -> Result<(), AllocError> {
        self.check_payload(dst.len())?;
        let src = self.ptr(src_offset)?;
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> (u32, u32) {
        self.ctl().snapshot()
    }

    fn slot_of(&self, offset: u32) -> Result<u32, AllocError> {
        self.check_range(offset)?;
        let rel = offset - self.data_offset();
        let stride = self.layout().ring.item_size;
        debug_assert!(rel % stride == 0, "offset {offset} is not slot-aligned");
        Ok(rel / stride)
    }

    fn check_range(&self, offset: u32) -> Result<(), AllocError> {
        let data = self.data_offset();
        let end = data as usize + self.item_size() * self.ring_size();
        if (offset as usize) < data as usize || offset as usize >= end {
            return Err(AllocError::BadOffset {
                shmem_id: self.shmem_id(),
                offset,
            });
        }
        Ok(())
    }

    fn check_payload(&self, len: usize) -> Result<(), AllocError> {
        if len > self.item_size() {
            return Err(AllocError::PayloadTooLarge {
                shmem_id: self.shmem_id(),
                len,
                item_size: self.item_size(),
            });
        }
        Ok(())
    }
}

impl Drop for CpuRingAllocator {
    fn drop(&mut self) {
        if self.layout().ring.attached.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.seg.unlink();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> String {
        format!("hazcat-cpu-test-{}", std::process::id())
    }

    #[test]
    fn fills_in_ring_order_and_reports_no_space() {
        let a = CpuRingAllocator::create(&prefix(), 8, 3).unwrap();
        let h = a.data_offset();

        assert_eq!(a.allocate(8), Some(h));
        assert_eq!(a.snapshot(), (1, 0));
        assert_eq!(a.allocate(8), Some(h + 8));
        assert_eq!(a.snapshot(), (2, 0));
        assert_eq!(a.allocate(8), Some(h + 16));
        assert_eq!(a.snapshot(), (3, 0));

        // Full ring: NO_SPACE, nothing changes.
        assert_eq!(a.allocate(8), None);
        assert_eq!(a.snapshot(), (3, 0));
    }

    #[test]
    fn rear_sweep_reuses_slots_without_touching_survivors() {
        let a = CpuRingAllocator::create(&prefix(), 8, 3).unwrap();
        let h = a.data_offset();
        for (i, v) in [4.5f32, 2.25, 1.125].iter().enumerate() {
            let off = a.allocate(4).unwrap();
            assert_eq!(off, h + 8 * i as u32);
            a.copy_to(off, &v.to_ne_bytes()).unwrap();
        }

        a.deallocate(h).unwrap();
        a.deallocate(h + 8).unwrap();
        assert_eq!(a.snapshot(), (1, 2));

        // The freed front wraps around behind the survivor.
        assert_eq!(a.allocate(4), Some(h));
        assert_eq!(a.snapshot(), (2, 2));
        assert_eq!(a.allocate(4), Some(h + 8));
        assert_eq!(a.snapshot(), (3, 2));

        let mut buf = [0u8; 4];
        a.copy_from(h + 16, &mut buf).unwrap();
        assert_eq!(f32::from_ne_bytes(buf), 1.125);
    }

    #[test]
    fn non_rear_deallocation_is_deferred_until_the_rear_frees() {
        let a = CpuRingAllocator::create(&prefix(), 16, 4).unwrap();
        let h = a.data_offset();
        let o0 = a.allocate(16).unwrap();
        let o1 = a.allocate(16).unwrap();
        let o2 = a.allocate(16).unwrap();
        assert_eq!((o0, o1, o2), (h, h + 16, h + 32));

        // Middle slot dies first: the window cannot shrink around it.
        a.deallocate(o1).unwrap();
        assert_eq!(a.snapshot(), (3, 0));

        // Rear free sweeps the whole leading dead run (slots 0 and 1).
        a.deallocate(o0).unwrap();
        assert_eq!(a.snapshot(), (1, 2));
    }

    #[test]
    fn share_keeps_a_slot_alive_until_the_last_holder() {
        let a = CpuRingAllocator::create(&prefix(), 8, 2).unwrap();
        let off = a.allocate(8).unwrap();
        a.share(off).unwrap();

        a.deallocate(off).unwrap();
        assert_eq!(a.snapshot(), (1, 0), "one holder left, slot still live");
        a.deallocate(off).unwrap();
        assert_eq!(a.snapshot(), (0, 1));
    }

    #[test]
    fn allocate_deallocate_cycles_conserve_slots() {
        let a = CpuRingAllocator::create(&prefix(), 8, 5).unwrap();
        for _ in 0..23 {
            let off = a.allocate(8).unwrap();
            a.deallocate(off).unwrap();
        }
        assert_eq!(a.snapshot().0, 0);
    }

    #[test]
    fn peer_attachment_sees_the_same_ring() {
        let a = CpuRingAllocator::create(&prefix(), 8, 3).unwrap();
        let seg = ShmemSegment::attach(&alloc_segment_name(&prefix(), a.shmem_id())).unwrap();
        let b = CpuRingAllocator::from_segment(seg).unwrap();

        let off = a.allocate(8).unwrap();
        a.copy_to(off, &7u64.to_ne_bytes()).unwrap();

        let mut buf = [0u8; 8];
        b.copy_from(off, &mut buf).unwrap();
        assert_eq!(u64::from_ne_bytes(buf), 7);
        assert_eq!(b.snapshot(), (1, 0));
        b.deallocate(off).unwrap();
        assert_eq!(a.snapshot(), (0, 1));
    }

    #[test]
    fn out_of_range_offsets_are_rejected() {
        let a = CpuRingAllocator::create(&prefix(), 8, 2).unwrap();
        assert!(matches!(
            a.deallocate(4),
            Err(AllocError::BadOffset { .. })
        ));
        let end = a.data_offset() + 16;
        assert!(matches!(
            a.deallocate(end),
            Err(AllocError::BadOffset { .. })
        ));
    }
}
