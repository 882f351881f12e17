//! Fixed-stride ring allocator whose item bytes live in a device address
//! space.
//!
//! Bookkeeping (header, ring state, slot refcounts, export record) sits in
//! a host segment exactly like the CPU ring; only the payload pool is
//! device memory, reached through a driver. Offsets handed out still count
//! from the header, pointing into a range where the host segment has no
//! bytes, so a device offset fed to the wrong allocator is caught by the
//! range checks.
//!
//! The emulated driver backs the "device" pool with a second host segment
//! behind the same driver interface: separate address space, allocation
//! granularity, explicit copies. It keeps every cross-domain code path
//! exercised on machines without an accelerator.

use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use shared::constants::{alloc_segment_name, device_pool_name};
use shared::domain::{DeviceType, DomainId, Strategy};
use shared::errors::AllocError;
use shared::layout::{align_up, AllocatorHeader, DeviceExport, DeviceRingLayout, ITEM_ALIGN};

use crate::allocator::ring::RingCtl;
use crate::shmem::{self, ShmemSegment};

/// Which device backs a new ring.
#[derive(Debug, Clone)]
pub enum DeviceKind {
    /// Host-backed stand-in with the given allocation granularity.
    Emulated { granularity: usize },
    #[cfg(feature = "cuda")]
    Cuda { ordinal: u16 },
}

pub(crate) enum DeviceDriverKind {
    Emulated(EmulatedDriver),
    #[cfg(feature = "cuda")]
    Cuda(super::cuda::CudaDriver),
}

impl DeviceDriverKind {
    fn copy_to(&self, rel: usize, src: &[u8]) -> Result<(), AllocError> {
        match self {
            DeviceDriverKind::Emulated(d) => d.copy_to(rel, src),
            #[cfg(feature = "cuda")]
            DeviceDriverKind::Cuda(d) => d.copy_to(rel, src),
        }
    }

    fn copy_from(&self, rel: usize, dst: &mut [u8]) -> Result<(), AllocError> {
        match self {
            DeviceDriverKind::Emulated(d) => d.copy_from(rel, dst),
            #[cfg(feature = "cuda")]
            DeviceDriverKind::Cuda(d) => d.copy_from(rel, dst),
        }
    }

    fn base_addr(&self) -> usize {
        match self {
            DeviceDriverKind::Emulated(d) => d.pool.as_ptr() as usize,
            #[cfg(feature = "cuda")]
            DeviceDriverKind::Cuda(d) => d.base_addr(),
        }
    }

    /// Host mapping of the pool, when the "device" is host-backed.
    fn host_view(&self) -> Option<(*mut u8, usize)> {
        match self {
            DeviceDriverKind::Emulated(d) => Some((d.pool.as_ptr(), d.pool_len)),
            #[cfg(feature = "cuda")]
            DeviceDriverKind::Cuda(_) => None,
        }
    }
}

pub(crate) struct EmulatedDriver {
    pool: ShmemSegment,
    pool_len: usize,
}

impl EmulatedDriver {
    fn check(&self, rel: usize, len: usize) -> Result<(), AllocError> {
        if rel + len > self.pool_len {
            return Err(AllocError::Device(format!(
                "emulated pool `{}`: range {rel}+{len} outside {} bytes",
                self.pool.name(),
                self.pool_len
            )));
        }
        Ok(())
    }

    fn copy_to(&self, rel: usize, src: &[u8]) -> Result<(), AllocError> {
        self.check(rel, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.pool.as_ptr().add(rel), src.len())
        };
        Ok(())
    }

    fn copy_from(&self, rel: usize, dst: &mut [u8]) -> Result<(), AllocError> {
        self.check(rel, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.pool.as_ptr().add(rel), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }
}

pub struct DeviceRingAllocator {
    seg: ShmemSegment,
    driver: DeviceDriverKind,
}

impl DeviceRingAllocator {
    /// Create a device-backed ring. The stride is padded to the copy
    /// alignment and the pool is rounded up to the device's allocation
    /// granularity, so the effective ring size may exceed the request.
    pub fn create(
        prefix: &str,
        item_size: usize,
        ring_size: usize,
        kind: DeviceKind,
    ) -> Result<Self, AllocError> {
        debug_assert!(item_size > 0 && ring_size > 0);
        let granularity = match &kind {
            DeviceKind::Emulated { granularity } => *granularity,
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda { ordinal } => super::cuda::CudaDriver::granularity(*ordinal)?,
        };
        let padded_item = align_up(item_size, ITEM_ALIGN);
        let pool_size = align_up(padded_item * ring_size, granularity);
        let eff_ring = pool_size / padded_item;
        debug_assert!(eff_ring >= ring_size);

        let total = DeviceRingLayout::segment_size(eff_ring);
        let (id, seg) = shmem::create_unique(|id| alloc_segment_name(prefix, id), total)?;

        let (driver, device_type, device_number, export) = match kind {
            DeviceKind::Emulated { .. } => {
                let pool = ShmemSegment::create(&device_pool_name(prefix, id), pool_size)?;
                let export = DeviceExport {
                    backing_id: id,
                    owner_pid: std::process::id(),
                    pool_size: pool_size as u64,
                    ipc_handle: [0; 64],
                };
                (
                    DeviceDriverKind::Emulated(EmulatedDriver {
                        pool,
                        pool_len: pool_size,
                    }),
                    DeviceType::Emulated,
                    0u16,
                    export,
                )
            }
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda { ordinal } => {
                let (driver, export) = super::cuda::CudaDriver::create(ordinal, pool_size)?;
                (DeviceDriverKind::Cuda(driver), DeviceType::Cuda, ordinal, export)
            }
        };

        let alloc = DeviceRingAllocator { seg, driver };
        unsafe {
            let base = alloc.seg.as_ptr();
            let hdr = base as *mut AllocatorHeader;
            (*hdr).shmem_id = id;
            (*hdr).strategy = Strategy::Ring as u32;
            (*hdr).device_type = device_type as u32;
            (*hdr).device_number = device_number as u32;
            let ring =
                base.add(AllocatorHeader::SIZE) as *mut shared::layout::RingState;
            (*ring).item_size = padded_item as u32;
            (*ring).ring_size = eff_ring as u32;
            let exp = base.add(AllocatorHeader::SIZE + shared::layout::RingState::SIZE)
                as *mut DeviceExport;
            exp.write(export);
        }
        alloc.layout().ring.attached.store(1, Ordering::Release);
        debug!(
            "device ring {id:#x} on {device_type}: {eff_ring} x {padded_item} bytes \
             (requested {ring_size} x {item_size}, granularity {granularity})"
        );
        Ok(alloc)
    }

    /// Wrap an attached segment, importing the pool through the export
    /// record left by the creator.
    pub(crate) fn from_segment(seg: ShmemSegment, prefix: &str) -> Result<Self, AllocError> {
        if seg.len() < std::mem::size_of::<DeviceRingLayout>() {
            let id = unsafe { (*(seg.as_ptr() as *const AllocatorHeader)).shmem_id };
            return Err(AllocError::Truncated {
                shmem_id: id,
                need: std::mem::size_of::<DeviceRingLayout>(),
                have: seg.len(),
            });
        }
        let (device_type, export) = {
            let layout = unsafe { &*(seg.as_ptr() as *const DeviceRingLayout) };
            let ty = DeviceType::try_from(layout.header.device_type).map_err(|raw| {
                AllocError::UnknownVariant {
                    shmem_id: layout.header.shmem_id,
                    strategy: layout.header.strategy,
                    device_type: raw,
                }
            })?;
            let export = unsafe { std::ptr::read(&layout.export as *const DeviceExport) };
            (ty, export)
        };
        let driver = match device_type {
            DeviceType::Emulated => {
                let pool = ShmemSegment::attach(&device_pool_name(prefix, export.backing_id))?;
                DeviceDriverKind::Emulated(EmulatedDriver {
                    pool,
                    pool_len: export.pool_size as usize,
                })
            }
            #[cfg(feature = "cuda")]
            DeviceType::Cuda => {
                let ordinal =
                    unsafe { (*(seg.as_ptr() as *const AllocatorHeader)).device_number as u16 };
                DeviceDriverKind::Cuda(super::cuda::CudaDriver::import(&export, ordinal)?)
            }
            other => {
                let hdr = unsafe { &*(seg.as_ptr() as *const AllocatorHeader) };
                return Err(AllocError::UnknownVariant {
                    shmem_id: hdr.shmem_id,
                    strategy: hdr.strategy,
                    device_type: other as u32,
                });
            }
        };
        // Validate before constructing Self: Drop decrements the attach
        // count, which only becomes ours after the checks pass.
        let (id, ring_size) = unsafe {
            let layout = &*(seg.as_ptr() as *const DeviceRingLayout);
            (layout.header.shmem_id, layout.ring.ring_size)
        };
        let need = DeviceRingLayout::segment_size(ring_size as usize);
        if seg.len() < need {
            return Err(AllocError::Truncated {
                shmem_id: id,
                need,
                have: seg.len(),
            });
        }
        let alloc = DeviceRingAllocator { seg, driver };
        alloc.layout().ring.attached.fetch_add(1, Ordering::AcqRel);
        Ok(alloc)
    }

    fn layout(&self) -> &DeviceRingLayout {
        // SAFETY: sized at create/attach, #[repr(C)] at offset 0.
        unsafe { &*(self.seg.as_ptr() as *const DeviceRingLayout) }
    }

    fn ctl(&self) -> RingCtl<'_> {
        let layout = self.layout();
        let refs = unsafe { self.seg.as_ptr().add(DeviceRingLayout::refs_offset()) };
        unsafe { RingCtl::new(&layout.ring, refs as *const AtomicU32) }
    }

    pub fn shmem_id(&self) -> u32 {
        self.layout().header.shmem_id
    }

    pub fn domain(&self) -> DomainId {
        self.layout().header.domain()
    }

    /// Padded stride, possibly larger than the `item_size` requested.
    pub fn item_size(&self) -> usize {
        self.layout().ring.item_size as usize
    }

    /// Effective capacity, possibly larger than the `ring_size` requested.
    pub fn ring_size(&self) -> usize {
        self.layout().ring.ring_size as usize
    }

    /// First device offset; allocations are `pool_offset() + slot * stride`.
    pub fn pool_offset(&self) -> u32 {
        DeviceRingLayout::pool_offset(self.ring_size()) as u32
    }

    pub fn allocate(&self, len: usize) -> Option<u32> {
        debug_assert!(len <= self.item_size());
        let slot = self.ctl().allocate()?;
        Some(self.pool_offset() + slot * self.layout().ring.item_size)
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

    /// DMA host memory into the pool.
    pub fn copy_to(&self, dst_offset: u32, src: &[u8]) -> Result<(), AllocError> {
        self.check_payload(src.len())?;
        self.driver.copy_to(self.rel(dst_offset)?, src)
    }

    /// DMA pool bytes back to host memory.
    pub fn copy_from(&self, src_offset: u32, dst: &mut [u8]) -> Result<(), AllocError> {
        self.check_payload(dst.len())?;
        self.driver.copy_from(self.rel(src_offset)?, dst)
    }

    /// Pool-to-pool copy from another device ring. Takes the direct path
    /// when both pools are reachable without staging, otherwise bounces
    /// through a host buffer.
    pub fn copy_from_peer(
        &self,
        dst_offset: u32,
        src: &DeviceRingAllocator,
        src_offset: u32,
        len: usize,
    ) -> Result<(), AllocError> {
        self.check_payload(len)?;
        let dst_rel = self.rel(dst_offset)?;
        let src_rel = src.rel(src_offset)?;

        if let (Some((dst_base, dst_len)), Some((src_base, src_len))) =
            (self.driver.host_view(), src.driver.host_view())
        {
            if dst_rel + len > dst_len || src_rel + len > src_len {
                return Err(AllocError::BadOffset {
                    shmem_id: self.shmem_id(),
                    offset: dst_offset,
                });
            }
            unsafe {
                std::ptr::copy_nonoverlapping(src_base.add(src_rel), dst_base.add(dst_rel), len)
            };
            return Ok(());
        }

        #[cfg(feature = "cuda")]
        if let (DeviceDriverKind::Cuda(dst_drv), DeviceDriverKind::Cuda(src_drv)) =
            (&self.driver, &src.driver)
        {
            if dst_drv.ordinal() == src_drv.ordinal() {
                return dst_drv.copy_on_device(dst_rel, src_drv, src_rel, len);
            }
        }

        let mut staging = vec![0u8; len];
        src.driver.copy_from(src_rel, &mut staging)?;
        self.driver.copy_to(dst_rel, &staging)
    }

    /// Address of an allocation inside the device address space. Stable for
    /// the lifetime of the pool; slot reuse hands back the same address.
    pub fn device_addr(&self, offset: u32) -> Result<usize, AllocError> {
        Ok(self.driver.base_addr() + self.rel(offset)?)
    }

    pub(crate) fn snapshot(&self) -> (u32, u32) {
        self.ctl().snapshot()
    }

    fn rel(&self, offset: u32) -> Result<usize, AllocError> {
        let start = self.pool_offset();
        let end = start as usize + self.item_size() * self.ring_size();
        if (offset as usize) < start as usize || offset as usize >= end {
            return Err(AllocError::BadOffset {
                shmem_id: self.shmem_id(),
                offset,
            });
        }
        Ok(offset as usize - start as usize)
    }

    fn slot_of(&self, offset: u32) -> Result<u32, AllocError> {
        let rel = self.rel(offset)?;
        let stride = self.layout().ring.item_size as usize;
        debug_assert!(rel % stride == 0, "offset {offset} is not slot-aligned");
        Ok((rel / stride) as u32)
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

impl Drop for DeviceRingAllocator {
    fn drop(&mut self) {
        if self.layout().ring.attached.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let DeviceDriverKind::Emulated(d) = &self.driver {
                let _ = d.pool.unlink();
            }
            let _ = self.seg.unlink();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAN: usize = 256;

    fn prefix() -> String {
        format!("hazcat-dev-test-{}", std::process::id())
    }

    fn emulated(item_size: usize, ring_size: usize) -> DeviceRingAllocator {
        DeviceRingAllocator::create(
            &prefix(),
            item_size,
            ring_size,
            DeviceKind::Emulated { granularity: GRAN },
        )
        .unwrap()
    }

    #[test]
    fn granularity_rounds_the_ring_up_never_down() {
        let a = emulated(4 + GRAN / 4, 3);
        assert!(a.ring_size() >= 3);
        assert!(a.item_size() >= 4 + GRAN / 4);
        assert_eq!(a.item_size() % shared::layout::ITEM_ALIGN, 0);
    }

    #[test]
    fn round_trip_through_the_pool_preserves_values() {
        let a = emulated(4 + GRAN / 4, 3);
        let values = [4.5f32, 2.25, 1.125];
        let offsets: Vec<u32> = values
            .iter()
            .map(|v| {
                let off = a.allocate(4).unwrap();
                a.copy_to(off, &v.to_ne_bytes()).unwrap();
                off
            })
            .collect();

        for (off, v) in offsets.iter().zip(values) {
            let mut buf = [0u8; 4];
            a.copy_from(*off, &mut buf).unwrap();
            assert_eq!(f32::from_ne_bytes(buf), v);
        }
    }

    #[test]
    fn slot_reuse_lands_on_the_same_device_addresses() {
        let a = emulated(4 + GRAN / 4, 3);
        let o0 = a.allocate(4).unwrap();
        let o1 = a.allocate(4).unwrap();
        let o2 = a.allocate(4).unwrap();
        a.copy_to(o2, &1.125f32.to_ne_bytes()).unwrap();

        let addr0 = a.device_addr(o0).unwrap();
        let addr1 = a.device_addr(o1).unwrap();

        a.deallocate(o0).unwrap();
        a.deallocate(o1).unwrap();
        assert_eq!(a.snapshot(), (1, 2));

        let n0 = a.allocate(4).unwrap();
        let n1 = a.allocate(4).unwrap();
        assert_eq!(a.device_addr(n0).unwrap(), addr0);
        assert_eq!(a.device_addr(n1).unwrap(), addr1);

        let mut buf = [0u8; 4];
        a.copy_from(o2, &mut buf).unwrap();
        assert_eq!(f32::from_ne_bytes(buf), 1.125);
    }

    #[test]
    fn peers_reach_the_same_pool_through_the_export_record() {
        let a = emulated(64, 4);
        let seg = ShmemSegment::attach(&alloc_segment_name(&prefix(), a.shmem_id())).unwrap();
        let b = DeviceRingAllocator::from_segment(seg, &prefix()).unwrap();

        let off = a.allocate(8).unwrap();
        a.copy_to(off, &0x5a5a_5a5au32.to_ne_bytes()).unwrap();

        let mut buf = [0u8; 4];
        b.copy_from(off, &mut buf).unwrap();
        assert_eq!(u32::from_ne_bytes(buf), 0x5a5a_5a5a);
    }

    #[test]
    fn pool_to_pool_copies_between_rings() {
        let a = emulated(64, 4);
        let b = emulated(64, 4);

        let src = a.allocate(16).unwrap();
        a.copy_to(src, b"cross-pool bytes").unwrap();
        let dst = b.allocate(16).unwrap();
        b.copy_from_peer(dst, &a, src, 16).unwrap();

        let mut buf = [0u8; 16];
        b.copy_from(dst, &mut buf).unwrap();
        assert_eq!(&buf, b"cross-pool bytes");
    }
}
