//! Allocator variants and the dispatch over them.
//!
//! Every allocator segment starts with the same header; `(strategy,
//! device_type)` read from it selects the variant. Dispatch is a match on
//! a tagged union rather than anything dynamic, so a peer process can
//! attach a segment it has never seen and immediately route operations
//! correctly.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod registry;
mod ring;

use shared::constants::alloc_segment_name;
use shared::domain::{DeviceType, DomainId, Strategy};
use shared::errors::AllocError;
use shared::layout::AllocatorHeader;

use crate::shmem::ShmemSegment;
pub use cpu::CpuRingAllocator;
pub use device::{DeviceKind, DeviceRingAllocator};
pub use registry::AllocatorRegistry;

pub enum Allocator {
    CpuRing(CpuRingAllocator),
    DeviceRing(DeviceRingAllocator),
}

impl Allocator {
    /// Attach the segment behind `id` and wrap it in the right variant.
    pub fn attach(prefix: &str, id: u32) -> Result<Self, AllocError> {
        let seg = ShmemSegment::attach(&alloc_segment_name(prefix, id))?;
        if seg.len() < AllocatorHeader::SIZE {
            return Err(AllocError::UnknownVariant {
                shmem_id: id,
                strategy: u32::MAX,
                device_type: u32::MAX,
            });
        }
        // SAFETY: the header sits at offset 0 of every allocator segment.
        let hdr = unsafe { &*(seg.as_ptr() as *const AllocatorHeader) };
        let (strategy, device_type) = (hdr.strategy, hdr.device_type);
        match (Strategy::try_from(strategy), DeviceType::try_from(device_type)) {
            (Ok(Strategy::Ring), Ok(DeviceType::Cpu)) => {
                Ok(Allocator::CpuRing(CpuRingAllocator::from_segment(seg)?))
            }
            (Ok(Strategy::Ring), Ok(_)) => Ok(Allocator::DeviceRing(
                DeviceRingAllocator::from_segment(seg, prefix)?,
            )),
            _ => Err(AllocError::UnknownVariant {
                shmem_id: id,
                strategy,
                device_type,
            }),
        }
    }

    pub fn shmem_id(&self) -> u32 {
        match self {
            Allocator::CpuRing(a) => a.shmem_id(),
            Allocator::DeviceRing(a) => a.shmem_id(),
        }
    }

    pub fn domain(&self) -> DomainId {
        match self {
            Allocator::CpuRing(a) => a.domain(),
            Allocator::DeviceRing(a) => a.domain(),
        }
    }

    pub fn item_size(&self) -> usize {
        match self {
            Allocator::CpuRing(a) => a.item_size(),
            Allocator::DeviceRing(a) => a.item_size(),
        }
    }

    /// Next free slot as a header-relative offset; `None` when the ring is
    /// full (NO_SPACE).
    pub fn allocate(&self, len: usize) -> Option<u32> {
        match self {
            Allocator::CpuRing(a) => a.allocate(len),
            Allocator::DeviceRing(a) => a.allocate(len),
        }
    }

    pub fn share(&self, offset: u32) -> Result<(), AllocError> {
        match self {
            Allocator::CpuRing(a) => a.share(offset),
            Allocator::DeviceRing(a) => a.share(offset),
        }
    }

    pub fn deallocate(&self, offset: u32) -> Result<(), AllocError> {
        match self {
            Allocator::CpuRing(a) => a.deallocate(offset),
            Allocator::DeviceRing(a) => a.deallocate(offset),
        }
    }

    /// Host memory into this allocator's domain.
    pub fn copy_to(&self, dst_offset: u32, src: &[u8]) -> Result<(), AllocError> {
        match self {
            Allocator::CpuRing(a) => a.copy_to(dst_offset, src),
            Allocator::DeviceRing(a) => a.copy_to(dst_offset, src),
        }
    }

    /// This allocator's domain back to host memory.
    pub fn copy_from(&self, src_offset: u32, dst: &mut [u8]) -> Result<(), AllocError> {
        match self {
            Allocator::CpuRing(a) => a.copy_from(src_offset, dst),
            Allocator::DeviceRing(a) => a.copy_from(src_offset, dst),
        }
    }

    /// Copy an allocation from `src` into this allocator, picking the
    /// right variant pair: host↔host is one memcpy, host↔device goes
    /// through the device's DMA entry points, device↔device tries the
    /// peer path and falls back to staging through host memory.
    pub fn copy(
        &self,
        dst_offset: u32,
        src: &Allocator,
        src_offset: u32,
        len: usize,
    ) -> Result<(), AllocError> {
        if len > self.item_size() {
            return Err(AllocError::PayloadTooLarge {
                shmem_id: self.shmem_id(),
                len,
                item_size: self.item_size(),
            });
        }
        match (self, src) {
            (Allocator::CpuRing(dst), Allocator::CpuRing(s)) => {
                let from = s.ptr(src_offset)?;
                // SAFETY: both ranges were bounds-checked by ptr(); the
                // regions belong to different segments.
                let bytes = unsafe { std::slice::from_raw_parts(from, len) };
                dst.copy_to(dst_offset, bytes)
            }
            (Allocator::CpuRing(dst), Allocator::DeviceRing(s)) => {
                let to = dst.ptr(dst_offset)?;
                let bytes = unsafe { std::slice::from_raw_parts_mut(to, len) };
                s.copy_from(src_offset, bytes)
            }
            (Allocator::DeviceRing(dst), Allocator::CpuRing(s)) => {
                let from = s.ptr(src_offset)?;
                let bytes = unsafe { std::slice::from_raw_parts(from, len) };
                dst.copy_to(dst_offset, bytes)
            }
            (Allocator::DeviceRing(dst), Allocator::DeviceRing(s)) => {
                dst.copy_from_peer(dst_offset, s, src_offset, len)
            }
        }
    }

    /// Directly addressable bytes for CPU-resident allocations; `None` for
    /// device domains.
    pub fn host_ptr(&self, offset: u32) -> Option<*mut u8> {
        match self {
            Allocator::CpuRing(a) => a.ptr(offset).ok(),
            Allocator::DeviceRing(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> String {
        format!("hazcat-disp-test-{}", std::process::id())
    }

    #[test]
    fn attach_routes_by_header_tags() {
        let prefix = prefix();
        let cpu = CpuRingAllocator::create(&prefix, 8, 2).unwrap();
        let dev = DeviceRingAllocator::create(
            &prefix,
            8,
            2,
            DeviceKind::Emulated { granularity: 64 },
        )
        .unwrap();

        let a = Allocator::attach(&prefix, cpu.shmem_id()).unwrap();
        let b = Allocator::attach(&prefix, dev.shmem_id()).unwrap();
        assert!(matches!(a, Allocator::CpuRing(_)));
        assert!(matches!(b, Allocator::DeviceRing(_)));
        assert!(a.domain().is_cpu());
        assert!(!b.domain().is_cpu());
    }

    #[test]
    fn attach_rejects_unknown_ids() {
        assert!(matches!(
            Allocator::attach(&prefix(), 0xdead_beef),
            Err(AllocError::Shmem(_))
        ));
    }

    #[test]
    fn cross_variant_copies_move_real_bytes() {
        let prefix = prefix();
        let cpu = Allocator::CpuRing(CpuRingAllocator::create(&prefix, 32, 4).unwrap());
        let dev = Allocator::DeviceRing(
            DeviceRingAllocator::create(&prefix, 32, 4, DeviceKind::Emulated { granularity: 64 })
                .unwrap(),
        );

        let payload = b"heterogeneous hop";
        let c_off = cpu.allocate(payload.len()).unwrap();
        cpu.copy_to(c_off, payload).unwrap();

        // host -> device
        let d_off = dev.allocate(payload.len()).unwrap();
        dev.copy(d_off, &cpu, c_off, payload.len()).unwrap();

        // device -> host (fresh slot)
        let c2_off = cpu.allocate(payload.len()).unwrap();
        cpu.copy(c2_off, &dev, d_off, payload.len()).unwrap();

        let mut buf = vec![0u8; payload.len()];
        cpu.copy_from(c2_off, &mut buf).unwrap();
        assert_eq!(&buf, payload);
    }
}
