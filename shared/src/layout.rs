//! On-shared-memory layouts (same layout in every attached process).
//!
//! Everything here is `#[repr(C)]` and position-stable: these structs are
//! projected straight onto mapped segments, so a field moving between
//! versions or variants is a protocol break. Cross-process references are
//! always `(segment id, byte offset)` pairs; absolute pointers never leave
//! the process that computed them.
//!
//! Allocator segment:
//!
//! ```text
//! [AllocatorHeader][RingState][DeviceExport?][refs: u32 x ring_size][items...]
//! ```
//!
//! CPU rings keep their item bytes at the tail of the same segment. Device
//! rings have no host-side item bytes; `DeviceExport` carries what a peer
//! needs to reach the pool in the device's own address space.
//!
//! Queue segment:
//!
//! ```text
//! [QueueHeader][RefBits x len][entries: Entry x len per domain column]
//! ```
//!
//! Entry cells are column-major: one contiguous column of `len` cells per
//! active domain, so appending a domain appends one column at the end.

use std::mem::size_of;
use std::sync::atomic::{AtomicU16, AtomicU32};

use crate::constants::DOMAINS_PER_TOPIC;
use crate::domain::DomainId;

/// Payload stride alignment inside ring allocators.
pub const ITEM_ALIGN: usize = 8;

pub const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

/// Common prefix of every allocator segment, at offset 0.
///
/// `shmem_id` is self-referential: a peer that receives the id in a message
/// entry attaches the segment, reads this header back, and selects the
/// dispatch implementation from `(strategy, device_type)`.
#[repr(C)]
#[derive(Debug)]
pub struct AllocatorHeader {
    pub shmem_id: u32,
    pub strategy: u32,
    pub device_type: u32,
    pub device_number: u32,
}

impl AllocatorHeader {
    pub const SIZE: usize = size_of::<AllocatorHeader>();

    pub fn domain(&self) -> DomainId {
        DomainId::from_raw(self.device_type << 16 | (self.device_number & 0xffff))
    }
}

/// Ring bookkeeping, immediately after the header in every ring variant.
///
/// `count` and `rear_it` are only read or written while `lock` is held;
/// they are atomics because they live in shared memory, not because they
/// are touched lock-free. `attached` counts live mappings across all
/// processes; the detacher that drops it to zero unlinks the segment.
#[repr(C)]
pub struct RingState {
    pub lock: AtomicU32,
    pub attached: AtomicU32,
    pub item_size: u32,
    pub ring_size: u32,
    pub count: AtomicU32,
    pub rear_it: AtomicU32,
}

impl RingState {
    pub const SIZE: usize = size_of::<RingState>();
}

/// Peer-attach record for device-backed rings.
///
/// For the emulated driver `backing_id` names the host segment that stands
/// in for device memory. For CUDA, `ipc_handle` holds the raw
/// `CUipcMemHandle` bytes and `owner_pid` the exporting process.
#[repr(C)]
pub struct DeviceExport {
    pub backing_id: u32,
    pub owner_pid: u32,
    pub pool_size: u64,
    pub ipc_handle: [u8; 64],
}

impl DeviceExport {
    pub const SIZE: usize = size_of::<DeviceExport>();
}

/// Full fixed prefix of a CPU ring segment.
#[repr(C)]
pub struct CpuRingLayout {
    pub header: AllocatorHeader,
    pub ring: RingState,
}

impl CpuRingLayout {
    /// Offset of the per-slot reference-count array.
    pub const fn refs_offset() -> usize {
        size_of::<CpuRingLayout>()
    }

    /// Offset of slot 0's payload bytes. Allocations are handed out as
    /// offsets `data_offset + slot * item_size`.
    pub const fn data_offset(ring_size: usize) -> usize {
        align_up(Self::refs_offset() + ring_size * size_of::<u32>(), ITEM_ALIGN)
    }

    pub const fn segment_size(item_size: usize, ring_size: usize) -> usize {
        Self::data_offset(ring_size) + item_size * ring_size
    }
}

/// Full fixed prefix of a device ring segment (host-visible part).
#[repr(C)]
pub struct DeviceRingLayout {
    pub header: AllocatorHeader,
    pub ring: RingState,
    pub export: DeviceExport,
}

impl DeviceRingLayout {
    pub const fn refs_offset() -> usize {
        size_of::<DeviceRingLayout>()
    }

    /// First offset handed out for device allocations. There are no host
    /// bytes at or past this offset; it only keeps device offsets disjoint
    /// from the host bookkeeping range so a misdirected offset is caught.
    pub const fn pool_offset(ring_size: usize) -> usize {
        align_up(Self::refs_offset() + ring_size * size_of::<u32>(), ITEM_ALIGN)
    }

    pub const fn segment_size(ring_size: usize) -> usize {
        Self::pool_offset(ring_size)
    }
}

/// Header of a topic's queue segment.
///
/// Structural fields (`len`, `num_domains`, `domains`, `seg_size`) change
/// only under the exclusive file lock; data-plane readers hold the shared
/// lock and load them with acquire ordering. `index` is the free-running
/// publish cursor: it wraps at u32 and is never folded into the ring, so
/// a reader can tell a full lap from "caught up". Slots are `seq % len`,
/// and `len` is always a power of two to keep that mapping consistent
/// across the wrap.
#[repr(C)]
pub struct QueueHeader {
    pub index: AtomicU32,
    pub len: AtomicU32,
    pub num_domains: AtomicU32,
    /// Current byte size of the segment. A peer whose mapping is smaller
    /// observed a structural grow and must remap before touching rows.
    pub seg_size: AtomicU32,
    pub pub_count: AtomicU16,
    pub sub_count: AtomicU16,
    /// Domain id per entry column. Column 0 is always the CPU domain.
    /// A column, once assigned, keeps its domain for the queue's lifetime.
    pub domains: [u32; DOMAINS_PER_TOPIC],
}

impl QueueHeader {
    pub const SIZE: usize = size_of::<QueueHeader>();
}

/// Per-slot reference record.
#[repr(C)]
pub struct RefBits {
    /// Test-and-set spin word serializing publishers and takers on this row.
    pub lock: AtomicU32,
    /// Bitmask of entry columns currently holding a valid copy.
    pub availability: AtomicU32,
    /// Subscribers that have not yet taken this slot; 0 means empty row.
    pub interest_count: AtomicU16,
    pub _pad: u16,
}

impl RefBits {
    pub const SIZE: usize = size_of::<RefBits>();
}

/// One message reference: which allocator, where inside it, how long.
/// Guarded by the row lock; plain fields on purpose.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub alloc_shmem_id: u32,
    pub offset: u32,
    pub len: u32,
}

impl Entry {
    pub const SIZE: usize = size_of::<Entry>();
}

pub const fn ref_bits_offset() -> usize {
    QueueHeader::SIZE
}

pub const fn ref_bits_cell_offset(slot: usize) -> usize {
    ref_bits_offset() + slot * RefBits::SIZE
}

pub const fn entries_offset(len: usize) -> usize {
    ref_bits_offset() + len * RefBits::SIZE
}

/// Byte offset of `entry[column][slot]` in a queue of ring length `len`.
pub const fn entry_cell_offset(len: usize, column: usize, slot: usize) -> usize {
    entries_offset(len) + (column * len + slot) * Entry::SIZE
}

pub const fn queue_segment_size(len: usize, num_domains: usize) -> usize {
    entries_offset(len) + num_domains * len * Entry::SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    /// The header prefix must be bit-identical in every allocator variant:
    /// same field offsets whether the segment is a CPU ring or a device
    /// ring. Peers rely on this to read the tags before knowing the variant.
    #[test]
    fn header_layout_is_congruent_across_variants() {
        assert_eq!(offset_of!(CpuRingLayout, header), 0);
        assert_eq!(offset_of!(DeviceRingLayout, header), 0);

        assert_eq!(offset_of!(AllocatorHeader, shmem_id), 0);
        assert_eq!(offset_of!(AllocatorHeader, strategy), 4);
        assert_eq!(offset_of!(AllocatorHeader, device_type), 8);
        assert_eq!(offset_of!(AllocatorHeader, device_number), 12);

        assert_eq!(
            offset_of!(CpuRingLayout, ring),
            offset_of!(DeviceRingLayout, ring)
        );
    }

    #[test]
    fn ring_state_is_where_both_variants_expect_it() {
        assert_eq!(offset_of!(CpuRingLayout, ring), AllocatorHeader::SIZE);
        assert_eq!(
            offset_of!(DeviceRingLayout, export),
            AllocatorHeader::SIZE + RingState::SIZE
        );
    }

    #[test]
    fn cpu_ring_offsets_line_up() {
        // item_size 8, ring_size 3: refs right after the fixed prefix,
        // items 8-aligned after the refs.
        let data = CpuRingLayout::data_offset(3);
        assert_eq!(data % ITEM_ALIGN, 0);
        assert_eq!(data, align_up(CpuRingLayout::refs_offset() + 12, 8));
        assert_eq!(CpuRingLayout::segment_size(8, 3), data + 24);
    }

    #[test]
    fn queue_cells_never_alias() {
        let len = 4;
        let mut seen = std::collections::HashSet::new();
        for column in 0..3 {
            for slot in 0..len {
                assert!(seen.insert(entry_cell_offset(len, column, slot)));
            }
        }
        // Columns are contiguous runs of `len` cells.
        assert_eq!(
            entry_cell_offset(len, 1, 0) - entry_cell_offset(len, 0, 0),
            len * Entry::SIZE
        );
        assert_eq!(
            queue_segment_size(len, 3),
            entry_cell_offset(len, 2, len - 1) + Entry::SIZE
        );
    }

    #[test]
    fn row_records_stay_compact() {
        // These sizes are part of the cross-process protocol.
        assert_eq!(RefBits::SIZE, 12);
        assert_eq!(Entry::SIZE, 12);
        assert_eq!(RingState::SIZE, 24);
        assert_eq!(AllocatorHeader::SIZE, 16);
    }
}
