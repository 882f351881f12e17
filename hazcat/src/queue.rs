//! Per-topic shared message queue: a ring of reference rows plus one entry
//! column per memory domain.
//!
//! A publisher claims the next slot with a free-running cursor and drops
//! its `(allocator, offset, len)` entry into its domain's column. A taker
//! reuses a same-domain entry by raising its reference count, or performs
//! the one lazy copy into its own domain and records it in the row so
//! later takers there reuse it. When the last interested subscriber has
//! taken a row, every recorded copy goes back to its ring.
//!
//! Locking, coarse to fine:
//! - the advisory file-range lock on the segment: shared for publish/take,
//!   exclusive for register/unregister and structural growth;
//! - an in-process `RwLock` around the mapping, because OFD locks do not
//!   conflict within one open file description;
//! - a per-row test-and-set word serializing writers and takers of the
//!   exact slot.

use std::cell::Cell;
use std::mem::offset_of;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use shared::constants::{DOMAINS_PER_TOPIC, MAX_ENDPOINTS};
use shared::domain::DomainId;
use shared::errors::{QueueError, ShmemError};
use shared::layout::{
    entries_offset, queue_segment_size, ref_bits_cell_offset, Entry, QueueHeader, RefBits,
};

use crate::allocator::AllocatorRegistry;
use crate::shmem::ShmemSegment;
use crate::spin;

/// One per-process handle to a topic's queue segment, shared by every
/// endpoint of that topic in the process.
pub(crate) struct QueueNode {
    pub(crate) topic: String,
    seg: RwLock<ShmemSegment>,
    /// Endpoints in this process still using the node.
    pub(crate) endpoints: AtomicUsize,
}

impl QueueNode {
    pub(crate) fn open(topic: &str, name: &str) -> Result<Arc<QueueNode>, QueueError> {
        let (seg, _) = ShmemSegment::open_or_create(name, QueueHeader::SIZE).map_err(|e| {
            match e {
                ShmemError::NameTooLong { name, max } => QueueError::InvalidArgument(format!(
                    "queue name `{name}` exceeds the {max}-byte shared-memory limit"
                )),
                other => QueueError::Shmem(other),
            }
        })?;
        Ok(Arc::new(QueueNode {
            topic: topic.to_owned(),
            seg: RwLock::new(seg),
            endpoints: AtomicUsize::new(0),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Publisher,
    Subscriber,
}

pub(crate) struct Registration {
    pub array_num: u32,
    /// Starting read cursor; meaningful for subscribers only.
    pub next_index: u32,
}

/// Raw view over a mapped queue segment. Offsets come from the layout
/// module; the base pointer is only valid while the mapping is.
struct QueueView {
    base: *mut u8,
}

impl QueueView {
    /// # Safety
    /// The segment must hold an initialized queue of at least the size its
    /// own `seg_size` field claims (callers verify under the file lock).
    unsafe fn new(seg: &ShmemSegment) -> QueueView {
        QueueView { base: seg.as_ptr() }
    }

    fn header(&self) -> &QueueHeader {
        unsafe { &*(self.base as *const QueueHeader) }
    }

    fn row(&self, slot: u32) -> &RefBits {
        unsafe { &*(self.base.add(ref_bits_cell_offset(slot as usize)) as *const RefBits) }
    }

    fn entry(&self, len: u32, column: u32, slot: u32) -> Entry {
        let off =
            shared::layout::entry_cell_offset(len as usize, column as usize, slot as usize);
        unsafe { ptr::read(self.base.add(off) as *const Entry) }
    }

    fn set_entry(&self, len: u32, column: u32, slot: u32, entry: Entry) {
        let off =
            shared::layout::entry_cell_offset(len as usize, column as usize, slot as usize);
        unsafe { ptr::write(self.base.add(off) as *mut Entry, entry) }
    }

    fn domain_at(&self, column: u32) -> u32 {
        let off = offset_of!(QueueHeader, domains) + column as usize * 4;
        unsafe { ptr::read(self.base.add(off) as *const u32) }
    }

    fn set_domain(&self, column: u32, raw: u32) {
        let off = offset_of!(QueueHeader, domains) + column as usize * 4;
        unsafe { ptr::write(self.base.add(off) as *mut u32, raw) }
    }
}

/// Run `f` with the shared file lock held over a mapping that is at least
/// as large as the header says the segment is, refreshing the mapping when
/// a peer has grown the segment since we last looked.
fn with_shared<R>(
    node: &QueueNode,
    f: impl FnOnce(&ShmemSegment) -> Result<R, QueueError>,
) -> Result<R, QueueError> {
    loop {
        {
            let seg = node.seg.read().expect("queue node lock poisoned");
            let _lock = seg.lock_shared()?;
            if seg.len() >= QueueHeader::SIZE {
                let view = unsafe { QueueView::new(&seg) };
                let need = view.header().seg_size.load(Ordering::Acquire) as usize;
                if need == 0 {
                    return Err(QueueError::InvalidArgument(format!(
                        "queue `{}` is not initialized",
                        node.topic
                    )));
                }
                if seg.len() >= need {
                    return f(&seg);
                }
            }
        }
        let mut seg = node.seg.write().expect("queue node lock poisoned");
        let _lock = seg.lock_shared()?;
        seg.remap_to_current()?;
        if seg.len() < QueueHeader::SIZE {
            return Err(QueueError::InvalidArgument(format!(
                "queue `{}` is not initialized",
                node.topic
            )));
        }
    }
}

/// Register an endpoint: create or adopt the queue, find (or append) the
/// column for the endpoint's domain, widen the ring if the endpoint wants
/// more depth, and bump the role counter. Everything happens under the
/// exclusive file lock, so data-plane peers never observe a torn layout.
pub(crate) fn register_endpoint(
    node: &QueueNode,
    role: Role,
    domain: DomainId,
    depth: usize,
) -> Result<Registration, QueueError> {
    if depth == 0 || depth > u16::MAX as usize {
        return Err(QueueError::InvalidArgument(format!(
            "depth {depth} outside 1..={}",
            u16::MAX
        )));
    }
    let mut seg = node.seg.write().expect("queue node lock poisoned");
    let _lock = seg.lock_exclusive()?;
    seg.remap_to_current()?;

    let fresh = seg.len() < QueueHeader::SIZE || {
        let view = unsafe { QueueView::new(&seg) };
        view.header().len.load(Ordering::Acquire) == 0
    };
    if fresh {
        let num_domains: u32 = if domain.is_cpu() { 1 } else { 2 };
        // Ring lengths are powers of two so the free-running cursors map
        // onto slots consistently across the u32 wrap.
        let len = depth.next_power_of_two();
        let size = queue_segment_size(len, num_domains as usize);
        seg.resize(size)?;
        let view = unsafe { QueueView::new(&seg) };
        view.set_domain(0, DomainId::CPU.raw());
        if !domain.is_cpu() {
            view.set_domain(1, domain.raw());
        }
        let hdr = view.header();
        hdr.index.store(0, Ordering::SeqCst);
        hdr.num_domains.store(num_domains, Ordering::Release);
        hdr.len.store(len as u32, Ordering::Release);
        hdr.seg_size.store(size as u32, Ordering::Release);
        info!(
            "created queue `{}`: depth {depth} (ring {len}), {num_domains} domain(s)",
            node.topic
        );
    }

    let view = unsafe { QueueView::new(&seg) };
    let nd = view.header().num_domains.load(Ordering::Acquire);
    let mut array_num = None;
    for c in 0..nd {
        if view.domain_at(c) == domain.raw() {
            array_num = Some(c);
            break;
        }
    }
    let array_num = match array_num {
        Some(c) => c,
        None => {
            if nd as usize == DOMAINS_PER_TOPIC {
                return Err(QueueError::TooManyDomains {
                    topic: node.topic.clone(),
                    max: DOMAINS_PER_TOPIC,
                });
            }
            let len = view.header().len.load(Ordering::Acquire) as usize;
            let size = queue_segment_size(len, nd as usize + 1);
            seg.resize(size)?; // the appended column arrives zero-filled
            let view = unsafe { QueueView::new(&seg) };
            view.set_domain(nd, domain.raw());
            view.header().num_domains.store(nd + 1, Ordering::Release);
            view.header().seg_size.store(size as u32, Ordering::Release);
            info!("queue `{}`: domain {domain} joined as column {nd}", node.topic);
            nd
        }
    };

    let cur_len = {
        let view = unsafe { QueueView::new(&seg) };
        view.header().len.load(Ordering::Acquire) as usize
    };
    let need_len = depth.next_power_of_two();
    if need_len > cur_len {
        grow_depth(&mut seg, &node.topic, need_len)?;
    }

    let view = unsafe { QueueView::new(&seg) };
    let hdr = view.header();
    let next_index = match role {
        Role::Publisher => {
            let n = hdr.pub_count.load(Ordering::Acquire);
            if n as usize == MAX_ENDPOINTS {
                return Err(QueueError::CountOverflow {
                    topic: node.topic.clone(),
                });
            }
            hdr.pub_count.store(n + 1, Ordering::Release);
            0
        }
        Role::Subscriber => {
            let n = hdr.sub_count.load(Ordering::Acquire);
            if n as usize == MAX_ENDPOINTS {
                return Err(QueueError::CountOverflow {
                    topic: node.topic.clone(),
                });
            }
            hdr.sub_count.store(n + 1, Ordering::Release);
            hdr.index.load(Ordering::SeqCst)
        }
    };
    debug!(
        "queue `{}`: registered {role:?} in column {array_num}",
        node.topic
    );
    Ok(Registration {
        array_num,
        next_index,
    })
}

/// Widen the ring to `new_len` rows (both lengths are powers of two).
///
/// A row's slot is its publish sequence modulo the ring length, so rows
/// must move to the position their sequence maps to under the new length.
/// The last `old_len` sequences before the cursor are reconstructed, the
/// live rows snapshotted, the whole region zeroed, and every row written
/// back at its new slot. All of it happens under the exclusive file lock.
fn grow_depth(seg: &mut ShmemSegment, topic: &str, new_len: usize) -> Result<(), QueueError> {
    let (old_len, nd, index) = {
        let view = unsafe { QueueView::new(seg) };
        (
            view.header().len.load(Ordering::Acquire) as usize,
            view.header().num_domains.load(Ordering::Acquire) as usize,
            view.header().index.load(Ordering::SeqCst),
        )
    };
    debug_assert!(new_len > old_len && new_len.is_power_of_two());

    // Snapshot rows and entry cells before the layout moves underneath us.
    let mut rows = vec![0u8; old_len * RefBits::SIZE];
    let mut cells = vec![Entry::default(); nd * old_len];
    {
        let base = seg.as_ptr();
        unsafe {
            ptr::copy_nonoverlapping(
                base.add(ref_bits_cell_offset(0)),
                rows.as_mut_ptr(),
                rows.len(),
            );
            ptr::copy_nonoverlapping(
                base.add(entries_offset(old_len)) as *const Entry,
                cells.as_mut_ptr(),
                cells.len(),
            );
        }
    }

    let new_size = queue_segment_size(new_len, nd);
    seg.resize(new_size)?;
    let base = seg.as_ptr();
    unsafe {
        ptr::write_bytes(
            base.add(ref_bits_cell_offset(0)),
            0,
            new_size - ref_bits_cell_offset(0),
        );
    }

    for back in 1..=old_len as u32 {
        let seq = index.wrapping_sub(back);
        let from = seq as usize % old_len;
        let to = seq as usize % new_len;
        unsafe {
            ptr::copy_nonoverlapping(
                rows.as_ptr().add(from * RefBits::SIZE),
                base.add(ref_bits_cell_offset(to)),
                RefBits::SIZE,
            );
        }
        for c in 0..nd {
            let cell = cells[c * old_len + from];
            let off = shared::layout::entry_cell_offset(new_len, c, to);
            unsafe { ptr::write(base.add(off) as *mut Entry, cell) };
        }
    }

    let view = unsafe { QueueView::new(seg) };
    view.header().len.store(new_len as u32, Ordering::Release);
    view.header().seg_size.store(new_size as u32, Ordering::Release);
    info!("queue `{topic}`: ring widened {old_len} -> {new_len}");
    Ok(())
}

/// Insert a published entry into the next slot. The payload is already in
/// the publisher's ring; ownership of it moves to the row (or back to the
/// ring when nobody is subscribed).
pub(crate) fn publish(
    node: &QueueNode,
    registry: &Mutex<AllocatorRegistry>,
    array_num: u32,
    entry: Entry,
    spin_limit: u32,
) -> Result<(), QueueError> {
    with_shared(node, |seg| {
        let view = unsafe { QueueView::new(seg) };
        let hdr = view.header();
        let len = hdr.len.load(Ordering::Acquire);
        // The cursor runs free and wraps at u32; slots are `seq % len`.
        // With a power-of-two ring the mapping stays consistent across
        // the wrap, and readers can tell a full lap from "caught up".
        let seq = hdr.index.fetch_add(1, Ordering::SeqCst);
        let slot = seq % len;

        let row = view.row(slot);
        let guard = spin::acquire(&row.lock, spin_limit);
        let pending = row.interest_count.load(Ordering::Acquire);
        if pending > 0 {
            // Overwrite-on-full: subscribers that fell more than a ring
            // behind lose this message.
            warn!(
                "queue `{}`: overwriting slot {slot} still awaited by {pending} reader(s)",
                node.topic
            );
            let avail = row.availability.load(Ordering::Acquire);
            row.availability.store(0, Ordering::Release);
            row.interest_count.store(0, Ordering::Release);
            release_row_entries(&view, registry, len, slot, avail);
        }

        let subs = hdr.sub_count.load(Ordering::Acquire);
        if subs == 0 {
            drop(guard);
            debug!("queue `{}`: no subscribers, releasing publish", node.topic);
            let mut reg = registry.lock().expect("registry poisoned");
            if let Ok(alloc) = reg.get_or_attach(entry.alloc_shmem_id) {
                let _ = alloc.deallocate(entry.offset);
            }
            return Ok(());
        }

        view.set_entry(len, array_num, slot, entry);
        row.availability.store(1 << array_num, Ordering::Release);
        row.interest_count.store(subs, Ordering::Release);
        drop(guard);
        debug!("queue `{}`: slot {slot} published for {subs} reader(s)", node.topic);
        Ok(())
    })
}

/// State a subscriber carries into `take`.
pub(crate) struct TakeContext<'a> {
    pub array_num: u32,
    pub depth: u32,
    pub alloc_id: u32,
    pub next_index: &'a Cell<u32>,
}

/// Return the next entry for this subscriber, copying it into the
/// subscriber's domain if no copy exists there yet. The returned entry's
/// allocation carries one extra reference owned by the caller.
pub(crate) fn take(
    node: &QueueNode,
    registry: &Mutex<AllocatorRegistry>,
    tc: TakeContext<'_>,
    spin_limit: u32,
) -> Result<Option<Entry>, QueueError> {
    with_shared(node, |seg| {
        let view = unsafe { QueueView::new(seg) };
        let hdr = view.header();
        let len = hdr.len.load(Ordering::Acquire);
        let index = hdr.index.load(Ordering::SeqCst);
        let depth = tc.depth.min(len);
        loop {
            let mut seq = tc.next_index.get();
            let lag = index.wrapping_sub(seq);
            if lag == 0 {
                return Ok(None);
            }
            if lag > depth {
                // Keep-last: skip anything older than `depth` publishes.
                seq = index.wrapping_sub(depth);
            }
            let slot = seq % len;

            let row = view.row(slot);
            let guard = spin::acquire(&row.lock, spin_limit);
            let avail = row.availability.load(Ordering::Acquire);
            if avail == 0 {
                // Raced an overwrite reset or a fully consumed row.
                drop(guard);
                tc.next_index.set(seq.wrapping_add(1));
                continue;
            }

            let col = tc.array_num;
            let entry = if avail & (1 << col) != 0 {
                // A copy already lives in our domain: take it by reference.
                let e = view.entry(len, col, slot);
                let mut reg = registry.lock().expect("registry poisoned");
                reg.get_or_attach(e.alloc_shmem_id)?.share(e.offset)?;
                e
            } else {
                // Lazy copy: pull from the lowest column holding one.
                let src_col = avail.trailing_zeros();
                let src = view.entry(len, src_col, slot);
                let mut reg = registry.lock().expect("registry poisoned");
                let dst_off = {
                    let dst = reg.get_or_attach(tc.alloc_id)?;
                    dst.allocate(src.len as usize).ok_or(QueueError::NoSpace {
                        shmem_id: tc.alloc_id,
                        len: src.len as usize,
                    })?
                };
                let (dst, src_alloc) = reg.get_pair(tc.alloc_id, src.alloc_shmem_id)?;
                if let Err(err) = dst.copy(dst_off, src_alloc, src.offset, src.len as usize) {
                    let _ = dst.deallocate(dst_off);
                    return Err(err.into());
                }
                let e = Entry {
                    alloc_shmem_id: tc.alloc_id,
                    offset: dst_off,
                    len: src.len,
                };
                view.set_entry(len, col, slot, e);
                row.availability.fetch_or(1 << col, Ordering::Release);
                // Two holders now: the row and the sample being returned.
                dst.share(dst_off)?;
                debug!(
                    "queue `{}`: lazy copy of slot {slot} into column {col} (from {src_col})",
                    node.topic
                );
                e
            };

            let prev = row.interest_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "taking from an empty row");
            if prev <= 1 {
                let avail_now = row.availability.load(Ordering::Acquire);
                row.availability.store(0, Ordering::Release);
                release_row_entries(&view, registry, len, slot, avail_now);
            }
            drop(guard);
            tc.next_index.set(seq.wrapping_add(1));
            return Ok(Some(entry));
        }
    })
}

/// Give every copy recorded in a row back to its ring.
fn release_row_entries(
    view: &QueueView,
    registry: &Mutex<AllocatorRegistry>,
    len: u32,
    slot: u32,
    avail: u32,
) {
    let mut reg = registry.lock().expect("registry poisoned");
    let mut mask = avail;
    while mask != 0 {
        let col = mask.trailing_zeros();
        mask &= mask - 1;
        let e = view.entry(len, col, slot);
        match reg.get_or_attach(e.alloc_shmem_id) {
            Ok(alloc) => {
                if let Err(err) = alloc.deallocate(e.offset) {
                    warn!(
                        "failed to release slot {slot} entry in allocator {:#x}: {err}",
                        e.alloc_shmem_id
                    );
                }
            }
            Err(err) => warn!(
                "allocator {:#x} unreachable while releasing slot {slot}: {err}",
                e.alloc_shmem_id
            ),
        }
    }
}

/// Drop an endpoint's registration. The queue segment is unlinked when the
/// last endpoint in any process leaves.
pub(crate) fn unregister(node: &QueueNode, role: Role) -> Result<bool, QueueError> {
    let mut seg = node.seg.write().expect("queue node lock poisoned");
    let _lock = seg.lock_exclusive()?;
    seg.remap_to_current()?;
    if seg.len() < QueueHeader::SIZE {
        return Err(QueueError::InvalidArgument(format!(
            "queue `{}` vanished before unregister",
            node.topic
        )));
    }
    let view = unsafe { QueueView::new(&seg) };
    let hdr = view.header();
    let counter = match role {
        Role::Publisher => &hdr.pub_count,
        Role::Subscriber => &hdr.sub_count,
    };
    let n = counter.load(Ordering::Acquire);
    if n == 0 {
        return Err(QueueError::CountOverflow {
            topic: node.topic.clone(),
        });
    }
    counter.store(n - 1, Ordering::Release);

    let remaining = hdr.pub_count.load(Ordering::Acquire) as usize
        + hdr.sub_count.load(Ordering::Acquire) as usize;
    if remaining == 0 {
        seg.unlink()?;
        info!("queue `{}`: last endpoint gone, unlinked", node.topic);
        return Ok(true);
    }
    debug!("queue `{}`: unregistered {role:?}, {remaining} endpoint(s) left", node.topic);
    Ok(false)
}
