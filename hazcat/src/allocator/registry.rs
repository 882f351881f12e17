//! Per-process table of attached allocators (segment id → local mapping).
//!
//! Open-addressed with linear probing; XxHash64 of the id picks the start
//! slot. Entries arrive two ways: endpoints register the allocator they
//! own, and data-plane operations attach foreign allocators on first
//! sight of their id in a message entry. Endpoint entries are refcounted
//! and detach when the last endpoint using them unregisters; lazily
//! attached entries stay until the context is torn down.

use std::hash::Hasher;

use log::debug;
use shared::errors::AllocError;
use twox_hash::XxHash64;

use crate::allocator::Allocator;

enum Cell {
    Empty,
    /// Left behind by a removal so probe chains stay intact.
    Tombstone,
    Full(Slot),
}

struct Slot {
    id: u32,
    refs: u32,
    alloc: Allocator,
}

pub struct AllocatorRegistry {
    prefix: String,
    cells: Vec<Cell>,
    live: usize,
}

impl AllocatorRegistry {
    const INITIAL_CAPACITY: usize = 16;

    pub fn new(prefix: &str) -> Self {
        AllocatorRegistry {
            prefix: prefix.to_owned(),
            cells: (0..Self::INITIAL_CAPACITY).map(|_| Cell::Empty).collect(),
            live: 0,
        }
    }

    fn start_slot(&self, id: u32) -> usize {
        let mut h = XxHash64::with_seed(0);
        h.write_u32(id);
        h.finish() as usize & (self.cells.len() - 1)
    }

    fn position_of(&self, id: u32) -> Option<usize> {
        let mut i = self.start_slot(id);
        for _ in 0..self.cells.len() {
            match &self.cells[i] {
                Cell::Empty => return None,
                Cell::Full(slot) if slot.id == id => return Some(i),
                _ => i = (i + 1) & (self.cells.len() - 1),
            }
        }
        None
    }

    /// Insert an allocator this process created. Unreferenced until an
    /// endpoint retains it, like a lazily attached entry, so endpoint
    /// teardown can drop the mapping.
    pub fn insert(&mut self, alloc: Allocator) -> u32 {
        let id = alloc.shmem_id();
        debug_assert!(self.position_of(id).is_none(), "duplicate allocator {id:#x}");
        self.grow_if_needed();
        let mut i = self.start_slot(id);
        loop {
            match &self.cells[i] {
                Cell::Empty | Cell::Tombstone => {
                    self.cells[i] = Cell::Full(Slot { id, refs: 0, alloc });
                    self.live += 1;
                    return id;
                }
                Cell::Full(_) => i = (i + 1) & (self.cells.len() - 1),
            }
        }
    }

    /// Look an id up, attaching the segment if this process has not mapped
    /// it yet.
    pub fn get_or_attach(&mut self, id: u32) -> Result<&Allocator, AllocError> {
        if self.position_of(id).is_none() {
            let alloc = Allocator::attach(&self.prefix, id)?;
            debug!("registry: attached foreign allocator {id:#x}");
            self.grow_if_needed();
            let mut i = self.start_slot(id);
            loop {
                match &self.cells[i] {
                    Cell::Empty | Cell::Tombstone => {
                        self.cells[i] = Cell::Full(Slot { id, refs: 0, alloc });
                        self.live += 1;
                        break;
                    }
                    Cell::Full(_) => i = (i + 1) & (self.cells.len() - 1),
                }
            }
        }
        let i = self.position_of(id).expect("just inserted");
        match &self.cells[i] {
            Cell::Full(slot) => Ok(&slot.alloc),
            _ => unreachable!(),
        }
    }

    /// Attach (if needed) and borrow two allocators at once, as the
    /// cross-domain copy path needs source and destination together.
    pub fn get_pair(&mut self, a: u32, b: u32) -> Result<(&Allocator, &Allocator), AllocError> {
        self.get_or_attach(a)?;
        self.get_or_attach(b)?;
        let ia = self.position_of(a).expect("attached above");
        let ib = self.position_of(b).expect("attached above");
        match (&self.cells[ia], &self.cells[ib]) {
            (Cell::Full(sa), Cell::Full(sb)) => Ok((&sa.alloc, &sb.alloc)),
            _ => unreachable!(),
        }
    }

    /// Add an endpoint reference to an id (attaching if needed).
    pub fn retain(&mut self, id: u32) -> Result<(), AllocError> {
        self.get_or_attach(id)?;
        let i = self.position_of(id).expect("attached above");
        if let Cell::Full(slot) = &mut self.cells[i] {
            slot.refs += 1;
        }
        Ok(())
    }

    /// Drop an endpoint reference; the mapping goes away with the last one.
    pub fn release(&mut self, id: u32) {
        if let Some(i) = self.position_of(id) {
            if let Cell::Full(slot) = &mut self.cells[i] {
                slot.refs = slot.refs.saturating_sub(1);
                if slot.refs == 0 {
                    debug!("registry: detaching allocator {id:#x}");
                    self.cells[i] = Cell::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    fn grow_if_needed(&mut self) {
        if (self.live + 1) * 4 < self.cells.len() * 3 {
            return;
        }
        let new_len = self.cells.len() * 2;
        let old = std::mem::replace(
            &mut self.cells,
            (0..new_len).map(|_| Cell::Empty).collect(),
        );
        self.live = 0;
        for cell in old {
            if let Cell::Full(slot) = cell {
                let mut i = self.start_slot(slot.id);
                loop {
                    match &self.cells[i] {
                        Cell::Empty => {
                            self.cells[i] = Cell::Full(slot);
                            self.live += 1;
                            break;
                        }
                        _ => i = (i + 1) & (self.cells.len() - 1),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::cpu::CpuRingAllocator;

    fn prefix() -> String {
        format!("hazcat-reg-test-{}", std::process::id())
    }

    #[test]
    fn attach_on_miss_reaches_an_existing_segment() {
        let prefix = prefix();
        let owner = CpuRingAllocator::create(&prefix, 8, 2).unwrap();
        let id = owner.shmem_id();
        let off = owner.allocate(8).unwrap();
        owner.copy_to(off, &9u64.to_ne_bytes()).unwrap();

        let mut reg = AllocatorRegistry::new(&prefix);
        let alloc = reg.get_or_attach(id).unwrap();
        let mut buf = [0u8; 8];
        alloc.copy_from(off, &mut buf).unwrap();
        assert_eq!(u64::from_ne_bytes(buf), 9);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unknown_ids_fail_to_attach() {
        let mut reg = AllocatorRegistry::new(&prefix());
        assert!(reg.get_or_attach(0xdead_0001).is_err());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn release_removes_only_the_last_reference() {
        let prefix = prefix();
        let owner = CpuRingAllocator::create(&prefix, 8, 2).unwrap();
        let id = owner.shmem_id();

        let mut reg = AllocatorRegistry::new(&prefix);
        reg.retain(id).unwrap();
        reg.retain(id).unwrap();
        reg.release(id);
        assert_eq!(reg.len(), 1, "second endpoint still holds the mapping");
        reg.release(id);
        assert_eq!(reg.len(), 0);

        // A fresh lookup re-attaches through the probe chain past the
        // tombstone.
        assert!(reg.get_or_attach(id).is_ok());
    }

    #[test]
    fn growth_rehashes_every_entry() {
        let prefix = prefix();
        let mut owners = Vec::new();
        let mut reg = AllocatorRegistry::new(&prefix);
        for _ in 0..24 {
            let a = CpuRingAllocator::create(&prefix, 8, 2).unwrap();
            let id = a.shmem_id();
            owners.push((id, a));
            reg.retain(id).unwrap();
        }
        assert_eq!(reg.len(), 24);
        for (id, _) in &owners {
            assert!(reg.get_or_attach(*id).is_ok());
        }
    }
}
