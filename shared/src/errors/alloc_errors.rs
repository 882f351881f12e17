use thiserror::Error;

use super::ShmemError;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error(
        "segment {shmem_id} carries no known allocator variant \
         (strategy={strategy}, device_type={device_type})"
    )]
    UnknownVariant {
        shmem_id: u32,
        strategy: u32,
        device_type: u32,
    },

    #[error("allocator {shmem_id}: offset {offset} is not a live allocation")]
    BadOffset { shmem_id: u32, offset: u32 },

    #[error("allocator segment {shmem_id}: {have} bytes mapped, {need} required")]
    Truncated {
        shmem_id: u32,
        need: usize,
        have: usize,
    },

    #[error("allocator {shmem_id}: payload of {len} bytes exceeds the {item_size}-byte stride")]
    PayloadTooLarge {
        shmem_id: u32,
        len: usize,
        item_size: usize,
    },

    #[error("device driver: {0}")]
    Device(String),

    #[error(transparent)]
    Shmem(#[from] ShmemError),
}
