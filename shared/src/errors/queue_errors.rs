use thiserror::Error;

use super::{AllocError, ShmemError};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("topic `{topic}` already spans {max} memory domains")]
    TooManyDomains { topic: String, max: usize },

    #[error("endpoint counter for `{topic}` out of range")]
    CountOverflow { topic: String },

    #[error("allocator {shmem_id} has no room for a {len}-byte copy")]
    NoSpace { shmem_id: u32, len: usize },

    #[error(transparent)]
    Shmem(#[from] ShmemError),

    #[error(transparent)]
    Alloc(#[from] AllocError),
}
