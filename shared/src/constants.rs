//! Names, limits, and sizes every cooperating process must agree on.

/// Default prefix for every shared-memory object this transport creates.
/// Overridable through `[transport] prefix` in the config file.
pub const DEFAULT_PREFIX: &str = "hazcat";

/// POSIX caps `shm_open` names well below PATH_MAX; Linux enforces NAME_MAX
/// on the tmpfs entry. Names at or past this length are rejected up front.
pub const SHM_NAME_MAX: usize = 255;

/// Upper bound on distinct memory domains (entry columns) per topic.
pub const DOMAINS_PER_TOPIC: usize = 32;

/// Depth used when an endpoint does not specify one.
pub const DEFAULT_DEPTH: usize = 10;

/// Endpoint counters in the queue header are 16-bit.
pub const MAX_ENDPOINTS: usize = u16::MAX as usize;

/// Byte range of the advisory file lock taken on a queue segment.
/// Register/unregister/grow take it exclusive; publish/take take it shared.
pub const QUEUE_LOCK_START: i64 = 0;
pub const QUEUE_LOCK_LEN: i64 = 1;

/// Shared-memory name of the allocator segment with the given id.
pub fn alloc_segment_name(prefix: &str, shmem_id: u32) -> String {
    format!("/{prefix}.a{shmem_id:08x}")
}

/// Shared-memory name of the backing pool of an emulated device allocator.
pub fn device_pool_name(prefix: &str, shmem_id: u32) -> String {
    format!("/{prefix}.d{shmem_id:08x}")
}

/// Shared-memory name of a topic's queue segment.
///
/// The topic is prefixed and every `/` becomes `.` so the result is a single
/// flat name: `register("/image/raw")` under the default prefix opens
/// `/hazcat.image.raw`. Length validation happens at the call site, where it
/// can be reported with the full name.
pub fn topic_segment_name(prefix: &str, topic: &str) -> String {
    let trimmed = topic.trim_start_matches('/');
    format!("/{prefix}.{}", trimmed.replace('/', "."))
}
