//! Per-process context and the endpoint handles built on it.
//!
//! The context replaces every piece of process-global state: the allocator
//! registry and the table of attached queue nodes live here, created by
//! `Context::new` and torn down when the last handle drops. Endpoints do
//! not keep raw pointers into queue segments; they hold the node through
//! the context and revalidate the mapping on every operation, so a
//! structural grow by a peer process never leaves them pointing at stale
//! memory.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use log::{error, info};
use shared::constants::topic_segment_name;
use shared::domain::DomainId;
use shared::errors::{AllocError, QueueError};
use shared::layout::Entry;

use crate::allocator::{
    Allocator, AllocatorRegistry, CpuRingAllocator, DeviceKind, DeviceRingAllocator,
};
use crate::config::Config;
use crate::queue::{self, QueueNode, Role, TakeContext};

/// Identifier of an allocator registered with a context; the cross-process
/// segment id behind a newtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorId(pub(crate) u32);

impl AllocatorId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

pub(crate) struct ContextInner {
    config: Config,
    registry: Mutex<AllocatorRegistry>,
    queues: Mutex<HashMap<String, Arc<QueueNode>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Runs after the last endpoint handle is gone: the registry drop
        // detaches every mapped allocator, the queue table drops the nodes.
        info!("context torn down");
    }
}

/// Per-process transport context. Cheap to clone; all clones share the
/// same registry and queue table.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let registry = AllocatorRegistry::new(&config.transport.prefix);
        info!(
            "context up (prefix `{}`, default depth {})",
            config.transport.prefix, config.transport.default_depth
        );
        Context {
            inner: Arc::new(ContextInner {
                config,
                registry: Mutex::new(registry),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Create a host ring allocator and register it with this context.
    pub fn create_cpu_ring(
        &self,
        item_size: usize,
        ring_size: usize,
    ) -> Result<AllocatorId, AllocError> {
        let alloc = CpuRingAllocator::create(&self.inner.config.transport.prefix, item_size, ring_size)?;
        let id = self
            .inner
            .registry
            .lock()
            .expect("registry poisoned")
            .insert(Allocator::CpuRing(alloc));
        Ok(AllocatorId(id))
    }

    /// Create a device ring allocator in the emulated device domain.
    pub fn create_device_ring(
        &self,
        item_size: usize,
        ring_size: usize,
    ) -> Result<AllocatorId, AllocError> {
        let kind = DeviceKind::Emulated {
            granularity: self.inner.config.device.granularity,
        };
        let alloc = DeviceRingAllocator::create(
            &self.inner.config.transport.prefix,
            item_size,
            ring_size,
            kind,
        )?;
        let id = self
            .inner
            .registry
            .lock()
            .expect("registry poisoned")
            .insert(Allocator::DeviceRing(alloc));
        Ok(AllocatorId(id))
    }

    /// Create a CUDA-backed ring on the configured device.
    #[cfg(feature = "cuda")]
    pub fn create_cuda_ring(
        &self,
        item_size: usize,
        ring_size: usize,
    ) -> Result<AllocatorId, AllocError> {
        let kind = DeviceKind::Cuda {
            ordinal: self.inner.config.device.cuda_device,
        };
        let alloc = DeviceRingAllocator::create(
            &self.inner.config.transport.prefix,
            item_size,
            ring_size,
            kind,
        )?;
        let id = self
            .inner
            .registry
            .lock()
            .expect("registry poisoned")
            .insert(Allocator::DeviceRing(alloc));
        Ok(AllocatorId(id))
    }

    /// Register a publisher on `topic`, sourcing payloads from `alloc`.
    /// `depth == 0` means the configured default depth.
    pub fn register_publisher(
        &self,
        topic: &str,
        alloc: AllocatorId,
        depth: usize,
    ) -> Result<Publisher, QueueError> {
        let (node, reg, domain, depth) = self.register(topic, alloc, depth, Role::Publisher)?;
        Ok(Publisher {
            inner: Endpoint {
                ctx: self.inner.clone(),
                node,
                alloc_id: alloc.0,
                array_num: reg.array_num,
                depth: depth as u32,
                domain,
                registered: true,
            },
        })
    }

    /// Register a subscriber on `topic`, receiving payloads into `alloc`.
    pub fn register_subscriber(
        &self,
        topic: &str,
        alloc: AllocatorId,
        depth: usize,
    ) -> Result<Subscriber, QueueError> {
        let (node, reg, domain, depth) = self.register(topic, alloc, depth, Role::Subscriber)?;
        Ok(Subscriber {
            inner: Endpoint {
                ctx: self.inner.clone(),
                node,
                alloc_id: alloc.0,
                array_num: reg.array_num,
                depth: depth as u32,
                domain,
                registered: true,
            },
            next_index: Cell::new(reg.next_index),
        })
    }

    fn register(
        &self,
        topic: &str,
        alloc: AllocatorId,
        depth: usize,
        role: Role,
    ) -> Result<(Arc<QueueNode>, queue::Registration, DomainId, usize), QueueError> {
        if topic.trim_start_matches('/').is_empty() {
            return Err(QueueError::InvalidArgument("empty topic name".into()));
        }
        let depth = if depth == 0 {
            self.inner.config.transport.default_depth
        } else {
            depth
        };
        let domain = {
            let mut reg = self.inner.registry.lock().expect("registry poisoned");
            reg.get_or_attach(alloc.0)?.domain()
        };

        let node = {
            let mut queues = self.inner.queues.lock().expect("queue table poisoned");
            match queues.get(topic) {
                Some(node) => node.clone(),
                None => {
                    let name =
                        topic_segment_name(&self.inner.config.transport.prefix, topic);
                    let node = QueueNode::open(topic, &name)?;
                    queues.insert(topic.to_owned(), node.clone());
                    node
                }
            }
        };

        let registration = queue::register_endpoint(&node, role, domain, depth)?;
        node.endpoints.fetch_add(1, Ordering::AcqRel);
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .retain(alloc.0)?;
        Ok((node, registration, domain, depth))
    }
}

/// State common to both endpoint kinds.
struct Endpoint {
    ctx: Arc<ContextInner>,
    node: Arc<QueueNode>,
    alloc_id: u32,
    array_num: u32,
    depth: u32,
    domain: DomainId,
    registered: bool,
}

impl Endpoint {
    fn spin_limit(&self) -> u32 {
        self.ctx.config.lock.spin_limit
    }

    fn teardown(&mut self, role: Role) -> Result<(), QueueError> {
        if !self.registered {
            return Err(QueueError::InvalidArgument(
                "endpoint already unregistered".into(),
            ));
        }
        self.registered = false;
        let unlinked = queue::unregister(&self.node, role)?;
        if self.node.endpoints.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut queues = self.ctx.queues.lock().expect("queue table poisoned");
            if let Some(node) = queues.get(&self.node.topic) {
                if node.endpoints.load(Ordering::Acquire) == 0 {
                    queues.remove(&self.node.topic);
                }
            }
        }
        self.ctx
            .registry
            .lock()
            .expect("registry poisoned")
            .release(self.alloc_id);
        let _ = unlinked;
        Ok(())
    }
}

pub struct Publisher {
    inner: Endpoint,
}

impl Publisher {
    pub fn domain(&self) -> DomainId {
        self.inner.domain
    }

    /// Borrow a fresh slot from the publisher's ring for in-place filling.
    pub fn loan(&self) -> Result<Loan<'_>, QueueError> {
        let (offset, capacity) = {
            let mut reg = self.inner.ctx.registry.lock().expect("registry poisoned");
            let alloc = reg.get_or_attach(self.inner.alloc_id)?;
            let capacity = alloc.item_size();
            let offset = alloc.allocate(capacity).ok_or(QueueError::NoSpace {
                shmem_id: self.inner.alloc_id,
                len: capacity,
            })?;
            (offset, capacity)
        };
        Ok(Loan {
            publisher: self,
            offset,
            capacity,
            len: 0,
            published: false,
        })
    }

    /// Allocate, copy `payload` in, and publish it in one step.
    pub fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        let mut loan = self.loan()?;
        loan.write(payload)?;
        loan.publish()
    }

    pub fn unregister(mut self) -> Result<(), QueueError> {
        self.inner.teardown(Role::Publisher)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.inner.registered {
            if let Err(e) = self.inner.teardown(Role::Publisher) {
                error!("publisher teardown failed: {e}");
            }
        }
    }
}

/// A slot borrowed from the publisher's ring, not yet visible to anyone.
/// Publishing transfers ownership to the queue row; dropping an
/// unpublished loan returns the slot to the ring.
pub struct Loan<'a> {
    publisher: &'a Publisher,
    offset: u32,
    capacity: usize,
    len: usize,
    published: bool,
}

impl Loan<'_> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Copy `payload` into the loaned slot (any domain).
    pub fn write(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        let ep = &self.publisher.inner;
        let mut reg = ep.ctx.registry.lock().expect("registry poisoned");
        reg.get_or_attach(ep.alloc_id)?.copy_to(self.offset, payload)?;
        self.len = payload.len();
        Ok(())
    }

    /// Direct bytes of the slot for CPU-domain publishers; `None` when the
    /// ring lives in device memory. Callers finishing a manual fill must
    /// record the payload length with [`Loan::set_len`].
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let ep = &self.publisher.inner;
        let mut reg = ep.ctx.registry.lock().expect("registry poisoned");
        let ptr = reg.get_or_attach(ep.alloc_id).ok()?.host_ptr(self.offset)?;
        // SAFETY: the slot is exclusively ours until publish/drop, and the
        // mapping outlives the loan via the context.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, self.capacity) })
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.len = len;
    }

    /// Hand the filled slot to the queue. On failure the slot stays with
    /// the loan and goes back to the ring when it drops.
    pub fn publish(mut self) -> Result<(), QueueError> {
        let ep = &self.publisher.inner;
        if self.len == 0 {
            return Err(QueueError::InvalidArgument(
                "publishing an empty loan".into(),
            ));
        }
        let result = queue::publish(
            &ep.node,
            &ep.ctx.registry,
            ep.array_num,
            Entry {
                alloc_shmem_id: ep.alloc_id,
                offset: self.offset,
                len: self.len as u32,
            },
            ep.spin_limit(),
        );
        if result.is_ok() {
            self.published = true;
        }
        result
    }
}

impl Drop for Loan<'_> {
    fn drop(&mut self) {
        if !self.published {
            let ep = &self.publisher.inner;
            let mut reg = ep.ctx.registry.lock().expect("registry poisoned");
            if let Ok(alloc) = reg.get_or_attach(ep.alloc_id) {
                let _ = alloc.deallocate(self.offset);
            }
        }
    }
}

pub struct Subscriber {
    inner: Endpoint,
    next_index: Cell<u32>,
}

impl Subscriber {
    pub fn domain(&self) -> DomainId {
        self.inner.domain
    }

    /// Next message, or `None` when the subscriber has caught up.
    pub fn take(&self) -> Result<Option<Sample>, QueueError> {
        let ep = &self.inner;
        let taken = queue::take(
            &ep.node,
            &ep.ctx.registry,
            TakeContext {
                array_num: ep.array_num,
                depth: ep.depth,
                alloc_id: ep.alloc_id,
                next_index: &self.next_index,
            },
            ep.spin_limit(),
        )?;
        Ok(taken.map(|entry| Sample {
            ctx: ep.ctx.clone(),
            alloc_id: entry.alloc_shmem_id,
            offset: entry.offset,
            len: entry.len as usize,
        }))
    }

    pub fn unregister(mut self) -> Result<(), QueueError> {
        self.inner.teardown(Role::Subscriber)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.inner.registered {
            if let Err(e) = self.inner.teardown(Role::Subscriber) {
                error!("subscriber teardown failed: {e}");
            }
        }
    }
}

/// One taken message. Holds a reference on the underlying allocation and
/// gives it back to the owning ring on drop, wherever that ring lives.
pub struct Sample {
    ctx: Arc<ContextInner>,
    alloc_id: u32,
    offset: u32,
    len: usize,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Segment id of the allocator holding the payload.
    pub fn allocator_id(&self) -> u32 {
        self.alloc_id
    }

    /// Header-relative offset of the payload in that allocator.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Borrow the payload directly when it is CPU-addressable; `None` for
    /// device-resident samples (use [`Sample::read_into`] there).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        let mut reg = self.ctx.registry.lock().expect("registry poisoned");
        let ptr = reg.get_or_attach(self.alloc_id).ok()?.host_ptr(self.offset)?;
        // SAFETY: the context keeps the mapping attached at a stable
        // address while the sample lives; only unregistering the owning
        // endpoint drops it, and then the attach above already fails.
        Some(unsafe { std::slice::from_raw_parts(ptr, self.len) })
    }

    /// Copy the payload into `dst` (works for every domain).
    pub fn read_into(&self, dst: &mut [u8]) -> Result<(), QueueError> {
        if dst.len() < self.len {
            return Err(QueueError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold a {}-byte sample",
                dst.len(),
                self.len
            )));
        }
        let mut reg = self.ctx.registry.lock().expect("registry poisoned");
        reg.get_or_attach(self.alloc_id)?
            .copy_from(self.offset, &mut dst[..self.len])?;
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, QueueError> {
        let mut buf = vec![0u8; self.len];
        self.read_into(&mut buf)?;
        Ok(buf)
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        let mut reg = self.ctx.registry.lock().expect("registry poisoned");
        match reg.get_or_attach(self.alloc_id) {
            Ok(alloc) => {
                if let Err(e) = alloc.deallocate(self.offset) {
                    error!("sample release failed: {e}");
                }
            }
            Err(e) => error!("sample release failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::constants::alloc_segment_name;
    use std::sync::atomic::AtomicUsize;

    fn test_config(tag: &str) -> Config {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let mut cfg = Config::default();
        cfg.transport.prefix = format!(
            "hz-{tag}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );
        cfg
    }

    /// Live-allocation count of a CPU ring, observed through a fresh
    /// attachment (the way a peer process would look at it).
    fn ring_count(prefix: &str, id: AllocatorId) -> u32 {
        let seg =
            crate::shmem::ShmemSegment::attach(&alloc_segment_name(prefix, id.raw())).unwrap();
        let alloc = crate::allocator::CpuRingAllocator::from_segment(seg).unwrap();
        alloc.snapshot().0
    }

    fn drain_strings(sub: &Subscriber) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(sample) = sub.take().unwrap() {
            out.push(String::from_utf8(sample.to_vec().unwrap()).unwrap());
        }
        out
    }

    #[test]
    fn keep_last_drops_the_oldest_for_every_subscriber() {
        let cfg = test_config("keep");
        let prefix = cfg.transport.prefix.clone();
        let ctx = Context::new(cfg);

        let pub_ring = ctx.create_cpu_ring(64, 16).unwrap();
        let publisher = ctx.register_publisher("/scene/poses", pub_ring, 4).unwrap();
        let ring_a = ctx.create_cpu_ring(64, 16).unwrap();
        let sub_a = ctx.register_subscriber("/scene/poses", ring_a, 4).unwrap();
        let ring_b = ctx.create_cpu_ring(64, 16).unwrap();
        let sub_b = ctx.register_subscriber("/scene/poses", ring_b, 4).unwrap();

        for m in 1..=5 {
            publisher.publish(format!("m{m}").as_bytes()).unwrap();
        }

        // Both subscribers independently see the newest four; m1 was
        // overwritten before anyone read it.
        assert_eq!(drain_strings(&sub_a), ["m2", "m3", "m4", "m5"]);
        assert_eq!(drain_strings(&sub_b), ["m2", "m3", "m4", "m5"]);

        // Every row reached interest zero, so every payload went back to
        // the publisher's ring (same-domain takes were zero-copy).
        assert_eq!(ring_count(&prefix, pub_ring), 0);
    }

    #[test]
    fn same_domain_takes_are_zero_copy() {
        let cfg = test_config("zc");
        let ctx = Context::new(cfg);

        let pub_ring = ctx.create_cpu_ring(128, 8).unwrap();
        let publisher = ctx.register_publisher("/zc/frames", pub_ring, 4).unwrap();
        let sub_ring = ctx.create_cpu_ring(128, 8).unwrap();
        let subscriber = ctx.register_subscriber("/zc/frames", sub_ring, 4).unwrap();

        let mut loan = publisher.loan().unwrap();
        let published_offset = loan.offset();
        loan.write(b"no copies here").unwrap();
        loan.publish().unwrap();

        let sample = subscriber.take().unwrap().expect("one message pending");
        assert_eq!(sample.allocator_id(), pub_ring.raw());
        assert_eq!(sample.offset(), published_offset);
        assert_eq!(sample.as_bytes().unwrap(), b"no copies here");
    }

    #[test]
    fn first_device_taker_copies_and_the_second_reuses() {
        let cfg = test_config("dev");
        let ctx = Context::new(cfg);

        let pub_ring = ctx.create_cpu_ring(128, 8).unwrap();
        let publisher = ctx.register_publisher("/dev/imgs", pub_ring, 4).unwrap();
        let ring_1 = ctx.create_device_ring(128, 8).unwrap();
        let dev_sub_1 = ctx.register_subscriber("/dev/imgs", ring_1, 4).unwrap();
        let ring_2 = ctx.create_device_ring(128, 8).unwrap();
        let dev_sub_2 = ctx.register_subscriber("/dev/imgs", ring_2, 4).unwrap();

        publisher.publish(b"pixels").unwrap();

        // The first device-domain taker performs the host->device copy
        // into its own ring.
        let first = dev_sub_1.take().unwrap().expect("message pending");
        assert_eq!(first.allocator_id(), ring_1.raw());
        assert!(first.as_bytes().is_none(), "device samples are not host-addressable");
        assert_eq!(first.to_vec().unwrap(), b"pixels");

        // The second taker in the same domain reuses that exact copy:
        // same allocator, same offset, no further transfer.
        let second = dev_sub_2.take().unwrap().expect("message pending");
        assert_eq!(second.allocator_id(), ring_1.raw());
        assert_eq!(second.offset(), first.offset());
        assert_eq!(second.to_vec().unwrap(), b"pixels");
    }

    #[test]
    fn contending_publishers_never_tear_a_payload() {
        let cfg = test_config("race");
        let prefix = cfg.transport.prefix.clone();
        let sub_ctx = Context::new(cfg);

        let sub_ring = sub_ctx.create_cpu_ring(64, 64).unwrap();
        let subscriber = sub_ctx
            .register_subscriber("/race/bursts", sub_ring, 8)
            .unwrap();

        let seen = AtomicUsize::new(0);
        crossbeam::scope(|s| {
            for p in 0..2u8 {
                let prefix = prefix.clone();
                s.spawn(move |_| {
                    // Separate context per thread: its own registry and its
                    // own open file description on the queue, like a
                    // separate process.
                    let mut cfg = Config::default();
                    cfg.transport.prefix = prefix;
                    let ctx = Context::new(cfg);
                    let ring = ctx.create_cpu_ring(64, 64).unwrap();
                    let publisher = ctx
                        .register_publisher("/race/bursts", ring, 8)
                        .unwrap();
                    for i in 0..50u8 {
                        let payload = [p.wrapping_mul(100).wrapping_add(i); 64];
                        publisher.publish(&payload).unwrap();
                    }
                    publisher.unregister().unwrap();
                });
            }

            // Concurrent taker: whatever arrives must be internally
            // consistent, one publisher's bytes end to end.
            for _ in 0..20_000 {
                match subscriber.take().unwrap() {
                    Some(sample) => {
                        let bytes = sample.to_vec().unwrap();
                        assert_eq!(bytes.len(), 64);
                        assert!(
                            bytes.iter().all(|b| *b == bytes[0]),
                            "torn payload: {bytes:?}"
                        );
                        seen.fetch_add(1, Ordering::Relaxed);
                    }
                    None => std::thread::yield_now(),
                }
            }
        })
        .unwrap();

        assert!(seen.load(Ordering::Relaxed) > 0, "subscriber saw no messages");
    }

    #[test]
    fn empty_topics_are_rejected() {
        let ctx = Context::new(test_config("bad"));
        let ring = ctx.create_cpu_ring(8, 2).unwrap();
        assert!(matches!(
            ctx.register_publisher("///", ring, 1),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn endpoints_clean_up_behind_themselves() {
        let cfg = test_config("teardown");
        let ctx = Context::new(cfg);

        let pub_ring = ctx.create_cpu_ring(32, 4).unwrap();
        let publisher = ctx.register_publisher("/gone/soon", pub_ring, 2).unwrap();
        let sub_ring = ctx.create_cpu_ring(32, 4).unwrap();
        let subscriber = ctx
            .register_subscriber("/gone/soon", sub_ring, 2)
            .unwrap();

        publisher.publish(b"bye").unwrap();
        drop(subscriber); // implicit unregister
        publisher.unregister().unwrap();

        // Both endpoints gone: the queue segment was unlinked, so a fresh
        // registration creates a brand new queue.
        let ring2 = ctx.create_cpu_ring(32, 4).unwrap();
        let publisher2 = ctx.register_publisher("/gone/soon", ring2, 2).unwrap();
        publisher2.unregister().unwrap();
    }
}
