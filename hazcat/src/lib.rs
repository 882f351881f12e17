//! Heterogeneous zero-copy pub/sub over shared memory.
//!
//! Processes on one host exchange messages across memory domains (host
//! RAM, GPU pools, or the host-backed emulated device) through per-topic
//! shared rings. A payload is written once into the publisher's ring
//! allocator; subscribers in the same domain take it by reference, and the
//! first subscriber in any other domain triggers the single lazy copy that
//! domain will ever see for that message.
//!
//! ```no_run
//! use hazcat::{Config, Context};
//!
//! let ctx = Context::new(Config::default());
//! let ring = ctx.create_cpu_ring(256, 32)?;
//! let publisher = ctx.register_publisher("/chatter", ring, 8)?;
//! let sub_ring = ctx.create_cpu_ring(256, 32)?;
//! let subscriber = ctx.register_subscriber("/chatter", sub_ring, 8)?;
//!
//! publisher.publish(b"hello")?;
//! if let Some(sample) = subscriber.take()? {
//!     assert_eq!(sample.as_bytes().unwrap(), b"hello");
//! }
//! # Ok::<(), hazcat::errors::QueueError>(())
//! ```

pub mod allocator;
pub mod config;
pub mod context;
pub mod logger;
mod queue;
mod shmem;
mod spin;

pub use config::Config;
pub use context::{AllocatorId, Context, Loan, Publisher, Sample, Subscriber};
pub use shared::domain::{DeviceType, DomainId, Strategy};
pub use shared::errors;
