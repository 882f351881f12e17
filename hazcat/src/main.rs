//! Loopback demonstration: one CPU publisher, one CPU subscriber, and one
//! emulated-device subscriber on a single topic, all in this process.

use anyhow::Context as _;
use hazcat::{logger, Config, Context};
use log::info;

fn main() -> anyhow::Result<()> {
    logger::init_logger().map_err(|e| anyhow::anyhow!("logger setup failed: {e}"))?;

    let config = Config::resolve().context("loading configuration")?;
    let ctx = Context::new(config);

    let pub_ring = ctx.create_cpu_ring(256, 32)?;
    let publisher = ctx
        .register_publisher("/demo/chatter", pub_ring, 8)
        .context("registering publisher")?;

    let sub_ring = ctx.create_cpu_ring(256, 32)?;
    let subscriber = ctx
        .register_subscriber("/demo/chatter", sub_ring, 8)
        .context("registering CPU subscriber")?;

    let dev_ring = ctx.create_device_ring(256, 32)?;
    let dev_subscriber = ctx
        .register_subscriber("/demo/chatter", dev_ring, 8)
        .context("registering device subscriber")?;

    for i in 0..16u32 {
        let payload = format!("message {i} from the demo publisher");
        publisher.publish(payload.as_bytes())?;

        if let Some(sample) = subscriber.take()? {
            info!(
                "cpu subscriber got {} bytes (zero-copy): {}",
                sample.len(),
                String::from_utf8_lossy(sample.as_bytes().unwrap_or_default())
            );
        }
        if let Some(sample) = dev_subscriber.take()? {
            let bytes = sample.to_vec()?;
            info!(
                "device subscriber got {} bytes (one lazy copy): {}",
                bytes.len(),
                String::from_utf8_lossy(&bytes)
            );
        }
    }

    dev_subscriber.unregister()?;
    subscriber.unregister()?;
    publisher.unregister()?;
    info!("demo complete");
    Ok(())
}
