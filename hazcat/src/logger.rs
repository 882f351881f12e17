use log::LevelFilter;
use std::thread;
use std::time::SystemTime;

/// Initializes the logger with custom formatting.
pub fn init_logger() -> Result<(), Box<dyn std::error::Error>> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{:<5}] [{}:{}] [{}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.file().unwrap_or("<unknown>"),
                record.line().unwrap_or(0),
                thread::current().name().unwrap_or("<unnamed>"),
                message
            ))
        })
        .level(LevelFilter::Info)
        .level_for("hazcat", LevelFilter::Debug)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
