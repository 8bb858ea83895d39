// src/logging.rs
//! Log output setup

use anyhow::Result;
use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::io::Write;
use std::str::FromStr;

/// Install the global logger, writing to `log_file` when given and stderr otherwise
///
/// Lines look like `[2024-01-01 12:00:00] INFO [src/store/mod.rs:42] message`.
pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    let mut builder = Builder::new();
    builder.filter_level(level).format(|buf, record| {
        writeln!(
            buf,
            "[{}] {} [{}:{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(Target::Pipe(Box::new(file)));
    } else {
        builder.target(Target::Stderr);
    }
    builder.try_init()?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Parse a level name from configuration, falling back to `Info`
pub fn parse_level(name: &str) -> LevelFilter {
    LevelFilter::from_str(name).unwrap_or(LevelFilter::Info)
}
