//! `fern`-backed logging sink, grounded directly on the teacher's
//! `src/logger.rs`: a chained `Dispatch` writing to stderr and, when
//! `LogDestination file:///...` is configured, to a file as well.

use anyhow::Result;
use fern::Dispatch;

use crate::config::{Config, LogDestination};

pub fn init(config: &Config) -> Result<()> {
    let mut logger = Dispatch::new().level(config.log_level.as_level()).format(|out, message, record| {
        out.finish(format_args!(
            "[{}] - ({}) - {}",
            record.level(),
            record.file_static().unwrap_or("*"),
            message
        ))
    });

    match &config.log_destination {
        LogDestination::Stderr => {
            logger = logger.chain(std::io::stderr());
        }
        LogDestination::File(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && std::fs::metadata(parent).is_err() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = fern::log_file(path)?;
            logger = logger.chain(file);
        }
    }

    logger.apply()?;

    Ok(())
}
