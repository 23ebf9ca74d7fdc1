//! Console and optional rotating-file logging on top of `tracing`.

use std::{fs, path::Path, sync::OnceLock};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;
pub mod writer;

pub use formatter::*;
pub use writer::*;

use crate::{common::errors::AnyResult, configs::Config};

pub(crate) static GLOBAL_FILE_WRITER: OnceLock<CircularFileWriter> = OnceLock::new();

#[macro_export]
macro_rules! log_println {
    () => {{
        std::println!();
        $crate::common::logger::append_to_file_raw("\n");
    }};
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        std::println!("{}", msg);
        $crate::common::logger::append_to_file_raw(&format!("{}\n", msg));
    }};
}

/// Mirrors raw console output (banner, summaries) into the log file.
pub fn append_to_file_raw(msg: &str) {
    if let Some(mut writer) = GLOBAL_FILE_WRITER.get().cloned() {
        use std::io::Write;
        let _ = writer.write_all(strip_ansi_escapes(msg).as_bytes());
    }
}

/// Builds the filter directive from the configured level and extra filters.
pub fn filter_directive(config: &Config) -> String {
    let logging = config.logging.as_ref();
    let level = logging.and_then(|l| l.level.as_deref()).unwrap_or("info");
    match logging.and_then(|l| l.filters.as_deref()) {
        Some(filters) if !filters.is_empty() => format!("{level},{filters}"),
        _ => level.to_string(),
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// filter.
pub fn init(config: &Config) -> AnyResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let stdout_layer = fmt::layer()
        .event_format(CustomFormatter::new(true))
        .with_ansi(true);

    let file_layer = match config.logging.as_ref().and_then(|l| l.file.as_ref()) {
        Some(file_config) => {
            if let Some(parent) = Path::new(&file_config.path).parent() {
                fs::create_dir_all(parent)?;
            }
            let writer = CircularFileWriter::new(file_config.path.clone(), file_config.max_lines);
            let _ = GLOBAL_FILE_WRITER.set(writer.clone());
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .event_format(CustomFormatter::new(false))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}
