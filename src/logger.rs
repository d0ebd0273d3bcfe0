use chrono::Local;
use fern::Dispatch;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use std::fs;

const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "compute_orchestrator.log";

/// Installs the global logger: colored output on stderr plus a plain copy in
/// `logs/compute_orchestrator.log`.
///
/// The level comes from `RUST_LOG` (`info` when unset or unparsable).
/// Lifecycle notifications reach the same sinks under the
/// `instance_lifecycle` target.
///
/// Calling it twice leaves the first logger in place.
pub fn init() {
    if let Err(e) = fs::create_dir_all(LOG_DIR) {
        eprintln!("Failed to create log directory at '{}': {}", LOG_DIR, e);
    }
    let log_file_path = format!("{}/{}", LOG_DIR, LOG_FILE);

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_level_filter = log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

    let base_config = Dispatch::new().level(log_level_filter).level_for("serde", LevelFilter::Warn);

    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::BrightBlack);
    let console_config = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr());

    let mut dispatch = base_config.chain(console_config);
    match fern::log_file(&log_file_path) {
        Ok(file) => {
            let file_config = Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "[{} {} {}] {}",
                        Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                })
                .chain(file);
            dispatch = dispatch.chain(file_config);
        }
        Err(e) => eprintln!("Failed to open log file '{}': {}; logging to console only", log_file_path, e),
    }

    if let Err(e) = dispatch.apply() {
        eprintln!("Failed to apply logger configuration: {}", e);
        return;
    }

    log::info!("Logger initialized. Logging to console and '{}'.", log_file_path);
}
