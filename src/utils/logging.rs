use tracing::Level;

/// Overrides the level passed to `init`, e.g. `POPSUB_LOG=debug`.
pub const LOG_ENV: &str = "POPSUB_LOG";

pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global `tracing` subscriber at the level named by `POPSUB_LOG`,
/// or `default_level` when unset. Unknown names mean `info`. Only the first
/// call has an effect.
pub fn init(default_level: &str) {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|name| parse_level(&name))
        .or_else(|| parse_level(default_level))
        .unwrap_or(Level::INFO);

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
