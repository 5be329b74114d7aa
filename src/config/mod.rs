mod settings;

use config::{Config, ConfigError, Environment, File};
use tracing::debug;

use settings::PartialSettings;

pub use settings::{BrokerSettings, ReconnectSettings, SessionSettings, Settings};

/// Prefix of environment overrides, e.g. `POPSUB__SESSION__URL`.
pub const ENV_PREFIX: &str = "POPSUB";

/// Loads the configuration from `.env`, the optional `config/default` file and
/// `POPSUB__*` environment variables, merged over default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    match dotenvy::dotenv() {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => return Err(ConfigError::Foreign(Box::new(e))),
    }
    load_config_from("config/default")
}

/// Same as `load_config` with an explicit file name (extension optional) and
/// without reading `.env`.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
