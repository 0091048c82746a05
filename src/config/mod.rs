pub mod bind;
mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use bind::{BindConfig, BindDefaults, Endpoint, is_ipv4_address, resolve};
pub use settings::{LoggingSettings, RelaySettings, Settings};

/// Loads the runtime settings from the default file and environment variables
/// and merges them with default values.
///
/// Environment keys use the `MQRELAY_` prefix and `__` between nested keys,
/// e.g. `MQRELAY_RELAY__SUBSCRIBER_QUEUE=64`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("MQRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}
