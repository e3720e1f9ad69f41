use std::path::Path;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use machload::{CpuState, LoaderConfig};
use serde::{Deserialize, Serialize};

/// Configuration for the CLI.
#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address windows, patch sites and other loader options.
    #[serde(default)]
    pub loader: LoaderConfig,
    /// State of the CPU the kernel is being loaded for.
    #[serde(default)]
    pub cpu: CpuState,
}

/// Load a config file from a given path. Path must contain a valid TOML file
/// or this function will propagate the error. Options missing from the file
/// take their default values.
pub fn load_config_from_file(
    config_file: &Path,
) -> Result<Config, Box<figment::Error>> {
    let config: Config =
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file_exact(config_file))
            .extract()?;
    Ok(config)
}
