//! Configuration file discovery.
//!
//! Resolution order: CLI argument → `CPUWATCH_CONFIG` → XDG config dir → defaults.

use std::path::{Path, PathBuf};

/// Env var naming a config file.
pub const CONFIG_ENV: &str = "CPUWATCH_CONFIG";

/// Application directory under the user config dir.
pub const APP_NAME: &str = "cpuwatch";

/// Config file name inside the application directory.
pub const CONFIG_FILENAME: &str = "config.toml";

/// Where the configuration came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    CliArgument(PathBuf),
    Environment(PathBuf),
    XdgConfig(PathBuf),
    #[default]
    BuiltinDefault,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::CliArgument(p)
            | ConfigSource::Environment(p)
            | ConfigSource::XdgConfig(p) => Some(p),
            ConfigSource::BuiltinDefault => None,
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument(p) => write!(f, "CLI argument ({})", p.display()),
            ConfigSource::Environment(p) => write!(f, "{CONFIG_ENV} ({})", p.display()),
            ConfigSource::XdgConfig(p) => write!(f, "XDG config ({})", p.display()),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// Default config path: `<config_dir>/cpuwatch/config.toml`.
pub fn xdg_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILENAME))
}

/// Pick the config file for this run from the process environment.
pub fn resolve_config_path(cli_path: Option<&Path>) -> ConfigSource {
    resolve_with(
        cli_path,
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        xdg_config_path(),
    )
}

/// Resolution with explicit inputs.
///
/// Explicit paths (CLI, env) are returned even if missing so the caller
/// reports them; the XDG path is only used when the file exists.
pub fn resolve_with(
    cli_path: Option<&Path>,
    env_path: Option<PathBuf>,
    xdg_path: Option<PathBuf>,
) -> ConfigSource {
    if let Some(path) = cli_path {
        return ConfigSource::CliArgument(path.to_path_buf());
    }
    if let Some(path) = env_path.filter(|p| !p.as_os_str().is_empty()) {
        return ConfigSource::Environment(path);
    }
    match xdg_path {
        Some(path) if path.is_file() => ConfigSource::XdgConfig(path),
        _ => ConfigSource::BuiltinDefault,
    }
}
