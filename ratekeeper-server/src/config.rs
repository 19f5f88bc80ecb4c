//! Server configuration.
//!
//! Layered with `figment`: built-in defaults, then an optional TOML file, then
//! `RATEKEEPER_*` environment variables.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "Ratekeeper.toml";
pub const ENV_PREFIX: &str = "RATEKEEPER_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Directory holding the write-ahead log.
    pub database_dir: PathBuf,
    /// Routes the bucket introspection endpoint.
    pub debug: bool,
    pub log_level: String,
    pub json_logs: bool,
    /// Per-request deadline; the transaction is aborted when it expires.
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_dir: PathBuf::from("./db"),
            debug: false,
            log_level: "info".to_string(),
            json_logs: false,
            request_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load from `Ratekeeper.toml` in the working directory and the environment.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref()).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_file_or_env() {
        Jail::expect_with(|_jail| {
            let config = Config::load().expect("defaults load");
            assert_eq!(config, Config::default());
            assert_eq!(config.request_timeout(), Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn file_then_env_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                    port = 9000
                    debug = true
                    database_dir = "/var/lib/ratekeeper"
                "#,
            )?;
            jail.set_env("RATEKEEPER_PORT", "9100");
            jail.set_env("RATEKEEPER_JSON_LOGS", "true");

            let config = Config::load().expect("layered load");
            assert_eq!(config.port, 9100);
            assert!(config.debug);
            assert!(config.json_logs);
            assert_eq!(config.database_dir, PathBuf::from("/var/lib/ratekeeper"));
            assert_eq!(config.log_level, "info");
            Ok(())
        });
    }

    #[test]
    fn malformed_value_is_an_error() {
        Jail::expect_with(|jail| {
            jail.set_env("RATEKEEPER_PORT", "not-a-port");
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
