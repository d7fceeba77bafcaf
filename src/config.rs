use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: Byte,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    #[serde(default = "default_database_url")]
    pub database_url: String,
}

#[derive(Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,

    #[serde(default)]
    pub require_totp: bool,

    /// `"name1:SECRET1,name2:SECRET2"` — required iff `require_totp`.
    #[serde(default)]
    pub totp_secrets: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_abandoned_after_secs")]
    pub abandoned_after_secs: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            abandoned_after_secs: default_abandoned_after_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_payload_size() -> Byte {
    Byte::from_u64_with_unit(512, byte_unit::Unit::MiB).unwrap()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_database_url() -> String {
    "sqlite://data/chestd.sqlite3?mode=rwc".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_abandoned_after_secs() -> i64 {
    172_800
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if config_path.is_none() {
            #[cfg(not(debug_assertions))]
            {
                builder =
                    builder.add_source(config::File::with_name("/etc/chestd/config").required(false));
            }

            #[cfg(debug_assertions)]
            {
                builder = builder.add_source(config::File::with_name("config").required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(config::Environment::with_prefix("CHESTD").separator("__"));

        let config = builder.build().map_err(|e| Error::Internal {
            msg: format!("failed to load configuration: {e}"),
        })?;

        let mut config: Self = config.try_deserialize().map_err(|e| Error::Internal {
            msg: format!("failed to deserialize configuration: {e}"),
        })?;

        if config.auth.jwt_secret.trim().is_empty() {
            return Err(Error::Internal {
                msg: "auth.jwt_secret is required and must not be empty".to_string(),
            });
        }

        if config.auth.require_totp && config.auth.totp_secrets.trim().is_empty() {
            return Err(Error::Internal {
                msg: "auth.totp_secrets is required when auth.require_totp is enabled".to_string(),
            });
        }

        if !config.storage.data_path.is_absolute() {
            let cwd = std::env::current_dir().map_err(|e| Error::Internal {
                msg: format!("failed to get current directory: {e}"),
            })?;
            config.storage.data_path = cwd.join(&config.storage.data_path);
        }

        if let Ok(canonical) = config.storage.data_path.canonicalize() {
            config.storage.data_path = canonical;
        }

        Ok(config)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "max_payload_size",
                &format!(
                    "{}",
                    self.max_payload_size
                        .get_appropriate_unit(byte_unit::UnitType::Binary)
                ),
            )
            .finish()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("require_totp", &self.require_totp)
            .field(
                "totp_secrets",
                &if self.totp_secrets.is_empty() {
                    "<empty>"
                } else {
                    "<redacted>"
                },
            )
            .finish()
    }
}
