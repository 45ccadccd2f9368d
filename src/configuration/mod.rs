use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use std::{env, net::SocketAddr};

#[derive(Debug, Deserialize)]
pub struct RawSettings {
    pub host: String,
    pub port: u16,
    pub backends: Vec<String>,
    pub upstream_timeout_secs: u64,
}

/// Startup configuration. Upstream addresses are kept as written and are
/// validated when the backends are built.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub backends: Vec<String>,
    pub upstream_timeout: Duration,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config = Self::defaults()?
            .add_source(File::with_name(&run_mode).required(false))
            .add_source(File::with_name("config").required(run_mode == "production"))
            .add_source(Self::environment())
            .build()?;

        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let raw: RawSettings = config.try_deserialize()?;

        let listen_addr = format!("{}:{}", raw.host, raw.port)
            .parse()
            .map_err(|e| {
                ConfigError::Message(format!(
                    "invalid listen address {}:{}: {}",
                    raw.host, raw.port, e
                ))
            })?;

        Ok(Self {
            listen_addr,
            backends: raw.backends,
            upstream_timeout: Duration::from_secs(raw.upstream_timeout_secs),
        })
    }

    /// `BALANCER_*` variables; `BALANCER_BACKENDS` is a comma-separated list.
    fn environment() -> Environment {
        Environment::with_prefix("BALANCER")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("backends")
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8080)?
            .set_default("upstream_timeout_secs", 30)
    }
}
