use std::env;

use config::{Config, ConfigError, Environment, File, FileFormat, Source};
use serde::Deserialize;
use validator::Validate;
use virtual_file::VirtualFileConfig;

const DEFAULT_CONFIG: &str = include_str!("../config/config.yaml");

const MB: usize = 1024 * 1024;

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct ServiceConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub http_port: u16,
    /// Path the virtual file is served under
    #[validate(length(min = 1))]
    pub route: String,
    /// Number of actix workers, `0` or unset picks one per CPU
    #[serde(default)]
    pub max_workers: Option<usize>,
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct Settings {
    #[serde(default)]
    pub log_level: Option<String>,
    #[validate]
    pub service: ServiceConfig,
    #[validate]
    pub file: VirtualFileConfig,
    /// A list of messages for errors that happened during loading the configuration. We collect
    /// them and store them here while loading because then our logger is not configured yet.
    #[serde(default, skip)]
    pub load_errors: Vec<LogMsg>,
}

/// Values given on the command line, taking precedence over every config source.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub url: Option<String>,
    pub cache_mb: Option<usize>,
    pub block_mb: Option<usize>,
    pub threads: Option<usize>,
}

impl Settings {
    pub fn new(custom_config_path: Option<String>) -> Result<Self, ConfigError> {
        let mut load_errors = vec![];
        let config_exists = |path| File::with_name(path).collect().is_ok();

        if let Some(ref path) = custom_config_path {
            if !config_exists(path) {
                load_errors.push(LogMsg::Error(format!(
                    "Config file via --config-path is not found: {path}"
                )));
            }
        }

        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_path_env = format!("config/{env}");

        // Only the built-in defaults are required, missing files are worth a warning
        if !config_exists("config/config") {
            load_errors.push(LogMsg::Warn("Config file not found: config/config".to_string()));
        }
        if !config_exists(&config_path_env) {
            load_errors.push(LogMsg::Warn(format!(
                "Config file not found: {config_path_env}"
            )));
        }

        let mut config = Config::builder()
            // Start with compile-time base config
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Yaml))
            .add_source(File::with_name("config/config").required(false))
            // Uses RUN_MODE, defaults to 'development'
            .add_source(File::with_name(&config_path_env).required(false))
            // Local config, not tracked in git
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = custom_config_path {
            config = config.add_source(File::with_name(&path).required(false));
        }

        // E.g.: `HTTP_PUMP__SERVICE__HTTP_PORT=9000 ./target/http-pump` would set `service.http_port`
        config = config.add_source(Environment::with_prefix("HTTP_PUMP").separator("__"));

        let mut settings: Settings = config.build()?.try_deserialize()?;
        settings.load_errors.extend(load_errors);
        Ok(settings)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            url,
            cache_mb,
            block_mb,
            threads,
        } = overrides;
        if let Some(url) = url {
            self.file.url = url;
        }
        if let Some(cache_mb) = cache_mb {
            self.file.cache_size = cache_mb.saturating_mul(MB);
        }
        if let Some(block_mb) = block_mb {
            self.file.block_size = block_mb.saturating_mul(MB);
        }
        if let Some(threads) = threads {
            self.file.max_workers = threads;
        }
    }

    pub fn validate_and_warn(&self) {
        self.load_errors.iter().for_each(LogMsg::log);

        if let Err(ref errs) = self.validate() {
            log::warn!("Settings validation failed: {errs}");
        }
    }
}

/// Returns the number of actix workers.
pub fn max_web_workers(settings: &Settings) -> usize {
    match settings.service.max_workers {
        Some(0) | None => std::thread::available_parallelism()
            .map(|cpus| cpus.get())
            .unwrap_or(1),
        Some(max_workers) => max_workers,
    }
}

#[derive(Clone, Debug)]
pub enum LogMsg {
    Warn(String),
    Error(String),
}

impl LogMsg {
    fn log(&self) {
        match self {
            Self::Warn(msg) => log::warn!("{msg}"),
            Self::Error(msg) => log::error!("{msg}"),
        }
    }
}
