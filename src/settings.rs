use std::env;

use cache::CacheConfig;
use config::{Config, ConfigError, Environment, File, FileFormat, Source};
use fetch::FetchConfig;
use serde::Deserialize;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

const DEFAULT_CONFIG: &str = include_str!("../config/config.yaml");

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[validate]
    pub cache: CacheConfig,
    #[serde(default)]
    #[validate]
    pub fetch: FetchConfig,
    /// A list of messages for errors that happened during loading the configuration. We collect
    /// them and store them here while loading because then our logger is not configured yet.
    /// We therefore need to log these messages later, after the logger is ready.
    #[serde(default, skip)]
    pub load_errors: Vec<LogMsg>,
}

impl Settings {
    pub fn new(custom_config_path: Option<String>) -> Result<Self, ConfigError> {
        let mut load_errors = vec![];
        let config_exists = |path| File::with_name(path).collect().is_ok();

        // Check if custom config file exists, report error if not
        if let Some(ref path) = custom_config_path {
            if !config_exists(path) {
                load_errors.push(LogMsg::Error(format!(
                    "Config file via --config-path is not found: {path}"
                )));
            }
        }

        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_path_env = format!("config/{env}");

        load_errors.extend(
            ["config/config", &config_path_env]
                .into_iter()
                .filter(|path| !config_exists(path))
                .map(|path| LogMsg::Warn(format!("Config file not found: {path}"))),
        );

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

        // E.g.: `TEXFETCH__CACHE__READ_ONLY=true ./texfetch stats`
        config = config.add_source(Environment::with_prefix("TEXFETCH").separator("__"));

        let mut settings: Settings = config.build()?.try_deserialize()?;
        settings.load_errors.extend(load_errors);
        Ok(settings)
    }

    pub fn validate_and_warn(&self) {
        // Print any load error messages we had
        self.load_errors.iter().for_each(LogMsg::log);

        if let Err(ref errs) = self.validate() {
            warn_validation_errors("Settings configuration file", errs);
        }
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

/// Warn about every validation error, one line per invalid field.
fn warn_validation_errors(description: &str, errs: &ValidationErrors) {
    log::warn!("{description} has validation errors:");
    for (path, message) in describe_errors(errs) {
        log::warn!("- {path}: {message}");
    }
}

fn describe_errors(errs: &ValidationErrors) -> Vec<(String, String)> {
    let mut described = Vec::new();
    for (field, kind) in errs.errors() {
        match kind {
            ValidationErrorsKind::Field(errors) => {
                for error in errors {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| error.code.to_string(), ToString::to_string);
                    described.push((field.to_string(), message));
                }
            }
            ValidationErrorsKind::Struct(inner) => {
                described.extend(
                    describe_errors(inner)
                        .into_iter()
                        .map(|(path, message)| (format!("{field}.{path}"), message)),
                );
            }
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    described.extend(
                        describe_errors(inner)
                            .into_iter()
                            .map(|(path, message)| (format!("{field}[{index}].{path}"), message)),
                    );
                }
            }
        }
    }
    described
}

fn default_log_level() -> String {
    "INFO".to_string()
}
