use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitoring::SchedulerSettings;

pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";
pub const APP_ENV: &str = "APP_ENV";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to write config {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
    #[error("workers must be at least 1")]
    NoWorkers,
    #[error("tick_ms must be at least 1")]
    ZeroTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl Environment {
    /// Anything other than `prod` / `production` is treated as development.
    pub fn from_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            _ => Self::Dev,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Prod
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dev => "dev",
            Self::Prod => "prod",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    pub database: Database,
    pub scheduler: Scheduler,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: path::PathBuf,
    pub max_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scheduler {
    pub tick_ms: u64,
    pub workers: usize,
    /// Locks older than this are considered abandoned. Unset keeps them forever.
    pub lock_lease_secs: Option<u64>,
}

impl Default for Database {
    fn default() -> Self {
        Self { path: path::PathBuf::from("shraga.db"), max_connections: 16 }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        let settings = SchedulerSettings::default();
        Self {
            tick_ms: settings.tick.as_millis() as u64,
            workers: settings.workers,
            lock_lease_secs: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            database: Database::default(),
            scheduler: Scheduler::default(),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/shraga/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("shraga/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Environment")?;
        write_1(f, "Mode", &self.environment)?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;
        write_1(f, "Max Connections", &self.database.max_connections)?;
        write_title_1(f, "Scheduler")?;
        write_1(f, "Tick (ms)", &self.scheduler.tick_ms)?;
        write_1(f, "Workers", &self.scheduler.workers)?;
        match self.scheduler.lock_lease_secs {
            Some(secs) => write_1(f, "Lock Lease (s)", &secs)?,
            None => write_1(f, "Lock Lease", &"disabled")?,
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/shraga/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            let config: Self = toml::from_str(raw_string.as_str())?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Apply `DATABASE_PATH` and `APP_ENV` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(env::var(DATABASE_PATH_ENV).ok(), env::var(APP_ENV).ok());
    }

    fn apply_overrides(&mut self, database_path: Option<String>, app_env: Option<String>) {
        if let Some(path) = database_path.filter(|p| !p.trim().is_empty()) {
            self.database.path = path::PathBuf::from(path);
        }
        if let Some(value) = app_env {
            self.environment = Environment::from_value(&value);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.scheduler.tick_ms == 0 {
            return Err(ConfigError::ZeroTick);
        }
        Ok(())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick: Duration::from_millis(self.scheduler.tick_ms),
            workers: self.scheduler.workers,
        }
    }

    pub fn lock_lease(&self) -> Option<Duration> {
        self.scheduler.lock_lease_secs.map(Duration::from_secs)
    }
}
