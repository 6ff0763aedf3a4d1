// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

/// Configuration for the sync engine.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub connectivity: ConnectivitySettings,
}

/// Configuration for the queue database.
#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseSettings {
    /// The SQLite file holding the queue
    ///
    /// A `.lock` file next to it guards draining.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Retry behavior of the sync coordinator.
#[derive(Deserialize, Clone, Debug)]
pub struct SyncSettings {
    #[serde(rename = "base_delay_ms", with = "duration_millis", default = "default_1s")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_millis", default = "default_5min")]
    pub max_delay: Duration,
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Upper bound of a single apply; elapsing counts as a transient failure.
    #[serde(rename = "apply_timeout_ms", with = "duration_millis", default = "default_30s")]
    pub apply_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            base_delay: default_1s(),
            max_delay: default_5min(),
            retry_ceiling: default_retry_ceiling(),
            apply_timeout: default_30s(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ConnectivitySettings {
    /// How long the network must stay reachable before syncing resumes.
    #[serde(rename = "debounce_ms", with = "duration_millis", default = "default_2s")]
    pub debounce: Duration,
    /// Start out online instead of waiting for the first reachability report.
    #[serde(default)]
    pub assume_online: bool,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            debounce: default_2s(),
            assume_online: false,
        }
    }
}

impl Settings {
    pub fn with_database_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseSettings { path: path.into() },
            ..Default::default()
        }
    }
}

/// Loads the settings from an optional YAML file, overridden by `SYNCENGINE_` environment
/// variables.
///
/// Nested keys are separated by `__`, e.g. `SYNCENGINE_SYNC__RETRY_CEILING=3`.
pub fn get_configuration(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    Config::builder()
        .add_source(File::from(path.as_ref()).format(FileFormat::Yaml).required(false))
        .add_source(
            Environment::with_prefix("SYNCENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("mutation_queue.sqlite")
}

fn default_1s() -> Duration {
    Duration::from_secs(1)
}

fn default_2s() -> Duration {
    Duration::from_secs(2)
}

fn default_30s() -> Duration {
    Duration::from_secs(30)
}

fn default_5min() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_retry_ceiling() -> u32 {
    8
}

mod duration_millis {
    use serde::de;

    use std::time::Duration;

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let millis: u64 = serde::Deserialize::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let settings = get_configuration(dir.path().join("absent.yaml"))?;

        assert_eq!(settings.database.path, PathBuf::from("mutation_queue.sqlite"));
        assert_eq!(settings.sync.base_delay, Duration::from_secs(1));
        assert_eq!(settings.sync.max_delay, Duration::from_secs(300));
        assert_eq!(settings.sync.retry_ceiling, 8);
        assert_eq!(settings.sync.apply_timeout, Duration::from_secs(30));
        assert_eq!(settings.connectivity.debounce, Duration::from_secs(2));
        assert!(!settings.connectivity.assume_online);
        Ok(())
    }

    #[test]
    fn reads_yaml() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("syncengine.yaml");
        fs::write(
            &path,
            "database:\n  path: /var/lib/tickets/queue.sqlite\n\
             sync:\n  base_delay_ms: 250\n  retry_ceiling: 3\n\
             connectivity:\n  assume_online: true\n",
        )?;

        let settings = get_configuration(&path)?;
        assert_eq!(
            settings.database.path,
            PathBuf::from("/var/lib/tickets/queue.sqlite")
        );
        assert_eq!(settings.sync.base_delay, Duration::from_millis(250));
        assert_eq!(settings.sync.retry_ceiling, 3);
        // Unset keys keep their defaults.
        assert_eq!(settings.sync.max_delay, Duration::from_secs(300));
        assert!(settings.connectivity.assume_online);
        assert_eq!(settings.connectivity.debounce, Duration::from_secs(2));
        Ok(())
    }
}
