// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Anything that can be loaded by a [`ConfigLoader`]: deserializable and
/// carrying its own default so a missing config file still produces a
/// usable value.
pub trait ConfigLoaderConfig: DeserializeOwned + Default {}
impl<T: DeserializeOwned + Default> ConfigLoaderConfig for T {}

/// A single named configuration example, used when dumping the default
/// config for documentation purposes.
pub struct ConfigExample<T>(pub &'static str, pub T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>> {
        Vec::new()
    }
}

/// Loads a `T` from a TOML file merged with environment overrides, the way
/// every service in this workspace loads its configuration: the file
/// provides the base, environment variables prefixed with the config's
/// name and `__`-separated nesting override individual fields.
pub struct ConfigLoader<T> {
    pub config_file_name: PathBuf,
    env_prefix: String,
    _marker: std::marker::PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> Self {
        Self::new_with_env_prefix(config_file_name, "MIGRATOR")
    }

    pub fn new_with_env_prefix(config_file_name: &Path, env_prefix: &str) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            env_prefix: env_prefix.to_string(),
            _marker: std::marker::PhantomData,
        }
    }

    fn figment(&self) -> Figment {
        Figment::from(figment::providers::Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(&format!("{}__", self.env_prefix)).split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config unless `DUMP_CONFIG` is set, in which case it
    /// returns `None` after printing the default config to stdout -- used
    /// by the binary's `--dump-config` style debug entrypoint.
    pub fn load_or_dump_config(&self) -> Option<T>
    where
        T: SafeDisplay,
    {
        if std::env::var("DUMP_CONFIG").is_ok() {
            let config = T::default();
            println!("{}", config.to_safe_string());
            None
        } else {
            Some(self.load().unwrap_or_else(|err| {
                panic!(
                    "Failed to load config from {:?}: {err}",
                    self.config_file_name
                )
            }))
        }
    }
}

/// Accumulates several [`ConfigLoader`]s that must all read from the same
/// config file into one merged value, mirroring how a top-level service
/// config is assembled from independently-testable sub-configs.
pub struct MergedConfigLoader<T> {
    config_file_name: PathBuf,
    config: figment::Result<T>,
}

impl<T: ConfigLoaderConfig> MergedConfigLoader<T> {
    pub fn new(name: &str, config_loader: ConfigLoader<T>) -> MergedConfigLoader<T> {
        MergedConfigLoader {
            config_file_name: config_loader.config_file_name.clone(),
            config: Ok(()),
        }
        .add(name, config_loader, |_, config| config)
    }

    pub fn add<U: ConfigLoaderConfig, V>(
        self,
        name: &str,
        config_loader: ConfigLoader<U>,
        merge: fn(T, U) -> V,
    ) -> MergedConfigLoader<V> {
        if self.config_file_name != config_loader.config_file_name {
            panic!(
                "config_file_name mismatch while loading for '{}' config: {:?} <-> {:?}",
                name, self.config_file_name, config_loader.config_file_name,
            );
        }

        let config = match self.config {
            Ok(base_config) => match config_loader.load() {
                Ok(config) => Ok(merge(base_config, config)),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };

        MergedConfigLoader {
            config_file_name: self.config_file_name,
            config,
        }
    }
}

impl<T> MergedConfigLoader<T> {
    pub fn finish(self) -> figment::Result<T> {
        self.config
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum DbConfig {
    Postgres(DbPostgresConfig),
    Sqlite(DbSqliteConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(DbSqliteConfig::default())
    }
}

impl SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        match self {
            DbConfig::Postgres(config) => config.to_safe_string(),
            DbConfig::Sqlite(config) => config.to_safe_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub schema: Option<String>,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "migrator".to_string(),
            username: "migrator".to_string(),
            password: "migrator".to_string(),
            max_connections: 25,
            schema: None,
        }
    }
}

impl SafeDisplay for DbPostgresConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "username: {}", self.username);
        let _ = writeln!(&mut result, "password: ****");
        let _ = writeln!(&mut result, "max connections: {}", self.max_connections);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        Self {
            database: "../data/migrator.db".to_string(),
            max_connections: 10,
        }
    }
}

impl SafeDisplay for DbSqliteConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "max connections: {}", self.max_connections);
        result
    }
}

/// Exponential-backoff-with-jitter policy shared by every retriable
/// operation (object-store calls, repo writes).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_jitter_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_jitter_factor: Some(0.2),
        }
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "max attempts: {}, min delay: {:?}, max delay: {:?}, multiplier: {}",
            self.max_attempts, self.min_delay, self.max_delay, self.multiplier
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct ExampleConfig {
        pub retries: RetryConfig,
    }

    #[test]
    fn loads_defaults_when_file_is_absent() {
        let loader: ConfigLoader<ExampleConfig> =
            ConfigLoader::new_with_env_prefix(Path::new("does-not-exist.toml"), "MIGRATOR_TEST");
        let config = loader.load().expect("default config must always load");
        assert_eq!(config.retries.max_attempts, 5);
    }
}
