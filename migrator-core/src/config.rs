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

use migrator_common::config::{ConfigLoader, DbConfig, RetryConfig};
use migrator_common::tracing_setup::TracingConfig;
use migrator_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigratorConfig {
    pub tracing: TracingConfig,
    pub db: DbConfig,
    pub source: ObjectStoreConfig,
    pub destination: ObjectStoreConfig,
    pub pool: ConnectionPoolConfig,
    pub memory: MemoryConfig,
    pub tuner: TunerConfig,
    pub network: NetworkConfig,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("migrator-coordinatord"),
            db: DbConfig::default(),
            source: ObjectStoreConfig::default(),
            destination: ObjectStoreConfig::default(),
            pool: ConnectionPoolConfig::default(),
            memory: MemoryConfig::default(),
            tuner: TunerConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl SafeDisplay for MigratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "db:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "source:");
        let _ = writeln!(&mut result, "{}", self.source.to_safe_string_indented());
        let _ = writeln!(&mut result, "destination:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.destination.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "pool:");
        let _ = writeln!(&mut result, "{}", self.pool.to_safe_string_indented());
        let _ = writeln!(&mut result, "memory:");
        let _ = writeln!(&mut result, "{}", self.memory.to_safe_string_indented());
        let _ = writeln!(&mut result, "tuner:");
        let _ = writeln!(&mut result, "{}", self.tuner.to_safe_string_indented());
        let _ = writeln!(&mut result, "network:");
        let _ = writeln!(&mut result, "{}", self.network.to_safe_string_indented());
        result
    }
}

/// Modeled on the teacher's `S3BlobStorageConfig` (`region`,
/// `object_prefix`, `aws_endpoint_url`, `use_minio_credentials`,
/// `retries`): one of these describes the source or the destination
/// object store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub use_path_style: bool,
    pub retries: RetryConfig,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: "".to_string(),
            secret_access_key: "".to_string(),
            use_path_style: false,
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for ObjectStoreConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "endpoint: {}",
            self.endpoint.as_deref().unwrap_or("(default AWS)")
        );
        let _ = writeln!(&mut result, "region: {}", self.region);
        let _ = writeln!(&mut result, "access key id: {}", self.access_key_id);
        let _ = writeln!(&mut result, "secret access key: ****");
        let _ = writeln!(&mut result, "use path style: {}", self.use_path_style);
        let _ = writeln!(&mut result, "retries: {}", self.retries.to_safe_string());
        result
    }
}

/// Connection-pool sizing (C1, spec §4.1). Destination pool is configured
/// at twice the source pool to reflect PUT asymmetry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    pub source_pool_size: usize,
    pub destination_pool_size: usize,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            source_pool_size: 25,
            destination_pool_size: 50,
        }
    }
}

impl SafeDisplay for ConnectionPoolConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "source pool size: {}, destination pool size: {}",
            self.source_pool_size, self.destination_pool_size
        )
    }
}

/// Memory manager configuration (C5, spec §4.5). `ceiling_bytes` falls
/// back to `MIGRATOR_MEMORY_LIMIT_BYTES` at startup when unset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub ceiling_bytes: Option<u64>,
    pub safe_threshold: f64,
    pub gc_trigger_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: None,
            safe_threshold: 0.80,
            gc_trigger_threshold: 0.60,
        }
    }
}

impl MemoryConfig {
    /// Reads the soft memory ceiling the way the source reads `GOMEMLIMIT`:
    /// from an environment variable, falling back to whatever is
    /// configured, falling back to a conservative 1 GiB default.
    pub fn resolve_ceiling_bytes(&self) -> u64 {
        std::env::var("MIGRATOR_MEMORY_LIMIT_BYTES")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.ceiling_bytes)
            .unwrap_or(1024 * 1024 * 1024)
    }
}

impl SafeDisplay for MemoryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "ceiling bytes: {:?}, safe threshold: {}, gc trigger threshold: {}",
            self.ceiling_bytes, self.safe_threshold, self.gc_trigger_threshold
        )
    }
}

/// Adaptive tuner configuration (C6, spec §4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunerConfig {
    #[serde(with = "humantime_serde")]
    pub adjustment_interval: std::time::Duration,
    pub adjustment_threshold_samples: usize,
    pub upward_move_percent: f64,
    pub upward_move_min_absolute: u32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            adjustment_interval: std::time::Duration::from_secs(30),
            adjustment_threshold_samples: 5,
            upward_move_percent: 0.25,
            upward_move_min_absolute: 2,
        }
    }
}

impl SafeDisplay for TunerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "adjustment interval: {:?}, threshold samples: {}, upward move: {}% / +{}",
            self.adjustment_interval,
            self.upward_move_percent * 100.0,
            self.upward_move_min_absolute
        )
    }
}

/// Network monitor configuration (C4, spec §4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ewma_alpha: f64,
    pub sample_window: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.25,
            sample_window: 64,
        }
    }
}

impl SafeDisplay for NetworkConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "ewma alpha: {}, sample window: {}",
            self.ewma_alpha, self.sample_window
        )
    }
}

pub fn make_config_loader() -> ConfigLoader<MigratorConfig> {
    ConfigLoader::new(&PathBuf::from("config/migrator.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }

    #[test]
    fn memory_ceiling_env_override_wins() {
        std::env::set_var("MIGRATOR_MEMORY_LIMIT_BYTES", "2048");
        let config = MemoryConfig::default();
        assert_eq!(config.resolve_ceiling_bytes(), 2048);
        std::env::remove_var("MIGRATOR_MEMORY_LIMIT_BYTES");
    }
}
