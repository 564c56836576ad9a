// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector configuration.
//!
//! Built from defaults, then a YAML file, then `EASYDISPATCH_*` environment
//! variables; later sources win.

pub mod env;
pub mod log_level;
pub mod yaml;

use crate::commands::UnavailablePolicy;
use crate::delivery::{DeliveryConfig, RetryStrategy};
use crate::errors::ConfigError;
use crate::tailer::TailerConfig;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

use self::{env::EnvConfigSource, log_level::LogLevel, yaml::YamlConfigSource};

/// Replaces the config field when the source field is set.
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
}

/// Like `merge_option_to_value!` for whole seconds.
macro_rules! merge_secs {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(secs) = $source.$source_field {
            $config.$config_field = std::time::Duration::from_secs(secs);
        }
    };
}

/// Like `merge_option_to_value!` for milliseconds.
macro_rules! merge_millis {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(millis) = $source.$source_field {
            $config.$config_field = std::time::Duration::from_millis(millis);
        }
    };
}

pub(crate) use {merge_millis, merge_option_to_value, merge_secs};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // API
    pub api_endpoint: String,
    pub api_key: String,
    pub api_timeout: Duration,
    pub api_retry_attempts: u32,
    pub api_retry_backoff_base: Duration,
    pub installation_id: String,

    // Host
    pub mmdvm_log_path: PathBuf,
    pub mmdvm_config_path: PathBuf,
    pub dmr_id: u32,
    pub log_file_wait: Duration,
    pub log_idle_poll: Duration,

    // Background loops
    pub commands_interval: Duration,
    pub cleanup_interval: Duration,
    pub queue_path: PathBuf,
    pub queue_drain_interval: Duration,
    pub queue_cooldown: Duration,
    pub audio_max_age: Duration,

    // Remote commands
    pub tool_timeout: Duration,
    pub unavailable_policy: UnavailablePolicy,

    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_endpoint: String::new(),
            api_key: String::new(),
            api_timeout: Duration::from_secs(30),
            api_retry_attempts: 3,
            api_retry_backoff_base: Duration::from_secs(1),
            installation_id: "UNKNOWN".to_string(),

            mmdvm_log_path: PathBuf::from("/var/log/pi-star/MMDVM.log"),
            mmdvm_config_path: PathBuf::from("/etc/mmdvmhost"),
            dmr_id: 2_222_000,
            log_file_wait: Duration::from_secs(5),
            log_idle_poll: Duration::from_millis(100),

            commands_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            queue_path: PathBuf::from("/var/lib/easydispatch/offline_queue.json"),
            queue_drain_interval: Duration::from_secs(10),
            queue_cooldown: Duration::from_secs(60),
            audio_max_age: Duration::from_secs(24 * 3600),

            tool_timeout: Duration::from_secs(10),
            unavailable_policy: UnavailablePolicy::TreatAsSuccess,

            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Rejects configurations the collector cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("api.endpoint"));
        }
        if !(self.api_endpoint.starts_with("http://") || self.api_endpoint.starts_with("https://"))
        {
            return Err(ConfigError::Invalid {
                field: "api.endpoint",
                reason: format!("'{}' is not an http(s) URL", self.api_endpoint),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("api.key"));
        }
        if self.api_retry_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "api.retry_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        let intervals = [
            ("api.timeout", self.api_timeout),
            ("mmdvm.file_wait", self.log_file_wait),
            ("mmdvm.idle_poll", self.log_idle_poll),
            ("polling.commands_interval", self.commands_interval),
            ("polling.cleanup_interval", self.cleanup_interval),
            ("queue.drain_interval", self.queue_drain_interval),
            ("queue.cooldown", self.queue_cooldown),
            ("commands.tool_timeout", self.tool_timeout),
        ];
        if let Some(&(field, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::ExponentialBackoff {
            attempts: self.api_retry_attempts,
            base: self.api_retry_backoff_base,
        }
    }

    #[must_use]
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            endpoint: self.api_endpoint.clone(),
            api_key: self.api_key.clone(),
            timeout: self.api_timeout,
            retry_strategy: self.retry_strategy(),
            installation_id: self.installation_id.clone(),
        }
    }

    #[must_use]
    pub fn tailer(&self) -> TailerConfig {
        TailerConfig {
            path: self.mmdvm_log_path.clone(),
            file_wait: self.log_file_wait,
            idle_poll: self.log_idle_poll,
        }
    }
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Applies every source in order. The first failing source aborts the
    /// build; the result is not validated.
    pub fn build(mut self) -> Result<Config, ConfigError> {
        for source in &self.sources {
            source.load(&mut self.config)?;
        }
        debug!("Loaded config from {} sources", self.sources.len());
        Ok(self.config)
    }
}

/// Defaults, then `path`, then the environment.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource {
            path: path.to_path_buf(),
        }))
        .add_source(Box::new(EnvConfigSource))
        .build()
}

pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        other => {
            error!("Failed to parse value, expected a string or an integer, got: {other}, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_option_lossless<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Option::<T>::deserialize(deserializer) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to deserialize optional value: {e}, ignoring");
            Ok(None)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            api_endpoint: "https://dispatch.example.org/api/v1".to_string(),
            api_key: "secret".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_timeout, Duration::from_secs(30));
        assert_eq!(config.api_retry_attempts, 3);
        assert_eq!(config.installation_id, "UNKNOWN");
        assert_eq!(config.dmr_id, 2_222_000);
        assert_eq!(
            config.queue_path,
            PathBuf::from("/var/lib/easydispatch/offline_queue.json")
        );
        assert_eq!(config.queue_cooldown, Duration::from_secs(60));
        assert_eq!(config.audio_max_age, Duration::from_secs(86_400));
        assert_eq!(config.unavailable_policy, UnavailablePolicy::TreatAsSuccess);
    }

    #[test]
    fn test_validate() {
        assert_eq!(valid().validate(), Ok(()));
        assert_eq!(
            Config::default().validate(),
            Err(ConfigError::Missing("api.endpoint"))
        );
        assert_eq!(
            Config {
                api_key: String::new(),
                ..valid()
            }
            .validate(),
            Err(ConfigError::Missing("api.key"))
        );
        assert!(matches!(
            Config {
                api_retry_attempts: 0,
                ..valid()
            }
            .validate(),
            Err(ConfigError::Invalid {
                field: "api.retry_attempts",
                ..
            })
        ));
        assert!(matches!(
            Config {
                api_endpoint: "dispatch.example.org".to_string(),
                ..valid()
            }
            .validate(),
            Err(ConfigError::Invalid {
                field: "api.endpoint",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let cases = [
            (
                "api.timeout",
                Config {
                    api_timeout: Duration::ZERO,
                    ..valid()
                },
            ),
            (
                "mmdvm.file_wait",
                Config {
                    log_file_wait: Duration::ZERO,
                    ..valid()
                },
            ),
            (
                "mmdvm.idle_poll",
                Config {
                    log_idle_poll: Duration::ZERO,
                    ..valid()
                },
            ),
            (
                "polling.commands_interval",
                Config {
                    commands_interval: Duration::ZERO,
                    ..valid()
                },
            ),
            (
                "polling.cleanup_interval",
                Config {
                    cleanup_interval: Duration::ZERO,
                    ..valid()
                },
            ),
            (
                "queue.drain_interval",
                Config {
                    queue_drain_interval: Duration::ZERO,
                    ..valid()
                },
            ),
            (
                "queue.cooldown",
                Config {
                    queue_cooldown: Duration::ZERO,
                    ..valid()
                },
            ),
            (
                "commands.tool_timeout",
                Config {
                    tool_timeout: Duration::ZERO,
                    ..valid()
                },
            ),
        ];
        for (expected, config) in cases {
            match config.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("{expected}: expected Invalid, got {other:?}"),
            }
        }
        // Sub-second values are fine.
        assert_eq!(
            Config {
                log_idle_poll: Duration::from_millis(1),
                ..valid()
            }
            .validate(),
            Ok(())
        );
    }

    #[test]
    fn test_derived_settings() {
        let config = valid();
        assert_eq!(
            config.retry_strategy(),
            RetryStrategy::ExponentialBackoff {
                attempts: 3,
                base: Duration::from_secs(1)
            }
        );
        assert_eq!(config.delivery().installation_id, "UNKNOWN");
        assert_eq!(
            config.tailer().path,
            PathBuf::from("/var/log/pi-star/MMDVM.log")
        );
    }

    #[test]
    fn test_yaml_then_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "config.yaml",
                r#"
api:
  endpoint: "https://dispatch.example.org/api/v1"
  key: "from-yaml"
  retry_attempts: 5
  raspberry_id: "pi-north"
mmdvm:
  log_path: "/tmp/MMDVM.log"
"#,
            )?;
            jail.set_env("EASYDISPATCH_API_KEY", "from-env");

            let config = load(Path::new("config.yaml")).unwrap();
            assert_eq!(config.api_key, "from-env");
            assert_eq!(config.api_retry_attempts, 5);
            assert_eq!(config.installation_id, "pi-north");
            assert_eq!(config.mmdvm_log_path, PathBuf::from("/tmp/MMDVM.log"));
            assert_eq!(config.api_timeout, Duration::from_secs(30));
            assert_eq!(config.validate(), Ok(()));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("EASYDISPATCH_API_ENDPOINT", "http://localhost:8080");

            let config = load(Path::new("absent.yaml")).unwrap();
            assert_eq!(config.api_endpoint, "http://localhost:8080");
            assert_eq!(config.validate(), Err(ConfigError::Missing("api.key")));
            Ok(())
        });
    }
}
