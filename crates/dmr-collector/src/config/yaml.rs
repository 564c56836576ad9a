// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! YAML file configuration.
//!
//! ```yaml
//! api:
//!   endpoint: https://dispatch.example.org/api/v1
//!   key: your_api_key_here
//!   raspberry_id: pi-north
//! mmdvm:
//!   log_path: /var/log/pi-star/MMDVM.log
//! raspberry:
//!   dmr_id: 2222000
//! ```
//!
//! A missing file contributes nothing. Unparseable individual values are
//! logged and ignored; a malformed document is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::commands::UnavailablePolicy;
use crate::config::{
    deserialize_option_lossless, deserialize_string_or_int, log_level::LogLevel, merge_millis,
    merge_option_to_value, merge_secs, Config, ConfigError, ConfigSource,
};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfig {
    pub api: ApiSection,
    pub mmdvm: MmdvmSection,
    pub raspberry: RaspberrySection,
    pub polling: PollingSection,
    pub queue: QueueSection,
    pub audio: AudioSection,
    pub commands: CommandsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ApiSection {
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub key: Option<String>,
    /// Seconds.
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub timeout: Option<u64>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub retry_attempts: Option<u32>,
    /// Milliseconds.
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub retry_backoff_base: Option<u64>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub raspberry_id: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MmdvmSection {
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub log_path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub config_path: Option<PathBuf>,
    /// Seconds between checks while the log file does not exist.
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub file_wait: Option<u64>,
    /// Milliseconds between reads at end of file.
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub idle_poll: Option<u64>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RaspberrySection {
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub dmr_id: Option<u32>,
}

/// Seconds.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PollingSection {
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub commands_interval: Option<u64>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub cleanup_interval: Option<u64>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct QueueSection {
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub path: Option<PathBuf>,
    /// Seconds.
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub drain_interval: Option<u64>,
    /// Seconds.
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub cooldown: Option<u64>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AudioSection {
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CommandsSection {
    /// Seconds.
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub tool_timeout: Option<u64>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub unavailable_policy: Option<UnavailablePolicy>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<LogLevel>,
}

fn merge_config(config: &mut Config, yaml: &YamlConfig) {
    merge_option_to_value!(config, api_endpoint, yaml.api, endpoint);
    merge_option_to_value!(config, api_key, yaml.api, key);
    merge_secs!(config, api_timeout, yaml.api, timeout);
    merge_option_to_value!(config, api_retry_attempts, yaml.api, retry_attempts);
    merge_millis!(config, api_retry_backoff_base, yaml.api, retry_backoff_base);
    merge_option_to_value!(config, installation_id, yaml.api, raspberry_id);

    merge_option_to_value!(config, mmdvm_log_path, yaml.mmdvm, log_path);
    merge_option_to_value!(config, mmdvm_config_path, yaml.mmdvm, config_path);
    merge_secs!(config, log_file_wait, yaml.mmdvm, file_wait);
    merge_millis!(config, log_idle_poll, yaml.mmdvm, idle_poll);

    merge_option_to_value!(config, dmr_id, yaml.raspberry, dmr_id);

    merge_secs!(config, commands_interval, yaml.polling, commands_interval);
    merge_secs!(config, cleanup_interval, yaml.polling, cleanup_interval);

    merge_option_to_value!(config, queue_path, yaml.queue, path);
    merge_secs!(config, queue_drain_interval, yaml.queue, drain_interval);
    merge_secs!(config, queue_cooldown, yaml.queue, cooldown);

    if let Some(hours) = yaml.audio.max_age_hours {
        config.audio_max_age = Duration::from_secs(hours.saturating_mul(3600));
    }

    merge_secs!(config, tool_timeout, yaml.commands, tool_timeout);
    merge_option_to_value!(config, unavailable_policy, yaml.commands, unavailable_policy);

    merge_option_to_value!(config, log_level, yaml.logging, level);
}

#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        match figment.extract::<YamlConfig>() {
            Ok(yaml_config) => merge_config(config, &yaml_config),
            Err(e) => {
                return Err(ConfigError::Parse(format!(
                    "Failed to parse config from yaml file {}: {e}",
                    self.path.display()
                )));
            }
        }

        Ok(())
    }
}
