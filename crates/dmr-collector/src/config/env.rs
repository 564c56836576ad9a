// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `EASYDISPATCH_*` environment variables. Applied after the YAML file.

use std::path::PathBuf;

use crate::commands::UnavailablePolicy;
use crate::config::{
    deserialize_option_lossless, deserialize_string_or_int, log_level::LogLevel, merge_millis,
    merge_option_to_value, merge_secs, Config, ConfigError, ConfigSource,
};
use figment::{providers::Env, Figment};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "EASYDISPATCH_";

/// Flat view of the variables, keyed by their name without the prefix.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfig {
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub api_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub api_key: Option<String>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub api_timeout: Option<u64>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub api_retry_attempts: Option<u32>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub api_retry_backoff_base: Option<u64>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub raspberry_id: Option<String>,

    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub mmdvm_log_path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub mmdvm_config_path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub dmr_id: Option<u32>,

    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub commands_interval: Option<u64>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub queue_path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub queue_drain_interval: Option<u64>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub tool_timeout: Option<u64>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub unavailable_policy: Option<UnavailablePolicy>,

    pub log_level: Option<LogLevel>,
}

fn merge_config(config: &mut Config, env: &EnvConfig) {
    merge_option_to_value!(config, api_endpoint, env, api_endpoint);
    merge_option_to_value!(config, api_key, env, api_key);
    merge_secs!(config, api_timeout, env, api_timeout);
    merge_option_to_value!(config, api_retry_attempts, env, api_retry_attempts);
    merge_millis!(config, api_retry_backoff_base, env, api_retry_backoff_base);
    merge_option_to_value!(config, installation_id, env, raspberry_id);

    merge_option_to_value!(config, mmdvm_log_path, env, mmdvm_log_path);
    merge_option_to_value!(config, mmdvm_config_path, env, mmdvm_config_path);
    merge_option_to_value!(config, dmr_id, env, dmr_id);

    merge_secs!(config, commands_interval, env, commands_interval);
    merge_option_to_value!(config, queue_path, env, queue_path);
    merge_secs!(config, queue_drain_interval, env, queue_drain_interval);
    merge_secs!(config, tool_timeout, env, tool_timeout);
    merge_option_to_value!(config, unavailable_policy, env, unavailable_policy);

    merge_option_to_value!(config, log_level, env, log_level);
}

#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<EnvConfig>() {
            Ok(env_config) => merge_config(config, &env_config),
            Err(e) => {
                return Err(ConfigError::Parse(format!(
                    "Failed to parse config from environment variables: {e}"
                )));
            }
        }

        Ok(())
    }
}
