// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! Configuration sources are applied in order, later sources overriding earlier ones:
//!
//! 1. **Defaults** - [`Config::default`]
//! 2. **YAML file** - [`yaml::YamlConfigSource`], which is also where pointcuts are declared
//! 3. **Environment variables** - [`env::EnvConfigSource`], `DD_*` variables
//!
//! A source that fails to load is logged and skipped; the remaining sources still apply.
//! At runtime the resulting [`Config`] is published through a [`service::ConfigService`],
//! which is what the schedulers and the advice cache read from.

pub mod env;
pub mod log_level;
pub mod pointcut;
pub mod service;
pub mod yaml;

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error};

use crate::config::log_level::LogLevel;
use crate::config::pointcut::PointcutConfig;

#[derive(Debug, PartialEq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

/// Whether advice added at runtime is applied to types that are already woven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetransformPolicy {
    /// New advice only affects types defined after the change.
    #[default]
    FutureLoadsOnly,
    /// Live woven types are re-woven against the new advice snapshot.
    Retransform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub enabled: bool,
    pub log_level: LogLevel,

    /// Completed traces shorter than this are discarded instead of sent to the sink.
    pub store_threshold: Duration,
    /// Active traces older than this are flagged stuck and reported.
    pub stuck_threshold: Duration,
    pub stuck_check_interval: Duration,

    pub coarse_profiling_enabled: bool,
    /// Age a trace must reach before coarse sampling starts.
    pub coarse_initial_delay: Duration,
    pub coarse_interval: Duration,
    /// Coarse sampling stops once a trace is this old.
    pub coarse_total: Duration,

    /// Probability, in `[0, 1]`, that a new trace is enrolled for fine profiling.
    pub fine_profiling_probability: f64,
    pub fine_interval: Duration,
    /// Fine sampling stops once an enrolled trace is this old.
    pub fine_total: Duration,

    pub type_cache_maintenance_interval: Duration,
    pub retransform_policy: RetransformPolicy,

    pub pointcuts: Vec<PointcutConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: LogLevel::default(),

            store_threshold: Duration::from_millis(3_000),
            stuck_threshold: Duration::from_secs(180),
            stuck_check_interval: Duration::from_millis(100),

            coarse_profiling_enabled: true,
            coarse_initial_delay: Duration::from_millis(1_000),
            coarse_interval: Duration::from_millis(500),
            coarse_total: Duration::from_secs(300),

            fine_profiling_probability: 0.0,
            fine_interval: Duration::from_millis(50),
            fine_total: Duration::from_secs(10),

            type_cache_maintenance_interval: Duration::from_secs(60),
            retransform_policy: RetransformPolicy::default(),

            pointcuts: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fine_profiling_probability) {
            return Err(ConfigError::Invalid(format!(
                "fine profiling probability must be within [0, 1], got {}",
                self.fine_profiling_probability
            )));
        }
        let intervals = [
            ("stuck check interval", self.stuck_check_interval),
            ("coarse profiling interval", self.coarse_interval),
            ("fine profiling interval", self.fine_interval),
            (
                "type cache maintenance interval",
                self.type_cache_maintenance_interval,
            ),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Replaces values rejected by [`Config::validate`]: the probability is clamped to
    /// `[0, 1]` and zero intervals fall back to their defaults. Returns `false` if anything
    /// had to be replaced.
    pub fn sanitize(&mut self) -> bool {
        let Err(e) = self.validate() else {
            return true;
        };
        error!("{}, falling back to defaults for profiling settings", e);
        let defaults = Config::default();
        self.fine_profiling_probability = if self.fine_profiling_probability.is_nan() {
            defaults.fine_profiling_probability
        } else {
            self.fine_profiling_probability.clamp(0.0, 1.0)
        };
        let intervals = [
            (&mut self.stuck_check_interval, defaults.stuck_check_interval),
            (&mut self.coarse_interval, defaults.coarse_interval),
            (&mut self.fine_interval, defaults.fine_interval),
            (
                &mut self.type_cache_maintenance_interval,
                defaults.type_cache_maintenance_interval,
            ),
        ];
        for (interval, default) in intervals {
            if interval.is_zero() {
                *interval = default;
            }
        }
        false
    }
}

/// Fields shared by every configuration source. Durations are expressed in the unit
/// carried by the field name.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PartialConfig {
    pub method_tracer_enabled: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub trace_store_threshold_ms: Option<u64>,
    pub trace_stuck_threshold_secs: Option<u64>,
    pub trace_stuck_check_interval_ms: Option<u64>,
    pub profiling_coarse_enabled: Option<bool>,
    pub profiling_coarse_initial_delay_ms: Option<u64>,
    pub profiling_coarse_interval_ms: Option<u64>,
    pub profiling_coarse_total_secs: Option<u64>,
    pub profiling_fine_probability: Option<f64>,
    pub profiling_fine_interval_ms: Option<u64>,
    pub profiling_fine_total_secs: Option<u64>,
    pub type_cache_maintenance_interval_secs: Option<u64>,
    pub retransform_policy: Option<RetransformPolicy>,
    pub pointcuts: Vec<PointcutConfig>,
}

impl PartialConfig {
    pub(crate) fn merge_into(self, config: &mut Config) {
        let millis = Duration::from_millis;
        let secs = Duration::from_secs;

        if let Some(value) = self.method_tracer_enabled {
            config.enabled = value;
        }
        if let Some(value) = self.log_level {
            config.log_level = value;
        }
        merge_duration(&mut config.store_threshold, self.trace_store_threshold_ms, millis);
        merge_duration(&mut config.stuck_threshold, self.trace_stuck_threshold_secs, secs);
        merge_duration(
            &mut config.stuck_check_interval,
            self.trace_stuck_check_interval_ms,
            millis,
        );
        if let Some(value) = self.profiling_coarse_enabled {
            config.coarse_profiling_enabled = value;
        }
        merge_duration(
            &mut config.coarse_initial_delay,
            self.profiling_coarse_initial_delay_ms,
            millis,
        );
        merge_duration(&mut config.coarse_interval, self.profiling_coarse_interval_ms, millis);
        merge_duration(&mut config.coarse_total, self.profiling_coarse_total_secs, secs);
        if let Some(value) = self.profiling_fine_probability {
            config.fine_profiling_probability = value;
        }
        merge_duration(&mut config.fine_interval, self.profiling_fine_interval_ms, millis);
        merge_duration(&mut config.fine_total, self.profiling_fine_total_secs, secs);
        merge_duration(
            &mut config.type_cache_maintenance_interval,
            self.type_cache_maintenance_interval_secs,
            secs,
        );
        if let Some(value) = self.retransform_policy {
            config.retransform_policy = value;
        }
        if !self.pointcuts.is_empty() {
            config.pointcuts = self.pointcuts;
        }
    }
}

fn merge_duration(target: &mut Duration, value: Option<u64>, unit: fn(u64) -> Duration) {
    if let Some(value) = value {
        *target = unit(value);
    }
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

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            match source.load(&mut self.config) {
                Ok(()) => (),
                Err(e) => {
                    error!("Failed to load config: {}", e);
                    failed_sources += 1;
                }
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        self.config.sanitize();

        self.config.clone()
    }
}

/// Loads `method_tracer.yaml` from `config_directory`, then applies `DD_*` variables.
#[must_use]
pub fn get_config(config_directory: &std::path::Path) -> Config {
    let path = config_directory.join("method_tracer.yaml");
    ConfigBuilder::default()
        .add_source(Box::new(yaml::YamlConfigSource { path }))
        .add_source(Box::new(env::EnvConfigSource))
        .build()
}
