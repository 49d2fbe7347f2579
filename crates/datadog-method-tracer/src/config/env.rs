// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `DD_*` environment variable configuration.
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `DD_METHOD_TRACER_ENABLED` | master switch for advice execution |
//! | `DD_LOG_LEVEL` | agent log level |
//! | `DD_TRACE_STORE_THRESHOLD_MS` | minimum duration of a stored trace |
//! | `DD_TRACE_STUCK_THRESHOLD_SECS` | age at which an active trace is stuck |
//! | `DD_TRACE_STUCK_CHECK_INTERVAL_MS` | stuck trace scan period |
//! | `DD_PROFILING_COARSE_*` | `ENABLED`, `INITIAL_DELAY_MS`, `INTERVAL_MS`, `TOTAL_SECS` |
//! | `DD_PROFILING_FINE_*` | `PROBABILITY`, `INTERVAL_MS`, `TOTAL_SECS` |
//! | `DD_TYPE_CACHE_MAINTENANCE_INTERVAL_SECS` | dead loading unit purge period |
//! | `DD_RETRANSFORM_POLICY` | `future_loads_only` or `retransform` |

use figment::{providers::Env, Figment};

use crate::config::{Config, ConfigError, ConfigSource, PartialConfig};

#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed("DD_").ignore(&["POINTCUTS"]));

        let partial: PartialConfig = figment
            .extract()
            .map_err(|e| ConfigError::ParseError(format!("failed to parse env config: {e}")))?;

        partial.merge_into(config);
        Ok(())
    }
}
