// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! YAML file configuration.
//!
//! ```yaml
//! trace_store_threshold_ms: 0
//! profiling_fine_probability: 0.1
//! pointcuts:
//!   - capture_items: [metric, span]
//!     type_name: app.Misc
//!     method_name: executeWithArgs
//!     method_arg_type_names: [java.lang.String, int]
//!     metric_name: execute with args
//!     span_template: "executeWithArgs(): {{0}}, {{1}}"
//! ```
//!
//! A missing file is not an error: figment yields an empty document and defaults stand.

use std::path::PathBuf;

use figment::{
    providers::{Format, Yaml},
    Figment,
};

use crate::config::{Config, ConfigError, ConfigSource, PartialConfig};

#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(&self.path));

        let partial: PartialConfig = figment.extract().map_err(|e| {
            ConfigError::ParseError(format!(
                "failed to parse {}: {e}",
                self.path.display()
            ))
        })?;

        partial.merge_into(config);
        Ok(())
    }
}
