//! Runner configuration.
//!
//! Engine settings use the same `ERP_FLOW__` variables as
//! [`EngineConfig::from_env`]; the runner adds two of its own:
//! - `ERP_FLOW__DEFINITION_PATH`: JSON workflow definition to run (required)
//! - `ERP_FLOW__INPUT`: JSON object passed as the run input (optional)

use crate::error::RunnerError;
use erp_flow_workflow::config::ENV_PREFIX;
use erp_flow_workflow::{DataMap, EngineConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct RunnerSettings {
    definition_path: PathBuf,
    #[serde(default)]
    input: Option<String>,
}

/// Engine configuration plus what the runner needs to start a run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub engine: EngineConfig,
    pub definition_path: PathBuf,
    /// Raw JSON run input.
    pub input: Option<String>,
}

impl RunnerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `ERP_FLOW__DEFINITION_PATH` is missing or a value
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Loads configuration from the given variables.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, config::ConfigError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, config::ConfigError> {
        let engine = match &vars {
            Some(vars) => EngineConfig::from_vars(vars.clone())?,
            None => EngineConfig::from_env()?,
        };
        let settings: RunnerSettings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .source(vars),
            )
            .build()?
            .try_deserialize()?;

        Ok(Self {
            engine,
            definition_path: settings.definition_path,
            input: settings.input,
        })
    }

    /// Parses the run input. Missing or blank input is an empty object.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the input is not a JSON object.
    pub fn parse_input(&self) -> Result<DataMap, RunnerError> {
        let Some(raw) = self.input.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(DataMap::new());
        };
        serde_json::from_str(raw).map_err(|e| RunnerError::InvalidInput {
            details: e.to_string(),
        })
    }
}
