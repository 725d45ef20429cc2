// Job specification and training parameters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{OrchestratorError, OrchestratorResult};

pub const MAX_EPOCHS: u32 = 10;
pub const MAX_BATCH_SIZE: u32 = 16;

/// What to run. Immutable once handed to a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Shell command line, run under `sh -c`
    pub command: String,

    /// Working directory, relative to the workspace unless absolute
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Extra environment for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: ResourceHints,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_directory: None,
            env: BTreeMap::new(),
            resources: ResourceHints::default(),
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceHints) -> Self {
        self.resources = resources;
        self
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.command.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "job command is empty".to_string(),
            ));
        }
        for key in self.env.keys() {
            if !is_env_name(key) {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Full environment handed to the command: resource hints first, then
    /// explicit overrides
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.resources.to_env();
        env.extend(self.env.clone());
        env
    }
}

/// Opaque pass-through hints for the training command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_lora: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ResourceHints {
    /// Render as `TRAIN_*` environment variables
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(batch_size) = self.batch_size {
            env.insert("TRAIN_BATCH_SIZE".to_string(), batch_size.to_string());
        }
        if let Some(epochs) = self.epochs {
            env.insert("TRAIN_EPOCHS".to_string(), epochs.to_string());
        }
        if let Some(lr) = self.learning_rate {
            env.insert("TRAIN_LEARNING_RATE".to_string(), lr.to_string());
        }
        if let Some(use_lora) = self.use_lora {
            env.insert("TRAIN_USE_LORA".to_string(), use_lora.to_string());
        }
        for (key, value) in &self.extra {
            env.insert(format!("TRAIN_{}", env_suffix(key)), value.clone());
        }
        env
    }
}

/// Fine-tuning parameters with the defaults and bounds the trainer accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub model_id: String,
    #[serde(default)]
    pub role_file: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_use_lora")]
    pub use_lora: bool,
}

fn default_batch_size() -> u32 {
    4
}

fn default_epochs() -> u32 {
    3
}

fn default_learning_rate() -> f64 {
    2e-5
}

fn default_use_lora() -> bool {
    true
}

impl TrainingParams {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            role_file: None,
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            use_lora: default_use_lora(),
        }
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig("model_id is empty".to_string()));
        }
        if self.epochs == 0 || self.epochs > MAX_EPOCHS {
            return Err(OrchestratorError::InvalidConfig(format!(
                "epochs must be between 1 and {}, got {}",
                MAX_EPOCHS, self.epochs
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(OrchestratorError::InvalidConfig(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    pub fn resource_hints(&self) -> ResourceHints {
        let mut extra = BTreeMap::new();
        extra.insert("model_id".to_string(), self.model_id.clone());
        if let Some(role_file) = &self.role_file {
            extra.insert("role_file".to_string(), role_file.clone());
        }
        ResourceHints {
            batch_size: Some(self.batch_size),
            epochs: Some(self.epochs),
            learning_rate: Some(self.learning_rate),
            use_lora: Some(self.use_lora),
            extra,
        }
    }

    /// Build a job for `command` carrying these parameters
    pub fn into_job_spec(self, command: impl Into<String>) -> OrchestratorResult<JobSpec> {
        self.validate()?;
        Ok(JobSpec::new(command).with_resources(self.resource_hints()))
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn env_suffix(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
