use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Name the output stage must carry inside a pipeline description.
pub const DEFAULT_OUTPUT_STAGE: &str = "sink";

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    /// Pipeline description used when none is given on the command line.
    pub pipeline: Option<String>,
    /// Stop the pipeline after this many frames.
    pub max_frames: Option<u64>,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            pipeline: None,
            max_frames: None,
            timeout_secs: 30,
        }
    }
}

impl AppConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| format!("invalid configuration: {err}").into())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Configuration specific to a [`PipelineController`](crate::PipelineController).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Name used to locate the output stage at configuration time.
    pub output_stage: String,
    /// Thread name of the context frame callbacks run on.
    pub dispatch_thread_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            output_stage: DEFAULT_OUTPUT_STAGE.to_string(),
            dispatch_thread_name: "framepipe-dispatch".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = AppConfig::from_json_str(r#"{ "max_frames": 5 }"#).unwrap();
        assert_eq!(config.max_frames, Some(5));
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.controller.output_stage, DEFAULT_OUTPUT_STAGE);
    }

    #[test]
    fn overrides_output_stage() {
        let config =
            AppConfig::from_json_str(r#"{ "controller": { "output_stage": "frames" } }"#).unwrap();
        assert_eq!(config.controller.output_stage, "frames");
        assert_eq!(config.controller.dispatch_thread_name, "framepipe-dispatch");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = AppConfig::from_json_str("{ nope").unwrap_err();
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}
