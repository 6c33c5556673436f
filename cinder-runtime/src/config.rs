//! Runtime configuration file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use cinder::{ContextParams, Result, SamplingParams};

/// Default new-token budget per request.
pub const DEFAULT_TARGET_LENGTH: usize = 4096;

/// Everything [`Runtime::load`](crate::Runtime::load) needs besides the
/// model path. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub context: ContextParams,
    pub sampling: SamplingParams,
    /// Maximum number of new tokens per request.
    pub target_length: usize,
    /// Parse `<|im_start|>`-style markup in prompts into control tokens.
    pub format_chat: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context: ContextParams::default(),
            sampling: SamplingParams::default(),
            target_length: DEFAULT_TARGET_LENGTH,
            format_chat: false,
        }
    }
}

impl RuntimeConfig {
    /// Load a config from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds out-of-range sampling parameters.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parse a config from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is invalid or the sampling parameters
    /// are out of range.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.sampling.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder::Error;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.context.n_ctx, 2048);
        assert_eq!(config.context.n_threads, None);
        assert_eq!(config.target_length, 4096);
        assert!(!config.format_chat);
        assert!((config.sampling.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.sampling.top_k, 40);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = RuntimeConfig::from_json(
            r#"{ "context": { "n_ctx": 512 }, "sampling": { "seed": 7 }, "format_chat": true }"#,
        )
        .unwrap();
        assert_eq!(config.context.n_ctx, 512);
        assert_eq!(config.sampling.seed, Some(7));
        assert_eq!(config.sampling.top_k, 40);
        assert_eq!(config.target_length, 4096);
        assert!(config.format_chat);
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "target_length": 16, "context": {{ "n_threads": 3 }} }}"#).unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.target_length, 16);
        assert_eq!(config.context.effective_threads(), 3);
    }

    #[test]
    fn out_of_range_sampling_rejected() {
        let err = RuntimeConfig::from_json(r#"{ "sampling": { "top_p": 1.5 } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn bad_json_and_missing_file() {
        assert!(matches!(
            RuntimeConfig::from_json("{ not json"),
            Err(Error::Json(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(dir.path().join("absent.json")),
            Err(Error::Io(_))
        ));
    }
}
