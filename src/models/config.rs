//! Configuration models for captionsieve.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use super::PromptTemplate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for captionsieve.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local model configuration (text mode backend)
    pub model: ModelConfig,

    /// Input dataset settings
    pub dataset: DatasetConfig,

    /// Classification settings
    pub filter: FilterConfig,

    /// Output and checkpoint settings
    pub output: OutputConfig,
}

/// Local model configuration.
///
/// K_i: The directory holds a Hugging Face style export
/// (`config.json`, `tokenizer.json`, `*.safetensors`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory containing the model export
    pub dir: PathBuf,

    /// Weight dtype used for inference
    #[serde(default)]
    pub dtype: ModelDtype,

    /// Force CPU even when an accelerator is available
    #[serde(default)]
    pub cpu: bool,

    /// System turn prepended to every prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_system_prompt() -> String {
    "You are an AI assistant that follows the user's directions.".to_string()
}

/// Weight dtype for the bundled backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelDtype {
    F32,
    F16,
    /// Default: quantization hurts classification accuracy, bf16 does not
    #[default]
    Bf16,
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Path to the delimited metadata file
    pub path: PathBuf,

    /// Field delimiter (single ASCII character)
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Whether the first line is a header row
    #[serde(default = "default_true")]
    pub has_header: bool,

    /// Column holding the caption (name, or index when there is no header)
    #[serde(default)]
    pub caption_column: Option<String>,

    /// Column holding the image path; setting it selects vision mode
    #[serde(default)]
    pub image_column: Option<String>,

    /// Directory that relative image paths are resolved against
    #[serde(default)]
    pub image_root: Option<PathBuf>,
}

fn default_delimiter() -> String {
    "\t".to_string()
}

fn default_true() -> bool {
    true
}

/// Classification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Prompt template; `{caption}` is replaced with the row's caption
    pub prompt: String,

    /// Confidence threshold in (0, 1)
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Gate scoring on the answer tokens reaching the top-k
    #[serde(default = "default_true")]
    pub early_stop: bool,

    /// Forward passes allowed before falling back to "keep"
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Breadth of the readiness check
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Decision recorded for rows whose image is missing or corrupted
    #[serde(default)]
    pub keep_on_corrupted: bool,
}

fn default_threshold() -> f64 {
    0.5
}

fn default_max_attempts() -> usize {
    10
}

fn default_top_k() -> usize {
    1
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Filtered dataset path (also the checkpoint target)
    pub path: PathBuf,

    /// Rows between checkpoint writes (disabled when absent)
    #[serde(default)]
    pub checkpoint_every: Option<usize>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.expand_paths();
        Ok(config)
    }

    /// Expand `${VAR}` references in every configured path.
    fn expand_paths(&mut self) {
        let expand = |p: &PathBuf| PathBuf::from(expand_env_vars(&p.to_string_lossy()));
        self.model.dir = expand(&self.model.dir);
        self.dataset.path = expand(&self.dataset.path);
        self.dataset.image_root = self.dataset.image_root.as_ref().map(expand);
        self.output.path = expand(&self.output.path);
    }

    /// Check every caller contract that must hold before classification starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_threshold(self.filter.threshold)?;
        if self.filter.top_k == 0 {
            return Err(ConfigError::InvalidValue {
                field: "filter.top_k",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.filter.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "filter.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.output.checkpoint_every == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "output.checkpoint_every",
                reason: "must be at least 1 (omit it to disable checkpoints)".to_string(),
            });
        }
        parse_delimiter(&self.dataset.delimiter)?;

        let template = PromptTemplate::parse(&self.filter.prompt)?;
        if template.uses_caption() && self.dataset.caption_column.is_none() {
            return Err(ConfigError::CaptionWithoutColumn);
        }
        Ok(())
    }

    /// Whether this config selects vision mode.
    pub fn is_vision(&self) -> bool {
        self.dataset.image_column.is_some()
    }
}

/// Reject thresholds whose inverse sigmoid is not finite.
pub fn validate_threshold(threshold: f64) -> Result<(), ConfigError> {
    if threshold.is_finite() && threshold > 0.0 && threshold < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold(threshold))
    }
}

/// Parse a one-character delimiter into the byte the csv reader expects.
///
/// Accepts the escaped form `\t` as well as a literal tab.
pub fn parse_delimiter(delimiter: &str) -> Result<u8, ConfigError> {
    let delimiter = if delimiter == "\\t" { "\t" } else { delimiter };
    match delimiter.as_bytes() {
        [b] if b.is_ascii() => Ok(*b),
        _ => Err(ConfigError::InvalidDelimiter(delimiter.to_string())),
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid");

    re.replace_all(s, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
    })
    .into_owned()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - K_i violated: Values outside their contract (threshold, delimiter, template)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Threshold must lie strictly between 0 and 1, got {0}")]
    InvalidThreshold(f64),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Delimiter must be a single ASCII character, got {0:?}")]
    InvalidDelimiter(String),

    #[error("Malformed prompt template at byte {position}: {reason}")]
    MalformedTemplate { position: usize, reason: String },

    #[error("Unknown placeholder '{{{0}}}' in prompt template (only {{caption}} is supported)")]
    UnknownPlaceholder(String),

    #[error("Prompt template uses {{caption}} but no caption column is configured")]
    CaptionWithoutColumn,

    #[error("Vision mode needs an image-capable processor; none is bundled with the CLI")]
    VisionUnsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[model]
dir = "models/llama"

[dataset]
path = "data/meta.tsv"
caption_column = "caption"

[filter]
prompt = "Is this caption a photo description? {caption} Answer 1 or 0."

[output]
path = "out/filtered.tsv"
"#;

    #[test]
    fn test_defaults_applied() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.dataset.delimiter, "\t");
        assert!(config.dataset.has_header);
        assert_eq!(config.filter.threshold, 0.5);
        assert!(config.filter.early_stop);
        assert_eq!(config.filter.max_attempts, 10);
        assert_eq!(config.filter.top_k, 1);
        assert!(!config.filter.keep_on_corrupted);
        assert_eq!(config.output.checkpoint_every, None);
        assert_eq!(config.model.dtype, ModelDtype::Bf16);
        assert!(!config.is_vision());
        config.validate().unwrap();
    }

    #[test]
    fn test_threshold_bounds() {
        for bad in [0.0, 1.0, -0.2, 1.5, f64::NAN] {
            assert!(matches!(
                validate_threshold(bad),
                Err(ConfigError::InvalidThreshold(_))
            ));
        }
        validate_threshold(0.001).unwrap();
        validate_threshold(0.999).unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_counts() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.filter.top_k = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "filter.top_k", .. })
        ));

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.output.checkpoint_every = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_caption_placeholder_requires_column() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.dataset.caption_column = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CaptionWithoutColumn)
        ));

        config.filter.prompt = "Is this image a photograph? Answer 1 or 0.".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_delimiter() {
        assert_eq!(parse_delimiter("\t").unwrap(), b'\t');
        assert_eq!(parse_delimiter("\\t").unwrap(), b'\t');
        assert_eq!(parse_delimiter(",").unwrap(), b',');
        assert!(parse_delimiter("").is_err());
        assert!(parse_delimiter("||").is_err());
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown() {
        let out = expand_env_vars("${CAPTIONSIEVE_SURELY_UNSET_VAR}/data");
        assert_eq!(out, "${CAPTIONSIEVE_SURELY_UNSET_VAR}/data");
    }
}
