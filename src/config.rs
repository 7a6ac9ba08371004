use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use crate::selector::SelectorCase;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("incorrect delimiters specification: {0:?}")]
    Delimiters(String),
    #[error("mode prefix must not be empty")]
    EmptyPrefix,
    #[error("incorrect context source specification: {0:?}")]
    ContextSource(String),
    #[error("unsupported context source format: {0:?}")]
    UnsupportedFormat(String),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Left and right tag delimiters, shared by path placeholders and file
/// contents.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Delimiters {
    #[serde(default = "default_left")]
    pub left: String,
    #[serde(default = "default_right")]
    pub right: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            left: default_left(),
            right: default_right(),
        }
    }
}

fn default_left() -> String {
    "{{".to_string()
}

fn default_right() -> String {
    "}}".to_string()
}

impl Delimiters {
    /// Parses a comma separated pair such as `{{,}}` or `[[,]]`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = spec.split(',').collect();
        match parts.as_slice() {
            [left, right] => {
                let delimiters = Self {
                    left: left.trim().to_string(),
                    right: right.trim().to_string(),
                };
                delimiters.validate().map(|_| delimiters)
            }
            _ => Err(ConfigError::Delimiters(spec.to_string())),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.left.is_empty() || self.right.is_empty() || self.left == self.right {
            return Err(ConfigError::Delimiters(format!("{},{}", self.left, self.right)));
        }
        Ok(())
    }
}

/// The one configuration value shared by every stage of a run.
#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub delimiters: Delimiters,

    #[serde(default = "default_mode_prefix")]
    pub mode_prefix: String,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub selector_case: SelectorCase,
}

fn default_mode_prefix() -> String {
    "_".to_string()
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            delimiters: Delimiters::default(),
            mode_prefix: default_mode_prefix(),
            dry_run: false,
            selector_case: SelectorCase::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GeneratorConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.delimiters.validate()?;
        if self.mode_prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Json,
    Yaml,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(SourceFormat::Json),
            Some("yaml") | Some("yml") => Ok(SourceFormat::Yaml),
            other => Err(ConfigError::UnsupportedFormat(
                other.map(|e| format!(".{}", e)).unwrap_or_default(),
            )),
        }
    }
}

/// A `-c` argument: either `Name=path` or the path of a global source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSourceSpec {
    Named {
        name: String,
        path: PathBuf,
        format: SourceFormat,
    },
    Global(PathBuf),
}

impl ContextSourceSpec {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = spec.split('=').collect();
        match parts.as_slice() {
            [path] if !path.trim().is_empty() => {
                Ok(ContextSourceSpec::Global(PathBuf::from(path.trim())))
            }
            [name, path] if !name.trim().is_empty() && !path.trim().is_empty() => {
                let path = PathBuf::from(path.trim());
                let format = SourceFormat::from_path(&path)?;
                Ok(ContextSourceSpec::Named {
                    name: name.trim().to_string(),
                    path,
                    format,
                })
            }
            _ => Err(ConfigError::ContextSource(spec.to_string())),
        }
    }
}
