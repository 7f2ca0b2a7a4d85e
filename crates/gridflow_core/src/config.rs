//! Site configuration and request-input validation.
//!
//! # Responsibility
//! - Load the site TOML (data roots, catalog path, tool names, logging).
//! - Define `ConfigurationError`, raised before any reconciliation.
//! - Validate names that end up in filesystem paths.
//!
//! # Invariants
//! - Every site setting has a default; an absent file is a default site.
//! - Names accepted by `validate_name` contain no path separators.

use crate::locator::PathLocator;
use crate::logging::LoggingConfig;
use crate::model::identity::DEFAULT_PUBLIC_OWNER;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const DEFAULT_DATA_ROOT: &str = "gridflow_data";
const ENV_DIR: &str = "env";
const CATALOG_FILE: &str = "catalog.sqlite3";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("valid name regex"));

/// Missing or invalid request input.
#[derive(Debug)]
pub enum ConfigurationError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    Missing(String),
    Invalid {
        key: String,
        message: String,
    },
}

impl ConfigurationError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing(key.into())
    }

    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config `{}`: {source}", path.display())
            }
            Self::Parse {
                path: Some(path),
                source,
            } => write!(f, "cannot parse config `{}`: {source}", path.display()),
            Self::Parse { path: None, source } => write!(f, "cannot parse config: {source}"),
            Self::Missing(key) => write!(f, "missing required config value `{key}`"),
            Self::Invalid { key, message } => write!(f, "invalid config value `{key}`: {message}"),
        }
    }
}

impl Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Missing(_) | Self::Invalid { .. } => None,
        }
    }
}

/// Checks a name used as a path component or catalog key.
pub fn validate_name(key: &str, value: &str) -> Result<(), ConfigurationError> {
    if NAME_RE.is_match(value) {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            key,
            format!("`{value}` must be 1-128 chars of [A-Za-z0-9_.-] starting alphanumeric"),
        ))
    }
}

/// Reads a TOML file into any deserializable shape.
pub(crate) fn read_toml_file<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, ConfigurationError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigurationError::Parse {
        path: Some(path.to_path_buf()),
        source,
    })
}

/// External tools the generated rules invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandNames {
    pub intersect: String,
    pub concatenate: String,
    pub stockpile: String,
    pub species: String,
    pub taxonomy: String,
}

impl Default for CommandNames {
    fn default() -> Self {
        Self {
            intersect: "gridflow_intersect".to_string(),
            concatenate: "gridflow_concat".to_string(),
            stockpile: "gridflow_stockpile".to_string(),
            species: "gridflow_species".to_string(),
            taxonomy: "gridflow_taxonomy".to_string(),
        }
    }
}

/// Installation-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Root of per-user archive directories.
    pub data_root: PathBuf,
    /// Public environmental data; defaults to `<data_root>/env`.
    pub env_data_dir: Option<PathBuf>,
    /// Catalog database; defaults to `<data_root>/catalog.sqlite3`.
    pub database: Option<PathBuf>,
    /// Owner of shared catalog entries.
    pub public_owner: String,
    pub commands: CommandNames,
    pub logging: LoggingConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            env_data_dir: None,
            database: None,
            public_owner: DEFAULT_PUBLIC_OWNER.to_string(),
            commands: CommandNames::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SiteConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let config: Self = read_toml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        let config: Self = toml::from_str(content)
            .map_err(|source| ConfigurationError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn env_data_dir(&self) -> PathBuf {
        self.env_data_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join(ENV_DIR))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_root.join(CATALOG_FILE))
    }

    pub fn locator(&self) -> PathLocator {
        PathLocator::new(self.data_root.clone(), self.env_data_dir())
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        validate_name("public_owner", &self.public_owner)?;
        if self.data_root.as_os_str().is_empty() {
            return Err(ConfigurationError::invalid("data_root", "cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_name, SiteConfig};
    use std::path::PathBuf;

    #[test]
    fn partial_site_file_keeps_defaults() {
        let config = SiteConfig::from_toml(
            r#"
            data_root = "/srv/gridflow"

            [commands]
            species = "run_species"

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        assert_eq!(config.public_owner, "public");
        assert_eq!(config.commands.species, "run_species");
        assert_eq!(config.commands.stockpile, "gridflow_stockpile");
        assert_eq!(config.logging.level, "warn");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/srv/gridflow/catalog.sqlite3")
        );
        assert_eq!(config.env_data_dir(), PathBuf::from("/srv/gridflow/env"));
    }

    #[test]
    fn names_with_separators_are_rejected() {
        assert!(validate_name("archive_name", "heuchera_cont-10").is_ok());
        assert!(validate_name("archive_name", "../etc").is_err());
        assert!(validate_name("archive_name", "a/b").is_err());
        assert!(validate_name("archive_name", "").is_err());
    }
}
