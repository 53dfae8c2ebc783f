//! Optional TOML settings file. Command-line flags and `MRF_*` variables
//! override it; it overrides the built-in defaults.
//!
//! ```toml
//! [log]
//! level = "debug"
//!
//! [services]
//! file = "s3://plans/services.csv"
//!
//! [writer]
//! max_rows_per_file = 50000000
//! max_rows_per_group = 500000
//! file_prefix = "acme"
//!
//! [tmp]
//! path = "/scratch"
//!
//! [pipeline]
//! download_timeout_minutes = 30
//! download_retries = 3
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Read when `--config` is not given and the file exists in the working
/// directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub log: LogConfig,
    pub services: ServicesConfig,
    pub writer: WriterConfig,
    pub tmp: TmpConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServicesConfig {
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    pub max_rows_per_file: Option<u64>,
    pub max_rows_per_group: Option<usize>,
    pub file_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TmpConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub download_timeout_minutes: Option<u64>,
    pub download_retries: Option<u32>,
}

impl FileConfig {
    /// Loads `explicit` if given, else `config.toml` from the working
    /// directory if present, else an empty config.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::read(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::read(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed reading config file {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Failed parsing config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_section() {
        let config = FileConfig::from_toml(
            r#"
            [log]
            level = "debug"

            [services]
            file = "gs://plans/services.csv"

            [writer]
            max_rows_per_file = 500
            max_rows_per_group = 50
            file_prefix = "acme"

            [tmp]
            path = "/scratch"

            [pipeline]
            download_timeout_minutes = 30
            download_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert_eq!(config.services.file.as_deref(), Some("gs://plans/services.csv"));
        assert_eq!(config.writer.max_rows_per_file, Some(500));
        assert_eq!(config.writer.max_rows_per_group, Some(50));
        assert_eq!(config.writer.file_prefix.as_deref(), Some("acme"));
        assert_eq!(config.tmp.path, Some(PathBuf::from("/scratch")));
        assert_eq!(config.pipeline.download_timeout_minutes, Some(30));
        assert_eq!(config.pipeline.download_retries, Some(2));
    }

    #[test]
    fn missing_sections_stay_unset() {
        let config = FileConfig::from_toml("[writer]\nfile_prefix = \"x\"\n").unwrap();
        assert!(config.services.file.is_none());
        assert!(config.tmp.path.is_none());
        assert_eq!(config.writer.file_prefix.as_deref(), Some("x"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::from_toml("[writer]\nmax_rows = 5\n").is_err());
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileConfig::load(Some(&dir.path().join("absent.toml"))).is_err());

        let path = dir.path().join("mrf.toml");
        fs::write(&path, "[log]\nlevel = \"warn\"\n").unwrap();
        let config = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(config.log.level.as_deref(), Some("warn"));
    }
}
