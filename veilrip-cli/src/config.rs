use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use veilrip_engine::EngineConfig;

use crate::error::{AppError, Result};

const CONFIG_DIR: &str = "veilrip";
const CONFIG_FILE: &str = "config.toml";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// Contents of the configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file at the default location yields the defaults; an
    /// explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).map_err(|e| match e {
                AppError::Toml { source, .. } => AppError::Toml { path, source },
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Self::default()),
            Err(source) => Err(AppError::ConfigRead { path, source }),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|source| AppError::Toml {
            path: PathBuf::new(),
            source,
        })
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(AppConfig::parse("").unwrap(), AppConfig::default());
    }

    #[test]
    fn parses_engine_sections() {
        let config = AppConfig::parse(
            r#"
            [logging]
            format = "json"

            [circuit]
            binary = "/usr/sbin/tor"
            port_range_start = 20000
            port_range_end = 20100

            [tools]
            fetch_tool = "yt-dlp"
            title_fallback_after = 5

            [output]
            container = "mp4"
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.engine.circuit.binary, "/usr/sbin/tor");
        assert_eq!(config.engine.circuit.port_range(), 20000..20100);
        assert_eq!(config.engine.tools.fetch_tool, "yt-dlp");
        assert_eq!(config.engine.tools.muxer, "ffmpeg");
        assert_eq!(config.engine.tools.title_fallback_after, Some(5));
        assert_eq!(config.engine.output.container, "mp4");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = AppConfig::load(Some(&temp.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, AppError::ConfigRead { .. }));
    }

    #[test]
    fn invalid_toml_reports_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[circuit\nbinary = 1").unwrap();

        let err = AppConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, AppError::Toml { path: ref p, .. } if p == &path));
    }

    #[test]
    fn loads_file_from_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[output]\noutput_dir = \"/videos\"\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.engine.output.output_dir, PathBuf::from("/videos"));
    }
}
