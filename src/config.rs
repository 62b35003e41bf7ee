use std::io;
use std::path::{Path, PathBuf};

use serde::de::IgnoredAny;

use crate::log_sink::LogSink;
use crate::marker::DEFAULT_MARKER_PATH;
use crate::sink_info;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/idshift";

/// Tried in this order; the first one that loads wins.
const CANDIDATES: [&str; 4] = ["config.json", "config.toml", "config.yaml", "config.yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Toml,
    Yaml,
}

static FORMATS: phf::Map<&'static str, Format> = phf::phf_map! {
    "json" => Format::Json,
    "toml" => Format::Toml,
    "yaml" => Format::Yaml,
    "yml" => Format::Yaml,
};

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Container user, as named in the user database.
    pub user: String,
    /// Container group, as named in the group database.
    pub group: String,
    /// Trees whose ownership gets remapped.
    pub paths: Vec<PathBuf>,
    /// Keep the supplementary groups the process was started with.
    pub inherit_groups: bool,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum PathsField {
    List(Vec<String>),
    Other(IgnoredAny),
}

#[derive(Debug, serde::Deserialize)]
struct RawConfig {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    paths: Option<PathsField>,
    #[serde(default, rename = "inherit-groups", alias = "inherit_groups")]
    inherit_groups: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not find config at {}/config.[json|toml|yaml|yml]", dir.display())]
    NotFound { dir: PathBuf },
    #[error("can't read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("can't parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("cannot find key '{key}' in configuration file {}", path.display())]
    MissingKey { key: &'static str, path: PathBuf },
    #[error("key 'paths' is malformed; should be an array of strings in configuration file {}", path.display())]
    MalformedPaths { path: PathBuf },
}

/// Well-known locations, overridable so everything can run against scratch files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    pub passwd: PathBuf,
    pub group: PathBuf,
    pub mounts: PathBuf,
    pub marker: PathBuf,
    pub config_dir: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            passwd: PathBuf::from("/etc/passwd"),
            group: PathBuf::from("/etc/group"),
            mounts: PathBuf::from("/proc/mounts"),
            marker: PathBuf::from(DEFAULT_MARKER_PATH),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
        }
    }
}

fn parse_raw(path: &Path, format: Format, content: &[u8]) -> Result<RawConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_owned(),
        message,
    };
    match format {
        Format::Json => serde_json::from_slice(content).map_err(|e| parse_err(e.to_string())),
        Format::Yaml => serde_yaml::from_slice(content).map_err(|e| parse_err(e.to_string())),
        Format::Toml => {
            let text = std::str::from_utf8(content).map_err(|e| parse_err(e.to_string()))?;
            toml::from_str(text).map_err(|e| parse_err(e.to_string()))
        }
    }
}

fn validate(path: &Path, raw: RawConfig) -> Result<Config, ConfigError> {
    let user = raw
        .user
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConfigError::MissingKey {
            key: "user",
            path: path.to_owned(),
        })?;
    let group = raw
        .group
        .filter(|g| !g.is_empty())
        .ok_or_else(|| ConfigError::MissingKey {
            key: "group",
            path: path.to_owned(),
        })?;
    let paths = match raw.paths {
        None => vec![PathBuf::from("/")],
        Some(PathsField::List(paths)) => paths.into_iter().map(PathBuf::from).collect(),
        Some(PathsField::Other(_)) => {
            return Err(ConfigError::MalformedPaths {
                path: path.to_owned(),
            })
        }
    };
    Ok(Config {
        user,
        group,
        paths,
        inherit_groups: raw.inherit_groups.unwrap_or(true),
    })
}

impl Config {
    /// Parse and validate one file; the format comes from its extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = Self::load_raw(path)?;
        validate(path, raw)
    }

    fn load_raw(path: &Path) -> Result<RawConfig, ConfigError> {
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|e| FORMATS.get(e).copied())
            .ok_or_else(|| ConfigError::Parse {
                path: path.to_owned(),
                message: "unknown configuration format".to_owned(),
            })?;
        let content = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        parse_raw(path, format, &content)
    }

    /// Look for `config.{json,toml,yaml,yml}` in `dir`. A candidate that exists but does not load
    /// is reported and the next one is tried; validation errors of the one that loads are final.
    pub fn discover(dir: impl AsRef<Path>, sink: &dyn LogSink) -> Result<(Self, PathBuf), ConfigError> {
        let dir = dir.as_ref();
        let mut last_error = ConfigError::NotFound {
            dir: dir.to_owned(),
        };
        for name in CANDIDATES {
            let path = dir.join(name);
            if matches!(std::fs::symlink_metadata(&path), Err(e) if e.kind() == io::ErrorKind::NotFound)
            {
                continue;
            }
            match Self::load_raw(&path) {
                Ok(raw) => return validate(&path, raw).map(|config| (config, path)),
                Err(e) => {
                    sink_info!(sink, "error when loading configuration file {}", path.display());
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
