use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings read from `config.toml`. Command-line flags win over these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program started on the remote host
    pub remote_program: String,
    /// Compress single files on the wire
    pub compress: bool,
    pub ssh_program: String,
    /// Extra `-o` options for every ssh invocation
    pub ssh_options: Vec<String>,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_program: "skiff".to_string(),
            compress: true,
            ssh_program: "ssh".to_string(),
            ssh_options: Vec::new(),
            log_file: None,
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("skiff");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("skiff");
    }
    PathBuf::from(".skiff")
}

/// `$SKIFF_CONFIG`, else `config.toml` in [`config_dir`].
pub fn config_path() -> PathBuf {
    match std::env::var_os("SKIFF_CONFIG") {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => config_dir().join("config.toml"),
    }
}

impl Config {
    /// Load from the default location; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => toml::from_str(&data)
                .with_context(|| format!("parse config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read config {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("none.toml")).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.remote_program, "skiff");
        assert!(cfg.compress);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "compress = false\nssh_options = [\"BatchMode=yes\"]\n",
        )
        .unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert!(!cfg.compress);
        assert_eq!(cfg.ssh_options, vec!["BatchMode=yes"]);
        assert_eq!(cfg.ssh_program, "ssh");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "compress = \"maybe\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
