//! Runtime configuration.
//!
//! Loaded from a TOML or JSON file (chosen by extension) and then overridden
//! by environment variables:
//!
//! ```toml
//! autoload = true
//! search_paths = ["/opt/app/modules"]
//!
//! [host_version]
//! major = 1
//! minor = 2
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::module::Version;

/// Environment variable names.
pub mod env_vars {
    /// Host version as `major.minor`.
    pub const HOST_VERSION: &str = "APF_HOST_VERSION";
    /// Module search paths, separated like `PATH`.
    pub const MODULE_PATH: &str = "APF_MODULE_PATH";
    /// `true` switches log output to JSON.
    pub const LOG_JSON: &str = "APF_LOG_JSON";
}

/// Host version offered to modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVersion {
    pub major: u16,
    #[serde(default)]
    pub minor: u16,
}

impl HostVersion {
    pub fn version(self) -> Version {
        Version::new(self.major, self.minor)
    }
}

impl Default for HostVersion {
    fn default() -> Self {
        Self { major: 1, minor: 0 }
    }
}

impl From<Version> for HostVersion {
    fn from(version: Version) -> Self {
        Self {
            major: version.major(),
            minor: version.minor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host_version: HostVersion,
    /// Directories scanned for modules.
    pub search_paths: Vec<PathBuf>,
    /// Load every discovered module when the runtime is built.
    pub autoload: bool,
    /// Whether a module's classes replace ones already registered.
    pub replace_existing: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_version: HostVersion::default(),
            search_paths: Vec::new(),
            autoload: false,
            replace_existing: true,
        }
    }
}

impl RuntimeConfig {
    /// Read a `.toml` or `.json` file. Environment overrides are not applied.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(Error::Config(format!(
                "Unsupported config format: {}",
                path.display()
            ))),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read a file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    ///
    /// `APF_HOST_VERSION` replaces the host version; `APF_MODULE_PATH`
    /// entries are appended to the search paths.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(version) = lookup(env_vars::HOST_VERSION) {
            let version: Version = version.parse()?;
            self.host_version = version.into();
        }
        if let Some(paths) = lookup(env_vars::MODULE_PATH) {
            for path in std::env::split_paths(&paths) {
                if !path.as_os_str().is_empty() && !self.search_paths.contains(&path) {
                    self.search_paths.push(path);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.host_version.version(), Version::new(1, 0));
        assert!(config.search_paths.is_empty());
        assert!(!config.autoload);
        assert!(config.replace_existing);
    }

    #[test]
    fn test_from_toml() {
        let config = RuntimeConfig::from_toml(
            r#"
            autoload = true
            search_paths = ["/opt/modules"]

            [host_version]
            major = 2
            minor = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.host_version.version(), Version::new(2, 1));
        assert_eq!(config.search_paths, vec![PathBuf::from("/opt/modules")]);
        assert!(config.autoload);
        assert!(config.replace_existing);
    }

    #[test]
    fn test_from_json() {
        let config =
            RuntimeConfig::from_json(r#"{"host_version": {"major": 3}, "replace_existing": false}"#)
                .unwrap();
        assert_eq!(config.host_version.version(), Version::new(3, 0));
        assert!(!config.replace_existing);
    }

    #[test]
    fn test_invalid_content() {
        assert!(matches!(
            RuntimeConfig::from_toml("host_version = 'x'"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json("["),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("runtime.toml");
        std::fs::write(&toml_path, "autoload = true\n").unwrap();
        assert!(RuntimeConfig::from_file(&toml_path).unwrap().autoload);

        let json_path = dir.path().join("runtime.json");
        std::fs::write(&json_path, r#"{"autoload": true}"#).unwrap();
        assert!(RuntimeConfig::from_file(&json_path).unwrap().autoload);

        let yaml_path = dir.path().join("runtime.yaml");
        std::fs::write(&yaml_path, "autoload: true\n").unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(&yaml_path),
            Err(Error::Config(_))
        ));

        assert!(RuntimeConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let first = PathBuf::from("/a");
        let second = PathBuf::from("/b");
        let joined = std::env::join_paths([&first, &second]).unwrap();

        let env: HashMap<&str, String> = HashMap::from([
            (env_vars::HOST_VERSION, "4.2".to_string()),
            (env_vars::MODULE_PATH, joined.to_string_lossy().into_owned()),
        ]);

        let mut config = RuntimeConfig {
            search_paths: vec![first.clone()],
            ..Default::default()
        };
        config.apply_env_with(|key| env.get(key).cloned()).unwrap();

        assert_eq!(config.host_version.version(), Version::new(4, 2));
        assert_eq!(config.search_paths, vec![first, second]);
    }

    #[test]
    fn test_bad_env_version() {
        let mut config = RuntimeConfig::default();
        let result = config.apply_env_with(|key| {
            (key == env_vars::HOST_VERSION).then(|| "one.two".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
