//! Configuration management.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use hvctl_hypervisor::{DiskFormat, DEFAULT_IMAGE_DIR, DEFAULT_NETWORK};

use crate::cli::Args;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hvctl/hvctl.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON
    pub log_json: bool,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Disk image storage
    pub storage: StorageConfig,
    /// Libvirt network new VMs attach to
    pub network: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            hypervisor: HypervisorConfig::default(),
            storage: StorageConfig::default(),
            network: DEFAULT_NETWORK.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML text. An empty document yields defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolve the configuration for a run.
    ///
    /// An explicit path must exist. Without one, the default path is used
    /// if present and defaults otherwise. CLI flags are applied last.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };

        let config = config.with_cli_overrides(args);
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.log_level = level.clone();
        }

        if args.log_json {
            self.log_json = true;
        }

        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.libvirt_uri = uri.clone();
        }

        if let Some(ref dir) = args.image_dir {
            self.storage.image_dir = dir.clone();
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        self
    }

    /// Check values serde cannot check.
    pub fn validate(&self) -> Result<()> {
        if !hvctl_common::is_valid_level(&self.log_level) {
            bail!(
                "Invalid log level '{}', expected one of: {}",
                self.log_level,
                hvctl_common::LOG_LEVELS.join(", ")
            );
        }
        if self.hypervisor.libvirt_uri.trim().is_empty() {
            bail!("hypervisor.libvirt_uri must not be empty");
        }
        if self.network.trim().is_empty() {
            bail!("network must not be empty");
        }
        if self.storage.qemu_img.trim().is_empty() {
            bail!("storage.qemu_img must not be empty");
        }
        if !self.storage.image_dir.is_absolute() {
            bail!(
                "storage.image_dir must be an absolute path, got '{}'",
                self.storage.image_dir.display()
            );
        }
        Ok(())
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub libvirt_uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Libvirt,
            libvirt_uri: "qemu:///system".to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Libvirt/QEMU backend
    #[default]
    Libvirt,
    /// In-memory backend for testing/development
    Mock,
}

/// Disk image storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Managed image directory
    pub image_dir: PathBuf,
    /// Image format for new disks
    pub image_format: DiskFormat,
    /// qemu-img binary
    pub qemu_img: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            image_format: DiskFormat::Qcow2,
            qemu_img: "qemu-img".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["hvctl"];
        argv.extend_from_slice(extra);
        argv.push("list");
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Libvirt);
        assert_eq!(config.storage.image_dir, PathBuf::from("/var/lib/libvirt/images"));
        assert_eq!(config.network, "default");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
log_level: debug
log_json: true
hypervisor:
  backend: mock
  libvirt_uri: qemu:///session
storage:
  image_dir: /srv/images
  image_format: raw
network: lab
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.log_json);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.hypervisor.libvirt_uri, "qemu:///session");
        assert_eq!(config.storage.image_dir, PathBuf::from("/srv/images"));
        assert_eq!(config.storage.image_format, DiskFormat::Raw);
        // Unset fields keep their defaults
        assert_eq!(config.storage.qemu_img, "qemu-img");
        assert_eq!(config.network, "lab");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::from_yaml("hypervisor:\n  backend: xen\n").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.image_dir = PathBuf::from("images");
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default().with_cli_overrides(&args(&[
            "--log-level",
            "debug",
            "--libvirt-uri",
            "qemu:///session",
            "--image-dir",
            "/srv/images",
            "--dev",
        ]));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.hypervisor.libvirt_uri, "qemu:///session");
        assert_eq!(config.storage.image_dir, PathBuf::from("/srv/images"));
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        let result = Config::resolve(&args(&["--config", missing.to_str().unwrap()]));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hvctl.yaml");
        std::fs::write(&path, "network: lab\n").unwrap();

        let config = Config::resolve(&args(&["--config", path.to_str().unwrap(), "--dev"])).unwrap();
        assert_eq!(config.network, "lab");
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
    }
}
