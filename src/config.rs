//! Configuration management for the Provenance Registry
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (provenance.toml)
//! - Environment variables (PROVENANCE__*)
//!
//! ## Example config file (provenance.toml):
//! ```toml
//! [registry]
//! state_path = "./registry.json"
//! administrator = "0x71C7656EC7ab88b098defB751B7401B5f6d8976F"
//! require_metadata = false
//! max_reason_len = 1024
//! max_uri_len = 2048
//!
//! [flags]
//! policy = "verifiers"
//! verifiers = ["regulator-eu", "inspector-42"]
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::flag::{FlagManager, FlagPolicy, OpenFlagPolicy, VerifierFlagPolicy};
use crate::product::Identity;

/// Main configuration for the provenance registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvenanceConfig {
    /// Registry settings
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Flag authorization settings
    #[serde(default)]
    pub flags: FlagSettings,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Path of the JSON state file used by the CLI
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Identity allowed to clear any flag
    #[serde(default)]
    pub administrator: Option<String>,

    /// Reject registrations that do not carry the metadata record
    #[serde(default)]
    pub require_metadata: bool,

    /// Longest accepted flag reason, in bytes
    #[serde(default = "default_max_reason_len")]
    pub max_reason_len: usize,

    /// Longest accepted metadata URI, in bytes
    #[serde(default = "default_max_uri_len")]
    pub max_uri_len: usize,
}

/// Who may raise flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlagPolicyKind {
    /// Anyone
    #[default]
    Open,
    /// Listed verifiers and the administrator
    Verifiers,
}

/// Flag configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlagSettings {
    #[serde(default)]
    pub policy: FlagPolicyKind,

    /// Identities allowed to flag under the `verifiers` policy
    #[serde(default)]
    pub verifiers: Vec<String>,
}

// Default value functions
fn default_state_path() -> PathBuf {
    PathBuf::from("registry.json")
}

fn default_max_reason_len() -> usize {
    crate::flag::DEFAULT_MAX_REASON_LEN
}

fn default_max_uri_len() -> usize {
    crate::registry::DEFAULT_MAX_URI_LEN
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            administrator: None,
            require_metadata: false,
            max_reason_len: default_max_reason_len(),
            max_uri_len: default_max_uri_len(),
        }
    }
}

impl ProvenanceConfig {
    /// Load configuration from default locations
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = [
            "provenance.toml",
            ".provenance.toml",
            "config/provenance.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "provenance") {
            let xdg_config = config_dir.config_dir().join("provenance.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (PROVENANCE__*)
        builder = builder.add_source(
            Environment::with_prefix("PROVENANCE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get the state file path (resolves relative paths)
    pub fn state_path(&self) -> PathBuf {
        if self.registry.state_path.is_absolute() {
            self.registry.state_path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.registry.state_path)
        }
    }

    /// Parsed administrator identity, if configured
    pub fn administrator(&self) -> Result<Option<Identity>> {
        self.registry
            .administrator
            .as_deref()
            .map(Identity::parse)
            .transpose()
    }

    /// Build the configured flag policy
    pub fn flag_policy(&self) -> Result<Box<dyn FlagPolicy>> {
        let administrator = self.administrator()?;
        Ok(match self.flags.policy {
            FlagPolicyKind::Open => Box::new(OpenFlagPolicy::new(administrator)),
            FlagPolicyKind::Verifiers => {
                let verifiers = self
                    .flags
                    .verifiers
                    .iter()
                    .map(|v| Identity::parse(v))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(VerifierFlagPolicy::new(administrator, verifiers))
            }
        })
    }

    /// Build a flag manager from the policy and reason limit
    pub fn flag_manager(&self) -> Result<FlagManager> {
        Ok(FlagManager::new(self.flag_policy()?).with_max_reason_len(self.registry.max_reason_len))
    }
}
