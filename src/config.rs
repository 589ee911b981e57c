//! Configuration management for mirrorcrypt

use crate::crypto::SALT_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default attribute cache TTL handed to the kernel
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Key derivation configuration
    pub encryption: EncryptionConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Key derivation configuration
///
/// Every field feeds the content key: files encrypted under one set of
/// values cannot be read back under another.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (built-in application salt if empty)
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits (needs allow_other)
    pub auto_unmount: bool,

    /// Attribute and entry cache TTL in seconds
    pub attr_ttl_secs: u64,

    /// Mark files created through the mount as encrypted
    pub encrypt_new_files: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fs_name: "mirrorcrypt".to_string(),
            allow_other: false,
            auto_unmount: true,
            attr_ttl_secs: DEFAULT_ATTR_TTL_SECS,
            encrypt_new_files: false,
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mirrorcrypt").join("config.json"))
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load an explicit file, else the default file if present, else defaults
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_bool("MIRRORCRYPT_ALLOW_OTHER") {
            self.mount.allow_other = value;
        }

        if let Some(value) = env_bool("MIRRORCRYPT_ENCRYPT_NEW_FILES") {
            self.mount.encrypt_new_files = value;
        }

        if let Ok(ttl) = std::env::var("MIRRORCRYPT_ATTR_TTL_SECS") {
            if let Ok(secs) = ttl.trim().parse::<u64>() {
                self.mount.attr_ttl_secs = secs;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let enc = &self.encryption;
        if enc.argon2_memory_kib == 0 || enc.argon2_iterations == 0 || enc.argon2_parallelism == 0
        {
            return Err(Error::InvalidConfig(
                "Argon2 costs must be greater than 0".to_string(),
            ));
        }

        if !enc.salt.is_empty() && enc.salt.len() != SALT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Salt must be empty or exactly {} bytes, got {}",
                SALT_SIZE,
                enc.salt.len()
            )));
        }

        if self.mount.fs_name.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
