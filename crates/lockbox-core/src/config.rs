use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{VaultError, VaultResult};
use crate::types::RecordLayout;

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockboxConfig {
    pub vault: VaultConfig,
    pub crypto: CryptoConfig,
    pub backup: BackupConfig,
    pub log: LogConfig,
}

impl LockboxConfig {
    pub fn from_toml_str(content: &str) -> VaultResult<Self> {
        toml::from_str(content).map_err(|e| VaultError::Format(format!("parsing config: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault root directory (holds keyfile.json, data/, documents/)
    pub root: PathBuf,
    /// Layout used for categories that have never been written
    pub default_layout: RecordLayout,
}

/// Argon2id parameters written into new key files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Copy keyfile.json into new archives so they restore on a fresh machine
    pub include_master_key: bool,
    /// Where pre-restore safety backups are written
    pub safety_backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.local/share/lockbox"),
            default_layout: RecordLayout::Container,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            include_master_key: true,
            safety_backup_dir: PathBuf::from("~/.local/share/lockbox-safety"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[vault]
root = "/srv/lockbox"
default_layout = "per_record"

[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8

[backup]
include_master_key = false
safety_backup_dir = "/srv/lockbox-safety"

[log]
level = "debug"
format = "json"
"#;
        let config = LockboxConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.vault.root, PathBuf::from("/srv/lockbox"));
        assert_eq!(config.vault.default_layout, RecordLayout::PerRecord);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.crypto.argon2_parallelism, 8);
        assert!(!config.backup.include_master_key);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config = LockboxConfig::from_toml_str("").unwrap();

        assert_eq!(config.vault.default_layout, RecordLayout::Container);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 65536);
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert!(config.backup.include_master_key);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[log]
level = "warn"
"#;
        let config = LockboxConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.log.level, "warn");
        assert_eq!(config.log.format, "text");
        assert_eq!(config.crypto.argon2_time_cost, 3);
    }

    #[test]
    fn test_unknown_layout_rejected() {
        let result = LockboxConfig::from_toml_str("[vault]\ndefault_layout = \"sqlite\"\n");
        assert!(matches!(result, Err(VaultError::Format(_))));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = LockboxConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = LockboxConfig::from_toml_str(&toml_str).unwrap();

        assert_eq!(config.vault.root, parsed.vault.root);
        assert_eq!(config.backup.safety_backup_dir, parsed.backup.safety_backup_dir);
    }
}
