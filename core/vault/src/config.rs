//! Vault settings and security policy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lockbox_common::{Error, Result};
use lockbox_crypto::{CryptoPolicy, HashAlgorithm, KdfAlgorithm, KdfParams, PayloadCipher};
use lockbox_hardware::AdapterConfig;
use lockbox_storage::fec;
use lockbox_storage::{VaultFileService, POLICY_REQUIRE_HARDWARE};

/// Settings file name inside the config directory.
pub const SETTINGS_FILENAME: &str = "settings.json";

/// Default number of backups kept per vault.
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Default minimum password length for new factors.
pub const DEFAULT_MIN_PASSWORD_LENGTH: u8 = 12;

/// Identity label hashing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityHashSettings {
    /// Algorithm for new identity records.
    pub algorithm: HashAlgorithm,
    /// Iteration or cost parameter.
    pub iterations: u32,
}

impl Default for IdentityHashSettings {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha3_256,
            iterations: 0,
        }
    }
}

/// Forward error correction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FecSettings {
    /// Protect header and body with parity shards.
    pub enabled: bool,
    /// Parity percentage, 5 to 50.
    pub redundancy: u8,
}

impl Default for FecSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redundancy: 10,
        }
    }
}

impl FecSettings {
    /// Redundancy byte written to the header (0 when disabled).
    pub fn header_value(&self) -> u8 {
        if self.enabled {
            self.redundancy
        } else {
            0
        }
    }
}

/// Backup rotation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Back up the previous container on every save.
    pub enabled: bool,
    /// Backups kept after pruning.
    pub max_backups: usize,
    /// Separate backup directory; next to the vault when unset.
    pub directory: Option<PathBuf>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_backups: DEFAULT_MAX_BACKUPS,
            directory: None,
        }
    }
}

/// Hardware key settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    /// Seconds to wait for a touch, 1 to 30.
    pub timeout_secs: u64,
    /// Device enumeration cache lifetime in milliseconds.
    pub cache_ttl_ms: u64,
    /// Ask for a second touch after a presence timeout.
    pub retry_on_timeout: bool,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            cache_ttl_ms: 2_000,
            retry_on_timeout: false,
        }
    }
}

/// User-level settings for creating and saving vaults.
///
/// Persisted as JSON. Missing fields take their defaults, so a settings
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Allow only standards-approved algorithms.
    pub restricted_mode: bool,
    /// KDF label for new slots ("pbkdf2-sha256" or "argon2id").
    pub kdf: Option<String>,
    /// KDF parameters for new slots.
    pub kdf_params: KdfParams,
    /// Identity label hashing.
    pub identity_hash: IdentityHashSettings,
    /// Payload cipher for new vaults.
    pub payload_cipher: PayloadCipher,
    /// Forward error correction.
    pub fec: FecSettings,
    /// Backup rotation.
    pub backups: BackupSettings,
    /// Hardware key timing.
    pub hardware: HardwareSettings,
    /// Policy written into new vaults.
    pub security: SecurityPolicy,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            restricted_mode: false,
            kdf: None,
            kdf_params: KdfParams::default(),
            identity_hash: IdentityHashSettings::default(),
            payload_cipher: PayloadCipher::default(),
            fec: FecSettings::default(),
            backups: BackupSettings::default(),
            hardware: HardwareSettings::default(),
            security: SecurityPolicy::default(),
        }
    }
}

impl VaultSettings {
    /// Default settings location: `<config dir>/lockbox/settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lockbox").join(SETTINGS_FILENAME))
    }

    /// Load and validate settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::from_io(e, format!("reading {}", path.display())))?;
        let settings: Self =
            serde_json::from_str(&json).map_err(|e| Error::Serialization(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(Error::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    /// Write settings as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::from_io(e, format!("creating {}", parent.display())))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| Error::from_io(e, format!("writing {}", path.display())))
    }

    /// Check every value against its allowed range.
    ///
    /// Algorithm choices that restricted mode forbids are rejected here too,
    /// except for an unrecognized KDF label, which falls back to PBKDF2 when
    /// a slot is created.
    pub fn validate(&self) -> Result<()> {
        let policy = self.crypto_policy();
        let kdf = lockbox_crypto::select_kdf(self.kdf.as_deref(), policy)?;
        self.kdf_params.validate(kdf)?;
        self.payload_cipher.ensure_allowed(policy)?;

        if policy.restricted && !self.identity_hash.algorithm.is_approved() {
            return Err(Error::NotPermitted(format!(
                "{:?} identity hashing is disabled in restricted mode",
                self.identity_hash.algorithm
            )));
        }
        if self.fec.enabled {
            fec::validate_redundancy(self.fec.redundancy)?;
        }
        if !(1..=30).contains(&self.hardware.timeout_secs) {
            return Err(Error::InvalidInput(format!(
                "Hardware timeout must be 1-30 seconds, got {}",
                self.hardware.timeout_secs
            )));
        }
        if self.backups.enabled && self.backups.max_backups == 0 {
            return Err(Error::InvalidInput(
                "max_backups must be at least 1 when backups are enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Algorithm policy implied by `restricted_mode`.
    pub fn crypto_policy(&self) -> CryptoPolicy {
        CryptoPolicy {
            restricted: self.restricted_mode,
        }
    }

    /// KDF for new slots under the current policy.
    pub fn kdf_algorithm(&self) -> Result<KdfAlgorithm> {
        lockbox_crypto::select_kdf(self.kdf.as_deref(), self.crypto_policy())
    }

    /// Hardware adapter configuration.
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig::new()
            .with_operation_timeout(Duration::from_secs(self.hardware.timeout_secs))
            .with_cache_ttl(Duration::from_millis(self.hardware.cache_ttl_ms))
    }

    /// File service honouring the backup directory.
    pub fn file_service(&self) -> VaultFileService {
        match &self.backups.directory {
            Some(dir) => VaultFileService::with_backup_dir(dir),
            None => VaultFileService::new(),
        }
    }
}

/// Per-vault policy stored in the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Every new factor must include a hardware key.
    pub require_hardware: bool,
    /// Minimum password length in characters.
    pub min_password_length: u8,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            require_hardware: false,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
        }
    }
}

impl SecurityPolicy {
    /// Header flag byte.
    pub fn flags(&self) -> u8 {
        if self.require_hardware {
            POLICY_REQUIRE_HARDWARE
        } else {
            0
        }
    }

    /// Rebuild from header fields.
    pub fn from_header(flags: u8, min_password_length: u8) -> Self {
        Self {
            require_hardware: flags & POLICY_REQUIRE_HARDWARE != 0,
            min_password_length,
        }
    }

    /// Check a new factor against the policy.
    ///
    /// # Errors
    /// - `InvalidInput` if the password is too short
    /// - `NotPermitted` if a hardware key is required but absent
    pub fn check_new_factor(&self, password: &[u8], has_hardware: bool) -> Result<()> {
        let length = String::from_utf8_lossy(password).chars().count();
        if length < self.min_password_length as usize {
            return Err(Error::InvalidInput(format!(
                "Password must be at least {} characters",
                self.min_password_length
            )));
        }
        if self.require_hardware && !has_hardware {
            return Err(Error::NotPermitted(
                "This vault requires a hardware key for every user".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = VaultSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.kdf_algorithm().unwrap(), KdfAlgorithm::Pbkdf2HmacSha256);
        assert_eq!(settings.backups.max_backups, 5);
        assert_eq!(settings.security.min_password_length, 12);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILENAME);

        let mut settings = VaultSettings::default();
        settings.kdf = Some("argon2id".to_string());
        settings.fec.enabled = true;
        settings.fec.redundancy = 25;
        settings.backups.directory = Some(dir.path().join("backups"));
        settings.save(&path).unwrap();

        let loaded = VaultSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.kdf_algorithm().unwrap(), KdfAlgorithm::Argon2id);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        std::fs::write(&path, r#"{"restricted_mode": true, "fec": {"enabled": true}}"#).unwrap();

        let settings = VaultSettings::load(&path).unwrap();
        assert!(settings.restricted_mode);
        assert!(settings.fec.enabled);
        assert_eq!(settings.fec.redundancy, 10);
        assert_eq!(settings.hardware.timeout_secs, 15);
        assert!(!settings.hardware.retry_on_timeout);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let settings = VaultSettings::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, VaultSettings::default());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut settings = VaultSettings::default();
        settings.fec.enabled = true;
        settings.fec.redundancy = 60;
        assert!(settings.validate().is_err());

        let mut settings = VaultSettings::default();
        settings.hardware.timeout_secs = 31;
        assert!(settings.validate().is_err());

        let mut settings = VaultSettings::default();
        settings.kdf_params.pbkdf2_iterations = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_restricted_mode_rejects_unapproved_choices() {
        let mut settings = VaultSettings::default();
        settings.restricted_mode = true;
        settings.validate().unwrap();

        settings.kdf = Some("argon2id".to_string());
        assert!(matches!(settings.validate(), Err(Error::NotPermitted(_))));

        settings.kdf = None;
        settings.payload_cipher = PayloadCipher::XChaCha20Poly1305;
        assert!(matches!(settings.validate(), Err(Error::NotPermitted(_))));
    }

    #[test]
    fn test_security_policy() {
        let policy = SecurityPolicy {
            require_hardware: true,
            min_password_length: 8,
        };
        assert_eq!(SecurityPolicy::from_header(policy.flags(), 8), policy);

        assert!(matches!(
            policy.check_new_factor(b"short", true),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            policy.check_new_factor(b"long enough", false),
            Err(Error::NotPermitted(_))
        ));
        policy.check_new_factor(b"long enough", true).unwrap();
    }
}
