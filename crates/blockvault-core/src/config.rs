use crate::device::{validate_mapping_name, Backing, DeviceSpec, KeyStrategy};
use crate::error::{BlockvaultError, BlockvaultResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HOSTNAME_SOURCES: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];
const DEFAULT_KEYFILE_DIR: &str = "/etc/blockvault/keys";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HostCfg {
    /// Identity used to derive secret-store record ids. Defaults to the kernel hostname.
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptsetupCfg {
    #[serde(default)]
    pub binary_path: Option<String>,

    #[serde(default)]
    pub cryptdisks_start_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for CryptsetupCfg {
    fn default() -> Self {
        Self {
            binary_path: None,
            cryptdisks_start_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CrypttabCfg {
    #[serde(default = "default_crypttab_path")]
    pub path: String,

    /// Flags appended after the cipher option on every row we write.
    #[serde(default = "default_crypttab_flags")]
    pub flags: String,
}

fn default_crypttab_path() -> String {
    "/etc/crypttab".to_string()
}

fn default_crypttab_flags() -> String {
    "noearly".to_string()
}

impl Default for CrypttabCfg {
    fn default() -> Self {
        Self {
            path: default_crypttab_path(),
            flags: default_crypttab_flags(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MountsCfg {
    #[serde(default = "default_fstab_path")]
    pub fstab_path: String,

    #[serde(default = "default_mounts_path")]
    pub mounts_path: String,
}

fn default_fstab_path() -> String {
    "/etc/fstab".to_string()
}

fn default_mounts_path() -> String {
    "/proc/mounts".to_string()
}

impl Default for MountsCfg {
    fn default() -> Self {
        Self {
            fstab_path: default_fstab_path(),
            mounts_path: default_mounts_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeystoreCfg {
    /// Directory holding one JSON document per secret record.
    #[serde(default = "default_keystore_path")]
    pub path: String,

    /// Shared secret used to encrypt records at rest.
    #[serde(default = "default_keystore_secret_path")]
    pub secret_path: String,

    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_keystore_path() -> String {
    "/var/lib/blockvault/keystore".to_string()
}

fn default_keystore_secret_path() -> String {
    "/etc/blockvault/keystore.secret".to_string()
}

fn default_kdf_iterations() -> u32 {
    100_000
}

impl Default for KeystoreCfg {
    fn default() -> Self {
        Self {
            path: default_keystore_path(),
            secret_path: default_keystore_secret_path(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LifecycleCfg {
    /// Remove the cipher engine packages once the last table row is gone.
    #[serde(default)]
    pub uninstall_if_last: bool,

    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
}

fn default_packages() -> Vec<String> {
    vec!["cryptsetup".to_string(), "cryptsetup-bin".to_string()]
}

impl Default for LifecycleCfg {
    fn default() -> Self {
        Self {
            uninstall_if_last: false,
            packages: default_packages(),
        }
    }
}

/// Key storage selector as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeystoreKind {
    #[serde(alias = "ephemeral")]
    Discard,
    #[serde(alias = "local_file")]
    Local,
    #[serde(alias = "shared")]
    Databag,
    #[serde(alias = "encrypted_shared")]
    EncryptedDatabag,
}

/// Desired end state for a declared device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceCfg {
    pub name: String,

    /// Raw block device to encrypt. Mutually exclusive with `file`.
    #[serde(default)]
    pub device: Option<String>,

    /// Backing file to provision and loop-attach. Mutually exclusive with `device`.
    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub size_mb: Option<u64>,

    #[serde(default = "default_sparse")]
    pub sparse: bool,

    pub keystore: KeystoreKind,

    #[serde(default)]
    pub keyfile: Option<String>,

    #[serde(default = "default_key_length")]
    pub key_length: usize,

    #[serde(default = "default_cipher")]
    pub cipher: String,

    #[serde(default)]
    pub cryptsetup_args: String,

    #[serde(default)]
    pub ensure: Ensure,
}

fn default_sparse() -> bool {
    true
}

fn default_key_length() -> usize {
    32
}

fn default_cipher() -> String {
    "aes-cbc-essiv:sha256".to_string()
}

impl DeviceCfg {
    /// Resolve this declaration into a validated `DeviceSpec`.
    pub fn to_spec(&self) -> BlockvaultResult<DeviceSpec> {
        let invalid = |reason: &str| BlockvaultError::InvalidDevice {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        let backing = match (&self.device, &self.file) {
            (Some(device), None) => Backing::Device(PathBuf::from(device)),
            (None, Some(file)) => {
                let size_mb = self
                    .size_mb
                    .ok_or_else(|| invalid("file-backed devices require size_mb"))?;
                Backing::File {
                    path: PathBuf::from(file),
                    size_mb,
                    sparse: self.sparse,
                }
            }
            (Some(_), Some(_)) => return Err(invalid("set either device or file, not both")),
            (None, None) => return Err(invalid("one of device or file is required")),
        };

        let key_strategy = match self.keystore {
            KeystoreKind::Discard => KeyStrategy::Ephemeral,
            KeystoreKind::Local => KeyStrategy::LocalFile {
                keyfile: self
                    .keyfile
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| default_keyfile(&self.name)),
            },
            KeystoreKind::Databag => KeyStrategy::SharedSecretStore { encrypted: false },
            KeystoreKind::EncryptedDatabag => KeyStrategy::SharedSecretStore { encrypted: true },
        };

        let spec = DeviceSpec {
            name: self.name.clone(),
            backing,
            key_strategy,
            key_length: self.key_length,
            cipher: self.cipher.clone(),
            extra_args: self.cryptsetup_args.clone(),
        };
        spec.validate()?;
        Ok(spec)
    }
}

fn default_keyfile(name: &str) -> PathBuf {
    Path::new(DEFAULT_KEYFILE_DIR).join(format!("{name}.key"))
}

/// Supported on-disk encodings for the configuration file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BlockvaultConfig {
    #[serde(default)]
    pub host: HostCfg,

    #[serde(default)]
    pub cryptsetup: CryptsetupCfg,

    #[serde(default)]
    pub crypttab: CrypttabCfg,

    #[serde(default)]
    pub mounts: MountsCfg,

    #[serde(default)]
    pub keystore: KeystoreCfg,

    #[serde(default)]
    pub lifecycle: LifecycleCfg,

    #[serde(default)]
    pub devices: Vec<DeviceCfg>,

    #[serde(skip)]
    #[schemars(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    #[schemars(skip)]
    pub format: ConfigFormat,
}

impl BlockvaultConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> BlockvaultResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = path.to_path_buf();
        cfg.format = format;

        let issues = cfg.validate();
        if let Some(first) = issues.into_iter().next() {
            return Err(BlockvaultError::InvalidConfig(first));
        }

        Ok(cfg)
    }

    /// Collect every problem with the configuration instead of stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.cryptsetup.timeout_secs == 0 {
            issues.push("cryptsetup.timeout_secs must be greater than zero".to_string());
        }
        if self.crypttab.path.trim().is_empty() {
            issues.push("crypttab.path must not be empty".to_string());
        }
        if self.crypttab.flags.chars().any(char::is_whitespace) {
            issues.push("crypttab.flags must not contain whitespace".to_string());
        }
        if self.keystore.kdf_iterations == 0 {
            issues.push("keystore.kdf_iterations must be greater than zero".to_string());
        }
        if let Some(identity) = &self.host.identity {
            if identity.trim().is_empty() {
                issues.push("host.identity must not be blank when set".to_string());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if let Err(err) = validate_mapping_name(&device.name) {
                issues.push(err.to_string());
                continue;
            }
            if !seen.insert(device.name.as_str()) {
                issues.push(format!("device `{}` is declared more than once", device.name));
            }
            if let Err(err) = device.to_spec() {
                issues.push(err.to_string());
            }
        }

        issues
    }

    /// Find a declared device by mapping name.
    pub fn device(&self, name: &str) -> Option<&DeviceCfg> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn crypttab_path(&self) -> PathBuf {
        PathBuf::from(&self.crypttab.path)
    }

    pub fn fstab_path(&self) -> PathBuf {
        PathBuf::from(&self.mounts.fstab_path)
    }

    pub fn mounts_path(&self) -> PathBuf {
        PathBuf::from(&self.mounts.mounts_path)
    }

    pub fn keystore_path(&self) -> PathBuf {
        PathBuf::from(&self.keystore.path)
    }

    pub fn keystore_secret_path(&self) -> PathBuf {
        PathBuf::from(&self.keystore.secret_path)
    }

    pub fn cryptsetup_timeout(&self) -> Duration {
        Duration::from_secs(self.cryptsetup.timeout_secs)
    }

    pub fn cryptsetup_binary_path(&self) -> Option<PathBuf> {
        self.cryptsetup.binary_path.as_ref().map(PathBuf::from)
    }

    pub fn cryptdisks_start_path(&self) -> Option<PathBuf> {
        self.cryptsetup.cryptdisks_start_path.as_ref().map(PathBuf::from)
    }

    /// Host identity for secret-store record ids, falling back to the kernel hostname.
    pub fn host_identity(&self) -> BlockvaultResult<String> {
        if let Some(identity) = &self.host.identity {
            return Ok(identity.trim().to_string());
        }

        for source in HOSTNAME_SOURCES {
            if let Ok(raw) = fs::read_to_string(source) {
                let name = raw.trim();
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
        }

        Err(BlockvaultError::InvalidConfig(format!(
            "host.identity not set and no hostname found in {:?}",
            HOSTNAME_SOURCES
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_TOML: &str = r#"
[host]
identity = "web01.example.com"

[lifecycle]
uninstall_if_last = true

[[devices]]
name = "vault1"
file = "/data/v1.img"
size_mb = 100
keystore = "local"

[[devices]]
name = "scratch"
device = "/dev/sdb1"
keystore = "discard"
ensure = "absent"
"#;

    #[test]
    fn load_toml_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blockvault.toml");
        fs::write(&path, SAMPLE_TOML).unwrap();

        let cfg = BlockvaultConfig::load(&path).unwrap();
        assert_eq!(cfg.format, ConfigFormat::Toml);
        assert_eq!(cfg.crypttab.path, "/etc/crypttab");
        assert_eq!(cfg.crypttab.flags, "noearly");
        assert!(cfg.lifecycle.uninstall_if_last);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[1].ensure, Ensure::Absent);

        let spec = cfg.device("vault1").unwrap().to_spec().unwrap();
        assert_eq!(
            spec.backing,
            Backing::File {
                path: PathBuf::from("/data/v1.img"),
                size_mb: 100,
                sparse: true,
            }
        );
        assert_eq!(
            spec.key_strategy,
            KeyStrategy::LocalFile {
                keyfile: PathBuf::from("/etc/blockvault/keys/vault1.key")
            }
        );
        assert_eq!(spec.key_length, 32);
    }

    #[test]
    fn load_yaml_accepts_strategy_aliases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blockvault.yaml");
        fs::write(
            &path,
            "devices:\n  - name: shared1\n    device: /dev/sdc\n    keystore: encrypted_shared\n",
        )
        .unwrap();

        let cfg = BlockvaultConfig::load(&path).unwrap();
        assert_eq!(cfg.format, ConfigFormat::Yaml);
        let spec = cfg.devices[0].to_spec().unwrap();
        assert_eq!(
            spec.key_strategy,
            KeyStrategy::SharedSecretStore { encrypted: true }
        );
    }

    #[test]
    fn validate_reports_duplicates_and_missing_backing() {
        let cfg = BlockvaultConfig {
            devices: vec![
                DeviceCfg {
                    name: "dup".into(),
                    device: Some("/dev/sdb".into()),
                    file: None,
                    size_mb: None,
                    sparse: true,
                    keystore: KeystoreKind::Discard,
                    keyfile: None,
                    key_length: 32,
                    cipher: default_cipher(),
                    cryptsetup_args: String::new(),
                    ensure: Ensure::Present,
                },
                DeviceCfg {
                    name: "dup".into(),
                    device: None,
                    file: None,
                    size_mb: None,
                    sparse: true,
                    keystore: KeystoreKind::Discard,
                    keyfile: None,
                    key_length: 32,
                    cipher: default_cipher(),
                    cryptsetup_args: String::new(),
                    ensure: Ensure::Present,
                },
            ],
            ..BlockvaultConfig::default()
        };

        let issues = cfg.validate();
        assert_eq!(issues.len(), 2, "{issues:?}");
        assert!(issues.iter().any(|i| i.contains("more than once")));
        assert!(issues.iter().any(|i| i.contains("one of device or file")));
    }

    #[test]
    fn file_backing_requires_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blockvault.toml");
        fs::write(
            &path,
            "[[devices]]\nname = \"v\"\nfile = \"/data/v.img\"\nkeystore = \"local\"\n",
        )
        .unwrap();

        let err = BlockvaultConfig::load(&path).unwrap_err();
        assert!(matches!(err, BlockvaultError::InvalidConfig(_)));
    }

    #[test]
    fn host_identity_prefers_config() {
        let cfg = BlockvaultConfig {
            host: HostCfg {
                identity: Some(" node-a ".into()),
            },
            ..BlockvaultConfig::default()
        };
        assert_eq!(cfg.host_identity().unwrap(), "node-a");
    }
}
