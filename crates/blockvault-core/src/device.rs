//! Fully-resolved description of one encrypted block device.

use crate::error::{BlockvaultError, BlockvaultResult};
use std::path::{Path, PathBuf};

/// Directory under which the cipher engine exposes decrypted mappings.
pub const MAPPER_DIR: &str = "/dev/mapper";

/// Storage underneath an encrypted mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// An existing block device such as `/dev/sdb1`.
    Device(PathBuf),
    /// A regular file provisioned on demand and loop-attached by the engine.
    File {
        path: PathBuf,
        size_mb: u64,
        sparse: bool,
    },
}

impl Backing {
    /// Path handed to the cipher engine as the mapping source.
    pub fn source(&self) -> &Path {
        match self {
            Backing::Device(path) => path,
            Backing::File { path, .. } => path,
        }
    }
}

/// How key material for a device is produced and kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Fresh randomness on every activation; data does not survive a close.
    Ephemeral,
    /// Base64 key kept in a root-only file on this host.
    LocalFile { keyfile: PathBuf },
    /// Key kept in the shared secret store, keyed by host and device name.
    SharedSecretStore { encrypted: bool },
}

impl KeyStrategy {
    /// Strategies that are recorded in the mapping table and reactivated from it at boot.
    pub fn uses_mapping_table(&self) -> bool {
        matches!(self, KeyStrategy::Ephemeral | KeyStrategy::LocalFile { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            KeyStrategy::Ephemeral => "ephemeral",
            KeyStrategy::LocalFile { .. } => "local",
            KeyStrategy::SharedSecretStore { encrypted: false } => "shared",
            KeyStrategy::SharedSecretStore { encrypted: true } => "encrypted-shared",
        }
    }
}

/// Input to a single lifecycle call. Immutable for the duration of that call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub name: String,
    pub backing: Backing,
    pub key_strategy: KeyStrategy,
    /// Number of random bytes generated for new keys.
    pub key_length: usize,
    pub cipher: String,
    /// Opaque arguments appended to the cipher engine invocation.
    pub extra_args: String,
}

impl DeviceSpec {
    /// Path of the decrypted block interface once the mapping is active.
    pub fn mapper_path(&self) -> PathBuf {
        Path::new(MAPPER_DIR).join(&self.name)
    }

    /// Reject specs that could not be written to the mapping table or handed to the engine.
    pub fn validate(&self) -> BlockvaultResult<()> {
        validate_mapping_name(&self.name)?;

        if self.backing.source().as_os_str().is_empty() {
            return Err(self.invalid("backing path is empty"));
        }
        if contains_whitespace(&self.backing.source().to_string_lossy()) {
            return Err(self.invalid("backing path must not contain whitespace"));
        }
        if let Backing::File { size_mb, .. } = &self.backing {
            if *size_mb == 0 {
                return Err(self.invalid("backing file size must be at least 1 MB"));
            }
        }

        if let KeyStrategy::LocalFile { keyfile } = &self.key_strategy {
            if keyfile.as_os_str().is_empty() {
                return Err(self.invalid("local key strategy requires a keyfile path"));
            }
            if contains_whitespace(&keyfile.to_string_lossy()) {
                return Err(self.invalid("keyfile path must not contain whitespace"));
            }
        }

        if self.key_length == 0 {
            return Err(self.invalid("key_length must be greater than zero"));
        }
        if self.cipher.trim().is_empty() || contains_whitespace(&self.cipher) {
            return Err(self.invalid("cipher must be a single non-empty token"));
        }

        Ok(())
    }

    fn invalid(&self, reason: &str) -> BlockvaultError {
        BlockvaultError::InvalidDevice {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Mapping names become a table field and a `/dev/mapper` node, so they must be a single path segment.
pub fn validate_mapping_name(name: &str) -> BlockvaultResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if contains_whitespace(name) {
        Some("name must not contain whitespace")
    } else if name.contains('/') {
        Some("name must not contain '/'")
    } else if name.starts_with('#') {
        Some("name must not start with '#'")
    } else if name == "." || name == ".." {
        Some("name must not be a relative path component")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(BlockvaultError::InvalidDevice {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn contains_whitespace(value: &str) -> bool {
    value.chars().any(char::is_whitespace)
}
