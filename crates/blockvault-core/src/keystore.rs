//! Shared secret store for device keys that must survive reboots.
//!
//! Records are addressed by `record_id(host, device)` and are written once:
//! after the first activation the stored record, not the caller's current
//! settings, decides how the device is opened.

use crate::error::{BlockvaultError, BlockvaultResult};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::fs::{self, DirBuilder};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use zeroize::{Zeroize, Zeroizing};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SEALED_KEY_LEN: usize = 32;

/// Settings and key captured when a shared-store device is first activated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub name: String,
    pub device: String,
    pub key_length: usize,
    pub cipher: String,
    #[serde(default, alias = "cryptsetup_args")]
    pub extra_args: String,
    pub key: String,
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device", &self.device)
            .field("key_length", &self.key_length)
            .field("cipher", &self.cipher)
            .field("extra_args", &self.extra_args)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Drop for SecretRecord {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Deterministic, per-host record id: `host-device` with `.` and `/` folded to `-`.
pub fn record_id(host: &str, device_name: &str) -> String {
    format!("{host}-{device_name}").replace(['.', '/'], "-")
}

/// Persistence for secret records.
pub trait SecretStore {
    /// Look up a record. Absence is `Ok(None)`, never an error.
    fn find(&self, id: &str) -> BlockvaultResult<Option<SecretRecord>>;

    /// Persist a new record, optionally encrypted at rest. Never overwrites.
    fn save(&self, record: &SecretRecord, encrypted: bool) -> BlockvaultResult<()>;
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
enum StoredDocument {
    Plain {
        id: String,
        record: SecretRecord,
    },
    Sealed {
        id: String,
        salt: String,
        nonce: String,
        ciphertext: String,
    },
}

impl StoredDocument {
    fn id(&self) -> &str {
        match self {
            StoredDocument::Plain { id, .. } | StoredDocument::Sealed { id, .. } => id,
        }
    }
}

/// Directory-backed store: one JSON document per record, readable by root only.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
    secret_path: PathBuf,
    kdf_iterations: u32,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>, secret_path: impl Into<PathBuf>, kdf_iterations: u32) -> Self {
        Self {
            dir: dir.into(),
            secret_path: secret_path.into(),
            kdf_iterations: kdf_iterations.max(1),
        }
    }

    fn record_path(&self, id: &str) -> BlockvaultResult<PathBuf> {
        if id.is_empty() || id.contains('/') || id.starts_with('.') {
            return Err(store_error(format!("invalid record id `{id}`")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn load_secret(&self) -> BlockvaultResult<Zeroizing<Vec<u8>>> {
        let raw = Zeroizing::new(fs::read(&self.secret_path).map_err(|err| {
            store_error(format!(
                "unable to read store secret {}: {err}",
                self.secret_path.display()
            ))
        })?);
        let trimmed = trim_ascii_whitespace(&raw);
        if trimmed.is_empty() {
            return Err(store_error(format!(
                "store secret {} is empty",
                self.secret_path.display()
            )));
        }
        Ok(Zeroizing::new(trimmed.to_vec()))
    }

    fn cipher_for(&self, salt: &[u8]) -> BlockvaultResult<Aes256Gcm> {
        let secret = self.load_secret()?;
        let mut derived = Zeroizing::new([0u8; SEALED_KEY_LEN]);
        pbkdf2_hmac::<Sha256>(&secret, salt, self.kdf_iterations, &mut derived[..]);
        Aes256Gcm::new_from_slice(&derived[..])
            .map_err(|_| store_error("unable to initialise record cipher"))
    }

    fn seal(&self, record: &SecretRecord) -> BlockvaultResult<StoredDocument> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .and_then(|_| OsRng.try_fill_bytes(&mut nonce))
            .map_err(|err| BlockvaultError::KeyGeneration(err.to_string()))?;

        let plaintext = Zeroizing::new(serde_json::to_vec(record).map_err(store_error)?);
        let ciphertext = self
            .cipher_for(&salt)?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: record.id.as_bytes(),
                },
            )
            .map_err(|_| store_error(format!("failed to seal record {}", record.id)))?;

        Ok(StoredDocument::Sealed {
            id: record.id.clone(),
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn unseal(&self, id: &str, salt: &str, nonce: &str, ciphertext: &str) -> BlockvaultResult<SecretRecord> {
        let decode = |field: &str, value: &str| {
            BASE64
                .decode(value.as_bytes())
                .map_err(|err| store_error(format!("record {id}: invalid {field}: {err}")))
        };
        let salt = decode("salt", salt)?;
        let nonce = decode("nonce", nonce)?;
        let ciphertext = decode("ciphertext", ciphertext)?;
        if nonce.len() != NONCE_LEN {
            return Err(store_error(format!("record {id}: nonce must be {NONCE_LEN} bytes")));
        }

        let plaintext = Zeroizing::new(
            self.cipher_for(&salt)?
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &ciphertext,
                        aad: id.as_bytes(),
                    },
                )
                .map_err(|_| {
                    store_error(format!(
                        "record {id} could not be decrypted; check {}",
                        self.secret_path.display()
                    ))
                })?,
        );
        serde_json::from_slice(&plaintext).map_err(store_error)
    }

    fn ensure_dir(&self) -> BlockvaultResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .map_err(|err| {
                store_error(format!("unable to create {}: {err}", self.dir.display()))
            })
    }
}

impl SecretStore for FileSecretStore {
    fn find(&self, id: &str) -> BlockvaultResult<Option<SecretRecord>> {
        let path = self.record_path(id)?;
        let raw = match fs::read(&path) {
            Ok(raw) => Zeroizing::new(raw),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no secret record at {}", path.display());
                return Ok(None);
            }
            Err(err) => {
                return Err(store_error(format!("unable to read {}: {err}", path.display())))
            }
        };

        let document: StoredDocument = serde_json::from_slice(&raw).map_err(store_error)?;
        if document.id() != id {
            return Err(store_error(format!(
                "{} holds record `{}`, expected `{id}`",
                path.display(),
                document.id()
            )));
        }

        let record = match document {
            StoredDocument::Plain { record, .. } => record,
            StoredDocument::Sealed {
                id,
                salt,
                nonce,
                ciphertext,
            } => self.unseal(&id, &salt, &nonce, &ciphertext)?,
        };

        if record.id != id {
            return Err(store_error(format!(
                "record body id `{}` does not match `{id}`",
                record.id
            )));
        }
        Ok(Some(record))
    }

    fn save(&self, record: &SecretRecord, encrypted: bool) -> BlockvaultResult<()> {
        let path = self.record_path(&record.id)?;
        self.ensure_dir()?;

        let document = if encrypted {
            self.seal(record)?
        } else {
            StoredDocument::Plain {
                id: record.id.clone(),
                record: record.clone(),
            }
        };
        let serialized = Zeroizing::new(serde_json::to_vec_pretty(&document).map_err(store_error)?);

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(store_error)?;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600)).map_err(store_error)?;
        tmp.write_all(&serialized)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(store_error)?;
        tmp.persist_noclobber(&path).map_err(|err| {
            if err.error.kind() == ErrorKind::AlreadyExists {
                store_error(format!("record {} already exists", record.id))
            } else {
                store_error(format!("unable to write {}: {}", path.display(), err.error))
            }
        })?;

        info!(
            "saved {} secret record {} to {}",
            if encrypted { "encrypted" } else { "plain" },
            record.id,
            path.display()
        );
        Ok(())
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |idx| idx + 1);
    &bytes[start..end]
}

fn store_error(err: impl fmt::Display) -> BlockvaultError {
    BlockvaultError::SecretStore(err.to_string())
}

/// Reads the store location and secret from configuration.
impl From<&crate::config::BlockvaultConfig> for FileSecretStore {
    fn from(config: &crate::config::BlockvaultConfig) -> Self {
        Self::new(
            config.keystore_path(),
            config.keystore_secret_path(),
            config.keystore.kdf_iterations,
        )
    }
}
