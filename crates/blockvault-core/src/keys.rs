//! Strategy dispatch for device key material.

use crate::device::{DeviceSpec, KeyStrategy};
use crate::error::{BlockvaultError, BlockvaultResult};
use crate::keyfile::{ensure_key_file, fingerprint, generate_key_text};
use crate::keystore::{record_id, SecretRecord, SecretStore};
use log::{info, warn};
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Key source written to the table for devices that are re-keyed on every activation.
pub const EPHEMERAL_KEY_SOURCE: &str = "/dev/urandom";

/// Key material resolved for one activation.
#[derive(Debug)]
pub enum KeyMaterial {
    /// Nothing persisted; the engine reads fresh randomness itself.
    Ephemeral,
    /// Key text stored in `keyfile`; `created` is set when this call wrote it.
    LocalFile {
        keyfile: PathBuf,
        key: Zeroizing<Vec<u8>>,
        created: bool,
    },
    /// Authoritative record from the shared store; `created` is set when this call saved it.
    Shared { record: SecretRecord, created: bool },
}

impl KeyMaterial {
    /// Value for the table's key source column.
    pub fn key_source(&self) -> String {
        match self {
            KeyMaterial::Ephemeral => EPHEMERAL_KEY_SOURCE.to_string(),
            KeyMaterial::LocalFile { keyfile, .. } => keyfile.display().to_string(),
            KeyMaterial::Shared { record, .. } => format!("store:{}", record.id),
        }
    }

    /// True when this call generated fresh persistent material.
    pub fn created(&self) -> bool {
        match self {
            KeyMaterial::Ephemeral => false,
            KeyMaterial::LocalFile { created, .. } | KeyMaterial::Shared { created, .. } => *created,
        }
    }
}

/// Produce or retrieve key material for `spec` according to its strategy.
///
/// `host` is only consulted for the shared store. A store failure is returned
/// as-is; a new key is never generated when the store cannot be read.
pub fn obtain_key<S: SecretStore>(
    spec: &DeviceSpec,
    host: &str,
    store: &S,
) -> BlockvaultResult<KeyMaterial> {
    match &spec.key_strategy {
        KeyStrategy::Ephemeral => Ok(KeyMaterial::Ephemeral),
        KeyStrategy::LocalFile { keyfile } => {
            let (key, created) = ensure_key_file(keyfile, spec.key_length)?;
            if created {
                info!(
                    "generated key file {} for {} (fingerprint {})",
                    keyfile.display(),
                    spec.name,
                    fingerprint(&key)
                );
            }
            Ok(KeyMaterial::LocalFile {
                keyfile: keyfile.clone(),
                key,
                created,
            })
        }
        KeyStrategy::SharedSecretStore { encrypted } => {
            let id = record_id(host, &spec.name);
            if let Some(record) = store.find(&id)? {
                warn_on_drift(spec, &record);
                return Ok(KeyMaterial::Shared {
                    record,
                    created: false,
                });
            }

            let key = generate_key_text(spec.key_length)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|err| BlockvaultError::KeyGeneration(err.to_string()))?;
            let record = SecretRecord {
                id,
                name: spec.name.clone(),
                device: spec.backing.source().display().to_string(),
                key_length: spec.key_length,
                cipher: spec.cipher.clone(),
                extra_args: spec.extra_args.clone(),
                key,
            };
            store.save(&record, *encrypted)?;
            info!(
                "stored new {} record {} for {}",
                spec.key_strategy.label(),
                record.id,
                spec.name
            );
            Ok(KeyMaterial::Shared {
                record,
                created: true,
            })
        }
    }
}

fn warn_on_drift(spec: &DeviceSpec, record: &SecretRecord) {
    let device = spec.backing.source().display().to_string();
    if record.cipher != spec.cipher
        || record.key_length != spec.key_length
        || record.extra_args != spec.extra_args
        || record.device != device
    {
        warn!(
            "{}: settings differ from stored record {}; using the stored record",
            spec.name, record.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Backing;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<HashMap<String, (SecretRecord, bool)>>,
        fail_find: bool,
    }

    impl SecretStore for MemoryStore {
        fn find(&self, id: &str) -> BlockvaultResult<Option<SecretRecord>> {
            if self.fail_find {
                return Err(BlockvaultError::SecretStore("store offline".into()));
            }
            Ok(self.records.lock().unwrap().get(id).map(|(r, _)| r.clone()))
        }

        fn save(&self, record: &SecretRecord, encrypted: bool) -> BlockvaultResult<()> {
            self.records
                .lock()
                .unwrap()
                .insert(record.id.clone(), (record.clone(), encrypted));
            Ok(())
        }
    }

    fn spec(strategy: KeyStrategy) -> DeviceSpec {
        DeviceSpec {
            name: "vault1".to_string(),
            backing: Backing::Device(PathBuf::from("/dev/sdb1")),
            key_strategy: strategy,
            key_length: 32,
            cipher: "aes-cbc-essiv:sha256".to_string(),
            extra_args: String::new(),
        }
    }

    #[test]
    fn ephemeral_uses_random_stream() {
        let material = obtain_key(&spec(KeyStrategy::Ephemeral), "host", &MemoryStore::default()).unwrap();
        assert_eq!(material.key_source(), "/dev/urandom");
        assert!(matches!(material, KeyMaterial::Ephemeral));
    }

    #[test]
    fn local_file_is_reused() {
        let dir = tempdir().unwrap();
        let keyfile = dir.path().join("vault1.key");
        let spec = spec(KeyStrategy::LocalFile {
            keyfile: keyfile.clone(),
        });
        let store = MemoryStore::default();

        let first = obtain_key(&spec, "host", &store).unwrap();
        let second = obtain_key(&spec, "host", &store).unwrap();
        assert!(first.created());
        assert!(!second.created());
        let (KeyMaterial::LocalFile { key: a, .. }, KeyMaterial::LocalFile { key: b, .. }) =
            (&first, &second)
        else {
            panic!("expected local key material");
        };
        assert_eq!(a, b);
        assert_eq!(second.key_source(), keyfile.display().to_string());
    }

    #[test]
    fn shared_record_is_created_once_and_then_authoritative() {
        let store = MemoryStore::default();
        let mut spec = spec(KeyStrategy::SharedSecretStore { encrypted: true });

        let first = obtain_key(&spec, "web01.example.com", &store).unwrap();
        assert!(first.created());
        let (_, encrypted) = store.records.lock().unwrap()["web01-example-com-vault1"].clone();
        assert!(encrypted);

        spec.cipher = "aes-xts-plain64".to_string();
        spec.key_length = 64;
        let second = obtain_key(&spec, "web01.example.com", &store).unwrap();
        assert!(!second.created());
        let KeyMaterial::Shared { record: original, .. } = &first else {
            panic!("expected shared key material");
        };
        match second {
            KeyMaterial::Shared { record, .. } => {
                assert_eq!(record.key, original.key);
                assert_eq!(record.cipher, "aes-cbc-essiv:sha256");
                assert_eq!(record.key_length, 32);
            }
            other => panic!("unexpected material {other:?}"),
        }
    }

    #[test]
    fn store_failure_does_not_generate_a_key() {
        let store = MemoryStore {
            fail_find: true,
            ..MemoryStore::default()
        };
        let err = obtain_key(&spec(KeyStrategy::SharedSecretStore { encrypted: false }), "host", &store)
            .unwrap_err();
        assert!(matches!(err, BlockvaultError::SecretStore(_)));
        assert!(store.records.lock().unwrap().is_empty());
    }
}
