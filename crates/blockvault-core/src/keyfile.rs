//! Key generation and local key file persistence.

use crate::error::{BlockvaultError, BlockvaultResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Generate `length` random bytes and return them as base64 text without a trailing newline.
///
/// The text itself is the passphrase handed to the cipher engine.
pub fn generate_key_text(length: usize) -> BlockvaultResult<Zeroizing<Vec<u8>>> {
    if length == 0 {
        return Err(BlockvaultError::KeyGeneration(
            "requested key length is zero".to_string(),
        ));
    }

    let mut raw = Zeroizing::new(vec![0u8; length]);
    OsRng
        .try_fill_bytes(&mut raw)
        .map_err(|err| BlockvaultError::KeyGeneration(err.to_string()))?;
    Ok(Zeroizing::new(BASE64.encode(&raw[..]).into_bytes()))
}

/// Return the key stored at `path`, creating it with fresh material if absent.
///
/// The boolean is `true` when this call created the file. Existing files are
/// never rewritten.
pub fn ensure_key_file(path: &Path, length: usize) -> BlockvaultResult<(Zeroizing<Vec<u8>>, bool)> {
    if path.exists() {
        return Ok((read_key_file(path)?, false));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| invalid_key(path, err.to_string()))?;
    }

    let key = generate_key_text(length)?;
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => file,
        // Lost a race with another writer: theirs wins.
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Ok((read_key_file(path)?, false));
        }
        Err(err) => return Err(invalid_key(path, err.to_string())),
    };

    file.write_all(&key)
        .and_then(|_| file.sync_all())
        .map_err(|err| invalid_key(path, err.to_string()))?;
    Ok((key, true))
}

/// Read key text from `path`, refusing empty files.
pub fn read_key_file(path: &Path) -> BlockvaultResult<Zeroizing<Vec<u8>>> {
    let contents = Zeroizing::new(fs::read(path).map_err(|err| invalid_key(path, err.to_string()))?);
    if contents.is_empty() {
        return Err(invalid_key(path, "file is empty"));
    }
    Ok(contents)
}

/// Short SHA-256 fingerprint suitable for logs; never log the key itself.
pub fn fingerprint(key: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(key));
    digest[..16].to_string()
}

fn invalid_key(path: &Path, reason: impl Into<String>) -> BlockvaultError {
    BlockvaultError::InvalidKeyFile {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn generated_key_decodes_to_requested_length() {
        let key = generate_key_text(48).unwrap();
        assert!(!key.ends_with(b"\n"));
        let decoded = BASE64.decode(&key[..]).unwrap();
        assert_eq!(decoded.len(), 48);
    }

    #[test]
    fn generated_keys_differ() {
        let a = generate_key_text(32).unwrap();
        let b = generate_key_text(32).unwrap();
        assert_ne!(&a[..], &b[..]);
    }

    #[test]
    fn zero_length_is_rejected() {
        let err = generate_key_text(0).unwrap_err();
        assert!(matches!(err, BlockvaultError::KeyGeneration(_)));
    }

    #[test]
    fn ensure_key_file_creates_owner_only_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("vault1.key");

        let (key, created) = ensure_key_file(&path, 32).unwrap();
        assert!(created);
        assert_eq!(fs::read(&path).unwrap(), key.to_vec());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn ensure_key_file_reuses_existing_material() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault1.key");

        let (first, _) = ensure_key_file(&path, 32).unwrap();
        let (second, created) = ensure_key_file(&path, 64).unwrap();
        assert!(!created);
        assert_eq!(&first[..], &second[..]);
    }

    #[test]
    fn empty_key_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.key");
        fs::write(&path, b"").unwrap();

        let err = ensure_key_file(&path, 32).unwrap_err();
        assert!(matches!(err, BlockvaultError::InvalidKeyFile { .. }));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint(b"abc"), "ba7816bf8f01cfea");
    }
}
