//! Backing files for loop-attached encrypted devices.

use crate::error::{BlockvaultError, BlockvaultResult};
use log::{debug, info};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

const MIB: u64 = 1024 * 1024;

/// Make sure a backing file of `size_mb` MiB exists at `path`.
///
/// Returns `true` when this call created the file. An existing file is left
/// exactly as found, whatever its size, since it may already hold a live
/// encrypted payload.
pub fn ensure_backing_file(path: &Path, size_mb: u64, sparse: bool) -> BlockvaultResult<bool> {
    if path.exists() {
        debug!("backing file {} already present", path.display());
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| BlockvaultError::provision(path, err))?;
        }
    }

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(BlockvaultError::provision(path, err)),
    };

    let bytes = size_mb
        .checked_mul(MIB)
        .ok_or_else(|| BlockvaultError::provision(path, "requested size overflows"))?;

    let sized = if sparse {
        file.set_len(bytes)
    } else {
        let chunk = vec![0u8; MIB as usize];
        (0..size_mb)
            .try_for_each(|_| file.write_all(&chunk))
            .and_then(|_| file.sync_all())
    };

    if let Err(err) = sized {
        // Do not leave a half-sized file that a later run would treat as done.
        let _ = fs::remove_file(path);
        return Err(BlockvaultError::provision(path, err));
    }

    info!(
        "provisioned {} backing file {} ({size_mb} MiB)",
        if sparse { "sparse" } else { "preallocated" },
        path.display()
    );
    Ok(true)
}

/// Delete a backing file; a missing file is reported as `false`, not an error.
pub fn remove_backing_file(path: &Path) -> BlockvaultResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!("removed backing file {}", path.display());
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(BlockvaultError::provision(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use tempfile::tempdir;

    #[test]
    fn sparse_file_has_full_logical_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("v1.img");

        assert!(ensure_backing_file(&path, 100, true).unwrap());
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 100 * MIB);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        // Allocated blocks stay well below the logical size.
        assert!(meta.blocks() * 512 < meta.len());
    }

    #[test]
    fn preallocated_file_is_zero_filled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v2.img");

        assert!(ensure_backing_file(&path, 2, false).unwrap());
        let contents = fs::read(&path).unwrap();
        assert_eq!(contents.len() as u64, 2 * MIB);
        assert!(contents.iter().all(|b| *b == 0));
    }

    #[test]
    fn existing_file_is_never_touched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v1.img");
        fs::write(&path, b"LUKS header").unwrap();

        assert!(!ensure_backing_file(&path, 100, true).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"LUKS header");
    }

    #[test]
    fn remove_missing_file_is_false() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v1.img");
        assert!(!remove_backing_file(&path).unwrap());

        ensure_backing_file(&path, 1, true).unwrap();
        assert!(remove_backing_file(&path).unwrap());
        assert!(!path.exists());
    }
}
