//! Mount table helpers used when tearing a mapping down.

use crate::error::{BlockvaultError, BlockvaultResult};
use crate::table::{is_entry_line, read_table, remove_matching};
use log::info;
use std::path::{Path, PathBuf};

/// Drop every fstab row whose device field is `device`. A missing fstab is a no-op.
pub fn remove_device(fstab: &Path, device: &Path) -> BlockvaultResult<usize> {
    let device = device.to_string_lossy();
    let removed = remove_matching(fstab, &device)?;
    if removed > 0 {
        info!("disabled {removed} fstab entr(ies) for {device} in {}", fstab.display());
    }
    Ok(removed)
}

/// Mount point currently holding `device`, according to a `/proc/mounts`-style table.
pub fn find_mount_point(mounts: &Path, device: &Path) -> BlockvaultResult<Option<PathBuf>> {
    let contents = match read_table(mounts) {
        Ok(Some(contents)) => contents,
        Ok(None) => return Ok(None),
        Err(err) => return Err(BlockvaultError::Host(err.to_string())),
    };
    let device = device.to_string_lossy();
    Ok(parse_mounts(&contents, &device))
}

fn parse_mounts(mounts: &str, device: &str) -> Option<PathBuf> {
    for line in mounts.lines().filter(|line| is_entry_line(line)) {
        let mut parts = line.split_whitespace();
        let (Some(source), Some(mountpoint)) = (parts.next(), parts.next()) else {
            continue;
        };
        if unescape_mount_field(source) == device {
            return Some(PathBuf::from(unescape_mount_field(mountpoint)));
        }
    }
    None
}

/// Decode the `\040`-style octal escapes the kernel uses in mount tables.
fn unescape_mount_field(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 4 <= bytes.len() {
            let oct = &bytes[idx + 1..idx + 4];
            if oct.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = oct
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    output.push(value);
                    idx += 4;
                    continue;
                }
            }
        }
        output.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn remove_device_drops_only_matching_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fstab");
        fs::write(
            &path,
            "# static file system information\n/dev/sda1 / ext4 defaults 0 1\n/dev/mapper/vault1 /srv/vault ext4 defaults 0 2\n",
        )
        .unwrap();

        let removed = remove_device(&path, Path::new("/dev/mapper/vault1")).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# static file system information\n/dev/sda1 / ext4 defaults 0 1\n"
        );
    }

    #[test]
    fn remove_device_missing_fstab_is_noop() {
        let dir = tempdir().unwrap();
        let removed =
            remove_device(&dir.path().join("fstab"), Path::new("/dev/mapper/vault1")).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn find_mount_point_decodes_escapes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        fs::write(
            &path,
            "/dev/sda1 / ext4 rw 0 0\n/dev/mapper/vault1 /srv/my\\040vault ext4 rw 0 0\n",
        )
        .unwrap();

        let found = find_mount_point(&path, Path::new("/dev/mapper/vault1")).unwrap();
        assert_eq!(found, Some(PathBuf::from("/srv/my vault")));
        assert!(find_mount_point(&path, Path::new("/dev/mapper/other"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn unescape_leaves_plain_backslashes() {
        assert_eq!(unescape_mount_field("a\\9b"), "a\\9b");
        assert_eq!(unescape_mount_field("tail\\"), "tail\\");
    }
}
