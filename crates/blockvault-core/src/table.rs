//! Shared helpers for whitespace-delimited system tables (`crypttab`, `fstab`).

use crate::error::{BlockvaultError, BlockvaultResult};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// First whitespace-delimited field of a line.
pub(crate) fn first_field(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

/// True for lines that carry an entry, false for blank and `#` comment lines.
pub(crate) fn is_entry_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Read the table, treating a missing file as empty.
pub(crate) fn read_table(path: &Path) -> BlockvaultResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(BlockvaultError::table(path, err)),
    }
}

/// Drop every entry line whose first field equals `key`, keeping all other
/// bytes untouched. Returns how many lines were removed.
pub(crate) fn remove_matching(path: &Path, key: &str) -> BlockvaultResult<usize> {
    let Some(contents) = read_table(path)? else {
        return Ok(0);
    };

    let mut kept = String::with_capacity(contents.len());
    let mut removed = 0;
    for line in contents.split_inclusive('\n') {
        if is_entry_line(line) && first_field(line) == Some(key) {
            removed += 1;
        } else {
            kept.push_str(line);
        }
    }

    if removed > 0 {
        rewrite(path, &kept)?;
    }
    Ok(removed)
}

/// Replace the whole file via a sibling temp file and `rename`, keeping the
/// original permissions.
pub(crate) fn rewrite(path: &Path, contents: &str) -> BlockvaultResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let permissions = fs::metadata(path)
        .map_err(|err| BlockvaultError::table(path, err))?
        .permissions();

    let mut tmp = NamedTempFile::new_in(parent).map_err(|err| BlockvaultError::table(path, err))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| BlockvaultError::table(path, err))?;
    fs::set_permissions(tmp.path(), permissions).map_err(|err| BlockvaultError::table(path, err))?;
    tmp.persist(path)
        .map_err(|err| BlockvaultError::table(path, err.error))?;
    Ok(())
}
