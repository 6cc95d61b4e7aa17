//! Editor for the persistent mapping table (`/etc/crypttab`).
//!
//! Rows are `name<TAB>device<TAB>key source<TAB>cipher=<cipher>,<flags>`.
//! Blank lines and `#` comments are preserved verbatim but never treated as
//! entries. A row matches a name when its first whitespace-delimited field is
//! exactly that name, so `foo` never matches a `foobar` row.

use crate::error::{BlockvaultError, BlockvaultResult};
use crate::table::{first_field, is_entry_line, read_table, remove_matching};
use log::{debug, info};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Mode applied when the table file is created by us.
const CRYPTTAB_MODE: u32 = 0o640;

/// One row of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub name: String,
    pub device: String,
    pub key_source: String,
    pub options: String,
}

impl CrypttabEntry {
    /// Build a row whose options are `cipher=<cipher>` followed by `flags` when non-empty.
    pub fn new(
        name: impl Into<String>,
        device: impl Into<String>,
        key_source: impl Into<String>,
        cipher: &str,
        flags: &str,
    ) -> Self {
        let options = if flags.is_empty() {
            format!("cipher={cipher}")
        } else {
            format!("cipher={cipher},{flags}")
        };
        Self {
            name: name.into(),
            device: device.into(),
            key_source: key_source.into(),
            options,
        }
    }

    /// Parse a single entry line; `None` for blanks, comments and truncated rows.
    pub fn parse_line(line: &str) -> Option<Self> {
        if !is_entry_line(line) {
            return None;
        }
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        let device = fields.next()?;
        let key_source = fields.next().unwrap_or("none");
        let options = fields.next().unwrap_or("");
        Some(Self {
            name: name.to_string(),
            device: device.to_string(),
            key_source: key_source.to_string(),
            options: options.to_string(),
        })
    }

    /// Cipher named in the options field, if any.
    pub fn cipher(&self) -> Option<&str> {
        self.options
            .split(',')
            .find_map(|opt| opt.strip_prefix("cipher="))
    }

    /// Serialized row including the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\n",
            self.name, self.device, self.key_source, self.options
        )
    }
}

/// Handle on a mapping table file. Every operation re-reads the file.
#[derive(Debug, Clone)]
pub struct Crypttab {
    path: PathBuf,
}

impl Crypttab {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a row for `name` exists. A missing table simply has no rows.
    pub fn exists(&self, name: &str) -> BlockvaultResult<bool> {
        let Some(contents) = read_table(&self.path)? else {
            return Ok(false);
        };
        Ok(contents
            .lines()
            .any(|line| is_entry_line(line) && first_field(line) == Some(name)))
    }

    /// Append a row. Callers check `exists` first; this does not dedupe.
    ///
    /// A last line without a terminating newline is completed before the new
    /// row is written. That repair stays after the row is deleted again, so
    /// the add/delete round trip is byte-identical only for tables that
    /// already end in a newline.
    pub fn add(&self, entry: &CrypttabEntry) -> BlockvaultResult<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .mode(CRYPTTAB_MODE)
            .open(&self.path)
            .map_err(|err| BlockvaultError::table(&self.path, err))?;

        let needs_newline = ends_without_newline(&mut file)
            .map_err(|err| BlockvaultError::table(&self.path, err))?;
        let mut payload = String::new();
        if needs_newline {
            payload.push('\n');
        }
        payload.push_str(&entry.to_line());

        file.write_all(payload.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|err| BlockvaultError::table(&self.path, err))?;
        info!(
            "added {} to {} (source {})",
            entry.name,
            self.path.display(),
            entry.key_source
        );
        Ok(())
    }

    /// Remove every row for `name`, keeping all other lines in order. Returns
    /// the number of rows dropped.
    pub fn delete(&self, name: &str) -> BlockvaultResult<usize> {
        let removed = remove_matching(&self.path, name)?;
        if removed > 0 {
            info!("removed {name} from {}", self.path.display());
        } else {
            debug!("{name} not present in {}", self.path.display());
        }
        Ok(removed)
    }

    /// Parsed rows in file order.
    pub fn entries(&self) -> BlockvaultResult<Vec<CrypttabEntry>> {
        let Some(contents) = read_table(&self.path)? else {
            return Ok(Vec::new());
        };
        Ok(contents.lines().filter_map(CrypttabEntry::parse_line).collect())
    }

    /// Whether any non-blank, non-comment line remains.
    ///
    /// This only sees table-driven devices; shared-secret-store mappings never
    /// appear here, so a host running only those reports `false`.
    pub fn has_active_entries(&self) -> BlockvaultResult<bool> {
        let Some(contents) = read_table(&self.path)? else {
            return Ok(false);
        };
        Ok(contents.lines().any(is_entry_line))
    }
}

fn ends_without_newline(file: &mut std::fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
