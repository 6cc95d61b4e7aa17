use crate::error::BlockvaultResult;
use std::path::{Path, PathBuf};

/// Normalised state of a named mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingState {
    Active,
    Inactive,
    Unknown(String),
}

/// Everything the engine needs to open a mapping directly, minus the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub name: String,
    pub device: PathBuf,
    pub cipher: String,
    /// Whitespace-separated arguments appended verbatim to the engine invocation.
    pub extra_args: String,
}

/// Abstraction over the disk encryption tool.
///
/// Implementations are expected to provide a thin, testable surface over the
/// underlying system interface so the lifecycle service can be exercised
/// without touching real block devices.
pub trait CipherEngine {
    /// Report whether a mapping named `name` exists right now. Never cached.
    fn mapping_state(&self, name: &str) -> BlockvaultResult<MappingState>;

    /// Open a mapping. `key` must reach the tool through a pipe or descriptor,
    /// never through its argument list or logs.
    fn open(&self, request: &OpenRequest, key: &[u8]) -> BlockvaultResult<()>;

    /// Close a mapping. Fails while a filesystem still holds it.
    fn close(&self, name: &str) -> BlockvaultResult<()>;

    /// Open `name` from its mapping table row, the way the boot scripts would.
    fn activate_from_table(&self, name: &str) -> BlockvaultResult<()>;
}

/// Host-side effects around a mapping that are not the engine's business.
pub trait HostIntegration {
    /// Unmount `mapper_path` if it is mounted, returning the released mount point.
    fn release_mount(&self, mapper_path: &Path) -> BlockvaultResult<Option<PathBuf>>;

    /// Uninstall the engine packages once nothing uses them.
    fn remove_packages(&self, packages: &[String]) -> BlockvaultResult<()>;
}
