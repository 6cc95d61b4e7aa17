//! System adapters for the blockvault lifecycle service. `system` drives
//! `cryptsetup`, `host` covers mounts and packages, while `command` and
//! `parse` hold the shell integration details.

mod command;
mod host;
mod parse;
mod system;

pub use host::{SystemHost, DEFAULT_PACKAGE_MANAGERS, DEFAULT_UMOUNT_PATHS};
pub use system::{SystemCipherEngine, DEFAULT_CRYPTDISKS_START_PATHS, DEFAULT_CRYPTSETUP_PATHS};
