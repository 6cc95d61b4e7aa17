pub mod backing;
pub mod config;
pub mod crypttab;
pub mod device;
pub mod error;
pub mod fstab;
pub mod keyfile;
pub mod keys;
pub mod keystore;
pub mod logging;
pub mod provider;
pub mod service;
mod table;
pub mod workflow;

pub use config::{BlockvaultConfig, DeviceCfg, Ensure, KeystoreKind};
pub use crypttab::{Crypttab, CrypttabEntry};
pub use device::{Backing, DeviceSpec, KeyStrategy};
pub use error::{BlockvaultError, BlockvaultResult};
pub use keys::{obtain_key, KeyMaterial};
pub use keystore::{record_id, FileSecretStore, SecretRecord, SecretStore};
pub use provider::{CipherEngine, HostIntegration, MappingState, OpenRequest};
pub use service::{BlockDeviceService, CreateReport, DeleteOptions, DeleteReport, DeviceStatus};
