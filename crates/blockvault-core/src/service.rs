//! Lifecycle service that composes provisioning, keys, the mapping table and the engine.
//!
//! Every decision re-reads external state. Two calls for the *same* device
//! name must not run concurrently: the state check and the table edit are not
//! atomic against each other.

use crate::backing::{ensure_backing_file, remove_backing_file};
use crate::config::BlockvaultConfig;
use crate::crypttab::{Crypttab, CrypttabEntry};
use crate::device::{validate_mapping_name, Backing, DeviceSpec, MAPPER_DIR};
use crate::error::{BlockvaultError, BlockvaultResult};
use crate::fstab;
use crate::keys::{obtain_key, KeyMaterial};
use crate::keystore::SecretStore;
use crate::provider::{CipherEngine, HostIntegration, MappingState, OpenRequest};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// Options that tune the delete workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Remove the engine packages when no table rows remain afterwards.
    pub uninstall_if_last: bool,
}

impl DeleteOptions {
    pub fn from_config(config: &BlockvaultConfig) -> Self {
        Self {
            uninstall_if_last: config.lifecycle.uninstall_if_last,
        }
    }
}

/// Result of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReport {
    pub name: String,
    pub mapper_path: PathBuf,
    pub strategy: &'static str,
    pub already_active: bool,
    pub backing_created: bool,
    /// A local key file or shared record was generated by this call.
    pub key_created: bool,
    pub table_row_added: bool,
    pub key_source: Option<String>,
}

/// Result of a delete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub name: String,
    pub already_absent: bool,
    pub unmounted: Option<PathBuf>,
    pub fstab_rows_removed: usize,
    pub table_rows_removed: usize,
    pub backing_removed: bool,
    pub decommissioned: bool,
}

/// Current state of one mapping as seen by the engine and the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub mapper_path: PathBuf,
    pub state: MappingState,
    pub table_entry: Option<CrypttabEntry>,
}

/// Coordinates configuration, the cipher engine, host effects and the secret store.
pub struct BlockDeviceService<E: CipherEngine, H: HostIntegration, S: SecretStore> {
    config: Arc<BlockvaultConfig>,
    engine: E,
    host: H,
    store: S,
}

impl<E: CipherEngine, H: HostIntegration, S: SecretStore> BlockDeviceService<E, H, S> {
    pub fn new(config: Arc<BlockvaultConfig>, engine: E, host: H, store: S) -> Self {
        Self {
            config,
            engine,
            host,
            store,
        }
    }

    pub fn config(&self) -> &BlockvaultConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn crypttab(&self) -> Crypttab {
        Crypttab::new(self.config.crypttab_path())
    }

    /// Bring `spec` to the active state. A no-op when the mapping already exists.
    ///
    /// On failure nothing this call added is left behind: no table row, no
    /// mapping, no freshly provisioned backing file. A mapping that cannot be
    /// closed keeps its backing file. Generated keys are kept so a retry
    /// reuses them.
    pub fn create(&self, spec: &DeviceSpec) -> BlockvaultResult<CreateReport> {
        spec.validate()?;

        let mut report = CreateReport {
            name: spec.name.clone(),
            mapper_path: spec.mapper_path(),
            strategy: spec.key_strategy.label(),
            already_active: false,
            backing_created: false,
            key_created: false,
            table_row_added: false,
            key_source: None,
        };

        if self.is_active(&spec.name)? {
            info!("{} already active; nothing to create", spec.name);
            report.already_active = true;
            return Ok(report);
        }

        if let Backing::File {
            path,
            size_mb,
            sparse,
        } = &spec.backing
        {
            report.backing_created = ensure_backing_file(path, *size_mb, *sparse)?;
        }

        let mut opened = false;
        let activated = self.activate(spec, &mut report).and_then(|()| {
            opened = true;
            self.verify_active(&spec.name)
        });
        if let Err(err) = activated {
            self.roll_back(spec, &report, opened);
            return Err(err);
        }

        info!(
            "{} active at {} ({} key)",
            spec.name,
            report.mapper_path.display(),
            report.strategy
        );
        Ok(report)
    }

    fn activate(&self, spec: &DeviceSpec, report: &mut CreateReport) -> BlockvaultResult<()> {
        let host = if spec.key_strategy.uses_mapping_table() {
            String::new()
        } else {
            self.config.host_identity()?
        };
        let material = obtain_key(spec, &host, &self.store)?;
        report.key_created = material.created();
        report.key_source = Some(material.key_source());

        match &material {
            KeyMaterial::Shared { record, .. } => {
                let request = OpenRequest {
                    name: spec.name.clone(),
                    device: PathBuf::from(&record.device),
                    cipher: record.cipher.clone(),
                    extra_args: record.extra_args.clone(),
                };
                self.engine.open(&request, record.key.as_bytes())?;
            }
            KeyMaterial::Ephemeral | KeyMaterial::LocalFile { .. } => {
                let table = self.crypttab();
                if !table.exists(&spec.name)? {
                    let entry = CrypttabEntry::new(
                        &spec.name,
                        spec.backing.source().display().to_string(),
                        material.key_source(),
                        &spec.cipher,
                        &self.config.crypttab.flags,
                    );
                    table.add(&entry)?;
                    report.table_row_added = true;
                }
                self.engine.activate_from_table(&spec.name)?;
            }
        }
        Ok(())
    }

    fn verify_active(&self, name: &str) -> BlockvaultResult<()> {
        match self.engine.mapping_state(name)? {
            MappingState::Active => Ok(()),
            other => Err(BlockvaultError::CipherEngine(format!(
                "{name} did not become active after open (state {other:?})"
            ))),
        }
    }

    /// Undo what a failed create added. `opened` means the engine accepted the
    /// open, so a mapping may sit on top of the backing file.
    fn roll_back(&self, spec: &DeviceSpec, report: &CreateReport, opened: bool) {
        let mut backing_in_use = false;
        if opened {
            if let Err(err) = self.engine.close(&spec.name) {
                warn!("rollback: could not close {}: {err}", spec.name);
                backing_in_use = true;
            }
        }
        if report.table_row_added {
            if let Err(err) = self.crypttab().delete(&spec.name) {
                warn!("rollback: could not remove table row for {}: {err}", spec.name);
            }
        }
        if backing_in_use {
            warn!(
                "rollback: keeping backing storage for {} while its mapping may be open",
                spec.name
            );
        } else if report.backing_created {
            if let Backing::File { path, .. } = &spec.backing {
                if let Err(err) = remove_backing_file(path) {
                    warn!("rollback: could not remove {}: {err}", path.display());
                }
            }
        }
    }

    /// Tear `spec` down. A no-op when no mapping exists.
    ///
    /// The table row is only removed after the engine confirms the close, so a
    /// failed close leaves the device reactivatable at boot.
    pub fn delete(&self, spec: &DeviceSpec, options: DeleteOptions) -> BlockvaultResult<DeleteReport> {
        validate_mapping_name(&spec.name)?;

        let mut report = DeleteReport {
            name: spec.name.clone(),
            already_absent: false,
            unmounted: None,
            fstab_rows_removed: 0,
            table_rows_removed: 0,
            backing_removed: false,
            decommissioned: false,
        };

        if !self.is_active(&spec.name)? {
            info!("{} not active; nothing to delete", spec.name);
            report.already_absent = true;
            return Ok(report);
        }

        let mapper_path = spec.mapper_path();
        report.unmounted = self.host.release_mount(&mapper_path)?;
        report.fstab_rows_removed = fstab::remove_device(&self.config.fstab_path(), &mapper_path)?;

        self.engine.close(&spec.name)?;
        report.table_rows_removed = self.crypttab().delete(&spec.name)?;

        if let Backing::File { path, .. } = &spec.backing {
            report.backing_removed = remove_backing_file(path)?;
        }

        // Only table rows are counted; mappings opened from the shared store
        // are invisible here.
        if options.uninstall_if_last && !self.crypttab().has_active_entries()? {
            info!("no mapping table rows remain; removing engine packages");
            self.host.remove_packages(&self.config.lifecycle.packages)?;
            report.decommissioned = true;
        }

        info!("{} removed", spec.name);
        Ok(report)
    }

    /// Engine state plus any table row for `name`.
    pub fn status(&self, name: &str) -> BlockvaultResult<DeviceStatus> {
        validate_mapping_name(name)?;
        let state = self.engine.mapping_state(name)?;
        let table_entry = self
            .crypttab()
            .entries()?
            .into_iter()
            .find(|entry| entry.name == name);

        Ok(DeviceStatus {
            name: name.to_string(),
            mapper_path: PathBuf::from(MAPPER_DIR).join(name),
            state,
            table_entry,
        })
    }

    /// Status for every device declared in configuration, in declaration order.
    pub fn list_declared(&self) -> BlockvaultResult<Vec<DeviceStatus>> {
        self.config
            .devices
            .iter()
            .map(|device| self.status(&device.name))
            .collect()
    }

    fn is_active(&self, name: &str) -> BlockvaultResult<bool> {
        match self.engine.mapping_state(name)? {
            MappingState::Active => Ok(true),
            MappingState::Inactive => Ok(false),
            MappingState::Unknown(detail) => Err(BlockvaultError::CipherEngine(format!(
                "unable to determine state of {name}: {detail}"
            ))),
        }
    }
}
