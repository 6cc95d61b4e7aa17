//! Workflow entry points that drive the lifecycle service over declared devices.

use crate::config::{BlockvaultConfig, Ensure};
use crate::error::BlockvaultResult;
use crate::keystore::SecretStore;
use crate::provider::{CipherEngine, HostIntegration, MappingState};
use crate::service::{BlockDeviceService, CreateReport, DeleteOptions, DeleteReport, DeviceStatus};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Bring every declared device to its `ensure` state, in declaration order.
///
/// Stops at the first failing device; devices before it keep their new state.
pub fn converge<E, H, S>(
    config: &BlockvaultConfig,
    service: &BlockDeviceService<E, H, S>,
) -> BlockvaultResult<WorkflowReport>
where
    E: CipherEngine,
    H: HostIntegration,
    S: SecretStore,
{
    let mut events = Vec::new();
    let options = DeleteOptions::from_config(config);

    if config.devices.is_empty() {
        events.push(event(WorkflowLevel::Warn, "No devices declared; nothing to do."));
    }

    for device in &config.devices {
        let spec = device.to_spec()?;
        match device.ensure {
            Ensure::Present => events.extend(create_events(&service.create(&spec)?)),
            Ensure::Absent => events.extend(delete_events(&service.delete(&spec, options)?)),
        }
    }

    Ok(WorkflowReport {
        title: format!("Converged {} declared device(s)", config.devices.len()),
        events,
    })
}

/// Translate a create result into report lines.
pub fn create_events(report: &CreateReport) -> Vec<WorkflowEvent> {
    if report.already_active {
        return vec![event(
            WorkflowLevel::Info,
            format!("{} already active at {}", report.name, report.mapper_path.display()),
        )];
    }

    let mut events = Vec::new();
    if report.backing_created {
        events.push(event(
            WorkflowLevel::Info,
            format!("{}: provisioned backing file", report.name),
        ));
    }
    if report.key_created {
        events.push(event(
            WorkflowLevel::Security,
            format!("{}: generated new {} key material", report.name, report.strategy),
        ));
    }
    if report.table_row_added {
        events.push(event(
            WorkflowLevel::Info,
            format!("{}: added mapping table row", report.name),
        ));
    }
    events.push(event(
        WorkflowLevel::Success,
        format!(
            "{} active at {} ({} key)",
            report.name,
            report.mapper_path.display(),
            report.strategy
        ),
    ));
    events
}

/// Translate a delete result into report lines.
pub fn delete_events(report: &DeleteReport) -> Vec<WorkflowEvent> {
    if report.already_absent {
        return vec![event(
            WorkflowLevel::Info,
            format!("{} not active; nothing removed", report.name),
        )];
    }

    let mut events = Vec::new();
    if let Some(mount_point) = &report.unmounted {
        events.push(event(
            WorkflowLevel::Info,
            format!("{}: unmounted {}", report.name, mount_point.display()),
        ));
    }
    if report.fstab_rows_removed > 0 {
        events.push(event(
            WorkflowLevel::Info,
            format!(
                "{}: disabled {} fstab entr(ies)",
                report.name, report.fstab_rows_removed
            ),
        ));
    }
    if report.table_rows_removed > 0 {
        events.push(event(
            WorkflowLevel::Info,
            format!("{}: removed mapping table row", report.name),
        ));
    }
    if report.backing_removed {
        events.push(event(
            WorkflowLevel::Info,
            format!("{}: deleted backing file", report.name),
        ));
    }
    events.push(event(
        WorkflowLevel::Success,
        format!("{} closed and removed", report.name),
    ));
    if report.decommissioned {
        events.push(event(
            WorkflowLevel::Warn,
            "Mapping table is empty; engine packages removed.",
        ));
    }
    events
}

/// Translate a status snapshot into a single report line.
pub fn status_event(status: &DeviceStatus) -> WorkflowEvent {
    let table = match &status.table_entry {
        Some(entry) => format!("table row -> {} ({})", entry.device, entry.options),
        None => "no table row".to_string(),
    };
    match &status.state {
        MappingState::Active => event(
            WorkflowLevel::Success,
            format!("{} active at {}; {table}", status.name, status.mapper_path.display()),
        ),
        MappingState::Inactive => event(
            WorkflowLevel::Info,
            format!("{} inactive; {table}", status.name),
        ),
        MappingState::Unknown(detail) => event(
            WorkflowLevel::Warn,
            format!("{} state unknown ({detail}); {table}", status.name),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceCfg, KeystoreKind};
    use crate::error::BlockvaultError;
    use crate::keystore::SecretRecord;
    use crate::provider::OpenRequest;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeEngine {
        active: Mutex<HashSet<String>>,
    }

    impl CipherEngine for FakeEngine {
        fn mapping_state(&self, name: &str) -> BlockvaultResult<MappingState> {
            Ok(if self.active.lock().unwrap().contains(name) {
                MappingState::Active
            } else {
                MappingState::Inactive
            })
        }

        fn open(&self, request: &OpenRequest, _key: &[u8]) -> BlockvaultResult<()> {
            self.active.lock().unwrap().insert(request.name.clone());
            Ok(())
        }

        fn close(&self, name: &str) -> BlockvaultResult<()> {
            self.active.lock().unwrap().remove(name);
            Ok(())
        }

        fn activate_from_table(&self, name: &str) -> BlockvaultResult<()> {
            self.active.lock().unwrap().insert(name.to_string());
            Ok(())
        }
    }

    struct NoHost;

    impl HostIntegration for NoHost {
        fn release_mount(&self, _mapper_path: &Path) -> BlockvaultResult<Option<PathBuf>> {
            Ok(None)
        }

        fn remove_packages(&self, _packages: &[String]) -> BlockvaultResult<()> {
            Ok(())
        }
    }

    struct NoStore;

    impl SecretStore for NoStore {
        fn find(&self, _id: &str) -> BlockvaultResult<Option<SecretRecord>> {
            Err(BlockvaultError::SecretStore("unavailable".into()))
        }

        fn save(&self, _record: &SecretRecord, _encrypted: bool) -> BlockvaultResult<()> {
            Err(BlockvaultError::SecretStore("unavailable".into()))
        }
    }

    fn device(name: &str, keystore: KeystoreKind, ensure: Ensure) -> DeviceCfg {
        DeviceCfg {
            name: name.to_string(),
            device: Some(format!("/dev/{name}")),
            file: None,
            size_mb: None,
            sparse: true,
            keystore,
            keyfile: None,
            key_length: 32,
            cipher: "aes-cbc-essiv:sha256".to_string(),
            cryptsetup_args: String::new(),
            ensure,
        }
    }

    #[test]
    fn converge_creates_present_and_removes_absent_devices() {
        let dir = tempdir().unwrap();
        let mut config = BlockvaultConfig::default();
        config.crypttab.path = dir.path().join("crypttab").display().to_string();
        config.mounts.fstab_path = dir.path().join("fstab").display().to_string();
        config.devices = vec![
            device("scratch", KeystoreKind::Discard, Ensure::Present),
            device("old", KeystoreKind::Discard, Ensure::Absent),
        ];

        let engine = FakeEngine::default();
        engine.active.lock().unwrap().insert("old".to_string());
        let service = BlockDeviceService::new(Arc::new(config.clone()), engine, NoHost, NoStore);

        let report = converge(&config, &service).unwrap();
        assert!(report
            .events
            .iter()
            .any(|e| e.level == WorkflowLevel::Success && e.message.starts_with("scratch active")));
        assert!(report
            .events
            .iter()
            .any(|e| e.message == "old closed and removed"));

        let active = service.engine().active.lock().unwrap();
        assert!(active.contains("scratch"));
        assert!(!active.contains("old"));
    }

    #[test]
    fn converge_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let mut config = BlockvaultConfig::default();
        config.crypttab.path = dir.path().join("crypttab").display().to_string();
        config.host.identity = Some("node".into());
        config.devices = vec![
            device("shared", KeystoreKind::Databag, Ensure::Present),
            device("later", KeystoreKind::Discard, Ensure::Present),
        ];

        let service =
            BlockDeviceService::new(Arc::new(config.clone()), FakeEngine::default(), NoHost, NoStore);
        let err = converge(&config, &service).unwrap_err();
        assert!(matches!(err, BlockvaultError::SecretStore(_)));
        assert!(service.engine().active.lock().unwrap().is_empty());
    }

    #[test]
    fn status_event_mentions_table_row() {
        let status = DeviceStatus {
            name: "vault1".into(),
            mapper_path: PathBuf::from("/dev/mapper/vault1"),
            state: MappingState::Inactive,
            table_entry: None,
        };
        let ev = status_event(&status);
        assert_eq!(ev.level, WorkflowLevel::Info);
        assert_eq!(ev.message, "vault1 inactive; no table row");
    }
}
