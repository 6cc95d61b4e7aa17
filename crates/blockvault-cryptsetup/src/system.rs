//! System-backed `CipherEngine`. It shells out to `cryptsetup` for plain
//! dm-crypt mappings and to `cryptdisks_start` for table-driven activation.

use crate::command::{CommandRunner, Output};
use crate::parse::{parse_status, split_extra_args};
use blockvault_core::config::BlockvaultConfig;
use blockvault_core::crypttab::Crypttab;
use blockvault_core::error::{BlockvaultError, BlockvaultResult};
use blockvault_core::provider::{CipherEngine, MappingState, OpenRequest};
use log::{debug, info};
use std::path::PathBuf;
use std::time::Duration;

/// Default locations we probe when looking for a `cryptsetup` binary on the host.
pub const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/sbin/cryptsetup",
    "/usr/sbin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
    "/bin/cryptsetup",
];

/// Default locations of the Debian boot helper that opens a single crypttab row.
pub const DEFAULT_CRYPTDISKS_START_PATHS: &[&str] =
    &["/usr/sbin/cryptdisks_start", "/sbin/cryptdisks_start"];

/// `cryptsetup status` exit code for a mapping that does not exist.
const STATUS_INACTIVE: i32 = 4;

/// System-oriented `CipherEngine` that shells out to the native tools.
#[derive(Debug, Clone)]
pub struct SystemCipherEngine {
    cryptsetup: CommandRunner,
    cryptdisks_start: Option<CommandRunner>,
    crypttab: PathBuf,
}

impl SystemCipherEngine {
    /// Build an engine from configuration, falling back to discovery when needed.
    pub fn from_config(config: &BlockvaultConfig) -> BlockvaultResult<Self> {
        let timeout = config.cryptsetup_timeout();
        let cryptsetup = match config.cryptsetup_binary_path() {
            Some(path) => CommandRunner::with_path(path, timeout)?,
            None => CommandRunner::discover(DEFAULT_CRYPTSETUP_PATHS, timeout).ok_or_else(|| {
                BlockvaultError::InvalidConfig(format!(
                    "unable to locate cryptsetup binary; tried {:?}",
                    DEFAULT_CRYPTSETUP_PATHS
                ))
            })?,
        };
        let cryptdisks_start = match config.cryptdisks_start_path() {
            Some(path) => Some(CommandRunner::with_path(path, timeout)?),
            None => CommandRunner::discover(DEFAULT_CRYPTDISKS_START_PATHS, timeout),
        };

        Ok(Self {
            cryptsetup,
            cryptdisks_start,
            crypttab: config.crypttab_path(),
        })
    }

    /// Construct an engine with explicit binaries. Without `cryptdisks_start`
    /// table rows are opened by reading the row and calling `cryptsetup` directly.
    pub fn with_paths(
        cryptsetup: PathBuf,
        cryptdisks_start: Option<PathBuf>,
        crypttab: PathBuf,
        timeout: Duration,
    ) -> BlockvaultResult<Self> {
        Ok(Self {
            cryptsetup: CommandRunner::with_path(cryptsetup, timeout)?,
            cryptdisks_start: cryptdisks_start
                .map(|path| CommandRunner::with_path(path, timeout))
                .transpose()?,
            crypttab,
        })
    }

    /// Run `cryptsetup` with the modern action, retrying with the legacy one
    /// when this build does not know the modern verb.
    fn run_with_fallback(
        &self,
        primary: &[&str],
        legacy: &[&str],
        input: Option<&[u8]>,
    ) -> BlockvaultResult<Output> {
        let out = self.cryptsetup.run(primary, input)?;
        if out.status != 0 && Self::action_unsupported(&out) {
            debug!("cryptsetup {} unsupported; retrying as {}", primary[0], legacy[0]);
            return self.cryptsetup.run(legacy, input);
        }
        Ok(out)
    }

    fn action_unsupported(output: &Output) -> bool {
        let lower = output.diagnostic().to_ascii_lowercase();
        lower.contains("unknown action")
            || lower.contains("unknown command")
            || lower.contains("invalid action")
            || lower.contains("unknown option")
    }

    /// Open with the key read from stdin (`key` set) or from a file named in `key_file`.
    fn open_plain(
        &self,
        request: &OpenRequest,
        key_file: &str,
        key: Option<&[u8]>,
    ) -> BlockvaultResult<()> {
        let device = request.device.to_string_lossy().into_owned();
        let key_arg = format!("--key-file={key_file}");
        let extra = split_extra_args(&request.extra_args);

        let mut primary = vec![
            "open",
            "--type",
            "plain",
            "--cipher",
            request.cipher.as_str(),
            "--batch-mode",
            key_arg.as_str(),
        ];
        primary.extend(extra.iter().copied());
        primary.push(device.as_str());
        primary.push(request.name.as_str());

        let mut legacy = vec![
            "create",
            request.name.as_str(),
            device.as_str(),
            "--cipher",
            request.cipher.as_str(),
            "--batch-mode",
            key_arg.as_str(),
        ];
        legacy.extend(extra.iter().copied());

        let out = self.run_with_fallback(&primary, &legacy, key)?;
        if out.status != 0 {
            return Err(Self::classify_open_failure(request, &out));
        }
        info!("opened {} on {}", request.name, device);
        Ok(())
    }

    /// Map a failed open into an engine error. The key never appears in `output`.
    fn classify_open_failure(request: &OpenRequest, output: &Output) -> BlockvaultError {
        let diagnostic = output.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        let hint = if lower.contains("permission denied") || lower.contains("not permitted") {
            "; this requires root"
        } else if lower.contains("already exists") {
            "; a mapping with this name is already present"
        } else if lower.contains("no such file") || lower.contains("cannot open device") {
            "; check that the backing device exists"
        } else {
            ""
        };

        BlockvaultError::CipherEngine(format!(
            "cryptsetup failed to open `{}` on {} (exit code {}): {}{hint}",
            request.name,
            request.device.display(),
            output.status,
            if diagnostic.is_empty() {
                "no additional output"
            } else {
                diagnostic
            }
        ))
    }

    /// Translate `cryptsetup status` results into a `MappingState`.
    fn classify_status(name: &str, output: &Output) -> MappingState {
        if let Some(summary) = parse_status(&output.stdout) {
            return if summary.active {
                MappingState::Active
            } else {
                MappingState::Inactive
            };
        }

        match output.status {
            0 => return MappingState::Active,
            STATUS_INACTIVE => return MappingState::Inactive,
            _ => {}
        }

        let diagnostic = output.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("is inactive")
            || lower.contains("not active")
            || lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not found")
        {
            return MappingState::Inactive;
        }

        MappingState::Unknown(format!(
            "cryptsetup status {name} exited with code {}: {}",
            output.status,
            if diagnostic.is_empty() {
                "no additional output"
            } else {
                diagnostic
            }
        ))
    }

    fn open_from_row(&self, name: &str) -> BlockvaultResult<()> {
        let table = Crypttab::new(&self.crypttab);
        let entry = table
            .entries()?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| {
                BlockvaultError::CipherEngine(format!(
                    "{name} has no row in {}",
                    self.crypttab.display()
                ))
            })?;
        let cipher = entry.cipher().ok_or_else(|| {
            BlockvaultError::CipherEngine(format!("row for {name} names no cipher"))
        })?;

        let request = OpenRequest {
            name: entry.name.clone(),
            device: PathBuf::from(&entry.device),
            cipher: cipher.to_string(),
            extra_args: String::new(),
        };
        self.open_plain(&request, &entry.key_source, None)
    }
}

impl CipherEngine for SystemCipherEngine {
    fn mapping_state(&self, name: &str) -> BlockvaultResult<MappingState> {
        let out = self.cryptsetup.run(&["status", name], None)?;
        if let Some(summary) = parse_status(&out.stdout) {
            debug!(
                "{name}: type {}, in use: {}",
                summary.field("type").unwrap_or("unknown"),
                summary.in_use
            );
        }
        Ok(Self::classify_status(name, &out))
    }

    fn open(&self, request: &OpenRequest, key: &[u8]) -> BlockvaultResult<()> {
        if key.is_empty() {
            return Err(BlockvaultError::CipherEngine(format!(
                "refusing to open {} with an empty key",
                request.name
            )));
        }
        self.open_plain(request, "-", Some(key))
    }

    fn close(&self, name: &str) -> BlockvaultResult<()> {
        let out = self.run_with_fallback(&["close", name], &["remove", name], None)?;
        if out.status == 0 {
            info!("closed {name}");
            return Ok(());
        }

        let diagnostic = output_or_default(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not active")
        {
            debug!("{name} already closed: {diagnostic}");
            return Ok(());
        }
        let hint = if lower.contains("busy") || lower.contains("in use") {
            "; unmount it first"
        } else {
            ""
        };
        Err(BlockvaultError::CipherEngine(format!(
            "cryptsetup failed to close `{name}` (exit code {}): {diagnostic}{hint}",
            out.status
        )))
    }

    fn activate_from_table(&self, name: &str) -> BlockvaultResult<()> {
        let Some(runner) = &self.cryptdisks_start else {
            debug!("cryptdisks_start unavailable; opening {name} from its table row");
            return self.open_from_row(name);
        };

        let out = runner.run(&[name], None)?;
        if out.status != 0 {
            return Err(BlockvaultError::CipherEngine(format!(
                "{} {name} exited with code {}: {}",
                runner.binary().display(),
                out.status,
                output_or_default(&out)
            )));
        }
        info!("activated {name} from {}", self.crypttab.display());
        Ok(())
    }
}

fn output_or_default(out: &Output) -> &str {
    let diagnostic = out.diagnostic();
    if diagnostic.is_empty() {
        "no additional output"
    } else {
        diagnostic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status,
        }
    }

    #[test]
    fn classify_status_uses_header_when_present() {
        let state = SystemCipherEngine::classify_status(
            "vault1",
            &output(0, "/dev/mapper/vault1 is active.\n  type:    PLAIN\n", ""),
        );
        assert_eq!(state, MappingState::Active);

        let state = SystemCipherEngine::classify_status(
            "vault1",
            &output(STATUS_INACTIVE, "/dev/mapper/vault1 is inactive.\n", ""),
        );
        assert_eq!(state, MappingState::Inactive);
    }

    #[test]
    fn classify_status_falls_back_to_exit_code_and_diagnostics() {
        assert_eq!(
            SystemCipherEngine::classify_status("v", &output(4, "", "")),
            MappingState::Inactive
        );
        assert_eq!(
            SystemCipherEngine::classify_status("v", &output(1, "", "Device v does not exist.")),
            MappingState::Inactive
        );
        assert!(matches!(
            SystemCipherEngine::classify_status("v", &output(1, "", "Cannot initialize device-mapper")),
            MappingState::Unknown(_)
        ));
    }

    #[test]
    fn open_failure_mentions_privileges() {
        let request = OpenRequest {
            name: "vault1".into(),
            device: PathBuf::from("/dev/sdb"),
            cipher: "aes-cbc-essiv:sha256".into(),
            extra_args: String::new(),
        };
        let err = SystemCipherEngine::classify_open_failure(
            &request,
            &output(5, "", "Cannot initialize device-mapper: Permission denied"),
        );
        assert!(err.to_string().contains("requires root"), "{err}");
    }

    #[test]
    fn unsupported_action_is_detected() {
        assert!(SystemCipherEngine::action_unsupported(&output(
            1,
            "",
            "Unknown action."
        )));
        assert!(!SystemCipherEngine::action_unsupported(&output(1, "", "Device busy")));
    }
}
