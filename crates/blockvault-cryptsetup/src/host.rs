//! Host-side effects: releasing mounts and removing engine packages.

use crate::command::CommandRunner;
use blockvault_core::config::BlockvaultConfig;
use blockvault_core::error::{BlockvaultError, BlockvaultResult};
use blockvault_core::fstab;
use blockvault_core::provider::HostIntegration;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_UMOUNT_PATHS: &[&str] = &["/bin/umount", "/usr/bin/umount", "/sbin/umount"];

/// Package managers tried in order, with the arguments that remove packages non-interactively.
pub const DEFAULT_PACKAGE_MANAGERS: &[(&str, &[&str])] = &[
    ("/usr/bin/apt-get", &["remove", "-y"]),
    ("/usr/bin/dnf", &["remove", "-y"]),
    ("/usr/bin/yum", &["remove", "-y"]),
];

#[derive(Debug, Clone)]
pub struct SystemHost {
    mounts: PathBuf,
    umount: Option<CommandRunner>,
    package_manager: Option<(CommandRunner, Vec<String>)>,
}

impl SystemHost {
    pub fn from_config(config: &BlockvaultConfig) -> Self {
        let timeout = config.cryptsetup_timeout();
        let package_manager = DEFAULT_PACKAGE_MANAGERS.iter().find_map(|(path, args)| {
            CommandRunner::discover(&[*path], timeout)
                .map(|runner| (runner, args.iter().map(|a| a.to_string()).collect()))
        });
        Self {
            mounts: config.mounts_path(),
            umount: CommandRunner::discover(DEFAULT_UMOUNT_PATHS, timeout),
            package_manager,
        }
    }

    /// Explicit tool paths, used by tests and unusual hosts.
    pub fn with_paths(
        mounts: PathBuf,
        umount: Option<PathBuf>,
        package_manager: Option<(PathBuf, Vec<String>)>,
        timeout: Duration,
    ) -> Self {
        Self {
            mounts,
            umount: umount.map(|path| CommandRunner::new(path, timeout)),
            package_manager: package_manager
                .map(|(path, args)| (CommandRunner::new(path, timeout), args)),
        }
    }
}

impl HostIntegration for SystemHost {
    fn release_mount(&self, mapper_path: &Path) -> BlockvaultResult<Option<PathBuf>> {
        let mut mount_point = fstab::find_mount_point(&self.mounts, mapper_path)?;
        if mount_point.is_none() {
            if let Ok(resolved) = fs::canonicalize(mapper_path) {
                if resolved != mapper_path {
                    mount_point = fstab::find_mount_point(&self.mounts, &resolved)?;
                }
            }
        }
        let Some(mount_point) = mount_point else {
            return Ok(None);
        };

        let runner = self.umount.as_ref().ok_or_else(|| {
            BlockvaultError::Host(format!(
                "{} is mounted at {} but no umount binary was found; tried {:?}",
                mapper_path.display(),
                mount_point.display(),
                DEFAULT_UMOUNT_PATHS
            ))
        })?;

        let target = mount_point.to_string_lossy().into_owned();
        let out = runner.run(&[target.as_str()], None)?;
        if out.status != 0 {
            return Err(BlockvaultError::Host(format!(
                "umount {} exited with code {}: {}",
                mount_point.display(),
                out.status,
                out.diagnostic()
            )));
        }
        info!("unmounted {} from {}", mapper_path.display(), mount_point.display());
        Ok(Some(mount_point))
    }

    fn remove_packages(&self, packages: &[String]) -> BlockvaultResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let Some((runner, base_args)) = &self.package_manager else {
            return Err(BlockvaultError::Host(format!(
                "no supported package manager found; leaving {} installed",
                packages.join(", ")
            )));
        };

        let args: Vec<&str> = base_args
            .iter()
            .chain(packages.iter())
            .map(String::as_str)
            .collect();
        let out = runner.run(&args, None)?;
        if out.status != 0 {
            return Err(BlockvaultError::Host(format!(
                "{} {} exited with code {}: {}",
                runner.binary().display(),
                args.join(" "),
                out.status,
                out.diagnostic()
            )));
        }
        info!("removed packages {}", packages.join(", "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn release_mount_skips_unmounted_devices() {
        let dir = tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, "/dev/sda1 / ext4 rw 0 0\n").unwrap();
        let host = SystemHost::with_paths(mounts, None, None, Duration::from_secs(5));

        assert_eq!(host.release_mount(Path::new("/dev/mapper/vault1")).unwrap(), None);
    }

    #[test]
    fn release_mount_runs_umount_on_mount_point() {
        let dir = tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, "/dev/mapper/vault1 /srv/vault ext4 rw 0 0\n").unwrap();
        let log = dir.path().join("umount.log");
        let umount = script(dir.path(), "umount", &format!("echo \"$@\" >> {}", log.display()));
        let host = SystemHost::with_paths(mounts, Some(umount), None, Duration::from_secs(5));

        let released = host.release_mount(Path::new("/dev/mapper/vault1")).unwrap();
        assert_eq!(released, Some(PathBuf::from("/srv/vault")));
        assert_eq!(fs::read_to_string(&log).unwrap(), "/srv/vault\n");
    }

    #[test]
    fn remove_packages_passes_names_to_manager() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("apt.log");
        let apt = script(dir.path(), "apt-get", &format!("echo \"$@\" >> {}", log.display()));
        let host = SystemHost::with_paths(
            dir.path().join("mounts"),
            None,
            Some((apt, vec!["remove".into(), "-y".into()])),
            Duration::from_secs(5),
        );

        host.remove_packages(&["cryptsetup".into(), "cryptsetup-bin".into()])
            .unwrap();
        assert_eq!(
            fs::read_to_string(&log).unwrap(),
            "remove -y cryptsetup cryptsetup-bin\n"
        );
    }

    #[test]
    fn remove_packages_reports_failure() {
        let dir = tempdir().unwrap();
        let apt = script(dir.path(), "apt-get", "echo 'E: locked' >&2; exit 100");
        let host = SystemHost::with_paths(
            dir.path().join("mounts"),
            None,
            Some((apt, vec!["remove".into(), "-y".into()])),
            Duration::from_secs(5),
        );

        let err = host.remove_packages(&["cryptsetup".into()]).unwrap_err();
        assert!(err.to_string().contains("E: locked"), "{err}");
    }
}
