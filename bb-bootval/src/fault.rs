//! Breaking the inactive partition to force a rollback.

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    BootEnv, CommandError, CommandRunner, Partition,
    bootenv::{BOOTCOUNT, UPGRADE_AVAILABLE},
};

const BOOT_DIR: &str = "boot";
const BOOT_DIR_DEFUNCT: &str = "boot-defunct";

/// Fault injection sub-step that failed. Formats as the reported failure reason.
#[derive(Error, Debug)]
pub enum FaultError {
    #[error("failed to create temporary mount point, aborting: {0}")]
    MountPoint(io::Error),
    #[error("failed to mount {device:?} to {dir:?}, aborting: {source}")]
    Mount {
        device: PathBuf,
        dir: PathBuf,
        source: CommandError,
    },
    #[error("failed to rename boot in {dir:?}, aborting: {source}")]
    Rename { dir: PathBuf, source: io::Error },
    #[error("failed to unmount {dir:?}: {source}")]
    Unmount { dir: PathBuf, source: CommandError },
    #[error("failed to set {name}: {source}")]
    Env {
        name: &'static str,
        source: CommandError,
    },
    #[error("failed to set boot partition {root}: {source}")]
    Select {
        root: crate::Root,
        source: CommandError,
    },
}

/// Makes a partition unbootable and arms the bootloader to try it once.
#[derive(Debug)]
pub struct FaultInjector<'a, R> {
    runner: &'a R,
    env: BootEnv<'a, R>,
}

impl<'a, R: CommandRunner> FaultInjector<'a, R> {
    pub const fn new(runner: &'a R, env: BootEnv<'a, R>) -> Self {
        Self { runner, env }
    }

    /// Break `target` and select it for the next boot. Stops at the first failing sub-step.
    ///
    /// Safe to repeat: a boot directory that was already renamed is left as is.
    pub fn inject(&self, target: &Partition) -> Result<(), FaultError> {
        self.break_partition(&target.device)?;

        for (name, value) in [(BOOTCOUNT, "0"), (UPGRADE_AVAILABLE, "1")] {
            self.env
                .set(name, value)
                .map_err(|source| FaultError::Env { name, source })?;
        }

        self.env
            .select_boot_partition(target.number)
            .map_err(|source| FaultError::Select {
                root: target.root,
                source,
            })
    }

    fn break_partition(&self, device: &Path) -> Result<(), FaultError> {
        let tmp = tempfile::tempdir().map_err(FaultError::MountPoint)?;
        tracing::info!("Created temporary directory {:?}", tmp.path());

        let mount = Mount::new(self.runner, device, tmp.path())?;

        let boot = mount.dir.join(BOOT_DIR);
        let defunct = mount.dir.join(BOOT_DIR_DEFUNCT);
        if !boot.exists() && defunct.exists() {
            tracing::info!("{:?} already renamed to {:?}", boot, defunct);
        } else {
            std::fs::rename(&boot, &defunct).map_err(|source| FaultError::Rename {
                dir: mount.dir.clone(),
                source,
            })?;
            tracing::info!("Renamed {:?} to {:?}", boot, defunct);
        }

        mount.unmount()
    }
}

/// Partition mounted on a scoped directory. Unmounted on drop unless [Mount::unmount] was called.
struct Mount<'a, R: CommandRunner> {
    runner: &'a R,
    dir: PathBuf,
    mounted: bool,
}

impl<'a, R: CommandRunner> Mount<'a, R> {
    fn new(runner: &'a R, device: &Path, dir: &Path) -> Result<Self, FaultError> {
        let dev = device.to_string_lossy();
        let d = dir.to_string_lossy();

        runner
            .run("mount", &[&*dev, &*d])
            .map_err(|source| FaultError::Mount {
                device: device.to_path_buf(),
                dir: dir.to_path_buf(),
                source,
            })?;
        tracing::info!("Mounted {:?} to {:?}", device, dir);

        Ok(Self {
            runner,
            dir: dir.to_path_buf(),
            mounted: true,
        })
    }

    fn umount(&mut self) -> Result<(), CommandError> {
        let d = self.dir.to_string_lossy();
        self.runner.run("umount", &[&*d])?;
        self.mounted = false;
        Ok(())
    }

    fn unmount(mut self) -> Result<(), FaultError> {
        self.umount().map_err(|source| FaultError::Unmount {
            dir: self.dir.clone(),
            source,
        })
    }
}

impl<R: CommandRunner> Drop for Mount<'_, R> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        if let Err(e) = self.umount() {
            tracing::warn!("Failed to release mount {:?}: {e}", self.dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backend, Root, test_utils::FakeRunner};

    const DEV: &str = "/dev/mmcblk0p3";

    fn target() -> Partition {
        Partition {
            root: Root::B,
            device: DEV.into(),
            number: 3,
        }
    }

    #[test]
    fn breaks_and_arms() {
        let runner = FakeRunner::new();
        let injector = FaultInjector::new(&runner, BootEnv::new(&runner, Backend::UBoot));

        injector.inject(&target()).unwrap();

        assert!(runner.is_broken(DEV));
        assert!(!runner.is_mounted());
        assert_eq!(runner.var(BOOTCOUNT).as_deref(), Some("0"));
        assert_eq!(runner.var(UPGRADE_AVAILABLE).as_deref(), Some("1"));
        assert_eq!(runner.var("mender_boot_part").as_deref(), Some("3"));
    }

    #[test]
    fn repeat_after_rename() {
        let runner = FakeRunner::new();
        let injector = FaultInjector::new(&runner, BootEnv::new(&runner, Backend::UBoot));

        injector.inject(&target()).unwrap();
        injector.inject(&target()).unwrap();

        assert!(runner.is_broken(DEV));
    }

    #[test]
    fn mount_failure_short_circuits() {
        let runner = FakeRunner::new();
        runner.fail_on("mount");
        let injector = FaultInjector::new(&runner, BootEnv::new(&runner, Backend::UBoot));

        let err = injector.inject(&target()).unwrap_err();

        assert!(matches!(err, FaultError::Mount { .. }));
        assert!(err.to_string().starts_with("failed to mount"));
        assert!(!runner.called("umount"));
        assert!(!runner.called("fw_setenv"));
        assert!(!runner.is_broken(DEV));
    }

    #[test]
    fn unmount_failure_stops_before_env() {
        let runner = FakeRunner::new();
        runner.fail_on("umount");
        let injector = FaultInjector::new(&runner, BootEnv::new(&runner, Backend::UBoot));

        let err = injector.inject(&target()).unwrap_err();

        assert!(matches!(err, FaultError::Unmount { .. }));
        assert!(!runner.called("fw_setenv"));
    }

    #[test]
    fn env_failure_names_variable() {
        let runner = FakeRunner::new();
        runner.fail_on_args("fw_setenv", &[UPGRADE_AVAILABLE]);
        let injector = FaultInjector::new(&runner, BootEnv::new(&runner, Backend::UBoot));

        let err = injector.inject(&target()).unwrap_err();

        assert_eq!(err.to_string().split(':').next(), Some("failed to set upgrade_available"));
        assert!(runner.var("mender_boot_part").is_none());
    }
}
