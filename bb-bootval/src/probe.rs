//! Identification of the running root partition.

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

/// Identity of a root partition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    #[serde(rename = "root_a")]
    A,
    #[serde(rename = "root_b")]
    B,
    #[serde(rename = "root_undefined")]
    Undefined,
}

impl Root {
    /// The partition on the other side of the A/B pair.
    pub const fn other(self) -> Option<Self> {
        match self {
            Self::A => Some(Self::B),
            Self::B => Some(Self::A),
            Self::Undefined => None,
        }
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("root_a"),
            Self::B => f.write_str("root_b"),
            Self::Undefined => f.write_str("root_undefined"),
        }
    }
}

/// Read-only view of the running system.
pub trait SystemProbe {
    /// Device number of the filesystem mounted at `path`.
    fn mounted_device(&self, path: &Path) -> Option<u64>;

    /// Device number of the block special file at `path`.
    fn block_device(&self, path: &Path) -> Option<u64>;

    /// Identifier of the currently running kernel boot. Changes on every reboot.
    fn boot_id(&self) -> Option<String>;
}

/// [SystemProbe] for Linux hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxProbe;

#[cfg(unix)]
impl SystemProbe for LinuxProbe {
    fn mounted_device(&self, path: &Path) -> Option<u64> {
        use std::os::unix::fs::MetadataExt;

        std::fs::metadata(path).ok().map(|m| m.dev())
    }

    fn block_device(&self, path: &Path) -> Option<u64> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let meta = std::fs::metadata(path).ok()?;
        meta.file_type().is_block_device().then(|| meta.rdev())
    }

    fn boot_id(&self) -> Option<String> {
        std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
            .ok()
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
    }
}

/// Determine which of the two root filesystem devices is mounted at `root`.
///
/// Never guesses: a device that cannot be probed, or a root matching both configured
/// partitions, yields [Root::Undefined].
pub fn identify_mounted_root(
    probe: &impl SystemProbe,
    root: &Path,
    rootfs_a: &Path,
    rootfs_b: &Path,
) -> Root {
    let mounted = probe.mounted_device(root);
    let a = probe.block_device(rootfs_a);
    let b = probe.block_device(rootfs_b);

    let result = match (mounted, a, b) {
        (Some(dev), Some(a), Some(b)) if a == b => {
            tracing::warn!("{:?} and {:?} are the same device {dev}", rootfs_a, rootfs_b);
            Root::Undefined
        }
        (Some(dev), Some(a), Some(_)) if a == dev => Root::A,
        (Some(dev), Some(_), Some(b)) if b == dev => Root::B,
        _ => Root::Undefined,
    };

    tracing::info!(
        "Mount identification - {:?}: {:?}, {:?}: {:?}, {:?}: {:?}, result is {}",
        root,
        mounted,
        rootfs_a,
        a,
        rootfs_b,
        b,
        result
    );

    result
}
