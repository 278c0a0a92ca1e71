//! Device partition assignment, read from the Mender client configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Layout, Result};

/// Keys contributed by a single configuration source.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct PartialConfig {
    #[serde(rename = "RootfsPartA")]
    pub rootfs_a: Option<PathBuf>,
    #[serde(rename = "RootfsPartB")]
    pub rootfs_b: Option<PathBuf>,
}

impl PartialConfig {
    /// Read one source. A missing or malformed file contributes no keys.
    pub fn from_file(path: &Path) -> Self {
        tracing::info!("Reading configuration {:?}", path);

        let data = match std::fs::read(path) {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!("Skipping configuration {:?}: {e}", path);
                return Self::default();
            }
        };

        serde_json::from_slice(&data).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed configuration {:?}: {e}", path);
            Self::default()
        })
    }

    /// Merge `other` into `self`. Keys already present are kept.
    pub fn merge(self, other: Self) -> Self {
        Self {
            rootfs_a: self.rootfs_a.or(other.rootfs_a),
            rootfs_b: self.rootfs_b.or(other.rootfs_b),
        }
    }
}

/// Root filesystem devices of the two A/B partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub rootfs_a: PathBuf,
    pub rootfs_b: PathBuf,
}

impl DeviceConfig {
    /// Load and merge all configuration sources of `layout`.
    pub fn load(layout: &Layout) -> Result<Self> {
        layout
            .config_files()
            .iter()
            .map(|p| PartialConfig::from_file(p))
            .fold(PartialConfig::default(), PartialConfig::merge)
            .try_into()
    }
}

impl TryFrom<PartialConfig> for DeviceConfig {
    type Error = Error;

    fn try_from(value: PartialConfig) -> Result<Self> {
        let rootfs_a = value.rootfs_a.ok_or(Error::ConfigConsistency(
            "root filesystem A not found in config".to_string(),
        ))?;
        let rootfs_b = value.rootfs_b.ok_or(Error::ConfigConsistency(
            "root filesystem B not found in config".to_string(),
        ))?;

        Ok(Self { rootfs_a, rootfs_b })
    }
}
