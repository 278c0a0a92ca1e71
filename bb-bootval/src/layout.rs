use std::path::{Path, PathBuf};

const DEFAULT_DATA_DIR: &str = "data";
const STATE_FILENAME: &str = "mender_validation_state.json";
const LOG_FILENAME: &str = "validation.log";
const MENDER_CLIENT_CONFIG: &str = "etc/mender/mender.conf";
const MENDER_DEVICE_CONFIG: &str = "var/lib/mender/mender.conf";
const OS_RELEASE: &str = "etc/os-release";

/// Locations of every file the validation reads or writes, relative to a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    data_dir: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Mount point whose device identifies the running root partition.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(&self.data_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join(STATE_FILENAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir().join(LOG_FILENAME)
    }

    /// Configuration sources in precedence order. Earlier sources win.
    pub fn config_files(&self) -> [PathBuf; 2] {
        [
            self.root.join(MENDER_CLIENT_CONFIG),
            self.root.join(MENDER_DEVICE_CONFIG),
        ]
    }

    pub fn os_release(&self) -> PathBuf {
        self.root.join(OS_RELEASE)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new("/", DEFAULT_DATA_DIR)
    }
}
