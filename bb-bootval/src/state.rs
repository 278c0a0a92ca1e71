//! Durable record of the partition assignment and test progress.
//!
//! The existence of the state file signals that a validation sequence is in progress. Changes are
//! made on a [Transaction] and only become visible once [Transaction::commit] has durably written
//! them, which lets callers order every device action strictly after the write it depends on.

use std::{
    fmt,
    fs::File,
    io::{self, Write},
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{Backend, DeviceConfig, Error, Result, Root};

/// Stages of the validation sequence, in the order they are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    #[default]
    None,
    Init,
    TestSwitch,
    TestUpdate,
    TestRollback,
    End,
}

impl Step {
    /// Successor of this step. [Step::End] is its own successor.
    pub const fn next(self) -> Self {
        match self {
            Self::None => Self::Init,
            Self::Init => Self::TestSwitch,
            Self::TestSwitch => Self::TestUpdate,
            Self::TestUpdate => Self::TestRollback,
            Self::TestRollback | Self::End => Self::End,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::End)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Init => "init",
            Self::TestSwitch => "test_switch",
            Self::TestUpdate => "test_update",
            Self::TestRollback => "test_rollback",
            Self::End => "end",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::None,
            Self::Init,
            Self::TestSwitch,
            Self::TestUpdate,
            Self::TestRollback,
            Self::End,
        ]
        .into_iter()
        .find(|x| x.as_str() == s)
        .ok_or_else(|| Error::UnknownStep(s.to_string()))
    }
}

/// Partition the bootloader can be pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub root: Root,
    pub device: PathBuf,
    pub number: u32,
}

/// Typed view of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub rootfs_a: Option<PathBuf>,
    pub rootfs_b: Option<PathBuf>,
    pub partition_a: Option<u32>,
    pub partition_b: Option<u32>,
    pub set_cmd: Option<String>,
    pub print_cmd: Option<String>,
    /// `None` until the record has been initialized from the configuration.
    pub step: Option<Step>,
    /// Root the evaluation following the next reboot must observe.
    pub expected_root: Option<Root>,
    /// Boot id of the kernel that completed preparation of [Self::step].
    pub prepared_boot: Option<String>,
}

impl PersistentState {
    /// Ensure the configuration still describes the partitions this sequence started with.
    pub fn check_config(&self, config: &DeviceConfig) -> Result<()> {
        let pairs = [
            ("A", &self.rootfs_a, &config.rootfs_a),
            ("B", &self.rootfs_b, &config.rootfs_b),
        ];

        for (name, recorded, configured) in pairs {
            match recorded {
                Some(recorded) if recorded != configured => {
                    return Err(Error::ConfigConsistency(format!(
                        "root filesystem {name} in config {configured:?} does not match last used one {recorded:?}"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Record the configuration derived parts of the state and reset progress to [Step::None].
    pub fn initialize(&mut self, config: &DeviceConfig, backend: Backend) {
        self.partition_a = partition_number(&config.rootfs_a);
        self.partition_b = partition_number(&config.rootfs_b);
        self.rootfs_a = Some(config.rootfs_a.clone());
        self.rootfs_b = Some(config.rootfs_b.clone());
        self.set_cmd = Some(backend.set_cmd().to_string());
        self.print_cmd = Some(backend.print_cmd().to_string());
        self.step = Some(Step::None);
        self.expected_root = None;
        self.prepared_boot = None;
    }

    pub fn partition(&self, root: Root) -> Option<Partition> {
        let (device, number) = match root {
            Root::A => (self.rootfs_a.as_ref(), self.partition_a),
            Root::B => (self.rootfs_b.as_ref(), self.partition_b),
            Root::Undefined => return None,
        };

        Some(Partition {
            root,
            device: device?.clone(),
            number: number?,
        })
    }

    /// The partition that is not `current`. Nothing if the current root is unknown.
    pub fn inactive(&self, current: Root) -> Option<Partition> {
        self.partition(current.other()?)
    }

    /// Bootloader backend chosen when the record was initialized.
    pub fn backend(&self) -> Option<Backend> {
        Backend::from_cmds(self.set_cmd.as_deref()?, self.print_cmd.as_deref()?)
    }
}

/// Trailing decimal digits of a device path, e.g. `3` for `/dev/mmcblk0p3`.
pub(crate) fn partition_number(device: &Path) -> Option<u32> {
    let s = device.to_str()?;
    let digits = s.len() - s.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    s[s.len() - digits..].parse().ok()
}

/// On-disk representation. Kept loose so that an unknown step is reported as such rather than
/// as a corrupt file.
#[derive(Serialize, Deserialize, Debug, Default)]
struct StateFile {
    #[serde(rename = "RootfsPartA", default, skip_serializing_if = "Option::is_none")]
    rootfs_a: Option<PathBuf>,
    #[serde(rename = "RootfsPartB", default, skip_serializing_if = "Option::is_none")]
    rootfs_b: Option<PathBuf>,
    #[serde(rename = "PartitionNumberA", default)]
    partition_a: Option<u32>,
    #[serde(rename = "PartitionNumberB", default)]
    partition_b: Option<u32>,
    #[serde(rename = "SetCmd", default, skip_serializing_if = "Option::is_none")]
    set_cmd: Option<String>,
    #[serde(rename = "PrintCmd", default, skip_serializing_if = "Option::is_none")]
    print_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(rename = "ExpectedRoot", default, skip_serializing_if = "Option::is_none")]
    expected_root: Option<Root>,
    #[serde(rename = "PreparedBoot", default, skip_serializing_if = "Option::is_none")]
    prepared_boot: Option<String>,
}

impl TryFrom<StateFile> for PersistentState {
    type Error = Error;

    fn try_from(value: StateFile) -> Result<Self> {
        Ok(Self {
            rootfs_a: value.rootfs_a,
            rootfs_b: value.rootfs_b,
            partition_a: value.partition_a,
            partition_b: value.partition_b,
            set_cmd: value.set_cmd,
            print_cmd: value.print_cmd,
            step: value.step.as_deref().map(str::parse::<Step>).transpose()?,
            expected_root: value.expected_root,
            prepared_boot: value.prepared_boot,
        })
    }
}

impl From<&PersistentState> for StateFile {
    fn from(value: &PersistentState) -> Self {
        Self {
            rootfs_a: value.rootfs_a.clone(),
            rootfs_b: value.rootfs_b.clone(),
            partition_a: value.partition_a,
            partition_b: value.partition_b,
            set_cmd: value.set_cmd.clone(),
            print_cmd: value.print_cmd.clone(),
            step: value.step.map(|x| x.as_str().to_string()),
            expected_root: value.expected_root,
            prepared_boot: value.prepared_boot.clone(),
        }
    }
}

/// Owner of the state file and the last durably written [PersistentState].
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PersistentState,
}

impl StateStore {
    /// Load the last committed record, or an empty one if no sequence is in progress.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = match std::fs::read(&path) {
            Ok(data) => {
                let raw: StateFile =
                    serde_json::from_slice(&data).map_err(|source| Error::CorruptState {
                        path: path.clone(),
                        source,
                    })?;
                raw.try_into()?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => PersistentState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn state(&self) -> &PersistentState {
        &self.state
    }

    /// Start modifying the record. Nothing is written until [Transaction::commit].
    pub fn transaction(&mut self) -> Transaction<'_> {
        let draft = self.state.clone();
        Transaction { store: self, draft }
    }

    /// Delete the record, ending the sequence.
    pub fn clear(self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, state: &PersistentState) -> Result<()> {
        let data = serde_json::to_vec_pretty(&StateFile::from(state)).map_err(Error::Serialize)?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        // Make the rename itself durable
        File::open(dir)?.sync_all()?;

        Ok(())
    }
}

/// Pending modification of a [StateStore].
///
/// Dropping a transaction without committing discards its changes.
#[derive(Debug)]
pub struct Transaction<'a> {
    store: &'a mut StateStore,
    draft: PersistentState,
}

impl Transaction<'_> {
    /// Durably write the draft. The store only reflects it once this returns successfully.
    pub fn commit(self) -> Result<()> {
        self.store.persist(&self.draft)?;
        self.store.state = self.draft;
        Ok(())
    }
}

impl Deref for Transaction<'_> {
    type Target = PersistentState;

    fn deref(&self) -> &Self::Target {
        &self.draft
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(a: &str, b: &str) -> DeviceConfig {
        DeviceConfig {
            rootfs_a: a.into(),
            rootfs_b: b.into(),
        }
    }

    #[test]
    fn step_order() {
        let expected = [
            (Step::None, Step::Init),
            (Step::Init, Step::TestSwitch),
            (Step::TestSwitch, Step::TestUpdate),
            (Step::TestUpdate, Step::TestRollback),
            (Step::TestRollback, Step::End),
            (Step::End, Step::End),
        ];

        for (from, to) in expected {
            assert_eq!(from.next(), to, "successor of {from}");
            assert!(from.next() >= from);
        }
    }

    #[test]
    fn step_names() {
        for s in ["none", "init", "test_switch", "test_update", "test_rollback", "end"] {
            assert_eq!(s.parse::<Step>().unwrap().as_str(), s);
        }
        assert!(matches!(
            "test_reboot".parse::<Step>(),
            Err(Error::UnknownStep(x)) if x == "test_reboot"
        ));
    }

    #[test]
    fn partition_numbers() {
        assert_eq!(partition_number(Path::new("/dev/mmcblk0p3")), Some(3));
        assert_eq!(partition_number(Path::new("/dev/sda12")), Some(12));
        assert_eq!(partition_number(Path::new("/dev/mapper/root")), None);
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        assert_eq!(store.state(), &PersistentState::default());
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"step\": ").unwrap();

        assert!(matches!(
            StateStore::open(&path),
            Err(Error::CorruptState { .. })
        ));
    }

    #[test]
    fn unknown_step_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"step": "test_reboot"}"#).unwrap();

        assert!(matches!(StateStore::open(&path), Err(Error::UnknownStep(_))));
    }

    #[test]
    fn commit_is_durable_and_drop_discards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("state.json");
        let mut store = StateStore::open(&path).unwrap();

        let mut tx = store.transaction();
        tx.initialize(&config("/dev/mmcblk0p2", "/dev/mmcblk0p3"), Backend::UBoot);
        tx.commit().unwrap();

        {
            let mut tx = store.transaction();
            tx.step = Some(Step::End);
        }
        assert_eq!(store.state().step, Some(Step::None));

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.state(), store.state());
        assert_eq!(reopened.state().partition_a, Some(2));
        assert_eq!(reopened.state().backend(), Some(Backend::UBoot));

        reopened.clear().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn config_mismatch() {
        let mut state = PersistentState::default();
        state.initialize(&config("/dev/mmcblk0p2", "/dev/mmcblk0p3"), Backend::Grub);

        assert!(state.check_config(&config("/dev/mmcblk0p2", "/dev/mmcblk0p3")).is_ok());
        assert!(matches!(
            state.check_config(&config("/dev/mmcblk0p3", "/dev/mmcblk0p3")),
            Err(Error::ConfigConsistency(_))
        ));
    }

    #[test]
    fn inactive_partition() {
        let mut state = PersistentState::default();
        state.initialize(&config("/dev/mmcblk0p2", "/dev/mmcblk0p3"), Backend::UBoot);

        let inactive = state.inactive(Root::A).unwrap();
        assert_eq!(inactive.root, Root::B);
        assert_eq!(inactive.number, 3);
        assert_eq!(inactive.device, PathBuf::from("/dev/mmcblk0p3"));
        assert!(state.inactive(Root::Undefined).is_none());
    }
}
