//! In-memory stand-ins for the device, to drive the validation sequence without real hardware.
//!
//! [FakeRunner] keeps a bootloader environment and simulates mounting partitions onto real
//! directories, while [FakeProbe] reports which partition is running.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
};

use crate::{CommandError, CommandRunner, Root, SystemProbe};

const BOOT_DIR: &str = "boot";
const BOOT_DIR_DEFUNCT: &str = "boot-defunct";

/// [CommandRunner] backed by an in-memory bootloader environment.
#[derive(Debug, Default)]
pub struct FakeRunner {
    installed: HashSet<String>,
    env: RefCell<BTreeMap<String, String>>,
    calls: RefCell<Vec<Vec<String>>>,
    failures: RefCell<Vec<Vec<String>>>,
    mounts: RefCell<HashMap<PathBuf, String>>,
    broken: RefCell<HashSet<String>>,
}

impl FakeRunner {
    /// Device with U-Boot environment tools.
    pub fn new() -> Self {
        Self::with_tools(&["fw_setenv", "fw_printenv"])
    }

    /// Device with GRUB environment tools.
    pub fn grub() -> Self {
        Self::with_tools(&["grub-mender-grubenv-set", "grub-mender-grubenv-print"])
    }

    fn with_tools(tools: &[&str]) -> Self {
        let installed = tools
            .iter()
            .chain(&["mount", "umount", "reboot", "systemctl", "uname"])
            .map(|x| x.to_string())
            .collect();

        Self {
            installed,
            ..Default::default()
        }
    }

    /// Make every call of `program` fail.
    pub fn fail_on(&self, program: &str) {
        self.fail_on_args(program, &[]);
    }

    /// Make calls of `program` whose arguments start with `args` fail.
    pub fn fail_on_args(&self, program: &str, args: &[&str]) {
        let entry = std::iter::once(program)
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        self.failures.borrow_mut().push(entry);
    }

    pub fn clear_failures(&self) {
        self.failures.borrow_mut().clear();
    }

    /// Every call made so far, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    pub fn called(&self, program: &str) -> bool {
        self.calls.borrow().iter().any(|c| c[0] == program)
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c[0] == program).count()
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        self.env.borrow().clone()
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.env.borrow().get(name).cloned()
    }

    pub fn set_var(&self, name: &str, value: &str) {
        self.env
            .borrow_mut()
            .insert(name.to_string(), value.to_string());
    }

    /// Whether the boot directory of `device` has been renamed away.
    pub fn is_broken(&self, device: &str) -> bool {
        self.broken.borrow().contains(device)
    }

    pub fn is_mounted(&self) -> bool {
        !self.mounts.borrow().is_empty()
    }

    fn failed(program: &str) -> CommandError {
        CommandError::Failed {
            program: program.to_string(),
            status: "exit status: 1".to_string(),
            stderr: String::new(),
        }
    }

    fn mount(&self, device: &str, dir: &str) -> Result<String, CommandError> {
        let dir = PathBuf::from(dir);
        let name = if self.is_broken(device) {
            BOOT_DIR_DEFUNCT
        } else {
            BOOT_DIR
        };
        std::fs::create_dir_all(dir.join(name)).map_err(|_| Self::failed("mount"))?;
        self.mounts.borrow_mut().insert(dir, device.to_string());
        Ok(String::new())
    }

    fn umount(&self, dir: &str) -> Result<String, CommandError> {
        let dir = Path::new(dir);
        let device = self
            .mounts
            .borrow_mut()
            .remove(dir)
            .ok_or_else(|| Self::failed("umount"))?;

        if dir.join(BOOT_DIR_DEFUNCT).exists() && !dir.join(BOOT_DIR).exists() {
            self.broken.borrow_mut().insert(device);
        }
        let _ = std::fs::remove_dir_all(dir.join(BOOT_DIR));
        let _ = std::fs::remove_dir_all(dir.join(BOOT_DIR_DEFUNCT));

        Ok(String::new())
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let call: Vec<String> = std::iter::once(program)
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        self.calls.borrow_mut().push(call.clone());

        if self
            .failures
            .borrow()
            .iter()
            .any(|f| call.starts_with(f))
        {
            return Err(Self::failed(program));
        }

        if program != "which" && !self.installed.contains(program) {
            return Err(CommandError::NotFound(program.to_string()));
        }

        match (program, args) {
            ("which", [p]) if self.installed.contains(*p) => Ok(format!("/usr/bin/{p}\n")),
            ("which", _) => Err(Self::failed(program)),
            ("fw_setenv" | "grub-mender-grubenv-set", [name, value]) => {
                self.set_var(name, value);
                Ok(String::new())
            }
            ("fw_printenv" | "grub-mender-grubenv-print", [name]) => self
                .var(name)
                .map(|v| format!("{name}={v}\n"))
                .ok_or_else(|| Self::failed(program)),
            ("mount", [device, dir]) => self.mount(device, dir),
            ("umount", [dir]) => self.umount(dir),
            ("uname", _) => Ok("Linux fake 6.6.0 #1 SMP aarch64 GNU/Linux\n".to_string()),
            ("reboot" | "systemctl", _) => Ok(String::new()),
            _ => Err(Self::failed(program)),
        }
    }
}

/// [SystemProbe] reporting a configurable running partition.
#[derive(Debug, Default)]
pub struct FakeProbe {
    devices: Vec<(PathBuf, u64)>,
    mounted: Cell<Option<u64>>,
    boot: Cell<u32>,
}

impl FakeProbe {
    const DEV_A: u64 = 0xb302;
    const DEV_B: u64 = 0xb303;

    /// Probe knowing the two root partition devices, booted into A.
    pub fn new(rootfs_a: impl Into<PathBuf>, rootfs_b: impl Into<PathBuf>) -> Self {
        let probe = Self {
            devices: vec![(rootfs_a.into(), Self::DEV_A), (rootfs_b.into(), Self::DEV_B)],
            ..Default::default()
        };
        probe.boot_into(Root::A);
        probe
    }

    /// Simulate a fresh boot with `root` mounted.
    pub fn boot_into(&self, root: Root) {
        self.mounted.set(match root {
            Root::A => Some(Self::DEV_A),
            Root::B => Some(Self::DEV_B),
            Root::Undefined => None,
        });
        self.boot.set(self.boot.get() + 1);
    }

    pub fn set_mounted(&self, dev: Option<u64>) {
        self.mounted.set(dev);
    }

    /// Partition currently reported as running.
    pub fn running(&self) -> Root {
        match self.mounted.get() {
            Some(Self::DEV_A) => Root::A,
            Some(Self::DEV_B) => Root::B,
            _ => Root::Undefined,
        }
    }
}

impl SystemProbe for FakeProbe {
    fn mounted_device(&self, _: &Path) -> Option<u64> {
        self.mounted.get()
    }

    fn block_device(&self, path: &Path) -> Option<u64> {
        self.devices
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, dev)| *dev)
    }

    fn boot_id(&self) -> Option<String> {
        Some(format!("fake-boot-{}", self.boot.get()))
    }
}
