//! Shared helpers for whole-sequence tests.
//!
//! [Device] couples the fakes from `bb_bootval::test_utils` with a temporary root directory and a
//! tiny model of the Mender bootloader integration, so a test can alternate between running the
//! validation and power cycling the board.

#![allow(dead_code)]

use std::path::PathBuf;

use bb_bootval::{
    Layout, Outcome, PersistentState, Root, Sequence, StateStore,
    test_utils::{FakeProbe, FakeRunner},
};
use tempfile::TempDir;

pub const ROOTFS_A: &str = "/dev/mmcblk0p2";
pub const ROOTFS_B: &str = "/dev/mmcblk0p3";

pub struct Device {
    pub root: TempDir,
    pub layout: Layout,
    pub runner: FakeRunner,
    pub probe: FakeProbe,
}

impl Device {
    /// Board running from partition A with U-Boot environment tools.
    pub fn new() -> Self {
        Self::with_runner(FakeRunner::new())
    }

    pub fn with_runner(runner: FakeRunner) -> Self {
        let root = tempfile::tempdir().expect("failed to create device root");
        let layout = Layout::new(root.path(), "data");

        let dev = Self {
            root,
            layout,
            runner,
            probe: FakeProbe::new(ROOTFS_A, ROOTFS_B),
        };
        dev.write_config(ROOTFS_A, ROOTFS_B);
        dev.write_file("etc/os-release", "NAME=\"Fake OS\"\nVERSION_ID=1\n");
        dev
    }

    pub fn write_file(&self, relative: &str, contents: &str) {
        let p = self.root.path().join(relative);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, contents).unwrap();
    }

    pub fn write_config(&self, a: &str, b: &str) {
        self.write_file(
            "etc/mender/mender.conf",
            &format!(r#"{{"RootfsPartA": "{a}", "RootfsPartB": "{b}"}}"#),
        );
    }

    pub fn run(&self) -> bb_bootval::Result<Outcome> {
        Sequence::new(&self.layout, &self.runner, &self.probe).run()
    }

    pub fn state_file(&self) -> PathBuf {
        self.layout.state_file()
    }

    pub fn state(&self) -> PersistentState {
        StateStore::open(self.state_file())
            .expect("state should be readable")
            .state()
            .clone()
    }

    /// Rewrite the persisted record, as if a previous run had stopped halfway.
    pub fn edit_state(&self, f: impl FnOnce(&mut PersistentState)) {
        let mut store = StateStore::open(self.state_file()).unwrap();
        let mut tx = store.transaction();
        f(&mut tx);
        tx.commit().unwrap();
    }

    /// Reboot the board, letting the bootloader pick the partition from its environment.
    ///
    /// A pending update counts a boot attempt. If the selected partition lost its boot
    /// directory the bootloader falls back to the other one and clears the pending update.
    pub fn power_cycle(&self) {
        let running = self.probe.running();
        let mut target = match self.runner.var("mender_boot_part").as_deref() {
            Some("2") => Root::A,
            Some("3") => Root::B,
            _ => running,
        };

        if self.runner.var("upgrade_available").as_deref() == Some("1") {
            let count: u32 = self
                .runner
                .var("bootcount")
                .and_then(|x| x.parse().ok())
                .unwrap_or(0);
            self.runner.set_var("bootcount", &(count + 1).to_string());

            let device = if target == Root::A { ROOTFS_A } else { ROOTFS_B };
            if self.runner.is_broken(device) {
                target = target.other().unwrap();
                let part = if target == Root::A { "2" } else { "3" };
                self.runner.set_var("mender_boot_part", part);
                self.runner.set_var("mender_boot_part_hex", part);
                self.runner.set_var("upgrade_available", "0");
            }
        }

        self.probe.boot_into(target);
    }
}
