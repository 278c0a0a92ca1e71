//! Access to the bootloader environment through the Mender userspace tools.

use crate::{CommandError, CommandRunner};

/// Decimal index of the partition to boot.
pub const BOOT_PART: &str = "mender_boot_part";
/// Index of the partition to boot, read by bootloader scripts expecting the hex variable.
pub const BOOT_PART_HEX: &str = "mender_boot_part_hex";
/// Boot attempts of a pending update.
pub const BOOTCOUNT: &str = "bootcount";
/// `1` while an update awaits its commit.
pub const UPGRADE_AVAILABLE: &str = "upgrade_available";

/// Bootloader whose environment is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    UBoot,
    Grub,
}

impl Backend {
    const UBOOT_SET: &str = "fw_setenv";
    const UBOOT_PRINT: &str = "fw_printenv";
    const GRUB_SET: &str = "grub-mender-grubenv-set";
    const GRUB_PRINT: &str = "grub-mender-grubenv-print";

    /// Prefer U-Boot tooling when installed, fall back to GRUB.
    pub fn detect(runner: &impl CommandRunner) -> Self {
        let backend = if runner.exists(Self::UBOOT_PRINT) {
            Self::UBoot
        } else {
            Self::Grub
        };
        tracing::info!("Using {:?} environment tools", backend);
        backend
    }

    pub const fn set_cmd(self) -> &'static str {
        match self {
            Self::UBoot => Self::UBOOT_SET,
            Self::Grub => Self::GRUB_SET,
        }
    }

    pub const fn print_cmd(self) -> &'static str {
        match self {
            Self::UBoot => Self::UBOOT_PRINT,
            Self::Grub => Self::GRUB_PRINT,
        }
    }

    pub fn from_cmds(set: &str, print: &str) -> Option<Self> {
        [Self::UBoot, Self::Grub]
            .into_iter()
            .find(|x| x.set_cmd() == set && x.print_cmd() == print)
    }
}

/// Reads and writes bootloader environment variables.
#[derive(Debug)]
pub struct BootEnv<'a, R> {
    runner: &'a R,
    backend: Backend,
}

impl<R> Clone for BootEnv<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for BootEnv<'_, R> {}

impl<'a, R: CommandRunner> BootEnv<'a, R> {
    pub const fn new(runner: &'a R, backend: Backend) -> Self {
        Self { runner, backend }
    }

    pub fn set(&self, name: &str, value: &str) -> Result<(), CommandError> {
        tracing::info!("Setting {name}={value}");
        self.runner
            .run(self.backend.set_cmd(), &[name, value])
            .map(|_| ())
    }

    /// Current value of `name`, or `None` if the bootloader does not define it.
    pub fn read(&self, name: &str) -> Result<Option<String>, CommandError> {
        let output = self.runner.run(self.backend.print_cmd(), &[name])?;
        parse_value(&output, name)
            .ok_or_else(|| CommandError::Unparseable(self.backend.print_cmd().to_string()))
    }

    /// Whether `name` currently holds `expected`. Unreadable variables never match.
    pub fn check(&self, name: &str, expected: &str) -> bool {
        match self.read(name) {
            Ok(Some(v)) => {
                tracing::info!("Checking {name} for {expected}, found {v}");
                v == expected
            }
            Ok(None) => {
                tracing::info!("Checking {name} for {expected}, variable not set");
                false
            }
            Err(e) => {
                tracing::warn!("Checking {name} for {expected} failed: {e}");
                false
            }
        }
    }

    /// Point the bootloader at partition `number` for the next boot.
    pub fn select_boot_partition(&self, number: u32) -> Result<(), CommandError> {
        let number = number.to_string();
        self.set(BOOT_PART, &number)?;
        self.set(BOOT_PART_HEX, &number)
    }
}

/// Find `name` in `key = value` lines.
///
/// Returns `None` when the output has no `key = value` line at all, and `Some(None)` when it does
/// but `name` is not among them.
fn parse_value(output: &str, name: &str) -> Option<Option<String>> {
    let mut pairs = output
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .peekable();

    pairs.peek()?;

    Some(pairs.find(|(k, _)| *k == name).map(|(_, v)| v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeRunner;

    #[test]
    fn parses_lines() {
        let out = "bootcount=1\n  upgrade_available = 0 \n";
        assert_eq!(parse_value(out, "bootcount"), Some(Some("1".to_string())));
        assert_eq!(
            parse_value(out, "upgrade_available"),
            Some(Some("0".to_string()))
        );
        assert_eq!(parse_value(out, "mender_boot_part"), Some(None));
        assert_eq!(parse_value("## Error: \"bootcount\" not defined", "bootcount"), None);
    }

    #[test]
    fn detect_backend() {
        let runner = FakeRunner::new();
        assert_eq!(Backend::detect(&runner), Backend::UBoot);

        let runner = FakeRunner::grub();
        assert_eq!(Backend::detect(&runner), Backend::Grub);
    }

    #[test]
    fn backend_roundtrip() {
        for b in [Backend::UBoot, Backend::Grub] {
            assert_eq!(Backend::from_cmds(b.set_cmd(), b.print_cmd()), Some(b));
        }
        assert_eq!(Backend::from_cmds("fw_setenv", "grub-mender-grubenv-print"), None);
    }

    #[test]
    fn check_variable() {
        let runner = FakeRunner::new();
        let env = BootEnv::new(&runner, Backend::UBoot);

        env.set(BOOTCOUNT, "1").unwrap();
        assert!(env.check(BOOTCOUNT, "1"));
        assert!(!env.check(BOOTCOUNT, "0"));
        assert!(!env.check(UPGRADE_AVAILABLE, "0"));

        runner.fail_on("fw_printenv");
        assert!(!env.check(BOOTCOUNT, "1"));
    }

    #[test]
    fn select_is_idempotent() {
        let runner = FakeRunner::new();
        let env = BootEnv::new(&runner, Backend::UBoot);

        env.select_boot_partition(11).unwrap();
        let once = runner.env();
        env.select_boot_partition(11).unwrap();

        assert_eq!(runner.env(), once);
        assert_eq!(runner.var(BOOT_PART).as_deref(), Some("11"));
        assert_eq!(runner.var(BOOT_PART_HEX).as_deref(), Some("11"));
    }

    #[test]
    fn select_writes_decimal_to_both() {
        let runner = FakeRunner::grub();
        let env = BootEnv::new(&runner, Backend::Grub);

        env.select_boot_partition(12).unwrap();

        assert_eq!(runner.var(BOOT_PART).as_deref(), Some("12"));
        assert_eq!(runner.var(BOOT_PART_HEX).as_deref(), Some("12"));
    }

    #[test]
    fn select_fails_if_any_write_fails() {
        let runner = FakeRunner::new();
        runner.fail_on_args("fw_setenv", &[BOOT_PART_HEX]);
        let env = BootEnv::new(&runner, Backend::UBoot);

        assert!(env.select_boot_partition(3).is_err());
    }
}
