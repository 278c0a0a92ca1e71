//! The validation state machine, run once per boot.
//!
//! Each run evaluates the step whose preconditions were prepared before the last reboot,
//! advances, prepares the next step and reboots so the bootloader can act on the new
//! environment. A failed evaluation or preparation, or reaching [Step::End], finalizes the
//! sequence instead.

use std::fmt;

use crate::{
    Backend, BootEnv, CommandRunner, DeviceConfig, Error, FaultInjector, Layout, Partition, Result,
    Root, StateStore, Step, SystemProbe,
    bootenv::{BOOTCOUNT, UPGRADE_AVAILABLE},
    identify_mounted_root,
};

/// Systemd unit that invokes the validation on every boot.
pub const DEFAULT_SERVICE: &str = "mender-bootloader-validation.service";

/// Recorded when preparation completes on a kernel that reports no boot id.
const UNKNOWN_BOOT: &str = "unknown";

/// Result of a step check. The error is the human readable failure reason.
type Check = std::result::Result<(), String>;

/// Final result of a validation sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Failure(reason) => write!(f, "FAILURE - {reason}"),
        }
    }
}

/// What a single invocation ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Reboot issued. `awaiting` is evaluated by the next invocation.
    Rebooting { awaiting: Step },
    /// Sequence is over: the service is disabled and the state deleted.
    Finished(Verdict),
}

/// One invocation of the validation sequence on a device.
#[derive(Debug)]
pub struct Sequence<'a, R, P> {
    layout: &'a Layout,
    runner: &'a R,
    probe: &'a P,
    service: String,
}

impl<'a, R: CommandRunner, P: SystemProbe> Sequence<'a, R, P> {
    pub fn new(layout: &'a Layout, runner: &'a R, probe: &'a P) -> Self {
        Self {
            layout,
            runner,
            probe,
            service: DEFAULT_SERVICE.to_string(),
        }
    }

    /// Use a different systemd unit than [DEFAULT_SERVICE].
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.service = name.into();
        self
    }

    /// Run evaluate, advance, prepare and decide.
    ///
    /// Errors are fatal and leave the device untouched: no reboot is issued and the service stays
    /// enabled.
    pub fn run(&self) -> Result<Outcome> {
        let config = DeviceConfig::load(self.layout)?;
        tracing::info!("Using configuration {:?}", config);

        let mut store = StateStore::open(self.layout.state_file())?;
        store.state().check_config(&config)?;
        tracing::info!("Loaded state {:?}", store.state());

        let boot_id = self.probe.boot_id();
        let step = store.state().step;
        let prepared = store.state().prepared_boot.is_some();

        match step {
            Some(step) if boot_id.is_some() && store.state().prepared_boot == boot_id => {
                tracing::warn!("{step} was prepared during this boot, rebooting again");
                return self.reboot(store, step);
            }
            _ => {}
        }

        let current = identify_mounted_root(
            self.probe,
            self.layout.root(),
            &config.rootfs_a,
            &config.rootfs_b,
        );

        let interrupted = match step {
            Some(Step::None) | None => None,
            Some(step) if !prepared => Some(step),
            Some(_) => None,
        };

        let step = match interrupted {
            Some(step) => {
                tracing::warn!("Preparation of {step} was interrupted, repeating it");
                step
            }
            None => {
                let check = self.evaluate(&mut store, &config, current)?;
                if let Err(reason) = check {
                    tracing::info!("{reason}");
                    return self.finalize(store, Some(reason));
                }
                self.advance(&mut store)?
            }
        };

        match self.prepare(&mut store, step, current)? {
            Err(reason) => {
                tracing::info!("{reason}");
                self.finalize(store, Some(reason))
            }
            Ok(()) if step.is_terminal() => self.finalize(store, None),
            Ok(()) => {
                let mut tx = store.transaction();
                tx.prepared_boot = Some(boot_id.unwrap_or_else(|| UNKNOWN_BOOT.to_string()));
                tx.commit()?;

                self.reboot(store, step)
            }
        }
    }

    /// Disable the service and delete the state without evaluating anything.
    pub fn abort(&self) -> Result<()> {
        tracing::info!("Aborting validation");
        self.disable_service();
        StateStore::open(self.layout.state_file())?.clear()
    }

    fn env(&self, store: &StateStore) -> Result<BootEnv<'a, R>> {
        let state = store.state();
        let backend = state.backend().ok_or_else(|| {
            Error::ConfigConsistency(format!(
                "unrecognized bootloader environment tools {:?}/{:?}",
                state.set_cmd, state.print_cmd
            ))
        })?;

        Ok(BootEnv::new(self.runner, backend))
    }

    /// Check the outcome of the step prepared before the last reboot.
    fn evaluate(
        &self,
        store: &mut StateStore,
        config: &DeviceConfig,
        current: Root,
    ) -> Result<Check> {
        let Some(step) = store.state().step else {
            tracing::info!("Initializing persistent state");
            let backend = Backend::detect(self.runner);
            let mut tx = store.transaction();
            tx.initialize(config, backend);
            tx.commit()?;
            tracing::info!("Resulting in {:?}", store.state());
            return Ok(Ok(()));
        };

        tracing::info!("Starting evaluation of step {step}");
        let expected = store.state().expected_root;
        let reached_expected = current != Root::Undefined && expected == Some(current);
        let expected = expected.unwrap_or(Root::Undefined);

        let check = match step {
            Step::None | Step::Init | Step::End => Ok(()),
            Step::TestSwitch => {
                if reached_expected {
                    tracing::info!("Switch test successful");
                    Ok(())
                } else {
                    Err("switch test failed".to_string())
                }
            }
            Step::TestUpdate => {
                let env = self.env(store)?;

                if !reached_expected {
                    Err(format!("update test did not match expected root: {expected}"))
                } else if !env.check(BOOTCOUNT, "1") {
                    Err(format!("failed {BOOTCOUNT} assertion"))
                } else if !env.check(UPGRADE_AVAILABLE, "1") {
                    Err(format!("failed {UPGRADE_AVAILABLE} assertion"))
                } else {
                    commit_update(&env).inspect(|_| tracing::info!("Update test successful"))
                }
            }
            Step::TestRollback => {
                let env = self.env(store)?;

                // Trust the bootloader to have reverted by itself, only its end state is checked
                if !env.check(UPGRADE_AVAILABLE, "0") {
                    Err(format!("failed {UPGRADE_AVAILABLE} assertion"))
                } else if !reached_expected {
                    Err(format!("rollback test did not match expected root: {expected}"))
                } else {
                    commit_update(&env).inspect(|_| tracing::info!("Rollback test successful"))
                }
            }
        };

        tracing::info!("Ending evaluation of step {step}");
        Ok(check)
    }

    fn advance(&self, store: &mut StateStore) -> Result<Step> {
        let from = store.state().step.unwrap_or_default();
        tracing::info!("Proceeding to next step from {from}");

        let mut tx = store.transaction();
        let next = from.next();
        tx.step = Some(next);
        tx.prepared_boot = None;
        tx.commit()?;

        tracing::info!("New step is {next}");
        Ok(next)
    }

    /// Set up the preconditions `step` is evaluated against after the next reboot.
    fn prepare(&self, store: &mut StateStore, step: Step, current: Root) -> Result<Check> {
        tracing::info!("Starting preparation of step {step}");

        let check = match step {
            Step::None => Ok(()),
            Step::Init => {
                self.log_system_info();
                Ok(())
            }
            Step::TestSwitch | Step::TestUpdate | Step::TestRollback => {
                let env = self.env(store)?;
                let Some(inactive) = store.state().inactive(current) else {
                    let test = match step {
                        Step::TestSwitch => "switch",
                        Step::TestUpdate => "update",
                        _ => "rollback",
                    };
                    return Ok(Err(format!(
                        "could not identify partition numbers for {test}, aborting"
                    )));
                };

                match step {
                    Step::TestSwitch => {
                        record_expected(store, inactive.root)?;
                        select(&env, &inactive)
                    }
                    Step::TestUpdate => {
                        record_expected(store, inactive.root)?;
                        arm_update(&env).and_then(|_| select(&env, &inactive))
                    }
                    _ => {
                        // The bootloader is expected to fall back to the running partition
                        record_expected(store, current)?;
                        FaultInjector::new(self.runner, env)
                            .inject(&inactive)
                            .map_err(|e| e.to_string())
                    }
                }
            }
            Step::End => {
                tracing::info!("Ending");
                Ok(())
            }
        };

        tracing::info!("Ending preparation of step {step}");
        Ok(check)
    }

    fn reboot(&self, store: StateStore, awaiting: Step) -> Result<Outcome> {
        tracing::info!("Rebooting to evaluate {awaiting}");

        match self.runner.run("reboot", &[]) {
            Ok(_) => Ok(Outcome::Rebooting { awaiting }),
            Err(e) => self.finalize(store, Some(format!("failed to reboot: {e}"))),
        }
    }

    fn finalize(&self, store: StateStore, reason: Option<String>) -> Result<Outcome> {
        self.disable_service();
        store.clear()?;

        let verdict = match reason {
            None => Verdict::Success,
            Some(reason) => Verdict::Failure(reason),
        };
        tracing::info!("BOOTLOADER VALIDATION: {verdict}");

        Ok(Outcome::Finished(verdict))
    }

    fn disable_service(&self) {
        if let Err(e) = self.runner.run("systemctl", &["disable", &self.service]) {
            tracing::warn!("Failed to disable {}: {e}", self.service);
        }
    }

    fn log_system_info(&self) {
        tracing::info!("Gathering some system information");

        match self.runner.run("uname", &["-a"]) {
            Ok(x) => tracing::info!("uname -a: {}", x.trim()),
            Err(e) => tracing::warn!("uname -a: {e}"),
        }

        let os_release = self.layout.os_release();
        match std::fs::read_to_string(&os_release) {
            Ok(x) => tracing::info!("{:?}:\n{x}", os_release),
            Err(e) => tracing::warn!("{:?}: {e}", os_release),
        }
    }
}

/// Record the root the next evaluation must observe. Durable before the bootloader is touched.
fn record_expected(store: &mut StateStore, root: Root) -> Result<()> {
    let mut tx = store.transaction();
    tx.expected_root = Some(root);
    tx.commit()
}

fn select<R: CommandRunner>(env: &BootEnv<'_, R>, target: &Partition) -> Check {
    env.select_boot_partition(target.number)
        .map_err(|e| format!("failed to set boot partition {}: {e}", target.root))
}

/// Mark the selected partition as an update awaiting its commit.
fn arm_update<R: CommandRunner>(env: &BootEnv<'_, R>) -> Check {
    set_all(env, [(BOOTCOUNT, "0"), (UPGRADE_AVAILABLE, "1")])
}

/// Clear the update markers after a confirmed boot.
fn commit_update<R: CommandRunner>(env: &BootEnv<'_, R>) -> Check {
    set_all(env, [(BOOTCOUNT, "0"), (UPGRADE_AVAILABLE, "0")])
}

fn set_all<R: CommandRunner>(env: &BootEnv<'_, R>, vars: [(&str, &str); 2]) -> Check {
    vars.into_iter().try_for_each(|(name, value)| {
        env.set(name, value)
            .map_err(|e| format!("failed to set {name}: {e}"))
    })
}
