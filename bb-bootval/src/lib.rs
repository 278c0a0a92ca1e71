//! Validate an A/B dual-partition bootloader on a real device. Powers the `bb-bootval` service
//! which runs once per boot.
//!
//! Three behaviours are exercised, each of which can only be observed after a reboot:
//!
//! - a commanded switch of the active root partition,
//! - a simulated update that must be committed after booting the new partition,
//! - an automatic rollback when the freshly selected partition cannot boot.
//!
//! Every invocation evaluates the step prepared by the previous boot, advances to the next step,
//! prepares its preconditions in the bootloader environment and reboots. Progress lives in a
//! single JSON record which is durably written before any action that depends on it, so an
//! uncontrolled power cycle resumes the sequence where it left off.
//!
//! # Usage
//!
//! ```no_run
//! use bb_bootval::{Layout, LinuxProbe, Sequence, SystemRunner};
//!
//! let layout = Layout::default();
//! let outcome = Sequence::new(&layout, &SystemRunner, &LinuxProbe)
//!     .run()
//!     .expect("fatal error");
//! println!("{outcome:?}");
//! ```

mod bootenv;
mod command;
mod config;
mod error;
mod fault;
mod layout;
mod probe;
mod sequence;
mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bootenv::{Backend, BootEnv};
pub use command::{CommandError, CommandRunner, SystemRunner};
pub use config::{DeviceConfig, PartialConfig};
pub use error::{Error, Result};
pub use fault::{FaultError, FaultInjector};
pub use layout::Layout;
pub use probe::{LinuxProbe, Root, SystemProbe, identify_mounted_root};
pub use sequence::{DEFAULT_SERVICE, Outcome, Sequence, Verdict};
pub use state::{Partition, PersistentState, StateStore, Step, Transaction};
