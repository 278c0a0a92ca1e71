use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Opt {
    #[command(subcommand)]
    /// Specifies the subcommand to execute. Defaults to `run`.
    pub command: Option<Commands>,

    #[arg(long, default_value = "/")]
    /// Root directory of the running system.
    pub root: PathBuf,

    #[arg(long, default_value = "data")]
    /// Persistent data directory, relative to `root`. Holds the state and the log.
    pub data_dir: PathBuf,

    #[arg(long, default_value = bb_bootval::DEFAULT_SERVICE)]
    /// Systemd unit which invokes the validation on boot.
    pub service: String,

    #[arg(long)]
    /// Append the log here instead of `validation.log` in the data directory.
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum Commands {
    /// Evaluate the last step, prepare the next one and reboot.
    Run,
    /// Print the progress of the running validation.
    Status,
    /// Stop the running validation and disable the service.
    Abort,
}
