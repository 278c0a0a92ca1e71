//! Process execution used for bootloader tools, mounting and host control.

use std::{io, process::Command};

use thiserror::Error;

/// Reasons an external command did not give a usable result.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0}: command not found")]
    NotFound(String),
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Unparseable output from {0}")]
    Unparseable(String),
}

/// Runs external programs on the device.
pub trait CommandRunner {
    /// Run `program` to completion and return its captured standard output.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError>;

    /// Check whether `program` can be found in `PATH`.
    fn exists(&self, program: &str) -> bool {
        self.run("which", &[program]).is_ok()
    }
}

/// [CommandRunner] spawning real processes with [std::process::Command].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        tracing::debug!("Running {program} {}", args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => CommandError::NotFound(program.to_string()),
                _ => CommandError::Spawn {
                    program: program.to_string(),
                    source: e,
                },
            })?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout).map_err(|_| CommandError::Unparseable(program.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_not_found() {
        let res = SystemRunner.run("bb-bootval-surely-missing-program", &[]);
        assert!(matches!(res, Err(CommandError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_failed() {
        let res = SystemRunner.run("false", &[]);
        assert!(matches!(res, Err(CommandError::Failed { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout() {
        let out = SystemRunner.run("echo", &["bootcount=1"]).unwrap();
        assert_eq!(out.trim(), "bootcount=1");
    }
}
