use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, Output},
};

use anyhow::{anyhow, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Extension for `std::process::Output` to check status and produce anyhow
/// errors carrying the captured output. Sealed, crate-internal trait.
pub trait OutputChecker: Sealed {
    fn is_success(&self) -> bool;

    fn exit_code(&self) -> Option<i32>;

    fn end_signal(&self) -> Option<i32>;

    /// Get stdout.
    fn output(&self) -> String;

    /// Get stderr.
    fn error_output(&self) -> String;

    /// All captured output, for reporting.
    fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);
        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }
        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }
        res
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.exit_code() {
            format!("Process exited with status: {code}")
        } else if let Some(signal) = self.end_signal() {
            format!("Process was terminated by signal: {signal}")
        } else {
            "Process exited with unknown status".to_string()
        }
    }

    /// Succeed or produce an error with the captured output attached.
    fn check(&self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }

        Err(match self.output_report() {
            s if !s.is_empty() => anyhow!("Process output:\n{s}").context(self.explain_exit()),
            _ => anyhow!("(No output was captured)").context(self.explain_exit()),
        })
    }
}

impl Sealed for Output {}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn end_signal(&self) -> Option<i32> {
        self.status.signal()
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }

    fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }
}

/// Extension for `std::process::Command`: run, check, and capture in one go.
pub trait RunAndCheck: Sealed {
    /// Run and require a zero exit status.
    fn run_and_check(&mut self) -> Result<(), Error>;

    /// Run, require a zero exit status, and return stdout.
    fn output_and_check(&mut self) -> Result<String, Error>;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        trace!("Running: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("Failed to start {:?}", self.get_program()))?;
        output.check()
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        trace!("Running: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("Failed to start {:?}", self.get_program()))?;
        output.check()?;
        Ok(output.output())
    }
}
