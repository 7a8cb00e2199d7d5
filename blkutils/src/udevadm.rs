use std::process::Command;

use anyhow::{Context, Error};

use crate::exe::RunAndCheck;

/// Non-blocking settle check: asks udev whether its event queue is empty
/// right now (`-t 0` returns immediately). A failed execution is treated as
/// unsettled so callers defer rather than probing through a burst.
pub fn is_settled() -> bool {
    Command::new("udevadm")
        .args(["settle", "-t", "0"])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Block until the udev event queue settles.
pub fn settle() -> Result<(), Error> {
    Command::new("udevadm")
        .arg("settle")
        .run_and_check()
        .context("Failed to settle udev")
}

pub fn trigger() -> Result<(), Error> {
    Command::new("udevadm")
        .arg("trigger")
        .run_and_check()
        .context("Failed to trigger udev")
}

/// Arguments for a `udevadm monitor` stream restricted to block devices.
/// The caller owns process spawning so it can tie the child's lifetime to
/// its own event loop.
pub fn monitor_args() -> [&'static str; 3] {
    ["monitor", "--udev", "--subsystem-match=block"]
}

#[cfg(all(test, feature = "system-tests"))]
mod system_tests {
    use super::*;

    #[test]
    fn test_settle_cycle() {
        trigger().unwrap();
        settle().unwrap();
        assert!(is_settled());
    }
}
