//! Probe lifecycle: the prober boundary, the run-at-most-once task slots,
//! the coordinator driving safe/privileged probe passes, and the udev
//! change watcher that retriggers probing on device-topology changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{EnumIter, IntoStaticStr};

pub mod coordinator;
pub mod prober;
pub mod task;
pub mod watcher;

pub use coordinator::{ErrorAggregator, ProbeCoordinator};
pub use prober::LsblkProber;
pub use task::{RestartPolicy, SingleTask, StartOutcome};
pub use watcher::ChangeWatcher;

/// Hardware enumeration pass. `Safe` gathers everything that needs no
/// special privilege; `Privileged` is the block-device-only fallback used
/// when the safe pass fails. Iteration order is execution order.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProbeClass {
    Safe,
    Privileged,
}

/// External hardware-enumeration boundary. Implementations run off the
/// control flow (the coordinator wraps calls in `spawn_blocking`); the
/// returned payload is opaque JSON that only the model loader interprets.
pub trait Prober: Send + Sync {
    fn probe(&self, class: ProbeClass) -> anyhow::Result<Value>;
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_class_order_is_safe_first() {
        let order: Vec<ProbeClass> = ProbeClass::iter().collect();
        assert_eq!(order, vec![ProbeClass::Safe, ProbeClass::Privileged]);
    }

    #[test]
    fn test_class_names() {
        assert_eq!(<&str>::from(ProbeClass::Safe), "safe");
        assert_eq!(<&str>::from(ProbeClass::Privileged), "privileged");
    }
}
