//! Fault-reporting handoff: raw probe payloads are handed to a sink before
//! they are applied to the model, so a crash report can always include what
//! the hardware looked like.

use std::path::PathBuf;

use log::{debug, warn};
use serde_json::Value;

use keel_api::constants::{PROBE_DATA_FILE, PROBE_DATA_RESTRICTED_FILE};

use crate::probe::ProbeClass;

/// Collaborator persisting probe payloads for fault reporting. Failures are
/// the sink's problem; the handoff must never fail a probe run.
pub trait DiagnosticsSink: Send + Sync {
    fn note_probe_payload(&self, class: ProbeClass, payload: &Value);
}

/// Writes payloads as JSON files under a report directory.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSink { dir: dir.into() }
    }

    fn artifact_name(class: ProbeClass) -> &'static str {
        match class {
            ProbeClass::Safe => PROBE_DATA_FILE,
            ProbeClass::Privileged => PROBE_DATA_RESTRICTED_FILE,
        }
    }
}

impl DiagnosticsSink for FileSink {
    fn note_probe_payload(&self, class: ProbeClass, payload: &Value) {
        let path = self.dir.join(Self::artifact_name(class));
        let serialized = match serde_json::to_string_pretty(payload) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to serialize probe payload for diagnostics: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&self.dir)
            .and_then(|()| std::fs::write(&path, serialized))
        {
            warn!(
                "failed to persist probe payload to {}: {e}",
                path.display()
            );
            return;
        }
        debug!("noted probe payload at {}", path.display());
    }
}

/// Discards payloads; used where no report directory is configured.
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn note_probe_payload(&self, _class: ProbeClass, _payload: &Value) {}
}
