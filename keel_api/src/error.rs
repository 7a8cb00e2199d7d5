use std::borrow::Cow;
use std::fmt::{Debug, Write};
use std::panic::Location;

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// A geometry request the model cannot satisfy: size, alignment, or overlap
/// violations. Caller error, never retried.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidGeometryError {
    #[error("Requested size {requested} exceeds the {available} bytes available in the gap")]
    PartitionTooLarge { requested: u64, available: u64 },
    #[error("Requested size {requested} is below the partition minimum of {minimum}")]
    BelowPartitionMinimum { requested: u64, minimum: u64 },
    #[error("Resized partition would end at {end}, past the boundary at {boundary}")]
    OverlapsBoundary { end: u64, boundary: u64 },
    #[error("Aligned size {requested} exceeds the current partition size {current}")]
    EnlargesPartition { requested: u64, current: u64 },
    #[error("Cannot split {size} bytes off a gap of {available}")]
    SplitTooLarge { size: u64, available: u64 },
    #[error("Offset {offset} is not a multiple of the {alignment} byte alignment unit")]
    Misaligned { offset: u64, alignment: u64 },
    #[error("No free partition number left on disk '{disk}'")]
    PartitionNumbersExhausted { disk: String },
}

/// A referenced entity is absent from the model. Caller error.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum NotFoundError {
    #[error("No disk '{id}' in the probed model")]
    Disk { id: String },
    #[error("No partition {number} on disk '{disk}'")]
    Partition { disk: String, number: u32 },
    #[error("No gap at offset {offset} on disk '{disk}'")]
    Gap { disk: String, offset: u64 },
    #[error("No volume group named '{name}'")]
    VolumeGroup { name: String },
    #[error("No disk matched the requested criteria")]
    NoMatchingDisk,
    #[error("No gap large enough for the install payload")]
    NoGapLargeEnough,
}

/// An explicitly requested name collides with an existing one.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum NameConflictError {
    #[error("Volume group '{name}' already exists")]
    VolumeGroup { name: String },
    #[error("Volume group '{vg}' already has a logical volume '{name}'")]
    LogicalVolume { vg: String, name: String },
}

/// Internal consistency failure between gap derivation and a mutation that
/// should always succeed. Fatal for the current operation.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum InvariantViolationError {
    #[error("No gap found after resizing partition {number} on disk '{disk}'")]
    MissingGapAfterResize { disk: String, number: u32 },
    #[error("Failed to locate the install gap after adding the boot partition on disk '{disk}'")]
    MissingGapAfterBoot { disk: String },
    #[error("Model invariant violated: {0}")]
    Internal(String),
}

/// A run-at-most-once task slot refused a start request. Advisory, not fatal.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum AlreadyRunningError {
    #[error("Task '{name}' is already running")]
    Task { name: String },
}

/// Hardware enumeration failed. Recorded per probe class, surfaced only when
/// a caller asks for storage status.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeFailureError {
    #[error("Probe execution failed: {message}")]
    Execution { message: String },
    #[error("Probe timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
    #[error("Failed to load probe data into the storage model: {message}")]
    LoadSnapshot { message: String },
}

/// Malformed unattended storage intent. Fatal, aborts unattended
/// configuration.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidConfigurationError {
    #[error("Unknown layout mode '{mode}'")]
    UnknownLayoutMode { mode: String },
    #[error("Unknown layout name '{name}'")]
    UnknownLayoutName { name: String },
    #[error("Failed to parse the storage section")]
    ParseStorageSection,
    #[error("Unattended storage configuration did not mount a root filesystem")]
    RootNotMounted,
    #[error("Unattended storage configuration did not create the needed boot partition")]
    MissingBootPartition,
}

/// Each variant is one category of the storage error taxonomy. Categories are
/// caller-meaningful: they decide whether an operation is retried, surfaced,
/// or aborts the run.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq, Clone)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    InvalidGeometry(#[from] InvalidGeometryError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    NameConflict(#[from] NameConflictError),

    #[error(transparent)]
    InvariantViolation(#[from] InvariantViolationError),

    #[error(transparent)]
    AlreadyRunning(#[from] AlreadyRunningError),

    #[error(transparent)]
    ProbeFailure(#[from] ProbeFailureError),

    #[error(transparent)]
    InvalidConfiguration(#[from] InvalidConfigurationError),
}

#[derive(Debug)]
struct StorageErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

/// The caller-visible error type: a taxonomy kind plus the location that
/// raised it and any context messages attached on the way up.
pub struct StorageError(Box<StorageErrorInner>);

impl StorageError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        StorageError(Box::new(StorageErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Flatten into an unstructured error chain for callers that only log.
    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }
}

pub trait ReportError<T, K> {
    /// Convert this error (or absence) into a structured StorageError.
    fn structured(self, kind: K) -> Result<T, StorageError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, StorageError> {
        match self {
            Some(t) => Ok(t),
            None => Err(StorageError(Box::new(StorageErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, StorageError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(StorageError(Box::new(StorageErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait StorageResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, StorageError>;
}

impl<T> StorageResultExt<T> for Result<T, StorageError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, StorageError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

impl Serialize for StorageError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("storage-error", 4)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{e:?}")))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                writeln!(
                    f,
                    "{i: >5}: {context} at {}:{}",
                    location.file(),
                    location.line()
                )?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                writeln!(f, "{index: >5}: {e}")?;
                source = e.source();
                index += 1;
            }
            f.write_char('\n')?;
        }
        Ok(())
    }
}

impl<K: Into<ErrorKind>> From<K> for StorageError {
    #[track_caller]
    fn from(kind: K) -> Self {
        StorageError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_kind_category_names() {
        let kind = ErrorKind::from(NotFoundError::Disk { id: "sda".into() });
        assert_eq!(<&str>::from(&kind), "not-found");

        let kind = ErrorKind::from(InvalidGeometryError::PartitionTooLarge {
            requested: 10,
            available: 5,
        });
        assert_eq!(<&str>::from(&kind), "invalid-geometry");

        let kind = ErrorKind::from(AlreadyRunningError::Task {
            name: "probe".into(),
        });
        assert_eq!(<&str>::from(&kind), "already-running");
    }

    #[test]
    fn test_error_serialize() {
        let err = std::fs::read("/nonexistent-keel-test-file")
            .context("Failed to read file")
            .structured(ProbeFailureError::Execution {
                message: "enumeration failed".into(),
            })
            .unwrap_err();

        let yaml = serde_yaml::to_string(&err).unwrap();
        let value: Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            value.get("category").and_then(Value::as_str),
            Some("probe-failure")
        );
        assert_eq!(
            value.get("message").and_then(Value::as_str),
            Some("Probe execution failed: enumeration failed")
        );
        assert!(value
            .get("location")
            .and_then(Value::as_str)
            .unwrap()
            .contains("error.rs"));
        assert!(value
            .get("cause")
            .and_then(Value::as_str)
            .unwrap()
            .contains("Failed to read file"));
    }

    #[test]
    fn test_message_context_chain() {
        let err: Result<(), StorageError> = Err(StorageError::new(NotFoundError::Partition {
            disk: "disk-vda".into(),
            number: 3,
        }));
        let err = err
            .message("Failed to apply guided resize")
            .map(|_| ())
            .unwrap_err();

        let rendered = format!("{err:?}");
        assert!(rendered.contains("No partition 3 on disk 'disk-vda'"));
        assert!(rendered.contains("Failed to apply guided resize"));
    }

    #[test]
    fn test_option_structured() {
        let missing: Option<u32> = None;
        let err = missing
            .structured(NotFoundError::VolumeGroup {
                name: "ubuntu-vg".into(),
            })
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::NotFound(NotFoundError::VolumeGroup {
                name: "ubuntu-vg".into()
            })
        );
    }
}
