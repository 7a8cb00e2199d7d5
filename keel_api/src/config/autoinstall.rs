use std::{fmt::Display, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    config::{actions::Action, guided::LayoutName},
    error::InvalidConfigurationError,
};

/// The unattended `storage:` intent document. Exactly one of `layout` and
/// `config` is honored; when both are present `layout` wins and the engine
/// surfaces a warning.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageAutoinstall {
    /// Guided layout request, resolved against probed hardware.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutSpec>,

    /// Literal, already-resolved action list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Vec<Action>>,
}

/// Guided layout request inside an unattended document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LayoutSpec {
    pub name: LayoutName,

    /// Raw mode string; validated against [`LayoutMode`] when the layout is
    /// applied so an unknown mode fails with `InvalidConfiguration` rather
    /// than a parse error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Disk selection criteria for `reformat_disk` mode.
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub disk_match: Option<DiskMatch>,
}

impl LayoutSpec {
    /// Resolve the mode string, defaulting to `reformat_disk`.
    pub fn mode(&self) -> Result<LayoutMode, InvalidConfigurationError> {
        match self.mode.as_deref() {
            None => Ok(LayoutMode::ReformatDisk),
            Some(s) => s.parse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    ReformatDisk,
    UseGap,
}

impl FromStr for LayoutMode {
    type Err = InvalidConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reformat_disk" => Ok(LayoutMode::ReformatDisk),
            "use_gap" => Ok(LayoutMode::UseGap),
            other => Err(InvalidConfigurationError::UnknownLayoutMode {
                mode: other.to_string(),
            }),
        }
    }
}

impl Display for LayoutMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LayoutMode::ReformatDisk => "reformat_disk",
            LayoutMode::UseGap => "use_gap",
        })
    }
}

/// Criteria used to pick the target disk for a reformat layout. All provided
/// criteria must match; `size` breaks remaining ties.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiskMatch {
    /// Glob pattern matched against the disk serial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Glob pattern matched against the disk model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Exact device path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<MatchSize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MatchSize {
    Largest,
    Smallest,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_layout_document() {
        let doc: StorageAutoinstall = serde_yaml::from_str(indoc! {r#"
            layout:
              name: lvm
              mode: use_gap
        "#})
        .unwrap();

        let layout = doc.layout.unwrap();
        assert_eq!(layout.name, LayoutName::Lvm);
        assert_eq!(layout.mode().unwrap(), LayoutMode::UseGap);
        assert!(doc.config.is_none());
    }

    #[test]
    fn test_mode_defaults_to_reformat() {
        let doc: StorageAutoinstall =
            serde_yaml::from_str("layout:\n  name: direct\n").unwrap();
        assert_eq!(
            doc.layout.unwrap().mode().unwrap(),
            LayoutMode::ReformatDisk
        );
    }

    #[test]
    fn test_unknown_mode_is_invalid_configuration() {
        let doc: StorageAutoinstall = serde_yaml::from_str(indoc! {r#"
            layout:
              name: lvm
              mode: resize
        "#})
        .unwrap();

        assert_eq!(
            doc.layout.unwrap().mode().unwrap_err(),
            InvalidConfigurationError::UnknownLayoutMode {
                mode: "resize".into()
            }
        );
    }

    #[test]
    fn test_disk_match_document() {
        let doc: StorageAutoinstall = serde_yaml::from_str(indoc! {r#"
            layout:
              name: lvm
              match:
                serial: "WD-*"
                size: largest
        "#})
        .unwrap();

        let matcher = doc.layout.unwrap().disk_match.unwrap();
        assert_eq!(matcher.serial.as_deref(), Some("WD-*"));
        assert_eq!(matcher.size, Some(MatchSize::Largest));
    }

    #[test]
    fn test_both_forms_parse() {
        // Precedence between the two is an engine decision; the document
        // itself may carry both.
        let doc: StorageAutoinstall = serde_yaml::from_str(indoc! {r#"
            layout:
              name: direct
            config:
              - type: disk
                id: disk-vda
                path: /dev/vda
                ptable: gpt
                preserve: false
        "#})
        .unwrap();
        assert!(doc.layout.is_some());
        assert_eq!(doc.config.unwrap().len(), 1);
    }
}
