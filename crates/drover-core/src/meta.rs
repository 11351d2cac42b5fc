//! Controller identity and metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifies a controller by kind and device id.
///
/// The name, `kind/id`, prefixes every bus topic the controller owns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerRef {
    /// Controller (robot) kind.
    pub kind: String,
    /// Unique device id.
    pub id: String,
}

impl ControllerRef {
    /// Creates a reference.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }

    /// The topic-prefix name, `kind/id`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }

    /// Valid when both fields are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.kind.is_empty() && !self.id.is_empty()
    }

    /// Topic the controller receives commands on.
    pub fn cmd_topic(&self) -> String {
        format!("{}/cmd", self.name())
    }

    /// Topic the controller publishes replies and events on.
    pub fn msg_topic(&self) -> String {
        format!("{}/msg", self.name())
    }

    /// Topic carrying the retained metadata.
    pub fn meta_topic(&self) -> String {
        format!("{}/meta", self.name())
    }
}

/// Descriptive metadata a controller publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerMeta {
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A discovered controller: its reference plus published metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerInfo {
    /// Who it is.
    pub reference: ControllerRef,
    /// What it says about itself.
    pub meta: ControllerMeta,
}
