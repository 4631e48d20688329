//! Bundle manifest (`plugin.conf`) and version predicates
//!
//! A manifest declares one or more plugin types, each carrying controller
//! specs. A spec pins its versions either exactly or to a closed range
//! with optional bounds.

use std::cmp::Ordering;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// The only plugin type the agent recognizes (compared case-insensitively).
pub const LIFECYCLE_PLUGIN_TYPE: &str = "lifecycle";

/// Which controller versions a bundle serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionPredicate {
    /// Exactly this version.
    Exact(String),
    /// Closed interval; a missing bound is open-ended.
    Range {
        from: Option<String>,
        to: Option<String>,
    },
}

impl VersionPredicate {
    pub fn matches(&self, version: &str) -> bool {
        match self {
            VersionPredicate::Exact(v) => compare_versions(v, version) == Ordering::Equal,
            VersionPredicate::Range { from, to } => {
                from.as_deref()
                    .map_or(true, |f| compare_versions(f, version) != Ordering::Greater)
                    && to
                        .as_deref()
                        .map_or(true, |t| compare_versions(t, version) != Ordering::Less)
            }
        }
    }
}

impl std::fmt::Display for VersionPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionPredicate::Exact(v) => write!(f, "={}", v),
            VersionPredicate::Range { from, to } => write!(
                f,
                "[{}, {}]",
                from.as_deref().unwrap_or("*"),
                to.as_deref().unwrap_or("*")
            ),
        }
    }
}

/// Compare dotted version strings segment by segment: numerically when
/// both segments parse as integers, lexicographically otherwise. Missing
/// segments count as zero, so "1.0" == "1.0.0".
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or("0");
        let r = right.get(i).copied().unwrap_or("0");
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(ln), Ok(rn)) => ln.cmp(&rn),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Registry key: which bundle implements a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub name: String,
    pub version: VersionPredicate,
    pub plugin_type: String,
}

/// One controller spec from the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSpec {
    pub name: String,
    #[serde(rename = "from-version", default)]
    pub from_version: String,
    #[serde(rename = "to-version", default)]
    pub to_version: String,
    #[serde(rename = "equals-version", default)]
    pub equals_version: String,
}

impl ControllerSpec {
    /// Collapse the manifest's three version fields into a predicate. A
    /// non-empty `equals-version` wins and matches exactly.
    pub fn predicate(&self) -> VersionPredicate {
        if !self.equals_version.is_empty() {
            VersionPredicate::Exact(self.equals_version.clone())
        } else {
            VersionPredicate::Range {
                from: non_empty(&self.from_version),
                to: non_empty(&self.to_version),
            }
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// One plugin type block from the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginTypeConf {
    #[serde(rename = "plugin-type")]
    pub plugin_type: String,
    pub controllers: Vec<ControllerSpec>,
}

/// The parsed `plugin.conf` manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConf {
    #[serde(rename = "plugin-types")]
    pub plugin_types: Vec<PluginTypeConf>,
}

impl PluginConf {
    /// Load and parse a manifest file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }
}
