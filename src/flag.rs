use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A feature flag definition as known locally.
///
/// Only `key`, `version` and `deleted` are interpreted by the cache. The rest
/// is carried through unmodified, and fields this struct does not declare are
/// kept in `extra` so that re-serialising a record never drops server data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRecord {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallthrough: Option<Fallthrough>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What a flag serves when it is on and no target or rule matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fallthrough {
    Variation { variation: usize },
    Rollout { rollout: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

impl FlagRecord {
    /// A bare record carrying only a key and version.
    pub fn new(key: &str, version: u64) -> Self {
        Self {
            key: key.to_string(),
            version,
            deleted: false,
            on: false,
            variations: Vec::new(),
            fallthrough: None,
            off_variation: None,
            targets: Vec::new(),
            rules: Vec::new(),
            prerequisites: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Marker retained for a deleted key so stale updates can be rejected.
    pub fn tombstone(key: &str, version: u64) -> Self {
        Self {
            deleted: true,
            ..Self::new(key, version)
        }
    }

    pub fn variation(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }

    /// The value served while the flag is off, if an off variation is set.
    pub fn off_value(&self) -> Option<&Value> {
        self.off_variation.and_then(|i| self.variation(i))
    }

    /// The value served by the fallthrough when it names a single variation.
    /// Rollouts depend on the evaluation context and return `None`.
    pub fn fallthrough_value(&self) -> Option<&Value> {
        match self.fallthrough {
            Some(Fallthrough::Variation { variation }) => self.variation(variation),
            _ => None,
        }
    }
}
