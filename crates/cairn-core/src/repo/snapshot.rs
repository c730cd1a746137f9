use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::id::Id;

/// Metadata for a single snapshot, stored at `snapshots/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Utc>,
    pub hostname: String,
    /// Source paths that were backed up.
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Root tree blob.
    pub tree: Id,
    #[serde(default)]
    pub parent: Option<Id>,
}

impl Snapshot {
    pub fn new(tree: Id, paths: Vec<String>, hostname: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            hostname: hostname.into(),
            paths,
            tags: Vec::new(),
            tree,
            parent: None,
        }
    }
}
