//! Identity of one build run.
//!
//! Every temporary resource a build creates is named after the build id
//! and every produced artifact is tagged with it, so leftovers from a
//! crashed run can be traced back to the build that made them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Tag key carrying the build id on produced artifacts.
pub const BUILD_ID_TAG: &str = "imageforge:build-id";

/// Tag key carrying the build start time on produced artifacts.
pub const BUILD_TIME_TAG: &str = "imageforge:build-time";

/// Unique identity of a build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdentity {
    /// Random build id.
    pub build_id: Uuid,
    /// When the build was created.
    pub started_at: DateTime<Utc>,
}

impl Default for BuildIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildIdentity {
    /// Creates a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            build_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    /// Returns the name for a temporary resource of the given kind,
    /// e.g. `imageforge_key_pair_<id>`.
    #[must_use]
    pub fn temporary_name(&self, kind: &str) -> String {
        format!("imageforge_{kind}_{}", self.build_id.simple())
    }

    /// Returns the tags identifying artifacts of this build.
    #[must_use]
    pub fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (BUILD_ID_TAG.to_string(), self.build_id.to_string()),
            (BUILD_TIME_TAG.to_string(), self.started_at.to_rfc3339()),
        ])
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "build_id".to_string(),
            serde_json::json!(self.build_id.to_string()),
        );
        map.insert(
            "started_at".to_string(),
            serde_json::json!(self.started_at.to_rfc3339()),
        );
        map
    }
}
