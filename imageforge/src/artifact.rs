//! The result of a successful build.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::errors::BuildError;
use crate::state::{keys, StateBag};

/// Images produced by a build, one per region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The build that produced the images.
    pub build_id: Uuid,
    /// Image id by region.
    pub images: BTreeMap<String, String>,
    /// Snapshot ids backing each region's image.
    pub snapshots: BTreeMap<String, Vec<String>>,
}

impl Artifact {
    /// Reads the artifact from a completed build's state bag.
    ///
    /// # Errors
    ///
    /// Returns a state error if the build identity or the image map is
    /// missing.
    pub fn from_state(state: &StateBag) -> Result<Self, BuildError> {
        Ok(Self {
            build_id: state.get(&keys::BUILD)?.build_id,
            images: state.get(&keys::IMAGES)?.clone(),
            snapshots: state.get_opt(&keys::SNAPSHOTS)?.cloned().unwrap_or_default(),
        })
    }

    /// Returns the image id in `region`.
    #[must_use]
    pub fn image(&self, region: &str) -> Option<&str> {
        self.images.get(region).map(String::as_str)
    }

    /// Returns the regions holding an image, sorted.
    #[must_use]
    pub fn regions(&self) -> Vec<&str> {
        self.images.keys().map(String::as_str).collect()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("build_id".to_string(), serde_json::json!(self.build_id.to_string()));
        map.insert("images".to_string(), serde_json::json!(self.images));
        map.insert("snapshots".to_string(), serde_json::json!(self.snapshots));
        map
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Images were created:")?;
        for (region, image_id) in &self.images {
            write!(f, "\n{region}: {image_id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BuildIdentity;

    fn completed_state() -> (StateBag, Uuid) {
        let identity = BuildIdentity::new();
        let id = identity.build_id;
        let mut state = StateBag::new();
        state.put(&keys::BUILD, identity).unwrap();
        state
            .put(
                &keys::IMAGES,
                BTreeMap::from([
                    ("us-east-1".to_string(), "ami-1".to_string()),
                    ("eu-west-1".to_string(), "ami-2".to_string()),
                ]),
            )
            .unwrap();
        (state, id)
    }

    #[test]
    fn test_from_state() {
        let (state, id) = completed_state();
        let artifact = Artifact::from_state(&state).unwrap();

        assert_eq!(artifact.build_id, id);
        assert_eq!(artifact.image("us-east-1"), Some("ami-1"));
        assert_eq!(artifact.regions(), vec!["eu-west-1", "us-east-1"]);
        assert!(artifact.snapshots.is_empty());
    }

    #[test]
    fn test_missing_images_is_an_error() {
        let mut state = StateBag::new();
        state.put(&keys::BUILD, BuildIdentity::new()).unwrap();

        let err = Artifact::from_state(&state).unwrap_err();
        assert!(matches!(err, BuildError::State(_)));
    }

    #[test]
    fn test_display_lists_regions() {
        let (state, _) = completed_state();
        let text = Artifact::from_state(&state).unwrap().to_string();

        assert_eq!(text, "Images were created:\neu-west-1: ami-2\nus-east-1: ami-1");
    }

    #[test]
    fn test_to_dict() {
        let (state, id) = completed_state();
        let dict = Artifact::from_state(&state).unwrap().to_dict();

        assert_eq!(dict["build_id"], serde_json::json!(id.to_string()));
        assert_eq!(dict["images"]["eu-west-1"], "ami-2");
    }
}
