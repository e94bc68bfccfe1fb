//! Well-known state keys shared between steps.

use super::{StateBag, StateKey};
use crate::errors::BuildError;
use crate::identity::BuildIdentity;
use crate::provider::{ImageInfo, InstanceInfo, KeyPair};
use std::collections::BTreeMap;

/// The error a halting step recorded.
pub const ERROR: StateKey<BuildError> = StateKey::new("error");

/// Set by the runner when the build was cancelled; holds the reason.
pub const CANCELLED: StateKey<String> = StateKey::new("cancelled");

/// Identity of the running build.
pub const BUILD: StateKey<BuildIdentity> = StateKey::new("build");

/// The resolved source image.
pub const SOURCE_IMAGE: StateKey<ImageInfo> = StateKey::new("source_image");

/// The key pair the worker instance is launched with.
pub const KEY_PAIR: StateKey<KeyPair> = StateKey::new("key_pair");

/// Security group ids attached to the worker instance.
pub const SECURITY_GROUPS: StateKey<Vec<String>> = StateKey::new("security_groups");

/// The worker instance.
pub const INSTANCE: StateKey<InstanceInfo> = StateKey::new("instance");

/// Produced images, region to image id.
pub const IMAGES: StateKey<BTreeMap<String, String>> = StateKey::new("images");

/// Snapshots backing the produced images, region to snapshot ids.
pub const SNAPSHOTS: StateKey<BTreeMap<String, Vec<String>>> = StateKey::new("snapshots");

/// Returns true once the run has halted or been cancelled.
///
/// Cleanup code uses this to decide whether produced artifacts are kept.
#[must_use]
pub fn build_failed(state: &StateBag) -> bool {
    state.contains(ERROR.name()) || state.contains(CANCELLED.name())
}
