//! Resource descriptions exchanged with the provider.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a machine image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    /// Still being created or copied.
    Pending,
    /// Ready to launch.
    Available,
    /// Creation failed.
    Failed,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Available => write!(f, "available"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A machine image in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image id.
    pub id: String,
    /// Image name, unique per region and account.
    pub name: String,
    /// Region the image lives in.
    pub region: String,
    /// Lifecycle state.
    pub state: ImageState,
    /// Snapshots backing the image.
    pub snapshot_ids: Vec<String>,
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Booting.
    Pending,
    /// Up.
    Running,
    /// Shutting down towards stopped.
    Stopping,
    /// Stopped, volumes retained.
    Stopped,
    /// Shutting down towards terminated.
    ShuttingDown,
    /// Gone.
    Terminated,
}

impl InstanceState {
    /// Returns true for states the instance never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// A compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Instance id.
    pub id: String,
    /// Region the instance runs in.
    pub region: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Public address, once assigned.
    pub public_ip: Option<String>,
}

/// An SSH key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Key pair name.
    pub name: String,
    /// Private key material; only present for key pairs created by this build.
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    /// True if this build created the key pair and owns its deletion.
    pub temporary: bool,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("temporary", &self.temporary)
            .finish()
    }
}

/// Parameters for launching the worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Region to launch in.
    pub region: String,
    /// Image to boot from.
    pub source_image: String,
    /// Instance type, e.g. `t3.micro`.
    pub instance_type: String,
    /// Key pair name.
    pub key_name: String,
    /// Security groups to attach.
    pub security_group_ids: Vec<String>,
    /// Tags applied at launch.
    pub tags: BTreeMap<String, String>,
    /// Idempotency token; repeated requests with the same token launch
    /// one instance.
    #[serde(default)]
    pub client_token: Option<String>,
}
