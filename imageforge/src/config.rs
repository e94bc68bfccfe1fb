//! Build configuration.
//!
//! A [`BuildConfig`] is deserialized from JSON, validated once, and then
//! shared read-only by every step of the build.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::pipeline::RunnerConfig;
use crate::replication::ReplicationConfig;
use crate::retry::RetryPolicy;
use crate::waiter::WaitConfig;

fn default_instance_type() -> String {
    "t3.micro".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_cidr() -> String {
    "0.0.0.0/0".to_string()
}

fn default_cleanup_timeout_ms() -> u64 {
    600_000
}

fn default_cancel_grace_ms() -> u64 {
    30_000
}

static IMAGE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9()\[\] ./'@_-]{3,128}$").expect("image name regex is valid")
});

static CIDR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})/(\d{1,2})$")
        .expect("cidr regex is valid")
});

static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2,}(-[a-z0-9]+)+$").expect("region regex is valid"));

/// Everything a build needs to know up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Name of the produced image. Must be unique in every target region.
    pub image_name: String,

    /// Image the worker instance boots from.
    pub source_image: String,

    /// Region the build runs in.
    pub region: String,

    /// Worker instance type.
    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// Regions the finished image is copied to.
    #[serde(default)]
    pub copy_regions: Vec<String>,

    /// Extra tags applied to the image and its snapshots.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Existing key pair to launch with; a temporary one is created if unset.
    #[serde(default)]
    pub key_pair_name: Option<String>,

    /// Existing security groups to launch with; a temporary one is created
    /// if empty.
    #[serde(default)]
    pub security_group_ids: Vec<String>,

    /// Port opened on the temporary security group.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Source range opened on the temporary security group.
    #[serde(default = "default_ssh_cidr")]
    pub ssh_cidr: String,

    /// Deregister an existing image with the same name before building.
    #[serde(default)]
    pub force_deregister: bool,

    /// Also delete the snapshots of a force-deregistered image.
    #[serde(default)]
    pub force_delete_snapshot: bool,

    /// Retry policy for provider calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Polling budget for state transitions.
    #[serde(default)]
    pub wait: WaitConfig,

    /// Fan-out settings for region copies and tagging.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Budget for each step's cleanup, in milliseconds.
    #[serde(default = "default_cleanup_timeout_ms")]
    pub cleanup_timeout_ms: u64,

    /// How long a running step may continue after cancellation.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl BuildConfig {
    /// Creates a config with defaults for everything but the required fields.
    #[must_use]
    pub fn new(
        image_name: impl Into<String>,
        source_image: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            image_name: image_name.into(),
            source_image: source_image.into(),
            region: region.into(),
            instance_type: default_instance_type(),
            copy_regions: Vec::new(),
            tags: BTreeMap::new(),
            key_pair_name: None,
            security_group_ids: Vec::new(),
            ssh_port: default_ssh_port(),
            ssh_cidr: default_ssh_cidr(),
            force_deregister: false,
            force_delete_snapshot: false,
            retry: RetryPolicy::default(),
            wait: WaitConfig::default(),
            replication: ReplicationConfig::default(),
            cleanup_timeout_ms: default_cleanup_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }

    /// Sets the copy regions.
    #[must_use]
    pub fn with_copy_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.copy_regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the polling budget.
    #[must_use]
    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Parses a JSON document. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the document is malformed.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads and parses a JSON file. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Parse` if it is malformed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&contents)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError::Invalid` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !IMAGE_NAME_RE.is_match(&self.image_name) {
            return Err(ConfigError::invalid(
                "image_name",
                "must be 3-128 characters of letters, numbers, spaces and ()[]./-'@_",
            ));
        }
        if self.source_image.trim().is_empty() {
            return Err(ConfigError::invalid("source_image", "must not be empty"));
        }
        if !REGION_RE.is_match(&self.region) {
            return Err(ConfigError::invalid(
                "region",
                format!("'{}' is not a region name", self.region),
            ));
        }
        if self.instance_type.trim().is_empty() {
            return Err(ConfigError::invalid("instance_type", "must not be empty"));
        }

        let mut seen = BTreeSet::new();
        for region in &self.copy_regions {
            if !REGION_RE.is_match(region) {
                return Err(ConfigError::invalid(
                    "copy_regions",
                    format!("'{region}' is not a region name"),
                ));
            }
            if !seen.insert(region.as_str()) {
                return Err(ConfigError::invalid(
                    "copy_regions",
                    format!("region '{region}' is listed more than once"),
                ));
            }
        }

        if self.key_pair_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ConfigError::invalid("key_pair_name", "must not be empty"));
        }
        if self.security_group_ids.is_empty() {
            validate_cidr(&self.ssh_cidr)?;
        }
        if self.force_delete_snapshot && !self.force_deregister {
            return Err(ConfigError::invalid(
                "force_delete_snapshot",
                "requires force_deregister",
            ));
        }
        if self.replication.max_concurrency == Some(0) {
            return Err(ConfigError::invalid(
                "replication.max_concurrency",
                "must be at least 1",
            ));
        }

        self.retry.validate()?;
        self.wait.validate()
    }

    /// Returns the copy regions, deduplicated, without the build region.
    #[must_use]
    pub fn copy_targets(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.copy_regions
            .iter()
            .filter(|r| **r != self.region && seen.insert(r.as_str()))
            .cloned()
            .collect()
    }

    /// Returns the runner timing budgets.
    #[must_use]
    pub const fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            cleanup_timeout: Duration::from_millis(self.cleanup_timeout_ms),
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

fn validate_cidr(cidr: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::invalid("ssh_cidr", format!("'{cidr}' is not an IPv4 CIDR block"));
    let captures = CIDR_RE.captures(cidr).ok_or_else(invalid)?;

    for octet in 1..=4 {
        let value: u16 = captures[octet].parse().map_err(|_| invalid())?;
        if value > 255 {
            return Err(invalid());
        }
    }
    let prefix: u8 = captures[5].parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> BuildConfig {
        BuildConfig::new("base-image 2024.01", "ami-source", "us-east-1")
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let config = BuildConfig::from_json_str(
            r#"{"image_name": "web", "source_image": "ami-1", "region": "us-east-1"}"#,
        )
        .unwrap();

        assert_eq!(config.instance_type, "t3.micro");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.wait, WaitConfig::default());
        assert_eq!(config.runner_config(), RunnerConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_sections_parse() {
        let config = BuildConfig::from_json_str(
            r#"{
                "image_name": "web",
                "source_image": "ami-1",
                "region": "us-east-1",
                "copy_regions": ["eu-west-1", "ap-south-1"],
                "retry": {"max_attempts": 3, "initial_delay_ms": 10},
                "wait": {"delay_ms": 5},
                "replication": {"max_concurrency": 2}
            }"#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 10);
        assert_eq!(config.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
        assert_eq!(config.wait.delay_ms, 5);
        assert_eq!(config.wait.max_attempts, WaitConfig::default().max_attempts);
        assert_eq!(config.replication.max_concurrency, Some(2));
    }

    #[test]
    fn test_parse_error() {
        let err = BuildConfig::from_json_str(r#"{"image_name": "web"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"image_name": "web", "source_image": "ami-1", "region": "eu-west-1"}}"#
        )
        .unwrap();

        let config = BuildConfig::from_path(file.path()).unwrap();
        assert_eq!(config.region, "eu-west-1");
    }

    #[test]
    fn test_from_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuildConfig::from_path(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_image_name_rules() {
        for bad in ["ab", "has*star", &"x".repeat(129)] {
            let mut config = valid();
            config.image_name = bad.to_string();
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "image_name"));
        }
    }

    #[test]
    fn test_duplicate_copy_regions_rejected() {
        let config = valid().with_copy_regions(["eu-west-1", "eu-west-1"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_copy_targets_skip_build_region() {
        let mut config = valid().with_copy_regions(["us-east-1", "eu-west-1", "ap-south-1"]);
        assert_eq!(config.copy_targets(), vec!["eu-west-1", "ap-south-1"]);

        config.copy_regions.push("eu-west-1".into());
        assert_eq!(config.copy_targets(), vec!["eu-west-1", "ap-south-1"]);
    }

    #[test]
    fn test_cidr_validation() {
        for good in ["0.0.0.0/0", "10.1.2.3/32", "192.168.0.0/16"] {
            assert!(validate_cidr(good).is_ok(), "{good}");
        }
        for bad in ["10.0.0.0", "256.0.0.0/8", "10.0.0.0/33", "::/0"] {
            assert!(validate_cidr(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_cidr_ignored_with_existing_groups() {
        let mut config = valid();
        config.ssh_cidr = "nonsense".into();
        assert!(config.validate().is_err());

        config.security_group_ids = vec!["sg-existing".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_force_delete_snapshot_requires_deregister() {
        let mut config = valid();
        config.force_delete_snapshot = true;
        assert!(config.validate().is_err());
        config.force_deregister = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_validation() {
        let config = valid().with_retry(RetryPolicy::default().with_max_attempts(0));
        assert!(config.validate().is_err());

        let config = valid().with_wait(WaitConfig::new(0, 10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_dict() {
        let dict = valid().with_tag("team", "infra").to_dict();
        assert_eq!(dict["region"], "us-east-1");
        assert_eq!(dict["tags"]["team"], "infra");
    }
}
