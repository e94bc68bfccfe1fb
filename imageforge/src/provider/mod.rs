//! The compute provider seam.
//!
//! This module provides:
//! - The [`ImageProvider`] trait every provisioning call goes through
//! - Resource descriptions (images, instances, key pairs)
//! - [`ProviderError`] with typed classification for retry decisions
//!
//! Request shaping and credentials belong to the adapter implementing the
//! trait; the build engine only sees these types.

mod error;
mod types;

pub use error::ProviderError;
pub use types::{ImageInfo, ImageState, InstanceInfo, InstanceState, KeyPair, LaunchRequest};

use async_trait::async_trait;
use std::collections::BTreeMap;

/// Result alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Operations the build engine needs from a compute provider.
///
/// Every call names the region it targets.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Describes an image by id.
    async fn describe_image(&self, region: &str, image_id: &str) -> ProviderResult<ImageInfo>;

    /// Looks up an image by name.
    async fn find_image_by_name(&self, region: &str, name: &str)
        -> ProviderResult<Option<ImageInfo>>;

    /// Creates a key pair and returns it with its private key.
    async fn create_key_pair(&self, region: &str, name: &str) -> ProviderResult<KeyPair>;

    /// Deletes a key pair.
    async fn delete_key_pair(&self, region: &str, name: &str) -> ProviderResult<()>;

    /// Creates a security group and returns its id.
    async fn create_security_group(
        &self,
        region: &str,
        name: &str,
        description: &str,
    ) -> ProviderResult<String>;

    /// Opens a TCP port to a CIDR block.
    async fn authorize_ingress(
        &self,
        region: &str,
        group_id: &str,
        port: u16,
        cidr: &str,
    ) -> ProviderResult<()>;

    /// Looks up a security group id by name.
    async fn find_security_group(&self, region: &str, name: &str) -> ProviderResult<Option<String>>;

    /// Deletes a security group.
    async fn delete_security_group(&self, region: &str, group_id: &str) -> ProviderResult<()>;

    /// Launches an instance.
    ///
    /// A request carrying a `client_token` is idempotent: repeating it
    /// returns the instance the first request launched.
    async fn run_instance(&self, request: &LaunchRequest) -> ProviderResult<InstanceInfo>;

    /// Describes an instance.
    async fn describe_instance(&self, region: &str, instance_id: &str)
        -> ProviderResult<InstanceInfo>;

    /// Requests an instance stop.
    async fn stop_instance(&self, region: &str, instance_id: &str) -> ProviderResult<()>;

    /// Requests instance termination.
    async fn terminate_instance(&self, region: &str, instance_id: &str) -> ProviderResult<()>;

    /// Creates an image from an instance and returns its id.
    async fn create_image(
        &self,
        region: &str,
        instance_id: &str,
        name: &str,
    ) -> ProviderResult<String>;

    /// Starts copying an image into another region and returns the new id.
    async fn copy_image(
        &self,
        source_region: &str,
        image_id: &str,
        dest_region: &str,
        name: &str,
    ) -> ProviderResult<String>;

    /// Deregisters an image.
    async fn deregister_image(&self, region: &str, image_id: &str) -> ProviderResult<()>;

    /// Deletes a snapshot.
    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> ProviderResult<()>;

    /// Applies tags to resources.
    async fn create_tags(
        &self,
        region: &str,
        resource_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> ProviderResult<()>;
}
