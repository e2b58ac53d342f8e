use async_trait::async_trait;

pub use paropal_common::{Instance, InstanceSpec};

pub mod error;

pub use error::{ProviderError, Result};

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Lists every instance in the account, following pagination until exhausted.
    /// A failure on any page fails the whole call.
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Creates an instance and returns its provider id.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String>;

    /// Fails with `EmptyIdentifier` before any request when `instance_id` is blank.
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    /// Attaches a block storage volume. A volume that is already attached or in
    /// use is reported as `ProviderError::AlreadyAttached`.
    async fn attach_block_storage(
        &self,
        block_storage_id: &str,
        instance_id: &str,
        live: bool,
    ) -> Result<()>;

    async fn pending_charges(&self) -> Result<f64>;

    // Selection is provider-agnostic; implementations only need list_instances.
    async fn find_instance_with_label_prefix(&self, prefix: &str) -> Result<Option<Instance>> {
        let instances = self.list_instances().await?;
        Ok(paropal_common::select_labeled_instance(instances, prefix))
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "vultr")]
pub mod vultr;
