use async_trait::async_trait;

use crate::error::Result;
use crate::instance::{Instance, InstanceRef};

/// Read access to the orchestration lifecycle API.
///
/// Polled by [`Connector`](crate::Connector) until the instance reports
/// [`InstancePhase::Running`](crate::InstancePhase::Running).
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Current phase and specification of the instance, or `InstanceNotFound`
    async fn get(&self, instance: &InstanceRef) -> Result<Instance>;
}
