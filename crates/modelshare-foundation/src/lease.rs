//! Scoped instance access.

use serde_json::Value;

use crate::error::ShareResult;
use crate::service::ModelSharingService;

/// A held instance that is released when the lease is dropped.
///
/// ```ignore
/// if let Some(lease) = service.lease("llama-3-8b", "session-42", ShareMode::Shared).await? {
///     let reply = lease.infer(json!({ "prompt": "hello" })).await?;
/// } // released here
/// ```
#[must_use = "dropping a lease releases the instance immediately"]
#[derive(Debug)]
pub struct InstanceLease {
    service: ModelSharingService,
    instance_id: String,
    caller_id: String,
    released: bool,
}

impl InstanceLease {
    pub(crate) fn new(service: ModelSharingService, instance_id: String, caller_id: String) -> Self {
        Self {
            service,
            instance_id,
            caller_id,
            released: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub async fn infer(&self, inputs: Value) -> ShareResult<Value> {
        self.service
            .infer(&self.instance_id, &self.caller_id, inputs)
            .await
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.service.release(&self.instance_id, &self.caller_id);
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
