use crate::error::Result;
use crate::registry::OperationId;
use crate::resource::{ResourceHandle, ResourceScope};
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    InProcess,
    ExternalProcess,
}

/// Arguments for one backend call.
pub struct Invocation<'a> {
    pub operation: &'a OperationId,
    /// Materialized inputs, in the order the user supplied them. Read-only.
    pub inputs: &'a [&'a ResourceHandle],
    pub parameter: Option<&'a str>,
    /// Where outputs and scratch artifacts are allocated.
    pub scope: &'a ResourceScope,
}

impl Invocation<'_> {
    pub fn first_input(&self) -> Result<&ResourceHandle> {
        self.inputs.first().copied().ok_or_else(|| {
            crate::PipelineError::Validation(format!(
                "operation {} requires at least one input",
                self.operation
            ))
        })
    }
}

/// One conversion or editing tool.
///
/// Implementations must not keep references to inputs after returning and
/// must be callable from several jobs at once.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// External programs this backend needs on `PATH`.
    fn programs(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, invocation: &Invocation<'_>) -> Result<Vec<ResourceHandle>>;
}
