use crate::error::{PipelineError, Result};
use crate::resource::ResourceHandle;
use crate::traits::{Backend, BackendKind, Invocation};
use async_trait::async_trait;
use std::sync::Arc;

/// Tries backends in order until one succeeds.
///
/// Each attempt runs in its own child scope, so scratch files of a failed
/// attempt are gone before the next one starts.
pub struct FallbackChain {
    name: String,
    attempts: Vec<Arc<dyn Backend>>,
}

impl FallbackChain {
    pub fn new(name: impl Into<String>, attempts: Vec<Arc<dyn Backend>>) -> Self {
        Self {
            name: name.into(),
            attempts,
        }
    }
}

#[async_trait]
impl Backend for FallbackChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        if self
            .attempts
            .iter()
            .any(|b| b.kind() == BackendKind::ExternalProcess)
        {
            BackendKind::ExternalProcess
        } else {
            BackendKind::InProcess
        }
    }

    fn programs(&self) -> Vec<String> {
        let mut programs = Vec::new();
        for backend in &self.attempts {
            for program in backend.programs() {
                if !programs.contains(&program) {
                    programs.push(program);
                }
            }
        }
        programs
    }

    async fn invoke(&self, invocation: &Invocation<'_>) -> Result<Vec<ResourceHandle>> {
        let mut reasons = Vec::with_capacity(self.attempts.len());
        for backend in &self.attempts {
            let child = invocation.scope.child();
            let attempt = Invocation {
                operation: invocation.operation,
                inputs: invocation.inputs,
                parameter: invocation.parameter,
                scope: &child,
            };
            match backend.invoke(&attempt).await {
                Ok(outputs) => {
                    child.detach(&outputs);
                    return Ok(outputs);
                }
                // Bad input fails every backend the same way.
                Err(err @ PipelineError::Validation(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        chain = %self.name,
                        backend = backend.name(),
                        error = %err,
                        "backend attempt failed, trying next"
                    );
                    reasons.push(format!("{}: {err}", backend.name()));
                }
            }
        }
        Err(PipelineError::BackendFailure(if reasons.is_empty() {
            format!("{} has no backends", self.name)
        } else {
            reasons.join("; ")
        }))
    }
}
