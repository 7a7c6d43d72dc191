//! Document operations for pdfdesk.
//!
//! Operations are registered once at startup and invoked by the job executor
//! under a global concurrency limit. Every temporary file they touch is owned
//! by a [`ResourceHandle`] from the shared [`ResourceGuard`].

pub mod catalog;
mod command;
mod error;
mod executor;
mod fallback;
mod local;
mod registry;
mod resource;
mod traits;

pub use catalog::{CatalogConfig, PARAMETER_MAX_CHARS, default_registry};
pub use command::{Bundle, CommandBackend, OutputCollect};
pub use error::{PipelineError, Result};
pub use executor::{
    ExecutorConfig, ExecutorStats, JobExecutor, JobId, JobInput, JobOutcome, JobReport,
    JobRequest, JobTicket,
};
pub use fallback::FallbackChain;
pub use local::{PassthroughBackend, bundle_zip};
pub use registry::{
    DocumentKind, InputSpec, OperationDescriptor, OperationId, OperationRegistry, ParameterSpec,
};
pub use resource::{GuardStats, ResourceGuard, ResourceHandle, ResourceScope, Role};
pub use traits::{Backend, BackendKind, Invocation};
