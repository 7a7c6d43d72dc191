use crate::error::{PipelineError, Result};
use crate::resource::{ResourceHandle, ResourceScope};
use crate::traits::{Backend, BackendKind, Invocation};
use pd_channels::FileMetadata;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepted document family for an input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    /// Word processor, spreadsheet, presentation and plain-text documents.
    Office,
    Any,
}

const OFFICE_EXTENSIONS: &[&str] = &[
    "doc", "docx", "odt", "rtf", "txt", "xls", "xlsx", "ods", "csv", "ppt", "pptx", "odp",
];

impl DocumentKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pdf => "PDF",
            Self::Office => "office document (DOCX, XLSX, PPTX, ODT, ...)",
            Self::Any => "file",
        }
    }

    pub fn accepts(self, metadata: &FileMetadata) -> bool {
        let extension = std::path::Path::new(&metadata.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let mime = metadata
            .mime_type
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match self {
            Self::Any => true,
            Self::Pdf => extension.as_deref() == Some("pdf") || mime == "application/pdf",
            Self::Office => {
                extension
                    .as_deref()
                    .is_some_and(|ext| OFFICE_EXTENSIONS.contains(&ext))
                    || mime == "application/msword"
                    || mime.starts_with("application/vnd.openxmlformats-officedocument")
                    || mime.starts_with("application/vnd.oasis.opendocument")
                    || mime.starts_with("application/vnd.ms-")
            }
        }
    }

    /// Suffix used for the temporary copy of an accepted input.
    pub fn input_suffix(self, metadata: &FileMetadata) -> String {
        match self {
            Self::Pdf => ".pdf".to_string(),
            Self::Office | Self::Any => std::path::Path::new(&metadata.file_name)
                .extension()
                .and_then(|ext| ext.to_str())
                .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
                .unwrap_or_default(),
        }
    }
}

/// Free-text argument collected after the file slots.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub prompt: String,
    pub max_chars: usize,
    /// Redacted from `Debug` output of requests that carry it.
    pub secret: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSpec {
    /// A fixed sequence of files, optionally followed by a text parameter.
    Slots {
        kinds: Vec<DocumentKind>,
        parameter: Option<ParameterSpec>,
    },
    /// An open-ended collection finished by an explicit signal.
    Collection {
        kind: DocumentKind,
        min: usize,
        max: usize,
    },
}

impl InputSpec {
    pub fn single(kind: DocumentKind) -> Self {
        Self::Slots {
            kinds: vec![kind],
            parameter: None,
        }
    }

    pub fn single_with_parameter(kind: DocumentKind, parameter: ParameterSpec) -> Self {
        Self::Slots {
            kinds: vec![kind],
            parameter: Some(parameter),
        }
    }

    pub fn parameter(&self) -> Option<&ParameterSpec> {
        match self {
            Self::Slots { parameter, .. } => parameter.as_ref(),
            Self::Collection { .. } => None,
        }
    }
}

pub struct OperationDescriptor {
    pub id: OperationId,
    pub label: String,
    pub input: InputSpec,
    pub backend: Arc<dyn Backend>,
    pub timeout: Duration,
    /// Caption attached to the delivered result.
    pub caption: String,
    /// Appended to the input file stem when naming the result.
    pub output_suffix: String,
}

impl OperationDescriptor {
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("input", &self.input)
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Registered operations, fixed after startup.
#[derive(Default)]
pub struct OperationRegistry {
    descriptors: HashMap<OperationId, Arc<OperationDescriptor>>,
    order: Vec<OperationId>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: OperationDescriptor) -> Result<()> {
        if self.descriptors.contains_key(&descriptor.id) {
            return Err(PipelineError::Validation(format!(
                "operation {} registered twice",
                descriptor.id
            )));
        }
        match &descriptor.input {
            InputSpec::Slots { kinds, .. } if kinds.is_empty() => {
                return Err(PipelineError::Validation(format!(
                    "operation {} declares no input slots",
                    descriptor.id
                )));
            }
            InputSpec::Collection { min, max, .. } if *min == 0 || max < min => {
                return Err(PipelineError::Validation(format!(
                    "operation {} has invalid collection bounds {min}..={max}",
                    descriptor.id
                )));
            }
            _ => {}
        }
        self.order.push(descriptor.id.clone());
        self.descriptors
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Validates a raw selection id from the transport.
    pub fn resolve(&self, raw: &str) -> Result<OperationId> {
        let id = OperationId::new(raw.trim());
        if self.descriptors.contains_key(&id) {
            Ok(id)
        } else {
            Err(PipelineError::UnknownOperation(id.0))
        }
    }

    pub fn lookup(&self, id: &OperationId) -> Result<Arc<OperationDescriptor>> {
        self.descriptors
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownOperation(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<OperationDescriptor>> {
        self.order
            .iter()
            .filter_map(|id| self.descriptors.get(id))
    }

    pub fn menu(&self) -> Vec<(OperationId, String)> {
        self.iter()
            .map(|d| (d.id.clone(), d.label.clone()))
            .collect()
    }

    /// Runs the descriptor's backend. The only call surface of the executor.
    #[tracing::instrument(level = "debug", skip_all, fields(operation = %descriptor.id, backend = descriptor.backend.name()))]
    pub async fn invoke(
        &self,
        descriptor: &OperationDescriptor,
        inputs: &[&ResourceHandle],
        parameter: Option<&str>,
        scope: &ResourceScope,
    ) -> Result<Vec<ResourceHandle>> {
        let invocation = Invocation {
            operation: &descriptor.id,
            inputs,
            parameter,
            scope,
        };
        let outputs = descriptor.backend.invoke(&invocation).await?;
        if outputs.is_empty() {
            return Err(PipelineError::BackendFailure(format!(
                "{} produced no output",
                descriptor.backend.name()
            )));
        }
        if outputs
            .iter()
            .any(|out| inputs.iter().any(|input| input.path() == out.path()))
        {
            return Err(PipelineError::BackendFailure(format!(
                "{} returned an input as output",
                descriptor.backend.name()
            )));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::PassthroughBackend;

    fn pdf(name: &str, mime: Option<&str>) -> FileMetadata {
        FileMetadata {
            file_name: name.to_string(),
            mime_type: mime.map(str::to_string),
            size: None,
        }
    }

    fn descriptor(id: &str, input: InputSpec) -> OperationDescriptor {
        OperationDescriptor {
            id: OperationId::new(id),
            label: id.to_string(),
            input,
            backend: Arc::new(PassthroughBackend),
            timeout: Duration::from_secs(5),
            caption: String::new(),
            output_suffix: String::new(),
        }
    }

    #[test]
    fn pdf_kind_matches_extension_or_mime() {
        assert!(DocumentKind::Pdf.accepts(&pdf("Report.PDF", None)));
        assert!(DocumentKind::Pdf.accepts(&pdf("scan", Some("application/pdf"))));
        assert!(!DocumentKind::Pdf.accepts(&pdf("notes.docx", None)));
        assert!(DocumentKind::Office.accepts(&pdf("notes.docx", None)));
        assert!(!DocumentKind::Office.accepts(&pdf("photo.jpg", Some("image/jpeg"))));
    }

    #[test]
    fn input_suffix_sanitizes_extension() {
        assert_eq!(DocumentKind::Pdf.input_suffix(&pdf("x", None)), ".pdf");
        assert_eq!(DocumentKind::Office.input_suffix(&pdf("a.DOCX", None)), ".docx");
        assert_eq!(DocumentKind::Office.input_suffix(&pdf("a.d/cx", None)), "");
    }

    #[test]
    fn lookup_rejects_unknown_ids() {
        let mut registry = OperationRegistry::new();
        registry
            .register(descriptor("compress", InputSpec::single(DocumentKind::Pdf)))
            .unwrap();
        let id = registry.resolve(" compress ").unwrap();
        assert_eq!(registry.lookup(&id).unwrap().id.as_str(), "compress");
        assert!(registry.lookup(&OperationId::new("split")).is_err());
        let err = registry.resolve("rm -rf").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownOperation(ref id) if id == "rm -rf"));
    }

    #[test]
    fn register_rejects_duplicates_and_bad_bounds() {
        let mut registry = OperationRegistry::new();
        registry
            .register(descriptor("merge", InputSpec::single(DocumentKind::Pdf)))
            .unwrap();
        assert!(
            registry
                .register(descriptor("merge", InputSpec::single(DocumentKind::Pdf)))
                .is_err()
        );
        assert!(
            registry
                .register(descriptor(
                    "bad",
                    InputSpec::Collection {
                        kind: DocumentKind::Pdf,
                        min: 3,
                        max: 2,
                    },
                ))
                .is_err()
        );
        assert_eq!(registry.menu().len(), 1);
    }
}
