//! The stock set of operations.

use crate::command::{Bundle, CommandBackend, OutputCollect};
use crate::error::Result;
use crate::fallback::FallbackChain;
use crate::local::PassthroughBackend;
use crate::registry::{
    DocumentKind, InputSpec, OperationDescriptor, OperationId, OperationRegistry, ParameterSpec,
};
use crate::traits::Backend;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const PARAMETER_MAX_CHARS: usize = 200;
pub const DEFAULT_MERGE_MAX_INPUTS: usize = 20;

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub default_timeout: Duration,
    /// Per-operation overrides of `default_timeout`.
    pub timeouts: HashMap<String, Duration>,
    pub disabled: HashSet<String>,
    pub enable_passthrough: bool,
    pub merge_max_inputs: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            timeouts: HashMap::new(),
            disabled: HashSet::new(),
            enable_passthrough: false,
            merge_max_inputs: DEFAULT_MERGE_MAX_INPUTS,
        }
    }
}

impl CatalogConfig {
    fn timeout_for(&self, id: &str) -> Duration {
        self.timeouts
            .get(id)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

struct Entry {
    id: &'static str,
    label: &'static str,
    input: InputSpec,
    backend: Arc<dyn Backend>,
    caption: &'static str,
    output_suffix: &'static str,
}

fn file(suffix: &str) -> OutputCollect {
    OutputCollect::File {
        suffix: suffix.to_string(),
    }
}

fn dir(extension: &str, bundle: Bundle) -> OutputCollect {
    OutputCollect::Directory {
        extension: extension.to_string(),
        bundle,
    }
}

fn libreoffice(name: &str, target: &str, infilter: Option<&str>) -> CommandBackend {
    let filter_arg = infilter.map(|filter| format!("--infilter={filter}"));
    let mut args = vec![
        "--headless",
        "--norestore",
        "-env:UserInstallation=file://{scratch}",
    ];
    if let Some(filter_arg) = &filter_arg {
        args.push(filter_arg.as_str());
    }
    args.extend(["--convert-to", target, "--outdir", "{outdir}", "{input}"]);
    CommandBackend::new(name, "soffice", &args, dir(target, Bundle::Never))
}

fn entries(config: &CatalogConfig) -> Vec<Entry> {
    let pdf = || InputSpec::single(DocumentKind::Pdf);
    let mut entries = vec![
        Entry {
            id: "to_docx",
            label: "PDF → DOCX",
            input: pdf(),
            backend: Arc::new(libreoffice(
                "libreoffice-docx",
                "docx",
                Some("writer_pdf_import"),
            )),
            caption: "DOCX ready ✅",
            output_suffix: ".docx",
        },
        Entry {
            id: "to_pptx",
            label: "PDF → PPTX",
            input: pdf(),
            backend: Arc::new(libreoffice(
                "libreoffice-pptx",
                "pptx",
                Some("impress_pdf_import"),
            )),
            caption: "PPTX ready ✅",
            output_suffix: ".pptx",
        },
        Entry {
            id: "to_xlsx",
            label: "PDF → XLSX",
            input: pdf(),
            backend: Arc::new(libreoffice("libreoffice-xlsx", "xlsx", None)),
            caption: "XLSX ready ✅",
            output_suffix: ".xlsx",
        },
        Entry {
            id: "to_jpg",
            label: "PDF → JPG",
            input: pdf(),
            backend: Arc::new(FallbackChain::new(
                "render-jpg",
                vec![
                    Arc::new(CommandBackend::new(
                        "pdftoppm",
                        "pdftoppm",
                        &["-jpeg", "-r", "150", "{input}", "{outdir}/page"],
                        dir("jpg", Bundle::Always),
                    )),
                    Arc::new(CommandBackend::new(
                        "mutool",
                        "mutool",
                        &["draw", "-r", "150", "-o", "{outdir}/page-%d.jpg", "{input}"],
                        dir("jpg", Bundle::Always),
                    )),
                ],
            )),
            caption: "JPG archive ready ✅",
            output_suffix: "_pages.zip",
        },
        Entry {
            id: "tables",
            label: "Tables → Excel",
            input: pdf(),
            backend: Arc::new(CommandBackend::new(
                "camelot",
                "camelot",
                &[
                    "--format",
                    "excel",
                    "--output",
                    "{outdir}/tables.xlsx",
                    "--pages",
                    "all",
                    "lattice",
                    "{input}",
                ],
                dir("xlsx", Bundle::WhenMany),
            )),
            caption: "Tables extracted ✅",
            output_suffix: "_tables.xlsx",
        },
        Entry {
            id: "split",
            label: "Split",
            input: pdf(),
            backend: Arc::new(CommandBackend::new(
                "qpdf-split",
                "qpdf",
                &["--warning-exit-0", "--split-pages", "{input}", "{outdir}/page.pdf"],
                dir("pdf", Bundle::Always),
            )),
            caption: "Split ✅",
            output_suffix: "_pages.zip",
        },
        Entry {
            id: "merge",
            label: "Merge",
            input: InputSpec::Collection {
                kind: DocumentKind::Pdf,
                min: 2,
                max: config.merge_max_inputs,
            },
            backend: Arc::new(FallbackChain::new(
                "merge",
                vec![
                    Arc::new(CommandBackend::new(
                        "qpdf-merge",
                        "qpdf",
                        &["--warning-exit-0", "--empty", "--pages", "{inputs}", "--", "{output}"],
                        file(".pdf"),
                    )),
                    Arc::new(CommandBackend::new(
                        "pdfunite",
                        "pdfunite",
                        &["{inputs}", "{output}"],
                        file(".pdf"),
                    )),
                ],
            )),
            caption: "Merged ✅",
            output_suffix: "_merged.pdf",
        },
        Entry {
            id: "compress",
            label: "Compress",
            input: pdf(),
            backend: Arc::new(FallbackChain::new(
                "compress",
                vec![
                    Arc::new(CommandBackend::new(
                        "qpdf-compress",
                        "qpdf",
                        &[
                            "--warning-exit-0",
                            "--compress-streams=y",
                            "--recompress-flate",
                            "--object-streams=generate",
                            "{input}",
                            "{output}",
                        ],
                        file(".pdf"),
                    )),
                    Arc::new(CommandBackend::new(
                        "ghostscript",
                        "gs",
                        &[
                            "-sDEVICE=pdfwrite",
                            "-dCompatibilityLevel=1.4",
                            "-dPDFSETTINGS=/ebook",
                            "-dNOPAUSE",
                            "-dQUIET",
                            "-dBATCH",
                            "-sOutputFile={output}",
                            "{input}",
                        ],
                        file(".pdf"),
                    )),
                ],
            )),
            caption: "Compressed PDF ✅",
            output_suffix: "_compressed.pdf",
        },
        Entry {
            id: "watermark",
            label: "Watermark",
            input: InputSpec::single_with_parameter(
                DocumentKind::Pdf,
                ParameterSpec {
                    prompt: "Send the watermark text.".to_string(),
                    max_chars: PARAMETER_MAX_CHARS,
                    secret: false,
                },
            ),
            backend: Arc::new(CommandBackend::new(
                "cpdf-watermark",
                "cpdf",
                &[
                    "-add-text",
                    "{param}",
                    "-center",
                    "-font-size",
                    "40",
                    "-opacity",
                    "0.3",
                    "{input}",
                    "-o",
                    "{output}",
                ],
                file(".pdf"),
            )),
            caption: "Watermark added ✅",
            output_suffix: "_watermarked.pdf",
        },
        Entry {
            id: "encrypt",
            label: "Password",
            input: InputSpec::single_with_parameter(
                DocumentKind::Pdf,
                ParameterSpec {
                    prompt: "Send the password to protect the PDF with.".to_string(),
                    max_chars: PARAMETER_MAX_CHARS,
                    secret: true,
                },
            ),
            backend: Arc::new(CommandBackend::new(
                "qpdf-encrypt",
                "qpdf",
                &[
                    "--warning-exit-0",
                    "--encrypt",
                    "{param}",
                    "{param}",
                    "256",
                    "--",
                    "{input}",
                    "{output}",
                ],
                file(".pdf"),
            )),
            caption: "Protected PDF ✅",
            output_suffix: "_protected.pdf",
        },
        Entry {
            id: "ocr",
            label: "OCR",
            input: pdf(),
            backend: Arc::new(CommandBackend::new(
                "ocrmypdf",
                "ocrmypdf",
                &["--skip-text", "--quiet", "{input}", "{output}"],
                file(".pdf"),
            )),
            caption: "OCR PDF ✅",
            output_suffix: "_ocr.pdf",
        },
        Entry {
            id: "to_pdf",
            label: "Document → PDF",
            input: InputSpec::single(DocumentKind::Office),
            backend: Arc::new(FallbackChain::new(
                "office-pdf",
                vec![
                    Arc::new(libreoffice("libreoffice-pdf", "pdf", None)),
                    Arc::new(CommandBackend::new(
                        "unoconv",
                        "unoconv",
                        &["-f", "pdf", "-o", "{output}", "{input}"],
                        file(".pdf"),
                    )),
                ],
            )),
            caption: "PDF ready ✅",
            output_suffix: ".pdf",
        },
    ];
    if config.enable_passthrough {
        entries.push(Entry {
            id: "passthrough",
            label: "Copy",
            input: InputSpec::single(DocumentKind::Any),
            backend: Arc::new(PassthroughBackend),
            caption: "Copy ready ✅",
            output_suffix: "",
        });
    }
    entries
}

/// Builds the registry from the stock catalog, minus disabled operations.
pub fn default_registry(config: &CatalogConfig) -> Result<OperationRegistry> {
    let mut registry = OperationRegistry::new();
    for entry in entries(config) {
        if config.disabled.contains(entry.id) {
            tracing::info!(operation = entry.id, "operation disabled by config");
            continue;
        }
        registry.register(OperationDescriptor {
            id: OperationId::new(entry.id),
            label: entry.label.to_string(),
            input: entry.input,
            backend: entry.backend,
            timeout: config.timeout_for(entry.id),
            caption: entry.caption.to_string(),
            output_suffix: entry.output_suffix.to_string(),
        })?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::BackendKind;

    #[test]
    fn default_catalog_lists_every_stock_operation() {
        let registry = default_registry(&CatalogConfig::default()).unwrap();
        let ids: Vec<String> = registry
            .menu()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                "to_docx", "to_pptx", "to_xlsx", "to_jpg", "tables", "split", "merge", "compress",
                "watermark", "encrypt", "ocr", "to_pdf"
            ]
        );
        let compress = registry.lookup(&OperationId::new("compress")).unwrap();
        assert_eq!(compress.backend_kind(), BackendKind::ExternalProcess);
        assert_eq!(compress.backend.programs(), vec!["qpdf", "gs"]);
    }

    #[test]
    fn config_disables_operations_and_overrides_timeouts() {
        let config = CatalogConfig {
            timeouts: HashMap::from([("ocr".to_string(), Duration::from_secs(900))]),
            disabled: HashSet::from(["tables".to_string()]),
            enable_passthrough: true,
            ..CatalogConfig::default()
        };
        let registry = default_registry(&config).unwrap();
        assert!(registry.resolve("tables").is_err());
        let ocr = registry.lookup(&OperationId::new("ocr")).unwrap();
        assert_eq!(ocr.timeout, Duration::from_secs(900));
        let split = registry.lookup(&OperationId::new("split")).unwrap();
        assert_eq!(split.timeout, Duration::from_secs(300));
        let passthrough = registry.lookup(&OperationId::new("passthrough")).unwrap();
        assert_eq!(passthrough.backend_kind(), BackendKind::InProcess);
    }

    #[test]
    fn merge_is_a_bounded_collection() {
        let registry = default_registry(&CatalogConfig::default()).unwrap();
        let merge = registry.lookup(&OperationId::new("merge")).unwrap();
        assert!(matches!(
            merge.input,
            InputSpec::Collection {
                min: 2,
                max: DEFAULT_MERGE_MAX_INPUTS,
                ..
            }
        ));
    }
}
