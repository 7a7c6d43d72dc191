//! In-process backends and helpers.

use crate::error::{PipelineError, Result};
use crate::resource::{ResourceHandle, Role};
use crate::traits::{Backend, BackendKind, Invocation};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Copies the first input unchanged.
pub struct PassthroughBackend;

#[async_trait]
impl Backend for PassthroughBackend {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn invoke(&self, invocation: &Invocation<'_>) -> Result<Vec<ResourceHandle>> {
        let input = invocation.first_input()?;
        let suffix = input
            .extension()
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let output = invocation.scope.acquire(Role::Output, &suffix);
        tokio::fs::copy(input.path(), output.path()).await?;
        Ok(vec![output])
    }
}

/// Packs `files` into a deflate zip archive at `dest`, flat, under their
/// own file names.
pub async fn bundle_zip(files: Vec<PathBuf>, dest: &Path) -> Result<()> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_zip(&files, &dest))
        .await
        .map_err(|e| PipelineError::BackendFailure(format!("zip task failed: {e}")))?
}

fn write_zip(files: &[PathBuf], dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for path in files {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                PipelineError::BackendFailure(format!("unnamed bundle entry {}", path.display()))
            })?;
        zip.start_file(name, options)
            .map_err(|e| PipelineError::BackendFailure(format!("zip entry {name}: {e}")))?;
        let bytes = std::fs::read(path)?;
        zip.write_all(&bytes)?;
    }
    zip.finish()
        .map_err(|e| PipelineError::BackendFailure(format!("zip finish: {e}")))?;
    Ok(())
}
