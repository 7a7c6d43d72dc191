//! External-process backends.
//!
//! A [`CommandBackend`] runs one program with an argument template. Arguments
//! may contain placeholders that are substituted per invocation:
//!
//! | placeholder | value |
//! |-------------|-------|
//! | `{input}`   | path of the first input |
//! | `{inputs}`  | every input path, as separate arguments (whole argument only) |
//! | `{output}`  | path of the output file (file collection only) |
//! | `{outdir}`  | scratch directory the tool writes results into |
//! | `{scratch}` | private scratch directory, e.g. for tool profiles |
//! | `{param}`   | the text parameter |
//!
//! Children are spawned with `kill_on_drop`, so dropping the invocation future
//! (the executor does this on timeout) terminates the process.

use crate::error::{PipelineError, Result};
use crate::local::bundle_zip;
use crate::resource::{ResourceHandle, Role};
use crate::traits::{Backend, BackendKind, Invocation};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const STDERR_TAIL_CHARS: usize = 500;

/// Where the program leaves its result.
#[derive(Debug, Clone)]
pub enum OutputCollect {
    /// The program writes exactly `{output}`, allocated with this suffix.
    File { suffix: String },
    /// The program writes into `{outdir}`; files with `extension` are
    /// collected in name order.
    Directory { extension: String, bundle: Bundle },
}

/// Whether collected directory files are zipped into one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bundle {
    Never,
    Always,
    /// Only when more than one file was produced.
    WhenMany,
}

impl Bundle {
    fn applies(self, count: usize) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::WhenMany => count > 1,
        }
    }
}

pub struct CommandBackend {
    name: String,
    program: String,
    args: Vec<String>,
    collect: OutputCollect,
}

impl CommandBackend {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: &[&str],
        collect: OutputCollect,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            collect,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn needs_scratch(&self) -> bool {
        self.args.iter().any(|arg| arg.contains("{scratch}"))
    }

    async fn run(&self, argv: &[String], working_directory: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(argv)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::BackendFailure(format!("{} is not installed", self.program))
            } else {
                PipelineError::BackendFailure(format!("{}: {e}", self.program))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::BackendFailure(format!(
                "{} exited with code {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                tail_chars(stderr.trim(), STDERR_TAIL_CHARS)
            )));
        }
        tracing::debug!(
            backend = %self.name,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "external backend finished"
        );
        Ok(())
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ExternalProcess
    }

    fn programs(&self) -> Vec<String> {
        vec![self.program.clone()]
    }

    #[tracing::instrument(level = "info", skip_all, fields(backend = %self.name, operation = %invocation.operation))]
    async fn invoke(&self, invocation: &Invocation<'_>) -> Result<Vec<ResourceHandle>> {
        let scope = invocation.scope;
        let outdir = scope.acquire_dir(Role::Intermediate)?;
        let scratch = if self.needs_scratch() {
            Some(scope.acquire_dir(Role::Intermediate)?)
        } else {
            None
        };
        let output = match &self.collect {
            OutputCollect::File { suffix } => Some(scope.acquire(Role::Output, suffix)),
            OutputCollect::Directory { .. } => None,
        };

        let bindings = Bindings {
            inputs: invocation.inputs.iter().map(|h| h.path()).collect(),
            output: output.as_ref().map(|h| h.path()),
            outdir: outdir.path(),
            scratch: scratch.as_ref().map(|h| h.path()),
            parameter: invocation.parameter,
        };
        let argv = expand_args(&self.args, &bindings)?;
        self.run(&argv, outdir.path()).await?;

        match &self.collect {
            OutputCollect::File { .. } => {
                let output = output.ok_or_else(|| {
                    PipelineError::BackendFailure(format!("{} has no output handle", self.name))
                })?;
                let produced = tokio::fs::metadata(output.path())
                    .await
                    .map(|meta| meta.len() > 0)
                    .unwrap_or(false);
                if !produced {
                    return Err(PipelineError::BackendFailure(format!(
                        "{} produced no output file",
                        self.program
                    )));
                }
                Ok(vec![output])
            }
            OutputCollect::Directory { extension, bundle } => {
                let files = collect_files(outdir.path(), extension).await?;
                if files.is_empty() {
                    return Err(PipelineError::BackendFailure(format!(
                        "{} produced no .{extension} files",
                        self.program
                    )));
                }
                if bundle.applies(files.len()) {
                    let archive = scope.acquire(Role::Output, ".zip");
                    bundle_zip(files, archive.path()).await?;
                    return Ok(vec![archive]);
                }
                let mut outputs = Vec::with_capacity(files.len());
                for file in files {
                    let target = scope.acquire(Role::Output, &format!(".{extension}"));
                    tokio::fs::rename(&file, target.path()).await?;
                    outputs.push(target);
                }
                Ok(outputs)
            }
        }
    }
}

struct Bindings<'a> {
    inputs: Vec<&'a Path>,
    output: Option<&'a Path>,
    outdir: &'a Path,
    scratch: Option<&'a Path>,
    parameter: Option<&'a str>,
}

fn expand_args(template: &[String], bindings: &Bindings<'_>) -> Result<Vec<String>> {
    let mut argv = Vec::with_capacity(template.len() + bindings.inputs.len());
    for arg in template {
        if arg == "{inputs}" {
            argv.extend(bindings.inputs.iter().map(|p| p.display().to_string()));
            continue;
        }
        let mut expanded = arg.clone();
        if expanded.contains("{input}") {
            let first = bindings.inputs.first().ok_or_else(|| {
                PipelineError::Validation("command requires an input".to_string())
            })?;
            expanded = expanded.replace("{input}", &first.display().to_string());
        }
        if expanded.contains("{output}") {
            let output = bindings.output.ok_or_else(|| {
                PipelineError::BackendFailure("{output} used without file collection".to_string())
            })?;
            expanded = expanded.replace("{output}", &output.display().to_string());
        }
        if expanded.contains("{outdir}") {
            expanded = expanded.replace("{outdir}", &bindings.outdir.display().to_string());
        }
        if expanded.contains("{scratch}") {
            let scratch = bindings.scratch.ok_or_else(|| {
                PipelineError::BackendFailure("scratch directory missing".to_string())
            })?;
            expanded = expanded.replace("{scratch}", &scratch.display().to_string());
        }
        if expanded.contains("{param}") {
            let parameter = bindings.parameter.ok_or_else(|| {
                PipelineError::Validation("operation requires a text parameter".to_string())
            })?;
            expanded = expanded.replace("{param}", parameter);
        }
        argv.push(expanded);
    }
    Ok(argv)
}

async fn collect_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if matches && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
    Ok(files)
}

/// Orders `page-2` before `page-10`.
fn natural_key(path: &Path) -> (String, u64) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let digits: String = stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let prefix = stem[..stem.len() - digits.len()].to_string();
    (prefix, digits.parse().unwrap_or(0))
}

fn tail_chars(raw: &str, max: usize) -> String {
    let count = raw.chars().count();
    if count <= max {
        return raw.to_string();
    }
    raw.chars().skip(count - max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OperationId;
    use crate::resource::ResourceGuard;

    fn bindings<'a>(inputs: Vec<&'a Path>, outdir: &'a Path) -> Bindings<'a> {
        Bindings {
            inputs,
            output: Some(Path::new("/work/out.pdf")),
            outdir,
            scratch: None,
            parameter: Some("top secret"),
        }
    }

    #[test]
    fn expand_args_substitutes_placeholders() {
        let template: Vec<String> = [
            "--empty",
            "--pages",
            "{inputs}",
            "--",
            "{output}",
            "--pw={param}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let argv = expand_args(
            &template,
            &bindings(vec![Path::new("/w/a.pdf"), Path::new("/w/b.pdf")], Path::new("/w/o")),
        )
        .unwrap();
        assert_eq!(
            argv,
            vec![
                "--empty",
                "--pages",
                "/w/a.pdf",
                "/w/b.pdf",
                "--",
                "/work/out.pdf",
                "--pw=top secret"
            ]
        );
    }

    #[test]
    fn expand_args_requires_parameter_when_referenced() {
        let template = vec!["{param}".to_string()];
        let mut b = bindings(vec![Path::new("/w/a.pdf")], Path::new("/w/o"));
        b.parameter = None;
        assert!(matches!(
            expand_args(&template, &b),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn natural_key_orders_numeric_suffixes() {
        let mut names = vec![
            PathBuf::from("page-10.jpg"),
            PathBuf::from("page-2.jpg"),
            PathBuf::from("page-1.jpg"),
        ];
        names.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
        assert_eq!(
            names,
            vec![
                PathBuf::from("page-1.jpg"),
                PathBuf::from("page-2.jpg"),
                PathBuf::from("page-10.jpg")
            ]
        );
    }

    #[test]
    fn tail_chars_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_collection_returns_written_output() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let input = guard.acquire("s1", Role::Input, ".pdf");
        std::fs::write(input.path(), b"content").unwrap();
        let backend = CommandBackend::new(
            "cp",
            "cp",
            &["{input}", "{output}"],
            OutputCollect::File {
                suffix: ".pdf".to_string(),
            },
        );
        let scope = guard.scope("s1");
        let op = OperationId::new("copy");
        let outputs = backend
            .invoke(&Invocation {
                operation: &op,
                inputs: &[&input],
                parameter: None,
                scope: &scope,
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read(outputs[0].path()).unwrap(), b"content");
        scope.detach(&outputs);
        drop(scope);
        // input + output remain; the scratch outdir is gone.
        assert_eq!(guard.live_count("s1"), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_collection_bundles_into_zip() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let input = guard.acquire("s1", Role::Input, ".pdf");
        std::fs::write(input.path(), b"content").unwrap();
        let backend = CommandBackend::new(
            "split",
            "sh",
            &["-c", "echo a > page-1.pdf && echo b > page-2.pdf && echo c > ignored.txt"],
            OutputCollect::Directory {
                extension: "pdf".to_string(),
                bundle: Bundle::Always,
            },
        );
        let scope = guard.scope("s1");
        let op = OperationId::new("split");
        let outputs = backend
            .invoke(&Invocation {
                operation: &op,
                inputs: &[&input],
                parameter: None,
                scope: &scope,
            })
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].extension(), Some("zip"));
        let archive =
            zip::ZipArchive::new(std::fs::File::open(outputs[0].path()).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let input = guard.acquire("s1", Role::Input, ".pdf");
        let backend = CommandBackend::new(
            "fails",
            "sh",
            &["-c", "echo broken pdf >&2; exit 3"],
            OutputCollect::File {
                suffix: ".pdf".to_string(),
            },
        );
        let scope = guard.scope("s1");
        let op = OperationId::new("fails");
        let err = backend
            .invoke(&Invocation {
                operation: &op,
                inputs: &[&input],
                parameter: None,
                scope: &scope,
            })
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("code 3"), "{message}");
        assert!(message.contains("broken pdf"), "{message}");
    }

    #[tokio::test]
    async fn missing_program_is_a_backend_failure() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let input = guard.acquire("s1", Role::Input, ".pdf");
        let backend = CommandBackend::new(
            "missing",
            "pdfdesk-definitely-not-installed",
            &["{input}"],
            OutputCollect::File {
                suffix: ".pdf".to_string(),
            },
        );
        let scope = guard.scope("s1");
        let op = OperationId::new("missing");
        let err = backend
            .invoke(&Invocation {
                operation: &op,
                inputs: &[&input],
                parameter: None,
                scope: &scope,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}
