//! Pipeline coordinator: applies inbound events to session state and turns
//! job outcomes into outbound instructions.
//!
//! `handle` never waits on a backend. When a session becomes ready to run, a
//! job is submitted to the executor and a completion task forwards the
//! resulting instructions on the dispatch channel once the job resolves.

use crate::commands::{self, Command};
use crate::session::{PendingInput, Session, SessionState, SessionStore, lock};
use chrono::{DateTime, Utc};
use pd_channels::{
    ByteSource, ChannelId, ChatId, ControlSignal, FileMetadata, InboundEvent, InboundEventKind,
};
use pd_ops::{
    DocumentKind, ExecutorStats, GuardStats, InputSpec, JobExecutor, JobId, JobInput, JobOutcome,
    JobReport, JobRequest, OperationDescriptor, OperationId, PipelineError, ResourceHandle, Role,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DISPATCH_BUFFER: usize = 256;
const FAILURE_DETAIL_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuOption {
    pub label: String,
    pub signal: ControlSignal,
}

/// What the transport should do next. A `SendDocument` owns its output
/// handle; the file is deleted once the instruction is dropped.
#[derive(Debug)]
pub enum Instruction {
    SendMessage(String),
    SendDocument {
        handle: ResourceHandle,
        file_name: String,
        caption: String,
    },
    ShowMenu {
        prompt: String,
        options: Vec<MenuOption>,
    },
}

/// Instructions produced outside the inbound path (job completion, expiry).
#[derive(Debug)]
pub struct Dispatch {
    pub session_id: String,
    pub channel_id: ChannelId,
    pub chat_id: ChatId,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    /// Declared sizes above this are rejected before any handle exists.
    pub max_file_bytes: u64,
    pub session_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub sessions: usize,
    pub live_handles: usize,
    pub executor: ExecutorStats,
    pub resources: GuardStats,
}

/// Where and how to deliver a job's result.
struct Delivery {
    channel_id: ChannelId,
    chat_id: ChatId,
    result_stem: String,
    output_suffix: String,
    caption: String,
}

pub struct Pipeline {
    sessions: SessionStore,
    executor: JobExecutor,
    limits: PipelineLimits,
    completions: mpsc::Sender<Dispatch>,
}

impl Pipeline {
    pub fn new(
        executor: JobExecutor,
        limits: PipelineLimits,
    ) -> (Arc<Self>, mpsc::Receiver<Dispatch>) {
        let (tx, rx) = mpsc::channel(DISPATCH_BUFFER);
        let pipeline = Arc::new(Self {
            sessions: SessionStore::new(),
            executor,
            limits,
            completions: tx,
        });
        (pipeline, rx)
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn status(&self) -> PipelineStatus {
        let resources = self.executor.guard().stats();
        PipelineStatus {
            sessions: self.sessions.len(),
            live_handles: resources.live,
            executor: self.executor.stats(),
            resources,
        }
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions
            .get(session_id)
            .map(|session| lock(&session).state.clone())
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Applies one inbound event. Events for one session are serialized by
    /// the session lock.
    pub fn handle(self: &Arc<Self>, event: InboundEvent) -> Vec<Instruction> {
        let session = self.sessions.get_or_create(&event.channel_id, &event.chat_id);
        let mut s = lock(&session);
        s.touch(event.received_at);
        let from = s.state.label();
        let kind = event.kind.label();
        let instructions = self.apply(&mut s, event.kind);
        tracing::info!(
            session = %s.id,
            event = kind,
            from,
            to = s.state.label(),
            instructions = instructions.len(),
            "session transition"
        );
        instructions
    }

    fn apply(self: &Arc<Self>, s: &mut Session, kind: InboundEventKind) -> Vec<Instruction> {
        match kind {
            InboundEventKind::Control(signal) => self.on_signal(s, signal),
            InboundEventKind::FileReceived { metadata, source } => {
                self.on_file(s, metadata, source)
            }
            InboundEventKind::TextReceived(text) => match commands::parse(&text) {
                // Parameter text is taken verbatim; only a cancel gets out.
                Some(Command::Signal(ControlSignal::Back)) => {
                    self.on_signal(s, ControlSignal::Back)
                }
                Some(_) if matches!(s.state, SessionState::AwaitingParameter { .. }) => {
                    self.on_text(s, text)
                }
                Some(Command::Menu) => {
                    self.reset(s);
                    vec![self.menu("Choose an operation:")]
                }
                Some(Command::Help) => vec![Instruction::SendMessage(commands::help_text())],
                Some(Command::Signal(signal)) => self.on_signal(s, signal),
                Some(Command::Unknown(word)) => vec![message(format!(
                    "Unknown command /{word}. Send /help for the list."
                ))],
                None => self.on_text(s, text),
            },
        }
    }

    fn on_signal(self: &Arc<Self>, s: &mut Session, signal: ControlSignal) -> Vec<Instruction> {
        match signal {
            ControlSignal::Back => {
                let was_idle = s.is_idle();
                self.reset(s);
                let mut out = Vec::with_capacity(2);
                if !was_idle {
                    out.push(message("Cancelled."));
                }
                out.push(self.menu("Choose an operation:"));
                out
            }
            ControlSignal::Finish => match s.state.clone() {
                SessionState::CollectingMultiple { operation } => {
                    self.finish_collection(s, &operation)
                }
                SessionState::Executing { .. } => vec![busy()],
                _ => vec![message("There is nothing to finish right now.")],
            },
            ControlSignal::Select(raw) => match s.state {
                SessionState::Executing { .. } => vec![busy()],
                SessionState::Idle => self.select(s, &raw),
                // Picking another operation mid-flow abandons the current one.
                _ => {
                    self.reset(s);
                    self.select(s, &raw)
                }
            },
        }
    }

    fn select(&self, s: &mut Session, raw: &str) -> Vec<Instruction> {
        let registry = self.executor.registry();
        let descriptor = match registry.resolve(raw).and_then(|id| registry.lookup(&id)) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::warn!(session = %s.id, selection = %raw, "rejected selection");
                return vec![message(describe(&err)), self.menu("Choose an operation:")];
            }
        };
        match &descriptor.input {
            InputSpec::Slots { .. } => {
                s.state = SessionState::AwaitingInput {
                    operation: descriptor.id.clone(),
                    slot: 0,
                };
                vec![slot_prompt(&descriptor, 0)]
            }
            InputSpec::Collection { kind, min, max } => {
                s.state = SessionState::CollectingMultiple {
                    operation: descriptor.id.clone(),
                };
                vec![collection_prompt(
                    format!(
                        "{}: send {min} to {max} files ({}) one by one, then press Done.",
                        descriptor.label,
                        kind.label()
                    ),
                )]
            }
        }
    }

    fn on_file(
        self: &Arc<Self>,
        s: &mut Session,
        metadata: FileMetadata,
        source: Arc<dyn ByteSource>,
    ) -> Vec<Instruction> {
        match s.state.clone() {
            SessionState::AwaitingInput { operation, slot } => {
                let Some(descriptor) = self.descriptor_or_reset(s, &operation) else {
                    return vec![message(describe(&PipelineError::UnknownOperation(
                        operation.to_string(),
                    )))];
                };
                let InputSpec::Slots { kinds, parameter } = &descriptor.input else {
                    return vec![unexpected()];
                };
                let Some(kind) = kinds.get(slot).copied() else {
                    return vec![unexpected()];
                };
                if let Err(err) = self.check_file(kind, &metadata) {
                    return vec![message(describe(&err))];
                }
                self.accept(s, kind, metadata, source);
                if slot + 1 < kinds.len() {
                    s.state = SessionState::AwaitingInput {
                        operation,
                        slot: slot + 1,
                    };
                    vec![slot_prompt(&descriptor, slot + 1)]
                } else if let Some(parameter) = parameter {
                    s.state = SessionState::AwaitingParameter { operation };
                    vec![Instruction::ShowMenu {
                        prompt: parameter.prompt.clone(),
                        options: vec![cancel_option()],
                    }]
                } else {
                    self.start_job(s, descriptor)
                }
            }
            SessionState::CollectingMultiple { operation } => {
                let Some(descriptor) = self.descriptor_or_reset(s, &operation) else {
                    return vec![message(describe(&PipelineError::UnknownOperation(
                        operation.to_string(),
                    )))];
                };
                let InputSpec::Collection { kind, min, max } = descriptor.input else {
                    return vec![unexpected()];
                };
                if s.inputs.len() >= max {
                    return vec![collection_prompt(format!(
                        "At most {max} files can be combined. Press Done to continue."
                    ))];
                }
                if let Err(err) = self.check_file(kind, &metadata) {
                    return vec![message(describe(&err))];
                }
                self.accept(s, kind, metadata, source);
                let count = s.inputs.len();
                let hint = if count < min {
                    format!("Send at least {} more.", min - count)
                } else {
                    "Send more or press Done.".to_string()
                };
                vec![collection_prompt(format!("Received {count} file(s). {hint}"))]
            }
            SessionState::Idle => vec![
                message("Choose an operation first."),
                self.menu("Choose an operation:"),
            ],
            SessionState::AwaitingParameter { .. } => vec![message(
                "Expected text, not a file. Send the text or /cancel.",
            )],
            SessionState::Executing { .. } => vec![busy()],
        }
    }

    fn on_text(self: &Arc<Self>, s: &mut Session, text: String) -> Vec<Instruction> {
        match s.state.clone() {
            SessionState::AwaitingParameter { operation } => {
                let Some(descriptor) = self.descriptor_or_reset(s, &operation) else {
                    return vec![message(describe(&PipelineError::UnknownOperation(
                        operation.to_string(),
                    )))];
                };
                let InputSpec::Slots {
                    parameter: Some(spec),
                    ..
                } = &descriptor.input
                else {
                    return vec![unexpected()];
                };
                let value = text.trim();
                if value.is_empty() {
                    return vec![message(describe(&PipelineError::Validation(
                        "the text must not be empty".to_string(),
                    )))];
                }
                if value.chars().count() > spec.max_chars {
                    return vec![message(describe(&PipelineError::Validation(format!(
                        "the text is too long (max {} characters)",
                        spec.max_chars
                    ))))];
                }
                s.parameter = Some(value.to_string());
                self.start_job(s, descriptor)
            }
            SessionState::Idle => vec![self.menu("Choose an operation:")],
            SessionState::Executing { .. } => vec![busy()],
            SessionState::AwaitingInput { .. } | SessionState::CollectingMultiple { .. } => {
                vec![message("Expected a file. Send the document or /cancel.")]
            }
        }
    }

    fn finish_collection(
        self: &Arc<Self>,
        s: &mut Session,
        operation: &OperationId,
    ) -> Vec<Instruction> {
        let Some(descriptor) = self.descriptor_or_reset(s, operation) else {
            return vec![message(describe(&PipelineError::UnknownOperation(
                operation.to_string(),
            )))];
        };
        let InputSpec::Collection { min, .. } = descriptor.input else {
            return vec![unexpected()];
        };
        if s.inputs.len() < min {
            return vec![collection_prompt(format!(
                "At least {min} files are needed, {} received so far.",
                s.inputs.len()
            ))];
        }
        self.start_job(s, descriptor)
    }

    fn start_job(
        self: &Arc<Self>,
        s: &mut Session,
        descriptor: Arc<OperationDescriptor>,
    ) -> Vec<Instruction> {
        let pending = std::mem::take(&mut s.inputs);
        let delivery = Delivery {
            channel_id: s.channel_id.clone(),
            chat_id: s.chat_id.clone(),
            result_stem: result_stem(pending.first().map(|p| p.metadata.file_name.as_str())),
            output_suffix: descriptor.output_suffix.clone(),
            caption: descriptor.caption.clone(),
        };
        let job_id = JobId::new();
        let request = JobRequest {
            job_id,
            session_id: s.id.clone(),
            descriptor: descriptor.clone(),
            inputs: pending.into_iter().map(|p| p.input).collect(),
            parameter: s.parameter.take(),
        };
        let ticket = self.executor.submit(request);
        s.state = SessionState::Executing { job_id };

        let pipeline = self.clone();
        tokio::spawn(async move {
            let report = ticket.wait().await;
            if let Some(dispatch) = pipeline.complete(report, delivery) {
                if pipeline.completions.send(dispatch).await.is_err() {
                    tracing::warn!("dispatch channel closed; dropping job result");
                }
            }
        });
        vec![message(format!("⏳ {}: working on it...", descriptor.label))]
    }

    /// Applies a job outcome. Outcomes of jobs the session no longer waits
    /// on are dropped, which releases their output handles.
    fn complete(&self, report: JobReport, delivery: Delivery) -> Option<Dispatch> {
        let session = self.sessions.get(&report.session_id);
        let Some(session) = session else {
            tracing::info!(
                session = %report.session_id,
                job_id = %report.job_id,
                outcome = report.outcome.label(),
                "discarding outcome for removed session"
            );
            return None;
        };
        let mut s = lock(&session);
        if s.state != (SessionState::Executing { job_id: report.job_id }) {
            tracing::info!(
                session = %s.id,
                job_id = %report.job_id,
                outcome = report.outcome.label(),
                state = s.state.label(),
                "discarding outcome of orphaned job"
            );
            return None;
        }
        s.reset();
        s.touch(Utc::now());
        Some(Dispatch {
            session_id: s.id.clone(),
            channel_id: delivery.channel_id.clone(),
            chat_id: delivery.chat_id.clone(),
            instructions: self.outcome_instructions(report.outcome, delivery),
        })
    }

    fn outcome_instructions(&self, outcome: JobOutcome, delivery: Delivery) -> Vec<Instruction> {
        let mut out = Vec::new();
        match outcome {
            JobOutcome::Success(outputs) => {
                let count = outputs.len();
                for (index, handle) in outputs.into_iter().enumerate() {
                    let extension = handle.extension().unwrap_or("bin").to_string();
                    let file_name = if count > 1 {
                        format!("{}_{}.{extension}", delivery.result_stem, index + 1)
                    } else if delivery.output_suffix.is_empty() {
                        format!("{}.{extension}", delivery.result_stem)
                    } else {
                        format!("{}{}", delivery.result_stem, delivery.output_suffix)
                    };
                    out.push(Instruction::SendDocument {
                        handle,
                        file_name,
                        caption: delivery.caption.clone(),
                    });
                }
            }
            JobOutcome::Failure(err) => out.push(message(describe(&err))),
            JobOutcome::Timeout(limit) => {
                out.push(message(describe(&PipelineError::Timeout(limit))))
            }
            JobOutcome::Cancelled => out.push(message(
                "The service is restarting. Please try again in a moment.",
            )),
        }
        out.push(self.menu("Choose the next operation:"));
        out
    }

    /// Resets sessions idle for longer than the session timeout. Executing
    /// sessions are skipped: the job timeout bounds them and completion
    /// touches the session.
    pub fn expire_idle(&self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let mut removable = Vec::new();
        for session in self.sessions.handles() {
            let mut s = lock(&session);
            if matches!(s.state, SessionState::Executing { .. }) {
                continue;
            }
            let expired = (now - s.last_active)
                .to_std()
                .is_ok_and(|idle| idle > self.limits.session_timeout);
            if !expired {
                continue;
            }
            if s.is_idle() {
                removable.push(s.id.clone());
                continue;
            }
            let from = s.state.label();
            let released = s.reset();
            s.touch(now);
            tracing::info!(session = %s.id, from, released, "session expired");
            dispatches.push(Dispatch {
                session_id: s.id.clone(),
                channel_id: s.channel_id.clone(),
                chat_id: s.chat_id.clone(),
                instructions: vec![message(
                    "⌛ Session expired due to inactivity. Send /start to begin again.",
                )],
            });
        }
        for id in removable {
            if self.sessions.remove_if_idle(&id) {
                tracing::debug!(session = %id, "idle session removed");
            }
        }
        dispatches
    }

    fn reset(&self, s: &mut Session) {
        if s.is_idle() && s.inputs.is_empty() {
            return;
        }
        if let SessionState::Executing { job_id } = &s.state {
            tracing::info!(session = %s.id, job_id = %job_id, "session left a running job");
        }
        let released = s.reset();
        tracing::debug!(session = %s.id, released, "session reset");
    }

    fn descriptor_or_reset(
        &self,
        s: &mut Session,
        operation: &OperationId,
    ) -> Option<Arc<OperationDescriptor>> {
        match self.executor.registry().lookup(operation) {
            Ok(descriptor) => Some(descriptor),
            Err(_) => {
                self.reset(s);
                None
            }
        }
    }

    fn check_file(&self, kind: DocumentKind, metadata: &FileMetadata) -> Result<(), PipelineError> {
        if !kind.accepts(metadata) {
            return Err(PipelineError::Validation(format!(
                "expected a {}, got {}",
                kind.label(),
                metadata.file_name
            )));
        }
        if let Some(size) = metadata.size {
            if size > self.limits.max_file_bytes {
                return Err(PipelineError::ResourceExhausted {
                    size,
                    limit: self.limits.max_file_bytes,
                });
            }
        }
        Ok(())
    }

    fn accept(
        &self,
        s: &mut Session,
        kind: DocumentKind,
        metadata: FileMetadata,
        source: Arc<dyn ByteSource>,
    ) {
        let handle = self
            .executor
            .guard()
            .acquire(&s.id, Role::Input, &kind.input_suffix(&metadata));
        s.inputs.push(PendingInput {
            metadata,
            input: JobInput {
                handle,
                source: Some(source),
            },
        });
    }

    fn menu(&self, prompt: &str) -> Instruction {
        Instruction::ShowMenu {
            prompt: prompt.to_string(),
            options: self
                .executor
                .registry()
                .menu()
                .into_iter()
                .map(|(id, label)| MenuOption {
                    label,
                    signal: ControlSignal::Select(id.to_string()),
                })
                .collect(),
        }
    }
}

fn message(text: impl Into<String>) -> Instruction {
    Instruction::SendMessage(text.into())
}

fn busy() -> Instruction {
    message("⏳ Still working on your previous request. Send /cancel to abandon it.")
}

fn unexpected() -> Instruction {
    message("That was unexpected here. Send /cancel to start over.")
}

fn cancel_option() -> MenuOption {
    MenuOption {
        label: "Cancel".to_string(),
        signal: ControlSignal::Back,
    }
}

fn slot_prompt(descriptor: &OperationDescriptor, slot: usize) -> Instruction {
    let (kind, total) = match &descriptor.input {
        InputSpec::Slots { kinds, .. } => (
            kinds.get(slot).copied().unwrap_or(DocumentKind::Any),
            kinds.len(),
        ),
        InputSpec::Collection { kind, .. } => (*kind, 1),
    };
    let position = if total > 1 {
        format!(" ({} of {total})", slot + 1)
    } else {
        String::new()
    };
    Instruction::ShowMenu {
        prompt: format!("{}: send a {}{position}.", descriptor.label, kind.label()),
        options: vec![cancel_option()],
    }
}

fn collection_prompt(prompt: String) -> Instruction {
    Instruction::ShowMenu {
        prompt,
        options: vec![
            MenuOption {
                label: "Done".to_string(),
                signal: ControlSignal::Finish,
            },
            cancel_option(),
        ],
    }
}

fn result_stem(input_name: Option<&str>) -> String {
    let stem: String = input_name
        .and_then(|name| Path::new(name).file_stem())
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\'))
        .collect();
    if stem.trim().is_empty() {
        "document".to_string()
    } else {
        stem
    }
}

fn human_size(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    if bytes >= MB && bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

/// User-facing text for an error. Leak-guard details never reach users.
fn describe(err: &PipelineError) -> String {
    match err {
        PipelineError::Validation(reason) => format!("⚠️ Invalid input: {reason}."),
        PipelineError::UnknownOperation(_) => {
            "⚠️ Unknown operation. Please choose one from the menu.".to_string()
        }
        PipelineError::BackendFailure(reason) => {
            let detail: String = reason.chars().take(FAILURE_DETAIL_CHARS).collect();
            format!("❌ Processing failed: {detail}")
        }
        PipelineError::Timeout(limit) => format!(
            "⏱ The operation took longer than {}s and was stopped.",
            limit.as_secs()
        ),
        PipelineError::ResourceExhausted { limit, .. } => format!(
            "⚠️ The file is too large. The maximum is {}.",
            human_size(*limit)
        ),
        PipelineError::LeakGuard(_) | PipelineError::Io(_) => {
            "❌ Internal error. Please try again.".to_string()
        }
    }
}
