//! Event multiplexer: inbound events, job completions and the expiry tick all
//! feed a single loop. Rendering and sending happen on per-chat outbound
//! queues so a slow chat never holds up the loop or other chats.

use crate::pipeline::{Dispatch, Instruction, MenuOption, Pipeline};
use crate::session::session_key;
use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use pd_channels::{Attachment, Button, ChannelAdapter, InboundEvent, MessageId, OutboundMessage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MENU_COLUMNS: usize = 2;
const OUTBOX_IDLE: Duration = Duration::from_secs(60);

pub struct Gateway {
    pipeline: Arc<Pipeline>,
    outbox: Arc<Outbox>,
    inbound_rx: Mutex<mpsc::Receiver<InboundEvent>>,
    completions_rx: Mutex<mpsc::Receiver<Dispatch>>,
    expiry_interval: Duration,
}

impl Gateway {
    pub fn new(
        pipeline: Arc<Pipeline>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
        completions_rx: mpsc::Receiver<Dispatch>,
        expiry_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            outbox: Arc::new(Outbox::new(channels, OUTBOX_IDLE)),
            inbound_rx: Mutex::new(inbound_rx),
            completions_rx: Mutex::new(completions_rx),
            expiry_interval,
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut inbound_rx = self.inbound_rx.lock().await;
        let mut completions_rx = self.completions_rx.lock().await;
        let mut expiry = tokio::time::interval(self.expiry_interval);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway shutting down");
                    return Ok(());
                }
                event = inbound_rx.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("inbound channel closed");
                        return Ok(());
                    };
                    self.handle_inbound(event);
                }
                Some(dispatch) = completions_rx.recv() => {
                    self.outbox.enqueue(dispatch, None);
                }
                _ = expiry.tick() => {
                    for dispatch in self.pipeline.expire_idle(Utc::now()) {
                        self.outbox.enqueue(dispatch, None);
                    }
                }
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %event.channel_id, chat = %event.chat_id, kind = event.kind.label())
    )]
    fn handle_inbound(&self, event: InboundEvent) {
        let reply_to = event.message_id.clone();
        let channel_id = event.channel_id.clone();
        let chat_id = event.chat_id.clone();
        let instructions = self.pipeline.handle(event);
        let dispatch = Dispatch {
            session_id: session_key(&channel_id, &chat_id),
            channel_id,
            chat_id,
            instructions,
        };
        self.outbox.enqueue(dispatch, Some(reply_to));
    }
}

struct Outgoing {
    dispatch: Dispatch,
    reply_to: Option<MessageId>,
}

/// One ordered queue and worker per session key. A worker that stays idle
/// for `idle` removes its own queue and exits.
struct Outbox {
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    queues: DashMap<String, mpsc::UnboundedSender<Outgoing>>,
    idle: Duration,
}

impl Outbox {
    fn new(channels: HashMap<String, Arc<dyn ChannelAdapter>>, idle: Duration) -> Self {
        Self {
            channels,
            queues: DashMap::new(),
            idle,
        }
    }

    fn enqueue(self: &Arc<Self>, dispatch: Dispatch, reply_to: Option<MessageId>) {
        let key = dispatch.session_id.clone();
        let item = Outgoing { dispatch, reply_to };
        // The entry stays locked until the item is queued.
        let mut queue = self
            .queues
            .entry(key.clone())
            .or_insert_with(|| self.spawn_worker(key.clone()));
        if let Err(mpsc::error::SendError(item)) = queue.send(item) {
            *queue = self.spawn_worker(key);
            if queue.send(item).is_err() {
                tracing::warn!("outbound worker unavailable; dropping instructions");
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, key: String) -> mpsc::UnboundedSender<Outgoing> {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = self.clone();
        tokio::spawn(async move { outbox.drain(key, rx).await });
        tx
    }

    async fn drain(self: Arc<Self>, key: String, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
        loop {
            match tokio::time::timeout(self.idle, rx.recv()).await {
                Ok(Some(item)) => self.deliver(item).await,
                Ok(None) => return,
                Err(_) => {
                    if self.queues.remove_if(&key, |_, _| rx.is_empty()).is_some() {
                        tracing::trace!(session = %key, "outbound queue retired");
                        return;
                    }
                }
            }
        }
    }

    async fn deliver(&self, item: Outgoing) {
        let Outgoing { dispatch, reply_to } = item;
        let Some(channel) = self.channels.get(dispatch.channel_id.as_str()) else {
            tracing::warn!(
                channel = %dispatch.channel_id,
                "no adapter for channel; dropping instructions"
            );
            return;
        };
        if let Err(e) = send_instructions(
            channel.as_ref(),
            dispatch.chat_id.as_str(),
            dispatch.instructions,
            reply_to,
        )
        .await
        {
            tracing::warn!(%e, chat = %dispatch.chat_id, "delivery failed");
        }
    }
}

/// Sends instructions in order. Each document's handle is held until its
/// upload finishes and released right after.
pub async fn send_instructions(
    channel: &dyn ChannelAdapter,
    recipient: &str,
    instructions: Vec<Instruction>,
    reply_to: Option<MessageId>,
) -> Result<()> {
    let mut reply_to = reply_to;
    for instruction in instructions {
        let mut message = render(&instruction);
        message.reply_to_message_id = reply_to.take();
        if !message.attachments.is_empty() && !channel.supports_documents() {
            tracing::warn!(channel = channel.channel_id(), "channel cannot carry documents");
            continue;
        }
        channel.send(recipient, message).await?;
        drop(instruction);
    }
    Ok(())
}

pub fn render(instruction: &Instruction) -> OutboundMessage {
    match instruction {
        Instruction::SendMessage(text) => OutboundMessage::text(text.clone()),
        Instruction::ShowMenu { prompt, options } => OutboundMessage {
            keyboard: keyboard(options),
            ..OutboundMessage::text(prompt.clone())
        },
        Instruction::SendDocument {
            handle,
            file_name,
            caption,
        } => OutboundMessage {
            attachments: vec![Attachment {
                name: file_name.clone(),
                content_type: content_type(file_name).to_string(),
                path: handle.path().to_path_buf(),
            }],
            ..OutboundMessage::text(caption.clone())
        },
    }
}

fn keyboard(options: &[MenuOption]) -> Vec<Vec<Button>> {
    options
        .chunks(MENU_COLUMNS)
        .map(|row| {
            row.iter()
                .map(|option| Button::new(option.label.clone(), &option.signal))
                .collect()
        })
        .collect()
}

fn content_type(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "csv" => "text/csv",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::pipeline::PipelineLimits;
    use pd_channels::{ChannelId, ChatId, ControlSignal, InboundEventKind};
    use pd_ops::{ExecutorConfig, JobExecutor, OperationRegistry, ResourceGuard, Role};
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingChannel {
        sent: StdMutex<Vec<(String, OutboundMessage, bool)>>,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn channel_id(&self) -> &str {
            "test"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
            let files_present = message.attachments.iter().all(|a| a.path.exists());
            self.sent
                .lock()
                .unwrap()
                .push((recipient_id.to_string(), message, files_present));
            Ok(())
        }
    }

    /// Records sends; every send to `slow_chat` takes `delay` first.
    struct SlowChannel {
        slow_chat: &'static str,
        delay: Duration,
        sent: StdMutex<Vec<(String, String)>>,
    }

    impl SlowChannel {
        fn sent_to(&self, chat: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(recipient, _)| recipient == chat)
                .map(|(_, content)| content.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChannelAdapter for SlowChannel {
        fn channel_id(&self) -> &str {
            "test"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
            if recipient_id == self.slow_chat {
                tokio::time::sleep(self.delay).await;
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient_id.to_string(), message.content));
            Ok(())
        }
    }

    fn text(chat: &str, text: &str) -> InboundEvent {
        InboundEvent {
            message_id: MessageId::new("1"),
            channel_id: ChannelId::new("test"),
            chat_id: ChatId::new(chat),
            kind: InboundEventKind::TextReceived(text.to_string()),
            received_at: Utc::now(),
        }
    }

    async fn wait_until(deadline: Duration, done: impl Fn() -> bool) -> Duration {
        let started = Instant::now();
        while !done() {
            assert!(started.elapsed() < deadline, "timed out after {deadline:?}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        started.elapsed()
    }

    #[tokio::test]
    async fn slow_chat_does_not_hold_up_other_chats() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JobExecutor::new(
            ExecutorConfig {
                max_concurrent_jobs: 1,
                max_input_bytes: 1024,
            },
            Arc::new(OperationRegistry::new()),
            ResourceGuard::new(dir.path()).unwrap(),
        )
        .unwrap();
        let (pipeline, completions_rx) = Pipeline::new(
            executor,
            PipelineLimits {
                max_file_bytes: 1024,
                session_timeout: Duration::from_secs(60),
            },
        );
        let channel = Arc::new(SlowChannel {
            slow_chat: "A",
            delay: Duration::from_millis(400),
            sent: StdMutex::new(Vec::new()),
        });
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        channels.insert("test".to_string(), channel.clone());
        let (tx, inbound_rx) = mpsc::channel(8);
        let gateway = Arc::new(Gateway::new(
            pipeline,
            channels,
            inbound_rx,
            completions_rx,
            Duration::from_secs(60),
        ));
        let shutdown = CancellationToken::new();
        let task = gateway.start(shutdown.clone());

        tx.send(text("A", "hi")).await.unwrap();
        tx.send(text("A", "/help")).await.unwrap();
        tx.send(text("B", "hi")).await.unwrap();

        let waited = wait_until(Duration::from_secs(2), || !channel.sent_to("B").is_empty()).await;
        assert!(waited < Duration::from_millis(300), "B waited {waited:?}");
        assert!(channel.sent_to("A").is_empty());

        wait_until(Duration::from_secs(3), || channel.sent_to("A").len() == 2).await;
        let a = channel.sent_to("A");
        assert_eq!(a[0], channel.sent_to("B")[0]);
        assert!(a[1].starts_with("Commands:"), "{a:?}");

        shutdown.cancel();
        task.await.unwrap();
    }

    fn option(label: &str) -> MenuOption {
        MenuOption {
            label: label.to_string(),
            signal: ControlSignal::Select(label.to_ascii_lowercase()),
        }
    }

    #[test]
    fn menu_renders_two_buttons_per_row() {
        let message = render(&Instruction::ShowMenu {
            prompt: "Choose".to_string(),
            options: vec![option("A"), option("B"), option("C")],
        });
        assert_eq!(message.content, "Choose");
        assert_eq!(message.keyboard.len(), 2);
        assert_eq!(message.keyboard[0].len(), 2);
        assert_eq!(message.keyboard[1][0].callback_data, "op:c");
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type("a.PDF"), "application/pdf");
        assert_eq!(content_type("pages.zip"), "application/zip");
        assert_eq!(content_type("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn documents_are_released_after_upload() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let handle = guard.acquire("test:1", Role::Output, ".pdf");
        std::fs::write(handle.path(), b"%PDF").unwrap();
        let path = handle.path().to_path_buf();

        let channel = RecordingChannel::default();
        send_instructions(
            &channel,
            "1",
            vec![
                Instruction::SendDocument {
                    handle,
                    file_name: "report_compressed.pdf".to_string(),
                    caption: "done".to_string(),
                },
                Instruction::SendMessage("next".to_string()),
            ],
            Some(MessageId::new("42")),
        )
        .await
        .unwrap();

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].2, "file must exist while uploading");
        assert_eq!(sent[0].1.attachments[0].name, "report_compressed.pdf");
        assert_eq!(sent[0].1.reply_to_message_id, Some(MessageId::new("42")));
        assert_eq!(sent[1].1.reply_to_message_id, None);
        assert!(!path.exists());
        assert_eq!(guard.live_total(), 0);
    }
}
