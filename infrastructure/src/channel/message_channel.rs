//! Line-delimited JSON channel over an arbitrary byte stream pair.
//!
//! [`MessageChannel`] owns one read half and one write half (normally the
//! engine's stdout and stdin):
//!
//! 1. **Reader**: a background [`tokio::spawn`] task is the single owner of
//!    the read half and the [`LineFramer`]. Every complete line is parsed and
//!    published to subscribers; a bad line becomes a `ParseError` event and
//!    never stops the loop.
//! 2. **Writer**: serialized through a `tokio::sync::Mutex`. Each record is
//!    written with one `write_all` + `flush` while the lock is held, so
//!    concurrent senders never interleave partial lines.
//! 3. **Replies**: protocol `error` replies produced by the reader are queued
//!    to a dedicated reply task. The reader never waits on the write half, so
//!    a peer that is not draining its input cannot stall inbound delivery.
//! 4. **Subscribers**: `mpsc::UnboundedSender` tables behind
//!    `std::sync::RwLock`, keyed by message type or catching everything.
//!    Closed receivers are pruned on the next publish.
//!
//! When the read side ends (EOF or I/O error) the channel moves to the
//! closed state, publishes [`ChannelEvent::Disconnected`] to every
//! subscriber and drops all senders. A closed channel cannot be restarted.

use async_trait::async_trait;
use relay_application::ports::channel_event::{ChannelEvent, ChannelEvents};
use relay_application::ports::message_sink::{ChannelError, MessageSink};
use relay_domain::{ErrorData, FrameOutcome, LineFramer, MAX_LINE_BYTES, Message, MessageKind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Bytes requested from the read half per `read` call.
const READ_CHUNK_SIZE: usize = 8 * 1024;

type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;
type ReplyQueue = mpsc::UnboundedSender<Message>;

/// Channel behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Answer unparseable lines and records of unknown type with an `error`
    /// reply.
    pub strict_types: bool,
    /// Longest accepted inbound line. Longer lines are reported as parse
    /// errors and skipped.
    pub max_line_bytes: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            strict_types: true,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Closed,
}

#[derive(Default)]
struct Subscribers {
    all: RwLock<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    by_kind: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<ChannelEvent>>>>,
}

impl Subscribers {
    fn publish(&self, event: ChannelEvent) {
        let mut all = self.all.write().unwrap_or_else(|e| e.into_inner());
        all.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns whether any live subscriber received the event.
    fn publish_kind(&self, kind: &str, event: &ChannelEvent) -> bool {
        let mut by_kind = self.by_kind.write().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = by_kind.get_mut(kind) else {
            return false;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        let delivered = !senders.is_empty();
        if !delivered {
            by_kind.remove(kind);
        }
        delivered
    }

    /// Deliver a final event to everyone, then drop every sender.
    fn close(&self, event: ChannelEvent) {
        let all = std::mem::take(&mut *self.all.write().unwrap_or_else(|e| e.into_inner()));
        let by_kind =
            std::mem::take(&mut *self.by_kind.write().unwrap_or_else(|e| e.into_inner()));
        for tx in all.iter().chain(by_kind.values().flatten()) {
            let _ = tx.send(event.clone());
        }
    }
}

struct Shared {
    options: ChannelOptions,
    lifecycle: std::sync::Mutex<Lifecycle>,
    writer: Mutex<Option<BoxedWriter>>,
    subscribers: Subscribers,
}

impl Shared {
    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `Closed`. Only the transition out of `Running` notifies
    /// subscribers.
    fn close(&self, reason: &str) {
        let was_running = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            let was_running = *lifecycle == Lifecycle::Running;
            if was_running {
                *lifecycle = Lifecycle::Closed;
            }
            was_running
        };
        if was_running {
            info!(reason, "Message channel closed");
            self.subscribers.close(ChannelEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), ChannelError> {
        let result = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(ChannelError::Closed);
            };
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        result.map_err(|e| {
            warn!("Message channel write failed: {}", e);
            self.close(&format!("write error: {}", e));
            ChannelError::from(e)
        })
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        match self.lifecycle() {
            Lifecycle::Idle => return Err(ChannelError::NotStarted),
            Lifecycle::Closed => return Err(ChannelError::Closed),
            Lifecycle::Running => {}
        }
        let line = message.encode_line()?;
        trace!("Channel sending: {}", line.trim_end());
        self.write_line(&line).await
    }

    fn handle_outcome(&self, outcome: FrameOutcome, replies: Option<&ReplyQueue>) {
        match outcome {
            FrameOutcome::Record(message) => self.handle_record(message, replies),
            FrameOutcome::Malformed { line, reason } => {
                warn!(%reason, "Channel: discarding malformed line: {}", line);
                self.subscribers.publish(ChannelEvent::ParseError {
                    line,
                    reason: reason.clone(),
                });
                if self.options.strict_types {
                    self.reply_error(ErrorData::parse_error(&reason), replies);
                }
            }
        }
    }

    fn handle_record(&self, message: Message, replies: Option<&ReplyQueue>) {
        trace!(kind = %message.kind, "Channel received record");
        let kind = message.message_kind();
        let event = ChannelEvent::Message(message);
        let handled = self.subscribers.publish_kind(kind.as_str(), &event);
        self.subscribers.publish(event);

        if handled || kind.is_canonical() || !self.options.strict_types {
            return;
        }

        let error = ErrorData::unknown_type(kind.as_str());
        warn!(kind = %kind, "Channel: no handler for message type");
        self.subscribers.publish(ChannelEvent::ProtocolError {
            kind: kind.to_string(),
            error_code: error.error_code.clone(),
            message: error.message.clone(),
        });
        self.reply_error(error, replies);
    }

    /// Queue an `error` reply for the reply task. Never waits.
    fn reply_error(&self, error: ErrorData, replies: Option<&ReplyQueue>) {
        let Some(replies) = replies else {
            debug!(code = %error.error_code, "Channel: peer gone, error reply dropped");
            return;
        };
        match Message::from_payload(MessageKind::Error.as_str(), &error) {
            Ok(reply) => {
                if replies.send(reply).is_err() {
                    debug!("Channel: reply task stopped, error reply dropped");
                }
            }
            Err(e) => warn!("Channel: could not encode error reply: {}", e),
        }
    }
}

/// Bidirectional line-delimited JSON channel.
pub struct MessageChannel {
    shared: Arc<Shared>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new(ChannelOptions::default())
    }
}

impl MessageChannel {
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                lifecycle: std::sync::Mutex::new(Lifecycle::Idle),
                writer: Mutex::new(None),
                subscribers: Subscribers::default(),
            }),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Attach to a stream pair and start the reader task.
    pub async fn start<R, W>(&self, reader: R, writer: W) -> Result<(), ChannelError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        {
            let mut lifecycle = self
                .shared
                .lifecycle
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Err(ChannelError::AlreadyStarted),
                Lifecycle::Closed => return Err(ChannelError::Closed),
            }
        }

        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        *self.shared.writer.lock().await = Some(BufWriter::new(boxed));

        let (replies, reply_rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        self.track(tokio::spawn(reply_loop(reply_rx, shared)));

        let shared = Arc::clone(&self.shared);
        self.track(tokio::spawn(async move {
            reader_loop(reader, shared, replies).await;
        }));
        debug!("Message channel started");
        Ok(())
    }

    /// Forward each line of a diagnostic stream (the engine's stderr) as
    /// [`ChannelEvent::EngineLog`].
    pub fn attach_diagnostics<R>(&self, stream: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        debug!(target: "engine", "{}", line);
                        shared.subscribers.publish(ChannelEvent::EngineLog(line));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Engine diagnostics stream ended: {}", e);
                        break;
                    }
                }
            }
        });
        self.track(handle);
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> ChannelEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.lifecycle() != Lifecycle::Closed {
            self.shared
                .subscribers
                .all
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(tx);
        }
        rx
    }

    /// Subscribe to records of one `type`, plus the final `Disconnected`.
    ///
    /// A type with a live subscriber is considered handled, even if it is
    /// not part of the canonical protocol.
    pub fn subscribe_kind(&self, kind: impl Into<String>) -> ChannelEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.lifecycle() != Lifecycle::Closed {
            self.shared
                .subscribers
                .by_kind
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .entry(kind.into())
                .or_default()
                .push(tx);
        }
        rx
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle() == Lifecycle::Running
    }

    /// Close both directions. Idempotent; does nothing if never started.
    pub async fn stop(&self) {
        if self.shared.lifecycle() == Lifecycle::Idle {
            return;
        }
        self.shared.close("channel stopped");

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            debug!("Message channel writer shutdown: {}", e);
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

#[async_trait]
impl MessageSink for MessageChannel {
    async fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        self.shared.send(&message).await
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Background reader: single owner of the read half and the framer.
async fn reader_loop<R>(mut reader: R, shared: Arc<Shared>, replies: ReplyQueue)
where
    R: AsyncRead + Send + Unpin,
{
    let mut framer = LineFramer::with_max_line(shared.options.max_line_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let reason = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "end of stream".to_string(),
            Ok(n) => {
                for outcome in framer.push(&chunk[..n]) {
                    shared.handle_outcome(outcome, Some(&replies));
                }
            }
            Err(e) => {
                warn!("Channel reader: read error: {}", e);
                break format!("read error: {}", e);
            }
        }
    };

    // Nobody is left to answer a truncated tail.
    drop(replies);
    if let Some(outcome) = framer.finish() {
        shared.handle_outcome(outcome, None);
    }
    shared.close(&reason);
}

/// Writes queued `error` replies. Ends when the reader drops its queue.
async fn reply_loop(mut replies: mpsc::UnboundedReceiver<Message>, shared: Arc<Shared>) {
    while let Some(reply) = replies.recv().await {
        if let Err(e) = shared.send(&reply).await {
            debug!("Channel: error reply not sent: {}", e);
            if e == ChannelError::Closed {
                break;
            }
        }
    }
}
