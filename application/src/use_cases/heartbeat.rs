//! Heartbeat monitor
//!
//! Sends a `heartbeat` record on a fixed interval and tracks heartbeats
//! coming back from the engine. There is no acknowledgement protocol: the
//! two directions are independent and liveness is judged purely by how
//! long the engine has been silent.

use crate::config::HeartbeatSettings;
use crate::ports::channel_event::{ChannelEvent, ChannelEvents, next_event};
use crate::ports::message_sink::{ChannelError, MessageSink};
use relay_domain::{HeartbeatData, Message, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct HeartbeatState {
    started: Instant,
    sequence: AtomicU64,
    last_sent: Mutex<Option<Instant>>,
    last_received: Mutex<Option<Instant>>,
}

impl HeartbeatState {
    fn mark(slot: &Mutex<Option<Instant>>) {
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn read(slot: &Mutex<Option<Instant>>) -> Option<Instant> {
        *slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a running heartbeat task.
pub struct HeartbeatMonitor {
    state: Arc<HeartbeatState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Start sending heartbeats through `sink`.
    ///
    /// `events`, when given, should be a subscription to `heartbeat` records
    /// from the engine (other events are ignored). The task ends when
    /// `cancel` fires or the sink reports the channel closed.
    pub fn start(
        settings: HeartbeatSettings,
        sink: Arc<dyn MessageSink>,
        events: Option<ChannelEvents>,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(HeartbeatState {
            started: Instant::now(),
            sequence: AtomicU64::new(0),
            last_sent: Mutex::new(None),
            last_received: Mutex::new(None),
        });
        let task = tokio::spawn(run(
            settings,
            sink,
            events,
            state.clone(),
            cancel.clone(),
        ));
        Self {
            state,
            cancel,
            task: Some(task),
        }
    }

    /// Number of heartbeats sent so far.
    pub fn sequence(&self) -> u64 {
        self.state.sequence.load(Ordering::Relaxed)
    }

    pub fn last_sent(&self) -> Option<Instant> {
        HeartbeatState::read(&self.state.last_sent)
    }

    pub fn last_received(&self) -> Option<Instant> {
        HeartbeatState::read(&self.state.last_received)
    }

    /// Whether the engine sent a heartbeat within `max_silence`.
    ///
    /// Before the first heartbeat arrives, silence is measured from start.
    pub fn is_alive(&self, max_silence: Duration) -> bool {
        let since = self.last_received().unwrap_or(self.state.started);
        since.elapsed() <= max_silence
    }

    /// Stop sending and wait for the task to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Heartbeat task failed: {}", e);
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    settings: HeartbeatSettings,
    sink: Arc<dyn MessageSink>,
    mut events: Option<ChannelEvents>,
    state: Arc<HeartbeatState>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let pid = std::process::id();
    info!(interval_ms = settings.interval.as_millis() as u64, "Heartbeat started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = next_event(&mut events) => match event {
                Some(ChannelEvent::Message(message)) if message.message_kind() == MessageKind::Heartbeat => {
                    HeartbeatState::mark(&state.last_received);
                }
                Some(_) => {}
                None => events = None,
            },
            _ = ticker.tick() => {
                let sequence = state.sequence.load(Ordering::Relaxed) + 1;
                let data = HeartbeatData {
                    sequence,
                    uptime_ms: state.started.elapsed().as_millis() as u64,
                    pid,
                    source: settings.source.clone(),
                };
                let message = match Message::from_payload(MessageKind::Heartbeat.as_str(), &data) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode heartbeat");
                        continue;
                    }
                };
                match sink.send_message(message).await {
                    Ok(()) => {
                        state.sequence.store(sequence, Ordering::Relaxed);
                        HeartbeatState::mark(&state.last_sent);
                    }
                    Err(ChannelError::Closed) => {
                        debug!("Channel closed, stopping heartbeat");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Failed to send heartbeat"),
                }
            }
        }
    }

    info!(sent = state.sequence.load(Ordering::Relaxed), "Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct CollectingSink {
        sent: Mutex<Vec<Message>>,
        closed: Mutex<bool>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn send_message(&self, message: Message) -> Result<(), ChannelError> {
            if *self.closed.lock().unwrap() {
                return Err(ChannelError::Closed);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings::default()
            .with_interval(Duration::from_secs(1))
            .with_source("test")
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_numbered_heartbeats() {
        let sink = CollectingSink::new();
        let mut monitor =
            HeartbeatMonitor::start(settings(), sink.clone(), None, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        monitor.stop().await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let payloads: Vec<HeartbeatData> = sent.iter().map(|m| m.payload().unwrap()).collect();
        assert_eq!(
            payloads.iter().map(|p| p.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(payloads[2].uptime_ms, 2000);
        assert_eq!(payloads[0].source, "test");
        assert_eq!(payloads[0].pid, std::process::id());
        assert!(sent.iter().all(|m| m.kind == "heartbeat"));
        assert_eq!(monitor.sequence(), 3);
        assert!(monitor.last_sent().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_engine_heartbeats() {
        let sink = CollectingSink::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut monitor =
            HeartbeatMonitor::start(settings(), sink, Some(rx), CancellationToken::new());

        assert!(monitor.last_received().is_none());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!monitor.is_alive(Duration::from_secs(2)));

        tx.send(ChannelEvent::Message(Message::new(
            "heartbeat",
            serde_json::json!({"fps": 60}),
        )))
        .unwrap();
        tx.send(ChannelEvent::EngineLog("ignored".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(monitor.last_received().is_some());
        assert!(monitor.is_alive(Duration::from_secs(2)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!monitor.is_alive(Duration::from_secs(2)));
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_channel_closes() {
        let sink = CollectingSink::new();
        let cancel = CancellationToken::new();
        let mut monitor = HeartbeatMonitor::start(settings(), sink.clone(), None, cancel.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        *sink.closed.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(monitor.sequence(), 2);
        assert!(!cancel.is_cancelled());
        // Task already exited on its own.
        monitor.stop().await;
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }
}
