//! Relay session: wires the channel, authority gate, dispatcher and
//! heartbeat together and runs until told to stop.

use anyhow::Result;
use relay_application::{
    AuditLogger, ChannelEvent, ChannelEvents, HeartbeatMonitor, MessageSink, RequestDispatcher,
};
use relay_domain::{AuthorityGate, MessageKind};
use relay_infrastructure::{FileConfig, MessageChannel};
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long the engine gets to answer `shutdown`.
pub const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a relay session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    EngineExited(Option<i32>),
    Disconnected(String),
}

pub struct Relay {
    config: FileConfig,
    channel: Arc<MessageChannel>,
    gate: Arc<RwLock<AuthorityGate>>,
    audit: Arc<dyn AuditLogger>,
    events: ChannelEvents,
    tool_events: ChannelEvents,
    heartbeat_events: ChannelEvents,
    acks: ChannelEvents,
}

impl Relay {
    /// Subscribe to `channel` and register the configured agents.
    ///
    /// Call before the channel is started so no inbound record is missed.
    pub fn new(
        config: FileConfig,
        channel: Arc<MessageChannel>,
        audit: Arc<dyn AuditLogger>,
    ) -> Result<Self> {
        let gate = Arc::new(RwLock::new(AuthorityGate::new()));
        {
            let mut gate = gate.write().unwrap_or_else(|e| e.into_inner());
            for (agent_id, role, ring_layer) in config.startup_agents() {
                let agent = gate.register_agent(&agent_id, role, ring_layer)?;
                info!(
                    agent_id = %agent.agent_id,
                    role = %agent.role,
                    ring_layer = %agent.ring_layer,
                    permissions = agent.permissions.len(),
                    "agent registered"
                );
            }
        }

        Ok(Self {
            events: channel.subscribe(),
            tool_events: channel.subscribe_kind(MessageKind::ToolResponse.as_str()),
            heartbeat_events: channel.subscribe_kind(MessageKind::Heartbeat.as_str()),
            acks: channel.subscribe_kind(MessageKind::ShutdownAck.as_str()),
            config,
            channel,
            gate,
            audit,
        })
    }

    pub fn gate(&self) -> Arc<RwLock<AuthorityGate>> {
        Arc::clone(&self.gate)
    }

    /// Serve until `stop` resolves or the engine disconnects, then shut down
    /// gracefully: `shutdown` -> wait for `shutdown-ack` -> stop everything.
    pub async fn run<F>(self, stop: F) -> StopReason
    where
        F: Future<Output = StopReason>,
    {
        let Relay {
            config,
            channel,
            gate,
            audit,
            mut events,
            tool_events,
            heartbeat_events,
            mut acks,
        } = self;

        let cancel = CancellationToken::new();
        let sink: Arc<dyn MessageSink> = channel.clone();
        let dispatcher = RequestDispatcher::spawn(
            config.dispatcher.to_settings(),
            gate,
            Arc::clone(&sink),
            tool_events,
            audit,
            cancel.child_token(),
        );
        let heartbeat_settings = config.heartbeat.to_settings();
        let mut heartbeat = heartbeat_settings.enabled.then(|| {
            HeartbeatMonitor::start(
                heartbeat_settings,
                Arc::clone(&sink),
                Some(heartbeat_events),
                cancel.child_token(),
            )
        });
        info!("Relay running");

        tokio::pin!(stop);
        let reason = loop {
            tokio::select! {
                reason = &mut stop => break reason,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = log_event(event) {
                            break StopReason::Disconnected(reason);
                        }
                    }
                    None => break StopReason::Disconnected("event stream closed".to_string()),
                },
            }
        };
        info!(?reason, "Relay stopping");

        request_shutdown(&channel, &mut acks).await;

        if let Some(heartbeat) = heartbeat.as_mut() {
            heartbeat.stop().await;
        }
        if let Ok(stats) = dispatcher.stats().await {
            info!(
                completed = stats.completed,
                failed = stats.failed,
                peak_active = stats.peak_active,
                "Dispatcher summary"
            );
        }
        dispatcher.shutdown().await;
        channel.stop().await;
        cancel.cancel();
        reason
    }
}

/// Log one inbound event. Returns the reason when the channel is gone.
fn log_event(event: ChannelEvent) -> Option<String> {
    match event {
        ChannelEvent::Message(message) => match message.message_kind() {
            MessageKind::Heartbeat | MessageKind::ToolResponse => {
                debug!(kind = %message.kind, "Engine message");
            }
            kind => info!(kind = %kind, data = %message.data, "Engine message"),
        },
        ChannelEvent::ParseError { line, reason } => {
            warn!(%reason, "Unparseable line from engine: {}", line);
        }
        ChannelEvent::ProtocolError {
            kind, error_code, ..
        } => warn!(%kind, %error_code, "Engine sent unsupported message type"),
        ChannelEvent::EngineLog(line) => debug!(target: "engine", "{}", line),
        ChannelEvent::Disconnected { reason } => {
            warn!(%reason, "Engine disconnected");
            return Some(reason);
        }
    }
    None
}

/// Send `shutdown` and wait up to [`SHUTDOWN_ACK_TIMEOUT`] for the ack.
async fn request_shutdown(channel: &MessageChannel, acks: &mut ChannelEvents) {
    if !channel.is_running() {
        return;
    }
    if let Err(e) = channel
        .send(MessageKind::Shutdown.as_str(), json!({}))
        .await
    {
        warn!("Could not send shutdown to engine: {}", e);
        return;
    }

    let acked = async {
        while let Some(event) = acks.recv().await {
            match event {
                ChannelEvent::Message(_) => return true,
                ChannelEvent::Disconnected { .. } => return false,
                _ => {}
            }
        }
        false
    };
    match tokio::time::timeout(SHUTDOWN_ACK_TIMEOUT, acked).await {
        Ok(true) => info!("Engine acknowledged shutdown"),
        Ok(false) => warn!("Engine disconnected before acknowledging shutdown"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_ACK_TIMEOUT.as_secs(),
            "No shutdown-ack from engine"
        ),
    }
}
