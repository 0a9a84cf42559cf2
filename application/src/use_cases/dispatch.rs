//! Request dispatcher use case
//!
//! Multiplexes tool requests from many agents over a single message channel.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──> back-end switch ──(off)──> BackendDisabled       (caller side)
//!                 │
//!                 └──> authority check ──(denied)──> Unauthorized
//!                 │
//!                 └──> actor: cache hit ──> Completed          (no transport)
//!                            │
//!                            └──> queue ──> in flight ──> Completed | Failed
//! ```
//!
//! The back-end switch and the authority check run synchronously in
//! [`RequestDispatcher::submit`].
//! Everything after admission is owned by a single actor task that holds the
//! queue, the in-flight table and the response cache, so the concurrency
//! ceiling needs no locking: `active` is the size of the in-flight table and
//! only the actor changes it.
//!
//! # Failure semantics
//!
//! - A `Disconnected` event (or the end of the event stream) fails every
//!   queued and in-flight request with [`DispatchError::Transport`] and
//!   latches the dispatcher: later cache misses fail the same way without
//!   touching the sink. Cache hits are still served.
//! - A request not answered within `request_timeout` fails with
//!   [`DispatchError::Timeout`]; its correlation id is retired and a late
//!   reply is discarded as unmatched.
//! - Failures are never retried.

use crate::config::DispatcherSettings;
use crate::ports::audit_logger::{AuditEvent, AuditLogger};
use crate::ports::channel_event::{ChannelEvent, ChannelEvents, next_event};
use crate::ports::message_sink::{ChannelError, MessageSink};
use relay_domain::{
    AuthorityGate, CacheKey, CorrelationId, Message, MessageKind, RequestState, ResponseEnvelope,
    RingLayer, ToolRequest, ToolResponse,
};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Errors a dispatched request can resolve with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Agent {agent_id} is not authorized for {backend} (requires layer {required_layer})")]
    Unauthorized {
        agent_id: String,
        backend: String,
        required_layer: RingLayer,
    },

    #[error("Tool back-end {backend} is disabled")]
    BackendDisabled { backend: String },

    #[error("{server}.{action} failed: {message}")]
    Backend {
        server: String,
        action: String,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout {
        request_id: CorrelationId,
        timeout_ms: u64,
    },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Dispatcher stopped")]
    Stopped,
}

pub type DispatchResult = Result<ToolResponse, DispatchError>;

/// Snapshot of the dispatcher's internal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub active: usize,
    pub queued: usize,
    pub in_flight_ids: Vec<CorrelationId>,
    pub cached: usize,
    pub max_concurrent: usize,
    /// Highest `active` value observed so far.
    pub peak_active: usize,
    pub completed: u64,
    pub failed: u64,
    pub disconnected: bool,
    /// Back-ends switched off in the settings.
    pub disabled_backends: Vec<String>,
}

/// Handle to a submitted request.
#[derive(Debug)]
pub struct ResponseTicket {
    id: CorrelationId,
    rx: oneshot::Receiver<DispatchResult>,
}

impl ResponseTicket {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the request to resolve.
    pub async fn wait(self) -> DispatchResult {
        self.rx.await.unwrap_or(Err(DispatchError::Stopped))
    }
}

struct PendingRequest {
    id: CorrelationId,
    request: ToolRequest,
    cache_key: CacheKey,
    enqueued_at: Instant,
    state: RequestState,
    reply: oneshot::Sender<DispatchResult>,
}

impl PendingRequest {
    fn advance(&mut self, state: RequestState) {
        trace!(request_id = %self.id, from = ?self.state, to = ?state, "Request state");
        self.state = state;
    }

    /// Hand the outcome to the caller. The state must already be terminal.
    fn resolve(self, result: DispatchResult) {
        debug_assert!(self.state.is_terminal(), "resolved in state {:?}", self.state);
        // The caller may have dropped its ticket.
        let _ = self.reply.send(result);
    }

    fn audit_payload(&self) -> serde_json::Value {
        json!({
            "requestId": self.id,
            "agentId": self.request.agent_id,
            "server": self.request.backend,
            "action": self.request.action,
            "state": self.state,
        })
    }
}

struct InFlight {
    pending: PendingRequest,
    sent_at: Instant,
    deadline: Instant,
}

enum Command {
    Submit(PendingRequest),
    Stats(oneshot::Sender<DispatcherStats>),
    ClearCache(oneshot::Sender<usize>),
    Rebind {
        sink: Arc<dyn MessageSink>,
        events: ChannelEvents,
    },
}

/// Client handle to the dispatcher actor. Cheap to clone.
#[derive(Clone)]
pub struct RequestDispatcher {
    commands: mpsc::UnboundedSender<Command>,
    disabled_backends: Arc<[String]>,
    gate: Arc<RwLock<AuthorityGate>>,
    audit: Arc<dyn AuditLogger>,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RequestDispatcher {
    /// Start the dispatcher actor.
    ///
    /// `events` must be a subscription to the same channel `sink` writes to.
    /// Cancelling `cancel` (or calling [`shutdown`](Self::shutdown)) stops the
    /// actor and fails outstanding work with [`DispatchError::Stopped`].
    pub fn spawn(
        settings: DispatcherSettings,
        gate: Arc<RwLock<AuthorityGate>>,
        sink: Arc<dyn MessageSink>,
        events: ChannelEvents,
        audit: Arc<dyn AuditLogger>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            max_concurrent_ops = settings.max_concurrent_ops,
            batch_requests = settings.batch_requests,
            cache_responses = settings.cache_responses,
            disabled_backends = ?settings.disabled_backends,
            "Starting request dispatcher"
        );
        let disabled_backends: Arc<[String]> = settings.disabled_backends.clone().into();
        let actor = DispatcherActor {
            settings,
            sink,
            events: Some(events),
            audit: audit.clone(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            cache: HashMap::new(),
            disconnected: None,
            peak_active: 0,
            completed: 0,
            failed: 0,
        };
        let task = tokio::spawn(actor.run(rx, cancel.clone()));

        Self {
            commands: tx,
            disabled_backends,
            gate,
            audit,
            next_id: Arc::new(AtomicU64::new(0)),
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Admit a request.
    ///
    /// Fails synchronously with [`DispatchError::BackendDisabled`] when the
    /// back-end is switched off, and with [`DispatchError::Unauthorized`]
    /// when the agent lacks the required layer or permission. Nothing is
    /// queued and nothing is sent in either case.
    pub fn submit(&self, request: ToolRequest) -> Result<ResponseTicket, DispatchError> {
        if self.disabled_backends.contains(&request.backend) {
            warn!(
                agent_id = %request.agent_id,
                backend = %request.backend,
                action = %request.action,
                "Request rejected: back-end disabled"
            );
            self.audit.log(AuditEvent::new(
                "request_rejected",
                json!({
                    "agentId": request.agent_id,
                    "server": request.backend,
                    "action": request.action,
                    "state": RequestState::Rejected,
                    "reason": "backend_disabled",
                }),
            ));
            return Err(DispatchError::BackendDisabled {
                backend: request.backend,
            });
        }

        let authorized = self
            .gate
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .check_authority(
                &request.agent_id,
                request.required_layer,
                request.permission.as_deref(),
            );

        if !authorized {
            warn!(
                agent_id = %request.agent_id,
                backend = %request.backend,
                action = %request.action,
                required_layer = %request.required_layer,
                "Request rejected by authority gate"
            );
            self.audit.log(AuditEvent::new(
                "request_rejected",
                json!({
                    "agentId": request.agent_id,
                    "server": request.backend,
                    "action": request.action,
                    "requiredLayer": request.required_layer,
                    "permission": request.permission,
                    "state": RequestState::Rejected,
                    "reason": "unauthorized",
                }),
            ));
            return Err(DispatchError::Unauthorized {
                agent_id: request.agent_id,
                backend: request.backend,
                required_layer: request.required_layer,
            });
        }

        let id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (reply, rx) = oneshot::channel();
        let pending = PendingRequest {
            id,
            cache_key: request.cache_key(),
            request,
            enqueued_at: Instant::now(),
            state: RequestState::Queued,
            reply,
        };
        self.commands
            .send(Command::Submit(pending))
            .map_err(|_| DispatchError::Stopped)?;
        Ok(ResponseTicket { id, rx })
    }

    /// Submit and wait for the outcome.
    pub async fn call(&self, request: ToolRequest) -> DispatchResult {
        self.submit(request)?.wait().await
    }

    pub async fn stats(&self) -> Result<DispatcherStats, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| DispatchError::Stopped)?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Drop every cached response. Returns how many were removed.
    pub async fn clear_cache(&self) -> Result<usize, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ClearCache(tx))
            .map_err(|_| DispatchError::Stopped)?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Attach to a fresh channel after a disconnect. The cache is kept.
    pub fn rebind(
        &self,
        sink: Arc<dyn MessageSink>,
        events: ChannelEvents,
    ) -> Result<(), DispatchError> {
        self.commands
            .send(Command::Rebind { sink, events })
            .map_err(|_| DispatchError::Stopped)
    }

    /// Stop the actor and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Request dispatcher task failed: {}", e);
        }
    }
}

struct DispatcherActor {
    settings: DispatcherSettings,
    sink: Arc<dyn MessageSink>,
    events: Option<ChannelEvents>,
    audit: Arc<dyn AuditLogger>,
    queue: VecDeque<PendingRequest>,
    in_flight: HashMap<CorrelationId, InFlight>,
    cache: HashMap<CacheKey, ToolResponse>,
    /// Set once the transport is gone; holds the reason.
    disconnected: Option<String>,
    peak_active: usize,
    completed: u64,
    failed: u64,
}

impl DispatcherActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        self.events = None;
                        self.on_disconnect("event stream closed");
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        // Refuse further submissions before failing what is left.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Submit(pending) = command {
                self.fail(pending, DispatchError::Stopped);
            }
        }
        self.fail_all(DispatchError::Stopped);
        info!("Request dispatcher stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(pending) => self.admit(pending).await,
            Command::Stats(tx) => {
                let _ = tx.send(self.stats());
            }
            Command::ClearCache(tx) => {
                let removed = self.cache.len();
                self.cache.clear();
                info!(removed, "Response cache cleared");
                let _ = tx.send(removed);
            }
            Command::Rebind { sink, events } => {
                self.sink = sink;
                self.events = Some(events);
                if let Some(reason) = self.disconnected.take() {
                    info!(previous = %reason, "Dispatcher rebound to a new channel");
                }
                if !self.settings.batch_requests {
                    self.drain().await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) if message.message_kind() == MessageKind::ToolResponse => {
                self.on_response(message)
            }
            ChannelEvent::Disconnected { reason } => self.on_disconnect(&reason),
            _ => {}
        }
        if !self.settings.batch_requests {
            self.drain().await;
        }
    }

    async fn admit(&mut self, mut pending: PendingRequest) {
        pending.advance(RequestState::Admitted);

        if self.settings.cache_responses
            && let Some(cached) = self.cache.get(&pending.cache_key)
        {
            let response = cached.cached();
            debug!(
                request_id = %pending.id,
                server = %pending.request.backend,
                action = %pending.request.action,
                "Serving cached response"
            );
            pending.advance(RequestState::Completed);
            self.audit
                .log(AuditEvent::new("cache_hit", pending.audit_payload()));
            self.completed += 1;
            pending.resolve(Ok(response));
            return;
        }

        if let Some(reason) = &self.disconnected {
            let error = DispatchError::Transport(reason.clone());
            self.fail(pending, error);
            return;
        }

        self.queue.push_back(pending);
        if !self.settings.batch_requests {
            self.drain().await;
        }
    }

    /// Transmit queued requests, oldest first, while a slot is free.
    async fn drain(&mut self) {
        while self.disconnected.is_none()
            && self.in_flight.len() < self.settings.max_concurrent_ops
        {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            self.transmit(pending).await;
        }
    }

    async fn transmit(&mut self, mut pending: PendingRequest) {
        let envelope = pending.request.to_envelope(pending.id);
        let message = match Message::from_payload(MessageKind::ToolRequest.as_str(), &envelope) {
            Ok(message) => message,
            Err(e) => {
                self.fail(pending, DispatchError::Channel(e.into()));
                return;
            }
        };

        if let Err(e) = self.sink.send_message(message).await {
            warn!(request_id = %pending.id, error = %e, "Failed to send tool request");
            self.fail(pending, DispatchError::Channel(e));
            return;
        }

        let now = Instant::now();
        pending.advance(RequestState::InFlight);
        debug!(
            request_id = %pending.id,
            server = %pending.request.backend,
            action = %pending.request.action,
            "Tool request sent"
        );
        let mut payload = pending.audit_payload();
        payload["queuedMs"] = json!(now.duration_since(pending.enqueued_at).as_millis() as u64);
        self.audit.log(AuditEvent::new("request_sent", payload));

        self.in_flight.insert(
            pending.id,
            InFlight {
                pending,
                sent_at: now,
                deadline: now + self.settings.request_timeout,
            },
        );
        self.peak_active = self.peak_active.max(self.in_flight.len());
    }

    fn on_response(&mut self, message: Message) {
        let envelope: ResponseEnvelope = match message.payload() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Discarding malformed tool response");
                return;
            }
        };

        let Some(InFlight {
            mut pending,
            sent_at,
            ..
        }) = self.in_flight.remove(&envelope.request_id)
        else {
            warn!(request_id = %envelope.request_id, "Discarding unmatched tool response");
            return;
        };

        let response = ToolResponse::from(envelope);
        if !response.success {
            let error = DispatchError::Backend {
                server: pending.request.backend.clone(),
                action: pending.request.action.clone(),
                message: response
                    .error_message()
                    .unwrap_or_else(|| "unknown error".to_string()),
            };
            self.fail(pending, error);
            return;
        }

        if self.settings.cache_responses {
            self.cache
                .insert(pending.cache_key.clone(), response.clone());
        }
        self.completed += 1;
        pending.advance(RequestState::Completed);
        let mut payload = pending.audit_payload();
        payload["durationMs"] = json!(sent_at.elapsed().as_millis() as u64);
        self.audit
            .log(AuditEvent::new("request_completed", payload));
        pending.resolve(Ok(response));
    }

    fn on_disconnect(&mut self, reason: &str) {
        // A closed stream usually follows an explicit Disconnected event.
        if self.disconnected.is_some() {
            return;
        }
        warn!(
            reason,
            queued = self.queue.len(),
            in_flight = self.in_flight.len(),
            "Channel disconnected, failing pending requests"
        );
        self.disconnected = Some(reason.to_string());
        self.fail_all(DispatchError::Transport(reason.to_string()));
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let mut expired: Vec<CorrelationId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();

        let timeout_ms = self.settings.request_timeout.as_millis() as u64;
        for request_id in expired {
            if let Some(entry) = self.in_flight.remove(&request_id) {
                warn!(%request_id, timeout_ms, "Tool request timed out");
                self.fail(
                    entry.pending,
                    DispatchError::Timeout {
                        request_id,
                        timeout_ms,
                    },
                );
            }
        }

        self.drain().await;
    }

    fn fail(&mut self, mut pending: PendingRequest, error: DispatchError) {
        self.failed += 1;
        pending.advance(RequestState::Failed);
        let mut payload = pending.audit_payload();
        payload["error"] = json!(error.to_string());
        self.audit.log(AuditEvent::new("request_failed", payload));
        pending.resolve(Err(error));
    }

    /// Fail everything queued or in flight, in correlation order.
    fn fail_all(&mut self, error: DispatchError) {
        let mut pending: Vec<PendingRequest> = self
            .in_flight
            .drain()
            .map(|(_, entry)| entry.pending)
            .chain(self.queue.drain(..))
            .collect();
        pending.sort_by_key(|p| p.id);
        for p in pending {
            self.fail(p, error.clone());
        }
    }

    fn stats(&self) -> DispatcherStats {
        let mut in_flight_ids: Vec<_> = self.in_flight.keys().copied().collect();
        in_flight_ids.sort();
        DispatcherStats {
            active: self.in_flight.len(),
            queued: self.queue.len(),
            in_flight_ids,
            cached: self.cache.len(),
            max_concurrent: self.settings.max_concurrent_ops,
            peak_active: self.peak_active,
            completed: self.completed,
            failed: self.failed,
            disconnected: self.disconnected.is_some(),
            disabled_backends: self.settings.disabled_backends.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_domain::{AgentRole, RequestEnvelope};
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    // ==================== Test Doubles ====================

    struct FakeSink {
        sent: StdMutex<Vec<Message>>,
        outbound: mpsc::UnboundedSender<Message>,
        fail_with: StdMutex<Option<ChannelError>>,
    }

    impl FakeSink {
        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MessageSink for FakeSink {
        async fn send_message(&self, message: Message) -> Result<(), ChannelError> {
            if let Some(e) = self.fail_with.lock().unwrap().clone() {
                return Err(e);
            }
            self.sent.lock().unwrap().push(message.clone());
            let _ = self.outbound.send(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        events: StdMutex<Vec<AuditEvent>>,
    }

    impl RecordingAudit {
        fn types(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.event_type)
                .collect()
        }
    }

    impl AuditLogger for RecordingAudit {
        fn log(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        dispatcher: RequestDispatcher,
        sink: Arc<FakeSink>,
        audit: Arc<RecordingAudit>,
        outbound: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    }

    fn crew() -> Arc<RwLock<AuthorityGate>> {
        let mut gate = AuthorityGate::new();
        gate.register_agent("cmd", AgentRole::Commander, RingLayer::Layer0)
            .unwrap();
        gate.register_agent("op", AgentRole::Operator, RingLayer::Layer1)
            .unwrap();
        gate.register_agent("obs", AgentRole::Observer, RingLayer::Layer2)
            .unwrap();
        Arc::new(RwLock::new(gate))
    }

    fn harness(settings: DispatcherSettings) -> Harness {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(FakeSink {
            sent: StdMutex::new(Vec::new()),
            outbound: outbound_tx,
            fail_with: StdMutex::new(None),
        });
        let audit = Arc::new(RecordingAudit::default());
        let dispatcher = RequestDispatcher::spawn(
            settings,
            crew(),
            sink.clone(),
            events_rx,
            audit.clone(),
            CancellationToken::new(),
        );
        Harness {
            dispatcher,
            sink,
            audit,
            outbound,
            events,
        }
    }

    fn git_status(agent: &str, n: u64) -> ToolRequest {
        ToolRequest::new(agent, "git", "status", json!({ "n": n }))
    }

    fn request_id(message: &Message) -> CorrelationId {
        message.payload::<RequestEnvelope>().unwrap().request_id
    }

    fn ok_reply(id: CorrelationId, data: Value) -> ChannelEvent {
        ChannelEvent::Message(Message::new(
            "mcp_response",
            json!({"requestId": id, "success": true, "server": "git", "action": "status", "data": data}),
        ))
    }

    fn err_reply(id: CorrelationId, error: &str) -> ChannelEvent {
        ChannelEvent::Message(Message::new(
            "mcp_response",
            json!({"requestId": id, "success": false, "error": error}),
        ))
    }

    // ==================== Admission ====================

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_request_never_reaches_sink() {
        let mut h = harness(DispatcherSettings::default());

        let err = h.dispatcher.submit(git_status("obs", 1)).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Unauthorized { required_layer: RingLayer::Layer1, .. }
        ));
        let err = h
            .dispatcher
            .submit(git_status("op", 1).with_permission("execute"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized { .. }));
        assert!(h.dispatcher.submit(git_status("ghost", 1)).is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.outbound.try_recv().is_err());
        assert_eq!(h.sink.sent_count(), 0);
        assert_eq!(h.audit.types(), vec!["request_rejected"; 3]);
        let events = h.audit.events.lock().unwrap().clone();
        assert_eq!(events[0].payload["state"], "rejected");
        assert_eq!(events[0].payload["reason"], "unauthorized");
        assert_eq!(h.dispatcher.stats().await.unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_backend_is_refused_before_authority() {
        let settings = DispatcherSettings::default().with_disabled_backends(["git"]);
        let mut h = harness(settings);

        // Even the commander is refused.
        let err = h.dispatcher.submit(git_status("cmd", 1)).unwrap_err();
        assert_eq!(
            err,
            DispatchError::BackendDisabled {
                backend: "git".into()
            }
        );

        // Other back-ends are unaffected.
        let ticket = h
            .dispatcher
            .submit(ToolRequest::new("cmd", "filesystem", "read_file", json!({"path": "a"})))
            .unwrap();
        let message = h.outbound.recv().await.unwrap();
        let envelope: RequestEnvelope = message.payload().unwrap();
        assert_eq!(envelope.server, "filesystem");
        h.events
            .send(ok_reply(envelope.request_id, json!("contents")))
            .unwrap();
        assert!(ticket.wait().await.is_ok());

        assert_eq!(h.sink.sent_count(), 1);
        let events = h.audit.events.lock().unwrap().clone();
        assert_eq!(events[0].event_type, "request_rejected");
        assert_eq!(events[0].payload["reason"], "backend_disabled");
        assert_eq!(events[0].payload["server"], "git");
        let stats = h.dispatcher.stats().await.unwrap();
        assert_eq!(stats.disabled_backends, vec!["git"]);
    }

    // ==================== Concurrency ====================

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_concurrency_ceiling() {
        let Harness {
            dispatcher,
            sink,
            mut outbound,
            events,
            ..
        } = harness(DispatcherSettings::default().with_max_concurrent_ops(3));

        let tickets: Vec<_> = (0..10)
            .map(|i| dispatcher.submit(git_status("op", i)).unwrap())
            .collect();

        // Fake engine: answer each request after a delay.
        let engine = tokio::spawn(async move {
            for _ in 0..10 {
                let Some(message) = outbound.recv().await else {
                    break;
                };
                let events = events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    let _ = events.send(ok_reply(request_id(&message), json!({"ok": true})));
                });
            }
        });

        for ticket in tickets {
            let response = ticket.wait().await.unwrap();
            assert!(response.success);
            assert!(!response.from_cache);
        }
        engine.await.unwrap();

        let stats = dispatcher.stats().await.unwrap();
        assert_eq!(stats.peak_active, 3);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.completed, 10);
        assert_eq!(sink.sent_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_fifo() {
        let mut h = harness(DispatcherSettings::default().with_max_concurrent_ops(1));
        let actions = ["status", "log", "diff"];
        let tickets: Vec<_> = actions
            .iter()
            .map(|a| {
                h.dispatcher
                    .submit(ToolRequest::new("op", "git", *a, Value::Null))
                    .unwrap()
            })
            .collect();

        for (i, expected) in actions.iter().enumerate() {
            let message = h.outbound.recv().await.unwrap();
            let envelope: RequestEnvelope = message.payload().unwrap();
            assert_eq!(envelope.action, *expected);
            assert_eq!(envelope.request_id, tickets[i].id());
            assert_eq!(h.dispatcher.stats().await.unwrap().active, 1);
            h.events.send(ok_reply(envelope.request_id, json!(i))).unwrap();
        }

        for ticket in tickets {
            assert!(ticket.wait().await.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_mode_sends_without_waiting_for_tick() {
        let settings = DispatcherSettings::default()
            .with_batch_requests(false)
            .with_tick_interval(Duration::from_secs(3600));
        let mut h = harness(settings);

        // Let the first (immediate) tick pass.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = tokio::time::timeout(Duration::from_secs(1), h.outbound.recv())
            .await
            .expect("sent before the next tick")
            .unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!("clean")))
            .unwrap();
        assert_eq!(ticket.wait().await.unwrap().data, json!("clean"));
    }

    // ==================== Cache ====================

    #[tokio::test(start_paused = true)]
    async fn test_identical_request_is_served_from_cache() {
        let mut h = harness(DispatcherSettings::default());

        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!({"branch": "main"})))
            .unwrap();
        let first = ticket.wait().await.unwrap();
        assert!(!first.from_cache);

        let second = h.dispatcher.call(git_status("op", 1)).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.data, first.data);
        assert_eq!(h.sink.sent_count(), 1);

        // A different payload is a different key.
        let ticket = h.dispatcher.submit(git_status("op", 2)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!({"branch": "dev"})))
            .unwrap();
        assert!(!ticket.wait().await.unwrap().from_cache);
        assert_eq!(h.sink.sent_count(), 2);
        assert!(h.audit.types().contains(&"cache_hit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_response_is_not_cached() {
        let mut h = harness(DispatcherSettings::default());

        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(err_reply(request_id(&message), "not a repository"))
            .unwrap();
        match ticket.wait().await.unwrap_err() {
            DispatchError::Backend { server, message, .. } => {
                assert_eq!(server, "git");
                assert_eq!(message, "not a repository");
            }
            other => panic!("expected backend error, got {:?}", other),
        }

        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!({})))
            .unwrap();
        assert!(!ticket.wait().await.unwrap().from_cache);
        assert_eq!(h.sink.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache_forces_round_trip() {
        let mut h = harness(DispatcherSettings::default());

        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!(1)))
            .unwrap();
        ticket.wait().await.unwrap();

        assert_eq!(h.dispatcher.clear_cache().await.unwrap(), 1);
        assert_eq!(h.dispatcher.stats().await.unwrap().cached, 0);

        let _ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        h.outbound.recv().await.unwrap();
        assert_eq!(h.sink.sent_count(), 2);
    }

    // ==================== Failures ====================

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_everything_pending() {
        let settings = DispatcherSettings::default()
            .with_max_concurrent_ops(2)
            .with_batch_requests(false);
        let mut h = harness(settings);

        // Warm the cache.
        let ticket = h.dispatcher.submit(git_status("op", 0)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!("cached")))
            .unwrap();
        ticket.wait().await.unwrap();

        let tickets: Vec<_> = (1..=4)
            .map(|i| h.dispatcher.submit(git_status("op", i)).unwrap())
            .collect();
        h.outbound.recv().await.unwrap();
        h.outbound.recv().await.unwrap();
        let stats = h.dispatcher.stats().await.unwrap();
        assert_eq!((stats.active, stats.queued), (2, 2));

        h.events
            .send(ChannelEvent::Disconnected {
                reason: "engine exited".into(),
            })
            .unwrap();
        for ticket in tickets {
            match ticket.wait().await.unwrap_err() {
                DispatchError::Transport(reason) => assert_eq!(reason, "engine exited"),
                other => panic!("expected transport error, got {:?}", other),
            }
        }
        let failed_states: Vec<_> = h
            .audit
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "request_failed")
            .map(|e| e.payload["state"].clone())
            .collect();
        assert_eq!(failed_states, vec![json!("failed"); 4]);

        // Cache hits survive the disconnect; misses fail without a send.
        let cached = h.dispatcher.call(git_status("op", 0)).await.unwrap();
        assert!(cached.from_cache);
        let err = h.dispatcher.call(git_status("op", 99)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.sink.sent_count(), 3);
        let stats = h.dispatcher.stats().await.unwrap();
        assert!(stats.disconnected);
        assert_eq!((stats.active, stats.queued), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_event_stream_counts_as_disconnect_and_rebind_recovers() {
        let Harness {
            dispatcher,
            sink,
            mut outbound,
            events,
            ..
        } = harness(DispatcherSettings::default());
        drop(events);

        let err = dispatcher.call(git_status("op", 1)).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::Transport("event stream closed".to_string())
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        dispatcher.rebind(sink.clone(), events_rx).unwrap();
        let ticket = dispatcher.submit(git_status("op", 1)).unwrap();
        let message = outbound.recv().await.unwrap();
        events
            .send(ok_reply(request_id(&message), json!("back")))
            .unwrap();
        assert_eq!(ticket.wait().await.unwrap().data, json!("back"));
        assert!(!dispatcher.stats().await.unwrap().disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retires_correlation_id() {
        let settings = DispatcherSettings::default().with_request_timeout(Duration::from_secs(2));
        let mut h = harness(settings);

        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        let id = request_id(&message);

        let err = ticket.wait().await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::Timeout {
                request_id: id,
                timeout_ms: 2000
            }
        );

        // The late reply is unmatched: it neither resolves nor caches anything.
        h.events.send(ok_reply(id, json!("late"))).unwrap();
        let stats = h.dispatcher.stats().await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.cached, 0);
        assert_eq!(stats.failed, 1);

        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        assert_ne!(request_id(&message), id);
        h.events
            .send(ok_reply(request_id(&message), json!("fresh")))
            .unwrap();
        assert_eq!(ticket.wait().await.unwrap().data, json!("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_fails_only_that_request() {
        let mut h = harness(DispatcherSettings::default());
        *h.sink.fail_with.lock().unwrap() = Some(ChannelError::Closed);

        let err = h.dispatcher.call(git_status("op", 1)).await.unwrap_err();
        assert_eq!(err, DispatchError::Channel(ChannelError::Closed));

        *h.sink.fail_with.lock().unwrap() = None;
        let ticket = h.dispatcher.submit(git_status("op", 2)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!(null)))
            .unwrap();
        assert!(ticket.wait().await.is_ok());
        assert!(!h.dispatcher.stats().await.unwrap().disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_outstanding_work() {
        let mut h = harness(DispatcherSettings::default());

        let in_flight = h.dispatcher.submit(git_status("op", 1)).unwrap();
        h.outbound.recv().await.unwrap();

        h.dispatcher.shutdown().await;
        assert_eq!(in_flight.wait().await.unwrap_err(), DispatchError::Stopped);
        assert!(matches!(
            h.dispatcher.submit(git_status("op", 2)),
            Err(DispatchError::Stopped)
        ));
        assert_eq!(h.dispatcher.stats().await, Err(DispatchError::Stopped));

        // Idempotent.
        h.dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_audit_trail_records_lifecycle() {
        let mut h = harness(DispatcherSettings::default());

        let ticket = h.dispatcher.submit(git_status("op", 1)).unwrap();
        let message = h.outbound.recv().await.unwrap();
        h.events
            .send(ok_reply(request_id(&message), json!(1)))
            .unwrap();
        ticket.wait().await.unwrap();
        h.dispatcher.call(git_status("op", 1)).await.unwrap();

        assert_eq!(
            h.audit.types(),
            vec!["request_sent", "request_completed", "cache_hit"]
        );
        let events = h.audit.events.lock().unwrap();
        assert_eq!(events[0].payload["server"], "git");
        assert_eq!(events[0].payload["agentId"], "op");
        let states: Vec<_> = events.iter().map(|e| e.payload["state"].clone()).collect();
        assert_eq!(states, vec![json!("in_flight"), json!("completed"), json!("completed")]);
    }
}
