use crate::Config;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use hostlink_core::command::render_command;
use hostlink_core::protocol::{
    decode_envelope, encode_message, AckedPayload, AcceptedPayload, ClientScenesPayload,
    DrainPayload, EnqueuePayload, OutputPayload, RejectReason, RejectedPayload, ResetAckPayload,
    ResetPayload, ScanScenesPayload, StatusPayload, SubmitPayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES,
};
use hostlink_core::{Command, GapTracker, InflightLedger, Observation, SequenceCounter, NO_ACK};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

pub const SENDER_ID: &str = "relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Observer,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Observer => "observer",
            Role::Agent => "agent",
        }
    }
}

/// Outcome of [`RelayState::bind_agent`].
pub enum Binding {
    Bound,
    AlreadyBound,
    /// The connection replaced a previous agent, which is now an observer.
    Superseded(Arc<Connection>),
}

pub struct Connection {
    conn_id: String,
    remote: String,
    sender: mpsc::Sender<Message>,
    last_seen: AsyncMutex<Instant>,
}

impl Connection {
    pub fn new(conn_id: String, remote: String, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id,
            remote,
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
        }
    }

    async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    async fn send_text(&self, text: &str) -> bool {
        self.sender.send(Message::Text(text.to_string())).await.is_ok()
    }

    async fn send_msg(&self, msg: WireMsg, request_id: Option<String>) -> bool {
        match encode(msg, request_id) {
            Some(text) => self.send_text(&text).await,
            None => false,
        }
    }

    async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

fn encode(msg: WireMsg, request_id: Option<String>) -> Option<String> {
    let kind = msg.kind();
    let envelope = WireEnvelope::new(SENDER_ID, msg).with_request_id(request_id);
    match encode_message(&envelope, DEFAULT_MAX_FRAME_BYTES) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(event = "encode_error", kind = kind, error = %err);
            None
        }
    }
}

/// Sequence ingress and the relay's copy of the inflight ledger.
struct FlowState {
    counter: SequenceCounter,
    ledger: InflightLedger,
    last_ack: i64,
    agent_inflight: Option<usize>,
    events: GapTracker,
}

impl FlowState {
    fn new() -> Self {
        Self {
            counter: SequenceCounter::new(),
            ledger: InflightLedger::default(),
            last_ack: NO_ACK,
            agent_inflight: None,
            events: GapTracker::new(),
        }
    }

    fn status(&self, agent_bound: bool) -> StatusPayload {
        StatusPayload {
            inflight: self.ledger.len(),
            last_ack: self.last_ack,
            agent: agent_bound,
            agent_inflight: self.agent_inflight,
            event_gaps: self.events.gaps(),
            event_disorder: self.events.disorder(),
        }
    }
}

pub struct RelayState {
    config: Config,
    conn_counter: AtomicU64,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    agent: RwLock<Option<Arc<Connection>>>,
    flow: AsyncMutex<FlowState>,
}

impl RelayState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            connections: RwLock::new(HashMap::new()),
            agent: RwLock::new(None),
            flow: AsyncMutex::new(FlowState::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn register(&self, conn: Arc<Connection>) {
        self.connections
            .write()
            .await
            .insert(conn.conn_id.clone(), conn.clone());
        info!(event = "client_connected", conn_id = %conn.conn_id, remote = %conn.remote);
    }

    /// Drops the connection from the registry and unbinds it if it was the
    /// agent. Returns whether it was the agent.
    pub async fn remove_connection(&self, conn: &Connection, reason: &str) -> bool {
        conn.close(reason).await;
        let removed = self.connections.write().await.remove(&conn.conn_id).is_some();
        let was_agent = {
            let mut agent = self.agent.write().await;
            let matches = agent
                .as_ref()
                .map(|bound| bound.conn_id == conn.conn_id)
                .unwrap_or(false);
            if matches {
                *agent = None;
            }
            matches
        };
        if removed {
            info!(
                event = "client_disconnected",
                conn_id = %conn.conn_id,
                was_agent = was_agent,
                reason = reason
            );
        }
        was_agent
    }

    pub async fn role_of(&self, conn: &Connection) -> Role {
        match self.agent.read().await.as_ref() {
            Some(bound) if bound.conn_id == conn.conn_id => Role::Agent,
            _ => Role::Observer,
        }
    }

    /// Binds `conn` as the agent. Last claimant wins: a previously bound agent
    /// is demoted to observer and returned so it can be told.
    pub async fn bind_agent(&self, conn: &Arc<Connection>) -> Binding {
        let mut agent = self.agent.write().await;
        let previous = agent.replace(conn.clone());
        match previous {
            Some(prev) if prev.conn_id == conn.conn_id => Binding::AlreadyBound,
            Some(prev) => {
                warn!(
                    event = "agent_superseded",
                    previous = %prev.conn_id,
                    conn_id = %conn.conn_id
                );
                Binding::Superseded(prev)
            }
            None => {
                info!(event = "agent_bound", conn_id = %conn.conn_id);
                Binding::Bound
            }
        }
    }

    async fn bound_agent(&self) -> Option<Arc<Connection>> {
        self.agent.read().await.clone()
    }

    async fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn broadcast(&self, msg: WireMsg, request_id: Option<String>) {
        let Some(text) = encode(msg, request_id) else {
            return;
        };
        for conn in self.snapshot_connections().await {
            if !conn.send_text(&text).await {
                warn!(event = "send_error", conn_id = %conn.conn_id);
                self.remove_connection(&conn, "send_error").await;
            }
        }
    }

    async fn send_to_agent(&self, agent: &Connection, msg: WireMsg) -> bool {
        if agent.send_msg(msg, None).await {
            return true;
        }
        warn!(event = "send_error", conn_id = %agent.conn_id, role = "agent");
        self.remove_connection(agent, "send_error").await;
        false
    }

    async fn send_error(
        &self,
        conn: &Connection,
        code: &str,
        message: &str,
        request_id: Option<String>,
    ) {
        let _ = conn
            .send_msg(WireMsg::error(code, message), request_id)
            .await;
    }

    pub async fn status_payload(&self) -> StatusPayload {
        let flow = self.flow.lock().await;
        let agent_bound = self.agent.read().await.is_some();
        flow.status(agent_bound)
    }

    pub async fn broadcast_status(&self) {
        let status = self.status_payload().await;
        self.broadcast(WireMsg::Status(status), None).await;
    }

    pub async fn handle_message(&self, conn: &Arc<Connection>, envelope: WireEnvelope) {
        let request_id = envelope.request_id.clone();
        if self.config.debug {
            let role = self.role_of(conn).await;
            debug!(
                event = "message_received",
                conn_id = %conn.conn_id,
                role = role.as_str(),
                kind = envelope.msg.kind()
            );
        }
        match envelope.msg {
            WireMsg::ClientHello(payload) => {
                info!(event = "agent_hello", conn_id = %conn.conn_id, version = %payload.version);
                self.claim_agent(conn).await;
                self.broadcast_status().await;
            }
            WireMsg::Drain(payload) => {
                if self.bound_agent().await.is_none() {
                    self.claim_agent(conn).await;
                }
                if self.role_of(conn).await != Role::Agent {
                    self.reject_role(conn, "drain", request_id).await;
                    return;
                }
                self.handle_drain(payload).await;
            }
            WireMsg::ClientAlive(payload) => {
                if self.role_of(conn).await != Role::Agent {
                    self.reject_role(conn, "client.alive", request_id).await;
                    return;
                }
                self.broadcast(WireMsg::ClientAlive(payload), None).await;
            }
            WireMsg::Submit(payload) => {
                self.handle_submit(conn, payload, request_id).await;
            }
            WireMsg::Reset(_) => {
                if self.role_of(conn).await == Role::Agent {
                    self.reject_role(conn, "reset", request_id).await;
                    return;
                }
                self.request_reset(conn, request_id).await;
            }
            WireMsg::ResetAck(payload) => {
                if self.role_of(conn).await != Role::Agent {
                    self.reject_role(conn, "reset.ack", request_id).await;
                    return;
                }
                self.handle_reset_ack(conn, payload).await;
            }
            WireMsg::Output(payload) => {
                if self.role_of(conn).await != Role::Agent {
                    self.reject_role(conn, "output", request_id).await;
                    return;
                }
                self.handle_output(payload).await;
            }
            WireMsg::ScanScenes(_) => match self.bound_agent().await {
                Some(agent) => {
                    self.send_to_agent(&agent, WireMsg::ScanScenes(ScanScenesPayload::default()))
                        .await;
                }
                None => {
                    self.send_error(conn, "no_agent", "no agent bound", request_id)
                        .await;
                }
            },
            WireMsg::ClientScenes(payload) => {
                if self.role_of(conn).await != Role::Agent {
                    self.reject_role(conn, "client.scenes", request_id).await;
                    return;
                }
                info!(event = "scenes_listed", count = payload.scenes.len());
                self.broadcast(
                    WireMsg::ClientScenes(ClientScenesPayload {
                        scenes: payload.scenes,
                    }),
                    None,
                )
                .await;
            }
            WireMsg::Error(payload) => {
                if self.role_of(conn).await == Role::Agent {
                    warn!(event = "agent_error", code = %payload.code, message = %payload.message);
                    self.broadcast(WireMsg::Error(payload), None).await;
                } else {
                    warn!(event = "client_error", conn_id = %conn.conn_id, code = %payload.code);
                }
            }
            other @ (WireMsg::Accepted(_)
            | WireMsg::Rejected(_)
            | WireMsg::Enqueue(_)
            | WireMsg::Acked(_)
            | WireMsg::Status(_)) => {
                warn!(event = "unexpected_message", conn_id = %conn.conn_id, kind = other.kind());
                self.send_error(
                    conn,
                    "unexpected_message",
                    &format!("{} is relay-originated", other.kind()),
                    request_id,
                )
                .await;
            }
        }
    }

    async fn claim_agent(&self, conn: &Arc<Connection>) {
        if let Binding::Superseded(previous) = self.bind_agent(conn).await {
            self.send_error(
                &previous,
                "agent_superseded",
                "another agent connection claimed the relay",
                None,
            )
            .await;
        }
    }

    async fn reject_role(&self, conn: &Connection, kind: &str, request_id: Option<String>) {
        warn!(event = "role_violation", conn_id = %conn.conn_id, kind = kind);
        self.send_error(
            conn,
            "role_violation",
            &format!("{kind} is only accepted from the bound agent"),
            request_id,
        )
        .await;
    }

    /// Assigns the next seq and fans the command out. Seq assignment and the
    /// `accepted`/`enqueue` sends happen under the flow lock, so broadcast order
    /// always matches seq order.
    pub async fn handle_submit(
        &self,
        conn: &Connection,
        payload: SubmitPayload,
        request_id: Option<String>,
    ) {
        if payload.cmd.trim().is_empty() {
            self.send_error(conn, "invalid_payload", "empty command", request_id)
                .await;
            return;
        }
        let text = render_command(&payload.cmd, &payload.params);

        let mut flow = self.flow.lock().await;
        let Some(agent) = self.bound_agent().await else {
            info!(event = "submit_rejected", conn_id = %conn.conn_id, reason = "no-client");
            self.reject(conn, RejectReason::NoClient, request_id).await;
            return;
        };
        if flow.ledger.is_full() {
            info!(
                event = "submit_rejected",
                conn_id = %conn.conn_id,
                reason = "backpressure",
                inflight = flow.ledger.len()
            );
            self.reject(conn, RejectReason::Backpressure, request_id).await;
            return;
        }

        let seq = flow.counter.next();
        if let Err(err) = flow.ledger.push(Command::new(seq, text.clone())) {
            warn!(event = "ledger_push_failed", seq = seq, error = %err);
            self.reject(conn, RejectReason::Backpressure, request_id).await;
            return;
        }
        info!(
            event = "command_accepted",
            seq = seq,
            conn_id = %conn.conn_id,
            inflight = flow.ledger.len()
        );

        self.broadcast(
            WireMsg::Accepted(AcceptedPayload {
                seq,
                cmd: text.clone(),
            }),
            request_id,
        )
        .await;
        self.send_to_agent(&agent, WireMsg::Enqueue(EnqueuePayload { seq, line: text }))
            .await;
    }

    async fn reject(&self, conn: &Connection, reason: RejectReason, request_id: Option<String>) {
        let _ = conn
            .send_msg(WireMsg::Rejected(RejectedPayload { reason }), request_id)
            .await;
    }

    /// Trims the ledger through the agent's cumulative watermark. The agent's
    /// inflight count is only recorded for status.
    pub async fn handle_drain(&self, payload: DrainPayload) {
        let mut flow = self.flow.lock().await;
        flow.agent_inflight = Some(payload.inflight);
        if payload.last_ack < flow.last_ack {
            debug!(
                event = "drain_regressed",
                reported = payload.last_ack,
                last_ack = flow.last_ack
            );
        } else {
            flow.last_ack = payload.last_ack;
        }
        let watermark = flow.last_ack;
        let removed = flow.ledger.trim_through(watermark);
        if removed.is_empty() {
            return;
        }
        info!(
            event = "ledger_trimmed",
            last_ack = watermark,
            removed = removed.len(),
            inflight = flow.ledger.len()
        );
        for command in removed {
            self.broadcast(WireMsg::Acked(AckedPayload { seq: command.seq }), None)
                .await;
        }
    }

    /// Completes a reset: the relay forgets every accepted command and restarts
    /// sequencing at 0. The agent gets `reset.ack` echoed back so it can tell
    /// stale enqueues (sent before this point) from fresh ones.
    pub async fn handle_reset_ack(&self, agent: &Connection, payload: ResetAckPayload) {
        let mut flow = self.flow.lock().await;
        let dropped = flow.ledger.len();
        flow.ledger.clear();
        flow.counter.reset();
        flow.last_ack = NO_ACK;
        flow.agent_inflight = Some(0);
        flow.events.reset();
        info!(event = "reset_complete", acked = payload.seq, dropped = dropped);
        self.send_to_agent(agent, WireMsg::ResetAck(payload)).await;
        let agent_bound = self.agent.read().await.is_some();
        let status = flow.status(agent_bound);
        self.broadcast(WireMsg::Status(status), None).await;
    }

    async fn handle_output(&self, payload: OutputPayload) {
        let mut flow = self.flow.lock().await;
        match flow.events.observe(payload.seq) {
            Observation::InOrder => {}
            Observation::Gap { from, to } => {
                warn!(event = "output_gap", from = from, to = to);
            }
            Observation::Duplicate => {
                warn!(event = "output_duplicate", seq = payload.seq);
            }
            Observation::OutOfOrder => {
                warn!(event = "output_out_of_order", seq = payload.seq);
            }
            Observation::Restart => {
                info!(event = "output_restart");
            }
        }
        self.broadcast(WireMsg::Output(payload), None).await;
    }

    async fn request_reset(&self, conn: &Connection, request_id: Option<String>) {
        match self.bound_agent().await {
            Some(agent) => {
                info!(event = "reset_requested", conn_id = %conn.conn_id);
                self.send_to_agent(&agent, WireMsg::Reset(ResetPayload::default()))
                    .await;
            }
            None => {
                self.send_error(conn, "no_agent", "no agent bound", request_id)
                    .await;
            }
        }
    }

    pub fn start_status_heartbeat(self: Arc<Self>) {
        if self.config.status_interval.is_zero() {
            return;
        }
        let interval = self.config.status_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.broadcast_status().await;
            }
        });
    }

    pub fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_seconds == 0 {
            return;
        }
        let stale_after = Duration::from_secs(self.config.stale_seconds);
        let interval = stale_after / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for conn in self.snapshot_connections().await {
                    let last_seen = conn.last_seen().await;
                    if Instant::now().duration_since(last_seen) > stale_after {
                        warn!(event = "stale_close", conn_id = %conn.conn_id);
                        if self.remove_connection(&conn, "stale").await {
                            self.broadcast_status().await;
                        }
                    }
                }
            }
        });
    }

    fn start_ping(self: Arc<Self>, conn: Arc<Connection>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if conn.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(event = "ping_stopped", conn_id = %conn.conn_id);
                    if self.remove_connection(&conn, "ping_failed").await {
                        self.broadcast_status().await;
                    }
                    return;
                }
            }
        });
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let conn = Arc::new(Connection::new(self.next_conn_id(), remote.to_string(), tx));
        self.register(conn.clone()).await;
        self.clone().start_ping(conn.clone());
        let status = self.status_payload().await;
        let _ = conn.send_msg(WireMsg::Status(status), None).await;

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %conn.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    conn.touch().await;
                    continue;
                }
            };
            conn.touch().await;
            if data.len() > DEFAULT_MAX_FRAME_BYTES {
                warn!(event = "message_too_large", conn_id = %conn.conn_id, size = data.len());
                self.send_error(&conn, "message_too_large", "message exceeds limit", None)
                    .await;
                continue;
            }
            let envelope = match decode_envelope(&data) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %conn.conn_id, error = %err);
                    self.send_error(&conn, "invalid_message", &err.to_string(), None)
                        .await;
                    continue;
                }
            };
            self.handle_message(&conn, envelope).await;
        }

        if self.remove_connection(&conn, "disconnect").await {
            self.broadcast_status().await;
        }
        drop(conn);
        let _ = write_task.await;
    }
}
