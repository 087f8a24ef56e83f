//! Per-shard protocol state machine.
//!
//! [`ShardStateMachine`] performs no I/O. It consumes inbound envelopes and
//! heartbeat polls and answers with [`ShardAction`]s that the shard runner
//! executes against the live connection.

use crate::config::ClusterConfig;
use crate::events::{self, GatewayEvent};
use crate::health::{HeartbeatCheck, HeartbeatMonitor};
use crate::model::{ApplicationPartial, User};
use crate::protocol::{
    ConnectionProperties, Envelope, HelloPayload, IdentifyPayload, Opcode, PresenceUpdate,
    ResumePayload, NORMAL_CLOSE, PROTOCOL_ERROR_CLOSE, RESUMABLE_CLOSE,
};
use crate::session::{ShardInfo, ShardSessionInfo};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Connection lifecycle of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::Connecting => "Connecting",
            Self::Open => "Open",
            Self::Closing => "Closing",
        };
        f.write_str(name)
    }
}

/// Work the runner must perform on behalf of the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ShardAction {
    /// Write a packet to the connection
    Send(Envelope),
    /// Forward a decoded event to the handler
    Emit(GatewayEvent),
    /// Wait `delay`, then close the connection with `code` and reconnect
    Close {
        code: u16,
        reason: &'static str,
        delay: Duration,
    },
}

pub struct ShardStateMachine {
    info: ShardInfo,
    token: String,
    intents: u64,
    large_threshold: u32,
    properties: ConnectionProperties,
    presence: Option<PresenceUpdate>,
    invalid_session_delay: (Duration, Duration),
    state: ShardState,
    session: ShardSessionInfo,
    heartbeat: HeartbeatMonitor,
    user: Option<User>,
    application: Option<ApplicationPartial>,
}

impl fmt::Debug for ShardStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardStateMachine")
            .field("info", &self.info)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl ShardStateMachine {
    pub fn new(info: ShardInfo, session: ShardSessionInfo, config: &ClusterConfig) -> Self {
        Self {
            info,
            token: config.token.clone(),
            intents: config.intents,
            large_threshold: config.large_threshold,
            properties: config.properties.clone(),
            presence: config.presence.clone(),
            invalid_session_delay: (
                config.invalid_session_min_delay,
                config.invalid_session_max_delay,
            ),
            state: ShardState::Closed,
            session,
            heartbeat: HeartbeatMonitor::new(),
            user: None,
            application: None,
        }
    }

    pub fn info(&self) -> ShardInfo {
        self.info
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn session(&self) -> &ShardSessionInfo {
        &self.session
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn application(&self) -> Option<&ApplicationPartial> {
        self.application.as_ref()
    }

    /// Closed -> Connecting: a new transport is being opened
    pub fn connection_opening(&mut self) {
        self.heartbeat.reset();
        self.state = ShardState::Connecting;
    }

    /// The runner started closing the transport
    pub fn begin_close(&mut self) {
        self.state = ShardState::Closing;
    }

    /// Closing -> Closed: the transport is fully gone
    pub fn connection_closed(&mut self) {
        self.heartbeat.reset();
        self.state = ShardState::Closed;
    }

    /// Process one inbound packet
    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Vec<ShardAction> {
        match envelope.op {
            Opcode::Hello => self.on_hello(envelope.d, now),
            Opcode::Heartbeat => {
                debug!("[SHARD-{}] Server requested a heartbeat", self.info.index);
                self.heartbeat.record_reply_sent(now);
                vec![ShardAction::Send(Envelope::heartbeat(self.session.last_sequence))]
            }
            Opcode::HeartbeatAck => {
                if let Some(latency) = self.heartbeat.record_ack(now) {
                    trace!("[SHARD-{}] Heartbeat ack ({:?})", self.info.index, latency);
                }
                Vec::new()
            }
            Opcode::Reconnect => {
                info!("[SHARD-{}] Server requested reconnect", self.info.index);
                self.state = ShardState::Closing;
                vec![ShardAction::Close {
                    code: RESUMABLE_CLOSE,
                    reason: "server requested reconnect",
                    delay: Duration::ZERO,
                }]
            }
            Opcode::InvalidSession => self.on_invalid_session(&envelope.d),
            Opcode::Dispatch => self.on_dispatch(envelope),
            other => {
                debug!(
                    "[SHARD-{}] Ignoring unexpected opcode {}",
                    self.info.index, other
                );
                Vec::new()
            }
        }
    }

    /// Evaluate the heartbeat on a poll tick
    pub fn poll_heartbeat(&mut self, now: Instant) -> Option<ShardAction> {
        match self.heartbeat.check(now) {
            HeartbeatCheck::Idle => None,
            HeartbeatCheck::Due => {
                self.heartbeat.record_sent(now);
                Some(ShardAction::Send(Envelope::heartbeat(
                    self.session.last_sequence,
                )))
            }
            HeartbeatCheck::TimedOut => {
                warn!(
                    "[SHARD-{}] Heartbeat ack not received within {:?}, reconnecting",
                    self.info.index,
                    self.heartbeat.interval().unwrap_or_default()
                );
                self.state = ShardState::Closing;
                Some(ShardAction::Close {
                    code: PROTOCOL_ERROR_CLOSE,
                    reason: "heartbeat ack timeout",
                    delay: Duration::ZERO,
                })
            }
        }
    }

    fn on_hello(&mut self, payload: Value, now: Instant) -> Vec<ShardAction> {
        let hello: HelloPayload = match serde_json::from_value(payload) {
            Ok(hello) => hello,
            Err(e) => {
                warn!("[SHARD-{}] Malformed Hello payload: {}", self.info.index, e);
                return Vec::new();
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        debug!(
            "[SHARD-{}] Hello received, heartbeat interval {:?}",
            self.info.index, interval
        );
        self.heartbeat.start(interval);

        // Priming beat; the regular cadence follows from here
        let mut actions = vec![ShardAction::Send(Envelope::heartbeat(
            self.session.last_sequence,
        ))];
        self.heartbeat.record_sent(now);

        let handshake = match (&self.session.session_id, self.session.last_sequence) {
            (Some(session_id), Some(seq)) => {
                info!(
                    "[SHARD-{}] Resuming session {} at sequence {}",
                    self.info.index, session_id, seq
                );
                self.build(
                    Opcode::Resume,
                    &ResumePayload {
                        token: self.token.clone(),
                        session_id: session_id.clone(),
                        seq,
                    },
                )
            }
            _ => {
                info!("[SHARD-{}] Identifying", self.info.index);
                self.build(
                    Opcode::Identify,
                    &IdentifyPayload {
                        token: self.token.clone(),
                        properties: self.properties.clone(),
                        compress: false,
                        large_threshold: self.large_threshold,
                        shard: self.info.as_array(),
                        intents: self.intents,
                        presence: self.presence.clone(),
                    },
                )
            }
        };

        actions.extend(handshake.map(ShardAction::Send));
        actions
    }

    fn on_invalid_session(&mut self, payload: &Value) -> Vec<ShardAction> {
        let resumable = payload.as_bool().unwrap_or(false);
        warn!(
            "[SHARD-{}] Invalid session (resumable: {})",
            self.info.index, resumable
        );

        if !resumable {
            self.session = ShardSessionInfo::default();
        }
        self.state = ShardState::Closing;

        let (min, max) = self.invalid_session_delay;
        let delay_ms = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        let delay = Duration::from_millis(delay_ms as u64);

        vec![ShardAction::Close {
            code: if resumable { RESUMABLE_CLOSE } else { NORMAL_CLOSE },
            reason: "invalid session",
            delay,
        }]
    }

    fn on_dispatch(&mut self, envelope: Envelope) -> Vec<ShardAction> {
        if let Some(seq) = envelope.s {
            self.session = self.session.with_sequence(seq);
        }

        let Some(name) = envelope.t else {
            warn!("[SHARD-{}] Dispatch without an event name", self.info.index);
            return Vec::new();
        };

        let event = match events::decode(&name, envelope.d) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "[SHARD-{}] Failed to decode {} (seq {:?}), dropping: {}",
                    self.info.index, name, envelope.s, e
                );
                return Vec::new();
            }
        };

        match &event {
            GatewayEvent::Ready(ready) => {
                if self.state != ShardState::Connecting {
                    warn!(
                        "[SHARD-{}] Received READY in state {}, ignoring session data",
                        self.info.index, self.state
                    );
                } else {
                    if let Some(shard) = ready.shard {
                        if shard != self.info.as_array() {
                            warn!(
                                "[SHARD-{}] READY reports shard {:?}, expected {:?}",
                                self.info.index,
                                shard,
                                self.info.as_array()
                            );
                        }
                    }
                    // New session: sequence starts over from this dispatch
                    self.session = ShardSessionInfo {
                        session_id: Some(ready.session_id.clone()),
                        last_sequence: envelope.s.or(self.session.last_sequence),
                    };
                    self.user = Some(ready.user.clone());
                    self.application = Some(ready.application.clone());
                    self.state = ShardState::Open;
                    info!(
                        "[SHARD-{}] Ready as {} (session {})",
                        self.info.index, ready.user.username, ready.session_id
                    );
                }
            }
            GatewayEvent::Resumed => {
                if self.state == ShardState::Connecting {
                    self.state = ShardState::Open;
                    info!("[SHARD-{}] Resumed", self.info.index);
                } else {
                    warn!(
                        "[SHARD-{}] Received RESUMED in state {}",
                        self.info.index, self.state
                    );
                }
            }
            GatewayEvent::Unknown { name, .. } => {
                debug!(
                    "[SHARD-{}] No decoder for dispatch {}, dropping",
                    self.info.index, name
                );
                return Vec::new();
            }
            _ => {}
        }

        vec![ShardAction::Emit(event)]
    }

    fn build<T: Serialize>(&self, op: Opcode, payload: &T) -> Option<Envelope> {
        match Envelope::with_payload(op, payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("[SHARD-{}] Failed to encode {}: {}", self.info.index, op, e);
                None
            }
        }
    }
}
