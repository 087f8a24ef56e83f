use crate::config::{BackoffConfig, ClusterConfig};
use crate::connection::Connection;
use crate::error::Error;
use crate::events::GatewayEvent;
use crate::handler::EventHandler;
use crate::metrics::Metrics;
use crate::model::{ApplicationPartial, User};
use crate::protocol::{
    Envelope, GatewayCloseCode, Opcode, PresenceUpdate, RequestGuildMembers,
    PROTOCOL_ERROR_CLOSE, RESUMABLE_CLOSE,
};
use crate::session::{ShardInfo, ShardSessionInfo};
use crate::state::{ShardAction, ShardState, ShardStateMachine};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

/// Default command channel buffer size
pub(crate) const COMMAND_CHANNEL_SIZE: usize = 100;

/// Commands that can be sent to a running shard
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Write a packet on the current connection
    Send(Envelope),
    /// Drop the connection (resumable) and connect again
    Reconnect,
    /// Disconnect and stop the runner
    Close,
}

/// Last state published by the runner
#[derive(Debug, Clone)]
struct ShardStatus {
    state: ShardState,
    session: ShardSessionInfo,
    latency: Option<Duration>,
    user: Option<User>,
    application: Option<ApplicationPartial>,
    last_close_code: Option<u16>,
}

/// Shareable handle to one shard.
///
/// Cheap to clone. Reads return the last state published by the shard's
/// runner; writes are queued on its command channel.
#[derive(Debug, Clone)]
pub struct Shard {
    info: ShardInfo,
    status: Arc<RwLock<ShardStatus>>,
    command_tx: mpsc::Sender<ShardCommand>,
}

impl Shard {
    pub(crate) fn new(info: ShardInfo, command_tx: mpsc::Sender<ShardCommand>) -> Self {
        Self {
            info,
            status: Arc::new(RwLock::new(ShardStatus {
                state: ShardState::Closed,
                session: ShardSessionInfo::default(),
                latency: None,
                user: None,
                application: None,
                last_close_code: None,
            })),
            command_tx,
        }
    }

    pub fn id(&self) -> u32 {
        self.info.index
    }

    pub fn info(&self) -> ShardInfo {
        self.info
    }

    pub fn state(&self) -> ShardState {
        self.status.read().state
    }

    /// Current resumable session
    pub fn session(&self) -> ShardSessionInfo {
        self.status.read().session.clone()
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.status.read().latency
    }

    /// Bot user from the last READY
    pub fn user(&self) -> Option<User> {
        self.status.read().user.clone()
    }

    /// Application from the last READY
    pub fn application(&self) -> Option<ApplicationPartial> {
        self.status.read().application.clone()
    }

    /// Close code the server sent when the previous connection ended
    pub fn last_close_code(&self) -> Option<u16> {
        self.status.read().last_close_code
    }

    /// Queue a raw packet for the current connection.
    ///
    /// Packets queued while the shard is between connections are dropped.
    pub async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.command(ShardCommand::Send(envelope)).await
    }

    pub async fn update_presence(&self, presence: &PresenceUpdate) -> Result<(), Error> {
        self.send(Envelope::with_payload(Opcode::PresenceUpdate, presence)?)
            .await
    }

    pub async fn request_guild_members(&self, request: &RequestGuildMembers) -> Result<(), Error> {
        self.send(Envelope::with_payload(Opcode::RequestGuildMembers, request)?)
            .await
    }

    /// Drop the current connection and resume on a new one
    pub async fn reconnect(&self) -> Result<(), Error> {
        self.command(ShardCommand::Reconnect).await
    }

    pub(crate) async fn close(&self) -> Result<(), Error> {
        self.command(ShardCommand::Close).await
    }

    async fn command(&self, command: ShardCommand) -> Result<(), Error> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    fn publish(&self, update: impl FnOnce(&mut ShardStatus)) {
        update(&mut self.status.write());
    }
}

/// How a connection cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    /// Close command received; the runner exits
    Stopped,
    /// The protocol asked for a new connection
    Requested { opened: bool },
    /// Connect failed or the transport went away
    Dropped { opened: bool },
}

/// Drives one shard: connects, feeds the state machine, executes its
/// actions and reconnects until told to stop.
pub(crate) struct ShardRunner<H: EventHandler> {
    shard: Shard,
    machine: ShardStateMachine,
    connection: Connection,
    url: Url,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    command_rx: mpsc::Receiver<ShardCommand>,
    backoff: BackoffConfig,
    poll_interval: Duration,
    low_latency_mode: bool,
}

impl<H: EventHandler> ShardRunner<H> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shard: Shard,
        session: ShardSessionInfo,
        url: Url,
        config: &ClusterConfig,
        handler: Arc<H>,
        metrics: Arc<Metrics>,
        command_rx: mpsc::Receiver<ShardCommand>,
    ) -> Self {
        let info = shard.info();
        let runner = Self {
            machine: ShardStateMachine::new(info, session, config),
            connection: Connection::new(info.index, config.connection.clone()),
            shard,
            url,
            handler,
            metrics,
            command_rx,
            backoff: config.backoff.clone(),
            poll_interval: config.heartbeat.poll_interval,
            low_latency_mode: config.connection.low_latency_mode,
        };
        runner.publish();
        runner
    }

    pub(crate) fn id(&self) -> u32 {
        self.shard.id()
    }

    /// Run connection cycles until a close command arrives
    pub(crate) async fn run(mut self) {
        let id = self.shard.id();
        let mut failures = 0u32;

        loop {
            let end = self.run_cycle().await;
            self.finish_cycle().await;

            match end {
                CycleEnd::Stopped => break,
                CycleEnd::Requested { opened } => {
                    if opened {
                        failures = 0;
                    }
                }
                CycleEnd::Dropped { opened: true } => failures = 0,
                CycleEnd::Dropped { opened: false } => {
                    let delay = self.backoff.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    info!(
                        "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                        id, delay, failures
                    );
                    if self.pause(delay).await {
                        break;
                    }
                }
            }

            self.metrics.record_reconnection();
        }

        info!("[SHARD-{}] Stopped", id);
    }

    async fn run_cycle(&mut self) -> CycleEnd {
        let id = self.shard.id();
        self.machine.connection_opening();
        self.publish();

        if let Err(e) = self.connection.connect(&self.url).await {
            warn!("[SHARD-{}] Connection failed: {}", id, e);
            self.metrics.record_error();
            return CycleEnd::Dropped { opened: false };
        }
        self.metrics.record_connection();
        self.metrics.shard_connected(id);

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut opened = false;

        loop {
            let end = tokio::select! {
                packet = self.connection.read() => match packet {
                    Some(envelope) => self.on_packet(envelope).await,
                    None => Some(CycleEnd::Dropped { opened }),
                },
                _ = ticker.tick() => match self.machine.poll_heartbeat(Instant::now()) {
                    Some(action) => self.apply(vec![action]).await,
                    None => None,
                },
                command = self.command_rx.recv() => match command {
                    Some(ShardCommand::Send(envelope)) => {
                        self.send(&envelope).await;
                        None
                    }
                    Some(ShardCommand::Reconnect) => {
                        info!("[SHARD-{}] Received reconnect command", id);
                        self.machine.begin_close();
                        self.connection.disconnect(RESUMABLE_CLOSE, "reconnect requested").await;
                        Some(CycleEnd::Requested { opened })
                    }
                    Some(ShardCommand::Close) | None => {
                        info!("[SHARD-{}] Received close command", id);
                        self.machine.begin_close();
                        self.connection.disconnect(RESUMABLE_CLOSE, "shutting down").await;
                        Some(CycleEnd::Stopped)
                    }
                },
            };

            if self.machine.state() == ShardState::Open {
                opened = true;
            }

            if let Some(end) = end {
                return match end {
                    CycleEnd::Requested { .. } => CycleEnd::Requested { opened },
                    CycleEnd::Dropped { .. } => CycleEnd::Dropped { opened },
                    CycleEnd::Stopped => CycleEnd::Stopped,
                };
            }
        }
    }

    async fn on_packet(&mut self, envelope: Envelope) -> Option<CycleEnd> {
        self.metrics.record_packet_received();
        match envelope.op {
            Opcode::HeartbeatAck => self.metrics.record_heartbeat_ack(),
            Opcode::InvalidSession => self.metrics.record_invalid_session(),
            _ => {}
        }

        let is_dispatch = envelope.op == Opcode::Dispatch;
        let actions = self.machine.handle(envelope, Instant::now());
        if is_dispatch && !actions.iter().any(|a| matches!(a, ShardAction::Emit(_))) {
            self.metrics.record_event_dropped();
        }

        let end = self.apply(actions).await;
        self.publish();
        end
    }

    /// Execute actions in order; a close ends the cycle
    async fn apply(&mut self, actions: Vec<ShardAction>) -> Option<CycleEnd> {
        for action in actions {
            match action {
                ShardAction::Send(envelope) => {
                    self.send(&envelope).await;
                }
                ShardAction::Emit(event) => self.dispatch(event).await,
                ShardAction::Close {
                    code,
                    reason,
                    delay,
                } => {
                    if code == PROTOCOL_ERROR_CLOSE {
                        self.metrics.record_heartbeat_timeout();
                    }
                    if !delay.is_zero() {
                        debug!(
                            "[SHARD-{}] Waiting {:?} before reconnecting",
                            self.shard.id(),
                            delay
                        );
                        if self.pause(delay).await {
                            self.connection.disconnect(RESUMABLE_CLOSE, "shutting down").await;
                            return Some(CycleEnd::Stopped);
                        }
                    }
                    self.connection.disconnect(code, reason).await;
                    return Some(CycleEnd::Requested { opened: false });
                }
            }
        }
        None
    }

    async fn send(&mut self, envelope: &Envelope) {
        if !self.connection.send(envelope).await {
            return;
        }
        self.metrics.record_packet_sent();
        match envelope.op {
            Opcode::Heartbeat => self.metrics.record_heartbeat_sent(),
            Opcode::Identify => self.metrics.record_identify(),
            Opcode::Resume => self.metrics.record_resume(),
            _ => {}
        }
    }

    /// Hand an event to the handler, isolating panics unless in low-latency mode
    async fn dispatch(&self, event: GatewayEvent) {
        let id = self.shard.id();
        self.metrics.record_event_dispatched();

        if self.low_latency_mode {
            let name = event.name().to_string();
            if let Err(e) = self.handler.on_event(&self.shard, event).await {
                warn!("[SHARD-{}] Handler failed on {}: {}", id, name, e);
                self.metrics.record_handler_failure();
            }
            return;
        }

        let handler = self.handler.clone();
        let shard = self.shard.clone();
        let name = event.name().to_string();

        let result = tokio::spawn(async move { handler.on_event(&shard, event).await }).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[SHARD-{}] Handler failed on {}: {}", id, name, e);
                self.metrics.record_handler_failure();
            }
            Err(e) => {
                if e.is_panic() {
                    error!(
                        "[SHARD-{}] Handler.on_event panicked on {}! Event dropped. Error: {:?}",
                        id, name, e
                    );
                    self.metrics.record_handler_failure();
                    self.metrics.record_error();
                } else {
                    warn!("[SHARD-{}] Handler.on_event task failed: {:?}", id, e);
                }
            }
        }
    }

    /// Tear down the cycle and notify the handler
    async fn finish_cycle(&mut self) {
        let id = self.shard.id();
        let close_code = self.connection.close_code();

        self.machine.connection_closed();
        self.metrics.shard_disconnected(id);
        self.shard.publish(|s| s.last_close_code = close_code);
        self.publish();

        if let Some(code) = close_code {
            match GatewayCloseCode::from_u16(code) {
                Some(known) if known.is_fatal() => error!(
                    "[SHARD-{}] Closed with {}; reconnecting will keep failing until this is fixed",
                    id, known
                ),
                Some(known) => info!("[SHARD-{}] Closed with {}", id, known),
                None => info!("[SHARD-{}] Closed with code {}", id, code),
            }
        }

        let handler = self.handler.clone();
        let shard = self.shard.clone();
        if self.low_latency_mode {
            handler.on_shard_closed(&shard, close_code).await;
            return;
        }
        let result =
            tokio::spawn(async move { handler.on_shard_closed(&shard, close_code).await }).await;
        if let Err(e) = result {
            if e.is_panic() {
                error!("[SHARD-{}] Handler.on_shard_closed panicked! Error: {:?}", id, e);
                self.metrics.record_handler_failure();
            }
        }
    }

    /// Sleep for `delay` while serving commands.
    ///
    /// Returns `true` if a close command arrived. A reconnect command cuts the
    /// wait short; packets queued meanwhile are dropped.
    async fn pause(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                command = self.command_rx.recv() => match command {
                    Some(ShardCommand::Close) | None => return true,
                    Some(ShardCommand::Reconnect) => return false,
                    Some(ShardCommand::Send(envelope)) => debug!(
                        "[SHARD-{}] Dropping {} packet, connection not open",
                        self.shard.id(),
                        envelope.op
                    ),
                },
            }
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        let session = self.machine.session().clone();
        let latency = self.machine.latency();
        let last_sequence = session.last_sequence;

        self.shard.publish(|s| {
            s.state = state;
            s.session = session;
            s.latency = latency;
            if let Some(user) = self.machine.user() {
                if s.user.as_ref() != Some(user) {
                    s.user = Some(user.clone());
                }
            }
            if let Some(application) = self.machine.application() {
                if s.application.as_ref() != Some(application) {
                    s.application = Some(application.clone());
                }
            }
        });

        self.metrics.update_shard(self.shard.id(), |s| {
            s.state = state;
            s.latency = latency;
            s.last_sequence = last_sequence;
        });
    }
}
