use crate::state::ShardState;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

/// Cluster-wide counters, per-shard gauges and REST response stats.
///
/// Use `snapshot()` to get a point-in-time view of everything, or the
/// individual getters for specific values.
///
/// # Example
/// ```ignore
/// let metrics = cluster.metrics();
///
/// println!("Connections: {}", metrics.connections());
/// println!("Events dispatched: {}", metrics.events_dispatched());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    packets_received_total: AtomicU64,
    packets_sent_total: AtomicU64,
    errors_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    heartbeat_timeouts_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    events_dispatched_total: AtomicU64,
    events_dropped_total: AtomicU64,
    handler_failures_total: AtomicU64,
    rest_responses_total: AtomicU64,

    /// Indexed by shard id
    shard_metrics: RwLock<Vec<ShardMetrics>>,
    /// Keyed by route name and status
    routes: RwLock<BTreeMap<(String, u16), RouteMetrics>>,
}

/// Gauges of one shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u32,
    pub state: ShardState,
    pub is_connected: bool,
    /// Round trip of the last acknowledged heartbeat
    pub latency: Option<Duration>,
    pub last_sequence: Option<u64>,
    /// Duration since the last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Accumulated time spent connected, excluding the current connection
    pub total_uptime: Duration,
    pub(crate) last_connected_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            state: ShardState::Closed,
            is_connected: false,
            latency: None,
            last_sequence: None,
            time_since_connected: None,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
        }
    }

    /// Copy with computed durations
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

/// Responses seen for one REST route with one status code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMetrics {
    /// Method and endpoint name, e.g. `POST create_message`
    pub route: String,
    pub status: u16,
    pub count: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

impl RouteMetrics {
    pub fn average_latency(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total_latency / count,
            Err(_) => self.total_latency / u32::MAX,
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sockets successfully opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Connection cycles that were followed by another one
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received_total.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent_total.load(Ordering::Relaxed)
    }

    /// Connection failures and handler panics
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// Connections dropped because a heartbeat went unacknowledged
    pub fn heartbeat_timeouts(&self) -> u64 {
        self.heartbeat_timeouts_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    /// Events forwarded to the handler
    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched_total.load(Ordering::Relaxed)
    }

    /// Dispatches dropped as unknown or undecodable
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped_total.load(Ordering::Relaxed)
    }

    /// Handler calls that returned an error or panicked
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures_total.load(Ordering::Relaxed)
    }

    /// REST responses received, whatever their status
    pub fn rest_responses(&self) -> u64 {
        self.rest_responses_total.load(Ordering::Relaxed)
    }

    /// REST stats per route and status, ordered by route name
    pub fn route_metrics(&self) -> Vec<RouteMetrics> {
        self.routes.read().values().cloned().collect()
    }

    // Recorders, called by the shard runners and the REST client

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_packet_received(&self) {
        self.packets_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_packet_sent(&self) {
        self.packets_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dispatched(&self) {
        self.events_dispatched_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_response(&self, route: &str, status: u16, elapsed: Duration) {
        self.rest_responses_total.fetch_add(1, Ordering::Relaxed);

        let mut routes = self.routes.write();
        let entry = routes
            .entry((route.to_string(), status))
            .or_insert_with(|| RouteMetrics {
                route: route.to_string(),
                status,
                count: 0,
                total_latency: Duration::ZERO,
                max_latency: Duration::ZERO,
            });
        entry.count += 1;
        entry.total_latency += elapsed;
        entry.max_latency = entry.max_latency.max(elapsed);
    }

    /// Apply `update_fn` to one shard's entry
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let index = shard_id as usize;

        // Shards register lazily, fill any gap below this id
        while shards.len() <= index {
            let id = shards.len() as u32;
            shards.push(ShardMetrics::new(id));
        }

        update_fn(&mut shards[index]);
    }

    /// Mark a shard connected and start its uptime clock
    pub(crate) fn shard_connected(&self, shard_id: u32) {
        self.update_shard(shard_id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
        });
    }

    /// Mark a shard disconnected and fold the connection into its uptime
    pub(crate) fn shard_disconnected(&self, shard_id: u32) {
        self.update_shard(shard_id, |s| {
            if s.is_connected {
                if let Some(connected_at) = s.last_connected_at {
                    s.total_uptime += connected_at.elapsed();
                }
            }
            s.is_connected = false;
        });
    }

    /// Per-shard gauges, in shard order
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Shards with an open socket right now
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Everything at once, read under a single shard lock
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.iter().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            packets_received_total: self.packets_received_total.load(Ordering::Acquire),
            packets_sent_total: self.packets_sent_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            heartbeat_timeouts_total: self.heartbeat_timeouts_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            events_dispatched_total: self.events_dispatched_total.load(Ordering::Acquire),
            events_dropped_total: self.events_dropped_total.load(Ordering::Acquire),
            handler_failures_total: self.handler_failures_total.load(Ordering::Acquire),
            rest_responses_total: self.rest_responses_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
            routes: self.route_metrics(),
        }
    }
}

/// Copy of every counter and gauge taken by [`Metrics::snapshot`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub packets_received_total: u64,
    pub packets_sent_total: u64,
    pub errors_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub heartbeat_timeouts_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub invalid_sessions_total: u64,
    pub events_dispatched_total: u64,
    pub events_dropped_total: u64,
    pub handler_failures_total: u64,
    pub rest_responses_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
    pub routes: Vec<RouteMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_reconnection();
        metrics.record_identify();
        metrics.record_event_dropped();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.identifies(), 1);
        assert_eq!(metrics.resumes(), 0);
        assert_eq!(metrics.events_dropped(), 1);
    }

    #[test]
    fn test_shard_metrics_grow_on_demand() {
        let metrics = Metrics::new();

        metrics.update_shard(2, |s| {
            s.state = ShardState::Open;
            s.last_sequence = Some(9);
        });

        let shards = metrics.shard_metrics();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].shard_id, 0);
        assert_eq!(shards[0].state, ShardState::Closed);
        assert_eq!(shards[2].state, ShardState::Open);
        assert_eq!(shards[2].last_sequence, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_accumulates() {
        let metrics = Metrics::new();

        metrics.shard_connected(0);
        metrics.shard_connected(1);
        assert_eq!(metrics.active_connections(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        metrics.shard_disconnected(0);
        // Already disconnected, no double count
        metrics.shard_disconnected(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.shards[0].total_uptime, Duration::from_secs(10));
        assert_eq!(snapshot.shards[1].time_since_connected, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_packet_received();
        metrics.record_packet_received();
        metrics.record_handler_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.packets_received_total, 2);
        assert_eq!(snapshot.handler_failures_total, 1);
        assert_eq!(snapshot.packets_sent_total, 0);
    }

    #[test]
    fn test_route_metrics_group_by_status() {
        let metrics = Metrics::new();

        metrics.record_rest_response("GET get_channel", 200, Duration::from_millis(30));
        metrics.record_rest_response("GET get_channel", 200, Duration::from_millis(50));
        metrics.record_rest_response("GET get_channel", 404, Duration::from_millis(10));
        metrics.record_rest_response("DELETE delete_message", 204, Duration::from_millis(20));

        let routes = metrics.route_metrics();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].route, "DELETE delete_message");
        assert_eq!((routes[1].status, routes[1].count), (200, 2));
        assert_eq!(routes[1].max_latency, Duration::from_millis(50));
        assert_eq!(routes[1].average_latency(), Duration::from_millis(40));
        assert_eq!((routes[2].status, routes[2].count), (404, 1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rest_responses_total, 4);
        assert_eq!(snapshot.routes, routes);
    }
}
