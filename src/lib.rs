//! # gateway-cluster
//!
//! A sharded gateway client with resumable sessions, plus a rate-limited
//! client for the platform's REST API.
//!
//! ## Features
//!
//! - **Sharding** with staged startup honoring the platform's identify concurrency
//! - **Session resume** across reconnects and, through [`ClusterSnapshot`], across restarts
//! - **Heartbeating** with zombie-connection detection
//! - **Auto-reconnection** with exponential backoff and full jitter
//! - **Rate-limited REST** pipeline that tracks server buckets and waits instead of failing
//! - **Metrics** for the gateway and per-route REST responses
//!
//! ## Example
//!
//! ```ignore
//! use gateway_cluster::{intents, handler_fn, ApiClient, Cluster, ClusterConfig, RestConfig};
//!
//! let api = ApiClient::new(RestConfig::builder(&token).build()?)?;
//! let info = api.get_gateway_bot().await?;
//!
//! let config = ClusterConfig::builder(&token)
//!     .intents(intents::GUILDS | intents::GUILD_MESSAGES)
//!     .build()?;
//!
//! let cluster = Cluster::new(config, handler_fn(|shard, event| async move {
//!     tracing::info!("[SHARD-{}] {}", shard.id(), event.name());
//!     Ok(())
//! }));
//! cluster.start_from_gateway_info(&info, None).await?;
//! ```

mod api;
mod cluster;
mod codec;
mod config;
mod connection;
mod error;
mod handler;
mod health;
mod metrics;
mod model;
mod protocol;
mod ratelimit;
mod rest;
mod session;
mod shard;
mod state;

pub mod events;

pub use api::{
    AllowedMentions, ApiClient, AttachmentInfo, MessageEditRequest, MessageReference, MessageRequest,
    ReactionEmoji, WebhookRequest,
};
pub use cluster::{effective_concurrency, plan_startup, Cluster, StartPlan, StartupStager};
pub use codec::{Decoded, PacketCodec};
pub use config::{
    BackoffConfig, ClusterConfig, ClusterConfigBuilder, ConfigError, ConnectionConfig, HeartbeatConfig,
    RestConfig, RestConfigBuilder, DEFAULT_API_BASE, DEFAULT_GATEWAY_VERSION,
};
pub use connection::gateway_url;
pub use error::{ApiError, BucketExhausted, Error, ErrorKind, RequestError, RequestErrorKind};
pub use events::GatewayEvent;
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerError};
pub use metrics::{Metrics, MetricsSnapshot, RouteMetrics, ShardMetrics};
pub use model::{
    ApplicationPartial, Attachment, Channel, GatewayBotInfo, Message, SessionStartLimit, Snowflake, User,
};
pub use protocol::{
    intents, Activity, ConnectionProperties, Envelope, GatewayCloseCode, Opcode, PresenceUpdate,
    RequestGuildMembers, Status, NORMAL_CLOSE, PROTOCOL_ERROR_CLOSE, RESUMABLE_CLOSE,
};
pub use ratelimit::{Bucket, RateLimiter, RatelimitHeaders};
pub use rest::{clean_for_logging, MultipartFile, RestClient, Route, NO_BODY};
pub use session::{ClusterSnapshot, ShardInfo, ShardSessionInfo, ShardSnapshot};
pub use shard::Shard;
pub use state::{ShardAction, ShardState, ShardStateMachine};

/// Result type for gateway-cluster operations
pub type Result<T> = std::result::Result<T, Error>;
