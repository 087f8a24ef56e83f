use crate::events::GatewayEvent;
use crate::shard::Shard;
use std::future::Future;

/// Error type handlers may return; it is logged and counted, never propagated
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Trait that users implement to receive gateway events.
///
/// The cluster handles connection lifecycle, heartbeating, session resume
/// and reconnection; the handler only sees decoded events. Calls are made
/// from the shard's task. Unless low-latency mode is enabled each call runs
/// in its own spawned task, so a panicking handler does not take the shard
/// down with it.
///
/// # Example
///
/// ```ignore
/// use gateway_cluster::{EventHandler, GatewayEvent, HandlerError, Shard};
///
/// struct Logger;
///
/// impl EventHandler for Logger {
///     async fn on_event(&self, shard: &Shard, event: GatewayEvent) -> Result<(), HandlerError> {
///         if let GatewayEvent::MessageCreate(message) = event {
///             println!("[{}] {}", shard.id(), message.content);
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync + 'static {
    /// Called for every decoded dispatch, in sequence order per shard.
    fn on_event(
        &self,
        shard: &Shard,
        event: GatewayEvent,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Called once per shard when the cluster creates it, before it connects.
    fn on_shard_created(&self, _shard: &Shard) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called each time a shard's connection ends, with the server's close
    /// code if one was received. The shard reconnects afterwards unless the
    /// cluster is stopping.
    fn on_shard_closed(
        &self,
        _shard: &Shard,
        _close_code: Option<u16>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Adapter that turns a closure into an [`EventHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Build an [`EventHandler`] from an async closure
///
/// ```ignore
/// let handler = handler_fn(|shard: Shard, event: GatewayEvent| async move {
///     tracing::info!("shard {} got {}", shard.id(), event.name());
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Shard, GatewayEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Shard, GatewayEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn on_event(
        &self,
        shard: &Shard,
        event: GatewayEvent,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        (self.f)(shard.clone(), event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ShardInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_handler_fn_forwards_events() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = handler_fn(move |shard: Shard, event: GatewayEvent| {
            let counter = counter.clone();
            async move {
                assert_eq!(shard.id(), 2);
                if event == GatewayEvent::Resumed {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err::<(), HandlerError>("unexpected event".into())
                }
            }
        });

        let (tx, _rx) = mpsc::channel(1);
        let shard = Shard::new(ShardInfo::new(2, 3).unwrap(), tx);

        assert!(handler.on_event(&shard, GatewayEvent::Resumed).await.is_ok());
        let unknown = GatewayEvent::Unknown {
            name: "X".to_string(),
            data: serde_json::Value::Null,
        };
        assert!(handler.on_event(&shard, unknown).await.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Default hooks are no-ops
        handler.on_shard_created(&shard).await;
        handler.on_shard_closed(&shard, Some(4000)).await;
    }
}
