//! In-process event bus
//!
//! Subscribers are isolated from each other: each handler runs under its own
//! timeout and a failing or slow handler is logged without stopping delivery
//! to the rest.

use super::DeliveryEvent;
use async_trait::async_trait;
use outpost_common::Result;
use outpost_storage::models::DeliveryEventKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Subscriber to delivery events
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn accepts(&self, kind: DeliveryEventKind) -> bool;
    async fn handle(&self, event: &DeliveryEvent) -> Result<()>;
}

/// What happened during one publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that completed successfully
    pub handled: Vec<String>,
    /// Handlers that failed or timed out
    pub failed: Vec<String>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Event bus
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    handler_timeout: Duration,
}

impl EventBus {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            handler_timeout,
        }
    }

    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "Event handler subscribed");
        self.handlers.write().await.push(handler);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Deliver `event` to every interested handler, in subscription order
    pub async fn publish(&self, event: &DeliveryEvent) -> PublishReport {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|handler| handler.accepts(event.kind))
            .cloned()
            .collect();

        let mut report = PublishReport::default();

        for handler in handlers {
            let name = handler.name().to_string();
            match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
                Ok(Ok(())) => report.handled.push(name),
                Ok(Err(e)) => {
                    error!(
                        handler = %name,
                        event = %event.kind,
                        recipient = %event.recipient,
                        error = %e,
                        "Event handler failed"
                    );
                    report.failed.push(name);
                }
                Err(_) => {
                    warn!(
                        handler = %name,
                        event = %event.kind,
                        timeout_ms = self.handler_timeout.as_millis() as u64,
                        "Event handler timed out"
                    );
                    report.failed.push(name);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outpost_common::Error;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        kinds: Vec<DeliveryEventKind>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn accepts(&self, kind: DeliveryEventKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn handle(&self, _event: &DeliveryEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn accepts(&self, _kind: DeliveryEventKind) -> bool {
            true
        }

        async fn handle(&self, _event: &DeliveryEvent) -> Result<()> {
            Err(Error::Internal("boom".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl EventHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn accepts(&self, _kind: DeliveryEventKind) -> bool {
            true
        }

        async fn handle(&self, _event: &DeliveryEvent) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn event(kind: DeliveryEventKind) -> DeliveryEvent {
        DeliveryEvent {
            kind,
            recipient: "lead@example.com".to_string(),
            message_id: Some("msg-1".to_string()),
            job_id: None,
            campaign_id: None,
            lead_id: None,
            client_id: None,
            severity: None,
            description: None,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_kind() {
        let bus = EventBus::new(Duration::from_secs(1));
        let opens = Arc::new(Counting {
            name: "opens",
            kinds: vec![DeliveryEventKind::Opened],
            calls: AtomicUsize::new(0),
        });
        bus.subscribe(opens.clone()).await;

        bus.publish(&event(DeliveryEventKind::Opened)).await;
        bus.publish(&event(DeliveryEventKind::Bounced)).await;

        assert_eq!(opens.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated() {
        let bus = EventBus::new(Duration::from_millis(100));
        let counter = Arc::new(Counting {
            name: "counter",
            kinds: vec![DeliveryEventKind::Delivered],
            calls: AtomicUsize::new(0),
        });
        bus.subscribe(Arc::new(Failing)).await;
        bus.subscribe(Arc::new(Slow)).await;
        bus.subscribe(counter.clone()).await;

        let report = bus.publish(&event(DeliveryEventKind::Delivered)).await;

        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.handled, vec!["counter".to_string()]);
        assert_eq!(
            report.failed,
            vec!["failing".to_string(), "slow".to_string()]
        );
        assert!(!report.is_clean());
    }
}
