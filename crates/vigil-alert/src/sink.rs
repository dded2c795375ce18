use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vigil_common::error::{Result, VigilError};

use crate::types::{AlertPhase, Notification, Severity};

/// Delivery seam for alert notifications. Transports live outside the engine;
/// the evaluator only hands finished notifications to a sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Emits notifications as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        match notification.phase {
            AlertPhase::Firing => warn!(
                rule = %notification.rule_name,
                severity = %notification.severity,
                values = ?notification.series_values,
                repeat = notification.repeat,
                "alert firing"
            ),
            _ => info!(
                rule = %notification.rule_name,
                severity = %notification.severity,
                phase = %notification.phase,
                "alert {}",
                notification.phase.as_str().to_ascii_lowercase()
            ),
        }
        Ok(())
    }
}

/// Hands notifications to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.sender.send(notification.clone()).map_err(|_| {
            VigilError::InternalError("notification channel receiver dropped".to_string())
        })
    }
}

struct Route {
    sink: Box<dyn NotificationSink>,
    min_severity: Severity,
}

/// Fans notifications out to named sinks, each with a severity floor.
#[derive(Default)]
pub struct NotificationRouter {
    targets: BTreeMap<String, Route>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_target(
        &mut self,
        name: impl Into<String>,
        sink: Box<dyn NotificationSink>,
        min_severity: Severity,
    ) {
        self.targets.insert(name.into(), Route { sink, min_severity });
    }
}

#[async_trait]
impl NotificationSink for NotificationRouter {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        for (name, route) in &self.targets {
            if notification.severity < route.min_severity {
                continue;
            }
            if let Err(err) = route.sink.deliver(notification).await {
                warn!(
                    sink = %name,
                    rule = %notification.rule_name,
                    error = %err,
                    "failed to deliver alert notification"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn notification(severity: Severity) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            rule_name: "QueueBacklog".to_string(),
            severity,
            phase: AlertPhase::Firing,
            series_values: BTreeMap::new(),
            annotations: BTreeMap::new(),
            timestamp: Utc::now(),
            repeat: false,
        }
    }

    #[tokio::test]
    async fn router_respects_severity_floor() {
        let (all, mut all_rx) = ChannelSink::channel();
        let (pager, mut pager_rx) = ChannelSink::channel();
        let mut router = NotificationRouter::new();
        router.register_target("all", Box::new(all), Severity::Warning);
        router.register_target("pager", Box::new(pager), Severity::Critical);

        router.deliver(&notification(Severity::Warning)).await.unwrap();
        router.deliver(&notification(Severity::Critical)).await.unwrap();

        assert_eq!(all_rx.recv().await.unwrap().severity, Severity::Warning);
        assert_eq!(all_rx.recv().await.unwrap().severity, Severity::Critical);
        assert_eq!(pager_rx.recv().await.unwrap().severity, Severity::Critical);
        assert!(pager_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_target_does_not_block_the_others() {
        let (closed, closed_rx) = ChannelSink::channel();
        drop(closed_rx);
        let (open, mut open_rx) = ChannelSink::channel();
        let mut router = NotificationRouter::new();
        router.register_target("closed", Box::new(closed), Severity::Warning);
        router.register_target("open", Box::new(open), Severity::Warning);

        router.deliver(&notification(Severity::Critical)).await.unwrap();
        assert!(open_rx.recv().await.is_some());
    }
}
