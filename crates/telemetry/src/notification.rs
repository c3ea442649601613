//! Notification bus for run lifecycle changes.
//!
//! Uses [`tokio::sync::broadcast`] for fan-out delivery to multiple subscribers
//! (an inbox UI, a pager bridge). Notifications are fire-and-forget
//! projections; dropping them is acceptable.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use spire_core::{RunId, TenantId, TicketId};
use tokio::sync::broadcast;

/// Run lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunNotification {
    /// A run executed its first step.
    Started {
        /// The run.
        run_id: RunId,
        /// Owning tenant.
        tenant_id: TenantId,
        /// Workflow name.
        workflow_id: String,
    },
    /// A run parked on a ticket; someone needs to decide.
    ApprovalRequested {
        /// The run.
        run_id: RunId,
        /// Owning tenant.
        tenant_id: TenantId,
        /// Ticket to decide.
        ticket_id: TicketId,
        /// Risk classification.
        risk_level: String,
    },
    /// A parked run resumed.
    Resumed {
        /// The run.
        run_id: RunId,
        /// Owning tenant.
        tenant_id: TenantId,
    },
    /// A run completed.
    Completed {
        /// The run.
        run_id: RunId,
        /// Owning tenant.
        tenant_id: TenantId,
    },
    /// A run failed.
    Failed {
        /// The run.
        run_id: RunId,
        /// Owning tenant.
        tenant_id: TenantId,
        /// Error description.
        error: String,
    },
    /// A run was canceled.
    Canceled {
        /// The run.
        run_id: RunId,
        /// Owning tenant.
        tenant_id: TenantId,
    },
}

impl RunNotification {
    /// The run this notification is about.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Started { run_id, .. }
            | Self::ApprovalRequested { run_id, .. }
            | Self::Resumed { run_id, .. }
            | Self::Completed { run_id, .. }
            | Self::Failed { run_id, .. }
            | Self::Canceled { run_id, .. } => *run_id,
        }
    }
}

/// Broadcast-based notification bus.
///
/// If no subscribers are listening, notifications are silently dropped.
#[derive(Debug)]
pub struct NotificationBus {
    sender: broadcast::Sender<RunNotification>,
    emitted: AtomicU64,
}

impl NotificationBus {
    /// Create a bus with the given per-subscriber buffer.
    ///
    /// When a subscriber falls behind by more than `capacity`, it skips the
    /// oldest notifications.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            emitted: AtomicU64::new(0),
        }
    }

    /// Publish to all subscribers.
    pub fn emit(&self, notification: RunNotification) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(notification).is_err() {
            tracing::trace!("run notification dropped, no subscribers");
        }
    }

    /// Subscribe to notifications emitted from now on.
    pub fn subscribe(&self) -> NotificationSubscriber {
        NotificationSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Total notifications emitted since creation.
    #[must_use]
    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Subscription handle for the [`NotificationBus`].
#[derive(Debug)]
pub struct NotificationSubscriber {
    receiver: broadcast::Receiver<RunNotification>,
}

impl NotificationSubscriber {
    /// Receive the next notification, skipping over any that were missed.
    ///
    /// Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<RunNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<RunNotification> {
        loop {
            match self.receiver.try_recv() {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(run_id: RunId) -> RunNotification {
        RunNotification::Completed {
            run_id,
            tenant_id: TenantId::v4(),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = NotificationBus::new(16);
        bus.emit(completed(RunId::v4()));
        assert_eq!(bus.total_emitted(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn every_subscriber_gets_a_copy() {
        let bus = NotificationBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let run_id = RunId::v4();
        bus.emit(completed(run_id));

        assert_eq!(a.try_recv().map(|n| n.run_id()), Some(run_id));
        assert_eq!(b.try_recv().map(|n| n.run_id()), Some(run_id));
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_skips_lagged_notifications() {
        let bus = NotificationBus::new(2);
        let mut sub = bus.subscribe();
        let ids: Vec<_> = (0..4).map(|_| RunId::v4()).collect();
        for id in &ids {
            bus.emit(completed(*id));
        }
        assert_eq!(sub.recv().await.map(|n| n.run_id()), Some(ids[2]));
        assert_eq!(sub.recv().await.map(|n| n.run_id()), Some(ids[3]));
    }

    #[test]
    fn serializes_with_type_tag() {
        let n = RunNotification::Failed {
            run_id: RunId::v4(),
            tenant_id: TenantId::v4(),
            error: "step: boom".into(),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["error"], "step: boom");
    }
}
