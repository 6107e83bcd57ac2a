// src/sys/notify.rs

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::sys::traits::{AlertLevel, Event, Notifier};

/// Writes every event to the log stream.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: Event) {
        match &event {
            Event::Alert { level: AlertLevel::Warning | AlertLevel::Critical, message } => {
                warn!(event = "alert", %message, "Alert raised");
            }
            _ => info!(event = ?event, "Status change"),
        }
    }
}

/// Fans events out to in-process subscribers (the dashboard broadcaster).
/// Sending never blocks; slow receivers lag and lose old events.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Event>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: Event) {
        TracingNotifier.notify(event.clone());
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.notify(Event::ServiceStarted {
            site: "demo1".into(),
            service: "api".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::ServiceStarted {
                site: "demo1".into(),
                service: "api".into()
            }
        );
    }

    #[test]
    fn notifying_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(1);
        for _ in 0..4 {
            notifier.notify(Event::Alert {
                level: AlertLevel::Info,
                message: "tick".into(),
            });
        }
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(Event::ServiceFailed {
            site: "demo1".into(),
            service: "api".into(),
            error: "exit 1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "service_failed");
        assert_eq!(json["error"], "exit 1");
    }
}
