//! Logging infrastructure
//!
//! Standard tracing setup plus a subscriber layer that feeds the
//! notification dispatcher: events at WARN or above, or carrying an
//! explicit `notify = true` field, go out-of-band. Error-coded events
//! pass through the dedup registry first.

pub mod error_codes;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::logging::error_codes::{EmitDecision, ErrorCodeRegistry};
use crate::notify::{Notification, NotificationDispatcher};

/// Initialize tracing with the notification layer attached
pub fn init(
    crate_level: &str,
    dispatcher: Option<NotificationDispatcher>,
    error_codes: Option<ErrorCodeRegistry>,
) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("satbridge={crate_level},info").into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(dispatcher.map(|d| NotifyLayer {
            dispatcher: d,
            error_codes,
        }))
        .init();
}

/// Extracted notification-relevant fields of one event
#[derive(Default)]
struct EventFields {
    message: String,
    notify: Option<bool>,
    error_code: Option<String>,
    error_code_clear: bool,
    notify_bots: Option<String>,
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "error_code" => self.error_code = Some(value.to_string()),
            "notify_bots" => self.notify_bots = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            "notify" => self.notify = Some(value),
            "error_code_clear" => self.error_code_clear = value,
            _ => {}
        }
    }
}

/// Subscriber layer forwarding selected events to the dispatcher
pub struct NotifyLayer {
    dispatcher: NotificationDispatcher,
    error_codes: Option<ErrorCodeRegistry>,
}

impl NotifyLayer {
    fn wants(&self, level: &Level, fields: &EventFields) -> bool {
        if fields.notify == Some(false) {
            return false;
        }
        *level <= Level::WARN || fields.notify == Some(true)
    }
}

impl<S: Subscriber> Layer<S> for NotifyLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let level = event.metadata().level();

        if !self.wants(level, &fields) {
            return;
        }

        let mut message = fields.message.clone();

        // Error-coded events run through the dedup registry
        if let Some(code) = &fields.error_code {
            let Some(registry) = &self.error_codes else {
                return self.forward(event, message, &fields);
            };
            let now = chrono::Utc::now();

            if fields.error_code_clear {
                if let Some(elapsed) = registry.record_clear(code, now) {
                    message = format!("Error code {code} cleared after {elapsed}: {message}");
                    self.spawn_persist_clear(registry.clone(), code.clone());
                } else {
                    return;
                }
            } else {
                match registry.should_emit(code, now) {
                    EmitDecision::First => {
                        self.spawn_persist(registry.clone(), code.clone(), message.clone());
                    }
                    EmitDecision::ReAlert => {
                        message = format!("Still failing ({code}): {message}");
                    }
                    EmitDecision::Suppressed => return,
                }
            }
        }

        self.forward(event, message, &fields);
    }
}

impl NotifyLayer {
    fn forward(&self, event: &Event<'_>, message: String, fields: &EventFields) {
        let extra_targets = fields
            .notify_bots
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        self.dispatcher.enqueue(Notification {
            text: message,
            source: event.metadata().target().to_string(),
            extra_targets,
        });
    }

    /// Persistence needs a runtime; outside one (early startup, tests)
    /// the history write is skipped, never blocked on.
    fn spawn_persist(&self, registry: ErrorCodeRegistry, code: String, message: String) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.persist_occurrence(&code, &message).await;
            });
        }
    }

    fn spawn_persist_clear(&self, registry: ErrorCodeRegistry, code: String) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.persist_clear(&code).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotificationTransport, TransportError};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl NotificationTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn warn_and_flagged_events_reach_the_dispatcher() {
        let transport = Arc::new(RecordingTransport {
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = NotificationDispatcher::new(vec![transport.clone()], vec![]);
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());

        let layer = NotifyLayer {
            dispatcher,
            error_codes: None,
        };
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("a warning happened");
            tracing::info!("plain info is not forwarded");
            tracing::info!(notify = true, "flagged info is forwarded");
            tracing::warn!(notify = false, "explicitly muted warning");
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("a warning happened"));
        assert!(sent[1].contains("flagged info is forwarded"));
    }

    #[tokio::test]
    async fn error_codes_suppress_repeats() {
        let transport = Arc::new(RecordingTransport {
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = NotificationDispatcher::new(vec![transport.clone()], vec![]);
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());

        let registry = ErrorCodeRegistry::new("host-a", std::time::Duration::from_secs(3600));
        let layer = NotifyLayer {
            dispatcher,
            error_codes: Some(registry),
        };
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(error_code = "lnd_down", "node unreachable");
            tracing::warn!(error_code = "lnd_down", "node unreachable");
            tracing::warn!(error_code = "lnd_down", "node unreachable");
            tracing::warn!(
                error_code = "lnd_down",
                error_code_clear = true,
                "node back"
            );
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let sent = transport.sent.lock();
        // First occurrence plus the clear event
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("cleared after"));
    }
}
