//! Notification dispatcher
//!
//! Out-of-band fan-out to one or more chat bots. The dispatcher owns its
//! send queue; `enqueue` is synchronous and never blocks, so the logging
//! pipeline can hand messages over from any thread. Draining happens on
//! a task spawned onto whichever runtime handle was bound last: every
//! main entry point must call `bind_runtime` immediately after its
//! runtime starts, otherwise early messages sit in the pre-bind buffer
//! until one does.

pub mod telegram;

use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

pub use telegram::TelegramBot;

/// Rate-limit window
const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Sends allowed per signature inside the window
const RATE_LIMIT: usize = 5;
/// Signature length: the trailing characters of a message identify its
/// pattern
const SIGNATURE_LEN: usize = 20;
/// Messages longer than this are truncated with an ellipsis
const MAX_MESSAGE_LEN: usize = 300;
/// Per-message delivery attempts
const MAX_ATTEMPTS: u32 = 3;

/// A message on its way out
#[derive(Debug, Clone)]
pub struct Notification {
    pub text: String,
    /// Originating component (tracing target), used by the silence list
    pub source: String,
    /// Additional named transports beyond the defaults
    pub extra_targets: Vec<String>,
}

/// Transport failure with optional server-driven retry delay
#[derive(Debug)]
pub struct TransportError {
    pub message: String,
    pub transient: bool,
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// One outbound chat transport
#[async_trait::async_trait]
pub trait NotificationTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, text: &str) -> std::result::Result<(), TransportError>;
}

/// Per-signature sliding-window rate limiter
pub struct PatternLimiter {
    windows: HashMap<String, VecDeque<Instant>>,
    throttled: HashSet<String>,
}

/// Limiter decision for one message
#[derive(Debug, PartialEq, Eq)]
pub enum LimiterDecision {
    Allow,
    /// Dropped; the first drop in a throttle episode sends one notice
    Throttle { notice: bool },
}

impl PatternLimiter {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
            throttled: HashSet::new(),
        }
    }

    pub fn check(&mut self, signature: &str, now: Instant) -> LimiterDecision {
        let window = self.windows.entry(signature.to_string()).or_default();
        while let Some(&front) = window.front() {
            if now.duration_since(front) >= RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= RATE_LIMIT {
            let notice = self.throttled.insert(signature.to_string());
            return LimiterDecision::Throttle { notice };
        }
        window.push_back(now);
        self.throttled.remove(signature);
        LimiterDecision::Allow
    }
}

impl Default for PatternLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Trailing-character signature identifying a message pattern
pub fn signature(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(SIGNATURE_LEN);
    chars[start..].iter().collect()
}

/// Strip ANSI colour sequences before sending
pub fn strip_ansi(text: &str) -> String {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        // ESC [ ... final-byte
        Regex::new("\u{1b}\\[[0-9;]*[A-Za-z]").expect("static pattern compiles")
    });
    re.replace_all(text, "").into_owned()
}

/// Truncate to the outbound limit with an ellipsis
pub fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_LEN {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_MESSAGE_LEN).collect();
    format!("{kept}...")
}

struct DispatcherInner {
    /// Buffer for messages enqueued before any runtime is bound
    pending: Mutex<VecDeque<Notification>>,
    tx: Mutex<Option<UnboundedSender<Notification>>>,
    limiter: Mutex<PatternLimiter>,
    transports: Vec<Arc<dyn NotificationTransport>>,
    silenced: HashSet<String>,
}

/// The dispatcher handle, cheap to clone
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl NotificationDispatcher {
    pub fn new(transports: Vec<Arc<dyn NotificationTransport>>, silenced: Vec<String>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                pending: Mutex::new(VecDeque::new()),
                tx: Mutex::new(None),
                limiter: Mutex::new(PatternLimiter::new()),
                transports,
                silenced: silenced.into_iter().collect(),
            }),
        }
    }

    /// Queue a message. Synchronous, lock-held only briefly, never
    /// blocks on I/O or a runtime.
    pub fn enqueue(&self, notification: Notification) {
        if self
            .inner
            .silenced
            .iter()
            .any(|s| notification.source.starts_with(s.as_str()))
        {
            return;
        }
        {
            let guard = self.inner.tx.lock();
            if let Some(tx) = &*guard {
                let _ = tx.send(notification);
                return;
            }
        }
        self.inner.pending.lock().push_back(notification);
    }

    /// Point the dispatcher at a live runtime and start (or restart) the
    /// drain task there. Every entry point calls this immediately after
    /// its runtime starts; rebinding replaces the old drain task, whose
    /// channel closes when its sender is dropped.
    pub fn bind_runtime(&self, handle: &tokio::runtime::Handle) {
        let (tx, rx) = unbounded_channel();
        for pending in self.inner.pending.lock().drain(..) {
            let _ = tx.send(pending);
        }
        *self.inner.tx.lock() = Some(tx);
        let inner = self.inner.clone();
        handle.spawn(drain_loop(inner, rx));
    }

    /// Number of messages waiting in the pre-bind buffer
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

async fn drain_loop(inner: Arc<DispatcherInner>, mut rx: UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        let text = truncate(&strip_ansi(&notification.text));

        let decision = inner.limiter.lock().check(&signature(&text), Instant::now());
        let outbound = match decision {
            LimiterDecision::Allow => text,
            LimiterDecision::Throttle { notice: true } => {
                format!("Throttling repeated messages: {}", signature(&text))
            }
            LimiterDecision::Throttle { notice: false } => continue,
        };

        for transport in &inner.transports {
            send_with_retry(transport.as_ref(), &outbound).await;
        }
        for target in &notification.extra_targets {
            if let Some(transport) = inner.transports.iter().find(|t| t.name() == target) {
                send_with_retry(transport.as_ref(), &outbound).await;
            }
        }
    }
    debug!("Notification drain loop ended");
}

async fn send_with_retry(transport: &dyn NotificationTransport, text: &str) {
    let mut attempt = 0;
    loop {
        match transport.send(text).await {
            Ok(()) => return,
            Err(e) if e.transient && attempt + 1 < MAX_ATTEMPTS => {
                let delay = e
                    .retry_after
                    .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                debug!(
                    transport = transport.name(),
                    attempt, "Transient send failure, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(transport = transport.name(), "Dropping message: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    struct RecordingTransport {
        name: String,
        sent: PMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl NotificationTransport for RecordingTransport {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, text: &str) -> std::result::Result<(), TransportError> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    fn transport(name: &str) -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            name: name.to_string(),
            sent: PMutex::new(Vec::new()),
        })
    }

    #[test]
    fn signature_is_trailing_chars() {
        assert_eq!(signature("short"), "short");
        let long = "x".repeat(40) + "the-trailing-pattern";
        assert_eq!(signature(&long), "the-trailing-pattern");
        assert_eq!(signature(&long).chars().count(), 20);
    }

    #[test]
    fn limiter_allows_five_then_throttles() {
        let mut limiter = PatternLimiter::new();
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(limiter.check("sig", now), LimiterDecision::Allow);
        }
        // Sixth inside the window drops with one notice
        assert_eq!(
            limiter.check("sig", now),
            LimiterDecision::Throttle { notice: true }
        );
        assert_eq!(
            limiter.check("sig", now),
            LimiterDecision::Throttle { notice: false }
        );
        // A different signature is unaffected
        assert_eq!(limiter.check("other", now), LimiterDecision::Allow);
    }

    #[test]
    fn limiter_window_clears() {
        let mut limiter = PatternLimiter::new();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.check("sig", start);
        }
        let later = start + RATE_WINDOW + Duration::from_secs(1);
        assert_eq!(limiter.check("sig", later), LimiterDecision::Allow);
    }

    #[test]
    fn strips_ansi_colour() {
        let coloured = "\u{1b}[31mred alert\u{1b}[0m done";
        assert_eq!(strip_ansi(coloured), "red alert done");
    }

    #[test]
    fn truncates_long_messages() {
        let long = "a".repeat(500);
        let cut = truncate(&long);
        assert_eq!(cut.chars().count(), 303);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn enqueue_before_bind_buffers_then_flushes() {
        let t = transport("default");
        let dispatcher = NotificationDispatcher::new(vec![t.clone()], vec![]);

        // No runtime bound yet: enqueue must not block and must buffer
        dispatcher.enqueue(Notification {
            text: "early message".to_string(),
            source: "satbridge::test".to_string(),
            extra_targets: vec![],
        });
        assert_eq!(dispatcher.pending_len(), 1);

        // Entry point comes up and rebinds
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = t.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], "early message");
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn rebinding_replaces_the_drain_task() {
        let t = transport("default");
        let dispatcher = NotificationDispatcher::new(vec![t.clone()], vec![]);
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());

        dispatcher.enqueue(Notification {
            text: "after rebind".to_string(),
            source: "satbridge::test".to_string(),
            extra_targets: vec![],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Exactly one delivery: the old drain task's channel closed on
        // rebind
        assert_eq!(t.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn silence_list_drops_by_component_prefix() {
        let t = transport("default");
        let dispatcher =
            NotificationDispatcher::new(vec![t.clone()], vec!["satbridge::hive".to_string()]);
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());

        dispatcher.enqueue(Notification {
            text: "silenced".to_string(),
            source: "satbridge::hive::watcher".to_string(),
            extra_targets: vec![],
        });
        dispatcher.enqueue(Notification {
            text: "audible".to_string(),
            source: "satbridge::ledger".to_string(),
            extra_targets: vec![],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = t.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], "audible");
    }

    #[tokio::test]
    async fn extra_targets_multiplex() {
        let default = transport("default");
        let ops = transport("ops-room");
        let dispatcher = NotificationDispatcher::new(
            vec![default.clone(), ops.clone()],
            vec![],
        );
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());

        dispatcher.enqueue(Notification {
            text: "to everyone plus ops".to_string(),
            source: "satbridge::engine".to_string(),
            extra_targets: vec!["ops-room".to_string()],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        // ops-room receives the broadcast once and the extra-target send
        // once
        assert_eq!(default.sent.lock().len(), 1);
        assert_eq!(ops.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_caps_sends_per_window() {
        let t = transport("default");
        let dispatcher = NotificationDispatcher::new(vec![t.clone()], vec![]);
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());

        for _ in 0..8 {
            dispatcher.enqueue(Notification {
                text: "identical repeated failure message".to_string(),
                source: "satbridge::test".to_string(),
                extra_targets: vec![],
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = t.sent.lock();
        // Five real sends plus one throttling notice
        assert_eq!(sent.len(), 6);
        assert!(sent[5].starts_with("Throttling repeated messages"));
    }

    #[tokio::test]
    async fn retry_honours_retry_after_then_succeeds() {
        struct FlakyTransport {
            failures: PMutex<u32>,
            sent: PMutex<Vec<String>>,
        }

        #[async_trait::async_trait]
        impl NotificationTransport for FlakyTransport {
            fn name(&self) -> &str {
                "flaky"
            }

            async fn send(&self, text: &str) -> std::result::Result<(), TransportError> {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(TransportError {
                        message: "slow down".to_string(),
                        transient: true,
                        retry_after: Some(Duration::from_millis(10)),
                    });
                }
                self.sent.lock().push(text.to_string());
                Ok(())
            }
        }

        let flaky = Arc::new(FlakyTransport {
            failures: PMutex::new(2),
            sent: PMutex::new(Vec::new()),
        });
        let dispatcher = NotificationDispatcher::new(vec![flaky.clone()], vec![]);
        dispatcher.bind_runtime(&tokio::runtime::Handle::current());

        dispatcher.enqueue(Notification {
            text: "eventually delivered".to_string(),
            source: "satbridge::test".to_string(),
            extra_targets: vec![],
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flaky.sent.lock().len(), 1);
    }
}
