use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::json;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use crate::domain::{AlertEvent, AlertKind};

/// Escalation channel for notable engine events. `notify` never fails the
/// caller: implementations log their own delivery problems.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, event: AlertEvent);
}

/// Writes alerts to the log only.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, event: AlertEvent) {
        match event.kind {
            AlertKind::ScraperError | AlertKind::SchedulerError => tracing::warn!(
                target: "alerts",
                kind = event.kind.as_str(),
                payload = ?event.payload,
                "alert"
            ),
            _ => tracing::info!(
                target: "alerts",
                kind = event.kind.as_str(),
                payload = ?event.payload,
                "alert"
            ),
        }
    }
}

/// Posts alerts to a Slack-compatible incoming webhook.
pub struct WebhookAlertSink {
    client: Client,
    url: String,
    timezone: Tz,
}

impl WebhookAlertSink {
    pub fn new(client: Client, url: String, timezone: &str) -> Self {
        Self {
            client,
            url,
            timezone: timezone.parse().unwrap_or(chrono_tz::UTC),
        }
    }

    fn render(&self, event: &AlertEvent) -> String {
        let (icon, headline) = match event.kind {
            AlertKind::ScraperError => (":rotating_light:", "Scraper error"),
            AlertKind::ScraperSuccess => (":white_check_mark:", "Scraper run completed"),
            AlertKind::SchedulerError => (":rotating_light:", "Scheduler error"),
            AlertKind::SystemHealth => (":information_source:", "System health report"),
        };
        let ts = event
            .timestamp
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d %H:%M:%S %Z");
        let mut text = format!("{icon} *{headline}*\n*Time:* {ts}");
        for (key, value) in &event.payload {
            text.push_str(&format!("\n*{key}:* {value}"));
        }
        text
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, event: AlertEvent) {
        let body = json!({ "text": self.render(&event) });
        let result = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(err) = result {
            tracing::warn!(
                target: "alerts",
                error = %err,
                kind = event.kind.as_str(),
                "failed to deliver alert webhook"
            );
        }
    }
}

/// Cheap, cloneable handle the engine emits alerts through. Emission is
/// synchronous and ordered; delivery happens on a dispatcher task.
#[derive(Clone)]
pub struct Alerts {
    sender: mpsc::UnboundedSender<AlertEvent>,
    progress: Arc<Progress>,
}

#[derive(Default)]
struct Progress {
    emitted: AtomicU64,
    delivered: AtomicU64,
    changed: Notify,
}

/// The task delivering queued alerts to the sink.
pub struct AlertDispatcher {
    handle: JoinHandle<()>,
    progress: Arc<Progress>,
}

impl Alerts {
    pub fn spawn(sink: Arc<dyn AlertSink>) -> (Self, AlertDispatcher) {
        let (alerts, mut receiver) = Self::channel();
        let progress = alerts.progress.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                sink.notify(event).await;
                progress.delivered.fetch_add(1, Ordering::SeqCst);
                progress.changed.notify_waiters();
            }
            tracing::debug!(target: "alerts", "alert dispatcher stopped");
        });
        let dispatcher = AlertDispatcher {
            handle,
            progress: alerts.progress.clone(),
        };
        (alerts, dispatcher)
    }

    /// Handle plus the raw receiving end, for callers that drain alerts themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let alerts = Self {
            sender,
            progress: Arc::new(Progress::default()),
        };
        (alerts, receiver)
    }

    pub fn emit(&self, event: AlertEvent) {
        self.progress.emitted.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.sender.send(event) {
            self.progress.emitted.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(
                target: "alerts",
                kind = err.0.kind.as_str(),
                "alert dispatcher is gone; dropping alert"
            );
        }
    }
}

impl AlertDispatcher {
    /// Waits until every alert emitted so far has been handed to the sink.
    /// Returns false if `limit` passes first.
    pub async fn drain(&self, limit: Duration) -> bool {
        let progress = &self.progress;
        let caught_up = async {
            loop {
                let changed = progress.changed.notified();
                if progress.delivered.load(Ordering::SeqCst)
                    >= progress.emitted.load(Ordering::SeqCst)
                    || self.handle.is_finished()
                {
                    return;
                }
                changed.await;
            }
        };
        let drained = tokio::time::timeout(limit, caught_up).await.is_ok();
        if !drained {
            let emitted = progress.emitted.load(Ordering::SeqCst);
            let pending = emitted.saturating_sub(progress.delivered.load(Ordering::SeqCst));
            tracing::warn!(target: "alerts", pending, "alerts still queued");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn webhook_text_uses_configured_timezone() {
        let sink = WebhookAlertSink::new(
            Client::new(),
            "http://localhost/hook".to_string(),
            "America/New_York",
        );
        let mut event = AlertEvent::new(AlertKind::ScraperError).with("Domain", "sfac.org");
        event.timestamp = Utc.with_ymd_and_hms(2025, 6, 15, 16, 0, 0).unwrap();

        let text = sink.render(&event);
        assert!(text.contains("Scraper error"));
        assert!(text.contains("2025-06-15 12:00:00"));
        assert!(text.contains("*Domain:* sfac.org"));
    }

    struct SlowSink {
        seen: parking_lot::Mutex<Vec<AlertKind>>,
    }

    #[async_trait]
    impl AlertSink for SlowSink {
        async fn notify(&self, event: AlertEvent) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.seen.lock().push(event.kind);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_queued_alerts() {
        let sink = Arc::new(SlowSink {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let (alerts, dispatcher) = Alerts::spawn(sink.clone());
        alerts.emit(AlertEvent::new(AlertKind::SchedulerError));
        alerts.emit(AlertEvent::new(AlertKind::SystemHealth));

        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        assert_eq!(
            *sink.seen.lock(),
            vec![AlertKind::SchedulerError, AlertKind::SystemHealth]
        );

        alerts.emit(AlertEvent::new(AlertKind::ScraperError));
        assert!(!dispatcher.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_does_not_panic() {
        let (alerts, receiver) = Alerts::channel();
        drop(receiver);
        alerts.emit(AlertEvent::new(AlertKind::SystemHealth));
    }
}
