use anyhow::Result;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::bot::ChatSender;
use crate::db;
use crate::mailer::Mailer;
use crate::model::{ChannelConfig, Delivery, Subscription};

/// Fans an event out to every active subscription listening for it.
/// Channel failures are contained per subscription; only the subscription
/// fetch itself can fail a dispatch outright.
pub struct Dispatcher {
    pool: SqlitePool,
    chat: Arc<dyn ChatSender>,
    mailer: Arc<dyn Mailer>,
}

/// Tally of one dispatch. Never returned to HTTP callers; used for logging
/// and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub matched: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Dispatcher {
    pub fn new(pool: SqlitePool, chat: Arc<dyn ChatSender>, mailer: Arc<dyn Mailer>) -> Self {
        Self { pool, chat, mailer }
    }

    #[instrument(skip_all)]
    pub async fn dispatch(&self, event: &str, payload: &Map<String, Value>) -> Result<DispatchSummary> {
        let rows = db::active_subscriptions(&self.pool).await?;
        let mut summary = DispatchSummary::default();

        let mut targets = Vec::new();
        for row in rows {
            let id = row.id;
            match Subscription::decode(row) {
                Ok(sub) if sub.matches(event) => targets.push(sub),
                Ok(_) => {}
                Err(err) => {
                    warn!(?err, subscription = id, "skipping malformed subscription");
                    summary.failed += 1;
                }
            }
        }
        summary.matched = targets.len();

        if targets.is_empty() {
            info!(event, "no matching subscriptions");
            return Ok(summary);
        }

        let text = render_event_message(event, payload);
        let sends = targets.iter().map(|sub| self.deliver(sub, event, &text));
        for (sub, outcome) in targets.iter().zip(join_all(sends).await) {
            match outcome {
                Ok(Delivery::Sent) => summary.sent += 1,
                Ok(Delivery::Skipped) => summary.skipped += 1,
                Err(err) => {
                    warn!(?err, subscription = sub.id, "channel delivery failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            event,
            matched = summary.matched,
            sent = summary.sent,
            skipped = summary.skipped,
            failed = summary.failed,
            "dispatch finished"
        );
        Ok(summary)
    }

    /// Submit a dispatch to the background. The spawned task owns the error
    /// handling; callers return to their client immediately.
    pub fn dispatch_background(self: &Arc<Self>, event: String, payload: Map<String, Value>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = dispatcher.dispatch(&event, &payload).await {
                error!(?err, event = %event, "background dispatch failed");
            }
        });
    }

    async fn deliver(&self, sub: &Subscription, event: &str, text: &str) -> Result<Delivery> {
        match &sub.channel {
            ChannelConfig::Chat { chat_id } => self.chat.send_message(*chat_id, text).await,
            ChannelConfig::Email { address } => {
                self.mailer.send(address, &event_subject(event), text).await
            }
        }
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z0-9_]+)\}").expect("valid placeholder regex"));

fn template_for(event: &str) -> Option<&'static str> {
    match event {
        "new_lead_detected" => Some(
            "New lead: {name} ({company})\nEmail: {email}\nPhone: {phone}",
        ),
        "invoice_processed" => Some("Invoice {invoice_number} for {customer}: {amount}"),
        _ => None,
    }
}

/// Render a human-readable message for an event. Known events use a named
/// template with `{key}` placeholders; anything else falls back to listing
/// the payload fields.
pub fn render_event_message(event: &str, payload: &Map<String, Value>) -> String {
    match template_for(event) {
        Some(template) => PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures<'_>| {
                payload
                    .get(&caps[1])
                    .map(value_to_text)
                    .unwrap_or_else(|| "-".to_string())
            })
            .into_owned(),
        None => {
            let mut lines = vec![format!("Event: {event}")];
            for (key, value) in payload {
                lines.push(format!("{}: {}", key, value_to_text(value)));
            }
            lines.join("\n")
        }
    }
}

/// Subject line for email deliveries, e.g. "Campus update: new lead detected".
pub fn event_subject(event: &str) -> String {
    format!("Campus update: {}", event.replace('_', " "))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_known_event_template() {
        let payload = payload(&[
            ("name", json!("Dana Scully")),
            ("company", json!("FBI")),
            ("email", json!("dana@fbi.example")),
            ("phone", json!("555-0100")),
        ]);
        let text = render_event_message("new_lead_detected", &payload);
        assert_eq!(
            text,
            "New lead: Dana Scully (FBI)\nEmail: dana@fbi.example\nPhone: 555-0100"
        );
    }

    #[test]
    fn missing_placeholder_becomes_dash() {
        let payload = payload(&[("name", json!("Dana"))]);
        let text = render_event_message("new_lead_detected", &payload);
        assert!(text.contains("Dana (-)"));
        assert!(text.contains("Email: -"));
    }

    #[test]
    fn unknown_event_lists_payload() {
        let payload = payload(&[("course", json!("RUST-101")), ("seats", json!(3))]);
        let text = render_event_message("course_almost_full", &payload);
        assert!(text.starts_with("Event: course_almost_full"));
        assert!(text.contains("course: RUST-101"));
        assert!(text.contains("seats: 3"));
    }

    #[test]
    fn subject_humanizes_event_name() {
        assert_eq!(
            event_subject("new_lead_detected"),
            "Campus update: new lead detected"
        );
    }
}
