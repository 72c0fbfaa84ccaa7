use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use sqlx::FromRow;
use std::str::FromStr;

/// Batch jobs the scheduler trigger can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    AutoInvoice,
    DailyDigest,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AutoInvoice => "invoices",
            JobKind::DailyDigest => "daily-digest",
        }
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "invoices" => Ok(JobKind::AutoInvoice),
            "daily-digest" => Ok(JobKind::DailyDigest),
            other => bail!("unknown job kind '{other}'"),
        }
    }
}

/// Invoice row lifecycle. `pending` rows are batch candidates; `processing`
/// marks a claimed row; `processed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Pending,
    Processing,
    Processed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Processed => "processed",
        }
    }
}

/// Outcome of a single channel send. `Skipped` marks a channel that is
/// disabled or unconfigured; it is distinct from both delivery and failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Skipped,
}

/// Aggregate summary of one batch run. `errors` stays `None` (absent from
/// the serialized payload) when every item succeeded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchRunResult {
    pub success: bool,
    pub total_items: usize,
    pub succeeded_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl BatchRunResult {
    pub fn with_total(total_items: usize) -> Self {
        Self {
            success: true,
            total_items,
            succeeded_count: 0,
            errors: None,
        }
    }

    pub fn push_error(&mut self, message: String) {
        self.errors.get_or_insert_with(Vec::new).push(message);
    }

    pub fn error_count(&self) -> usize {
        self.errors.as_ref().map_or(0, Vec::len)
    }
}

/// Pending invoice slice consumed by the auto-invoice handler.
#[derive(Debug, Clone, FromRow)]
pub struct DueInvoice {
    pub id: i64,
    pub customer: String,
    pub customer_email: Option<String>,
    pub amount_cents: i64,
}

/// Digest recipient slice.
#[derive(Debug, Clone, FromRow)]
pub struct StaffMember {
    pub id: i64,
    pub name: String,
    pub chat_id: Option<i64>,
    pub email: Option<String>,
}

/// Counts summarized into one staffer's daily digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestStats {
    pub assigned_last_day: i64,
    pub unassigned: i64,
}

/// Raw subscription row as stored; decoded into [`Subscription`] before use.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: i64,
    pub events: String,
    pub channel: String,
    pub chat_id: Option<i64>,
    pub email: Option<String>,
}

/// Channel-specific delivery configuration, one variant per channel kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelConfig {
    Chat { chat_id: i64 },
    Email { address: String },
}

/// A decoded, validated notification subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: i64,
    pub events: Vec<String>,
    pub channel: ChannelConfig,
}

impl Subscription {
    /// Decode a stored row. A row whose declared channel is missing its
    /// required field is an error, never a silently empty config.
    pub fn decode(row: SubscriptionRow) -> Result<Self> {
        let events: Vec<String> = serde_json::from_str(&row.events)
            .with_context(|| format!("subscription {}: invalid events list", row.id))?;
        let channel = match row.channel.as_str() {
            "chat" => ChannelConfig::Chat {
                chat_id: row
                    .chat_id
                    .ok_or_else(|| anyhow!("subscription {}: chat channel requires chat_id", row.id))?,
            },
            "email" => ChannelConfig::Email {
                address: row
                    .email
                    .filter(|a| !a.trim().is_empty())
                    .ok_or_else(|| anyhow!("subscription {}: email channel requires an address", row.id))?,
            },
            other => bail!("subscription {}: unknown channel kind '{}'", row.id, other),
        };
        Ok(Self {
            id: row.id,
            events,
            channel,
        })
    }

    pub fn matches(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}
