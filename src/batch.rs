use anyhow::{anyhow, bail, Result};
use serde_json::{json, Map};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::bot::ChatSender;
use crate::db;
use crate::dispatch::Dispatcher;
use crate::mailer::Mailer;
use crate::model::{BatchRunResult, Delivery, DigestStats, DueInvoice, JobKind, StaffMember};

/// Everything one batch run needs, constructed once at startup and shared.
pub struct BatchDeps {
    pub pool: SqlitePool,
    pub dispatcher: Arc<Dispatcher>,
    pub chat: Arc<dyn ChatSender>,
    pub mailer: Arc<dyn Mailer>,
    pub page_size: i64,
    pub digest_department: String,
}

/// Run one batch to completion. A failing item is recorded and skipped over;
/// only the candidate fetch itself can fail the whole run.
#[instrument(skip_all, fields(job = job.as_str()))]
pub async fn run_batch(deps: &BatchDeps, job: JobKind) -> Result<BatchRunResult> {
    let result = match job {
        JobKind::AutoInvoice => run_auto_invoice(deps).await?,
        JobKind::DailyDigest => run_daily_digest(deps).await?,
    };
    info!(
        total = result.total_items,
        succeeded = result.succeeded_count,
        failed = result.error_count(),
        "batch run finished"
    );
    Ok(result)
}

async fn run_auto_invoice(deps: &BatchDeps) -> Result<BatchRunResult> {
    let due = db::due_invoices(&deps.pool, deps.page_size).await?;
    let mut result = BatchRunResult::with_total(due.len());

    for invoice in due {
        // The pending→processing transition is the only lock: losing it
        // means an overlapping run owns the row.
        if !db::claim_invoice(&deps.pool, invoice.id).await? {
            info!(invoice = invoice.id, "invoice already claimed; skipping");
            continue;
        }
        match process_invoice(deps, &invoice).await {
            Ok(number) => {
                info!(invoice = invoice.id, number = %number, "invoice processed");
                result.succeeded_count += 1;
            }
            Err(err) => {
                warn!(?err, invoice = invoice.id, "invoice processing failed");
                db::record_invoice_error(&deps.pool, invoice.id, &err.to_string()).await?;
                result.push_error(format!("{}: {}", invoice.customer, err));
            }
        }
    }
    Ok(result)
}

async fn process_invoice(deps: &BatchDeps, invoice: &DueInvoice) -> Result<String> {
    if invoice.amount_cents <= 0 {
        bail!("non-positive amount {}", invoice.amount_cents);
    }
    let number = next_invoice_number();
    db::mark_invoice_processed(&deps.pool, invoice.id, &number).await?;

    // The invoice is committed at this point; a notification hiccup must not
    // resurrect the row (channel failures are soft by contract anyway).
    let mut payload = Map::new();
    payload.insert("customer".into(), json!(invoice.customer));
    payload.insert("invoice_number".into(), json!(number));
    payload.insert("amount".into(), json!(format_amount(invoice.amount_cents)));
    if let Some(email) = &invoice.customer_email {
        payload.insert("customer_email".into(), json!(email));
    }
    if let Err(err) = deps.dispatcher.dispatch("invoice_processed", &payload).await {
        warn!(?err, invoice = invoice.id, "invoice notification dispatch failed");
    }

    Ok(number)
}

async fn run_daily_digest(deps: &BatchDeps) -> Result<BatchRunResult> {
    let staff = db::active_staff(&deps.pool, &deps.digest_department, deps.page_size).await?;
    let mut result = BatchRunResult::with_total(staff.len());

    for member in staff {
        match send_digest(deps, &member).await {
            Ok(Delivery::Sent) => result.succeeded_count += 1,
            Ok(Delivery::Skipped) => {
                info!(staff = %member.name, "digest skipped (channel unconfigured)");
                result.succeeded_count += 1;
            }
            Err(err) => {
                warn!(?err, staff = %member.name, "digest delivery failed");
                result.push_error(format!("{}: {}", member.name, err));
            }
        }
    }
    Ok(result)
}

async fn send_digest(deps: &BatchDeps, member: &StaffMember) -> Result<Delivery> {
    let stats = db::digest_stats(&deps.pool, member.id).await?;
    let text = render_digest(member, &stats);

    if let Some(chat_id) = member.chat_id {
        return deps.chat.send_message(chat_id, &text).await;
    }
    if let Some(email) = &member.email {
        return deps.mailer.send(email, "Your daily summary", &text).await;
    }
    Err(anyhow!("no chat id or email configured"))
}

fn render_digest(member: &StaffMember, stats: &DigestStats) -> String {
    format!(
        "Good morning {}!\nLeads assigned to you in the last 24h: {}\nUnassigned leads waiting: {}",
        member.name, stats.assigned_last_day, stats.unassigned
    )
}

fn next_invoice_number() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("INV-{}", id[..8].to_uppercase())
}

fn format_amount(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}
