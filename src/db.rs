use crate::model::{DigestStats, DueInvoice, InvoiceStatus, StaffMember, SubscriptionRow};
use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// --- invoices ---

/// Pending invoices, oldest first, capped so one run stays inside the
/// scheduler's time budget. Terminal rows never reappear here.
#[instrument(skip_all)]
pub async fn due_invoices(pool: &Pool, limit: i64) -> Result<Vec<DueInvoice>> {
    let rows = sqlx::query_as::<_, DueInvoice>(
        "SELECT id, customer, customer_email, amount_cents FROM invoices \
         WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT ?",
    )
    .bind(InvoiceStatus::Pending.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Conditionally transition an invoice from `pending` to `processing`.
/// Returns false when another run already claimed the row; that row belongs
/// to the other run and must be left alone.
#[instrument(skip_all)]
pub async fn claim_invoice(pool: &Pool, id: i64) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE invoices SET status = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = ?",
    )
    .bind(InvoiceStatus::Processing.as_str())
    .bind(id)
    .bind(InvoiceStatus::Pending.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

#[instrument(skip_all)]
pub async fn mark_invoice_processed(pool: &Pool, id: i64, invoice_number: &str) -> Result<()> {
    sqlx::query(
        "UPDATE invoices SET status = ?, invoice_number = ?, last_error = NULL, \
         processed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(InvoiceStatus::Processed.as_str())
    .bind(invoice_number)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Return a failed invoice to `pending` with the error annotated, so the
/// next scheduled tick picks it up again.
#[instrument(skip_all)]
pub async fn record_invoice_error(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE invoices SET status = ?, attempts = attempts + 1, last_error = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(InvoiceStatus::Pending.as_str())
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_invoice(
    pool: &Pool,
    customer: &str,
    customer_email: Option<&str>,
    amount_cents: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO invoices (customer, customer_email, amount_cents) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(customer)
    .bind(customer_email)
    .bind(amount_cents)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

// --- staff & leads ---

#[instrument(skip_all)]
pub async fn active_staff(pool: &Pool, department: &str, limit: i64) -> Result<Vec<StaffMember>> {
    let rows = sqlx::query_as::<_, StaffMember>(
        "SELECT id, name, chat_id, email FROM staff \
         WHERE department = ? AND is_active = 1 ORDER BY id ASC LIMIT ?",
    )
    .bind(department)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn digest_stats(pool: &Pool, staff_id: i64) -> Result<DigestStats> {
    let assigned_last_day: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM leads WHERE assigned_to = ? \
         AND datetime(created_at) >= datetime('now', '-1 day')",
    )
    .bind(staff_id)
    .fetch_one(pool)
    .await?;
    let unassigned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE assigned_to IS NULL")
        .fetch_one(pool)
        .await?;
    Ok(DigestStats {
        assigned_last_day,
        unassigned,
    })
}

#[instrument(skip_all)]
pub async fn insert_staff(
    pool: &Pool,
    name: &str,
    department: &str,
    chat_id: Option<i64>,
    email: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO staff (name, department, chat_id, email) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(department)
    .bind(chat_id)
    .bind(email)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn insert_lead(
    pool: &Pool,
    name: &str,
    email: Option<&str>,
    phone: Option<&str>,
    company: Option<&str>,
    assigned_to: Option<i64>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO leads (name, email, phone, company, assigned_to) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(email)
    .bind(phone)
    .bind(company)
    .bind(assigned_to)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

// --- subscriptions ---

/// All active subscription rows. Event filtering and channel decoding happen
/// in the dispatcher so one malformed row cannot poison the whole fetch.
#[instrument(skip_all)]
pub async fn active_subscriptions(pool: &Pool) -> Result<Vec<SubscriptionRow>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT id, events, channel, chat_id, email FROM subscriptions \
         WHERE is_active = 1 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn insert_subscription(
    pool: &Pool,
    events: &[&str],
    channel: &str,
    chat_id: Option<i64>,
    email: Option<&str>,
    is_active: bool,
) -> Result<i64> {
    let events_json = serde_json::to_string(events)?;
    let rec = sqlx::query(
        "INSERT INTO subscriptions (events, channel, chat_id, email, is_active) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(events_json)
    .bind(channel)
    .bind(chat_id)
    .bind(email)
    .bind(is_active)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}
