use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config;
use crate::model::Delivery;

/// Outbound email delivery seam.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<Delivery>;
}

/// Real SMTP delivery via lettre.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(cfg: &config::Email) -> Result<Self> {
        let from: Mailbox = cfg.from.parse().context("invalid email.from address")?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
            .context("invalid SMTP relay host")?
            .port(cfg.smtp_port);
        if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<Delivery> {
        let to_mailbox: Mailbox = to.parse().context("invalid recipient address")?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("failed to build email")?;
        self.transport
            .send(message)
            .await
            .context("SMTP send failed")?;
        info!(%to, "email sent");
        Ok(Delivery::Sent)
    }
}

/// Stand-in used when no SMTP provider is configured: logs the send and
/// reports it as skipped rather than delivered.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<Delivery> {
        warn!(%to, %subject, "email provider not configured; skipping send");
        Ok(Delivery::Skipped)
    }
}

/// Pick the mailer matching the configuration.
pub fn from_config(email: Option<&config::Email>) -> Result<Arc<dyn Mailer>> {
    match email {
        Some(cfg) => Ok(Arc::new(SmtpMailer::from_config(cfg)?)),
        None => Ok(Arc::new(NoopMailer)),
    }
}
