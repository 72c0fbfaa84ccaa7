use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use campus_ops::batch::{self, BatchDeps};
use campus_ops::bot::{BotClient, ChatSender};
use campus_ops::dispatch::Dispatcher;
use campus_ops::model::JobKind;
use campus_ops::{config, db, mailer};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run one automation batch to completion and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Job to run: "invoices" or "daily-digest"
    job: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let job: JobKind = args.job.parse()?;
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/campus_ops.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let chat: Arc<dyn ChatSender> = Arc::new(BotClient::new(cfg.bot_token()));
    let mailer = mailer::from_config(cfg.email.as_ref())?;
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), chat.clone(), mailer.clone()));
    let deps = BatchDeps {
        pool,
        dispatcher,
        chat,
        mailer,
        page_size: i64::from(cfg.app.batch_page_size),
        digest_department: cfg.digest.department.clone(),
    };

    let result = batch::run_batch(&deps, job).await?;
    if let Some(errors) = &result.errors {
        for error in errors {
            warn!(%error, "item failed");
        }
    }
    info!(
        total = result.total_items,
        succeeded = result.succeeded_count,
        "run complete"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
