use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use campus_ops::batch::BatchDeps;
use campus_ops::bot::{BotClient, ChatSender};
use campus_ops::dispatch::Dispatcher;
use campus_ops::server::{self, AppState};
use campus_ops::{config, db, mailer};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/campus_ops.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let token = cfg.bot_token();
    if token.is_none() {
        warn!("telegram.bot_token is empty; chat notifications disabled");
    }
    let chat: Arc<dyn ChatSender> = Arc::new(BotClient::new(token));
    let mailer = mailer::from_config(cfg.email.as_ref())?;

    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), chat.clone(), mailer.clone()));
    let deps = Arc::new(BatchDeps {
        pool,
        dispatcher: dispatcher.clone(),
        chat,
        mailer,
        page_size: i64::from(cfg.app.batch_page_size),
        digest_department: cfg.digest.department.clone(),
    });

    let state = AppState {
        deps,
        dispatcher,
        secret: cfg.scheduler.secret.clone(),
    };
    let app = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr).await?;
    info!("campus-ops listening on http://{}", cfg.app.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
