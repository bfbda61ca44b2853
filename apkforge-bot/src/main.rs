//! apkforge-bot: builds Android release packages on demand from a chat.
//!
//!   /list                        Recent batches with Confirm/Download buttons
//!   /confirm <batchId> [project] Allocate a build number and build
//!   /download <batchId>          Send a finished build
//!
//! Operator subcommands provision templates and register batches against the
//! same database.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use apkforge_bot::app::{App, LiveCoordinator};
use apkforge_bot::config::{BatchCommand, Cli, Command, ServeArgs, TemplateCommand};
use apkforge_bot::telegram::TelegramClient;
use apkforge_core::gcp::{AccessTokens, CloudBuildClient, GcsArtifactStore};
use apkforge_core::{NewBatch, Store, Template};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Some(parent) = cli.db.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store = Arc::new(
        Store::open(&cli.db).with_context(|| format!("opening {}", cli.db.display()))?,
    );

    match cli.command {
        None | Some(Command::Serve) => serve(store, cli.serve).await,
        Some(Command::Template(TemplateCommand::Put { project, index, file })) => {
            let data_text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            store.put_template(&Template {
                project: project.clone(),
                index,
                data_text,
            })?;
            tracing::info!(project = %project, index, "Template stored");
            Ok(())
        }
        Some(Command::Template(TemplateCommand::List { project })) => {
            for t in store.templates_for(&project)? {
                println!("{}#{}\t{} bytes", t.project, t.index, t.data_text.len());
            }
            Ok(())
        }
        Some(Command::Batch(BatchCommand::Create { name, project, id })) => {
            let batch = store.create_batch(&NewBatch::available(id, &name, project)?)?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(())
        }
        Some(Command::Batch(BatchCommand::Show { id })) => {
            let batch = store
                .get_batch(&id)?
                .with_context(|| format!("batch {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "apkforge_bot=info,apkforge_core=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(store: Arc<Store>, args: ServeArgs) -> Result<()> {
    let config = args.into_config()?;
    let http = reqwest::Client::new();
    let tokens = Arc::new(match &config.access_token {
        Some(token) => AccessTokens::fixed(token.clone()),
        None => AccessTokens::metadata(http.clone()),
    });

    let builds = Arc::new(
        CloudBuildClient::new(http.clone(), tokens.clone(), &config.gcp_project)
            .with_poll_interval(config.build_poll),
    );
    let artifacts = Arc::new(GcsArtifactStore::new(http, tokens, &config.build.bucket));

    tracing::info!(
        project = %config.gcp_project,
        bucket = %config.build.bucket,
        repo = config.build.repo_url.as_deref().unwrap_or("<unset>"),
        "Starting apkforge-bot"
    );

    let coordinator: Arc<LiveCoordinator> =
        Arc::new(apkforge_core::Coordinator::new(store, config.build, builds, artifacts));
    let telegram = Arc::new(TelegramClient::new(&config.telegram_token));
    let me = telegram.get_me().await.context("Telegram getMe failed")?;
    tracing::info!(bot = me.username.as_deref().unwrap_or("?"), "Connected to Telegram");
    let mut app = App::new(coordinator, telegram, config.list_limit, config.poll_timeout);
    if let Some(username) = me.username {
        app = app.with_username(username);
    }

    tokio::select! {
        result = app.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
