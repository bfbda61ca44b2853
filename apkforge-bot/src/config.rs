//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use apkforge_core::build::BuildConfig;
use clap::{Args, Parser, Subcommand};

/// Template indexes are stored as SQLite integers.
const MAX_TEMPLATE_INDEX: u64 = i64::MAX as u64;

#[derive(Debug, Parser)]
#[command(name = "apkforge-bot", about = "Telegram bot that builds Android release packages on Cloud Build")]
pub struct Cli {
    /// SQLite database holding batches, counters and templates
    #[arg(long, env = "APKFORGE_DB", default_value = "apkforge.db", global = true)]
    pub db: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,

    // Global, so they parse before or after `serve`.
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bot (the default)
    Serve,
    /// Manage configuration templates
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Inspect or create batches
    #[command(subcommand)]
    Batch(BatchCommand),
}

#[derive(Debug, Subcommand)]
pub enum TemplateCommand {
    /// Store a template for a project at the given index, replacing any existing one
    Put {
        #[arg(long)]
        project: String,
        #[arg(long, value_parser = clap::value_parser!(u64).range(..=MAX_TEMPLATE_INDEX))]
        index: u64,
        /// File whose contents become the template
        #[arg(long)]
        file: PathBuf,
    },
    /// Show a project's templates, highest index first
    List {
        #[arg(long)]
        project: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum BatchCommand {
    /// Register a new batch in status `available`
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        project: Option<String>,
        /// Batch id; generated when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Print a batch as JSON
    Show { id: String },
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Telegram bot token
    #[arg(long, global = true, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,

    /// GCP project that runs builds (falls back to GCLOUD_PROJECT)
    #[arg(long, global = true, env = "GCP_PROJECT")]
    pub gcp_project: Option<String>,

    /// Artifact bucket (defaults to `<project>.appspot.com`)
    #[arg(long, global = true, env = "GCS_BUCKET")]
    pub gcs_bucket: Option<String>,

    /// Git URL of the Android application
    #[arg(long, global = true, env = "REPO_URL")]
    pub repo_url: Option<String>,

    /// Application module inside the repository
    #[arg(long, global = true, env = "APP_DIR", default_value = "app")]
    pub app_dir: String,

    /// Fixed OAuth access token; the metadata server is used when unset
    #[arg(long, global = true, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Timeout attached to each remote build
    #[arg(long, global = true, env = "BUILD_TIMEOUT_SECS", default_value_t = 3600)]
    pub build_timeout_secs: u64,

    /// Interval between build status polls
    #[arg(long, global = true, env = "BUILD_POLL_SECS", default_value_t = 10)]
    pub build_poll_secs: u64,

    /// Batches shown by /list
    #[arg(long, global = true, env = "LIST_LIMIT", default_value_t = 10)]
    pub list_limit: usize,

    /// Telegram long-poll timeout
    #[arg(long, global = true, default_value_t = 30)]
    pub poll_timeout_secs: u64,
}

/// Resolved settings for `serve`.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub telegram_token: String,
    pub gcp_project: String,
    pub access_token: Option<String>,
    pub build: BuildConfig,
    pub build_poll: Duration,
    pub list_limit: usize,
    pub poll_timeout: Duration,
}

impl ServeArgs {
    pub fn into_config(self) -> Result<ServeConfig> {
        self.resolve(std::env::var("GCLOUD_PROJECT").ok())
    }

    fn resolve(self, gcloud_project: Option<String>) -> Result<ServeConfig> {
        let telegram_token = non_empty(self.telegram_token).context("TELEGRAM_BOT_TOKEN is not set")?;
        let gcp_project = non_empty(self.gcp_project)
            .or_else(|| non_empty(gcloud_project))
            .context("GCP_PROJECT (or GCLOUD_PROJECT) is not set")?;
        let bucket = non_empty(self.gcs_bucket).unwrap_or_else(|| format!("{gcp_project}.appspot.com"));
        if self.build_poll_secs == 0 {
            bail!("BUILD_POLL_SECS must be positive");
        }
        if self.list_limit == 0 {
            bail!("LIST_LIMIT must be positive");
        }
        let build = BuildConfig {
            repo_url: non_empty(self.repo_url),
            app_dir: self.app_dir,
            bucket,
            timeout: Duration::from_secs(self.build_timeout_secs),
            ..Default::default()
        };
        if build.repo_url.is_none() {
            tracing::warn!("REPO_URL is not set; every confirm will fail until it is configured");
        }
        Ok(ServeConfig {
            telegram_token,
            gcp_project,
            access_token: non_empty(self.access_token),
            build,
            build_poll: Duration::from_secs(self.build_poll_secs),
            list_limit: self.list_limit,
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
