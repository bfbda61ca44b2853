//! The bot's event loop and command handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use apkforge_core::artifact::ArtifactStore;
use apkforge_core::build::BuildService;
use apkforge_core::gcp::{CloudBuildClient, GcsArtifactStore};
use apkforge_core::{ConfirmOutcome, Coordinator, Download, Progress};
use tokio::sync::mpsc;

use crate::commands::{Command, parse_callback, parse_text};
use crate::render;
use crate::telegram::{TelegramClient, Update};

pub type LiveCoordinator = Coordinator<CloudBuildClient, GcsArtifactStore>;

/// Backoff after a failed long poll.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Everything a handler needs, shared by every spawned update task.
pub struct App<S, A> {
    coordinator: Arc<Coordinator<S, A>>,
    telegram: Arc<TelegramClient>,
    list_limit: usize,
    poll_timeout: Duration,
    /// Our own username, for telling `/cmd@us` from `/cmd@someone_else`.
    username: Option<String>,
}

impl<S, A> Clone for App<S, A> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            telegram: self.telegram.clone(),
            list_limit: self.list_limit,
            poll_timeout: self.poll_timeout,
            username: self.username.clone(),
        }
    }
}

impl<S: BuildService, A: ArtifactStore> App<S, A> {
    pub fn new(
        coordinator: Arc<Coordinator<S, A>>,
        telegram: Arc<TelegramClient>,
        list_limit: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            telegram,
            list_limit,
            poll_timeout,
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Long-poll Telegram forever. Each update is handled on its own task so
    /// a build in progress never stalls other chats.
    pub async fn run(self) -> Result<()> {
        let mut offset = 0;
        tracing::info!("Polling for updates");
        loop {
            let updates = match self.telegram.get_updates(offset, self.poll_timeout).await {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!(error = %e, "getUpdates failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                let app = self.clone();
                tokio::spawn(async move { app.handle_update(update).await });
            }
        }
    }

    pub async fn handle_update(&self, update: Update) {
        if let Some(query) = update.callback_query {
            if let Err(e) = self.telegram.answer_callback(&query.id).await {
                tracing::debug!(error = %e, "answerCallbackQuery failed");
            }
            let Some(chat_id) = query.message.as_ref().map(|m| m.chat.id) else {
                return;
            };
            let Some(cmd) = query.data.as_deref().and_then(parse_callback) else {
                tracing::debug!(data = ?query.data, "Ignoring unknown callback");
                return;
            };
            self.dispatch(chat_id, cmd).await;
        } else if let Some(message) = update.message {
            let username = self.username.as_deref();
            let Some(cmd) = message.text.as_deref().and_then(|t| parse_text(t, username)) else {
                return;
            };
            let user = message.from.as_ref().and_then(|u| u.username.as_deref());
            tracing::info!(chat_id = message.chat.id, user, command = ?cmd, "Command");
            self.dispatch(message.chat.id, cmd).await;
        }
    }

    async fn dispatch(&self, chat_id: i64, cmd: Command) {
        let result = match cmd {
            Command::Help => self.telegram.send_message(chat_id, render::HELP, None).await,
            Command::Usage(usage) => self.telegram.send_message(chat_id, usage, None).await,
            Command::List => self.list(chat_id).await,
            Command::Confirm { batch_id, project } => {
                self.confirm(chat_id, &batch_id, project.as_deref()).await
            }
            Command::Download { batch_id } => self.download(chat_id, &batch_id).await,
        };
        if let Err(e) = result {
            tracing::warn!(chat_id, error = %e, "Reply failed");
        }
    }

    async fn list(&self, chat_id: i64) -> Result<()> {
        match self.coordinator.list(self.list_limit) {
            Ok(batches) => {
                let (text, keyboard) = render::batch_list(&batches);
                self.telegram.send_message(chat_id, &text, Some(&keyboard)).await
            }
            Err(e) => {
                tracing::error!(error = %e, "Listing batches failed");
                self.telegram
                    .send_message(chat_id, &render::workflow_error(&e), None)
                    .await
            }
        }
    }

    async fn confirm(&self, chat_id: i64, batch_id: &str, project: Option<&str>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let build = self
            .coordinator
            .confirm_with_progress(batch_id, project, move |progress| {
                let _ = tx.send(progress);
            });
        // Progress replies go out while the build is still running; the
        // channel closes when the confirm future drops its sender.
        let relay = async {
            while let Some(Progress::Building(report)) = rx.recv().await {
                let text = render::build_started(&report);
                if let Err(e) = self.telegram.send_message(chat_id, &text, None).await {
                    tracing::warn!(chat_id, error = %e, "Progress reply failed");
                }
            }
        };
        let (outcome, ()) = tokio::join!(build, relay);

        match outcome {
            Ok(ConfirmOutcome::Delivered { report, artifact }) => {
                self.telegram
                    .send_document(chat_id, &report.filename, artifact, &render::build_caption(&report))
                    .await
            }
            Ok(ConfirmOutcome::Undelivered { report, reason }) => {
                self.telegram
                    .send_message(chat_id, &render::undelivered(&report, &reason), None)
                    .await
            }
            Err(e) => {
                self.telegram
                    .send_message(chat_id, &render::workflow_error(&e), None)
                    .await
            }
        }
    }

    async fn download(&self, chat_id: i64, batch_id: &str) -> Result<()> {
        match self.coordinator.download(batch_id).await {
            Ok(Download { batch, artifact }) => {
                self.telegram
                    .send_document(
                        chat_id,
                        &batch.delivery_filename(),
                        artifact,
                        &render::download_caption(&batch),
                    )
                    .await
            }
            Err(e) => {
                self.telegram
                    .send_message(chat_id, &render::workflow_error(&e), None)
                    .await
            }
        }
    }
}
