use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TelegramBotConfig {
    pub token: String,
    pub polling_timeout_seconds: u64,
    pub allowed_chat_ids: Option<Vec<i64>>,
}

/// Everything the transport needs from the controller core. Each method
/// returns the reply text to send back; the bot itself holds no registry or
/// dialog state.
#[async_trait]
pub trait ChatCommandHandler: Send + Sync {
    async fn show_menu(&self, user_id: &str) -> Result<String>;
    async fn fetch_status(&self, user_id: &str) -> Result<String>;
    async fn list_servers(&self, user_id: &str) -> Result<String>;
    async fn activate_server(&self, user_id: &str, name: &str) -> Result<String>;
    async fn rename_server(&self, user_id: &str, old_name: &str, new_name: &str)
        -> Result<String>;
    async fn install_instructions(&self, user_id: &str) -> Result<String>;
    async fn begin_add_server(&self, user_id: &str) -> Result<String>;
    async fn begin_delete_server(&self, user_id: &str, name: &str) -> Result<String>;
    /// Free text offered to the user's pending dialog. `None` means no dialog
    /// is waiting for input.
    async fn dialog_input(&self, user_id: &str, text: &str) -> Result<Option<String>>;
    async fn cancel_dialog(&self, user_id: &str) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct TelegramBot {
    client: Client,
    base_url: String,
    polling_timeout_seconds: u64,
    allowed_chat_ids: Option<HashSet<i64>>,
}

impl TelegramBot {
    pub fn new(config: TelegramBotConfig) -> Result<Self> {
        if config.token.trim().is_empty() {
            return Err(anyhow!("telegram token cannot be empty"));
        }
        if config.polling_timeout_seconds == 0 {
            return Err(anyhow!("polling_timeout_seconds must be greater than zero"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.polling_timeout_seconds + 20))
            .build()
            .context("failed to build telegram HTTP client")?;

        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{}", config.token),
            polling_timeout_seconds: config.polling_timeout_seconds,
            allowed_chat_ids: config
                .allowed_chat_ids
                .map(|ids| ids.into_iter().collect::<HashSet<_>>()),
        })
    }

    pub async fn run_until_shutdown(&self, handler: Arc<dyn ChatCommandHandler>) -> Result<()> {
        info!("telegram channel started");
        let mut offset: Option<i64> = None;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("telegram channel stopped");
                    break;
                }
                poll_result = self.poll_once(offset, handler.clone()) => {
                    match poll_result {
                        Ok(next_offset) => offset = Some(next_offset),
                        Err(err) => {
                            warn!("telegram poll error: {err:#}");
                            sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn poll_once(
        &self,
        current_offset: Option<i64>,
        handler: Arc<dyn ChatCommandHandler>,
    ) -> Result<i64> {
        let response = self.get_updates(current_offset).await?;
        let mut next_offset = current_offset.unwrap_or(0);

        for update in response.result {
            next_offset = next_offset.max(update.update_id + 1);

            let message = match update.message {
                Some(message) => message,
                None => continue,
            };

            let chat_id = message.chat.id;
            if !self.is_chat_allowed(chat_id) {
                continue;
            }
            let user_id = sender_user_id(&message);

            let text = match message.text {
                Some(text) if !text.trim().is_empty() => text,
                _ => continue,
            };

            // Each message is its own unit of work: one user's slow agent or
            // failure must not stall the poll loop or anyone else's updates.
            let bot = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(err) = bot.handle_message(chat_id, &user_id, &text, handler).await {
                    warn!(user_id, "failed to process telegram message: {err:#}");
                    let _ = bot
                        .send_message(chat_id, "Request failed. Check controller logs for details.")
                        .await;
                }
            });
        }

        Ok(next_offset)
    }

    async fn handle_message(
        &self,
        chat_id: i64,
        user_id: &str,
        text: &str,
        handler: Arc<dyn ChatCommandHandler>,
    ) -> Result<()> {
        let response = dispatch(handler.as_ref(), user_id, text).await?;
        self.send_message(chat_id, &truncate_for_telegram(&response))
            .await?;
        Ok(())
    }

    fn is_chat_allowed(&self, chat_id: i64) -> bool {
        match &self.allowed_chat_ids {
            Some(set) => set.contains(&chat_id),
            None => true,
        }
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<GetUpdatesResponse> {
        let mut request = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[("timeout", self.polling_timeout_seconds.to_string())]);

        if let Some(offset) = offset {
            request = request.query(&[("offset", offset.to_string())]);
        }

        let response = request.send().await.context("telegram getUpdates failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(anyhow!("telegram getUpdates error ({status}): {body}"));
        }

        let payload = response
            .json::<GetUpdatesResponse>()
            .await
            .context("invalid telegram getUpdates payload")?;

        if !payload.ok {
            return Err(anyhow!("telegram getUpdates returned ok=false"));
        }

        Ok(payload)
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&SendMessageRequest { chat_id, text })
            .send()
            .await
            .context("telegram sendMessage failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(anyhow!("telegram sendMessage error ({status}): {body}"));
        }

        Ok(())
    }
}

/// Registries are keyed by the sending user, not the chat, so a user keeps
/// their servers across chats. Falls back to the chat id for channels that
/// carry no sender.
fn sender_user_id(message: &TelegramMessage) -> String {
    message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| message.chat.id.to_string())
}

async fn dispatch(
    handler: &dyn ChatCommandHandler,
    user_id: &str,
    text: &str,
) -> Result<String> {
    let trimmed = text.trim();
    let mut parts = trimmed.splitn(2, ' ');
    let raw_cmd = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();
    let cmd = raw_cmd.split('@').next().unwrap_or(raw_cmd);

    match cmd {
        "/start" => handler.show_menu(user_id).await,
        "/help" => Ok(help_text()),
        "/status" => handler.fetch_status(user_id).await,
        "/servers" => handler.list_servers(user_id).await,
        "/use" => {
            if args.is_empty() {
                Ok("Usage: /use <name>".to_string())
            } else {
                handler.activate_server(user_id, args).await
            }
        }
        "/rename" => match split_two(args) {
            Some((old_name, new_name)) => {
                handler.rename_server(user_id, old_name, new_name).await
            }
            None => Ok("Usage: /rename <old-name> <new-name>".to_string()),
        },
        "/add" => handler.begin_add_server(user_id).await,
        "/delete" => {
            if args.is_empty() {
                Ok("Usage: /delete <name>".to_string())
            } else {
                handler.begin_delete_server(user_id, args).await
            }
        }
        "/install" => handler.install_instructions(user_id).await,
        "/cancel" => handler.cancel_dialog(user_id).await,
        _ if cmd.starts_with('/') => {
            Ok("Unknown command. Send /help for supported commands.".to_string())
        }
        _ => match handler.dialog_input(user_id, trimmed).await? {
            Some(reply) => Ok(reply),
            None => Ok("Nothing is waiting for input here. Send /help for commands.".to_string()),
        },
    }
}

fn split_two(args: &str) -> Option<(&str, &str)> {
    let mut parts = args.split_whitespace();
    let first = parts.next()?;
    let second = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((first, second))
}

fn truncate_for_telegram(input: &str) -> String {
    const MAX_CHARS: usize = 3500;
    let count = input.chars().count();
    if count <= MAX_CHARS {
        return input.to_string();
    }

    let mut trimmed = input.chars().take(MAX_CHARS).collect::<String>();
    trimmed.push_str("\n\n[truncated]");
    trimmed
}

fn help_text() -> String {
    [
        "vigil commands:",
        "/status - metrics for the active server",
        "/servers - list registered servers",
        "/use <name> - make a server active",
        "/add - register a new server",
        "/rename <old-name> <new-name>",
        "/delete <name> - remove a server",
        "/install - agent install instructions for the active server",
        "/cancel - abandon the current dialog",
        "During /add, plain messages answer the current question.",
    ]
    .join("\n")
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}
