use crate::traits::Transport;
use crate::types::{ConversationId, Destination, GroupId, InboundEvent, MessageId, SenderId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

/// Telegram Bot API transport: long-polls getUpdates and exposes the narrow
/// forward/send/resolve surface the core needs.
pub struct TelegramTransport {
    http: reqwest::Client,
    bot_token: String,
    self_id: OnceLock<i64>,
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            self_id: OnceLock::new(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = self.api_url(method)?;
        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={text}"
            ));
        }
        let envelope: TelegramEnvelope<T> = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("telegram {method} parse failed: {e}"))?;
        if !envelope.ok {
            return Err(anyhow::anyhow!(
                "telegram {method} rejected: {}",
                envelope.description.unwrap_or_default()
            ));
        }
        envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned ok without a result"))
    }

    async fn fetch_self_id(&self) -> Result<i64> {
        if let Some(id) = self.self_id.get() {
            return Ok(*id);
        }
        let me: TelegramUser = self.call("getMe", serde_json::json!({})).await?;
        let _ = self.self_id.set(me.id);
        Ok(me.id)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let self_id = self.fetch_self_id().await?;
        tracing::info!(self_id, "telegram transport identified itself");

        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(event) = build_inbound_event(&update, self_id) {
                    tx.send(event)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        self.run_poll_loop(tx).await
    }

    async fn resolve(&self, reference: &str) -> Result<Destination> {
        let chat: TelegramChat = self
            .call("getChat", serde_json::json!({ "chat_id": chat_id_value(reference) }))
            .await?;
        Ok(Destination {
            id: chat.id.to_string(),
            display_name: chat.display_name(),
        })
    }

    async fn forward(
        &self,
        message_ids: &[MessageId],
        from: &ConversationId,
        to: &Destination,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let ids = message_ids
            .iter()
            .map(|id| {
                id.as_str()
                    .parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("non-numeric telegram message id: {id}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let _: serde_json::Value = self
            .call(
                "forwardMessages",
                serde_json::json!({
                    "chat_id": chat_id_value(&to.id),
                    "from_chat_id": chat_id_value(from.as_str()),
                    "message_ids": ids,
                }),
            )
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        conversation: &ConversationId,
        text: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id_value(conversation.as_str()),
            "text": text,
        });
        if let Some(reply_to) = reply_to {
            let id = reply_to
                .as_str()
                .parse::<i64>()
                .map_err(|_| anyhow::anyhow!("non-numeric telegram message id: {reply_to}"))?;
            body["reply_to_message_id"] = serde_json::json!(id);
        }
        let _: TelegramMessage = self.call("sendMessage", body).await?;
        Ok(())
    }

    async fn set_composing(&self, conversation: &ConversationId, active: bool) -> Result<()> {
        if !active {
            // The Bot API has no explicit "stop typing"; the indicator decays.
            return Ok(());
        }
        let _: serde_json::Value = self
            .call(
                "sendChatAction",
                serde_json::json!({
                    "chat_id": chat_id_value(conversation.as_str()),
                    "action": "typing",
                }),
            )
            .await?;
        Ok(())
    }

    fn supports_composing(&self) -> bool {
        true
    }
}

/// Numeric chat references go over the wire as integers, usernames as strings.
fn chat_id_value(reference: &str) -> serde_json::Value {
    match reference.parse::<i64>() {
        Ok(id) => serde_json::json!(id),
        Err(_) => serde_json::json!(reference),
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_inbound_event(update: &TelegramUpdate, self_id: i64) -> Option<InboundEvent> {
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;

    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let sender_name = message
        .from
        .as_ref()
        .map(TelegramUser::display_name)
        .unwrap_or_else(|| chat.display_name());
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{}", update.update_id));

    let text = message
        .text
        .as_deref()
        .or(message.caption.as_deref())
        .unwrap_or_default()
        .trim()
        .to_string();

    let reply_to_id = message
        .reply_to_message
        .as_ref()
        .and_then(|r| r.message_id)
        .map(|id| MessageId::from(id.to_string()));
    let reply_to_self = message
        .reply_to_message
        .as_ref()
        .and_then(|r| r.from.as_ref())
        .is_some_and(|user| user.id == self_id);

    Some(InboundEvent {
        conversation_id: ConversationId::from(chat.id.to_string()),
        sender_id: SenderId::from(sender_id),
        sender_name,
        message_id: MessageId::from(message_id),
        text,
        group_id: message
            .media_group_id
            .as_deref()
            .map(|g| GroupId::from(g.to_string())),
        reply_to_id,
        reply_to_self,
        is_private: chat.r#type == "private",
        received_at: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    // No serde(default) here: that would put a `T: Default` bound on the
    // derive, and an absent field already deserializes to None.
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    media_group_id: Option<String>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        let mut name = self.first_name.clone().unwrap_or_default();
        if let Some(last) = self.last_name.as_deref() {
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(last);
        }
        if name.is_empty() {
            name = self
                .username
                .clone()
                .unwrap_or_else(|| self.id.to_string());
        }
        name
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type", default)]
    r#type: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

impl TelegramChat {
    fn display_name(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.username.clone())
            .or_else(|| self.first_name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}
