//! Concrete webhook-backed alert channels.
//!
//! All channels are fire-and-forget HTTP POSTs with a shared bounded timeout.
//! Configuration comes from the environment so deployments can enable any
//! subset without a config file change.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{summary_text, AlertPayload, AlertSink};

const WEBHOOK_TIMEOUT_MS: u64 = 10_000;

fn webhook_client() -> Client {
    Client::builder()
        .timeout(Duration::from_millis(WEBHOOK_TIMEOUT_MS))
        .build()
        .unwrap_or_default()
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Build every channel the environment configures:
/// `DISCORD_WEBHOOK_URL`, `SLACK_WEBHOOK_URL`,
/// `TELEGRAM_BOT_TOKEN` + `TELEGRAM_CHAT_ID`, and `ALERT_WEBHOOK_URL`.
pub fn channels_from_env() -> Vec<Arc<dyn AlertSink>> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
    if let Some(url) = env_nonempty("DISCORD_WEBHOOK_URL") {
        sinks.push(Arc::new(DiscordWebhook::new(url)));
    }
    if let Some(url) = env_nonempty("SLACK_WEBHOOK_URL") {
        sinks.push(Arc::new(SlackWebhook::new(url)));
    }
    if let (Some(token), Some(chat_id)) =
        (env_nonempty("TELEGRAM_BOT_TOKEN"), env_nonempty("TELEGRAM_CHAT_ID"))
    {
        sinks.push(Arc::new(TelegramChannel::new(token, chat_id)));
    }
    if let Some(url) = env_nonempty("ALERT_WEBHOOK_URL") {
        sinks.push(Arc::new(GenericWebhook::new(url)));
    }
    info!(
        "[ALERT] {} channel(s) configured: {}",
        sinks.len(),
        sinks
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    sinks
}

async fn post_json(client: &Client, url: &str, body: &serde_json::Value) -> anyhow::Result<()> {
    let resp = client.post(url).json(body).send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("webhook returned {status}");
    }
    Ok(())
}

pub struct DiscordWebhook {
    webhook_url: String,
    client: Client,
}

impl DiscordWebhook {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl AlertSink for DiscordWebhook {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, alert: &AlertPayload) -> anyhow::Result<()> {
        let mut fields = vec![
            json!({ "name": "Chain", "value": alert.chain_name, "inline": true }),
            json!({ "name": "Stage", "value": alert.stage, "inline": true }),
            json!({
                "name": "Confidence",
                "value": format!("{:.0}%", alert.confidence * 100.0),
                "inline": true
            }),
        ];
        if let Some(ts) = alert.activation_ts.or(alert.target_ts) {
            fields.push(json!({ "name": "Activation", "value": format!("<t:{ts}:F>"), "inline": false }));
        }
        if !alert.links.is_empty() {
            fields.push(json!({ "name": "Links", "value": alert.links.join("\n"), "inline": false }));
        }
        let body = json!({
            "embeds": [{
                "title": format!("Upgrade: {}", alert.fork_name),
                "fields": fields,
            }]
        });
        post_json(&self.client, &self.webhook_url, &body).await
    }
}

pub struct SlackWebhook {
    webhook_url: String,
    client: Client,
}

impl SlackWebhook {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl AlertSink for SlackWebhook {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &AlertPayload) -> anyhow::Result<()> {
        let body = json!({ "text": summary_text(alert) });
        post_json(&self.client, &self.webhook_url, &body).await
    }
}

pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    client: Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl AlertSink for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, alert: &AlertPayload) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": summary_text(alert),
            "parse_mode": "Markdown",
        });
        post_json(&self.client, &url, &body).await
    }
}

/// Posts the full alert payload as JSON to an arbitrary endpoint, for
/// downstream automation rather than humans.
pub struct GenericWebhook {
    url: String,
    client: Client,
}

impl GenericWebhook {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl AlertSink for GenericWebhook {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &AlertPayload) -> anyhow::Result<()> {
        let body = serde_json::to_value(alert)?;
        post_json(&self.client, &self.url, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn sample_alert() -> AlertPayload {
        AlertPayload {
            chain_id: "eth-mainnet".into(),
            chain_name: "Ethereum".into(),
            fork_name: "Fusaka".into(),
            stage: "scheduled".into(),
            ts: 1_700_000_000,
            activation_epoch: Some(350_000),
            activation_ts: Some(1_700_100_000),
            target_ts: Some(1_700_100_000),
            window_low_ts: None,
            window_high_ts: None,
            confidence: 0.9,
            links: vec!["https://blog.ethereum.org".into()],
            details: serde_json::json!({ "source": "EIP meta thread" }),
        }
    }

    #[test]
    fn test_summary_text_names_fork_stage_and_activation() {
        let text = summary_text(&sample_alert());
        assert!(text.contains("Fusaka"));
        assert!(text.contains("scheduled"));
        assert!(text.contains("1700100000"));
        assert!(text.contains("https://blog.ethereum.org"));
    }

    #[test]
    fn test_generic_webhook_body_is_the_full_payload() {
        let body = serde_json::to_value(sample_alert()).unwrap();
        assert_eq!(body["chain_id"], Value::from("eth-mainnet"));
        assert_eq!(body["fork_name"], Value::from("Fusaka"));
        assert_eq!(body["activation_ts"], Value::from(1_700_100_000));
        assert_eq!(body["details"]["source"], Value::from("EIP meta thread"));
    }

    #[test]
    fn test_channels_from_env_reads_each_variable() {
        std::env::remove_var("DISCORD_WEBHOOK_URL");
        std::env::remove_var("SLACK_WEBHOOK_URL");
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        std::env::remove_var("TELEGRAM_CHAT_ID");
        std::env::remove_var("ALERT_WEBHOOK_URL");
        assert!(channels_from_env().is_empty());

        std::env::set_var("DISCORD_WEBHOOK_URL", "https://discord.example/hook");
        std::env::set_var("TELEGRAM_BOT_TOKEN", "token");
        // Chat id missing: telegram stays off.
        let sinks = channels_from_env();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "discord");
        std::env::remove_var("DISCORD_WEBHOOK_URL");
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
    }
}
