//! Thin notification adapters: Discord webhook, SendGrid email, Twilio SMS.
//!
//! Everything here is best-effort. Callers (guardian alerts, ingest
//! completion, failover warnings) log a failed send and move on; a broken
//! webhook must never fail a batch or a request.
//!
//! Webhook URLs and API keys carry credentials, so none of these types
//! print their configuration in `Debug` or error messages.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(SEND_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Discord webhook sink used for operational alerts.
#[derive(Clone)]
pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    /// Build from the environment (`DISCORD_WEBHOOK_URL`). `None` when not
    /// configured; callers treat that as "alerting disabled".
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DISCORD_WEBHOOK_URL").ok()?;
        let url = url.trim().to_string();
        if url.is_empty() {
            return None;
        }
        Some(Self::new(url))
    }

    pub fn new(webhook_url: String) -> Self {
        DiscordNotifier {
            webhook_url,
            client: http_client(),
        }
    }

    /// Post a message. Returns `Ok(false)` when Discord rejected it and an
    /// error only on transport problems; either way callers just log.
    pub async fn send(&self, content: &str, username: &str) -> Result<bool> {
        let body = json!({
            "content": content,
            "username": username,
        });

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .context("discord webhook send failed")?;

        let ok = resp.status().is_success();
        if ok {
            debug!(username, "discord alert sent");
        } else {
            warn!(status = %resp.status(), "discord webhook rejected the message");
        }
        Ok(ok)
    }
}

/// SendGrid email adapter (alerts to the ops mailbox).
#[derive(Clone)]
pub struct EmailNotifier {
    api_key: String,
    from_email: String,
    client: reqwest::Client,
}

impl EmailNotifier {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("SENDGRID_API_KEY").ok()?.trim().to_string();
        let from_email = std::env::var("SENDGRID_FROM_EMAIL").ok()?.trim().to_string();
        if api_key.is_empty() || from_email.is_empty() {
            return None;
        }
        Some(EmailNotifier {
            api_key,
            from_email,
            client: http_client(),
        })
    }

    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<bool> {
        let payload = json!({
            "personalizations": [{"to": [{"email": to}]}],
            "from": {"email": self.from_email},
            "subject": subject,
            "content": [{"type": "text/plain", "value": body}],
        });

        let resp = self
            .client
            .post("https://api.sendgrid.com/v3/mail/send")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("sendgrid send failed")?;

        Ok(resp.status().is_success())
    }
}

/// Twilio SMS adapter (critical pages to the ops phone).
#[derive(Clone)]
pub struct SmsNotifier {
    account_sid: String,
    auth_token: String,
    from_number: String,
    client: reqwest::Client,
}

impl SmsNotifier {
    pub fn from_env() -> Option<Self> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID").ok()?.trim().to_string();
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN").ok()?.trim().to_string();
        let from_number = std::env::var("TWILIO_FROM_NUMBER").ok()?.trim().to_string();
        if account_sid.is_empty() || auth_token.is_empty() || from_number.is_empty() {
            return None;
        }
        Some(SmsNotifier {
            account_sid,
            auth_token,
            from_number,
            client: http_client(),
        })
    }

    pub async fn send(&self, to: &str, body: &str) -> Result<bool> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );
        let params = [("To", to), ("From", self.from_number.as_str()), ("Body", body)];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .context("twilio send failed")?;

        Ok(resp.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_returns_none_when_unconfigured() {
        std::env::remove_var("DISCORD_WEBHOOK_URL");
        assert!(DiscordNotifier::from_env().is_none());
        std::env::set_var("DISCORD_WEBHOOK_URL", "   ");
        assert!(DiscordNotifier::from_env().is_none());
        std::env::remove_var("DISCORD_WEBHOOK_URL");
    }

    #[tokio::test]
    async fn send_to_unreachable_webhook_errors_instead_of_panicking() {
        let n = DiscordNotifier::new("http://127.0.0.1:1/webhook".to_string());
        assert!(n.send("test", "test").await.is_err());
    }
}
