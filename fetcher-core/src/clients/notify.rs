//! Notification dispatcher façade (spec §6). Accepts pre-composed messages;
//! does not interpret notification semantics beyond severity.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::config::{NotificationsConfig, PrimaryNotificationConfig};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub severity: Severity,
}

/// Dispatches pre-composed notifications to every configured URL.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, notification: Notification<'_>) -> Result<()>;
}

/// Real dispatcher: POSTs the notification JSON to every URL in the list,
/// logging (not failing the caller on) delivery errors — spec §7 treats
/// notification dispatch failure as an infrastructure error to be logged,
/// not propagated into story-level retry logic.
#[derive(Debug, Clone)]
pub struct WebhookNotificationDispatcher {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl WebhookNotificationDispatcher {
    /// Builds the effective URL list: if a primary service
    /// (`[notifications.primary]`, the `[pushbullet]`-equivalent block) is
    /// enabled, its canonical URL is synthesized and prepended (spec §6).
    pub fn new(config: &NotificationsConfig) -> Self {
        let mut urls = Vec::new();
        if let Some(primary) = config.primary.as_ref().filter(|p| p.enabled) {
            urls.push(synthesize_primary_url(primary));
        }
        urls.extend(config.urls.iter().cloned());
        Self {
            client: reqwest::Client::new(),
            urls,
        }
    }
}

fn synthesize_primary_url(primary: &PrimaryNotificationConfig) -> String {
    match &primary.device_iden {
        Some(device) => format!(
            "pushbullet://{}@api.pushbullet.com/?device_iden={}",
            primary.api_key, device
        ),
        None => format!("pushbullet://{}@api.pushbullet.com/", primary.api_key),
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotificationDispatcher {
    async fn notify(&self, notification: Notification<'_>) -> Result<()> {
        for url in &self.urls {
            if let Err(e) = self.client.post(url).json(&notification).send().await {
                warn!(url, error = %e, "notification delivery failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_url_includes_device_iden_when_set() {
        let primary = PrimaryNotificationConfig {
            enabled: true,
            api_key: "key123".into(),
            device_iden: Some("dev1".into()),
        };
        let url = synthesize_primary_url(&primary);
        assert!(url.contains("key123"));
        assert!(url.contains("dev1"));
    }

    #[test]
    fn disabled_primary_is_not_prepended() {
        let config = NotificationsConfig {
            urls: vec!["https://hooks.example/a".into()],
            primary: Some(PrimaryNotificationConfig {
                enabled: false,
                api_key: "key".into(),
                device_iden: None,
            }),
        };
        let dispatcher = WebhookNotificationDispatcher::new(&config);
        assert_eq!(dispatcher.urls, vec!["https://hooks.example/a".to_string()]);
    }
}
