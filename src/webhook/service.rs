//! Webhook definitions: validation and CRUD.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use tsuru_types::Webhook;

use crate::error::{Result, TsuruError};
use crate::storage::WebhookStorage;

fn name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{0,62}$").ok())
        .as_ref()
}

fn invalid(message: impl Into<String>) -> TsuruError {
    TsuruError::InvalidWebhook(message.into())
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("webhook name must not be empty"));
    }
    if !name_regex().is_some_and(|re| re.is_match(name)) {
        return Err(invalid(
            "Invalid webhook name, webhook name should have at most 63 characters, containing only lower case letters, numbers or dashes, starting with a letter.",
        ));
    }
    Ok(())
}

pub fn validate_urls(webhook: &Webhook) -> Result<()> {
    if webhook.url.is_empty() {
        return Err(invalid("webhook url must not be empty"));
    }
    url::Url::parse(&webhook.url).map_err(|e| invalid(format!("webhook url is not valid: {e}")))?;
    if !webhook.proxy_url.is_empty() {
        url::Url::parse(&webhook.proxy_url)
            .map_err(|e| invalid(format!("webhook proxy url is not valid: {e}")))?;
    }
    Ok(())
}

pub struct WebhookService {
    storage: Arc<dyn WebhookStorage>,
}

impl WebhookService {
    pub fn new(storage: Arc<dyn WebhookStorage>) -> Self {
        Self { storage }
    }

    pub async fn create(&self, webhook: Webhook) -> Result<()> {
        validate_name(&webhook.name)?;
        if webhook.team_owner.trim().is_empty() {
            return Err(invalid("webhook team owner must not be empty"));
        }
        validate_urls(&webhook)?;
        self.storage.insert_webhook(&webhook).await?;
        tracing::info!(webhook = %webhook.name, team = %webhook.team_owner, "webhook created");
        Ok(())
    }

    pub async fn update(&self, webhook: Webhook) -> Result<()> {
        validate_urls(&webhook)?;
        self.storage.update_webhook(&webhook).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.storage.delete_webhook(name).await
    }

    pub async fn find(&self, name: &str) -> Result<Webhook> {
        self.storage.find_webhook(name).await
    }

    /// Webhooks owned by `teams`, or every webhook when `None`.
    pub async fn list(&self, teams: Option<&[String]>) -> Result<Vec<Webhook>> {
        let mut hooks = self.storage.list_webhooks(teams).await?;
        hooks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hooks)
    }
}
