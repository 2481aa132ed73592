//! PocketBase form-metadata client.
//!
//! Read-only lookups of form records by id, authenticated as a superuser.
//! The auth token is acquired at bootstrap and refreshed once on a 401.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A form record as stored in PocketBase.
#[derive(Debug, Clone, Deserialize)]
pub struct FormRecord {
    pub id: String,
    #[serde(default)]
    pub allow_duplicates: bool,
    #[serde(default)]
    pub handler: Option<Handler>,
}

/// Delivery settings attached to a form.
#[derive(Debug, Clone, Deserialize)]
pub struct Handler {
    #[serde(default)]
    pub from_name: String,
    pub from_email: String,
    pub to: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub template: Option<Template>,
    /// Per-form SMTP gateway override
    #[serde(default)]
    pub gateway: Option<Gateway>,
}

/// Mail template carried by the handler.
#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

/// Per-form SMTP gateway override.
#[derive(Debug, Clone, Deserialize)]
pub struct Gateway {
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

fn default_gateway_port() -> u16 {
    587
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

/// PocketBase client with a shared auth token.
#[derive(Clone)]
pub struct FormsClient {
    http: Client,
    base: String,
    email: String,
    password: String,
    token: Arc<RwLock<Option<String>>>,
}

impl FormsClient {
    pub fn new(http: Client, base: &str, email: &str, password: &str) -> Self {
        FormsClient {
            http,
            base: base.trim_end_matches('/').to_string(),
            email: email.to_string(),
            password: password.to_string(),
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Authenticate as a superuser and store the token. Bootstrap-fatal on
    /// failure.
    pub async fn authenticate(&self) -> Result<()> {
        let url = format!(
            "{}/api/collections/_superusers/auth-with-password",
            self.base
        );

        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "identity": self.email,
                "password": self.password,
            }))
            .send()
            .await
            .context("failed to reach PocketBase")?;

        if !response.status().is_success() {
            bail!("PocketBase authentication failed: {}", response.status());
        }

        let auth: AuthResponse = response
            .json()
            .await
            .context("malformed PocketBase auth response")?;

        *self.token.write().await = Some(auth.token);
        info!("pocketbase_authenticated");
        Ok(())
    }

    /// Fetch a form record by id. `Ok(None)` means the form does not exist;
    /// the caller treats that as a terminal failure for the message.
    pub async fn form(&self, form_id: &str) -> Result<Option<FormRecord>> {
        match self.fetch_form(form_id).await? {
            FetchResult::Found(record) => Ok(Some(record)),
            FetchResult::NotFound => Ok(None),
            FetchResult::Unauthorized => {
                // Token expired; PocketBase superuser tokens are long-lived
                // but not eternal. One refresh, one retry.
                warn!("pocketbase_token_expired");
                self.authenticate().await?;
                match self.fetch_form(form_id).await? {
                    FetchResult::Found(record) => Ok(Some(record)),
                    FetchResult::NotFound => Ok(None),
                    FetchResult::Unauthorized => bail!("PocketBase rejected a fresh auth token"),
                }
            }
        }
    }

    async fn fetch_form(&self, form_id: &str) -> Result<FetchResult> {
        let url = format!("{}/api/collections/forms/records/{}", self.base, form_id);

        let token = self.token.read().await.clone().unwrap_or_default();
        let response = self
            .http
            .get(&url)
            .header("Authorization", token)
            .send()
            .await
            .context("failed to reach PocketBase")?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(FetchResult::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(FetchResult::Unauthorized),
            status if status.is_success() => {
                let record: FormRecord = response
                    .json()
                    .await
                    .context("malformed PocketBase form record")?;
                Ok(FetchResult::Found(record))
            }
            status => bail!("PocketBase form lookup failed: {status}"),
        }
    }

    /// Drop the stored auth token. Part of graceful shutdown.
    pub async fn clear_auth(&self) {
        *self.token.write().await = None;
        info!("pocketbase_auth_cleared");
    }
}

enum FetchResult {
    Found(FormRecord),
    NotFound,
    Unauthorized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_record_deserialization() {
        let json = r#"{
            "id": "frm_123",
            "allow_duplicates": true,
            "handler": {
                "from_name": "Acme Forms",
                "from_email": "forms@acme.example",
                "to": "inbox@acme.example",
                "reply_to": "support@acme.example",
                "template": {
                    "subject": "New submission from {{name}}",
                    "body": "<p>{{message}}</p>"
                }
            }
        }"#;

        let record: FormRecord = serde_json::from_str(json).unwrap();
        assert!(record.allow_duplicates);
        let handler = record.handler.unwrap();
        assert_eq!(handler.from_email, "forms@acme.example");
        assert_eq!(handler.reply_to.as_deref(), Some("support@acme.example"));
        assert!(handler.gateway.is_none());
        assert_eq!(handler.template.unwrap().subject, "New submission from {{name}}");
    }

    #[test]
    fn test_form_record_minimal() {
        let json = r#"{"id": "frm_1"}"#;
        let record: FormRecord = serde_json::from_str(json).unwrap();
        assert!(!record.allow_duplicates);
        assert!(record.handler.is_none());
    }

    #[test]
    fn test_gateway_default_port() {
        let json = r#"{
            "host": "smtp.other.example",
            "username": "u",
            "password": "p"
        }"#;
        let gateway: Gateway = serde_json::from_str(json).unwrap();
        assert_eq!(gateway.port, 587);
    }
}
