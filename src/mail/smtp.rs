//! SMTP delivery via lettre.
//!
//! Builds the async transport from config (security, auth scheme, optional
//! pooling), converts rendered mails into RFC 5322 messages with the
//! correlation id as the message id, and classifies every outcome into
//! delivered / transient / permanent for the attempt state machine.

use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::PoolConfig;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{SmtpAuth, SmtpConfig, SmtpSecurity};
use crate::forms::Gateway;
use crate::mail::render::RenderedMail;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The gateway accepted the message.
    Delivered,
    /// Worth another attempt later (4xx status, connection trouble).
    Transient,
    /// Never retry (5xx status, unbuildable message).
    Permanent,
}

/// SMTP sender over a shared async transport.
#[derive(Clone)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    pooled: bool,
}

impl Mailer {
    /// Build the transport from config. For oauth2 the access token is
    /// fetched once here; a long-running worker with an expiring token
    /// restarts to refresh it.
    pub async fn connect(config: &SmtpConfig, http: &reqwest::Client) -> Result<Self> {
        let (credentials, mechanisms) = match config.auth {
            SmtpAuth::Plain | SmtpAuth::Gmail => (
                Credentials::new(config.username.clone(), config.password.clone()),
                vec![Mechanism::Plain, Mechanism::Login],
            ),
            SmtpAuth::OAuth2 => {
                let access_url = config
                    .access_url
                    .as_deref()
                    .context("oauth2 auth requires SMTP_ACCESS_URL")?;
                let private_key = config
                    .private_key
                    .as_deref()
                    .context("oauth2 auth requires SMTP_PRIVATE_KEY")?;
                let token = fetch_access_token(http, access_url, private_key).await?;
                (
                    Credentials::new(config.username.clone(), token),
                    vec![Mechanism::Xoauth2],
                )
            }
        };

        // The gmail scheme is plain credentials against Google's relay,
        // whatever SMTP_HOSTNAME says.
        let hostname = match config.auth {
            SmtpAuth::Gmail => "smtp.gmail.com",
            _ => config.hostname.as_str(),
        };

        let transport = build_transport(
            hostname,
            config.port,
            config.security,
            credentials,
            mechanisms,
            config.pool,
        )?;

        info!(
            hostname = hostname,
            port = config.port,
            security = ?config.security,
            auth = ?config.auth,
            pooled = config.pool,
            "smtp_transport_ready"
        );

        Ok(Mailer {
            transport,
            pooled: config.pool,
        })
    }

    /// Verify the gateway is reachable and accepts our credentials.
    pub async fn healthcheck(&self) -> Result<()> {
        let ok = self
            .transport
            .test_connection()
            .await
            .context("SMTP connection test failed")?;
        if !ok {
            anyhow::bail!("SMTP gateway refused the connection test");
        }
        Ok(())
    }

    /// Send a rendered mail, tagging it with `hex` as the client message id.
    /// A per-form gateway override gets a one-off transport for this send.
    pub async fn send(
        &self,
        mail: &RenderedMail,
        hex: &str,
        gateway: Option<&Gateway>,
    ) -> SendOutcome {
        let message = match build_message(mail, hex) {
            Ok(message) => message,
            Err(error) => {
                warn!(hex = hex, error = %error, "smtp_message_build_failed");
                return SendOutcome::Permanent;
            }
        };

        let result = match gateway {
            None => self.transport.send(message).await,
            Some(gateway) => match gateway_transport(gateway) {
                Ok(transport) => transport.send(message).await,
                Err(error) => {
                    warn!(hex = hex, host = %gateway.host, error = %error, "smtp_gateway_setup_failed");
                    return SendOutcome::Transient;
                }
            },
        };

        classify(hex, result)
    }

    /// Tear down the transport. Pooled connections drain on drop; this is
    /// the place to say so in the logs.
    pub async fn close(&self) {
        info!(pooled = self.pooled, "smtp_transport_closed");
    }
}

fn build_transport(
    hostname: &str,
    port: u16,
    security: SmtpSecurity,
    credentials: Credentials,
    mechanisms: Vec<Mechanism>,
    pool: bool,
) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(hostname).port(port);

    let builder = match security {
        SmtpSecurity::None => builder,
        SmtpSecurity::StartTls => {
            let params =
                TlsParameters::new(hostname.into()).context("invalid TLS parameters")?;
            builder.tls(Tls::Required(params))
        }
        SmtpSecurity::Ssl => {
            let params =
                TlsParameters::new(hostname.into()).context("invalid TLS parameters")?;
            builder.tls(Tls::Wrapper(params))
        }
    };

    let pool_config = if pool {
        PoolConfig::new()
    } else {
        PoolConfig::new().max_size(1)
    };

    Ok(builder
        .credentials(credentials)
        .authentication(mechanisms)
        .pool_config(pool_config)
        .build())
}

/// One-off transport for a per-form gateway override. Always STARTTLS with
/// plain credentials; overrides are expected to be ordinary submission
/// relays.
fn gateway_transport(gateway: &Gateway) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let params = TlsParameters::new(gateway.host.clone()).context("invalid TLS parameters")?;
    Ok(
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(gateway.host.as_str())
            .port(gateway.port)
            .tls(Tls::Required(params))
            .credentials(Credentials::new(
                gateway.username.clone(),
                gateway.password.clone(),
            ))
            .authentication(vec![Mechanism::Plain, Mechanism::Login])
            .build(),
    )
}

fn build_message(mail: &RenderedMail, hex: &str) -> Result<Message> {
    let from_address: Address = mail
        .from_email
        .parse()
        .context("invalid from address")?;
    let from_name = if mail.from_name.trim().is_empty() {
        None
    } else {
        Some(mail.from_name.clone())
    };

    let mut builder = Message::builder()
        .from(Mailbox::new(from_name, from_address))
        .to(mail.to.parse::<Mailbox>().context("invalid to address")?)
        .subject(mail.subject.clone())
        .message_id(Some(format!("<{hex}@formpost>")));

    if let Some(reply_to) = &mail.reply_to {
        builder = builder.reply_to(reply_to.parse().context("invalid reply-to address")?);
    }

    builder
        .header(ContentType::TEXT_HTML)
        .body(mail.html.clone())
        .context("failed to build message")
}

/// Map the transport result onto the attempt state machine. Permanent (5xx)
/// rejections never retry; everything else, including connection trouble,
/// is treated as transient.
fn classify(
    hex: &str,
    result: std::result::Result<
        lettre::transport::smtp::response::Response,
        lettre::transport::smtp::Error,
    >,
) -> SendOutcome {
    match result {
        Ok(response) if response.is_positive() => {
            info!(hex = hex, code = %response.code(), "smtp_send_ok");
            SendOutcome::Delivered
        }
        Ok(response) => {
            warn!(hex = hex, code = %response.code(), "smtp_send_rejected");
            SendOutcome::Transient
        }
        Err(error) if error.is_permanent() => {
            warn!(hex = hex, error = %error, "smtp_send_permanent_failure");
            SendOutcome::Permanent
        }
        Err(error) => {
            warn!(hex = hex, error = %error, "smtp_send_transient_failure");
            SendOutcome::Transient
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

/// Exchange the configured private key for an access token at bootstrap.
async fn fetch_access_token(
    http: &reqwest::Client,
    access_url: &str,
    private_key: &str,
) -> Result<String> {
    let response = http
        .post(access_url)
        .bearer_auth(private_key)
        .send()
        .await
        .context("failed to reach SMTP access-token endpoint")?
        .error_for_status()
        .context("SMTP access-token endpoint rejected the request")?;

    let token: AccessTokenResponse = response
        .json()
        .await
        .context("malformed access-token response")?;
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered() -> RenderedMail {
        RenderedMail {
            from_name: "Acme Forms".into(),
            from_email: "forms@acme.example".into(),
            to: "inbox@acme.example".into(),
            reply_to: Some("visitor@elsewhere.example".into()),
            subject: "New submission".into(),
            html: "<p>hello</p>".into(),
        }
    }

    #[test]
    fn test_build_message_ok() {
        let message = build_message(&rendered(), "a1b2").unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: New submission"));
        assert!(formatted.contains("a1b2@formpost"));
        assert!(formatted.contains("Reply-To: visitor@elsewhere.example"));
    }

    #[test]
    fn test_build_message_empty_from_name() {
        let mut mail = rendered();
        mail.from_name = "".into();
        mail.reply_to = None;
        let message = build_message(&mail, "a1b2").unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("From: forms@acme.example"));
    }

    #[test]
    fn test_build_message_bad_address() {
        let mut mail = rendered();
        mail.to = "not an address".into();
        assert!(build_message(&mail, "a1b2").is_err());
    }
}
