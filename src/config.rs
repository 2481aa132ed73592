//! Configuration module for environment variable parsing.
//!
//! All configuration is read from environment variables at startup. Missing
//! required variables are a bootstrap-fatal error; the process must not come
//! up half-configured.

use std::env;

use anyhow::{bail, Context, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL (side-state store and streams)
    pub redis_url: String,

    /// PocketBase base URL for form metadata lookups
    pub pocketbase_url: String,

    /// PocketBase superuser email
    pub pocketbase_email: String,

    /// PocketBase superuser password
    pub pocketbase_pass: String,

    /// SMTP gateway settings
    pub smtp: SmtpConfig,

    /// MinIO object-store settings (attachment blobs)
    pub minio: MinioConfig,

    /// Max stream entries fetched per read
    pub batch_size: usize,

    /// Long-poll block time in seconds for stream reads
    pub block_secs: u64,

    /// Base retry delay in minutes (multiplied by fail_count)
    pub retry_interval_min: u64,

    /// Max fail_count before a message is dead-lettered
    pub max_retries: u32,

    /// Base URL for attachment download links (required once a form
    /// submission carries attachments)
    pub api_url: Option<String>,

    /// Verbose logging toggle
    pub debug: bool,
}

/// SMTP gateway configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub hostname: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub auth: SmtpAuth,
    pub username: String,
    pub password: String,
    /// Private key used to obtain an access token (oauth2 only)
    pub private_key: Option<String>,
    /// Token endpoint queried at bootstrap (oauth2 only)
    pub access_url: Option<String>,
    /// Keep the transport open across sends
    pub pool: bool,
}

/// MinIO object-store configuration.
#[derive(Debug, Clone)]
pub struct MinioConfig {
    pub endpoint: String,
    pub root_user: String,
    pub root_password: String,
    pub bucket: String,
}

/// Connection security for the SMTP gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    None,
    StartTls,
    Ssl,
}

/// Authentication scheme for the SMTP gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpAuth {
    Plain,
    Gmail,
    OAuth2,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Fails on any missing required variable or unparseable enum value.
    pub fn from_env() -> Result<Self> {
        let smtp = SmtpConfig {
            hostname: required("SMTP_HOSTNAME")?,
            port: env::var("SMTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(587),
            security: parse_security(&env::var("SMTP_SECURITY").unwrap_or_default())?,
            auth: parse_auth(&env::var("SMTP_AUTH").unwrap_or_default())?,
            username: required("SMTP_USERNAME")?,
            password: required("SMTP_PASSWORD")?,
            private_key: env::var("SMTP_PRIVATE_KEY").ok(),
            access_url: env::var("SMTP_ACCESS_URL").ok(),
            pool: parse_bool(env::var("SMTP_POOL").ok().as_deref()),
        };

        if smtp.auth == SmtpAuth::OAuth2
            && (smtp.private_key.is_none() || smtp.access_url.is_none())
        {
            bail!("SMTP_AUTH=oauth2 requires SMTP_PRIVATE_KEY and SMTP_ACCESS_URL");
        }

        let minio = MinioConfig {
            endpoint: env::var("MINIO_ENDPOINT")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
            root_user: required("MINIO_ROOT_USER")?,
            root_password: required("MINIO_ROOT_PASSWORD")?,
            bucket: env::var("MINIO_BUCKET").unwrap_or_else(|_| "attachments".to_string()),
        };

        Ok(Config {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),

            pocketbase_url: required("POCKETBASE_URL")?,
            pocketbase_email: required("POCKETBASE_EMAIL")?,
            pocketbase_pass: required("POCKETBASE_PASS")?,

            smtp,
            minio,

            batch_size: env::var("CONSUMER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),

            block_secs: env::var("CONSUMER_BLOCK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),

            retry_interval_min: env::var("RETRY_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),

            max_retries: env::var("MAILER_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),

            api_url: env::var("API_URL")
                .ok()
                .map(|u| u.trim_end_matches('/').to_string()),

            debug: parse_bool(env::var("DEBUG").ok().as_deref()),
        })
    }
}

/// Fetch a required environment variable or fail with its name.
fn required(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("missing required env var {name}"))?;
    if value.trim().is_empty() {
        bail!("required env var {name} is empty");
    }
    Ok(value)
}

/// Parse a truthy flag: "true", "1", "yes" (case-insensitive) enable it.
fn parse_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

fn parse_security(raw: &str) -> Result<SmtpSecurity> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "starttls" => Ok(SmtpSecurity::StartTls),
        "none" => Ok(SmtpSecurity::None),
        "ssl" => Ok(SmtpSecurity::Ssl),
        other => bail!("invalid SMTP_SECURITY value {other:?} (expected none/starttls/ssl)"),
    }
}

fn parse_auth(raw: &str) -> Result<SmtpAuth> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "plain" => Ok(SmtpAuth::Plain),
        "gmail" => Ok(SmtpAuth::Gmail),
        "oauth2" => Ok(SmtpAuth::OAuth2),
        other => bail!("invalid SMTP_AUTH value {other:?} (expected plain/gmail/oauth2)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool(Some("true")));
        assert!(parse_bool(Some("1")));
        assert!(parse_bool(Some("YES")));
        assert!(!parse_bool(Some("false")));
        assert!(!parse_bool(Some("0")));
        assert!(!parse_bool(None));
    }

    #[test]
    fn test_parse_security() {
        assert_eq!(parse_security("").unwrap(), SmtpSecurity::StartTls);
        assert_eq!(parse_security("none").unwrap(), SmtpSecurity::None);
        assert_eq!(parse_security("STARTTLS").unwrap(), SmtpSecurity::StartTls);
        assert_eq!(parse_security("ssl").unwrap(), SmtpSecurity::Ssl);
        assert!(parse_security("tls13").is_err());
    }

    #[test]
    fn test_parse_auth() {
        assert_eq!(parse_auth("").unwrap(), SmtpAuth::Plain);
        assert_eq!(parse_auth("plain").unwrap(), SmtpAuth::Plain);
        assert_eq!(parse_auth("Gmail").unwrap(), SmtpAuth::Gmail);
        assert_eq!(parse_auth("oauth2").unwrap(), SmtpAuth::OAuth2);
        assert!(parse_auth("ntlm").is_err());
    }

    #[test]
    fn test_required_missing() {
        assert!(required("FORMPOST_TEST_UNSET_VAR").is_err());
    }

    #[test]
    fn test_required_present() {
        env::set_var("FORMPOST_TEST_REQUIRED_VAR", "value");
        assert_eq!(required("FORMPOST_TEST_REQUIRED_VAR").unwrap(), "value");
        env::remove_var("FORMPOST_TEST_REQUIRED_VAR");
    }
}
