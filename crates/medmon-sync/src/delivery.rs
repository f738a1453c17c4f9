//! Outbound report delivery over SMTP via `lettre`.
//!
//! Settings are read from the store on every send, so edits made while the
//! scheduler runs take effect on the next report.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use medmon_storage::{Store, StoreError};
use thiserror::Error;

const PLAIN_TEXT_NOTICE: &str = "This report is provided in HTML format.";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("smtp is not configured: {0}")]
    Config(String),
    #[error("invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },
    #[error("building message: {0}")]
    Message(String),
    #[error("smtp transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Dispatches a rendered report to one recipient.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, html_body: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
}

impl SmtpSettings {
    pub const DEFAULT_PORT: u16 = 465;

    pub async fn load(store: &Store) -> Result<Self, DeliveryError> {
        let port_text = store.get("smtp_port", "").await?;
        let port = match port_text.trim() {
            "" => Self::DEFAULT_PORT,
            text => text
                .parse()
                .map_err(|_| DeliveryError::Config(format!("invalid smtp_port {text:?}")))?,
        };
        Ok(Self {
            host: store.get("smtp_host", "").await?,
            port,
            user: store.get("smtp_user", "").await?,
            password: store.get("smtp_password", "").await?,
            from: store.get("smtp_from", "").await?,
        })
    }

    pub async fn save(&self, store: &Store) -> Result<(), StoreError> {
        store.set("smtp_host", self.host.trim()).await?;
        store.set("smtp_port", &self.port.to_string()).await?;
        store.set("smtp_user", self.user.trim()).await?;
        store.set("smtp_password", &self.password).await?;
        store.set("smtp_from", self.from.trim()).await
    }

    /// Sender address, falling back to the login user.
    pub fn sender(&self) -> &str {
        if self.from.trim().is_empty() {
            self.user.trim()
        } else {
            self.from.trim()
        }
    }
}

fn mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address.trim().parse().map_err(|e: lettre::address::AddressError| DeliveryError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct SmtpDelivery {
    store: Store,
    timeout: Duration,
}

impl SmtpDelivery {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            timeout: Duration::from_secs(20),
        }
    }

    fn transport(&self, settings: &SmtpSettings) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let host = settings.host.trim();
        // 465 is implicit TLS; anything else negotiates STARTTLS.
        let builder = if settings.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        }
        .map_err(|e| DeliveryError::Config(e.to_string()))?;

        let mut builder = builder.port(settings.port).timeout(Some(self.timeout));
        if !settings.user.trim().is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.user.trim().to_string(),
                settings.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Delivery for SmtpDelivery {
    async fn send(&self, recipient: &str, subject: &str, html_body: &str) -> Result<(), DeliveryError> {
        let settings = SmtpSettings::load(&self.store).await?;
        if settings.host.trim().is_empty() {
            return Err(DeliveryError::Config("smtp_host is empty".to_string()));
        }
        if settings.sender().is_empty() {
            return Err(DeliveryError::Config(
                "neither smtp_from nor smtp_user is set".to_string(),
            ));
        }

        let message = Message::builder()
            .from(mailbox(settings.sender())?)
            .to(mailbox(recipient)?)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(
                PLAIN_TEXT_NOTICE.to_string(),
                html_body.to_string(),
            ))
            .map_err(|e| DeliveryError::Message(e.to_string()))?;

        self.transport(&settings)?
            .send(message)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        tracing::info!(
            channel = "email",
            recipient,
            subject,
            "report delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::store_in;

    #[tokio::test]
    async fn settings_default_port_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let empty = SmtpSettings::load(&store).await.unwrap();
        assert_eq!(empty.port, SmtpSettings::DEFAULT_PORT);
        assert!(empty.host.is_empty());

        let settings = SmtpSettings {
            host: "smtp.example.org".into(),
            port: 587,
            user: "monitor@example.org".into(),
            password: "secret".into(),
            from: String::new(),
        };
        settings.save(&store).await.unwrap();
        let loaded = SmtpSettings::load(&store).await.unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.sender(), "monitor@example.org");
    }

    #[tokio::test]
    async fn invalid_port_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.set("smtp_port", "smtps").await.unwrap();
        let err = SmtpSettings::load(&store).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Config(_)));
    }

    #[tokio::test]
    async fn unconfigured_host_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = SmtpDelivery::new(store_in(dir.path()).await);
        let err = delivery
            .send("editor@example.org", "Media report: x", "<html></html>")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Config(_)));
    }

    #[tokio::test]
    async fn bad_recipient_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.set("smtp_host", "smtp.example.org").await.unwrap();
        store.set("smtp_from", "monitor@example.org").await.unwrap();
        let err = SmtpDelivery::new(store)
            .send("not-an-email", "Media report: x", "<html></html>")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Address { .. }));
    }
}
