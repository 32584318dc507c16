use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::EmailMessage;
use crate::error::EmailError;

/// Hands one message to an email provider.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Keeps every message it is asked to send. Can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingEmailTransport {
    sent: Mutex<Vec<EmailMessage>>,
    failing: AtomicUsize,
}

impl RecordingEmailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail the next `n` sends with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EmailError::Transport("provider down".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Params<'a> {
    tenant_id: String,
    job_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendBody<'a> {
    sender: Address<'a>,
    to: [Address<'a>; 1],
    subject: &'a str,
    html_content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_content: Option<&'a str>,
    params: Params<'a>,
}

/// Transactional email over a JSON HTTP API authenticated with an `api-key`
/// header.
#[derive(Clone)]
pub struct HttpEmailTransport {
    client: Client,
    api_url: String,
    api_key: String,
    sender_email: String,
    sender_name: String,
}

impl fmt::Debug for HttpEmailTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEmailTransport")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("sender_email", &self.sender_email)
            .field("sender_name", &self.sender_name)
            .finish()
    }
}

impl HttpEmailTransport {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, sender_email: impl Into<String>) -> Self {
        Self::with_client(Client::new(), api_url, api_key, sender_email)
    }

    /// Like [`HttpEmailTransport::new`] with a per-request timeout.
    pub fn with_timeout(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        sender_email: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url, api_key, sender_email))
    }

    pub fn with_client(
        client: Client,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        sender_email: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            sender_email: sender_email.into(),
            sender_name: "Job Watch".to_string(),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let body = SendBody {
            sender: Address {
                email: &self.sender_email,
                name: Some(&self.sender_name),
            },
            to: [Address {
                email: &message.to,
                name: None,
            }],
            subject: &message.subject,
            html_content: &message.html,
            text_content: (!message.text.is_empty()).then_some(message.text.as_str()),
            params: Params {
                tenant_id: message.tenant_id.to_string(),
                job_id: message.job_id.as_str(),
            },
        };

        let resp = self
            .client
            .post(&self.api_url)
            .header("accept", "application/json")
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(())
    }
}
