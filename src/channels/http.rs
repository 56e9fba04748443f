//! HTTP transport: posts outbound messages to the provider's send API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::Transport;
use crate::error::ChannelError;

pub struct HttpTransport {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.map(SecretString::from),
            client: reqwest::Client::new(),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, contact_id: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "to": contact_id,
            "text": text,
        });

        let mut req = self.client.post(self.send_url()).json(&body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req.send().await.map_err(|e| ChannelError::SendFailed {
            name: "http".into(),
            reason: e.to_string(),
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "http".into(),
                reason: format!("send returned {status}: {detail}"),
            });
        }
        Ok(())
    }
}
