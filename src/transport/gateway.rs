//! HTTP SMS gateway transport: `POST {to, message}` as JSON.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::Serialize;

use super::{Delivery, SendRequest, Transport};
use crate::error::TransportError;

/// Gateway responses longer than this are cut before logging.
const MAX_RESPONSE_CHARS: usize = 2000;

/// Request body accepted by the gateway.
#[derive(Debug, Serialize)]
struct GatewayMessage<'a> {
    to: &'a str,
    message: &'a str,
}

/// SMS gateway client. One `reqwest::Client` (and its connection pool) per run.
pub struct HttpGateway {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint.trim()).map_err(|e| TransportError::StartupFailed {
            name: "gateway".into(),
            reason: format!("invalid endpoint '{endpoint}': {e}"),
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(TransportError::StartupFailed {
                name: "gateway".into(),
                reason: format!("unsupported endpoint scheme '{}'", endpoint.scheme()),
            });
        }

        Ok(Self {
            endpoint,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Transport for HttpGateway {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn send(
        &mut self,
        request: &SendRequest<'_>,
        timeout: Duration,
    ) -> Result<Delivery, TransportError> {
        let payload = GatewayMessage {
            to: request.recipient,
            message: request.body,
        };

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .timeout(timeout);

        let credential = request.credential.expose_secret();
        if !credential.is_empty() {
            builder = builder.header(AUTHORIZATION, credential);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        Ok(Delivery {
            ok: status.is_success(),
            status_code: Some(status.as_u16()),
            response: truncate(text),
        })
    }
}

fn truncate(mut text: String) -> String {
    if let Some((idx, _)) = text.char_indices().nth(MAX_RESPONSE_CHARS) {
        text.truncate(idx);
    }
    text
}
