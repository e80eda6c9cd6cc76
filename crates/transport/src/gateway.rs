//! HTTP client for the messaging gateway.

use std::time::Duration;

use {
    async_trait::async_trait,
    chatrelay_common::types::{MediaKind, MediaMessage},
    reqwest::{Client, StatusCode},
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{Delivery, Error, MessageTransport, Result};

const API_KEY_HEADER: &str = "X-Api-Key";

/// Connection settings for [`GatewayTransport`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<Secret<String>>,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            api_key: None,
            timeout: Duration::from_secs(15),
        }
    }
}

/// [`MessageTransport`] backed by the gateway's REST API.
pub struct GatewayTransport {
    client: Client,
    base_url: String,
    api_key: Option<Secret<String>>,
}

impl GatewayTransport {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let parsed = Url::parse(&config.base_url)
            .map_err(|e| Error::invalid_input(format!("gateway base url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::invalid_input(format!(
                "gateway base url must be http(s), got {}",
                parsed.scheme()
            )));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::external("build http client", e))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/api/{op}", self.base_url)
    }

    /// POST a JSON body and hand back the decoded response body.
    async fn post(&self, op: &str, body: &Value) -> Result<Value> {
        let mut req = self.client.post(self.endpoint(op)).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header(API_KEY_HEADER, key.expose_secret().as_str());
        }

        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let resp = req.send().await.map_err(|e| Error::request(op, e))?;
        let status = resp.status();
        #[cfg(feature = "metrics")]
        {
            use chatrelay_metrics::{counter, gateway, histogram, labels};
            counter!(
                gateway::REQUESTS_TOTAL,
                labels::ENDPOINT => op.to_string(),
                labels::STATUS => status.as_u16().to_string()
            )
            .increment(1);
            histogram!(gateway::REQUEST_DURATION_SECONDS, labels::ENDPOINT => op.to_string())
                .record(started.elapsed().as_secs_f64());
        }
        let text = resp.text().await.map_err(|e| Error::request(op, e))?;
        let parsed: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            let reason = rejection_reason(status, &parsed);
            warn!(op, status = status.as_u16(), %reason, "gateway rejected request");
            return Err(Error::rejected(status.as_u16(), reason));
        }

        debug!(op, status = status.as_u16(), "gateway request ok");
        Ok(parsed)
    }
}

/// Pull the gateway's `message` field, falling back to the raw body or status.
fn rejection_reason(status: StatusCode, body: &Value) -> String {
    match body {
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => status
            .canonical_reason()
            .unwrap_or("unknown gateway error")
            .to_string(),
    }
}

/// The gateway reports ids either as a plain string or as `{ "_serialized": .. }`.
fn delivered_id(body: &Value) -> Result<Delivery> {
    let id = match body.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(obj)) => obj
            .get("_serialized")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    match id {
        Some(delivered_id) => Ok(Delivery { delivered_id }),
        None => Err(Error::rejected(
            StatusCode::OK.as_u16(),
            "gateway response has no message id",
        )),
    }
}

fn media_op(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "sendImage",
        MediaKind::File => "sendFile",
    }
}

#[async_trait]
impl MessageTransport for GatewayTransport {
    async fn mark_seen(&self, account_id: &str, recipient_id: &str) -> Result<()> {
        self.post(
            "sendSeen",
            &json!({ "chatId": recipient_id, "session": account_id }),
        )
        .await?;
        Ok(())
    }

    async fn set_typing(&self, account_id: &str, recipient_id: &str, on: bool) -> Result<()> {
        let op = if on {
            "startTyping"
        } else {
            "stopTyping"
        };
        self.post(op, &json!({ "chatId": recipient_id, "session": account_id }))
            .await?;
        Ok(())
    }

    async fn send_text(
        &self,
        account_id: &str,
        recipient_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Delivery> {
        info!(
            account_id,
            recipient_id,
            text_len = text.len(),
            reply_to = ?reply_to,
            "gateway outbound text send"
        );
        let body = self
            .post(
                "sendText",
                &json!({
                    "chatId": recipient_id,
                    "session": account_id,
                    "text": text,
                    "reply_to": reply_to,
                }),
            )
            .await?;
        delivered_id(&body)
    }

    async fn send_media(
        &self,
        account_id: &str,
        recipient_id: &str,
        kind: MediaKind,
        media: &MediaMessage,
    ) -> Result<Delivery> {
        info!(
            account_id,
            recipient_id,
            %kind,
            filename = %media.file.filename,
            mimetype = %media.file.mimetype,
            "gateway outbound media send"
        );
        let body = self
            .post(
                media_op(kind),
                &json!({
                    "chatId": recipient_id,
                    "session": account_id,
                    "file": {
                        "mimetype": media.file.mimetype,
                        "filename": media.file.filename,
                        "url": media.file.url,
                    },
                    "caption": media.caption,
                    "reply_to": media.reply_to,
                }),
            )
            .await?;
        delivered_id(&body)
    }
}
