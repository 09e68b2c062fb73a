//! HTTP collaborators: the REST send fallback and paged history.
//!
//! [`RestClient`] implements both [`FallbackSender`] and [`HistorySource`]
//! against the chat server's JSON API:
//!
//! ```text
//! POST {server}/api/messages                      {conversationId, content, tempId}
//! GET  {server}/api/conversations/{id}/messages   ?limit=N[&before=cursor]
//! ```

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};

use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::dispatch::FallbackSender;
use crate::error::{ClientError, Result};
use crate::history::{HistoryPage, HistorySource};
use crate::model::{ConversationId, OutboundMessage, ServerMessage};

/// Client for the chat server's REST API.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Create a client for `base_url` (scheme and host, no trailing slash
    /// needed) with an optional bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e:#}")))?;
        Ok(Self::with_client(client, base_url, token))
    }

    /// Create a client around a pre-configured `reqwest::Client`.
    pub fn with_client(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Base URL requests are made against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn error_body(response: Response) -> (u16, String) {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body
        };
        (status.as_u16(), message)
    }
}

/// Fill `conversationId`/`tempId` the server left out of a message record.
fn complete_record(record: &mut Value, conversation_id: &ConversationId, temp_id: Option<&str>) {
    let Some(obj) = record.as_object_mut() else {
        return;
    };
    if !obj.contains_key("conversationId") && !obj.contains_key("conversation_id") {
        obj.insert("conversationId".into(), json!(conversation_id));
    }
    if let Some(temp_id) = temp_id {
        if !obj.contains_key("tempId") && !obj.contains_key("temp_id") {
            obj.insert("tempId".into(), json!(temp_id));
        }
    }
}

#[async_trait]
impl FallbackSender for RestClient {
    async fn send_message(&self, message: &OutboundMessage) -> Result<ServerMessage> {
        let url = format!("{}/api/messages", self.base_url);
        let body = json!({
            "conversationId": message.conversation_id,
            "content": message.content,
            "tempId": message.temp_id,
        });

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Delivery(format!("POST {url} timed out"))
                } else {
                    ClientError::Delivery(format!("POST {url} failed: {e:#}"))
                }
            })?;

        if !response.status().is_success() {
            let (status, reason) = Self::error_body(response).await;
            log::warn!("[Rest] send {} rejected: {status} {reason}", message.temp_id);
            return Err(ClientError::Delivery(format!("HTTP {status}: {reason}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(format!("unreadable send response: {e:#}")))?;
        let mut record = match payload.get("message") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => payload,
        };
        complete_record(
            &mut record,
            &message.conversation_id,
            Some(message.temp_id.as_str()),
        );
        let server: ServerMessage = serde_json::from_value(record)?;
        log::debug!("[Rest] {} persisted as {}", message.temp_id, server.id);
        Ok(server)
    }
}

#[async_trait]
impl HistorySource for RestClient {
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<&str>,
        page_size: usize,
    ) -> Result<HistoryPage> {
        let url = format!(
            "{}/api/conversations/{}/messages",
            self.base_url, conversation_id
        );
        let mut query: Vec<(&str, String)> = vec![("limit", page_size.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }

        let response = self
            .authorize(self.client.get(&url).query(&query))
            .send()
            .await?;
        if !response.status().is_success() {
            let (status, message) = Self::error_body(response).await;
            return Err(ClientError::Http { status, message });
        }

        let payload: Value = response.json().await?;
        let (items, cursor) = match payload {
            Value::Array(items) => (items, None),
            Value::Object(mut obj) => {
                let items = match obj.remove("messages") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let cursor = match obj.remove("cursor") {
                    Some(Value::String(s)) => Some(s),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                (items, cursor)
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected history payload: {other}"
                )))
            }
        };

        let messages = items
            .into_iter()
            .map(|mut item| {
                complete_record(&mut item, conversation_id, None);
                serde_json::from_value::<ServerMessage>(item).map_err(ClientError::from)
            })
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "[Rest] history {conversation_id} before {before:?}: {} message(s)",
            messages.len()
        );
        Ok(HistoryPage { messages, cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageId, MessageStatus};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn outbound() -> OutboundMessage {
        OutboundMessage::new(ConversationId::from("c1"), "hello")
    }

    // ========== Fallback Send Tests ==========

    #[tokio::test]
    async fn test_send_posts_body_and_parses_record() {
        let server = MockServer::start().await;
        let message = outbound();
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "conversationId": "c1",
                "content": "hello",
                "tempId": message.temp_id.as_str(),
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 101,
                "conversation_id": "c1",
                "sender_type": "agent",
                "content": "hello",
                "created_at": "2026-01-01T10:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri(), Some("secret".into())).unwrap();
        let record = client.send_message(&message).await.unwrap();
        assert_eq!(record.id, MessageId::from("101"));
        assert_eq!(record.temp_id, Some(message.temp_id));
        assert_eq!(message.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_send_accepts_wrapped_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"id": "m1", "content": "hello"}
            })))
            .mount(&server)
            .await;

        let client = RestClient::new(format!("{}/", server.uri()), None).unwrap();
        let record = client.send_message(&outbound()).await.unwrap();
        assert_eq!(record.id, MessageId::from("m1"));
        assert_eq!(record.conversation_id, ConversationId::from("c1"));
    }

    #[tokio::test]
    async fn test_send_non_success_is_delivery_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri(), None).unwrap();
        let err = client.send_message(&outbound()).await.unwrap_err();
        assert!(matches!(&err, ClientError::Delivery(msg) if msg.contains("503") && msg.contains("maintenance")));
        assert!(err.is_recoverable());
    }

    // ========== History Tests ==========

    #[tokio::test]
    async fn test_history_object_payload_with_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations/c1/messages"))
            .and(query_param("limit", "2"))
            .and(query_param("before", "m9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [
                    {"id": "m7", "content": "a", "createdAt": "2026-01-01T10:00:00Z"},
                    {"id": "m8", "content": "b", "createdAt": "2026-01-01T10:01:00Z"}
                ],
                "cursor": "m7"
            })))
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri(), None).unwrap();
        let page = client
            .fetch_page(&ConversationId::from("c1"), Some("m9"), 2)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.cursor.as_deref(), Some("m7"));
        assert_eq!(page.messages[0].conversation_id, ConversationId::from("c1"));
    }

    #[tokio::test]
    async fn test_history_bare_array_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations/c1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"id": 1, "conversationId": "c1", "content": "x"}])),
            )
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri(), None).unwrap();
        let page = client
            .fetch_page(&ConversationId::from("c1"), None, 30)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.cursor, None);
    }

    #[tokio::test]
    async fn test_history_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri(), None).unwrap();
        let err = client
            .fetch_page(&ConversationId::from("nope"), None, 30)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Http { status: 404, .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = RestClient::new("http://localhost:3000", Some("secret".into())).unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[redacted]"));
    }
}
