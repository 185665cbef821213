//! Collector batch endpoint
//!
//! One batch is one POST to `{api_url}/1/batch`:
//!
//! ```json
//! {"session_token": "...", "app_version": "1.0", "user": "<user id>",
//!  "unique_device_id": "<device id>", "version": 3, "data": [ ... ]}
//! ```

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::transport::{HttpResponse, Transport};
use crate::types::{QueuedEvent, EVENT_SCHEMA_VERSION};

const API_VERSION: u32 = 1;
const BATCH_PATH: &str = "batch";

/// Values repeated on every batch of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub session_token: String,
    pub app_version: String,
    pub user_id: String,
    pub device_id: String,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    session_token: &'a str,
    app_version: &'a str,
    user: &'a str,
    unique_device_id: &'a str,
    version: u32,
    data: &'a [QueuedEvent],
}

/// Client for the batch endpoint
#[derive(Clone)]
pub struct EventApiClient {
    batch_url: String,
    context: BatchContext,
    transport: Arc<dyn Transport>,
}

impl EventApiClient {
    pub fn new(api_url: &str, context: BatchContext, transport: Arc<dyn Transport>) -> Self {
        let batch_url = format!(
            "{}/{}/{}",
            api_url.trim_end_matches('/'),
            API_VERSION,
            BATCH_PATH
        );
        Self {
            batch_url,
            context,
            transport,
        }
    }

    pub fn batch_url(&self) -> &str {
        &self.batch_url
    }

    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    /// JSON body for `events`
    pub fn batch_body(&self, events: &[QueuedEvent]) -> Result<serde_json::Value> {
        let body = BatchBody {
            session_token: &self.context.session_token,
            app_version: &self.context.app_version,
            user: &self.context.user_id,
            unique_device_id: &self.context.device_id,
            version: EVENT_SCHEMA_VERSION,
            data: events,
        };
        Ok(serde_json::to_value(body)?)
    }

    /// POST one batch. `Err` only when no response was received.
    pub async fn send_batch(&self, events: &[QueuedEvent]) -> Result<HttpResponse> {
        let body = self.batch_body(events)?;
        tracing::debug!(
            url = %self.batch_url,
            events = events.len(),
            "Sending event batch"
        );
        self.transport.post_json(&self.batch_url, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::factory;
    use crate::transport::ScriptedTransport;

    fn context() -> BatchContext {
        BatchContext {
            session_token: "1=u1=1000=abc".to_string(),
            app_version: "2.0".to_string(),
            user_id: "u1".to_string(),
            device_id: "dev".to_string(),
        }
    }

    #[test]
    fn test_batch_url_and_body() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = EventApiClient::new("https://1.api.test/", context(), transport);
        assert_eq!(client.batch_url(), "https://1.api.test/1/batch");

        let events = vec![factory::named_event(0, 10, "a", None)];
        let body = client.batch_body(&events).unwrap();
        assert_eq!(body["session_token"], "1=u1=1000=abc");
        assert_eq!(body["app_version"], "2.0");
        assert_eq!(body["user"], "u1");
        assert_eq!(body["unique_device_id"], "dev");
        assert_eq!(body["version"], 3);
        assert_eq!(body["data"][0]["name"], "a");
    }

    #[tokio::test]
    async fn test_send_batch_posts_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/1/batch", HttpResponse::new(200, ""));
        let client = EventApiClient::new("https://1.api.test", context(), transport.clone());

        let response = client
            .send_batch(&[factory::session_start(0, 1)])
            .await
            .unwrap();
        assert!(response.is_success());

        let sent = transport.requests_to("/1/batch");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "POST");
        assert_eq!(sent[0].body.as_ref().unwrap()["data"][0]["type"], "session_start");
    }
}
