//! Remote transports: JSON-RPC over HTTP request/response and over SSE.
//!
//! For HTTP the broker POSTs the message body and expects a JSON-RPC
//! reply. For SSE the broker writes over POST and reads the reply from
//! the `data:` lines of the event stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{ToolTransport, TransportError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE buffer parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`; only `data:` lines matter. The buffer
/// is drained in place and any trailing partial event stays for the next
/// call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_owned());
                }
            }
        }
    }

    data_lines
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if let Some(status) = err.status() {
        TransportError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        TransportError::Connect(err.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request/response JSON-RPC over HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            headers,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut req = self.client.post(&self.url).json(body);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        req
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("transport is shut down".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        tracing::debug!(id, method, url = %self.url, "sending HTTP tool server request");
        let response = self.post(&req).send().await.map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let reply: JsonRpcResponse = response.json().await.map_err(|e| {
            TransportError::Framing(format!("malformed JSON-RPC reply: {e}"))
        })?;
        if reply.id != id {
            return Err(TransportError::Framing(format!(
                "reply id {} does not match request id {id}",
                reply.id
            )));
        }
        Ok(reply)
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let response = self.post(&notif).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        // Some servers answer notifications with 202/204; any 2xx is fine.
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-RPC over POST with the reply read from an SSE stream.
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    next_id: AtomicU64,
    alive: AtomicBool,
    timeout: Duration,
}

impl SseTransport {
    pub fn new(
        url: impl Into<String>,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        // No client-level timeout: the overall deadline is applied per
        // request around the whole stream read.
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            headers,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            timeout,
        })
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .json(body);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        req
    }

    /// Read SSE events until one carries a JSON-RPC response with `id`.
    async fn read_reply(
        mut response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, TransportError> {
        let mut buffer = String::new();
        loop {
            let chunk = response.chunk().await.map_err(classify_reqwest)?;
            let Some(bytes) = chunk else {
                return Err(TransportError::Framing(
                    "event stream ended before a matching reply".into(),
                ));
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            for data in drain_data_lines(&mut buffer) {
                match serde_json::from_str::<JsonRpcResponse>(&data) {
                    Ok(reply) if reply.id == id => return Ok(reply),
                    Ok(reply) => {
                        tracing::debug!(expected_id = id, got_id = reply.id, "skipping stale SSE reply");
                    }
                    // Notifications and keep-alives ride the same stream.
                    Err(_) => tracing::debug!(data = %data, "skipping non-response SSE event"),
                }
            }
        }
    }
}

#[async_trait]
impl ToolTransport for SseTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("transport is shut down".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        tracing::debug!(id, method, url = %self.url, "sending SSE tool server request");
        let work = async {
            let response = self.post(&req).send().await.map_err(classify_reqwest)?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Http {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            Self::read_reply(response, id).await
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let work = async {
            let response = self.post(&notif).send().await.map_err(classify_reqwest)?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Http {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            Ok(())
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"id\":1}\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"id\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_multiple_events() {
        let mut buf = String::from("data: first\n\ndata: second\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["first", "second"]);
    }

    #[test]
    fn drain_partial_event_stays_buffered() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        assert_eq!(drain_data_lines(&mut buf), vec!["complete"]);
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn drain_ignores_non_data_lines() {
        let mut buf = String::from("event: ping\nid: 42\nretry: 5000\ndata: payload\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["payload"]);
    }

    #[test]
    fn drain_skips_empty_data() {
        let mut buf = String::from("data: \n\n");
        assert!(drain_data_lines(&mut buf).is_empty());
    }

    #[test]
    fn drain_incremental_buffering() {
        let mut buf = String::from("data: chunk1");
        assert!(drain_data_lines(&mut buf).is_empty());
        buf.push_str("\n\ndata: chunk2\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["chunk1", "chunk2"]);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn http_transport_rejects_after_shutdown() {
        let transport = HttpTransport::new(
            "http://127.0.0.1:9/rpc",
            HashMap::new(),
            Duration::from_secs(1),
        )
        .unwrap();
        transport.shutdown().await;
        assert!(!transport.is_alive());
        let err = transport.send_request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn http_transport_connection_refused_is_transient() {
        // Port 9 (discard) is almost never listening; connection is refused
        // immediately rather than timing out.
        let transport = HttpTransport::new(
            "http://127.0.0.1:9/rpc",
            HashMap::new(),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = transport.send_request("tools/list", None).await.unwrap_err();
        let domain: tb_domain::Error = err.into();
        assert!(domain.is_retryable());
    }
}
