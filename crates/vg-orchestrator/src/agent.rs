//! HTTP client for the remote metrics agent
//!
//! The agent listens on the remote loopback and is only reached through the
//! local forward, so every URL here is `http://127.0.0.1:<ephemeral>`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Path of the one-shot snapshot endpoint
pub const SNAPSHOT_PATH: &str = "/stats";

/// Path of the streaming endpoint
pub const STREAM_PATH: &str = "/stats/stream";

/// Agent request failures
#[derive(Debug, Error)]
pub enum AgentError {
    /// Nothing answered on the forwarded port
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    /// The request timed out
    #[error("Agent request timed out")]
    Timeout,

    /// The agent answered with an error status
    #[error("Agent returned HTTP {0}")]
    Status(u16),

    /// The body was not the expected JSON
    #[error("Invalid agent response: {0}")]
    InvalidResponse(String),
}

/// Talks to the agent behind a local forward
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Fetch one statistics snapshot
    async fn fetch_snapshot(&self, base_url: &str) -> Result<Value, AgentError>;

    /// Stream statistics into `sink` until the stream ends or fails.
    ///
    /// Returns `Ok(())` when the agent closes the stream or `sink` is
    /// dropped.
    async fn stream(&self, base_url: &str, sink: mpsc::Sender<Value>) -> Result<(), AgentError>;
}

/// `reqwest` implementation of [`AgentClient`]
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpAgentClient {
    /// Create a client with the given per-request timeout for snapshots
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            request_timeout,
        }
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn fetch_snapshot(&self, base_url: &str) -> Result<Value, AgentError> {
        let url = endpoint(base_url, SNAPSHOT_PATH);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))
    }

    async fn stream(&self, base_url: &str, sink: mpsc::Sender<Value>) -> Result<(), AgentError> {
        let url = endpoint(base_url, STREAM_PATH);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status(status.as_u16()));
        }

        let mut parser = DataLineParser::default();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| classify_reqwest_error(&e))?;
            for payload in parser.push(&chunk) {
                let value = match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::debug!("Skipping malformed stream event: {}", e);
                        continue;
                    }
                };
                if sink.send(value).await.is_err() {
                    return Ok(());
                }
            }
        }
        tracing::debug!("Agent stream at {} ended", url);
        Ok(())
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn classify_reqwest_error(err: &reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        // The forward accepts and then drops the connection when the agent
        // port is closed, which surfaces as a request or body error.
        AgentError::Unreachable(err.to_string())
    } else {
        AgentError::InvalidResponse(err.to_string())
    }
}

/// Incremental parser for `data:` framed event streams.
///
/// Consecutive `data:` lines are joined with `\n`; a blank line ends an
/// event. Other fields and comments are ignored.
#[derive(Debug, Default)]
struct DataLineParser {
    line: Vec<u8>,
    data: Vec<String>,
}

impl DataLineParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            // A chunk may end inside a UTF-8 sequence; decode whole lines only
            let raw = std::mem::take(&mut self.line);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_joins_data_lines() {
        let mut parser = DataLineParser::default();
        let events = parser.push(b"data: {\"cpu\":\ndata: 1}\n\n");
        assert_eq!(events, vec!["{\"cpu\":\n1}"]);
    }

    #[test]
    fn test_parser_handles_split_chunks_and_crlf() {
        let mut parser = DataLineParser::default();
        assert!(parser.push(b"data: {\"a\"").is_empty());
        assert!(parser.push(b":1}\r\n").is_empty());
        assert_eq!(parser.push(b"\r\n"), vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_parser_ignores_comments_and_other_fields() {
        let mut parser = DataLineParser::default();
        let events = parser.push(b": keepalive\nevent: stats\nid: 7\ndata:2\n\n\n");
        assert_eq!(events, vec!["2"]);
    }

    #[test]
    fn test_parser_keeps_multibyte_split_across_chunks() {
        let mut parser = DataLineParser::default();
        let text = "data: \"h\u{e9}\"\n\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xc3).unwrap() + 1;
        assert!(parser.push(&text[..split]).is_empty());
        assert_eq!(parser.push(&text[split..]), vec!["\"h\u{e9}\""]);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        assert_eq!(
            endpoint("http://127.0.0.1:4000/", SNAPSHOT_PATH),
            "http://127.0.0.1:4000/stats"
        );
    }
}
