//! JSON-RPC client for the signal-cli daemon.
//!
//! The daemon speaks newline-delimited JSON-RPC 2.0 over TCP. One-shot
//! calls open a fresh connection per request; the subscription holds a
//! single long-lived connection and streams inbound envelopes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Fixed request id of the subscription handshake. The daemon echoes it
/// back once as an acknowledgment before the event stream begins.
const SUBSCRIBE_ID: &str = "subscribe";

const READ_CHUNK_SIZE: usize = 4096;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_number: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data_message: Option<DataMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub group_info: Option<GroupInfo>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub number: Option<String>,
}

impl Envelope {
    /// Sender identifier used for dedup keys and quote attribution.
    pub fn sender_number(&self) -> Option<&str> {
        self.source
            .as_deref()
            .or(self.source_number.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Display name for the history window, falling back to the number.
    pub fn sender_name(&self) -> &str {
        self.source_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.sender_number())
            .unwrap_or("Unknown")
    }

    pub fn group_id(&self) -> Option<&str> {
        self.data_message
            .as_ref()?
            .group_info
            .as_ref()?
            .group_id
            .as_deref()
    }

    pub fn mentions_number(&self, number: &str) -> bool {
        self.data_message
            .as_ref()
            .map(|dm| {
                dm.mentions
                    .iter()
                    .any(|m| m.number.as_deref() == Some(number))
            })
            .unwrap_or(false)
    }
}

/// Quote attached to an outbound reply.
#[derive(Debug, Clone)]
pub struct Quote {
    pub timestamp: i64,
    pub author: String,
}

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Reassembles newline-delimited frames from arbitrary socket chunks.
/// Bytes accumulate until a `\n` is seen; a partial tail stays buffered
/// so mid-object boundaries never reach the JSON parser.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete line (without the delimiter), if any.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

/// One parsed subscription frame.
#[derive(Debug)]
pub enum Frame {
    /// Acknowledgment of our own `subscribeReceive` request.
    Ack,
    /// An inbound messaging event.
    Event(Envelope),
    /// Valid JSON that carries no envelope (receipts, sync noise).
    Other,
}

/// Classify one complete line from the subscription stream.
pub fn parse_frame(line: &[u8]) -> Result<Frame> {
    let value: Value = serde_json::from_slice(line).context("non-JSON frame")?;

    if value.get("id").and_then(Value::as_str) == Some(SUBSCRIBE_ID) {
        return Ok(Frame::Ack);
    }

    match value.pointer("/params/envelope") {
        Some(envelope) => {
            let envelope: Envelope =
                serde_json::from_value(envelope.clone()).context("malformed envelope")?;
            Ok(Frame::Event(envelope))
        }
        None => Ok(Frame::Other),
    }
}

fn build_request(method: &str, params: Value, id: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    })
}

fn request_id() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Transport client for the daemon. Cheap to clone; one-shot calls are
/// stateless so clones can be shared freely between tasks.
#[derive(Debug, Clone)]
pub struct SignalClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl SignalClient {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    fn addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// One-shot JSON-RPC call: fresh connection, one request line, one
    /// response line, bounded by the default daemon timeout. Returns the
    /// `result` value; an `error` key or a missing `result` is a failure.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let response = tokio::time::timeout(timeout, self.round_trip(method, params))
            .await
            .with_context(|| format!("JSON-RPC call '{}' timed out", method))??;

        if let Some(error) = response.get("error") {
            anyhow::bail!("daemon returned error for '{}': {}", method, error);
        }
        response
            .get("result")
            .cloned()
            .with_context(|| format!("daemon response for '{}' has no result", method))
    }

    async fn round_trip(&self, method: &str, params: Value) -> Result<Value> {
        let mut stream = TcpStream::connect(self.addr())
            .await
            .with_context(|| format!("failed to connect to daemon at {}:{}", self.host, self.port))?;

        let request = build_request(method, params, &request_id());
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        stream.write_all(&payload).await.context("write request")?;

        let mut frame = FrameBuffer::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(line) = frame.next_line() {
                return serde_json::from_slice(&line).context("malformed daemon response");
            }
            let n = stream.read(&mut chunk).await.context("read response")?;
            if n == 0 {
                anyhow::bail!("daemon closed connection before responding to '{}'", method);
            }
            frame.extend(&chunk[..n]);
        }
    }

    /// Flush pending messages with a one-shot `receive`. Issued once at
    /// startup; slower than regular calls, so it gets its own 30 s bound.
    pub async fn flush_receive(&self) -> Result<()> {
        self.call_with_timeout("receive", json!({}), Duration::from_secs(30))
            .await?;
        Ok(())
    }

    /// Open the long-lived event stream. The returned handle yields
    /// envelopes until the daemon closes the connection.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let mut stream = TcpStream::connect(self.addr())
            .await
            .with_context(|| format!("failed to connect to daemon at {}:{}", self.host, self.port))?;

        let request = build_request("subscribeReceive", json!({}), SUBSCRIBE_ID);
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        stream
            .write_all(&payload)
            .await
            .context("write subscribe request")?;

        tracing::info!("Connected to signal-cli daemon at {}:{}", self.host, self.port);

        Ok(Subscription {
            stream,
            frame: FrameBuffer::new(),
        })
    }
}

#[async_trait]
impl Outbound for SignalClient {
    async fn send_message(&self, group_id: &str, message: &str, quote: Option<Quote>) -> Result<()> {
        let mut params = json!({
            "groupId": group_id,
            "message": message,
        });
        if let Some(quote) = quote {
            params["quote-timestamp"] = json!(quote.timestamp);
            params["quote-author"] = json!(quote.author);
        }

        self.call("send", params).await?;
        tracing::info!("Sent message");
        Ok(())
    }

    async fn create_poll(&self, group_id: &str, question: &str, options: &[String]) -> Result<()> {
        let params = json!({
            "groupId": group_id,
            "question": question,
            "options": options,
        });

        self.call("sendPollCreate", params).await?;
        tracing::info!("Sent poll: {}", question);
        Ok(())
    }
}

/// Outbound side of the daemon protocol. The responder and the poll
/// ledger only depend on this seam, so tests can swap in a recorder.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_message(&self, group_id: &str, message: &str, quote: Option<Quote>) -> Result<()>;

    async fn create_poll(&self, group_id: &str, question: &str, options: &[String]) -> Result<()>;
}

// ─── Subscription stream ─────────────────────────────────────────────────────

/// Handle over the long-lived `subscribeReceive` connection.
pub struct Subscription {
    stream: TcpStream,
    frame: FrameBuffer,
}

impl Subscription {
    /// Next inbound envelope. `Ok(None)` means the daemon closed the
    /// stream; the orchestrator decides whether to reconnect. Malformed
    /// lines and non-event frames are logged and skipped, never fatal.
    pub async fn next_event(&mut self) -> Result<Option<Envelope>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            while let Some(line) = self.frame.next_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match parse_frame(&line) {
                    Ok(Frame::Ack) => tracing::info!("Subscription confirmed"),
                    Ok(Frame::Event(envelope)) => return Ok(Some(envelope)),
                    Ok(Frame::Other) => {}
                    Err(e) => {
                        tracing::warn!(
                            "Dropping unparseable frame ({}): {:?}",
                            e,
                            String::from_utf8_lossy(&line[..line.len().min(100)])
                        );
                    }
                }
            }

            let n = self
                .stream
                .read(&mut chunk)
                .await
                .context("read from subscription stream")?;
            if n == 0 {
                tracing::warn!("Connection closed by daemon");
                return Ok(None);
            }
            self.frame.extend(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_frames(chunks: &[&[u8]]) -> Vec<String> {
        let mut frame = FrameBuffer::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            frame.extend(chunk);
            while let Some(line) = frame.next_line() {
                lines.push(String::from_utf8(line).expect("utf-8 line"));
            }
        }
        lines
    }

    #[test]
    fn framing_is_invariant_under_chunk_boundaries() {
        let stream = b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n";

        let whole = collect_frames(&[stream.as_slice()]);
        assert_eq!(whole, vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);

        // Split mid-object at every possible position.
        for split in 1..stream.len() {
            let parts = [&stream[..split], &stream[split..]];
            assert_eq!(collect_frames(&parts), whole, "split at byte {}", split);
        }
    }

    #[test]
    fn partial_tail_stays_buffered() {
        let mut frame = FrameBuffer::new();
        frame.extend(b"{\"incom");
        assert!(frame.next_line().is_none());
        frame.extend(b"plete\":true}\n");
        assert_eq!(frame.next_line().expect("line"), b"{\"incomplete\":true}");
        assert!(frame.next_line().is_none());
    }

    #[test]
    fn multiple_objects_in_one_chunk() {
        let lines = collect_frames(&[b"{\"a\":1}\n{\"b\":2}\ntail"]);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn subscription_ack_is_not_an_event() {
        let frame = parse_frame(br#"{"jsonrpc":"2.0","id":"subscribe","result":{}}"#)
            .expect("parse ack");
        assert!(matches!(frame, Frame::Ack));
    }

    #[test]
    fn event_frame_parses_envelope() {
        let line = br#"{"jsonrpc":"2.0","method":"receive","params":{"envelope":{
            "source":"+4917612345678",
            "sourceName":"Alice",
            "timestamp":1709290000123,
            "dataMessage":{
                "message":"hallo @Marvin",
                "groupInfo":{"groupId":"grp1"},
                "mentions":[{"number":"+4915500000000","start":6,"length":1}]
            }}}}"#;
        let frame = parse_frame(line).expect("parse event");
        let Frame::Event(envelope) = frame else {
            panic!("expected event frame");
        };
        assert_eq!(envelope.sender_number(), Some("+4917612345678"));
        assert_eq!(envelope.sender_name(), "Alice");
        assert_eq!(envelope.timestamp, 1709290000123);
        assert_eq!(envelope.group_id(), Some("grp1"));
        assert!(envelope.mentions_number("+4915500000000"));
        assert!(!envelope.mentions_number("+4915511111111"));
    }

    #[test]
    fn frame_without_envelope_is_other() {
        let frame = parse_frame(br#"{"jsonrpc":"2.0","method":"receive","params":{}}"#)
            .expect("parse frame");
        assert!(matches!(frame, Frame::Other));
    }

    #[test]
    fn non_json_line_is_an_error() {
        assert!(parse_frame(b"definitely not json").is_err());
    }

    #[test]
    fn request_has_jsonrpc_fields() {
        let request = build_request("send", json!({"groupId": "g"}), "1709290000123");
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "send");
        assert_eq!(request["params"]["groupId"], "g");
        assert_eq!(request["id"], "1709290000123");
    }

    #[test]
    fn sender_name_falls_back_to_number_then_unknown() {
        let envelope = Envelope {
            source: Some("+491111".to_string()),
            ..Default::default()
        };
        assert_eq!(envelope.sender_name(), "+491111");
        assert_eq!(Envelope::default().sender_name(), "Unknown");
    }
}
