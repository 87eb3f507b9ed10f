use super::error::ToolInvokeError;
use super::interface::ToolClient;
use super::protocol::{
    CallToolResult, InboundMessage, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcReply, JsonRpcRequest, ToolsListResult, error_codes, read_line_lossy,
};
use super::supervisor::StdioTransport;
use crate::constants::{PROTOCOL_VERSION, REQUEST_TIMEOUT, SHUTDOWN_REQUEST_TIMEOUT};
use crate::domain::types::{FailureKind, ToolCallOutcome, ToolContent, ToolDescriptor};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_TOOL_PAGES: usize = 32;

type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;
type Responder = oneshot::Sender<Result<Value, ToolInvokeError>>;

/// JSON-RPC client bound to one tool server's stdio.
#[derive(Clone)]
pub struct ToolProtocolClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    server_id: String,
    writer: AsyncMutex<Option<BoxedWriter>>,
    pending: AsyncMutex<HashMap<String, Responder>>,
    id_counter: AtomicU64,
    connected: AtomicBool,
    request_timeout: Duration,
    instructions: AsyncMutex<Option<String>>,
    tool_cache: AsyncMutex<Option<Vec<ToolDescriptor>>>,
}

impl ToolProtocolClient {
    /// Take over a started server's pipes and perform the `initialize` handshake.
    pub async fn connect(
        server_id: impl Into<String>,
        transport: StdioTransport,
    ) -> Result<Self, ToolInvokeError> {
        Self::connect_io(server_id, transport.stdout, transport.stdin, REQUEST_TIMEOUT).await
    }

    /// Handshake over arbitrary byte streams.
    pub async fn connect_io<R, W>(
        server_id: impl Into<String>,
        reader: R,
        writer: W,
        request_timeout: Duration,
    ) -> Result<Self, ToolInvokeError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let inner = Arc::new(ClientInner {
            server_id: server_id.into(),
            writer: AsyncMutex::new(Some(BufWriter::new(writer))),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            request_timeout,
            instructions: AsyncMutex::new(None),
            tool_cache: AsyncMutex::new(None),
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(reader).await;
        });

        if let Err(err) = inner.initialize_sequence().await {
            inner.close().await;
            return Err(err);
        }
        Ok(Self { inner })
    }

}

#[async_trait]
impl ToolClient for ToolProtocolClient {
    fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn list_tools(&self, use_cache: bool) -> Vec<ToolDescriptor> {
        if use_cache && let Some(cached) = self.inner.tool_cache.lock().await.clone() {
            return cached;
        }
        match self.inner.fetch_tools().await {
            Ok(tools) => {
                *self.inner.tool_cache.lock().await = Some(tools.clone());
                tools
            }
            Err(err) => {
                warn!(server = %self.inner.server_id, %err, "Failed to list tools");
                Vec::new()
            }
        }
    }

    async fn call_tool(&self, tool_name: &str, arguments: Map<String, Value>) -> ToolCallOutcome {
        if !self.is_connected() {
            return ToolInvokeError::NotRunning {
                server: self.inner.server_id.clone(),
            }
            .into_outcome(tool_name);
        }

        let known = self
            .list_tools(true)
            .await
            .iter()
            .any(|tool| tool.name == tool_name);
        if !known {
            return ToolCallOutcome::failure(
                tool_name,
                FailureKind::UnknownTool,
                format!(
                    "server '{}' does not provide a tool named '{tool_name}'",
                    self.inner.server_id
                ),
            );
        }

        debug!(server = %self.inner.server_id, tool = tool_name, "Calling tool");
        let params = json!({ "name": tool_name, "arguments": arguments });
        let result = match self.inner.send_request("tools/call", params).await {
            Ok(result) => result,
            Err(err) => {
                warn!(server = %self.inner.server_id, tool = tool_name, %err, "Tool call failed");
                return err.into_outcome(tool_name);
            }
        };

        let parsed: CallToolResult = match serde_json::from_value(result) {
            Ok(parsed) => parsed,
            Err(source) => {
                return ToolInvokeError::InvalidJson {
                    server: self.inner.server_id.clone(),
                    source,
                }
                .into_outcome(tool_name);
            }
        };

        if parsed.is_error {
            let reason = reported_reason(&parsed.into_contents());
            return ToolCallOutcome::failure(tool_name, FailureKind::ToolReported, reason);
        }
        ToolCallOutcome::Success {
            tool_name: tool_name.to_string(),
            server_id: self.inner.server_id.clone(),
            result: parsed.into_contents(),
        }
    }

    async fn instructions(&self) -> Option<String> {
        self.inner.instructions.lock().await.clone()
    }

    async fn shutdown(&self) {
        if !self.is_connected() {
            return;
        }
        let request = self.inner.send_request("shutdown", json!({}));
        match tokio::time::timeout(SHUTDOWN_REQUEST_TIMEOUT, request).await {
            Ok(Ok(_)) => debug!(server = %self.inner.server_id, "Server acknowledged shutdown"),
            Ok(Err(err)) => debug!(server = %self.inner.server_id, %err, "Shutdown request rejected"),
            Err(_) => debug!(server = %self.inner.server_id, "Shutdown request timed out"),
        }
        self.inner.close().await;
    }
}

fn reported_reason(contents: &[ToolContent]) -> String {
    let text = contents
        .iter()
        .map(ToolContent::render)
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        "tool reported an error".to_string()
    } else {
        text
    }
}

impl ClientInner {
    async fn initialize_sequence(&self) -> Result<(), ToolInvokeError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let result = self.send_request("initialize", params).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|source| ToolInvokeError::InvalidJson {
                server: self.server_id.clone(),
                source,
            })?;
        info!(
            server = %self.server_id,
            protocol = init.protocol_version.as_deref().unwrap_or("unspecified"),
            "Tool server initialised"
        );
        *self.instructions.lock().await = init.instructions;
        self.write_message(&JsonRpcNotification::new("notifications/initialized", json!({})))
            .await
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>, ToolInvokeError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.send_request("tools/list", params).await?;
            let mut page: ToolsListResult =
                serde_json::from_value(result).map_err(|source| ToolInvokeError::InvalidJson {
                    server: self.server_id.clone(),
                    source,
                })?;
            cursor = page.next_cursor.take();
            tools.extend(page.into_descriptors(&self.server_id));
            if cursor.is_none() {
                break;
            }
        }
        debug!(server = %self.server_id, count = tools.len(), "Fetched tool descriptors");
        Ok(tools)
    }

    async fn reader_loop<R>(self: Arc<Self>, stdout: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            let raw = match read_line_lossy(&mut reader, &mut buf).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(err) => {
                    warn!(server = %self.server_id, %err, "Reading tool server stdout failed");
                    break;
                }
            };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('\u{1b}') {
                debug!(server = %self.server_id, line = trimmed, "Skipping ANSI log line on stdout");
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => self.dispatch(InboundMessage::classify(value)).await,
                Err(err) => {
                    warn!(server = %self.server_id, line = trimmed, %err, "Received invalid JSON from tool server");
                }
            }
        }

        debug!(server = %self.server_id, "Tool server stdout closed");
        self.close().await;
    }

    async fn dispatch(&self, message: InboundMessage) {
        match message {
            InboundMessage::Response { id, outcome } => {
                let responder = self.pending.lock().await.remove(&id);
                let Some(sender) = responder else {
                    debug!(server = %self.server_id, response_id = %id, "Response for unknown request");
                    return;
                };
                let _ = sender.send(outcome.map_err(|JsonRpcError { code, message }| {
                    ToolInvokeError::Rpc {
                        server: self.server_id.clone(),
                        code,
                        message,
                    }
                }));
            }
            InboundMessage::Request { id, method } => {
                let reply = if method == "ping" {
                    JsonRpcReply::result(id, json!({}))
                } else {
                    warn!(server = %self.server_id, method = %method, "Server sent unsupported request");
                    JsonRpcReply::error(
                        id,
                        error_codes::METHOD_NOT_FOUND,
                        format!("client does not implement method '{method}'"),
                    )
                };
                if let Err(err) = self.write_message(&reply).await {
                    warn!(server = %self.server_id, %err, "Failed to answer server request");
                }
            }
            InboundMessage::Notification { method } => {
                debug!(server = %self.server_id, method = %method, "Notification from server");
                if method == "notifications/tools/list_changed" {
                    self.tool_cache.lock().await.take();
                }
            }
            InboundMessage::Unrecognised => {
                debug!(server = %self.server_id, "Ignoring message without id or method");
            }
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ToolInvokeError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(err) = self.write_message(&JsonRpcRequest::new(&id, method, params)).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolInvokeError::Terminated {
                server: self.server_id.clone(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolInvokeError::Timeout {
                    server: self.server_id.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), ToolInvokeError> {
        let mut encoded =
            serde_json::to_vec(message).map_err(|source| ToolInvokeError::InvalidJson {
                server: self.server_id.clone(),
                source,
            })?;
        encoded.push(b'\n');

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| ToolInvokeError::NotRunning {
            server: self.server_id.clone(),
        })?;
        let written = match stream.write_all(&encoded).await {
            Ok(()) => stream.flush().await,
            Err(err) => Err(err),
        };
        written.map_err(|err| ToolInvokeError::Transport {
            server: self.server_id.clone(),
            message: err.to_string(),
        })
    }

    /// Drop the writer, fail everything in flight and forget cached tools.
    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.fail_all_pending().await;
        self.tool_cache.lock().await.take();
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ToolInvokeError::Terminated {
                server: self.server_id.clone(),
            }));
        }
    }

    fn next_id(&self) -> String {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("req-{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, DuplexStream, ReadHalf, WriteHalf, duplex, split};

    /// In-process fake server: answers the handshake, lists four tools and
    /// serves `echo` / `explode` / `reject`. `noise` is written before every reply.
    async fn fake_server(stream: DuplexStream, noise: Option<&'static [u8]>) {
        let (read, mut write): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) = split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut list_calls = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).expect("client sends JSON");
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            let method = request["method"].as_str().unwrap_or_default().to_string();
            let reply = match method.as_str() {
                "initialize" => json!({"jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "instructions": "Paths are relative to /srv."
                }}),
                "tools/list" => {
                    list_calls += 1;
                    json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [
                        {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}},
                        {"name": "explode"},
                        {"name": "reject"},
                        {"name": format!("listed_{list_calls}")}
                    ]}})
                }
                "tools/call" => match request["params"]["name"].as_str() {
                    Some("echo") => json!({"jsonrpc": "2.0", "id": id, "result": {
                        "content": [{"type": "text", "text": request["params"]["arguments"]["text"]}]
                    }}),
                    Some("explode") => json!({"jsonrpc": "2.0", "id": id, "result": {
                        "content": [{"type": "text", "text": "disk on fire"}], "isError": true
                    }}),
                    _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32602, "message": "bad arguments"}}),
                },
                "shutdown" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
                _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "nope"}}),
            };
            let mut encoded = noise.map(<[u8]>::to_vec).unwrap_or_default();
            encoded.extend(serde_json::to_vec(&reply).expect("encode"));
            encoded.push(b'\n');
            if write.write_all(&encoded).await.is_err() {
                break;
            }
            if method == "shutdown" {
                break;
            }
        }
    }

    async fn connected_client() -> ToolProtocolClient {
        client_with_noise(None).await
    }

    async fn client_with_noise(noise: Option<&'static [u8]>) -> ToolProtocolClient {
        let (client_side, server_side) = duplex(64 * 1024);
        tokio::spawn(fake_server(server_side, noise));
        let (read, write) = split(client_side);
        ToolProtocolClient::connect_io("fs", read, write, Duration::from_secs(5))
            .await
            .expect("handshake")
    }

    fn args(text: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("text".into(), Value::String(text.into()));
        map
    }

    #[tokio::test]
    async fn handshake_records_instructions() {
        let client = connected_client().await;
        assert!(client.is_connected());
        assert_eq!(client.instructions().await.as_deref(), Some("Paths are relative to /srv."));
    }

    #[tokio::test]
    async fn list_tools_uses_cache_until_asked_not_to() {
        let client = connected_client().await;
        let first = client.list_tools(true).await;
        assert_eq!(first.len(), 4);
        assert_eq!(first[3].name, "listed_1");

        let cached = client.list_tools(true).await;
        assert_eq!(cached[3].name, "listed_1");

        let fresh = client.list_tools(false).await;
        assert_eq!(fresh[3].name, "listed_2");
    }

    #[tokio::test]
    async fn call_tool_maps_every_outcome() {
        let client = connected_client().await;

        let ok = client.call_tool("echo", args("hello")).await;
        assert_eq!(ok.result_text().as_deref(), Some("hello"));
        assert!(matches!(ok, ToolCallOutcome::Success { ref server_id, .. } if server_id == "fs"));

        let reported = client.call_tool("explode", Map::new()).await;
        assert_eq!(reported.failure_kind(), Some(FailureKind::ToolReported));
        assert!(reported.to_string().contains("disk on fire"));

        let rejected = client.call_tool("reject", Map::new()).await;
        assert_eq!(rejected.failure_kind(), Some(FailureKind::Protocol));
        assert!(rejected.to_string().contains("bad arguments"));

        let unknown = client.call_tool("format_disk", Map::new()).await;
        assert_eq!(unknown.failure_kind(), Some(FailureKind::UnknownTool));
    }

    #[tokio::test]
    async fn non_utf8_stdout_lines_are_skipped() {
        let client = client_with_noise(Some(b"log \xff\xfe caf\xe9\n")).await;

        let tools = client.list_tools(true).await;
        assert_eq!(tools.len(), 4);
        assert!(client.is_connected());

        let ok = client.call_tool("echo", args("still here")).await;
        assert_eq!(ok.result_text().as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn shutdown_closes_the_client() {
        let client = connected_client().await;
        client.shutdown().await;
        assert!(!client.is_connected());

        let outcome = client.call_tool("echo", args("late")).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::NotRunning));
    }

    #[tokio::test]
    async fn server_eof_fails_the_handshake() {
        let (client_side, server_side) = duplex(1024);
        drop(server_side);
        let (read, write) = split(client_side);
        let result = ToolProtocolClient::connect_io("gone", read, write, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(ToolInvokeError::Terminated { .. })
                | Err(ToolInvokeError::NotRunning { .. })
                | Err(ToolInvokeError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn unanswered_requests_time_out() {
        let (client_side, server_side) = duplex(1024);
        let (read, write) = split(client_side);
        let result =
            ToolProtocolClient::connect_io("mute", read, write, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ToolInvokeError::Timeout { ref method, .. }) if method == "initialize"));
        drop(server_side);
    }
}
