use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

/// Boundary to the capture-inspection backend. One logical request, one
/// response; callers decide whether a failure is fatal.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn call(&self, tool: &str, arguments: Value) -> anyhow::Result<Value>;
}

/// One-shot WebSocket client: a fresh connection per call, a single JSON
/// envelope out, a single JSON message back, then close. The envelope
/// carries a generated request id so a multiplexing client could correlate
/// responses over a shared connection without changing this contract.
#[derive(Clone)]
pub struct WsToolClient {
    endpoint: String,
}

impl WsToolClient {
    /// `addr` is a bare `host:port`.
    pub fn new(addr: &str) -> Self {
        Self { endpoint: format!("ws://{addr}") }
    }
}

#[async_trait]
impl ToolBackend for WsToolClient {
    async fn call(&self, tool: &str, arguments: Value) -> anyhow::Result<Value> {
        let (mut socket, _) = connect_async(self.endpoint.as_str()).await?;
        let envelope = json!({
            "id": Uuid::new_v4().to_string(),
            "tool": tool,
            "arguments": arguments,
        });
        socket.send(WsMessage::Text(envelope.to_string())).await?;

        let response = loop {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => break serde_json::from_str::<Value>(&text)?,
                Some(Ok(WsMessage::Binary(bytes))) => {
                    break serde_json::from_slice::<Value>(&bytes)?;
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => {
                    anyhow::bail!("tool backend closed the connection without a response")
                }
                Some(Err(err)) => return Err(err.into()),
            }
        };
        let _ = socket.close(None).await;
        Ok(response)
    }
}
