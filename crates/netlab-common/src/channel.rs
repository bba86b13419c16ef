//! Transport-agnostic command channel to one agent.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::error::RemoteError;
use crate::protocol::{AgentEvent, Request};

/// A request/reply channel to a single machine's agent, plus its event feed.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one request and wait for its reply.
    async fn call(&self, request: Request) -> Result<serde_json::Value, RemoteError>;

    /// Subscribe to events pushed by the agent.
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;

    /// Close the channel. Further calls fail with a transport error.
    async fn close(&self) {}
}

/// Call and decode the result into `T`.
pub async fn call_as<T: DeserializeOwned>(
    channel: &dyn Channel,
    request: Request,
) -> Result<T, RemoteError> {
    let method = request.method();
    let value = channel.call(request).await?;
    serde_json::from_value(value)
        .map_err(|e| RemoteError::other(format!("invalid {method} result: {e}")))
}
