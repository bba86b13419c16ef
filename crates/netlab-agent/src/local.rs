//! In-process [`Channel`] straight onto an [`Agent`], used for single-host
//! runs and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use netlab_common::channel::Channel;
use netlab_common::error::RemoteError;
use netlab_common::protocol::{AgentEvent, Request};

use crate::handler::Agent;

pub struct LocalChannel {
    agent: Arc<Agent>,
    closed: AtomicBool,
}

impl LocalChannel {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            closed: AtomicBool::new(false),
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn call(&self, request: Request) -> Result<serde_json::Value, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("channel closed"));
        }
        // Round-trip through JSON so local calls see exactly what the wire
        // would carry.
        let request: Request = serde_json::from_value(
            serde_json::to_value(&request)
                .map_err(|e| RemoteError::transport(format!("encode: {e}")))?,
        )
        .map_err(|e| RemoteError::transport(format!("decode: {e}")))?;
        self.agent.handle(request).await.into_result()
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.agent.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
