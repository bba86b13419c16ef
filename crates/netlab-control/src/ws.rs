//! WebSocket client side of the agent command channel.
//!
//! One socket per machine. Requests are tagged with a fresh id and parked in
//! a pending table until the matching `reply` frame arrives; `event` frames
//! are fanned out to every subscriber.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use netlab_common::channel::Channel;
use netlab_common::error::RemoteError;
use netlab_common::ids;
use netlab_common::protocol::{AgentEvent, Frame, Reply, Request};

use crate::error::ControllerError;
use crate::pool::{Connector, PoolEntry};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct WsChannel {
    url: String,
    outgoing: mpsc::Sender<String>,
    pending: Arc<DashMap<String, oneshot::Sender<Reply>>>,
    events: broadcast::Sender<AgentEvent>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    call_timeout: Duration,
}

impl WsChannel {
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, ControllerError> {
        let connect_err = |reason: String| ControllerError::Connect {
            addr: url.to_string(),
            reason,
        };
        let (ws, _response) = tokio::time::timeout(
            connect_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await
        .map_err(|_| connect_err("timed out".into()))?
        .map_err(|e| connect_err(e.to_string()))?;
        tracing::info!(url = %url, "agent connected");

        let (outgoing, outgoing_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_socket(
            url.to_string(),
            ws,
            outgoing_rx,
            shutdown_rx,
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));

        Ok(Self {
            url: url.to_string(),
            outgoing,
            pending,
            events,
            closed,
            shutdown,
            call_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn call(&self, request: Request) -> Result<serde_json::Value, RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::transport("channel closed"));
        }
        let id = ids::request_id();
        let frame = Frame::Request {
            id: id.clone(),
            request,
        };
        let json = serde_json::to_string(&frame)
            .map_err(|e| RemoteError::transport(format!("encode: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        // The socket task may have finished between the check above and the
        // insert, in which case nobody will ever answer.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(RemoteError::transport("channel closed"));
        }
        if self.outgoing.send(json).await.is_err() {
            self.pending.remove(&id);
            return Err(RemoteError::transport("agent disconnected"));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(RemoteError::transport("agent disconnected")),
            Err(_) => {
                self.pending.remove(&id);
                Err(RemoteError::transport("request timed out"))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

async fn run_socket<S>(
    url: String,
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut outgoing: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    pending: Arc<DashMap<String, oneshot::Sender<Reply>>>,
    events: broadcast::Sender<AgentEvent>,
    closed: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_frame(&text, &pending, &events),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(url = %url, "agent closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(url = %url, error = %e, "WebSocket read error");
                        break;
                    }
                    _ => {}
                }
            }

            msg = outgoing.recv() => {
                let Some(text) = msg else { break };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    tracing::warn!(url = %url, error = %e, "WebSocket write error");
                    break;
                }
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiting caller with a disconnect.
    pending.clear();
}

fn dispatch_frame(
    text: &str,
    pending: &DashMap<String, oneshot::Sender<Reply>>,
    events: &broadcast::Sender<AgentEvent>,
) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "invalid frame from agent");
            return;
        }
    };
    match frame {
        Frame::Reply { id, reply } => match pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(id = %id, "reply for unknown or expired request"),
        },
        Frame::Event { event, .. } => {
            let _ = events.send(event);
        }
        Frame::Request { .. } => tracing::debug!("ignoring request frame from agent"),
    }
}

/// Opens [`WsChannel`]s to pool machines (`ws://<hostname>:<port>/ws`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, entry: &PoolEntry) -> Result<Arc<dyn Channel>, ControllerError> {
        let url = format!("ws://{}:{}/ws", entry.hostname, entry.port);
        let channel = WsChannel::connect(&url, self.connect_timeout, self.call_timeout).await?;
        Ok(Arc::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_common::error::RemoteErrorKind;

    #[test]
    fn replies_resolve_pending_requests() {
        let pending = DashMap::new();
        let (events, mut events_rx) = broadcast::channel(4);
        let (tx, mut rx) = oneshot::channel();
        pending.insert("req_1".to_string(), tx);

        let reply = Frame::Reply {
            id: "req_1".into(),
            reply: Reply::ok(7),
        };
        dispatch_frame(&serde_json::to_string(&reply).unwrap(), &pending, &events);
        assert!(pending.is_empty());
        assert_eq!(rx.try_recv().unwrap().into_result().unwrap(), serde_json::json!(7));

        let event = Frame::event(AgentEvent::DevDeleted { if_index: 3 });
        dispatch_frame(&serde_json::to_string(&event).unwrap(), &pending, &events);
        assert_eq!(events_rx.try_recv().unwrap(), AgentEvent::DevDeleted { if_index: 3 });
    }

    #[test]
    fn stray_replies_and_garbage_are_ignored() {
        let pending: DashMap<String, oneshot::Sender<Reply>> = DashMap::new();
        let (events, _) = broadcast::channel(4);
        let stray = Frame::Reply {
            id: "req_gone".into(),
            reply: Reply::err(RemoteError::new(RemoteErrorKind::Other, "late")),
        };
        dispatch_frame(&serde_json::to_string(&stray).unwrap(), &pending, &events);
        dispatch_frame("{not json", &pending, &events);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unreachable_agent_fails_to_connect() {
        let err = WsChannel::connect(
            "ws://127.0.0.1:1/ws",
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ControllerError::Connect { .. }));
    }
}
