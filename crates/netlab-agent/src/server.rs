//! WebSocket command server.
//!
//! Endpoint: GET /ws
//!
//! The controller sends `request` frames; each is handled on its own task
//! and answered with a `reply` frame carrying the same id. Agent events are
//! pushed as `event` frames for as long as the connection is open. The
//! interface the connection arrives on is disabled for its duration.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::connect_info::{ConnectInfo, Connected};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::serve::IncomingStream;
use futures::SinkExt;
use futures::stream::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};

use netlab_common::protocol::Frame;

use crate::handler::Agent;

/// Both ends of an accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnAddrs {
    pub local: Option<SocketAddr>,
    pub remote: SocketAddr,
}

impl Connected<IncomingStream<'_, TcpListener>> for ConnAddrs {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self {
            local: stream.io().local_addr().ok(),
            remote: *stream.remote_addr(),
        }
    }
}

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new().route("/ws", get(handler)).with_state(agent)
}

/// Serve until `shutdown` flips to true.
pub async fn serve(
    agent: Arc<Agent>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "command server listening");
    let app = router(agent).into_make_service_with_connect_info::<ConnAddrs>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

async fn handler(
    State(agent): State<Arc<Agent>>,
    ConnectInfo(addrs): ConnectInfo<ConnAddrs>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(agent, socket, addrs))
}

async fn handle_socket(agent: Arc<Agent>, socket: WebSocket, addrs: ConnAddrs) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::info!(remote = %addrs.remote, "controller connected");
    agent.set_control_address(addrs.local.map(|a| a.ip())).await;

    let mut events = agent.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(64);

    loop {
        let outgoing = tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&agent, &text, &reply_tx);
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive failed");
                        break;
                    }
                    _ => continue,
                }
            }
            frame = reply_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            ev = events.recv() => match ev {
                Ok(event) => Frame::event(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event frames dropped for slow controller");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let json = match serde_json::to_string(&outgoing) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode frame");
                continue;
            }
        };
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }

    agent.set_control_address(None).await;
    tracing::info!(remote = %addrs.remote, "controller disconnected");
}

fn handle_frame(agent: &Arc<Agent>, text: &str, reply_tx: &mpsc::Sender<Frame>) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed frame");
            return;
        }
    };
    let Frame::Request { id, request } = frame else {
        tracing::debug!("ignoring non-request frame");
        return;
    };

    let agent = agent.clone();
    let reply_tx = reply_tx.clone();
    tokio::spawn(async move {
        let reply = agent.handle(request).await;
        let _ = reply_tx.send(Frame::Reply { id, reply }).await;
    });
}
