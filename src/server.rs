//! HTTP surface: the subscriber WebSocket plus health and metrics.
//!
//! | Path | Description |
//! |------|-------------|
//! | `/ws?id=<correlation>` | Subscriber stream of JSON frames |
//! | `/status` | Current hub status as JSON |
//! | `/metrics` | Prometheus text |
//! | `/health` | Liveness probe |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::future::BoxFuture;
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use crate::hub::{FanoutHub, FrameSink, HubError, OutFrame, run_keepalive};
use crate::metrics::{CONTENT_TYPE, format_prometheus_metrics};
use crate::stats::PipelineStats;

/// Shared state passed to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: FanoutHub,
    pub stats: Arc<PipelineStats>,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    id: Option<String>,
}

/// Build the router with all endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind `addr` and serve until the shutdown signal flips.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    serve_on(listener, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.status())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let output = format_prometheus_metrics(
        &state.stats.summary(),
        &state.hub.status(),
        &state.hub.throughput().rates(),
    );
    (StatusCode::OK, [("content-type", CONTENT_TYPE)], output)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let correlation = params.id.filter(|id| !id.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, correlation, state.hub))
}

/// Write half of a subscriber WebSocket.
struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

impl FrameSink for WsSink {
    fn send(&mut self, frame: OutFrame) -> BoxFuture<'_, Result<(), HubError>> {
        let message = match frame {
            OutFrame::Text(text) => Message::Text(text.to_string().into()),
            OutFrame::Ping => Message::Ping(Bytes::new()),
        };
        async move {
            self.sender
                .send(message)
                .await
                .map_err(|e| HubError::Transport(e.to_string()))
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            let _ = self.sender.close().await;
        }
        .boxed()
    }
}

/// Drive one subscriber connection until the client leaves or the hub
/// drops it.
async fn handle_socket(socket: WebSocket, correlation: Option<String>, hub: FanoutHub) {
    let (sender, mut receiver) = socket.split();
    let subscriber = hub.register(Box::new(WsSink { sender }), correlation);
    let pongs = Arc::new(Notify::new());

    let greeter = {
        let hub = hub.clone();
        let subscriber = Arc::clone(&subscriber);
        tokio::spawn(async move {
            if let Err(e) = hub.greet(&subscriber).await {
                debug!("Greeting subscriber {} failed: {}", subscriber.id(), e);
            }
        })
    };
    let keepalive = tokio::spawn(run_keepalive(
        hub.clone(),
        Arc::clone(&subscriber),
        Arc::clone(&pongs),
    ));

    let mut removed = subscriber.on_removed();
    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Pong(_))) => pongs.notify_one(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = removed.changed() => break,
        }
    }

    greeter.abort();
    keepalive.abort();
    hub.remove(subscriber.id()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;

    async fn start() -> (String, watch::Sender<bool>) {
        let stats = Arc::new(PipelineStats::new());
        let hub = FanoutHub::new(
            HubConfig::default(),
            Arc::clone(&stats),
            None,
            vec!["20m".to_string()],
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve_on(listener, AppState { hub, stats }, rx));
        (base, tx)
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (base, _shutdown) = start().await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "OK");

        let status: serde_json::Value = client
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["subscribers"], 0);
        assert_eq!(status["skimmer_connected"], false);
        assert_eq!(status["bands"][0], "20m");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (base, _shutdown) = start().await;
        let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let body = response.text().await.unwrap();
        assert!(body.contains("spot_relay_subscribers 0"));
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let (base, _shutdown) = start().await;
        let response = reqwest::get(format!("{}/ws?id=tab-1", base)).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
