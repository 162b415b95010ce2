//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use teleop_common::{new_registry, render, SceneConfig, SharedRegistry, TeleopMetrics};
use teleop_core::{ConnectionIo, Finished, OrchestratorError, SessionOrchestrator, TransportError};
use teleop_sim::PhysicsEngine;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::lease::EngineLease;

/// Close reason sent to an operator that connects while the engine is leased.
pub const BUSY_REASON: &str = "another operator is connected";

struct ServerState<P> {
    scene: Arc<SceneConfig>,
    lease: EngineLease<P>,
    metrics: TeleopMetrics,
    registry: SharedRegistry,
    stop: watch::Receiver<bool>,
    faults: watch::Sender<Option<String>>,
}

/// Builder for the operator-facing server.
pub struct TeleopServerBuilder<P> {
    scene: Arc<SceneConfig>,
    engine: P,
    listen: Option<SocketAddr>,
    registry: Option<SharedRegistry>,
}

impl<P: PhysicsEngine + 'static> TeleopServerBuilder<P> {
    pub fn new(scene: Arc<SceneConfig>, engine: P) -> Self {
        Self {
            scene,
            engine,
            listen: None,
            registry: None,
        }
    }

    /// Bind to `listen` instead of the scene's networking section.
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = Some(listen);
        self
    }

    /// Register metrics on an existing registry.
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind the listener and serve connections in the background.
    pub async fn spawn(self) -> anyhow::Result<TeleopServerHandle> {
        let listen = match self.listen {
            Some(listen) => listen,
            None => self.scene.networking.listen_addr()?,
        };
        let registry = self.registry.unwrap_or_else(new_registry);
        let metrics =
            TeleopMetrics::new(&registry).context("failed to register teleoperation metrics")?;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        let local_addr = listener.local_addr()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (fault_tx, fault_rx) = watch::channel(None);
        let ws_path = self.scene.networking.ws_path.clone();
        let metrics_path = self
            .scene
            .metrics
            .enabled
            .then(|| self.scene.metrics.path.clone());

        let state = Arc::new(ServerState {
            scene: self.scene,
            lease: EngineLease::new(self.engine),
            metrics,
            registry,
            stop: stop_rx,
            faults: fault_tx,
        });

        let mut router = Router::new().route(&ws_path, get(upgrade_handler::<P>));
        if let Some(path) = &metrics_path {
            router = router.route(path, get(metrics_handler::<P>));
        }
        let router = router.with_state(state);
        info!(
            address = %local_addr,
            ws_path = %ws_path,
            metrics_path = ?metrics_path,
            "teleoperation server listening"
        );

        let mut shutdown_rx = stop_tx.subscribe();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "teleoperation server exited with error");
            }
        });

        Ok(TeleopServerHandle {
            address: local_addr,
            stop: stop_tx,
            faults: fault_rx,
            task,
        })
    }
}

/// Handle for the running server.
pub struct TeleopServerHandle {
    address: SocketAddr,
    stop: watch::Sender<bool>,
    faults: watch::Receiver<Option<String>>,
    task: JoinHandle<()>,
}

impl TeleopServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Resolves once a physics fault has withdrawn the engine.
    ///
    /// Returns `None` if the server went away without a fault.
    pub async fn wait_for_fault(&self) -> Option<String> {
        let mut faults = self.faults.clone();
        let fault = faults.wait_for(Option::is_some).await.ok()?;
        (*fault).clone()
    }

    /// Close every session, stop accepting connections and wait for the listener to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.stop.send_replace(true);
        self.task.await.map_err(|err| anyhow::anyhow!(err))
    }
}

async fn upgrade_handler<P: PhysicsEngine + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState<P>>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

async fn metrics_handler<P: PhysicsEngine + 'static>(
    State(state): State<Arc<ServerState<P>>>,
) -> Response {
    match render(&state.registry) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn serve_connection<P: PhysicsEngine + 'static>(
    mut socket: WebSocket,
    state: Arc<ServerState<P>>,
) {
    let Some(engine) = state.lease.try_acquire() else {
        warn!("rejecting operator connection while another session holds the engine");
        let close = Message::Close(Some(CloseFrame {
            code: close_code::AGAIN,
            reason: BUSY_REASON.into(),
        }));
        let _ = socket.send(close).await;
        return;
    };
    info!("operator connection accepted");

    let (io, inbound_tx, outbound_rx) = ConnectionIo::channel();
    let (sink, stream) = socket.split();
    let reader = tokio::spawn(read_socket(stream, inbound_tx));
    let writer = tokio::spawn(write_socket(sink, outbound_rx));

    let outcome = SessionOrchestrator::new(state.scene.clone(), engine)
        .with_metrics(state.metrics.clone())
        .with_stop(state.stop.clone())
        .run(io)
        .await;
    reader.abort();
    if let Err(err) = writer.await {
        debug!(error = %err, "socket writer ended abnormally");
    }

    match outcome {
        Ok(Finished { engine, reason }) => {
            state.lease.release(engine);
            info!(reason = ?reason, "operator connection closed");
        }
        Err(OrchestratorError::Physics(err)) => {
            error!(error = %err, "physics engine fault; engine withdrawn");
            state.faults.send_replace(Some(err.to_string()));
        }
        Err(err) => {
            error!(error = %err, "session orchestrator failed; engine withdrawn");
            state.faults.send_replace(Some(err.to_string()));
        }
    }
}

async fn read_socket(
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Result<String, TransportError>>,
) {
    while let Some(message) = stream.next().await {
        let forwarded = match message {
            Ok(Message::Text(text)) => inbound.send(Ok(text)).await,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => inbound.send(Ok(text)).await,
                Err(_) => {
                    warn!("dropping binary frame that is not UTF-8");
                    Ok(())
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(()),
            Ok(Message::Close(frame)) => {
                debug!(frame = ?frame, "operator closed the socket");
                break;
            }
            Err(err) => {
                let _ = inbound
                    .send(Err(TransportError::Failure(err.to_string())))
                    .await;
                break;
            }
        };
        if forwarded.is_err() {
            break;
        }
    }
}

async fn write_socket(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
) {
    while let Some(text) = outbound.recv().await {
        if let Err(err) = sink.send(Message::Text(text)).await {
            debug!(error = %err, "socket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}
